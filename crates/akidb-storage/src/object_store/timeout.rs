//! Per-call deadline for any ObjectStore.

use super::{ObjectMetadata, ObjectStore};
use akidb_core::{CoreError, CoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps an [`ObjectStore`] so that every call fails with
/// `CoreError::Timeout` instead of hanging past `timeout`.
pub struct TimeoutObjectStore {
    inner: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl TimeoutObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        key: &str,
        fut: impl Future<Output = CoreResult<T>> + Send,
    ) -> CoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation,
                    key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Object store call timed out"
                );
                Err(CoreError::timeout(
                    format!("object store {operation} {key}"),
                    self.timeout,
                ))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for TimeoutObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        self.bounded("put", key, self.inner.put(key, data)).await
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        self.bounded("exists", key, self.inner.exists(key)).await
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        self.bounded("list", prefix, self.inner.list(prefix)).await
    }

    async fn head(&self, key: &str) -> CoreResult<ObjectMetadata> {
        self.bounded("head", key, self.inner.head(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MockS3Config, MockS3ObjectStore};

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let slow = MockS3ObjectStore::new_with_config(MockS3Config {
            latency: Duration::from_millis(200),
            track_history: true,
        });
        let store = TimeoutObjectStore::new(Arc::new(slow), Duration::from_millis(20));

        let err = store.put("k", Bytes::from("v")).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let inner = Arc::new(MockS3ObjectStore::new());
        let store = TimeoutObjectStore::new(inner.clone(), Duration::from_secs(1));

        store.put("k", Bytes::from("v")).await.unwrap();
        assert!(inner.contains_key("k"));
        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }
}
