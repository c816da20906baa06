//! Local filesystem implementation of ObjectStore
//!
//! Objects are files under a base directory with the key as the relative
//! path. Writes go to a temporary sibling and are renamed into place so a
//! crash never leaves a half-written object behind.

use super::{ObjectMetadata, ObjectStore};
use akidb_core::{CoreError, CoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const TMP_SUFFIX: &str = ".partial";

/// Local filesystem object store
///
/// # Example
///
/// ```rust,no_run
/// use akidb_storage::object_store::{LocalObjectStore, ObjectStore};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> akidb_core::CoreResult<()> {
///     let store = LocalObjectStore::new("./cold").await?;
///     store.put("collection/documents/doc", Bytes::from("{}")).await?;
///     let objects = store.list("collection/").await?;
///     println!("Found {} objects", objects.len());
///     Ok(())
/// }
/// ```
pub struct LocalObjectStore {
    base_dir: PathBuf,
}

fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|t: SystemTime| t.duration_since(UNIX_EPOCH).ok())
        .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, d.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> CoreError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CoreError::not_found("object", key)
        } else {
            CoreError::from(e)
        }
    }
}

impl LocalObjectStore {
    /// Create a new local object store, creating the base directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IoError` if directory creation fails
    pub async fn new(base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Filesystem path of `key`, which must be a relative path without `..`.
    pub fn path_for(&self, key: &str) -> CoreResult<PathBuf> {
        if key.is_empty() {
            return Err(CoreError::ValidationError(
                "Key cannot be empty".to_string(),
            ));
        }
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CoreError::ValidationError(format!(
                "Key must be a plain relative path: {key}"
            )));
        }
        Ok(self.base_dir.join(relative))
    }

    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_dir).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    /// Recursively list all files under a directory
    fn list_recursive<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<Vec<PathBuf>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut results = Vec::new();

            let mut read_dir = match tokio::fs::read_dir(dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;

                if file_type.is_file() {
                    if !path.to_string_lossy().ends_with(TMP_SUFFIX) {
                        results.push(path);
                    }
                } else if file_type.is_dir() {
                    results.append(&mut self.list_recursive(&path).await?);
                }
            }

            Ok(results)
        })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path).await.map_err(map_not_found(key))?;
        Ok(Bytes::from(data))
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // Idempotent
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        // Walk the deepest directory named by the prefix, then filter by the
        // full string prefix (which may end mid file name).
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let root = if dir_part.is_empty() {
            self.base_dir.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut results = Vec::new();
        for path in self.list_recursive(&root).await? {
            let Some(key) = self.path_to_key(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            // Files may vanish between listing and stat.
            if let Ok(metadata) = tokio::fs::metadata(&path).await {
                results.push(ObjectMetadata {
                    key,
                    size_bytes: metadata.len(),
                    last_modified: modified_at(&metadata),
                    etag: None,
                });
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn head(&self, key: &str) -> CoreResult<ObjectMetadata> {
        let path = self.path_for(key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(map_not_found(key))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size_bytes: metadata.len(),
            last_modified: modified_at(&metadata),
            etag: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_store_put_get_nested() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).await.unwrap();

        let data = Bytes::from("nested data");
        store.put("path/to/file.bin", data.clone()).await.unwrap();

        assert_eq!(store.get("path/to/file.bin").await.unwrap(), data);
        assert!(store.exists("path/to/file.bin").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_store_overwrite_leaves_no_partial_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).await.unwrap();

        store.put("a/obj", Bytes::from("one")).await.unwrap();
        store.put("a/obj", Bytes::from("two")).await.unwrap();

        assert_eq!(store.get("a/obj").await.unwrap(), Bytes::from("two"));
        let listed = store.list("a/").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_local_store_delete_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).await.unwrap();

        store.put("delete.txt", Bytes::from("data")).await.unwrap();
        store.delete("delete.txt").await.unwrap();
        assert!(!store.exists("delete.txt").await.unwrap());
        store.delete("delete.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_list_by_string_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).await.unwrap();

        store.put("c1/snapshots/s1.json", Bytes::from("1")).await.unwrap();
        store.put("c1/snapshots/s1.meta.json", Bytes::from("2")).await.unwrap();
        store.put("c1/documents/d1", Bytes::from("3")).await.unwrap();
        store.put("c2/documents/d1", Bytes::from("4")).await.unwrap();

        assert_eq!(store.list("").await.unwrap().len(), 4);
        assert_eq!(store.list("c1/").await.unwrap().len(), 3);

        let snapshots: Vec<String> = store
            .list("c1/snapshots/s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(
            snapshots,
            vec!["c1/snapshots/s1.json", "c1/snapshots/s1.meta.json"]
        );
        assert!(store.list("c3/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_store_head_and_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).await.unwrap();

        let data = Bytes::from("test data");
        store.put("head.txt", data.clone()).await.unwrap();

        let metadata = store.head("head.txt").await.unwrap();
        assert_eq!(metadata.size_bytes, data.len() as u64);

        assert!(store.get("missing").await.unwrap_err().is_not_found());
        assert!(store.head("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_local_store_rejects_bad_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(temp_dir.path()).await.unwrap();

        for key in ["", "../escape", "/abs/path"] {
            let result = store.put(key, Bytes::from("data")).await;
            assert!(matches!(result, Err(CoreError::ValidationError(_))), "{key}");
        }
    }
}
