//! AWS S3 implementation of ObjectStore
//!
//! Works against AWS S3 and S3-compatible endpoints (MinIO, Wasabi). Failed
//! calls carry the HTTP status so the upload retry classifier can tell
//! throttling and 5xx responses from permission or request errors.

use super::{ObjectMetadata, ObjectStore};
use akidb_core::{CoreError, CoreResult};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::{config::Credentials, primitives::ByteStream, Client, Config};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// S3 connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint URL, e.g. "http://localhost:9000" for MinIO
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    /// Key prefix prepended to every object key
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl S3Config {
    /// Config for standard AWS S3 using the default credential chain
    pub fn aws(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            prefix: None,
        }
    }

    /// Config for MinIO or another S3-compatible endpoint with static credentials
    pub fn custom(
        bucket: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: Some(endpoint.into()),
            access_key: Some(access_key.into()),
            secret_key: Some(secret_key.into()),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// AWS S3 object store
///
/// ```rust,no_run
/// use akidb_storage::object_store::{S3Config, S3ObjectStore, ObjectStore};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> akidb_core::CoreResult<()> {
///     let config = S3Config::custom(
///         "akidb-cold",
///         "us-east-1",
///         "http://localhost:9000",
///         "minioadmin",
///         "minioadmin",
///     );
///     let store = S3ObjectStore::new(config).await?;
///     store.put("collection/documents/doc", Bytes::from("{}")).await?;
///     Ok(())
/// }
/// ```
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

/// Maps an SDK error to `CoreError`, keeping the HTTP status as a typed field.
fn map_sdk_error<E>(operation: &str, key: &str, err: SdkError<E, HttpResponse>) -> CoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    if status == Some(404) {
        return CoreError::not_found("object", key);
    }

    let detail = DisplayErrorContext(&err);
    let message = match (&err, status) {
        (SdkError::TimeoutError(_), _) => format!("S3 timeout: {detail}"),
        (SdkError::DispatchFailure(_), _) => format!("S3 connection reset: {detail}"),
        (_, Some(code)) => format!("S3 status {code}: {detail}"),
        (_, None) => format!("S3: {detail}"),
    };
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            CoreError::object_store(operation, None, message)
        }
        _ => CoreError::object_store(operation, status, message),
    }
}

impl S3ObjectStore {
    /// Creates the client. Static credentials plus an endpoint select the
    /// path-style MinIO configuration; otherwise the default AWS chain is used.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for credential loading errors.
    pub async fn new(config: S3Config) -> CoreResult<Self> {
        let client = if let (Some(endpoint), Some(access), Some(secret)) =
            (&config.endpoint, &config.access_key, &config.secret_key)
        {
            let creds = Credentials::new(access, secret, None, None, "akidb-static");

            let s3_config = Config::builder()
                .endpoint_url(endpoint)
                .credentials_provider(creds)
                .region(aws_sdk_s3::config::Region::new(config.region.clone()))
                .force_path_style(true)
                .behavior_version(BehaviorVersion::latest())
                .build();

            Client::from_conf(s3_config)
        } else {
            let mut loader = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(config.region.clone()));
            if let Some(endpoint) = &config.endpoint {
                loader = loader.endpoint_url(endpoint);
            }
            Client::new(&loader.load().await)
        };

        tracing::info!(bucket = %config.bucket, region = %config.region, "S3 object store ready");

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    fn strip_prefix(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => {
                let with_slash = format!("{}/", prefix.trim_end_matches('/'));
                key.strip_prefix(&with_slash).unwrap_or(key).to_string()
            }
            None => key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, data: Bytes) -> CoreResult<()> {
        if key.is_empty() {
            return Err(CoreError::ValidationError(
                "Key cannot be empty".to_string(),
            ));
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error("put", key, e))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error("get", key, e))?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| CoreError::object_store("get", None, format!("S3 body read: {e}")))?
            .into_bytes();

        Ok(data)
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(CoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match map_sdk_error("delete", key, e) {
                // Idempotent
                CoreError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMetadata>> {
        let full_prefix = self.full_key(prefix);
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_sdk_error("list", prefix, e))?;

            objects.extend(resp.contents().iter().filter_map(|obj| {
                let key = obj.key()?;
                let last_modified = obj
                    .last_modified()
                    .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
                    .unwrap_or_else(Utc::now);

                Some(ObjectMetadata {
                    key: self.strip_prefix(key),
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified,
                    etag: obj.e_tag().map(str::to_string),
                })
            }));

            // Only truncated responses carry a continuation token.
            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    async fn head(&self, key: &str) -> CoreResult<ObjectMetadata> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| map_sdk_error("head", key, e))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size_bytes: resp.content_length().unwrap_or(0).max(0) as u64,
            last_modified: resp
                .last_modified()
                .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
                .unwrap_or_else(Utc::now),
            etag: resp.e_tag().map(str::to_string),
        })
    }
}
