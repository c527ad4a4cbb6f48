//! Object storage over S3-compatible backends.

use crate::{SinkError, SinkResult};
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use tracing::info;

/// S3/MinIO configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Bucket holding event artefacts.
    pub bucket: String,

    /// Region; `us-east-1` works for MinIO.
    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for MinIO; empty for AWS S3.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_access_key")]
    pub access_key_id: String,

    #[serde(default = "default_secret_key")]
    pub secret_access_key: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key() -> String {
    std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default()
}

fn default_secret_key() -> String {
    std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "video-analytics".to_string(),
            region: default_region(),
            endpoint: None,
            access_key_id: default_access_key(),
            secret_access_key: default_secret_key(),
        }
    }
}

/// Store of event artefacts keyed by path-like strings.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store raw bytes under `key` with an explicit content type.
    async fn store_bytes(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> SinkResult<()>;

    /// Store a file from the local filesystem; content type derives from the
    /// key extension.
    async fn store_file(&self, key: &str, path: &Path) -> SinkResult<()> {
        let bytes = tokio::fs::read(path).await?;
        self.store_bytes(key, bytes, content_type_for_key(key)).await
    }

    /// Store a JSON document, serialised UTF-8 without BOM.
    async fn store_json(&self, key: &str, value: &serde_json::Value) -> SinkResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store_bytes(key, bytes, "application/json").await
    }

    /// Store an image, JPEG-encoded.
    async fn store_jpeg(&self, key: &str, image: &RgbImage) -> SinkResult<()> {
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .map_err(|e| SinkError::ObjectStorage(e.to_string()))?;
        self.store_bytes(key, bytes, "image/jpeg").await
    }
}

/// Content type for a storage key, by extension.
#[must_use]
pub fn content_type_for_key(key: &str) -> &'static str {
    match key.rsplit('.').next() {
        Some("mp4") => "video/mp4",
        Some("avi") => "video/x-msvideo",
        Some("json") => "application/json",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// S3-compatible object store.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Connect and make sure the bucket exists with a public-read policy.
    pub async fn new(config: S3Config) -> SinkResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "video-analytics",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .behavior_version_latest();

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());
        let store = Self {
            client,
            bucket: config.bucket,
        };
        store.ensure_bucket().await?;
        Ok(store)
    }

    /// Create the bucket and attach the read policy if it does not exist.
    async fn ensure_bucket(&self) -> SinkResult<()> {
        let exists = self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok();
        if exists {
            return Ok(());
        }

        info!(bucket = %self.bucket, "creating artefact bucket");
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| SinkError::ObjectStorage(e.to_string()))?;
        self.client
            .put_bucket_policy()
            .bucket(&self.bucket)
            .policy(public_read_policy(&self.bucket))
            .send()
            .await
            .map_err(|e| SinkError::ObjectStorage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn store_bytes(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> SinkResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| SinkError::ObjectStorage(e.to_string()))?;
        Ok(())
    }
}

/// Bucket policy allowing anonymous `s3:GetObject` on every key.
fn public_read_policy(bucket: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "",
            "Effect": "Allow",
            "Principal": { "AWS": ["*"] },
            "Action": ["s3:GetObject"],
            "Resource": [format!("arn:aws:s3:::{bucket}/*")]
        }]
    })
    .to_string()
}
