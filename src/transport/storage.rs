//! Program archive store on MinIO/S3
//!
//! Jobs that name an archive by storage key are fetched from here.

use std::path::Path;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::{debug, info};

const DEFAULT_BUCKET: &str = "autotester";

/// Connection settings of the archive bucket
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoreSettings {
    endpoint_url: String,
    access_key: String,
    secret_key: String,
    bucket: String,
}

impl StoreSettings {
    /// Reads the `MINIO_*` variables through `lookup`, with local defaults
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let scheme = match lookup("MINIO_USE_SSL").as_deref() {
            Some("true") | Some("1") => "https",
            _ => "http",
        };
        Self {
            endpoint_url: format!(
                "{}://{}:{}",
                scheme,
                var("MINIO_ENDPOINT", "localhost"),
                var("MINIO_PORT", "9000")
            ),
            access_key: var("MINIO_ACCESS_KEY", "minioadmin"),
            secret_key: var("MINIO_SECRET_KEY", "minioadmin"),
            bucket: var("MINIO_BUCKET", DEFAULT_BUCKET),
        }
    }

    fn s3_config(&self) -> aws_sdk_s3::Config {
        let credentials = Credentials::new(
            self.access_key.as_str(),
            self.secret_key.as_str(),
            None,
            None,
            "autotester-archives",
        );
        aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&self.endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build()
    }
}

#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    pub async fn from_env() -> Result<Self> {
        let settings = StoreSettings::from_lookup(|name| std::env::var(name).ok());
        info!(
            "Program archives from bucket {} at {}",
            settings.bucket, settings.endpoint_url
        );
        Ok(Self {
            client: Client::from_conf(settings.s3_config()),
            bucket: settings.bucket,
        })
    }

    /// Reads the whole archive stored under `key`
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Archive {} not available in {}", key, self.bucket))?;

        let body = object
            .body
            .collect()
            .await
            .with_context(|| format!("Archive {} was cut off", key))?;
        Ok(body.into_bytes().to_vec())
    }

    /// Downloads `key` into a local file
    pub async fn download_to(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = self.download(key).await?;
        debug!("Fetched archive {} ({} bytes)", key, bytes.len());
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}
