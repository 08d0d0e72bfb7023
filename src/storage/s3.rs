// hommss-backup/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, TimeZone, Utc};
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{ObjectInfo, RemoteStore};
use crate::config::S3Settings;
use crate::errors::{BackupError, Result};

/// S3 or any S3-compatible service (DigitalOcean Spaces, MinIO).
pub struct S3Store {
    client: s3::Client,
    bucket: String,
    endpoint: Option<String>,
    timeout: Duration,
}

impl S3Store {
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(Credentials::new(
                &settings.access_key_id,
                &settings.secret_access_key,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.path_style)
            .build();

        S3Store {
            client: s3::Client::from_conf(s3_config),
            bucket: settings.bucket.clone(),
            endpoint: settings.endpoint_url.clone(),
            timeout: settings.timeout,
        }
    }

    /// Bounds a single remote call by the configured timeout.
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackupError::Timeout {
                operation: format!("S3 {operation}"),
                seconds: self.timeout.as_secs(),
            }),
        }
    }
}

fn sdk_error<E>(action: &str, key: &str, err: E) -> BackupError
where
    E: std::error::Error,
{
    BackupError::Transport(format!("{action} {key} failed: {}", DisplayErrorContext(&err)))
}

/// Objects without a usable timestamp count as the oldest possible, so
/// retention still reaches them.
fn to_chrono(key: &str, value: Option<&aws_smithy_types::DateTime>) -> DateTime<Utc> {
    match value.and_then(|dt| Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single()) {
        Some(modified) => modified,
        None => {
            tracing::warn!("No modification time for {}; treating it as expired", key);
            DateTime::<Utc>::UNIX_EPOCH
        }
    }
}

#[async_trait]
impl RemoteStore for S3Store {
    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        tracing::info!("Uploading {} to s3://{}/{}", local.display(), self.bucket, key);
        self.bounded("upload", async {
            let body = ByteStream::from_path(local)
                .await
                .map_err(|e| sdk_error("read", &local.display().to_string(), e))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(|e| sdk_error("upload", key, e))?;
            Ok(())
        })
        .await?;
        tracing::info!("✅ Successfully uploaded {} to s3://{}/{}", local.display(), self.bucket, key);
        Ok(key.to_string())
    }

    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        let name = key.rsplit('/').next().filter(|n| !n.is_empty()).ok_or_else(|| {
            BackupError::InvalidInput(format!("invalid object key: {key}"))
        })?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(name);

        let total = self
            .bounded("download", async {
                let mut object = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| sdk_error("download", key, e))?;

                let mut output = tokio::fs::File::create(&dest).await?;
                let mut total = 0usize;
                while let Some(chunk) = object
                    .body
                    .try_next()
                    .await
                    .map_err(|e| sdk_error("download", key, e))?
                {
                    output.write_all(&chunk).await?;
                    total += chunk.len();
                }
                output.flush().await?;
                Ok(total)
            })
            .await?;

        tracing::info!("✅ Successfully downloaded {} bytes from s3://{}/{}", total, self.bucket, key);
        Ok(dest)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.bounded("list", async {
            let mut objects = Vec::new();
            let mut continuation: Option<String> = None;
            loop {
                let response = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(|e| sdk_error("list", prefix, e))?;

                for object in response.contents() {
                    let Some(key) = object.key() else { continue };
                    objects.push(ObjectInfo {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: to_chrono(key, object.last_modified()),
                    });
                }

                match response.next_continuation_token() {
                    Some(token) if response.is_truncated().unwrap_or(false) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }
            Ok(objects)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.bounded("delete", async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| sdk_error("delete", key, e))?;
            Ok(())
        })
        .await?;
        tracing::info!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.bounded("exists", async {
            match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
                Err(e) => Err(sdk_error("head", key, e)),
            }
        })
        .await
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.bounded("write", async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| sdk_error("write", key, e))?;
            Ok(())
        })
        .await
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        self.bounded("read", async {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| sdk_error("read", key, e))?;
            let data = object
                .body
                .collect()
                .await
                .map_err(|e| sdk_error("read", key, e))?;
            Ok(data.into_bytes().to_vec())
        })
        .await
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("s3://{} via {}", self.bucket, endpoint),
            None => format!("s3://{}", self.bucket),
        }
    }
}
