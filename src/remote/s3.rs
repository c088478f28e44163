// remotebackup/src/remote/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use serde::Deserialize;
use std::fmt;
use std::path::Path;

use super::{RemoteEntry, RemoteTransport, collision_name, join_remote};
use crate::errors::{BackupError, Result};

/// S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO, ...).
#[derive(Clone, Deserialize)]
pub struct S3Target {
    pub endpoint_url: String,
    pub region: String,
    pub bucket_name: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub folder_prefix: Option<String>,
}

impl fmt::Debug for S3Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Target")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("folder_prefix", &self.folder_prefix)
            .finish()
    }
}

fn sdk_error(e: impl std::error::Error) -> BackupError {
    BackupError::S3Sdk(DisplayErrorContext(e).to_string())
}

impl S3Target {
    pub async fn connect(&self) -> Result<S3Session> {
        for (field, value) in [
            ("endpoint_url", &self.endpoint_url),
            ("region", &self.region),
            ("bucket_name", &self.bucket_name),
            ("access_key_id", &self.access_key_id),
            ("secret_access_key", &self.secret_access_key),
        ] {
            if value.trim().is_empty() {
                return Err(BackupError::Config(format!("S3 target is missing {}", field)));
            }
        }

        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&self.endpoint_url)
            .region(Region::new(self.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &self.access_key_id,
                &self.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        Ok(S3Session {
            client: s3::Client::new(&sdk_config),
            bucket: self.bucket_name.clone(),
        })
    }
}

/// Client bound to one bucket.
///
/// S3 would silently overwrite an existing key, so uploads check with
/// HEAD and pick `name (n).ext` on collision.
pub struct S3Session {
    client: s3::Client,
    bucket: String,
}

/// Listing prefix for a folder: `backups` -> `backups/`, root stays empty.
fn list_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn to_chrono(ts: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

impl S3Session {
    async fn key_exists(&self, key: &str) -> Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
            Err(e) => Err(sdk_error(e)),
        }
    }
}

#[async_trait]
impl RemoteTransport for S3Session {
    async fn list_entries(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = list_prefix(prefix);
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(sdk_error)?;

            for object in page.contents() {
                let (Some(key), Some(modified)) =
                    (object.key(), object.last_modified().and_then(to_chrono))
                else {
                    continue;
                };
                entries.push(RemoteEntry {
                    id: key.to_string(),
                    modified,
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn delete_entry(&mut self, id: &str) -> Result<bool> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(true)
    }

    async fn upload_file(&mut self, local: &Path, prefix: &str) -> Result<String> {
        let name = local
            .file_name()
            .ok_or_else(|| BackupError::Config(format!("Not a file: {}", local.display())))?
            .to_string_lossy()
            .into_owned();
        let folder = list_prefix(prefix);

        let mut attempt = 0;
        let key = loop {
            let candidate = join_remote(&folder, &collision_name(&name, attempt));
            if !self.key_exists(&candidate).await? {
                break candidate;
            }
            attempt += 1;
        };

        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| BackupError::S3Sdk(format!("Failed to read {}: {}", local.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}
