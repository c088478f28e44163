// remotebackup/src/remote/object_store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;
use url::Url;

use super::{RemoteEntry, RemoteTransport, join_remote};
use crate::errors::{BackupError, Result};

fn default_api_url() -> String {
    "https://api.dropboxapi.com/".to_string()
}

fn default_content_url() -> String {
    "https://content.dropboxapi.com/".to_string()
}

/// REST object store addressed with a bearer token (Dropbox API v2 layout).
#[derive(Clone, Deserialize)]
pub struct ObjectStoreTarget {
    pub token: String,
    pub path: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_content_url")]
    pub content_url: String,
}

impl fmt::Debug for ObjectStoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreTarget")
            .field("token", &"***")
            .field("path", &self.path)
            .field("api_url", &self.api_url)
            .field("content_url", &self.content_url)
            .finish()
    }
}

fn base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

impl ObjectStoreTarget {
    pub fn connect(&self) -> Result<ObjectStoreSession> {
        if self.token.trim().is_empty() {
            return Err(BackupError::Config("Object store token is empty".into()));
        }
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|_| BackupError::Config("Object store token contains invalid characters".into()))?;
        Ok(ObjectStoreSession {
            client: reqwest::Client::new(),
            bearer,
            api: base_url(&self.api_url)?,
            content: base_url(&self.content_url)?,
        })
    }
}

/// HTTP session against the object store.
///
/// Uploads use `mode: add` with `autorename`, so the server picks a fresh name
/// on collision instead of overwriting.
pub struct ObjectStoreSession {
    client: reqwest::Client,
    bearer: HeaderValue,
    api: Url,
    content: Url,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<ListedEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ListedEntry {
    #[serde(rename = ".tag")]
    tag: String,
    path_display: Option<String>,
    server_modified: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    path_display: Option<String>,
}

/// The store lists its root as `""`, not `"/"`.
fn folder_path(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Only files carry a modification time; folders are never purged.
fn file_entries(listed: Vec<ListedEntry>) -> Vec<RemoteEntry> {
    listed
        .into_iter()
        .filter(|e| e.tag == "file")
        .filter_map(|e| {
            let modified = DateTime::parse_from_rfc3339(e.server_modified.as_deref()?).ok()?;
            Some(RemoteEntry {
                id: e.path_display?,
                modified: modified.with_timezone(&Utc),
            })
        })
        .collect()
}

/// JSON for the `Dropbox-API-Arg` header; HTTP headers must be ASCII.
fn header_safe_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    for c in value.to_string().chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

/// Largest body sent in one request. The single-shot endpoint is capped at
/// 150 MB and session chunks must be multiples of 4 MiB.
const UPLOAD_CHUNK: usize = 32 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

fn commit_arg(remote: &str) -> serde_json::Value {
    json!({
        "path": remote,
        "mode": "add",
        "autorename": true,
        "mute": false,
    })
}

fn cursor(session_id: &str, offset: u64) -> serde_json::Value {
    json!({ "session_id": session_id, "offset": offset })
}

fn finish_arg(session_id: &str, offset: u64, remote: &str) -> serde_json::Value {
    json!({ "cursor": cursor(session_id, offset), "commit": commit_arg(remote) })
}

/// Reads up to `limit` bytes; shorter only at end of file.
async fn read_chunk(file: &mut tokio::fs::File, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut *file).take(limit as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

impl ObjectStoreSession {
    async fn rpc(&self, endpoint: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.api.join(endpoint)?)
            .header(AUTHORIZATION, self.bearer.clone())
            .json(&body)
            .send()
            .await?;
        Ok(response)
    }

    async fn content_call(
        &self,
        endpoint: &str,
        arg: &serde_json::Value,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.content.join(endpoint)?)
            .header(AUTHORIZATION, self.bearer.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", header_safe_json(arg))
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response)
    }
}

#[async_trait]
impl RemoteTransport for ObjectStoreSession {
    async fn list_entries(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let mut page: ListFolderResponse = self
            .rpc(
                "2/files/list_folder",
                json!({
                    "path": folder_path(prefix),
                    "recursive": false,
                    "include_deleted": false,
                    "include_mounted_folders": true,
                }),
            )
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut entries = file_entries(std::mem::take(&mut page.entries));
        while page.has_more {
            page = self
                .rpc("2/files/list_folder/continue", json!({ "cursor": page.cursor }))
                .await?
                .error_for_status()?
                .json()
                .await?;
            entries.extend(file_entries(std::mem::take(&mut page.entries)));
        }
        Ok(entries)
    }

    async fn delete_entry(&mut self, id: &str) -> Result<bool> {
        let response = self.rpc("2/files/delete_v2", json!({ "path": id })).await?;
        Ok(response.status().is_success())
    }

    /// Archives smaller than one chunk go up in a single request; larger
    /// ones through an upload session, one chunk in memory at a time.
    async fn upload_file(&mut self, local: &Path, prefix: &str) -> Result<String> {
        let name = local
            .file_name()
            .ok_or_else(|| BackupError::Config(format!("Not a file: {}", local.display())))?
            .to_string_lossy()
            .into_owned();
        let remote = join_remote(&folder_path(prefix), &name);

        let mut file = tokio::fs::File::open(local).await?;
        let first = read_chunk(&mut file, UPLOAD_CHUNK).await?;

        let response = if first.len() < UPLOAD_CHUNK {
            self.content_call("2/files/upload", &commit_arg(&remote), first)
                .await?
        } else {
            let mut offset = first.len() as u64;
            let session: SessionStart = self
                .content_call("2/files/upload_session/start", &json!({ "close": false }), first)
                .await?
                .json()
                .await?;
            loop {
                let chunk = read_chunk(&mut file, UPLOAD_CHUNK).await?;
                if chunk.is_empty() {
                    break;
                }
                let len = chunk.len() as u64;
                let arg = json!({ "cursor": cursor(&session.session_id, offset), "close": false });
                self.content_call("2/files/upload_session/append_v2", &arg, chunk)
                    .await?;
                offset += len;
            }
            self.content_call(
                "2/files/upload_session/finish",
                &finish_arg(&session.session_id, offset, &remote),
                Vec::new(),
            )
            .await?
        };

        let stored: UploadResponse = response.json().await?;
        Ok(stored.path_display.unwrap_or(remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_path() {
        assert_eq!(folder_path("/"), "");
        assert_eq!(folder_path(""), "");
        assert_eq!(folder_path("/Backups/"), "/Backups");
        assert_eq!(folder_path("Backups"), "/Backups");
    }

    #[test]
    fn test_listing_keeps_only_dated_files() -> anyhow::Result<()> {
        let page: ListFolderResponse = serde_json::from_value(json!({
            "entries": [
                { ".tag": "file", "path_display": "/Backups/Backup_240101_0300.7z",
                  "server_modified": "2024-01-01T03:00:12Z" },
                { ".tag": "folder", "path_display": "/Backups/old" },
                { ".tag": "file", "path_display": "/Backups/broken.7z", "server_modified": "yesterday" }
            ],
            "cursor": "c1",
            "has_more": false
        }))?;

        let entries = file_entries(page.entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "/Backups/Backup_240101_0300.7z");
        assert_eq!(entries[0].modified.to_rfc3339(), "2024-01-01T03:00:12+00:00");
        Ok(())
    }

    #[test]
    fn test_header_json_is_ascii() {
        let arg = json!({ "path": "/Sicherung/Grüße.7z" });
        let header = header_safe_json(&arg);
        assert!(header.is_ascii());
        assert!(header.contains("Gr\\u00fc\\u00dfe.7z"));
        let back: serde_json::Value = serde_json::from_str(&header).unwrap();
        assert_eq!(back, arg);
    }

    #[test]
    fn test_connect_requires_token_and_valid_urls() {
        let mut target = ObjectStoreTarget {
            token: String::new(),
            path: "/Backups".into(),
            api_url: default_api_url(),
            content_url: default_content_url(),
        };
        assert!(matches!(target.connect(), Err(BackupError::Config(_))));

        target.token = "abc".into();
        target.api_url = "not a url".into();
        assert!(target.connect().is_err());
    }

    #[tokio::test]
    async fn test_read_chunk_splits_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("Backup_debug.7z");
        std::fs::write(&path, b"0123456789")?;

        let mut file = tokio::fs::File::open(&path).await?;
        assert_eq!(read_chunk(&mut file, 4).await?, b"0123");
        assert_eq!(read_chunk(&mut file, 4).await?, b"4567");
        assert_eq!(read_chunk(&mut file, 4).await?, b"89");
        assert!(read_chunk(&mut file, 4).await?.is_empty());
        Ok(())
    }

    #[test]
    fn test_session_finish_commits_with_autorename() {
        let arg = finish_arg("sess-1", 96 * 1024 * 1024, "/Backups/Backup_debug.7z");
        assert_eq!(arg["cursor"]["session_id"], "sess-1");
        assert_eq!(arg["cursor"]["offset"], 100_663_296u64);
        assert_eq!(arg["commit"]["path"], "/Backups/Backup_debug.7z");
        assert_eq!(arg["commit"]["mode"], "add");
        assert_eq!(arg["commit"]["autorename"], true);
        assert_eq!(UPLOAD_CHUNK % (4 * 1024 * 1024), 0);
    }

    #[test]
    fn test_base_url_gets_trailing_slash() -> anyhow::Result<()> {
        let url = base_url("http://127.0.0.1:8080/dropbox")?;
        assert_eq!(url.join("2/files/upload")?.as_str(), "http://127.0.0.1:8080/dropbox/2/files/upload");
        Ok(())
    }
}
