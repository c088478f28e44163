// remotebackup/src/remote/ftp.rs
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::path::Path;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::debug;

use super::{RemoteEntry, RemoteTransport, join_remote};
use crate::errors::{BackupError, Result};

fn default_port() -> u16 {
    21
}

fn default_path() -> String {
    "/".to_string()
}

/// FTP server credentials and the directory backups live in.
#[derive(Clone, Deserialize)]
pub struct FtpTarget {
    pub user: String,
    pub pass: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
}

impl fmt::Debug for FtpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpTarget")
            .field("user", &self.user)
            .field("pass", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .finish()
    }
}

impl FtpTarget {
    /// Connects, logs in, switches to passive binary mode and changes into `path`.
    ///
    /// The control connection is blocking, so this runs on the blocking pool.
    pub async fn connect(&self) -> Result<FtpSession> {
        let target = self.clone();
        let stream = tokio::task::spawn_blocking(move || target.open()).await??;
        Ok(FtpSession {
            stream: Some(stream),
        })
    }

    fn open(&self) -> Result<FtpStream> {
        let mut stream = FtpStream::connect((self.host.as_str(), self.port)).map_err(|e| {
            BackupError::Transfer {
                target: format!("{}:{}", self.host, self.port),
                reason: format!("Could not connect: {}", e),
            }
        })?;
        stream.login(&self.user, &self.pass)?;
        stream.set_mode(Mode::Passive);
        stream.transfer_type(FileType::Binary)?;
        if !self.path.is_empty() {
            stream.cwd(&self.path)?;
        }
        Ok(stream)
    }
}

/// Logged-in FTP control connection.
///
/// Uploads use STOR and overwrite a remote file with the same name.
pub struct FtpSession {
    stream: Option<FtpStream>,
}

impl FtpSession {
    /// Lends the stream to `op` on the blocking pool and takes it back.
    async fn with_stream<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| BackupError::Config("FTP session already closed".into()))?;
        let (stream, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut stream);
            (stream, result)
        })
        .await?;
        self.stream = Some(stream);
        result
    }
}

/// Drops `.`/`..` and any directory part some servers prepend to NLST names.
fn entry_name(raw: &str) -> Option<&str> {
    let name = raw.trim_end_matches('/').rsplit('/').next()?;
    match name {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

fn list_with_mdtm(stream: &mut FtpStream, prefix: &str) -> Result<Vec<RemoteEntry>> {
    let listing = if prefix.is_empty() {
        stream.nlst(None)?
    } else {
        stream.nlst(Some(prefix))?
    };

    let mut entries = Vec::with_capacity(listing.len());
    for raw in &listing {
        let Some(name) = entry_name(raw) else { continue };
        let id = join_remote(prefix, name);
        // MDTM fails for directories; they are never purged.
        match stream.mdtm(&id) {
            Ok(modified) => entries.push(RemoteEntry {
                id,
                modified: modified.and_utc(),
            }),
            Err(e) => debug!(entry = %id, error = %e, "skipping entry without modification time"),
        }
    }
    Ok(entries)
}

#[async_trait]
impl RemoteTransport for FtpSession {
    async fn list_entries(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = prefix.to_string();
        self.with_stream(move |stream| list_with_mdtm(stream, &prefix)).await
    }

    async fn delete_entry(&mut self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_stream(move |stream| {
            stream.rm(&id)?;
            Ok(true)
        })
        .await
    }

    async fn upload_file(&mut self, local: &Path, prefix: &str) -> Result<String> {
        let name = local
            .file_name()
            .ok_or_else(|| BackupError::Config(format!("Not a file: {}", local.display())))?
            .to_string_lossy()
            .into_owned();
        let remote = join_remote(prefix, &name);
        let local = local.to_path_buf();
        self.with_stream(move |stream| {
            let mut file = File::open(&local)?;
            stream.put_file(&remote, &mut file)?;
            Ok(remote)
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tokio::task::spawn_blocking(move || stream.quit()).await??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_session_refuses_work() {
        let mut session = FtpSession { stream: None };
        assert!(matches!(
            session.list_entries("").await,
            Err(BackupError::Config(_))
        ));
        assert!(session.close().await.is_ok());
    }

    #[test]
    fn test_entry_name_normalises_listing() {
        assert_eq!(entry_name("Backup_240101_0300.7z"), Some("Backup_240101_0300.7z"));
        assert_eq!(entry_name("/backups/Backup_240101_0300.7z"), Some("Backup_240101_0300.7z"));
        assert_eq!(entry_name("."), None);
        assert_eq!(entry_name(".."), None);
        assert_eq!(entry_name("sub/"), Some("sub"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transfer_error() {
        let target = FtpTarget {
            user: "backup".into(),
            pass: "pw".into(),
            host: "127.0.0.1".into(),
            port: 1,
            path: default_path(),
        };
        assert!(matches!(target.connect().await, Err(BackupError::Transfer { .. })));
    }
}
