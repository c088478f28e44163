// remotebackup/src/remote/mod.rs
pub(crate) mod ftp;
pub(crate) mod local_dir;
pub(crate) mod object_store;
pub(crate) mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::Path;

use crate::errors::{BackupError, Result};
use crate::utils::report::Reporter;

pub use ftp::FtpTarget;
pub use local_dir::DirTarget;
pub use object_store::ObjectStoreTarget;
pub use s3::S3Target;

/// One remote file as seen by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub modified: DateTime<Utc>,
}

/// An open session against one remote target.
///
/// Sessions are created by [`RemoteTargetConfig::connect`] for a single
/// transfer and closed at its end.
#[async_trait]
pub trait RemoteTransport: Send {
    async fn list_entries(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>>;

    async fn delete_entry(&mut self, id: &str) -> Result<bool>;

    /// Uploads `local` below `prefix`, keeping its file name. Returns the
    /// remote identifier it was stored under.
    async fn upload_file(&mut self, local: &Path, prefix: &str) -> Result<String>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A configured destination for the archive.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteTargetConfig {
    Ftp(FtpTarget),
    ObjectStore(ObjectStoreTarget),
    S3(S3Target),
    Dir(DirTarget),
}

impl RemoteTargetConfig {
    /// Human readable name without credentials.
    pub fn label(&self) -> String {
        match self {
            RemoteTargetConfig::Ftp(t) => format!("ftp://{}@{}:{}{}", t.user, t.host, t.port, t.path),
            RemoteTargetConfig::ObjectStore(t) => format!("object-store:{}", t.path),
            RemoteTargetConfig::S3(t) => format!(
                "s3://{}/{}",
                t.bucket_name,
                t.folder_prefix.as_deref().unwrap_or("")
            ),
            RemoteTargetConfig::Dir(t) => format!("dir:{}", t.path.display()),
        }
    }

    /// Prefix handed to list and upload, relative to the session root.
    pub fn remote_prefix(&self) -> &str {
        match self {
            // the FTP session has already changed into its path
            RemoteTargetConfig::Ftp(_) => "",
            RemoteTargetConfig::ObjectStore(t) => &t.path,
            RemoteTargetConfig::S3(t) => t.folder_prefix.as_deref().unwrap_or(""),
            RemoteTargetConfig::Dir(_) => "",
        }
    }

    pub async fn connect(&self) -> Result<Box<dyn RemoteTransport>> {
        Ok(match self {
            RemoteTargetConfig::Ftp(t) => Box::new(t.connect().await?),
            RemoteTargetConfig::ObjectStore(t) => Box::new(t.connect()?),
            RemoteTargetConfig::S3(t) => Box::new(t.connect().await?),
            RemoteTargetConfig::Dir(t) => Box::new(t.connect()?),
        })
    }
}

/// Per-target result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub label: String,
    pub purged: usize,
    pub uploaded: Option<String>,
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn success(&self) -> bool {
        self.uploaded.is_some() && self.error.is_none()
    }
}

/// `now - retention_days`, or `None` when that lies before the earliest
/// representable time, in which case nothing can be stale.
pub fn retention_threshold(now: DateTime<Utc>, retention_days: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(Duration::days(i64::from(retention_days)))
}

/// Deletes every entry whose modification time is at or before
/// `now - retention_days`. Zero days disables purging.
///
/// A failed listing is an error; a failed delete is reported and skipped.
/// Returns the number of entries actually deleted.
pub async fn purge_stale(
    transport: &mut dyn RemoteTransport,
    prefix: &str,
    retention_days: u32,
    now: DateTime<Utc>,
    reporter: &mut Reporter,
) -> Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }

    let Some(threshold) = retention_threshold(now, retention_days) else {
        return Ok(0);
    };
    let entries = transport.list_entries(prefix).await?;
    let mut deleted = 0;

    for entry in entries.iter().filter(|e| e.modified <= threshold) {
        match transport.delete_entry(&entry.id).await {
            Ok(true) => {
                reporter.info(format!("Removed stale {} ({})", entry.id, entry.modified.format("%Y-%m-%d %H:%M")));
                deleted += 1;
            }
            Ok(false) => reporter.warn(format!("Could not remove stale {}", entry.id)),
            Err(e) => reporter.warn(format!("Could not remove stale {}: {}", entry.id, e)),
        }
    }
    Ok(deleted)
}

/// Purge (best effort) then upload over an already open session.
pub async fn transfer_with(
    transport: &mut dyn RemoteTransport,
    label: &str,
    prefix: &str,
    archive: &Path,
    retention_days: u32,
    now: DateTime<Utc>,
    reporter: &mut Reporter,
) -> TargetOutcome {
    let mut outcome = TargetOutcome {
        label: label.to_string(),
        purged: 0,
        uploaded: None,
        error: None,
    };

    match purge_stale(transport, prefix, retention_days, now, reporter).await {
        Ok(n) => outcome.purged = n,
        Err(e) => {
            let err = BackupError::Purge {
                target: label.to_string(),
                reason: e.to_string(),
            };
            reporter.warn(err.to_string());
        }
    }

    match transport.upload_file(archive, prefix).await {
        Ok(id) => {
            reporter.success(format!("Uploaded to {}", id));
            outcome.uploaded = Some(id);
        }
        Err(e) => {
            let err = BackupError::Transfer {
                target: label.to_string(),
                reason: e.to_string(),
            };
            reporter.error(err.to_string());
            outcome.error = Some(err.to_string());
        }
    }
    outcome
}

/// Opens a session for `target`, purges, uploads, and closes the session.
/// Never fails: problems end up in the returned outcome.
pub async fn transfer(
    target: &RemoteTargetConfig,
    archive: &Path,
    retention_days: u32,
    reporter: &mut Reporter,
) -> TargetOutcome {
    let label = target.label();
    reporter.info(format!("Target {}", label));
    reporter.nest();

    let outcome = match target.connect().await {
        Ok(mut session) => {
            let outcome = transfer_with(
                session.as_mut(),
                &label,
                target.remote_prefix(),
                archive,
                retention_days,
                Utc::now(),
                reporter,
            )
            .await;
            if let Err(e) = session.close().await {
                reporter.warn(format!("Closing session failed: {}", e));
            }
            outcome
        }
        Err(e) => {
            let err = BackupError::Transfer {
                target: label.clone(),
                reason: e.to_string(),
            };
            reporter.error(err.to_string());
            TargetOutcome {
                label,
                purged: 0,
                uploaded: None,
                error: Some(err.to_string()),
            }
        }
    };

    reporter.unnest();
    outcome
}

/// Name used for the `n`th collision of `file_name`: `a.7z` -> `a (1).7z`.
pub fn collision_name(file_name: &str, n: usize) -> String {
    if n == 0 {
        return file_name.to_string();
    }
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", file_name, n),
    }
}

/// Joins a remote prefix and a name with exactly one `/` between them.
pub fn join_remote(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    /// In-memory transport with scripted failures.
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub entries: Vec<RemoteEntry>,
        pub deleted: Vec<String>,
        pub uploaded: Vec<String>,
        pub fail_listing: bool,
        pub fail_upload: bool,
        pub undeletable: HashSet<String>,
    }

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        async fn list_entries(&mut self, _prefix: &str) -> Result<Vec<RemoteEntry>> {
            if self.fail_listing {
                return Err(BackupError::Config("listing refused".into()));
            }
            Ok(self.entries.clone())
        }

        async fn delete_entry(&mut self, id: &str) -> Result<bool> {
            if self.undeletable.contains(id) {
                return Ok(false);
            }
            self.deleted.push(id.to_string());
            Ok(true)
        }

        async fn upload_file(&mut self, local: &Path, prefix: &str) -> Result<String> {
            if self.fail_upload {
                return Err(BackupError::Config("upload refused".into()));
            }
            let name = local.file_name().unwrap().to_string_lossy().into_owned();
            let id = join_remote(prefix, &name);
            self.uploaded.push(id.clone());
            Ok(id)
        }
    }

    fn entry(id: &str, modified: DateTime<Utc>) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            modified,
        }
    }

    #[tokio::test]
    async fn test_purge_boundary_is_inclusive() -> anyhow::Result<()> {
        let now = Utc::now();
        let mut transport = FakeTransport {
            entries: vec![
                entry("exactly-7d", now - Duration::days(7)),
                entry("older", now - Duration::days(30)),
                entry("just-newer", now - Duration::days(7) + Duration::seconds(1)),
                entry("fresh", now - Duration::days(1)),
            ],
            ..Default::default()
        };

        let deleted = purge_stale(&mut transport, "", 7, now, &mut Reporter::new()).await?;

        assert_eq!(deleted, 2);
        assert_eq!(transport.deleted, vec!["exactly-7d", "older"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_retention_never_deletes() -> anyhow::Result<()> {
        let now = Utc::now();
        let mut transport = FakeTransport {
            entries: vec![entry("ancient", now - Duration::days(3650))],
            fail_listing: true,
            ..Default::default()
        };
        let deleted = purge_stale(&mut transport, "", 0, now, &mut Reporter::new()).await?;
        assert_eq!(deleted, 0);
        assert!(transport.deleted.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_huge_retention_keeps_everything() -> anyhow::Result<()> {
        let now = Utc::now();
        let mut transport = FakeTransport {
            entries: vec![entry("ancient", now - Duration::days(3650))],
            ..Default::default()
        };
        assert_eq!(retention_threshold(now, u32::MAX), None);
        let deleted = purge_stale(&mut transport, "", u32::MAX, now, &mut Reporter::new()).await?;
        assert_eq!(deleted, 0);
        assert!(transport.deleted.is_empty());

        let deleted = purge_stale(&mut transport, "", 100_000_000, now, &mut Reporter::new()).await?;
        assert_eq!(deleted, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_delete_is_not_counted() -> anyhow::Result<()> {
        let now = Utc::now();
        let mut transport = FakeTransport {
            entries: vec![
                entry("locked", now - Duration::days(9)),
                entry("old", now - Duration::days(9)),
            ],
            undeletable: ["locked".to_string()].into(),
            ..Default::default()
        };
        let deleted = purge_stale(&mut transport, "", 7, now, &mut Reporter::new()).await?;
        assert_eq!(deleted, 1);
        assert_eq!(transport.deleted, vec!["old"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_failure_still_uploads() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let archive = tmp.path().join("Backup_debug.7z");
        std::fs::write(&archive, "data")?;
        let mut transport = FakeTransport {
            fail_listing: true,
            ..Default::default()
        };

        let outcome = transfer_with(
            &mut transport,
            "fake",
            "/backups/",
            &archive,
            7,
            Utc::now(),
            &mut Reporter::new(),
        )
        .await;

        assert!(outcome.success());
        assert_eq!(outcome.uploaded.as_deref(), Some("/backups/Backup_debug.7z"));
        assert_eq!(outcome.purged, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let archive = tmp.path().join("a.7z");
        std::fs::write(&archive, "data")?;
        let mut transport = FakeTransport {
            fail_upload: true,
            ..Default::default()
        };
        let outcome = transfer_with(&mut transport, "fake", "", &archive, 0, Utc::now(), &mut Reporter::new()).await;
        assert!(!outcome.success());
        assert!(outcome.error.unwrap().contains("upload refused"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_target_yields_outcome() {
        let target = RemoteTargetConfig::Ftp(FtpTarget {
            user: "u".into(),
            pass: "p".into(),
            host: "127.0.0.1".into(),
            port: 1,
            path: "/".into(),
        });
        let outcome = transfer(&target, Path::new("/nonexistent.7z"), 7, &mut Reporter::new()).await;
        assert!(!outcome.success());
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_collision_name() {
        assert_eq!(collision_name("Backup.7z", 0), "Backup.7z");
        assert_eq!(collision_name("Backup.7z", 2), "Backup (2).7z");
        assert_eq!(collision_name("README", 1), "README (1)");
        assert_eq!(collision_name(".hidden", 1), ".hidden (1)");
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("", "a.7z"), "a.7z");
        assert_eq!(join_remote("/Backups/", "a.7z"), "/Backups/a.7z");
        assert_eq!(join_remote("backups", "a.7z"), "backups/a.7z");
    }

    #[test]
    fn test_target_config_deserializes_by_type() -> anyhow::Result<()> {
        let targets: Vec<RemoteTargetConfig> = serde_json::from_value(serde_json::json!([
            { "type": "ftp", "host": "ftp.example.org", "user": "bob", "pass": "pw" },
            { "type": "object_store", "token": "t0k", "path": "/Backups" },
            { "type": "dir", "path": "/mnt/nas" }
        ]))?;
        assert_eq!(targets.len(), 3);
        match &targets[0] {
            RemoteTargetConfig::Ftp(t) => {
                assert_eq!(t.port, 21);
                assert_eq!(t.path, "/");
            }
            other => panic!("unexpected target {:?}", other),
        }
        assert_eq!(targets[1].remote_prefix(), "/Backups");
        assert_eq!(targets[2].label(), "dir:/mnt/nas");
        Ok(())
    }
}
