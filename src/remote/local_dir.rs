// remotebackup/src/remote/local_dir.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{RemoteEntry, RemoteTransport, collision_name};
use crate::errors::{BackupError, Result};
use crate::utils::is_writable_dir;

/// A directory on this host, typically a mounted NAS share.
#[derive(Debug, Clone, Deserialize)]
pub struct DirTarget {
    pub path: PathBuf,
}

impl DirTarget {
    /// Resolves the directory, creating it when missing, and checks it is writable.
    pub fn connect(&self) -> Result<DirSession> {
        let root = std::path::absolute(&self.path)?;
        if !root.exists() {
            fs::create_dir_all(&root)?;
        }
        if !is_writable_dir(&root) {
            return Err(BackupError::Config(format!(
                "Backup directory is not writable: {}",
                root.display()
            )));
        }
        Ok(DirSession { root })
    }
}

/// Plain filesystem "session". Uploads never overwrite: a name collision
/// gets `name (n).ext`.
pub struct DirSession {
    root: PathBuf,
}

impl DirSession {
    fn folder(&self, prefix: &str) -> PathBuf {
        self.root.join(prefix.trim_matches('/'))
    }
}

#[async_trait]
impl RemoteTransport for DirSession {
    async fn list_entries(&mut self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.folder(prefix))? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            entries.push(RemoteEntry {
                id: entry.path().display().to_string(),
                modified: DateTime::<Utc>::from(meta.modified()?),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn delete_entry(&mut self, id: &str) -> Result<bool> {
        let path = Path::new(id);
        // never reach outside the target directory
        let escapes = path.components().any(|c| c == Component::ParentDir);
        if escapes || !path.starts_with(&self.root) || !path.is_file() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    async fn upload_file(&mut self, local: &Path, prefix: &str) -> Result<String> {
        let name = local
            .file_name()
            .ok_or_else(|| BackupError::Config(format!("Not a file: {}", local.display())))?
            .to_string_lossy()
            .into_owned();
        let folder = self.folder(prefix);
        fs::create_dir_all(&folder)?;

        let mut attempt = 0;
        let destination = loop {
            let candidate = folder.join(collision_name(&name, attempt));
            if !candidate.exists() {
                break candidate;
            }
            attempt += 1;
        };

        tokio::fs::copy(local, &destination).await?;
        Ok(destination.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_renames_on_collision() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let archive = tmp.path().join("Backup_debug.7z");
        fs::write(&archive, "new")?;
        let target_dir = tmp.path().join("nas");
        fs::create_dir(&target_dir)?;
        fs::write(target_dir.join("Backup_debug.7z"), "old")?;

        let mut session = DirTarget { path: target_dir.clone() }.connect()?;
        let stored = session.upload_file(&archive, "").await?;

        assert_eq!(PathBuf::from(&stored), target_dir.join("Backup_debug (1).7z"));
        assert_eq!(fs::read_to_string(target_dir.join("Backup_debug.7z"))?, "old");
        assert_eq!(fs::read_to_string(&stored)?, "new");
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_reports_files_with_mtime() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        fs::create_dir(tmp.path().join("nested"))?;
        let old = tmp.path().join("old.7z");
        fs::write(&old, "x")?;
        let when = SystemTime::now() - Duration::from_secs(10 * 86_400);
        File::options().write(true).open(&old)?.set_modified(when)?;

        let mut session = DirTarget { path: tmp.path().into() }.connect()?;
        let entries = session.list_entries("").await?;

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, old.display().to_string());
        let drift = (entries[0].modified - DateTime::<Utc>::from(when)).num_seconds().abs();
        assert!(drift <= 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_stays_inside_root() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let outside = tmp.path().join("keep.txt");
        fs::write(&outside, "x")?;
        let root = tmp.path().join("nas");

        let mut session = DirTarget { path: root.clone() }.connect()?;
        assert!(root.is_dir());
        assert!(!session.delete_entry(&outside.display().to_string()).await?);
        let sneaky = root.join("..").join("keep.txt");
        assert!(!session.delete_entry(&sneaky.display().to_string()).await?);
        assert!(outside.exists());
        Ok(())
    }
}
