// remotebackup/src/backup/spec.rs
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use super::archive::ArchiveOptions;
use super::db_dump::DatabaseExporter;
use super::sources::SourceCollector;
use crate::remote::{DirTarget, FtpTarget, ObjectStoreTarget, RemoteTargetConfig, S3Target};

pub const DEFAULT_STAGING_ROOT: &str = "/tmp/";
pub const DEFAULT_RETENTION_DAYS: u32 = 14;

/// Everything one backup run needs, assembled with chained calls:
///
/// ```ignore
/// let spec = BackupSpec::new()
///     .password("secret")
///     .retention_days(7)
///     .database(DatabaseExporter::new(conn)?.with_databases(["shop", "crm"]))
///     .dir("/srv/www", "web/")
///     .file("/etc/nginx/nginx.conf", "etc/")
///     .to_dir("/mnt/nas/backups");
/// ```
#[derive(Clone)]
pub struct BackupSpec {
    pub staging_root: PathBuf,
    pub password: String,
    /// 0 disables remote purging.
    pub retention_days: u32,
    pub direct_compression: bool,
    /// Fixes the run name so paths are predictable.
    pub debug: bool,
    pub archive_options: ArchiveOptions,
    pub(crate) database_jobs: Vec<DatabaseExporter>,
    pub(crate) sources: SourceCollector,
    pub(crate) remote_targets: Vec<RemoteTargetConfig>,
}

impl fmt::Debug for BackupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupSpec")
            .field("staging_root", &self.staging_root)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("retention_days", &self.retention_days)
            .field("direct_compression", &self.direct_compression)
            .field("debug", &self.debug)
            .field("archive_options", &self.archive_options)
            .field("database_jobs", &self.database_jobs)
            .field("sources", &self.sources)
            .field("remote_targets", &self.remote_targets)
            .finish()
    }
}

impl Default for BackupSpec {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from(DEFAULT_STAGING_ROOT),
            password: String::new(),
            retention_days: DEFAULT_RETENTION_DAYS,
            direct_compression: false,
            debug: false,
            archive_options: ArchiveOptions::default(),
            database_jobs: Vec::new(),
            sources: SourceCollector::default(),
            remote_targets: Vec::new(),
        }
    }
}

impl BackupSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staging_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.staging_root = path.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn direct_compression(mut self, enabled: bool) -> Self {
        self.direct_compression = enabled;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn archive_options(mut self, options: ArchiveOptions) -> Self {
        self.archive_options = options;
        self
    }

    /// Adds a database job. A job for a connection that is already registered
    /// contributes its database names to the existing job instead.
    pub fn database(mut self, job: DatabaseExporter) -> Self {
        match self
            .database_jobs
            .iter_mut()
            .find(|existing| existing.connection() == job.connection())
        {
            Some(existing) => {
                existing.add_databases(job.database_names());
            }
            None => self.database_jobs.push(job),
        }
        self
    }

    /// Registers a file; missing, unreadable or repeated paths are skipped.
    pub fn file(mut self, path: impl AsRef<Path>, target_dir: &str) -> Self {
        let path = path.as_ref();
        if !self.sources.register_file(path, target_dir) {
            warn!(path = %path.display(), "file not registered (missing, unreadable or duplicate)");
        }
        self
    }

    /// Registers a directory; missing, unreadable or repeated paths are skipped.
    pub fn dir(mut self, path: impl AsRef<Path>, target_dir: &str) -> Self {
        let path = path.as_ref();
        if !self.sources.register_dir(path, target_dir) {
            warn!(path = %path.display(), "directory not registered (missing, unreadable or duplicate)");
        }
        self
    }

    pub fn to_target(mut self, target: RemoteTargetConfig) -> Self {
        self.remote_targets.push(target);
        self
    }

    pub fn to_ftp(self, target: FtpTarget) -> Self {
        self.to_target(RemoteTargetConfig::Ftp(target))
    }

    pub fn to_object_store(self, target: ObjectStoreTarget) -> Self {
        self.to_target(RemoteTargetConfig::ObjectStore(target))
    }

    pub fn to_s3(self, target: S3Target) -> Self {
        self.to_target(RemoteTargetConfig::S3(target))
    }

    pub fn to_dir(self, path: impl Into<PathBuf>) -> Self {
        self.to_target(RemoteTargetConfig::Dir(DirTarget { path: path.into() }))
    }

    pub fn sources(&self) -> &SourceCollector {
        &self.sources
    }

    pub fn database_jobs(&self) -> &[DatabaseExporter] {
        &self.database_jobs
    }

    pub fn remote_targets(&self) -> &[RemoteTargetConfig] {
        &self.remote_targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::db_dump::tests::connection;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_follow_classic_setup() {
        let spec = BackupSpec::new();
        assert_eq!(spec.staging_root, PathBuf::from("/tmp/"));
        assert_eq!(spec.retention_days, 14);
        assert!(!spec.direct_compression);
        assert!(spec.password.is_empty());
    }

    #[test]
    fn test_debug_output_hides_secrets() -> anyhow::Result<()> {
        let spec = BackupSpec::new()
            .password("archive-secret")
            .database(DatabaseExporter::new(connection())?.with_databases(["shop"]))
            .to_ftp(FtpTarget {
                user: "backup".into(),
                pass: "ftp-secret".into(),
                host: "ftp.example.test".into(),
                port: 21,
                path: "/".into(),
            })
            .to_object_store(ObjectStoreTarget {
                token: "store-secret".into(),
                path: "/Backups".into(),
                api_url: "https://api.example.test/".into(),
                content_url: "https://content.example.test/".into(),
            })
            .to_s3(S3Target {
                endpoint_url: "https://s3.example.test".into(),
                region: "eu-1".into(),
                bucket_name: "nightly".into(),
                access_key_id: "AKIDEXAMPLE".into(),
                secret_access_key: "s3-secret".into(),
                folder_prefix: None,
            });

        let debug = format!("{:?}", spec);
        for secret in ["archive-secret", "ftp-secret", "store-secret", "s3-secret", "s3cret"] {
            assert!(!debug.contains(secret), "{} leaked", secret);
        }
        assert!(debug.contains("ftp.example.test"));
        assert!(debug.contains("AKIDEXAMPLE"));
        Ok(())
    }

    #[test]
    fn test_jobs_for_same_connection_are_merged() -> anyhow::Result<()> {
        let mut other = connection();
        other.host = "db2.internal".into();

        let spec = BackupSpec::new()
            .database(DatabaseExporter::new(connection())?.with_databases(["shop"]))
            .database(DatabaseExporter::new(other)?.with_databases(["logs"]))
            .database(DatabaseExporter::new(connection())?.with_databases(["crm", "shop"]));

        assert_eq!(spec.database_jobs().len(), 2);
        assert_eq!(spec.database_jobs()[0].database_names(), ["shop", "crm"]);
        assert_eq!(spec.database_jobs()[1].database_names(), ["logs"]);
        Ok(())
    }

    #[test]
    fn test_chained_registration() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let file = tmp.path().join("single.jpg");
        fs::write(&file, "jpg")?;

        let spec = BackupSpec::new()
            .password("123456")
            .file(&file, "PathInMyBackup/")
            .file(&file, "")
            .dir(tmp.path(), "PathInMyBackup/")
            .dir(tmp.path().join("missing"), "")
            .to_dir(tmp.path().join("nas"))
            .to_object_store(ObjectStoreTarget {
                token: "t".into(),
                path: "/MyFolder".into(),
                api_url: "https://api.example.test/".into(),
                content_url: "https://content.example.test/".into(),
            });

        assert_eq!(spec.sources().files().len(), 1);
        assert_eq!(spec.sources().files()[0].target_dir, "PathInMyBackup/");
        assert_eq!(spec.sources().dirs().len(), 1);
        assert_eq!(spec.remote_targets().len(), 2);
        assert!(matches!(spec.remote_targets()[0], RemoteTargetConfig::Dir(_)));
        Ok(())
    }
}
