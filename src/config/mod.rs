// remotebackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::archive::ArchiveOptions;
use crate::backup::db_dump::{DatabaseExporter, DbConnection, DbEngine};
use crate::backup::spec::{BackupSpec, DEFAULT_RETENTION_DAYS, DEFAULT_STAGING_ROOT};
use crate::remote::RemoteTargetConfig;

/// Environment variable consulted when `password` is absent from config.json.
pub const PASSWORD_ENV: &str = "BACKUP_PASSWORD";

fn default_staging_root() -> PathBuf {
    PathBuf::from(DEFAULT_STAGING_ROOT)
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

fn masked(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}

// Structs for deserializing config.json
#[derive(Clone, Deserialize)]
pub struct JsonDatabaseJob {
    #[serde(default)]
    pub engine: DbEngine,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub databases: Vec<String>,
}

impl fmt::Debug for JsonDatabaseJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonDatabaseJob")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &masked(&self.password))
            .field("databases", &self.databases)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonSource {
    pub path: PathBuf,
    #[serde(default)]
    pub target_dir: String,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    pub password: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub direct_compression: bool,
    #[serde(default)]
    pub debug: bool,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub archive: ArchiveOptions,
    #[serde(default)]
    pub databases: Vec<JsonDatabaseJob>,
    #[serde(default)]
    pub files: Vec<JsonSource>,
    #[serde(default)]
    pub dirs: Vec<JsonSource>,
    #[serde(default)]
    pub remote_targets: Vec<RemoteTargetConfig>,
}

impl fmt::Debug for RawJsonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawJsonConfig")
            .field("staging_root", &self.staging_root)
            .field("password", &self.password.as_deref().map(masked))
            .field("retention_days", &self.retention_days)
            .field("direct_compression", &self.direct_compression)
            .field("debug", &self.debug)
            .field("log_file", &self.log_file)
            .field("archive", &self.archive)
            .field("databases", &self.databases)
            .field("files", &self.files)
            .field("dirs", &self.dirs)
            .field("remote_targets", &self.remote_targets)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub raw_json_config: RawJsonConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        Self::from_json_str(&config_content, config_path).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }

    pub fn from_json_str(content: &str, config_path: &Path) -> Result<Self> {
        let raw_json_config: RawJsonConfig = serde_json::from_str(content)?;
        Ok(AppConfig {
            config_path: config_path.to_path_buf(),
            raw_json_config,
        })
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.raw_json_config.log_file.as_deref()
    }

    /// Turns the parsed file into a run description, taking the archive
    /// password from the environment when the file has none.
    pub fn build_backup_spec(&self) -> Result<BackupSpec> {
        self.build_backup_spec_with(env::var(PASSWORD_ENV).ok())
    }

    fn build_backup_spec_with(&self, env_password: Option<String>) -> Result<BackupSpec> {
        let raw = &self.raw_json_config;

        if raw.staging_root.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("staging_root cannot be empty in config.json."));
        }
        if raw.archive.compression_level > 9 {
            return Err(anyhow::anyhow!(
                "archive.compression_level must be between 0 and 9, got {}",
                raw.archive.compression_level
            ));
        }

        let password = raw
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .or(env_password)
            .unwrap_or_default();

        let mut spec = BackupSpec::new()
            .staging_root(&raw.staging_root)
            .password(password)
            .retention_days(raw.retention_days)
            .direct_compression(raw.direct_compression)
            .debug(raw.debug)
            .archive_options(raw.archive.clone());

        for job in &raw.databases {
            let connection = DbConnection {
                engine: job.engine,
                host: job.host.clone(),
                port: job.port,
                user: job.user.clone(),
                password: job.password.clone(),
            };
            let exporter = DatabaseExporter::new(connection)
                .with_context(|| format!("Invalid database job for {}@{}", job.user, job.host))?
                .with_databases(&job.databases);
            spec = spec.database(exporter);
        }

        for file in &raw.files {
            spec = spec.file(&file.path, &file.target_dir);
        }
        for dir in &raw.dirs {
            spec = spec.dir(&dir.path, &dir.target_dir);
        }

        if raw.remote_targets.is_empty() {
            println!("⚠️ No remote_targets in config.json; the archive will be built and then discarded.");
        }
        for target in &raw.remote_targets {
            spec = spec.to_target(target.clone());
        }

        Ok(spec)
    }
}
