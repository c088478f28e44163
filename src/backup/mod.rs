// remotebackup/src/backup/mod.rs
pub mod archive;
pub mod db_dump;
pub mod logic;
pub mod sources;
pub mod spec;

use anyhow::{Context, Result};
use crate::config::AppConfig;

pub use logic::{BackupOrchestrator, RunSummary};
pub use spec::BackupSpec;

/// Public entry point for the backup process.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<RunSummary> {
    let spec = app_config
        .build_backup_spec()
        .with_context(|| format!("Invalid backup configuration in {}", app_config.config_path.display()))?;

    let summary = BackupOrchestrator::new(spec).process().await?;
    Ok(summary)
}
