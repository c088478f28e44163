//! Remote Backup Tool
//!
//! Reads `config.json` (or the path given as first argument) and runs one backup.

// remotebackup/src/main.rs
use anyhow::{Context, Result};
use remotebackup::backup;
use remotebackup::config::AppConfig;
use remotebackup::utils::logger;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // Secrets such as BACKUP_PASSWORD may live in .env
    dotenv::dotenv().ok();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    logger::init("info", app_config.log_file()).context("Failed to initialise logging")?;

    println!("🚀 Starting Backup Process...");
    let summary = backup::run_backup_flow(&app_config)
        .await
        .context("Backup process failed")?;

    for target in summary.targets.iter().filter(|t| !t.success()) {
        eprintln!(
            "⚠️ {}: {}",
            target.label,
            target.error.as_deref().unwrap_or("transfer failed")
        );
    }
    Ok(())
}
