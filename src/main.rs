//! One-shot database backup tool
//!
//! Dumps a database, compresses the dump and optionally uploads it to remote storage.

// dbbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod host;
mod utils;

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use config::{AppConfig, CliArgs};
use errors::Result;

#[tokio::main]
async fn main() -> ExitCode {
    // Values from .env feed the CLI's env fallbacks, so load it before parsing.
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = CliArgs::parse();

    match run_app(&cli).await {
        Ok(archive_path) => {
            info!("✅ Backup stored at {}", archive_path.display());
            ExitCode::SUCCESS
        }
        Err(e) if e.is_cancelled() => {
            error!("❌ Backup cancelled during the {} stage", e.stage());
            ExitCode::from(e.exit_code())
        }
        Err(e) => {
            error!("❌ Backup failed at the {} stage: {}", e.stage(), e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run_app(cli: &CliArgs) -> Result<PathBuf> {
    let app_config = AppConfig::load(cli)?;

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let pipeline = async move { backup::run_backup_flow(&app_config, &task_cancel).await };

    host::run_until_complete(pipeline, cancel, host::interrupt_signal()).await
}
