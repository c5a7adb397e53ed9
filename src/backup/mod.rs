mod logic;
pub(crate) mod archive;     // tar.gz creation
pub(crate) mod credentials; // short-lived credential files for dump utilities
pub(crate) mod db_dump;     // database dump utilities
pub(crate) mod s3_upload;   // remote storage

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::errors::Result;
use db_dump::CommandDumper;
use s3_upload::S3Sink;

use logic::BackupPipeline;

/// Public entry point for the backup process.
///
/// Picks the dump utility and remote sink once from the configuration, then
/// runs the pipeline. Returns the path of the local compressed archive.
pub async fn run_backup_flow(app_config: &AppConfig, cancel: &CancellationToken) -> Result<PathBuf> {
    let dumper = CommandDumper::new(app_config.engine, app_config.connection.clone());
    let sink = app_config.s3_storage.clone().map(S3Sink::new);

    BackupPipeline::new(dumper, sink)
        .execute(&app_config.output_path, app_config.backup_location, cancel)
        .await
}
