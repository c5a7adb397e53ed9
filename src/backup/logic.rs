// dbbackup/src/backup/logic.rs
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::backup::archive::compress_dump;
use crate::backup::db_dump::DatabaseDumper;
use crate::backup::s3_upload::BackupSink;
use crate::config::BackupLocation;
use crate::errors::{AppError, Result, Stage};

/// One validated backup invocation. Read-only once built.
#[derive(Debug, Clone)]
pub struct BackupRun {
    output_path: PathBuf,
    location: BackupLocation,
}

impl BackupRun {
    /// Validates the output path: its parent must exist and the path itself must not.
    /// Never touches the filesystem beyond reading metadata.
    pub fn prepare(output_path: &Path, location: BackupLocation) -> Result<Self> {
        let absolute = std::path::absolute(output_path).map_err(|e| {
            AppError::PathValidation(format!(
                "Failed to resolve output path '{}': {}",
                output_path.display(),
                e
            ))
        })?;

        let parent = absolute.parent().ok_or_else(|| {
            AppError::PathValidation(format!(
                "The output path '{}' has no parent directory",
                absolute.display()
            ))
        })?;
        if !parent.is_dir() {
            return Err(AppError::PathValidation(format!(
                "The directory '{}' does not exist",
                parent.display()
            )));
        }

        if fs::symlink_metadata(&absolute).is_ok() {
            return Err(AppError::PathValidation(format!(
                "The path '{}' already exists. Please specify a different path.",
                absolute.display()
            )));
        }

        Ok(BackupRun {
            output_path: absolute,
            location,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn location(&self) -> BackupLocation {
        self.location
    }
}

/// Sequences dump, compress and upload for a single run.
pub struct BackupPipeline<D, S> {
    dumper: D,
    sink: Option<S>,
}

impl<D: DatabaseDumper, S: BackupSink> BackupPipeline<D, S> {
    pub fn new(dumper: D, sink: Option<S>) -> Self {
        Self { dumper, sink }
    }

    /// Validates `output_path` and runs the pipeline against it.
    pub async fn execute(
        &self,
        output_path: &Path,
        location: BackupLocation,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let run = BackupRun::prepare(output_path, location)?;
        self.run(&run, cancel).await
    }

    /// Returns the path of the compressed archive on success, or the first stage error.
    pub async fn run(&self, run: &BackupRun, cancel: &CancellationToken) -> Result<PathBuf> {
        let sink = match (run.location(), &self.sink) {
            (BackupLocation::Local, _) => None,
            (BackupLocation::S3, Some(sink)) => Some(sink),
            (BackupLocation::S3, None) => {
                return Err(AppError::Config(
                    "Remote backup location selected but no remote storage is configured".to_string(),
                ));
            }
        };

        let output_path = run.output_path();
        info!("🚀 Starting database backup to {}", output_path.display());

        // Stage 1: dump. A failed or cancelled dump never leaves anything at the output path.
        ensure_not_cancelled(cancel, Stage::Dump)?;
        if let Err(e) = self.dumper.dump_database(output_path, cancel).await {
            remove_dump_debris(output_path);
            return Err(e);
        }
        if fs::symlink_metadata(output_path).is_err() {
            return Err(AppError::Dump(format!(
                "The dump finished but nothing was written to {}",
                output_path.display()
            )));
        }
        info!("✓ Dump written to {}", output_path.display());

        // Stage 2: compress. The dump is preserved if this fails.
        ensure_not_cancelled(cancel, Stage::Compress)?;
        let archive_path = compress_dump(output_path, cancel).await?;

        // Stage 3: optional upload. The local archive is kept either way.
        if let Some(sink) = sink {
            ensure_not_cancelled(cancel, Stage::Upload)?;
            sink.upload(&archive_path, cancel).await?;
        }

        info!("🎉 Backup completed successfully: {}", archive_path.display());
        Ok(archive_path)
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken, stage: Stage) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled(stage));
    }
    Ok(())
}

fn remove_dump_debris(path: &Path) {
    let removed = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => Err(e),
    };
    match removed {
        Ok(()) => info!("Removed partial dump at {}", path.display()),
        Err(e) => warn!("Failed to remove partial dump at {}: {}", path.display(), e),
    }
}
