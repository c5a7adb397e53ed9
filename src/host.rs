// dbbackup/src/host.rs
use log::{error, warn};
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, Result};

/// Runs the backup on its own task and waits for its terminal outcome.
///
/// If `interrupt` resolves first, `cancel` is triggered and the task is still
/// awaited so that stage cleanup finishes before the process exits.
pub async fn run_until_complete<F, I>(
    pipeline: F,
    cancel: CancellationToken,
    interrupt: I,
) -> Result<PathBuf>
where
    F: Future<Output = Result<PathBuf>> + Send + 'static,
    I: Future<Output = ()>,
{
    let mut task = tokio::spawn(pipeline);

    tokio::select! {
        joined = &mut task => return unwrap_join(joined),
        _ = interrupt => {
            warn!("Interrupt received, cancelling backup and waiting for cleanup...");
            cancel.cancel();
        }
    }

    unwrap_join(task.await)
}

fn unwrap_join(joined: std::result::Result<Result<PathBuf>, tokio::task::JoinError>) -> Result<PathBuf> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => match e.try_into_panic() {
            Ok(payload) => std::panic::resume_unwind(payload),
            Err(e) => {
                error!("Backup task ended without an outcome: {}", e);
                Err(AppError::Dump(format!("Backup task ended unexpectedly: {}", e)))
            }
        },
    }
}

/// Resolves on Ctrl+C. Never resolves if the handler cannot be installed.
pub async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Stage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_completed_pipeline_outcome_is_returned() -> anyhow::Result<()> {
        let outcome = run_until_complete(
            async { Ok(PathBuf::from("/backups/app.tar.gz")) },
            CancellationToken::new(),
            std::future::pending::<()>(),
        )
        .await?;
        assert_eq!(outcome, PathBuf::from("/backups/app.tar.gz"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stage_error_passes_through_unchanged() {
        let err = run_until_complete(
            async { Err(AppError::Compress("disk full".into())) },
            CancellationToken::new(),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Compress(ref m) if m == "disk full"));
    }

    #[tokio::test]
    async fn test_interrupt_cancels_and_waits_for_cleanup() {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (cleaned_tx, cleaned_rx) = tokio::sync::oneshot::channel();

        let pipeline = async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cleaned_tx.send(());
            Err(AppError::Cancelled(Stage::Dump))
        };

        let err = run_until_complete(
            pipeline,
            cancel.clone(),
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

        assert!(cancel.is_cancelled());
        assert!(matches!(err, AppError::Cancelled(Stage::Dump)));
        assert!(cleaned_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_aborted_task_maps_to_error() {
        let handle = tokio::spawn(std::future::pending::<Result<PathBuf>>());
        handle.abort();
        let err = unwrap_join(handle.await).unwrap_err();
        assert!(matches!(err, AppError::Dump(ref m) if m.starts_with("Backup task ended unexpectedly")));
        assert_eq!(err.exit_code(), 4);
    }
}
