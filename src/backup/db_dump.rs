// dbbackup/src/backup/db_dump.rs
use async_trait::async_trait;
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::backup::credentials::CredentialFile;
use crate::config::{ConnectionConfig, DatabaseEngine};
use crate::errors::{AppError, Result, Stage};
use crate::utils::find_executable;

/// Produces a dump of a database at a path that does not exist yet.
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    async fn dump_database(&self, output_path: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// Dumps a database by running the engine's native dump utility.
#[derive(Debug, Clone)]
pub struct CommandDumper {
    engine: DatabaseEngine,
    connection: ConnectionConfig,
}

impl CommandDumper {
    pub fn new(engine: DatabaseEngine, connection: ConnectionConfig) -> Self {
        Self { engine, connection }
    }

    fn program(&self) -> &'static str {
        match self.engine {
            DatabaseEngine::Postgres => "pg_dump",
            DatabaseEngine::MySql => "mysqldump",
        }
    }

    async fn dump_postgres(&self, output_path: &Path, cancel: &CancellationToken) -> Result<()> {
        let conn = &self.connection;
        info!(
            "Dumping Postgres database '{}' to '{}'...",
            conn.database,
            output_path.display()
        );

        let pg_dump_path = find_executable(self.program())?;
        let pgpass = CredentialFile::create("dbbackup-pgpass-", &pgpass_entry(conn))?;

        let mut cmd = Command::new(&pg_dump_path);
        cmd.env("PGPASSFILE", pgpass.path())
            .env_remove("PGPASSWORD")
            .arg("--host")
            .arg(&conn.host)
            .arg("--port")
            .arg(conn.port.to_string())
            .arg("--username")
            .arg(&conn.username)
            .arg("--dbname")
            .arg(&conn.database)
            .arg("--no-password")
            .arg("--format")
            .arg("directory")
            .arg("--file")
            .arg(output_path);

        run_dump_command(cmd, self.program(), cancel).await
    }

    async fn dump_mysql(&self, output_path: &Path, cancel: &CancellationToken) -> Result<()> {
        let conn = &self.connection;

        // mysqldump writes a single file; the dump artifact is the directory holding it.
        fs::create_dir_all(output_path).map_err(|e| {
            AppError::Dump(format!(
                "Failed to create dump directory {}: {}",
                output_path.display(),
                e
            ))
        })?;
        let output_file = output_path.join(format!("{}.sql", conn.database));

        info!(
            "Dumping MySQL database '{}' to '{}'...",
            conn.database,
            output_file.display()
        );

        let mysqldump_path = find_executable(self.program())?;
        let defaults = CredentialFile::create("dbbackup-mycnf-", &mysql_defaults_file(conn))?;

        let mut cmd = Command::new(&mysqldump_path);
        // --defaults-extra-file must be the first option.
        cmd.arg(format!("--defaults-extra-file={}", defaults.path().display()))
            .env_remove("MYSQL_PWD")
            .arg("--host")
            .arg(&conn.host)
            .arg("--port")
            .arg(conn.port.to_string())
            .arg("--user")
            .arg(&conn.username)
            .arg("--databases")
            .arg(&conn.database)
            .arg("--result-file")
            .arg(&output_file);

        run_dump_command(cmd, self.program(), cancel).await
    }
}

#[async_trait]
impl DatabaseDumper for CommandDumper {
    async fn dump_database(&self, output_path: &Path, cancel: &CancellationToken) -> Result<()> {
        match self.engine {
            DatabaseEngine::Postgres => self.dump_postgres(output_path, cancel).await,
            DatabaseEngine::MySql => self.dump_mysql(output_path, cancel).await,
        }
    }
}

/// Runs a dump utility to completion, capturing stderr.
///
/// If `cancel` fires first the child is killed and reaped before returning.
pub async fn run_dump_command(
    mut cmd: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled(Stage::Dump));
    }

    debug!("Running {} command: {:?}", program, cmd.as_std().get_args().collect::<Vec<_>>());

    // Own process group: a terminal Ctrl+C reaches only this process, which then
    // stops the child through the token.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::Dump(format!("Failed to execute {}: {}", program, e)))?;

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    let status = match status {
        Some(status) => {
            status.map_err(|e| AppError::Dump(format!("Failed to wait for {}: {}", program, e)))?
        }
        None => {
            info!("Cancellation requested, stopping {}...", program);
            let _ = child.kill().await;
            return Err(AppError::Cancelled(Stage::Dump));
        }
    };

    if status.success() {
        info!("✓ {} completed successfully", program);
        return Ok(());
    }

    let stderr = match stderr_reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    Err(failed_exit(program, &status.to_string(), &stderr, cancel))
}

/// Error for a dump utility that exited nonzero.
///
/// A child that died while cancellation was underway is reported as cancelled.
fn failed_exit(program: &str, status: &str, stderr: &str, cancel: &CancellationToken) -> AppError {
    if cancel.is_cancelled() {
        info!("{} exited with {} after cancellation was requested", program, status);
        return AppError::Cancelled(Stage::Dump);
    }
    let stderr = if stderr.trim().is_empty() {
        format!("{} exited with {}", program, status)
    } else {
        stderr.trim_end().to_string()
    };
    AppError::DumpProcess {
        program: program.to_string(),
        stderr,
    }
}

/// Builds a single `.pgpass` line for exactly this connection.
fn pgpass_entry(conn: &ConnectionConfig) -> String {
    fn escape(field: &str) -> String {
        field.replace('\\', "\\\\").replace(':', "\\:")
    }
    format!(
        "{}:{}:{}:{}:{}\n",
        escape(&conn.host),
        conn.port,
        escape(&conn.database),
        escape(&conn.username),
        escape(&conn.password)
    )
}

fn mysql_defaults_file(conn: &ConnectionConfig) -> String {
    let password = conn.password.replace('\\', "\\\\").replace('"', "\\\"");
    format!("[client]\npassword=\"{}\"\n", password)
}
