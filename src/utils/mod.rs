use std::path::PathBuf;
use which::which;

use crate::errors::{AppError, Result};

/// Finds a database client executable in the system PATH.
pub fn find_executable(program: &str) -> Result<PathBuf> {
    which(program).map_err(|_| {
        AppError::Dump(format!(
            "{} executable not found in PATH. Please ensure the database client tools are installed and in your PATH.",
            program
        ))
    })
}
