use std::fmt;
use thiserror::Error;

/// The phase of a backup run an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    PathValidation,
    Dump,
    Compress,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configuration => "configuration",
            Stage::PathValidation => "path-validation",
            Stage::Dump => "dump",
            Stage::Compress => "compress",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid output path: {0}")]
    PathValidation(String),

    #[error("An error occurred while running the '{program}' process:\n\n{stderr}")]
    DumpProcess { program: String, stderr: String },

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Compression failed: {0}")]
    Compress(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Operation cancelled during {0} stage")]
    Cancelled(Stage),
}

impl AppError {
    /// The single stage this error is attributed to.
    pub fn stage(&self) -> Stage {
        match self {
            AppError::Config(_) => Stage::Configuration,
            AppError::PathValidation(_) => Stage::PathValidation,
            AppError::DumpProcess { .. } | AppError::Dump(_) => Stage::Dump,
            AppError::Compress(_) => Stage::Compress,
            AppError::Upload(_) => Stage::Upload,
            AppError::Cancelled(stage) => *stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled(_))
    }

    /// Process exit status for this error. Success is 0 and never produced here.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Cancelled(_) => 130,
            _ => match self.stage() {
                Stage::Configuration => 2,
                Stage::PathValidation => 3,
                Stage::Dump => 4,
                Stage::Compress => 5,
                Stage::Upload => 6,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
