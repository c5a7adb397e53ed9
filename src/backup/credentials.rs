// dbbackup/src/backup/credentials.rs
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::errors::{AppError, Result};

/// A short-lived file holding database credentials for a dump utility.
///
/// The file is created owner-read/write only and removed when the value is
/// dropped, so an early return, a cancelled future or a panic all clean it up.
pub struct CredentialFile {
    file: NamedTempFile,
}

impl CredentialFile {
    pub fn create(prefix: &str, contents: &str) -> Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile()
            .map_err(|e| AppError::Dump(format!("Failed to create temporary credential file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| AppError::Dump(format!("Failed to restrict credential file permissions: {}", e)))?;
        }

        file.write_all(contents.as_bytes())
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| AppError::Dump(format!("Failed to write temporary credential file: {}", e)))?;

        Ok(CredentialFile { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
