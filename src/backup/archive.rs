// dbbackup/src/backup/archive.rs
use chrono::{DateTime, Local};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::errors::{AppError, Result, Stage};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// `{base}_{yyyy-MM-dd_HH-mm-ss}.tar.gz`
pub fn archive_file_name(base_name: &str, timestamp: &DateTime<Local>) -> String {
    format!("{}_{}.tar.gz", base_name, timestamp.format(TIMESTAMP_FORMAT))
}

/// Paths of the intermediate tar and the final archive, both siblings of `source`.
fn archive_paths(source: &Path, timestamp: &DateTime<Local>) -> Result<(String, PathBuf, PathBuf)> {
    let base_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            AppError::Compress(format!("Invalid dump path for archiving: {}", source.display()))
        })?
        .to_string();
    let parent = match source.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let compressed_path = parent.join(archive_file_name(&base_name, timestamp));
    let tar_path = compressed_path.with_extension("");
    Ok((base_name, tar_path, compressed_path))
}

/// Bundles `source` into a gzipped tar next to it and removes the source.
///
/// On failure or cancellation partial archive files are removed and the
/// source dump is left in place.
pub async fn compress_dump(source: &Path, cancel: &CancellationToken) -> Result<PathBuf> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled(Stage::Compress));
    }

    let (base_name, tar_path, compressed_path) = archive_paths(source, &Local::now())?;
    info!("Compressing backup to '{}'...", compressed_path.display());

    let job = ArchiveJob {
        source: source.to_path_buf(),
        base_name,
        tar_path,
        compressed_path,
        cancel: cancel.clone(),
    };

    tokio::task::spawn_blocking(move || job.run())
        .await
        .map_err(|e| AppError::Compress(format!("Compression task failed: {}", e)))?
}

struct ArchiveJob {
    source: PathBuf,
    base_name: String,
    tar_path: PathBuf,
    compressed_path: PathBuf,
    cancel: CancellationToken,
}

impl ArchiveJob {
    fn run(self) -> Result<PathBuf> {
        let mut created = Vec::new();
        if let Err(e) = self.build_archive(&mut created) {
            // Only files this job created; anything already at these paths is left alone.
            for path in &created {
                remove_partial(path);
            }
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled(Stage::Compress));
            }
            return Err(AppError::Compress(e));
        }

        let removed = if self.source.is_dir() {
            fs::remove_dir_all(&self.source)
        } else {
            fs::remove_file(&self.source)
        };
        if let Err(e) = removed {
            // The archive is complete and verified; keep it since the source may be half gone.
            return Err(AppError::Compress(format!(
                "Archive {} was created but the dump at {} could not be removed: {}",
                self.compressed_path.display(),
                self.source.display(),
                e
            )));
        }

        info!(
            "✓ Tar.gz archive created successfully at {}",
            self.compressed_path.display()
        );
        Ok(self.compressed_path)
    }

    fn build_archive(&self, created: &mut Vec<PathBuf>) -> std::result::Result<(), String> {
        let tar_file = create_new_file(&self.tar_path)?;
        created.push(self.tar_path.clone());
        write_tar(&self.source, &self.base_name, tar_file, &self.cancel)
            .map_err(|e| format!("Failed to write archive {}: {}", self.tar_path.display(), e))?;

        let compressed_file = create_new_file(&self.compressed_path)?;
        created.push(self.compressed_path.clone());
        let tar_input = File::open(&self.tar_path)
            .map_err(|e| format!("Failed to open archive {}: {}", self.tar_path.display(), e))?;
        gzip_file(tar_input, compressed_file, &self.cancel).map_err(|e| {
            format!(
                "Failed to compress {} into {}: {}",
                self.tar_path.display(),
                self.compressed_path.display(),
                e
            )
        })?;

        fs::remove_file(&self.tar_path).map_err(|e| {
            format!(
                "Failed to remove intermediate archive {}: {}",
                self.tar_path.display(),
                e
            )
        })?;
        created.retain(|p| p != &self.tar_path);

        let entries = count_archive_entries(&self.compressed_path)?;
        if entries == 0 {
            return Err(format!(
                "Archive {} contains no entries",
                self.compressed_path.display()
            ));
        }
        Ok(())
    }
}

/// Creates `path`, refusing to touch a file that is already there.
fn create_new_file(path: &Path) -> std::result::Result<File, String> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => format!(
                "Refusing to overwrite existing file {}",
                path.display()
            ),
            _ => format!("Failed to create archive file {}: {}", path.display(), e),
        })
}

/// Writes an uncompressed tar whose root entry is named `root_name`.
fn write_tar(
    source: &Path,
    root_name: &str,
    tar_file: File,
    cancel: &CancellationToken,
) -> std::result::Result<(), String> {
    let mut tar_builder = Builder::new(tar_file);
    tar_builder.follow_symlinks(false);

    for entry in WalkDir::new(source).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err("archiving cancelled".to_string());
        }
        let entry = entry.map_err(|e| format!("Failed to walk directory {}: {}", source.display(), e))?;
        let path = entry.path();
        let relative = path.strip_prefix(source).map_err(|e| {
            format!(
                "Failed to strip prefix {} from {}: {}",
                source.display(),
                path.display(),
                e
            )
        })?;
        let name = Path::new(root_name).join(relative);

        let file_type = entry.file_type();
        let appended = if file_type.is_dir() {
            tar_builder.append_dir(&name, path)
        } else if file_type.is_file() {
            append_file(&mut tar_builder, &name, path, cancel)
        } else {
            tar_builder.append_path_with_name(path, &name)
        };
        appended.map_err(|e| {
            format!(
                "Failed to append {} as {} to archive: {}",
                path.display(),
                name.display(),
                e
            )
        })?;
    }

    let tar_file = tar_builder
        .into_inner()
        .map_err(|e| format!("Failed to finish archive: {}", e))?;
    tar_file
        .sync_all()
        .map_err(|e| format!("Failed to flush archive: {}", e))
}

fn append_file(
    tar_builder: &mut Builder<File>,
    name: &Path,
    path: &Path,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let file = File::open(path)?;
    let mut header = Header::new_gnu();
    header.set_metadata(&file.metadata()?);
    tar_builder.append_data(&mut header, name, CancellableReader::new(file, cancel))
}

fn gzip_file<R: Read>(input: R, output: File, cancel: &CancellationToken) -> io::Result<()> {
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut CancellableReader::new(input, cancel), &mut encoder)?;
    encoder.finish()?.sync_all()
}

/// Reads every entry of a `.tar.gz` to make sure it is complete.
fn count_archive_entries(archive_path: &Path) -> std::result::Result<usize, String> {
    let read_all = || -> io::Result<usize> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive_path)?));
        let mut count = 0;
        for entry in archive.entries()? {
            io::copy(&mut entry?, &mut io::sink())?;
            count += 1;
        }
        Ok(count)
    };
    read_all().map_err(|e| format!("Archive {} failed verification: {}", archive_path.display(), e))
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed partial archive {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial archive {}: {}", path.display(), e),
    }
}

/// Fails reads once the token is cancelled so long copies stop promptly.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<'a, R> CancellableReader<'a, R> {
    fn new(inner: R, cancel: &'a CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("operation cancelled"));
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// Extracts a GZipped TAR archive into `extract_to_dir`.
    fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> anyhow::Result<()> {
        let archive_file = File::open(archive_path)?;
        let mut archive = tar::Archive::new(GzDecoder::new(archive_file));
        archive.unpack(extract_to_dir)?;
        Ok(())
    }

    fn list_dir(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = fs::read_dir(dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    #[test]
    fn test_archive_name_format() {
        let ts = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(archive_file_name("nightly", &ts), "nightly_2024-03-09_07-05-01.tar.gz");
    }

    #[test]
    fn test_archive_names_differ_across_timestamps() {
        let first = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let second = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
        assert_ne!(archive_file_name("db", &first), archive_file_name("db", &second));
    }

    #[test]
    fn test_archive_paths_are_siblings() -> anyhow::Result<()> {
        let ts = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (base, tar_path, gz_path) = archive_paths(Path::new("/backups/app"), &ts)?;
        assert_eq!(base, "app");
        assert_eq!(tar_path, PathBuf::from("/backups/app_2024-01-02_03-04-05.tar"));
        assert_eq!(gz_path, PathBuf::from("/backups/app_2024-01-02_03-04-05.tar.gz"));
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_round_trips_directory() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("appdb");
        fs::create_dir(&source)?;
        fs::write(source.join("toc.dat"), b"0123456789")?;

        let archive = compress_dump(&source, &CancellationToken::new()).await?;

        assert!(!source.exists());
        assert!(archive.is_file());
        let file_name = archive.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("appdb_"));
        assert!(file_name.ends_with(".tar.gz"));
        assert_eq!(list_dir(tmp.path())?, vec![file_name]);

        let extract_dir = tmp.path().join("extract");
        extract_tar_gz_archive(&archive, &extract_dir)?;
        let restored = extract_dir.join("appdb").join("toc.dat");
        assert_eq!(fs::read(restored)?, b"0123456789");
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_keeps_nested_layout() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("dump");
        fs::create_dir_all(source.join("blobs"))?;
        fs::write(source.join("blobs").join("1.dat.gz"), b"blob")?;
        fs::create_dir(source.join("empty"))?;

        let archive = compress_dump(&source, &CancellationToken::new()).await?;

        let extract_dir = tmp.path().join("extract");
        extract_tar_gz_archive(&archive, &extract_dir)?;
        assert_eq!(fs::read(extract_dir.join("dump/blobs/1.dat.gz"))?, b"blob");
        assert!(extract_dir.join("dump/empty").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_compress_single_file_source() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("app.sql");
        fs::write(&source, b"CREATE TABLE t();")?;

        let archive = compress_dump(&source, &CancellationToken::new()).await?;

        assert!(!source.exists());
        let extract_dir = tmp.path().join("extract");
        extract_tar_gz_archive(&archive, &extract_dir)?;
        assert_eq!(fs::read(extract_dir.join("app.sql"))?, b"CREATE TABLE t();");
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_debris() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("missing");

        let err = compress_dump(&source, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::Compress(_)));
        assert!(list_dir(tmp.path())?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_compression_preserves_source() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("appdb");
        fs::create_dir(&source)?;
        fs::write(source.join("toc.dat"), b"0123456789")?;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = compress_dump(&source, &cancel).await.unwrap_err();

        assert!(matches!(err, AppError::Cancelled(Stage::Compress)));
        assert_eq!(list_dir(tmp.path())?, vec!["appdb".to_string()]);
        Ok(())
    }

    /// Cancels the token once the first read has been served.
    struct CancelAfterFirstRead<'a> {
        data: io::Cursor<Vec<u8>>,
        cancel: &'a CancellationToken,
    }

    impl Read for CancelAfterFirstRead<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let len = buf.len().min(1024);
            let n = self.data.read(&mut buf[..len])?;
            self.cancel.cancel();
            Ok(n)
        }
    }

    fn pseudo_random_bytes(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 56) as u8
            })
            .collect()
    }

    #[test]
    fn test_gzip_stops_after_cancel_mid_stream() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let output = File::create(tmp.path().join("out.tar.gz"))?;
        let cancel = CancellationToken::new();
        let input = CancelAfterFirstRead {
            data: io::Cursor::new(vec![1u8; 64 * 1024]),
            cancel: &cancel,
        };

        let err = gzip_file(input, output, &cancel).unwrap_err();

        assert!(cancel.is_cancelled());
        assert!(err.to_string().contains("cancelled"));
        Ok(())
    }

    #[test]
    fn test_job_cancelled_mid_stream_removes_partials() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("appdb");
        fs::create_dir(&source)?;
        fs::write(source.join("toc.dat"), pseudo_random_bytes(32 * 1024 * 1024))?;

        let ts = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (base_name, tar_path, compressed_path) = archive_paths(&source, &ts)?;
        let cancel = CancellationToken::new();
        let job = ArchiveJob {
            source: source.clone(),
            base_name,
            tar_path: tar_path.clone(),
            compressed_path: compressed_path.clone(),
            cancel: cancel.clone(),
        };

        let handle = std::thread::spawn(move || job.run());
        // Cancel as soon as the tar is being written, well before the copy can finish.
        while !handle.is_finished() {
            if tar_path.exists() {
                cancel.cancel();
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let err = handle.join().unwrap().unwrap_err();

        assert!(matches!(err, AppError::Cancelled(Stage::Compress)));
        assert!(!tar_path.exists());
        assert!(!compressed_path.exists());
        assert_eq!(list_dir(tmp.path())?, vec!["appdb".to_string()]);
        assert!(source.join("toc.dat").is_file());
        Ok(())
    }

    #[test]
    fn test_existing_archive_is_never_overwritten() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("appdb");
        fs::create_dir(&source)?;
        fs::write(source.join("toc.dat"), b"0123456789")?;

        let ts = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (base_name, tar_path, compressed_path) = archive_paths(&source, &ts)?;
        fs::write(&compressed_path, b"PREVIOUS BACKUP")?;

        let job = ArchiveJob {
            source: source.clone(),
            base_name,
            tar_path: tar_path.clone(),
            compressed_path: compressed_path.clone(),
            cancel: CancellationToken::new(),
        };
        let err = job.run().unwrap_err();

        assert!(matches!(err, AppError::Compress(ref m) if m.contains("Refusing to overwrite")));
        assert_eq!(fs::read(&compressed_path)?, b"PREVIOUS BACKUP");
        assert!(!tar_path.exists());
        assert!(source.join("toc.dat").is_file());
        Ok(())
    }

    #[test]
    fn test_failed_tar_step_keeps_unrelated_archive() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("appdb");
        fs::create_dir(&source)?;
        fs::write(source.join("toc.dat"), b"0123456789")?;

        let ts = Local.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let (base_name, tar_path, compressed_path) = archive_paths(&source, &ts)?;
        fs::create_dir(&tar_path)?;
        fs::write(&compressed_path, b"PREVIOUS BACKUP")?;

        let job = ArchiveJob {
            source: source.clone(),
            base_name,
            tar_path: tar_path.clone(),
            compressed_path: compressed_path.clone(),
            cancel: CancellationToken::new(),
        };
        let err = job.run().unwrap_err();

        assert!(matches!(err, AppError::Compress(_)));
        assert!(tar_path.is_dir());
        assert_eq!(fs::read(&compressed_path)?, b"PREVIOUS BACKUP");
        assert!(source.join("toc.dat").is_file());
        Ok(())
    }
}
