use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use super::error::IngestError;

/// Buffer size for file I/O operations (128KB for optimal throughput)
const BUFFER_SIZE: usize = 128 * 1024;

/// Entries the host OS reserves for indexing and recycling metadata. Never
/// copied, at any depth.
pub const RESERVED_ENTRIES: [&str; 2] = ["System Volume Information", "$RECYCLE.BIN"];

/// What to copy, and the used-space figure progress is measured against.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Used space on the source volume (total - free), read once before the run.
    pub used_bytes: u64,
}

/// Emitted after every top-level entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyProgress {
    pub entry: String,
    pub entry_bytes: u64,
    pub percentage: f64,
}

#[derive(Debug)]
pub struct EntryFailure {
    pub error: IngestError,
    /// The error looked like the device vanished mid-copy.
    pub device_removed: bool,
}

#[derive(Debug)]
pub struct CopyReport {
    pub started_at: DateTime<Utc>,
    pub entries_copied: usize,
    pub entries_skipped: usize,
    pub bytes_copied: u64,
    pub percentage: f64,
    pub failures: Vec<EntryFailure>,
    pub duration: Duration,
}

impl CopyReport {
    /// True when every entry was copied without error.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Copies the contents of a volume root into a destination directory.
///
/// - Reserved OS entries are skipped
/// - Existing destination files are overwritten
/// - A failing entry is reported and the run carries on with the next one
/// - Metadata preservation (permissions, timestamps)
pub struct CopyEngine {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for CopyEngine {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

impl CopyEngine {
    pub fn new(sync_files: bool) -> Self {
        Self { sync_files }
    }

    /// Copy every top-level entry of `req.source` into `req.destination`.
    ///
    /// `DestinationCreate` and `SourceList` (the root itself cannot be
    /// enumerated) abort the run. Per-entry failures end up in the returned
    /// report.
    pub fn copy_all(
        &self,
        req: &CopyRequest,
        on_progress: &mut dyn FnMut(&CopyProgress),
    ) -> Result<CopyReport, IngestError> {
        let span = info_span!(
            "copy_all",
            source = %req.source.display(),
            destination = %req.destination.display()
        );
        let _guard = span.enter();

        let started_at = Utc::now();
        let start_time = Instant::now();
        let mut report = CopyReport {
            started_at,
            entries_copied: 0,
            entries_skipped: 0,
            bytes_copied: 0,
            percentage: 0.0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        };

        if req.used_bytes == 0 {
            info!("Source reports no used space, nothing to copy");
            report.percentage = 100.0;
            on_progress(&CopyProgress {
                entry: String::new(),
                entry_bytes: 0,
                percentage: report.percentage,
            });
            return Ok(report);
        }

        if !req.destination.exists() {
            fs::create_dir_all(&req.destination).map_err(|e| IngestError::DestinationCreate {
                path: req.destination.clone(),
                source: e,
            })?;
            info!("Destination directory created");
        }

        info!(
            used_mb = %format!("{:.1}", req.used_bytes as f64 / (1024.0 * 1024.0)),
            "Starting copy"
        );

        let entries = list_entries(&req.source).map_err(|e| {
            error!(
                error = %e,
                device_removed = is_device_removed_error(&e),
                "Failed to list source directory"
            );
            IngestError::SourceList {
                path: req.source.clone(),
                source: e,
            }
        })?;

        for source_path in entries {
            let Some(name) = source_path.file_name() else {
                continue;
            };
            let entry = name.to_string_lossy().to_string();

            if is_reserved(&source_path) {
                debug!(entry = %entry, "Skipping reserved entry");
                report.entries_skipped += 1;
                continue;
            }

            let dest_path = req.destination.join(name);
            let mut entry_bytes: u64 = 0;
            let outcome = self.copy_entry(&source_path, &dest_path, &mut entry_bytes);

            match outcome {
                Ok(true) => report.entries_copied += 1,
                Ok(false) => {
                    debug!(entry = %entry, "Skipping symlink or special file");
                    report.entries_skipped += 1;
                    continue;
                }
                Err(failure) => {
                    if failure.device_removed {
                        warn!(
                            entry = %entry,
                            error = %failure.error,
                            "Device appears to have been removed"
                        );
                    } else {
                        error!(entry = %entry, error = %failure.error, "Failed to copy entry");
                    }
                    report.failures.push(failure);
                }
            }

            report.bytes_copied += entry_bytes;
            report.percentage += (entry_bytes as f64 / req.used_bytes as f64) * 100.0;

            let progress = CopyProgress {
                entry,
                entry_bytes,
                percentage: report.percentage,
            };
            info!(
                entry = %progress.entry,
                progress = %format!("{:.1}%", progress.percentage),
                "Copy progress"
            );
            on_progress(&progress);
        }

        report.duration = start_time.elapsed();

        if report.is_complete() {
            info!(
                entries = report.entries_copied,
                total_bytes = report.bytes_copied,
                duration_secs = report.duration.as_secs(),
                "Copy complete"
            );
        } else {
            warn!(
                entries = report.entries_copied,
                failed = report.failures.len(),
                total_bytes = report.bytes_copied,
                "Copy finished with errors"
            );
        }

        Ok(report)
    }

    /// Copy one top-level entry. Returns Ok(false) if the entry is not a
    /// regular file or directory.
    ///
    /// `copied` accumulates the bytes written, including when a nested file fails.
    fn copy_entry(
        &self,
        source: &Path,
        dest: &Path,
        copied: &mut u64,
    ) -> Result<bool, EntryFailure> {
        let metadata = source.symlink_metadata().map_err(|e| entry_failure(source, e))?;

        if metadata.is_dir() {
            let mut first_failure = None;
            self.copy_tree(source, dest, copied, &mut first_failure);
            match first_failure {
                Some(failure) => Err(failure),
                None => Ok(true),
            }
        } else if metadata.is_file() {
            *copied += copy_single_file(source, dest, self.sync_files)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Recursively copy a directory, keeping going past failing children.
    fn copy_tree(
        &self,
        source: &Path,
        dest: &Path,
        copied: &mut u64,
        first_failure: &mut Option<EntryFailure>,
    ) {
        if let Err(e) = fs::create_dir_all(dest) {
            note_failure(entry_failure(dest, e), first_failure);
            return;
        }

        let children = match list_entries(source) {
            Ok(children) => children,
            Err(e) => {
                note_failure(entry_failure(source, e), first_failure);
                return;
            }
        };

        for child in children {
            let Some(name) = child.file_name() else {
                continue;
            };
            if is_reserved(&child) {
                debug!(path = %child.display(), "Skipping reserved entry");
                continue;
            }
            let child_dest = dest.join(name);

            let metadata = match child.symlink_metadata() {
                Ok(m) => m,
                Err(e) => {
                    note_failure(entry_failure(&child, e), first_failure);
                    continue;
                }
            };

            if metadata.is_dir() {
                self.copy_tree(&child, &child_dest, copied, first_failure);
            } else if metadata.is_file() {
                match copy_single_file(&child, &child_dest, self.sync_files) {
                    Ok(bytes) => *copied += bytes,
                    Err(failure) => note_failure(failure, first_failure),
                }
            }
            // Skip symlinks and other special files
        }

        if let Ok(metadata) = fs::metadata(source) {
            let _ = fs::set_permissions(dest, metadata.permissions());
        }
    }
}

/// Total size in bytes of all regular files under `path` (or of `path` itself).
///
/// Unreadable children are counted as zero.
pub fn tree_size(path: &Path) -> u64 {
    let Ok(metadata) = path.symlink_metadata() else {
        return 0;
    };

    if metadata.is_file() {
        return metadata.len();
    }
    if !metadata.is_dir() {
        return 0;
    }

    match fs::read_dir(path) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| tree_size(&entry.path()))
            .sum(),
        Err(_) => 0,
    }
}

/// Entries of a directory, sorted by name so runs are reproducible.
fn list_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

fn is_reserved(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| RESERVED_ENTRIES.iter().any(|reserved| name == *reserved))
}

/// Keep the first failure of a subtree; later ones are only logged.
fn note_failure(failure: EntryFailure, first: &mut Option<EntryFailure>) {
    debug!(error = %failure.error, "Nested copy failure");
    if first.is_none() {
        *first = Some(failure);
    }
}

fn entry_failure(path: &Path, source: io::Error) -> EntryFailure {
    EntryFailure {
        device_removed: is_device_removed_error(&source),
        error: IngestError::EntryCopy {
            path: path.to_path_buf(),
            source,
        },
    }
}

/// Copy a single file, overwriting the destination, with metadata preservation
fn copy_single_file(source: &Path, dest: &Path, sync_file: bool) -> Result<u64, EntryFailure> {
    let fail = |e: io::Error| entry_failure(source, e);

    let source_metadata = fs::metadata(source).map_err(fail)?;

    let source_file = File::open(source).map_err(fail)?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    // File::create truncates an existing destination file
    let dest_file = File::create(dest).map_err(|e| entry_failure(dest, e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(fail)?;
        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| entry_failure(dest, e))?;

        bytes_written += bytes_read as u64;
    }

    writer.flush().map_err(|e| entry_failure(dest, e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| entry_failure(dest, e.into_error()))?;
        inner.sync_all().map_err(|e| entry_failure(dest, e))?;
    }

    // Log but don't fail - permission errors might happen on some filesystems
    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    let atime = filetime::FileTime::from_last_access_time(&source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&source_metadata);
    if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve timestamps");
    }

    Ok(bytes_written)
}

/// Check if an I/O error indicates the device has been removed
fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        ErrorKind::BrokenPipe => true,
        ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                    | libc::ENODEV
                    | libc::ENXIO
                    | libc::ENOMEDIUM
                    | libc::EMEDIUMTYPE
                )
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(source: &Path, dest: &Path, used_bytes: u64) -> CopyRequest {
        CopyRequest {
            source: source.to_path_buf(),
            destination: dest.to_path_buf(),
            used_bytes,
        }
    }

    fn run(
        engine: &CopyEngine,
        req: &CopyRequest,
    ) -> (Result<CopyReport, IngestError>, Vec<CopyProgress>) {
        let mut updates = Vec::new();
        let result = engine.copy_all(req, &mut |p| updates.push(p.clone()));
        (result, updates)
    }

    #[test]
    fn test_is_device_removed_error_eio() {
        let error = io::Error::from_raw_os_error(libc::EIO);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_permission_denied() {
        let error = io::Error::new(ErrorKind::PermissionDenied, "permission denied");
        assert!(!is_device_removed_error(&error));
    }

    #[test]
    fn test_tree_size() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("file1.txt"), b"hello").unwrap();
        fs::create_dir(temp.path().join("subdir")).unwrap();
        fs::write(temp.path().join("subdir/nested.txt"), b"nested").unwrap();

        assert_eq!(tree_size(temp.path()), 5 + 6);
        assert_eq!(tree_size(&temp.path().join("file1.txt")), 5);
        assert_eq!(tree_size(&temp.path().join("missing")), 0);
    }

    #[test]
    fn test_copy_all_copies_tree_and_reaches_full_progress() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");

        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.txt"), b"hello world").unwrap();
        fs::create_dir_all(source.join("DCIM/100CANON")).unwrap();
        fs::write(source.join("DCIM/100CANON/IMG_0001.JPG"), vec![7u8; 300]).unwrap();
        fs::write(source.join("DCIM/index.dat"), b"nested content").unwrap();

        let used = 11 + 300 + 14;
        let engine = CopyEngine::default();
        let (result, updates) = run(&engine, &request(&source, &dest, used));
        let report = result.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.entries_copied, 2);
        assert_eq!(report.bytes_copied, used);
        assert!((report.percentage - 100.0).abs() < 1e-9);

        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "hello world");
        assert_eq!(fs::read(dest.join("DCIM/100CANON/IMG_0001.JPG")).unwrap().len(), 300);
        assert_eq!(fs::read_to_string(dest.join("DCIM/index.dat")).unwrap(), "nested content");

        // One signal per top-level entry, never decreasing
        assert_eq!(updates.len(), 2);
        assert!(updates.windows(2).all(|w| w[0].percentage <= w[1].percentage));
        // Directory entry counts its whole subtree
        let dcim = updates.iter().find(|u| u.entry == "DCIM").unwrap();
        assert_eq!(dcim.entry_bytes, 314);
    }

    #[test]
    fn test_reserved_entries_are_never_copied() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");

        fs::create_dir_all(source.join("System Volume Information")).unwrap();
        fs::write(source.join("System Volume Information/IndexerVolumeGuid"), b"guid").unwrap();
        fs::create_dir_all(source.join("$RECYCLE.BIN")).unwrap();
        fs::write(source.join("$RECYCLE.BIN/desktop.ini"), b"ini").unwrap();
        fs::write(source.join("keep.txt"), b"keep").unwrap();

        let (result, _) = run(&CopyEngine::default(), &request(&source, &dest, 4));
        let report = result.unwrap();

        assert_eq!(report.entries_copied, 1);
        assert_eq!(report.entries_skipped, 2);
        assert!(dest.join("keep.txt").exists());
        assert!(!dest.join("System Volume Information").exists());
        assert!(!dest.join("$RECYCLE.BIN").exists());
    }

    #[test]
    fn test_existing_destination_files_are_overwritten() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");

        fs::create_dir(&source).unwrap();
        fs::create_dir(&dest).unwrap();
        fs::write(source.join("notes.txt"), b"new").unwrap();
        fs::write(dest.join("notes.txt"), b"old and longer").unwrap();

        let (result, _) = run(&CopyEngine::new(false), &request(&source, &dest, 3));
        assert!(result.unwrap().is_complete());
        assert_eq!(fs::read_to_string(dest.join("notes.txt")).unwrap(), "new");
    }

    #[test]
    fn test_failed_entry_is_reported_and_others_continue() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");

        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.txt"), b"aaaa").unwrap();
        fs::write(source.join("b.txt"), b"bbbb").unwrap();
        fs::write(source.join("c.txt"), b"cccc").unwrap();

        // A directory in the way of b.txt makes its copy fail, even as root
        fs::create_dir_all(dest.join("b.txt")).unwrap();

        let (result, updates) = run(&CopyEngine::default(), &request(&source, &dest, 12));
        let report = result.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.entries_copied, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0].error,
            IngestError::EntryCopy { path, .. } if path.ends_with("b.txt")
        ));
        assert!(report.percentage < 100.0);
        assert!(dest.join("a.txt").is_file());
        assert!(dest.join("c.txt").is_file());
        assert_eq!(updates.len(), 3);
    }

    #[test]
    fn test_nested_failure_fails_entry_but_copies_siblings() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");

        fs::create_dir_all(source.join("photos")).unwrap();
        fs::write(source.join("photos/1.jpg"), b"11").unwrap();
        fs::write(source.join("photos/2.jpg"), b"22").unwrap();
        fs::create_dir_all(dest.join("photos/1.jpg")).unwrap();

        let (result, updates) = run(&CopyEngine::default(), &request(&source, &dest, 4));
        let report = result.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.entries_copied, 0);
        assert_eq!(fs::read_to_string(dest.join("photos/2.jpg")).unwrap(), "22");
        assert_eq!(updates[0].entry_bytes, 2);
        assert!((report.percentage - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_destination_create_failure_copies_nothing() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.txt"), b"aaaa").unwrap();

        // Parent of the destination is a regular file
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let dest = blocker.join("dest");

        let (result, updates) = run(&CopyEngine::default(), &request(&source, &dest, 4));

        assert!(matches!(result, Err(IngestError::DestinationCreate { .. })));
        assert!(updates.is_empty());
        assert!(!dest.exists());
    }

    #[test]
    fn test_zero_used_bytes_reports_complete_immediately() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a.txt"), b"aaaa").unwrap();

        let (result, updates) = run(&CopyEngine::default(), &request(&source, &dest, 0));
        let report = result.unwrap();

        assert_eq!(report.entries_copied, 0);
        assert_eq!(report.percentage, 100.0);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].percentage, 100.0);
        assert!(!dest.join("a.txt").exists());
    }

    #[test]
    fn test_unlistable_source_aborts_the_run() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("dest");

        let (result, updates) = run(
            &CopyEngine::default(),
            &request(&temp.path().join("gone"), &dest, 10),
        );

        assert!(matches!(
            result,
            Err(IngestError::SourceList { path, .. }) if path.ends_with("gone")
        ));
        assert!(updates.is_empty());
    }

    #[test]
    fn test_nested_reserved_entries_are_never_copied() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("volume");
        let dest = temp.path().join("dest");

        fs::create_dir_all(source.join("backup/$RECYCLE.BIN")).unwrap();
        fs::write(source.join("backup/$RECYCLE.BIN/desktop.ini"), b"ini").unwrap();
        fs::create_dir_all(source.join("backup/System Volume Information")).unwrap();
        fs::write(source.join("backup/report.pdf"), b"pdf").unwrap();

        let (result, updates) = run(&CopyEngine::default(), &request(&source, &dest, 3));
        let report = result.unwrap();

        assert!(report.is_complete());
        assert_eq!(updates[0].entry_bytes, 3);
        assert!(dest.join("backup/report.pdf").is_file());
        assert!(!dest.join("backup/$RECYCLE.BIN").exists());
        assert!(!dest.join("backup/System Volume Information").exists());
    }
}
