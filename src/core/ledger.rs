//! Append-only record of volumes that have already been ingested.
//!
//! Each line is `<serial>|<free bytes>`. A volume counts as ingested when the
//! same serial was logged with exactly the same free-space figure, so any change
//! in free space (new files written to the volume, or anything else) makes the
//! next scan copy it again.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::IngestError;

const SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub serial: String,
    pub free_bytes: u64,
}

impl LedgerEntry {
    /// Parse one ledger line. Returns None for blank or malformed lines.
    pub fn parse(line: &str) -> Option<Self> {
        let (serial, free) = line.trim_end_matches(['\r', '\n']).split_once(SEPARATOR)?;
        if serial.is_empty() {
            return None;
        }
        let free_bytes = free.trim().parse().ok()?;
        Some(Self {
            serial: serial.to_string(),
            free_bytes,
        })
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.serial, SEPARATOR, self.free_bytes)
    }
}

pub struct Ledger {
    path: PathBuf,
    /// Append handle opened at startup; reopened lazily if that failed.
    writer: Option<File>,
}

impl Ledger {
    /// Open the ledger at `path` for appending.
    ///
    /// Never fails: if the file cannot be opened now, the error is logged and
    /// `record` will retry (and report `LedgerWrite` if it still cannot).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let writer = match open_append(&path) {
            Ok(file) => {
                info!(path = %path.display(), "Ledger opened");
                Some(file)
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Ledger could not be opened for appending"
                );
                None
            }
        };
        Self { path, writer }
    }

    /// A ledger at `path` with no handle open yet; nothing touches the file
    /// until the first `record`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if an entry with this serial and exactly this free-byte count exists.
    ///
    /// An unreadable ledger is treated as "not known" so the volume gets copied.
    pub fn is_known(&self, serial: &str, free_bytes: u64) -> bool {
        match self.contains(serial, free_bytes) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Ledger unreadable, treating volume as not yet ingested");
                false
            }
        }
    }

    fn contains(&self, serial: &str, free_bytes: u64) -> Result<bool, IngestError> {
        Ok(self
            .read_entries()?
            .iter()
            .any(|entry| entry.serial == serial && entry.free_bytes == free_bytes))
    }

    /// Parse every line of the file, skipping blank, malformed and
    /// undecodable ones. A missing file has no entries.
    fn read_entries(&self) -> Result<Vec<LedgerEntry>, IngestError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.read_error(e)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).split(b'\n') {
            let bytes = line.map_err(|e| self.read_error(e))?;
            let Ok(line) = std::str::from_utf8(&bytes) else {
                debug!(len = bytes.len(), "Ignoring undecodable ledger line");
                continue;
            };
            match LedgerEntry::parse(line) {
                Some(entry) => entries.push(entry),
                None if line.trim().is_empty() => {}
                None => debug!(line = %line, "Ignoring malformed ledger line"),
            }
        }
        Ok(entries)
    }

    /// Append an entry and sync it to disk before returning.
    pub fn record(&mut self, serial: &str, free_bytes: u64) -> Result<LedgerEntry, IngestError> {
        let entry = LedgerEntry {
            serial: serial.to_string(),
            free_bytes,
        };

        let mut file = match self.writer.take() {
            Some(file) => file,
            None => open_append(&self.path).map_err(|e| self.write_error(e))?,
        };

        // One write per entry. On failure the handle is dropped so the next
        // record reopens the file and terminates any torn line first.
        let line = format!("{entry}\n");
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data())
            .map_err(|e| self.write_error(e))?;

        self.writer = Some(file);
        debug!(entry = %entry, "Ledger entry recorded");
        Ok(entry)
    }

    /// All well-formed entries, in insertion order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, IngestError> {
        self.read_entries()
    }

    fn read_error(&self, source: io::Error) -> IngestError {
        IngestError::LedgerRead {
            path: self.path.clone(),
            source,
        }
    }

    fn write_error(&self, source: io::Error) -> IngestError {
        IngestError::LedgerWrite {
            path: self.path.clone(),
            source,
        }
    }
}

/// Open for appending. If the last line was left unterminated, end it first
/// so the next entry starts on a line of its own.
fn open_append(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !ends_with_newline(path)? {
        file.write_all(b"\n")?;
    }
    Ok(file)
}

fn ends_with_newline(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}
