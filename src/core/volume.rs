use std::path::{Path, PathBuf};

use super::error::IngestError;

/// Identity of a mounted volume as reported by the OS.
///
/// Only `serial` is ever persisted (in the ledger).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeIdentity {
    pub serial: String,
    pub label: String,
    pub filesystem: String,
}

impl VolumeIdentity {
    /// Name of the per-volume folder under the destination root: `<label>(<serial>)`.
    ///
    /// Path separators in the label are replaced so the result is always a
    /// single path component.
    pub fn folder_name(&self) -> String {
        let label: String = self
            .label
            .trim()
            .chars()
            .map(|c| if std::path::is_separator(c) || c == '\0' { '_' } else { c })
            .collect();
        format!("{}({})", label, self.serial)
    }

    pub fn destination_under(&self, root: &Path) -> PathBuf {
        root.join(self.folder_name())
    }
}

/// Total and free bytes of a volume at a single point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl CapacitySnapshot {
    /// Build a snapshot, rejecting readings where free space exceeds the total.
    pub fn new(root: &Path, total_bytes: u64, free_bytes: u64) -> Result<Self, IngestError> {
        if free_bytes > total_bytes {
            return Err(IngestError::capacity_query(
                root,
                format!("free bytes ({free_bytes}) exceed total bytes ({total_bytes})"),
            ));
        }
        Ok(Self {
            total_bytes,
            free_bytes,
        })
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes - self.free_bytes
    }
}

/// How the host classifies the device backing a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    Removable,
    Fixed,
    Network,
    Optical,
    Unknown,
}

/// A volume currently presented by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedVolume {
    /// Enumeration order key (drive letter, or kernel device name on Linux).
    pub slot: String,
    pub root: PathBuf,
    pub kind: DriveKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(label: &str, serial: &str) -> VolumeIdentity {
        VolumeIdentity {
            serial: serial.to_string(),
            label: label.to_string(),
            filesystem: "vfat".to_string(),
        }
    }

    #[test]
    fn folder_name_combines_label_and_serial() {
        assert_eq!(identity("CAMERA", "12345").folder_name(), "CAMERA(12345)");
    }

    #[test]
    fn folder_name_with_empty_label() {
        assert_eq!(identity("", "777").folder_name(), "(777)");
    }

    #[test]
    fn folder_name_strips_separators() {
        let name = identity("a/b", "1").folder_name();
        assert_eq!(name, "a_b(1)");

        let dest = identity("a/b", "1").destination_under(Path::new("/srv/ingest"));
        assert_eq!(dest.file_name().unwrap(), "a_b(1)");
        assert_eq!(dest.parent().unwrap(), Path::new("/srv/ingest"));
    }

    #[test]
    fn capacity_rejects_free_above_total() {
        let result = CapacitySnapshot::new(Path::new("/mnt/x"), 10, 11);
        assert!(matches!(result, Err(IngestError::CapacityQuery { .. })));
    }

    #[test]
    fn capacity_used_bytes() {
        let snap = CapacitySnapshot::new(Path::new("/mnt/x"), 1000, 400).unwrap();
        assert_eq!(snap.used_bytes(), 600);

        let empty = CapacitySnapshot::new(Path::new("/mnt/x"), 0, 0).unwrap();
        assert_eq!(empty.used_bytes(), 0);
    }
}
