use std::path::Path;

use tokio::sync::mpsc;

use super::error::IngestError;
use super::volume::{CapacitySnapshot, MountedVolume, VolumeIdentity};

/// Device-change notifications delivered to the orchestrator.
///
/// Both kinds currently trigger the same full rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Arrival,
    Removal,
}

pub trait HardwareAdapter: Send + Sync {
    /// Start listening for device changes.
    /// Spawns internal tasks that send events to the provided channel. An error
    /// means the notification plumbing could not be set up.
    fn start(&self, event_sender: mpsc::Sender<DeviceEvent>) -> anyhow::Result<()>;

    /// Stop the monitor gracefully.
    fn stop(&self);

    /// List every volume currently mounted, whatever its kind.
    fn list_volumes(&self) -> anyhow::Result<Vec<MountedVolume>>;

    /// Read serial number, label and filesystem name for a volume root.
    fn resolve_identity(&self, root: &Path) -> Result<VolumeIdentity, IngestError>;

    /// Read total and free bytes for a volume root.
    fn query_capacity(&self, root: &Path) -> Result<CapacitySnapshot, IngestError>;
}
