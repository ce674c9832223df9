use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::copy_engine::tree_size;
use crate::core::error::IngestError;
use crate::core::hardware::{DeviceEvent, HardwareAdapter};
use crate::core::volume::{CapacitySnapshot, DriveKind, MountedVolume, VolumeIdentity};

const GIB: u64 = 1024 * 1024 * 1024;

/// A directory standing in for a mounted volume.
#[derive(Debug, Clone)]
pub struct SimulatedVolume {
    pub slot: String,
    pub root: PathBuf,
    pub serial: String,
    pub label: String,
    pub filesystem: String,
    pub kind: DriveKind,
    pub total_bytes: u64,
    /// Fixed free space; when None it is derived from the files under `root`.
    pub free_bytes: Option<u64>,
}

impl SimulatedVolume {
    pub fn removable(slot: &str, root: impl Into<PathBuf>, serial: &str) -> Self {
        Self {
            slot: slot.to_string(),
            root: root.into(),
            serial: serial.to_string(),
            label: format!("SIM_{}", serial),
            filesystem: "vfat".to_string(),
            kind: DriveKind::Removable,
            total_bytes: 64 * GIB,
            free_bytes: None,
        }
    }
}

type VolumeTable = Arc<Mutex<BTreeMap<PathBuf, SimulatedVolume>>>;

fn lock(volumes: &VolumeTable) -> MutexGuard<'_, BTreeMap<PathBuf, SimulatedVolume>> {
    volumes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle used by tests and the stdin driver to change the simulated hardware.
#[derive(Clone)]
pub struct Simulator {
    volumes: VolumeTable,
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl Simulator {
    /// Plug a volume in and raise an arrival event.
    pub fn attach(&self, volume: SimulatedVolume) {
        lock(&self.volumes).insert(volume.root.clone(), volume);
        self.notify(DeviceEvent::Arrival);
    }

    /// Unplug the volume mounted at `root` and raise a removal event.
    pub fn detach(&self, root: &Path) {
        lock(&self.volumes).remove(root);
        self.notify(DeviceEvent::Removal);
    }

    /// Pin the free space reported for `root`. Raises no event.
    pub fn set_free_bytes(&self, root: &Path, free_bytes: u64) {
        if let Some(volume) = lock(&self.volumes).get_mut(root) {
            volume.free_bytes = Some(free_bytes);
        }
    }

    pub fn notify(&self, event: DeviceEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct SimulatedAdapter {
    volumes: VolumeTable,
    // Wrapped so `start(&self)` can move the receiver out. Start is only called once.
    event_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>>,
    cancel: CancellationToken,
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let volumes: VolumeTable = Arc::default();

        (
            Self {
                volumes: volumes.clone(),
                event_rx: Arc::new(Mutex::new(Some(rx))),
                cancel: CancellationToken::new(),
            },
            Simulator { volumes, tx },
        )
    }

    fn volume(&self, root: &Path) -> Option<SimulatedVolume> {
        lock(&self.volumes).get(root).cloned()
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn start(&self, daemon_tx: mpsc::Sender<DeviceEvent>) -> anyhow::Result<()> {
        let mut rx = self
            .event_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| anyhow!("simulated monitor already started"))?;

        let cancel = self.cancel.clone();
        info!("Simulated monitor listening for controller commands");

        // Bridge task
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if daemon_tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Simulated monitor stopped");
        });

        Ok(())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_volumes(&self) -> anyhow::Result<Vec<MountedVolume>> {
        Ok(lock(&self.volumes)
            .values()
            .map(|v| MountedVolume {
                slot: v.slot.clone(),
                root: v.root.clone(),
                kind: v.kind,
            })
            .collect())
    }

    fn resolve_identity(&self, root: &Path) -> Result<VolumeIdentity, IngestError> {
        let volume = self
            .volume(root)
            .ok_or_else(|| IngestError::volume_query(root, "no such volume"))?;

        if !root.is_dir() {
            return Err(IngestError::volume_query(root, "no filesystem present"));
        }

        Ok(VolumeIdentity {
            serial: volume.serial,
            label: volume.label,
            filesystem: volume.filesystem,
        })
    }

    fn query_capacity(&self, root: &Path) -> Result<CapacitySnapshot, IngestError> {
        let volume = self
            .volume(root)
            .ok_or_else(|| IngestError::capacity_query(root, "no such volume"))?;

        if !root.is_dir() {
            return Err(IngestError::capacity_query(root, "no filesystem present"));
        }

        let free_bytes = volume
            .free_bytes
            .unwrap_or_else(|| volume.total_bytes.saturating_sub(tree_size(root)));

        CapacitySnapshot::new(root, volume.total_bytes, free_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_capacity_tracks_files_on_volume() {
        let temp = tempdir().unwrap();
        let (adapter, controller) = SimulatedAdapter::new();
        controller.attach(SimulatedVolume::removable("E", temp.path(), "42"));

        let before = adapter.query_capacity(temp.path()).unwrap();
        assert_eq!(before.used_bytes(), 0);

        fs::write(temp.path().join("photo.jpg"), vec![0u8; 1000]).unwrap();
        let after = adapter.query_capacity(temp.path()).unwrap();
        assert_eq!(after.used_bytes(), 1000);
        assert_eq!(after.free_bytes, before.free_bytes - 1000);
    }

    #[test]
    fn test_pinned_free_bytes() {
        let temp = tempdir().unwrap();
        let (adapter, controller) = SimulatedAdapter::new();
        controller.attach(SimulatedVolume::removable("E", temp.path(), "42"));
        controller.set_free_bytes(temp.path(), 500_000);

        let capacity = adapter.query_capacity(temp.path()).unwrap();
        assert_eq!(capacity.free_bytes, 500_000);
    }

    #[test]
    fn test_missing_root_fails_queries() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("unplugged");
        let (adapter, controller) = SimulatedAdapter::new();
        controller.attach(SimulatedVolume::removable("E", &root, "42"));

        assert!(matches!(
            adapter.resolve_identity(&root),
            Err(IngestError::VolumeQuery { .. })
        ));
        assert!(matches!(
            adapter.query_capacity(&root),
            Err(IngestError::CapacityQuery { .. })
        ));
    }

    #[test]
    fn test_detach_removes_volume() {
        let temp = tempdir().unwrap();
        let (adapter, controller) = SimulatedAdapter::new();
        controller.attach(SimulatedVolume::removable("E", temp.path(), "42"));
        assert_eq!(adapter.list_volumes().unwrap().len(), 1);

        controller.detach(temp.path());
        assert!(adapter.list_volumes().unwrap().is_empty());
    }
}
