//! Linux hardware adapter.
//!
//! Volumes come from the mount table; udev supplies drive classification and
//! filesystem identity; `statvfs` supplies capacity. Device changes are read
//! from the udev block subsystem and from mount-table change notifications,
//! since a freshly plugged stick only becomes usable once it is mounted.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;

use anyhow::{Context, anyhow};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::statvfs::statvfs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use udev::EventType;

use crate::core::error::IngestError;
use crate::core::hardware::{DeviceEvent, HardwareAdapter};
use crate::core::volume::{CapacitySnapshot, DriveKind, MountedVolume, VolumeIdentity};

const MOUNTS_PATH: &str = "/proc/self/mounts";

const NETWORK_FILESYSTEMS: &[&str] = &[
    "nfs", "nfs4", "cifs", "smb3", "smbfs", "sshfs", "fuse.sshfs", "9p", "afs", "ceph",
];

#[derive(Debug, Clone)]
pub struct LinuxAdapterConfig {
    /// How long each poll waits before checking for cancellation.
    pub poll_timeout_ms: u16,
}

impl Default for LinuxAdapterConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 500,
        }
    }
}

pub struct LinuxAdapter {
    config: LinuxAdapterConfig,
    cancel: CancellationToken,
}

impl LinuxAdapter {
    pub fn new(config: LinuxAdapterConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LinuxAdapterConfig::default())
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn start(&self, tx: mpsc::Sender<DeviceEvent>) -> anyhow::Result<()> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let cancel = self.cancel.clone();
        let timeout = PollTimeout::from(self.config.poll_timeout_ms);

        thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || monitor_loop(tx, cancel, timeout, ready_tx))
            .context("Failed to spawn device monitor thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("device monitor exited during setup"))?
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn list_volumes(&self) -> anyhow::Result<Vec<MountedVolume>> {
        let contents = fs::read_to_string(MOUNTS_PATH).context("Failed to read mount table")?;

        let mut volumes: Vec<MountedVolume> = Vec::new();
        for mount in parse_mounts(&contents) {
            let kind = if is_network_filesystem(&mount.fs_type) {
                DriveKind::Network
            } else if mount.device.starts_with("/dev/") {
                classify_block_device(&mount.device)
            } else {
                continue;
            };

            let slot = device_sysname(&mount.device).unwrap_or_else(|| mount.device.clone());
            // A device mounted twice is ingested once, from its first mount point
            if volumes.iter().any(|v| v.slot == slot) {
                continue;
            }

            volumes.push(MountedVolume {
                slot,
                root: mount.mount_point,
                kind,
            });
        }

        volumes.sort_by(|a, b| a.slot.cmp(&b.slot));
        Ok(volumes)
    }

    fn resolve_identity(&self, root: &Path) -> Result<VolumeIdentity, IngestError> {
        let contents =
            fs::read_to_string(MOUNTS_PATH).map_err(|e| IngestError::volume_query(root, e))?;
        let mount = find_mount(&parse_mounts(&contents), root)
            .ok_or_else(|| IngestError::volume_query(root, "not a mount point"))?;

        let sysname = device_sysname(&mount.device)
            .ok_or_else(|| IngestError::volume_query(root, "not backed by a block device"))?;
        let device = udev::Device::from_subsystem_sysname("block".to_string(), sysname)
            .map_err(|e| IngestError::volume_query(root, e))?;

        let uuid = property(&device, "ID_FS_UUID")
            .ok_or_else(|| IngestError::volume_query(root, "no filesystem serial number"))?;
        let filesystem = property(&device, "ID_FS_TYPE").unwrap_or(mount.fs_type);

        Ok(VolumeIdentity {
            serial: serial_from_fs_uuid(&uuid),
            label: property(&device, "ID_FS_LABEL").unwrap_or_default(),
            filesystem,
        })
    }

    fn query_capacity(&self, root: &Path) -> Result<CapacitySnapshot, IngestError> {
        let stats = statvfs(root).map_err(|e| IngestError::capacity_query(root, e))?;

        let fragment = stats.fragment_size() as u64;
        let total = (stats.blocks() as u64).saturating_mul(fragment);
        let free = (stats.blocks_free() as u64).saturating_mul(fragment);

        CapacitySnapshot::new(root, total, free)
    }
}

/// Body of the monitor thread. Reports setup success or failure on `ready`.
fn monitor_loop(
    tx: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
    timeout: PollTimeout,
    ready: std_mpsc::SyncSender<anyhow::Result<()>>,
) {
    let setup = udev::MonitorBuilder::new()
        .and_then(|builder| builder.match_subsystem("block"))
        .and_then(|builder| builder.listen())
        .context("Failed to open udev monitor")
        .and_then(|socket| {
            let mounts = File::open(MOUNTS_PATH).context("Failed to open mount table")?;
            Ok((socket, mounts))
        });

    let (socket, mounts) = match setup {
        Ok(handles) => {
            let _ = ready.send(Ok(()));
            handles
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    info!("Device monitor started");

    while !cancel.is_cancelled() {
        let mut fds = [
            PollFd::new(socket.as_fd(), PollFlags::POLLIN),
            PollFd::new(mounts.as_fd(), PollFlags::POLLPRI),
        ];

        match poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!(error = %e, "Device monitor poll failed");
                break;
            }
        }

        let udev_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let mounts_changed = fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLPRI | PollFlags::POLLERR));

        let mut events = Vec::new();
        if udev_ready {
            for event in socket.iter() {
                debug!(
                    action = ?event.event_type(),
                    sysname = %event.sysname().to_string_lossy(),
                    "udev event"
                );
                match event.event_type() {
                    EventType::Add => events.push(DeviceEvent::Arrival),
                    EventType::Remove => events.push(DeviceEvent::Removal),
                    _ => {}
                }
            }
        }
        if mounts_changed {
            debug!("Mount table changed");
            events.push(DeviceEvent::Arrival);
        }

        for event in events {
            if tx.blocking_send(event).is_err() {
                warn!("Event receiver dropped, stopping device monitor");
                return;
            }
        }
    }

    info!("Device monitor stopped");
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MountEntry {
    device: String,
    mount_point: PathBuf,
    fs_type: String,
}

/// Parse `/proc/self/mounts` content.
fn parse_mounts(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            let fs_type = parts.next()?;
            Some(MountEntry {
                device: unescape_mount(device),
                mount_point: PathBuf::from(unescape_mount(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes (`\040` for space, etc.) used in the mount table.
fn unescape_mount(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn find_mount(mounts: &[MountEntry], root: &Path) -> Option<MountEntry> {
    let canonical = fs::canonicalize(root).ok();
    mounts
        .iter()
        .rev()
        .find(|m| m.mount_point == root || Some(&m.mount_point) == canonical.as_ref())
        .cloned()
}

/// Kernel name of the block device behind a `/dev` path (`/dev/mapper/x` -> `dm-0`).
fn device_sysname(device: &str) -> Option<String> {
    let path = Path::new(device);
    let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    resolved
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn is_network_filesystem(fs_type: &str) -> bool {
    NETWORK_FILESYSTEMS.contains(&fs_type)
}

fn classify_block_device(device: &str) -> DriveKind {
    let Some(sysname) = device_sysname(device) else {
        return DriveKind::Unknown;
    };
    let Ok(dev) = udev::Device::from_subsystem_sysname("block".to_string(), sysname) else {
        return DriveKind::Unknown;
    };

    if property(&dev, "ID_CDROM").as_deref() == Some("1") {
        return DriveKind::Optical;
    }
    if property(&dev, "ID_BUS").as_deref() == Some("usb") {
        return DriveKind::Removable;
    }

    let disk = if dev.devtype() == Some(OsStr::new("partition")) {
        match dev.parent_with_subsystem_devtype("block", "disk") {
            Ok(Some(parent)) => parent,
            _ => return DriveKind::Unknown,
        }
    } else {
        dev
    };

    match disk.attribute_value("removable") {
        Some(value) if value == "1" => DriveKind::Removable,
        Some(_) => DriveKind::Fixed,
        None => DriveKind::Unknown,
    }
}

fn property(device: &udev::Device, key: &str) -> Option<String> {
    device
        .property_value(key)
        .map(|value| value.to_string_lossy().into_owned())
        .filter(|value| !value.is_empty())
}

/// Render a filesystem UUID as a volume serial number.
///
/// FAT/exFAT (`1A2B-3C4D`) and NTFS (16 hex digits) UUIDs are the on-disk
/// volume serial and are rendered in decimal. Anything else is kept verbatim.
pub fn serial_from_fs_uuid(uuid: &str) -> String {
    let fat_serial = uuid
        .split_once('-')
        .filter(|(high, low)| high.len() == 4 && low.len() == 4)
        .and_then(|(high, low)| u32::from_str_radix(&format!("{high}{low}"), 16).ok());
    if let Some(serial) = fat_serial {
        return serial.to_string();
    }

    if uuid.len() == 16 {
        if let Ok(serial) = u64::from_str_radix(uuid, 16) {
            return serial.to_string();
        }
    }

    uuid.to_string()
}
