use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};

use crate::context::AppContext;
use crate::core::copy_engine::{CopyEngine, CopyReport, CopyRequest};
use crate::core::error::IngestError;
use crate::core::hardware::{DeviceEvent, HardwareAdapter};
use crate::core::ledger::Ledger;
use crate::core::volume::{DriveKind, MountedVolume};

/// What happened to one removable volume during a scan.
#[derive(Debug)]
pub enum VolumeOutcome {
    /// Copied (fully or partially) and recorded in the ledger.
    Ingested {
        destination: PathBuf,
        report: CopyReport,
    },
    /// Same serial and free space already in the ledger.
    AlreadyIngested,
    /// Identity or capacity could not be read; retried on the next event.
    Skipped(IngestError),
    /// Destination could not be created; nothing copied, nothing recorded.
    CopyAborted(IngestError),
    /// Copied, but the ledger append failed.
    Unrecorded {
        report: CopyReport,
        error: IngestError,
    },
}

#[derive(Debug)]
pub struct ScanSummary {
    pub event: DeviceEvent,
    /// Removable volumes in processing order.
    pub outcomes: Vec<(PathBuf, VolumeOutcome)>,
}

impl ScanSummary {
    pub fn ingested(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, VolumeOutcome::Ingested { .. }))
            .count()
    }
}

pub struct Orchestrator {
    adapter: Arc<dyn HardwareAdapter>,
    ledger: Ledger,
    engine: CopyEngine,
    destination_root: PathBuf,
    tracked: Vec<PathBuf>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, adapter: Arc<dyn HardwareAdapter>) -> Self {
        Self {
            adapter,
            engine: CopyEngine::new(ctx.config.sync_files),
            destination_root: ctx.config.destination_root.clone(),
            ledger: ctx.ledger,
            tracked: Vec::new(),
        }
    }

    /// Run until the device monitor stops or Ctrl-C is received.
    ///
    /// Volumes already attached at startup are picked up by an initial scan.
    pub async fn start(self) -> Result<()> {
        info!(destination = %self.destination_root.display(), "Ingest daemon starting");

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();

        adapter
            .start(tx.clone())
            .context("Failed to initialize device notifications")?;

        let _ = tx.send(DeviceEvent::Arrival).await;
        drop(tx);

        let consumer = tokio::task::spawn_blocking(move || self.consume(rx));

        tokio::select! {
            result = consumer => {
                result.context("Event consumer panicked")?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                adapter.stop();
            }
        }

        Ok(())
    }

    /// Blocking consumption loop: one event at a time, each scan runs to completion.
    pub fn consume(mut self, mut rx: mpsc::Receiver<DeviceEvent>) {
        while let Some(event) = rx.blocking_recv() {
            self.on_device_change_event(event);
        }
        debug!("Device event channel closed");
    }

    /// Rescan all removable volumes and ingest any not yet in the ledger.
    pub fn on_device_change_event(&mut self, event: DeviceEvent) -> ScanSummary {
        info!(?event, "Device change, rescanning volumes");

        let mut summary = ScanSummary {
            event,
            outcomes: Vec::new(),
        };

        let mut volumes = match self.adapter.list_volumes() {
            Ok(volumes) => volumes,
            Err(e) => {
                error!(error = %e, "Failed to enumerate volumes");
                self.tracked.clear();
                return summary;
            }
        };

        volumes.retain(|v| v.kind == DriveKind::Removable);
        volumes.sort_by(|a, b| a.slot.cmp(&b.slot));

        self.tracked = volumes.iter().map(|v| v.root.clone()).collect();
        debug!(count = self.tracked.len(), "Removable volumes present");

        for volume in &volumes {
            let outcome = self.process_volume(volume);
            summary.outcomes.push((volume.root.clone(), outcome));
        }

        summary
    }

    /// Roots of the removable volumes seen by the most recent scan.
    pub fn tracked_volumes(&self) -> &[PathBuf] {
        &self.tracked
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn process_volume(&mut self, volume: &MountedVolume) -> VolumeOutcome {
        let span = info_span!("volume", slot = %volume.slot, root = %volume.root.display());
        let _guard = span.enter();

        let identity = match self.adapter.resolve_identity(&volume.root) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Cannot identify volume, skipping");
                return VolumeOutcome::Skipped(e);
            }
        };

        // Read once: the same snapshot keys the ledger and drives progress.
        let capacity = match self.adapter.query_capacity(&volume.root) {
            Ok(capacity) => capacity,
            Err(e) => {
                warn!(error = %e, "Cannot read volume capacity, skipping");
                return VolumeOutcome::Skipped(e);
            }
        };

        if self.ledger.is_known(&identity.serial, capacity.free_bytes) {
            info!(
                serial = %identity.serial,
                free_bytes = capacity.free_bytes,
                "Volume already ingested"
            );
            return VolumeOutcome::AlreadyIngested;
        }

        let destination = identity.destination_under(&self.destination_root);
        info!(
            label = %identity.label,
            serial = %identity.serial,
            filesystem = %identity.filesystem,
            destination = %destination.display(),
            "Volume qualifies for ingestion"
        );

        let request = CopyRequest {
            source: volume.root.clone(),
            destination: destination.clone(),
            used_bytes: capacity.used_bytes(),
        };

        let report = match self.engine.copy_all(&request, &mut |_| {}) {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Copy aborted");
                return VolumeOutcome::CopyAborted(e);
            }
        };

        match self.ledger.record(&identity.serial, capacity.free_bytes) {
            Ok(entry) => {
                info!(entry = %entry, complete = report.is_complete(), "Volume ingested");
                VolumeOutcome::Ingested {
                    destination,
                    report,
                }
            }
            Err(e) => {
                error!(error = %e, "Volume copied but not recorded; it will be copied again");
                VolumeOutcome::Unrecorded { report, error: e }
            }
        }
    }
}
