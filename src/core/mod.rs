pub mod copy_engine;
pub mod error;
pub mod hardware;
pub mod ledger;
pub mod orchestrator;
pub mod volume;

pub use copy_engine::{CopyEngine, CopyProgress, CopyReport, CopyRequest, EntryFailure};
pub use error::IngestError;
pub use hardware::{DeviceEvent, HardwareAdapter};
pub use ledger::{Ledger, LedgerEntry};
pub use orchestrator::{Orchestrator, ScanSummary, VolumeOutcome};
pub use volume::{CapacitySnapshot, DriveKind, MountedVolume, VolumeIdentity};
