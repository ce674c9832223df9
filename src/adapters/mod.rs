use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::hardware::{DeviceEvent, HardwareAdapter};

#[cfg(target_os = "linux")]
mod linux;
mod simulated;

#[cfg(target_os = "linux")]
pub use linux::{LinuxAdapter, LinuxAdapterConfig, serial_from_fs_uuid};
pub use simulated::{SimulatedAdapter, SimulatedVolume, Simulator};

const SIMULATOR_USAGE: &str =
    "(Simulator) Use: 'add <dir> <serial> [label]', 'rm <dir>', 'free <dir> <bytes>' or 'scan'";

pub fn get_adapter(config: &AppConfig) -> anyhow::Result<Arc<dyn HardwareAdapter>> {
    if config.simulation {
        let (adapter, controller) = SimulatedAdapter::new();

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                run_simulator_command(&controller, &line);
            }
        });

        return Ok(Arc::new(adapter));
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxAdapter::with_defaults()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!("no hardware adapter for this platform; run with --simulation true")
    }
}

/// Apply one line of simulator input.
fn run_simulator_command(controller: &Simulator, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["add", dir, serial, label @ ..] => {
            let mut volume = SimulatedVolume::removable(dir, PathBuf::from(dir), serial);
            if !label.is_empty() {
                volume.label = label.join(" ");
            }
            controller.attach(volume);
        }
        ["rm", dir] => controller.detach(&PathBuf::from(dir)),
        ["free", dir, bytes] => match bytes.parse() {
            Ok(bytes) => controller.set_free_bytes(&PathBuf::from(dir), bytes),
            Err(_) => println!("{}", SIMULATOR_USAGE),
        },
        ["scan"] => controller.notify(DeviceEvent::Arrival),
        _ => println!("{}", SIMULATOR_USAGE),
    }
}
