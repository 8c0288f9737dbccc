pub mod config;
pub mod device;
pub mod serial;

pub use config::EditorSettings;
pub use device::{DeviceError, DeviceManager, SessionEvent, SlotRegistry};
pub use serial::{FailureKind, SerialError, SimulatedArpmini};

/// Install the process-wide logger. `RUST_LOG` overrides `default_level`.
pub fn init_logging(default_level: log::LevelFilter) {
  let _ = env_logger::Builder::new()
    .filter_level(default_level)
    .parse_default_env()
    .format_timestamp_millis()
    .try_init();
}
