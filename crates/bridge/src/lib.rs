//! ardu-usb bridge
//!
//! Exposes each attached Arduino Uno R3 as a device file addressed by slot.
//! Reads are single blocking bulk IN transfers; writes are asynchronous bulk
//! OUT transfers whose failures are reported on an event channel.

pub mod config;
pub mod error;
pub mod file;
pub mod service;
pub mod usb;

pub use config::BridgeConfig;
pub use error::{AttachError, LookupError, ReadError, WriteError};
pub use file::DeviceFile;
pub use service::Bridge;
pub use usb::{DeviceHold, DeviceObject, DeviceRegistry, RegistrySettings, ScanSummary, SlotInfo};
