//! USB subsystem
//!
//! Device objects, the slot registry, the bulk read and write paths, the
//! libusb transport and the worker thread that tracks hotplug.
//!
//! Blocking libusb calls never run on the Tokio runtime: reads run on the
//! caller's thread, writes on a per-device writer thread, and enumeration on
//! the dedicated worker thread.

pub mod device;
pub mod libusb;
pub mod registry;
pub mod transfers;
pub mod worker;

pub use device::{BulkEndpoints, DeviceHold, DeviceObject};
pub use libusb::{RusbTransport, TransportSettings};
pub use registry::{DeviceRegistry, RegistrySettings, ScanSummary, SlotInfo};
pub use transfers::{CompletionOutcome, bulk_read, bulk_write, classify_completion};
pub use worker::{UsbWorkerThread, WorkerCommand, WorkerHandle, WorkerSettings, spawn_usb_worker};
