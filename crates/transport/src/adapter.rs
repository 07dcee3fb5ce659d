//! Transport adapter traits
//!
//! Defines what the bridge needs from a USB stack, allowing different
//! implementations (libusb via rusb, mock, etc.).

use crate::status::TransferStatus;
use crate::transfer::OutTransfer;
use crate::types::{DeviceDescriptor, DeviceLocation};
use std::time::Duration;

/// Enumeration and device opening
pub trait UsbTransport: Send + Sync {
    /// Descriptors of every interface currently attached to the host
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransferStatus>;

    /// Open the interface described by `descriptor` for bulk transfers
    ///
    /// Dropping the returned handle releases the interface.
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn BulkDevice>, TransferStatus>;
}

/// An opened device interface
pub trait BulkDevice: Send + Sync {
    fn location(&self) -> DeviceLocation;

    /// Blocking bulk IN transfer of at most `buf.len()` bytes
    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferStatus>;

    /// Queue a bulk OUT transfer without waiting for it
    ///
    /// On success the transfer's completion callback runs exactly once, later
    /// or before this call returns. On failure the transfer is handed back
    /// untouched and its callback never runs.
    fn submit_bulk_out(&self, transfer: OutTransfer) -> Result<(), Rejected>;
}

/// A submission the transport refused
#[derive(Debug)]
pub struct Rejected {
    pub status: TransferStatus,
    pub transfer: OutTransfer,
}

impl Rejected {
    pub fn new(status: TransferStatus, transfer: OutTransfer) -> Self {
        Self { status, transfer }
    }
}
