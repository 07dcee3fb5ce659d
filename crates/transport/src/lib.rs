//! Transport adapter interface for ardu-usb
//!
//! This crate defines the boundary between the bulk bridge and whatever USB
//! stack actually moves the bytes. It provides:
//! - Descriptor types reported by enumeration (one per device interface)
//! - Transfer status codes with kernel-style errno mapping
//! - Transfer-owned buffers and completion callbacks for asynchronous bulk OUT
//! - The `UsbTransport` / `BulkDevice` traits implemented by backends
//!
//! # Example
//!
//! ```
//! use transport::{BufferLedger, Completion, OutTransfer, TransferBuffer};
//!
//! let ledger = BufferLedger::default();
//! let mut buffer = TransferBuffer::allocate(4, &ledger).unwrap();
//! buffer.as_mut_slice().copy_from_slice(b"m1,2");
//! assert_eq!(ledger.outstanding(), 1);
//!
//! let transfer = OutTransfer::new(0x04, buffer, Box::new(|completion: Completion| {
//!     assert_eq!(completion.status, Ok(4));
//! }));
//! transfer.complete(Ok(4));
//! assert_eq!(ledger.outstanding(), 0);
//! ```

pub mod adapter;
pub mod status;
pub mod transfer;
pub mod types;

pub use adapter::{BulkDevice, Rejected, UsbTransport};
pub use status::TransferStatus;
pub use transfer::{BufferLedger, Completion, CompletionFn, OutTransfer, TransferBuffer};
pub use types::{
    DeviceDescriptor, DeviceLocation, DeviceMatch, EndpointDescriptor, EndpointDirection, Slot,
    TransferKind,
};
