//! Bridge error types
//!
//! Each error maps to the negative errno a character device would return and
//! converts into `std::io::Error` for the `Read`/`Write` impls.

use std::io;
use thiserror::Error;
use transport::{DeviceMatch, Slot, TransferStatus};

const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const ENODEV: i32 = 19;
const EXFULL: i32 = 54;

/// Why an interface could not be attached
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    /// Vendor/product ID is not the one the bridge binds to
    #[error("device {found} does not match {expected}")]
    NoMatchingDevice {
        expected: DeviceMatch,
        found: DeviceMatch,
    },

    /// The interface lacks a usable bulk IN or bulk OUT endpoint
    #[error("could not find both bulk-in and bulk-out endpoints (in: {has_in}, out: {has_out})")]
    EndpointsNotFound { has_in: bool, has_out: bool },

    /// Input buffer allocation failed
    #[error("out of memory allocating the input buffer")]
    OutOfMemory,

    /// The transport could not open or claim the interface
    #[error("failed to open device: {0}")]
    Open(TransferStatus),

    /// Every slot in the configured range is taken
    #[error("no free slot in {first}..{end}")]
    NoFreeSlot { first: u32, end: u32 },
}

impl AttachError {
    /// Structural problem found while discovering endpoints
    pub fn is_endpoint_discovery_failure(&self) -> bool {
        matches!(self, AttachError::EndpointsNotFound { .. })
    }

    pub fn errno(&self) -> i32 {
        match self {
            AttachError::NoMatchingDevice { .. } => -ENODEV,
            AttachError::EndpointsNotFound { .. } => -ENODEV,
            AttachError::OutOfMemory => -ENOMEM,
            AttachError::Open(status) => status.errno(),
            AttachError::NoFreeSlot { .. } => -EXFULL,
        }
    }
}

/// Lookup of a slot that has no attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no such device: slot {0}")]
    NotFound(Slot),
}

impl LookupError {
    pub fn errno(&self) -> i32 {
        -ENODEV
    }
}

impl From<LookupError> for io::Error {
    fn from(err: LookupError) -> Self {
        io::Error::new(io::ErrorKind::NotFound, err)
    }
}

/// Bulk IN failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The device handle has already been released
    #[error("no such device")]
    NotFound,

    /// Copying the received bytes to the caller failed
    #[error("bad address: could not copy to caller buffer")]
    CopyFault,

    /// Timeout or transport-reported failure
    #[error("bulk read failed: {0}")]
    Transport(TransferStatus),
}

impl ReadError {
    pub fn errno(&self) -> i32 {
        match self {
            ReadError::NotFound => -ENODEV,
            ReadError::CopyFault => -EFAULT,
            ReadError::Transport(status) => status.errno(),
        }
    }
}

impl From<ReadError> for io::Error {
    fn from(err: ReadError) -> Self {
        let kind = match err {
            ReadError::NotFound => io::ErrorKind::NotFound,
            ReadError::CopyFault => io::ErrorKind::InvalidData,
            ReadError::Transport(status) => status_kind(status),
        };
        io::Error::new(kind, err)
    }
}

/// Bulk OUT submission failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The device handle has already been released
    #[error("no such device")]
    NotFound,

    /// Transfer buffer or descriptor allocation failed
    #[error("out of memory")]
    OutOfMemory,

    /// Reading the caller's data failed
    #[error("bad address: could not copy from caller buffer")]
    CopyFault,

    /// The transport refused the submission
    #[error("failed submitting write: {0}")]
    Transport(TransferStatus),
}

impl WriteError {
    pub fn errno(&self) -> i32 {
        match self {
            WriteError::NotFound => -ENODEV,
            WriteError::OutOfMemory => -ENOMEM,
            WriteError::CopyFault => -EFAULT,
            WriteError::Transport(status) => status.errno(),
        }
    }
}

impl From<WriteError> for io::Error {
    fn from(err: WriteError) -> Self {
        let kind = match err {
            WriteError::NotFound => io::ErrorKind::NotFound,
            WriteError::OutOfMemory => io::ErrorKind::OutOfMemory,
            WriteError::CopyFault => io::ErrorKind::InvalidData,
            WriteError::Transport(status) => status_kind(status),
        };
        io::Error::new(kind, err)
    }
}

// Never `Interrupted`: `write_all` and `read_exact` retry that kind forever
fn status_kind(status: TransferStatus) -> io::ErrorKind {
    match status {
        TransferStatus::Timeout => io::ErrorKind::TimedOut,
        TransferStatus::NoDevice | TransferStatus::NotFound => io::ErrorKind::NotConnected,
        TransferStatus::Busy => io::ErrorKind::WouldBlock,
        TransferStatus::Access => io::ErrorKind::PermissionDenied,
        TransferStatus::InvalidParam => io::ErrorKind::InvalidInput,
        TransferStatus::NoMemory => io::ErrorKind::OutOfMemory,
        TransferStatus::Canceled | TransferStatus::Shutdown => io::ErrorKind::BrokenPipe,
        TransferStatus::ConnectionReset => io::ErrorKind::ConnectionReset,
        _ => io::ErrorKind::Other,
    }
}
