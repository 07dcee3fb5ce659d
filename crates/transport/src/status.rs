//! Transfer status codes
//!
//! Every failure a transport can report for a transfer, with the negative
//! errno each one surfaces as.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const EIO: i32 = 5;
const ENOENT: i32 = 2;
const ENOMEM: i32 = 12;
const EACCES: i32 = 13;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;
const EINVAL: i32 = 22;
const EPIPE: i32 = 32;
const EOVERFLOW: i32 = 75;
const ECONNRESET: i32 = 104;
const ESHUTDOWN: i32 = 108;
const ETIMEDOUT: i32 = 110;

/// Status of a failed or aborted USB transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Endpoint stalled
    #[error("endpoint stalled")]
    Pipe,
    /// Device was disconnected
    #[error("device disconnected")]
    NoDevice,
    /// Device or endpoint not found
    #[error("device or endpoint not found")]
    NotFound,
    /// Device or submission queue busy
    #[error("resource busy")]
    Busy,
    /// Device sent more data than requested
    #[error("buffer overflow")]
    Overflow,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Access denied
    #[error("access denied")]
    Access,
    /// Transport could not allocate for the transfer
    #[error("out of memory")]
    NoMemory,
    /// Transfer was cancelled before completing
    #[error("transfer cancelled")]
    Canceled,
    /// Transfer was unlinked by an endpoint reset
    #[error("connection reset")]
    ConnectionReset,
    /// Endpoint or host controller is shutting down
    #[error("endpoint shut down")]
    Shutdown,
    /// Any other status, as a raw negative errno
    #[error("transport error {0}")]
    Other(i32),
}

impl TransferStatus {
    /// Statuses that occur when a device is torn down with transfers in flight
    ///
    /// Write completions carrying one of these are not reported as failures.
    pub fn is_expected_teardown(&self) -> bool {
        matches!(
            self,
            TransferStatus::Canceled | TransferStatus::ConnectionReset | TransferStatus::Shutdown
        )
    }

    /// Negative errno for this status
    pub fn errno(&self) -> i32 {
        match self {
            TransferStatus::Timeout => -ETIMEDOUT,
            TransferStatus::Pipe => -EPIPE,
            TransferStatus::NoDevice => -ENODEV,
            TransferStatus::NotFound => -ENOENT,
            TransferStatus::Busy => -EBUSY,
            TransferStatus::Overflow => -EOVERFLOW,
            TransferStatus::Io => -EIO,
            TransferStatus::InvalidParam => -EINVAL,
            TransferStatus::Access => -EACCES,
            TransferStatus::NoMemory => -ENOMEM,
            TransferStatus::Canceled => -ENOENT,
            TransferStatus::ConnectionReset => -ECONNRESET,
            TransferStatus::Shutdown => -ESHUTDOWN,
            TransferStatus::Other(code) => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_teardown_statuses() {
        assert!(TransferStatus::Canceled.is_expected_teardown());
        assert!(TransferStatus::ConnectionReset.is_expected_teardown());
        assert!(TransferStatus::Shutdown.is_expected_teardown());

        assert!(!TransferStatus::Timeout.is_expected_teardown());
        assert!(!TransferStatus::Pipe.is_expected_teardown());
        assert!(!TransferStatus::NoDevice.is_expected_teardown());
        assert!(!TransferStatus::Other(-71).is_expected_teardown());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(TransferStatus::Timeout.errno(), -110);
        assert_eq!(TransferStatus::NoDevice.errno(), -19);
        assert_eq!(TransferStatus::NoMemory.errno(), -12);
        assert_eq!(TransferStatus::Other(-71).errno(), -71);
    }

    #[test]
    fn test_display() {
        assert_eq!(TransferStatus::Pipe.to_string(), "endpoint stalled");
        assert!(TransferStatus::Other(-71).to_string().contains("-71"));
    }
}
