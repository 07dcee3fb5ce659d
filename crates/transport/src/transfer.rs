//! Transfer-owned buffers and asynchronous OUT transfers
//!
//! A bulk OUT transfer owns its data buffer from submission until the
//! completion callback runs. The callback receives the buffer back and drops
//! it, which is the only place a submitted buffer is released.

use crate::status::TransferStatus;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts transfer buffers that are allocated and not yet released
#[derive(Debug, Clone, Default)]
pub struct BufferLedger {
    outstanding: Arc<AtomicUsize>,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buffers charged to this ledger
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Heap buffer owned by one OUT transfer
pub struct TransferBuffer {
    data: Vec<u8>,
    ledger: BufferLedger,
}

impl TransferBuffer {
    /// Allocate a zeroed buffer of exactly `len` bytes
    ///
    /// Allocation failure is reported as `TransferStatus::NoMemory` instead of
    /// aborting the process.
    pub fn allocate(len: usize, ledger: &BufferLedger) -> Result<Self, TransferStatus> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| TransferStatus::NoMemory)?;
        data.resize(len, 0);

        ledger.outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            data,
            ledger: ledger.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for TransferBuffer {
    fn drop(&mut self) {
        self.ledger.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for TransferBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Result of a finished OUT transfer, handed to its completion callback
#[derive(Debug)]
pub struct Completion {
    /// Bytes actually sent, or the failure status
    pub status: Result<usize, TransferStatus>,
    /// The transfer buffer; dropping it releases it
    pub buffer: TransferBuffer,
}

/// Completion callback
///
/// Runs in the transport's completion context, which must never block.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send + 'static>;

/// A bulk OUT transfer waiting to be submitted or completed
pub struct OutTransfer {
    endpoint: u8,
    buffer: TransferBuffer,
    on_complete: CompletionFn,
}

impl OutTransfer {
    pub fn new(endpoint: u8, buffer: TransferBuffer, on_complete: CompletionFn) -> Self {
        Self {
            endpoint,
            buffer,
            on_complete,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Finish the transfer and hand the buffer to the completion callback
    pub fn complete(self, status: Result<usize, TransferStatus>) {
        let OutTransfer {
            buffer,
            on_complete,
            ..
        } = self;
        on_complete(Completion { status, buffer });
    }
}

impl fmt::Debug for OutTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutTransfer")
            .field("endpoint", &format_args!("{:#04x}", self.endpoint))
            .field("len", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_ledger_tracks_allocation_and_drop() {
        let ledger = BufferLedger::new();
        let a = TransferBuffer::allocate(8, &ledger).unwrap();
        let b = TransferBuffer::allocate(16, &ledger).unwrap();
        assert_eq!(ledger.outstanding(), 2);
        assert_eq!(a.len(), 8);
        assert!(b.as_slice().iter().all(|&byte| byte == 0));

        drop(a);
        assert_eq!(ledger.outstanding(), 1);
        drop(b);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_oversized_allocation_reports_no_memory() {
        let ledger = BufferLedger::new();
        let result = TransferBuffer::allocate(usize::MAX, &ledger);
        assert_eq!(result.unwrap_err(), TransferStatus::NoMemory);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_complete_passes_buffer_and_status() {
        let ledger = BufferLedger::new();
        let mut buffer = TransferBuffer::allocate(3, &ledger).unwrap();
        buffer.as_mut_slice().copy_from_slice(b"p\n\0");

        let seen = std::sync::Arc::new(Mutex::new(None));
        let seen_in_callback = seen.clone();
        let transfer = OutTransfer::new(
            0x04,
            buffer,
            Box::new(move |completion: Completion| {
                *seen_in_callback.lock().unwrap() =
                    Some((completion.status, completion.buffer.as_slice().to_vec()));
            }),
        );
        assert_eq!(transfer.endpoint(), 0x04);
        assert_eq!(transfer.len(), 3);

        transfer.complete(Err(TransferStatus::Pipe));

        let (status, data) = seen.lock().unwrap().take().unwrap();
        assert_eq!(status, Err(TransferStatus::Pipe));
        assert_eq!(data, b"p\n\0");
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_dropping_uncompleted_transfer_releases_buffer() {
        let ledger = BufferLedger::new();
        let buffer = TransferBuffer::allocate(2, &ledger).unwrap();
        let transfer = OutTransfer::new(0x04, buffer, Box::new(|_| {}));
        assert_eq!(ledger.outstanding(), 1);

        drop(transfer);
        assert_eq!(ledger.outstanding(), 0);
    }
}
