//! Bulk transfer paths
//!
//! Reads are synchronous: one blocking bulk IN transfer into the device's
//! input buffer, then a copy to the caller. Writes are asynchronous: the
//! caller's data is copied into a transfer-owned buffer that is submitted and
//! handed to the completion callback, which releases it.

use crate::error::{ReadError, WriteError};
use crate::usb::device::DeviceObject;
use common::{BridgeEvent, EventSink};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace, warn};
use transport::{
    Completion, CompletionFn, OutTransfer, Rejected, Slot, TransferBuffer, TransferStatus,
};

/// Default timeout for bulk IN transfers (10 seconds)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Read at most `max_len` bytes from the device's bulk IN endpoint into `sink`
///
/// Requests `min(input buffer size, max_len)` bytes in a single transfer and
/// never aggregates packets. Returns the number of bytes received and copied.
pub fn bulk_read<W: Write + ?Sized>(
    device: &DeviceObject,
    sink: &mut W,
    max_len: usize,
) -> Result<usize, ReadError> {
    if max_len == 0 {
        return Ok(0);
    }

    let handle = device.handle();
    let handle = handle.as_deref().ok_or(ReadError::NotFound)?;

    let mut buffer = device.input_buffer();
    let request = buffer.len().min(max_len);

    trace!(
        "{}: bulk read endpoint={:#x}, len={}, timeout={}ms",
        device.name(),
        device.input_endpoint(),
        request,
        device.read_timeout().as_millis()
    );

    let received = handle
        .read_bulk(
            device.input_endpoint(),
            &mut buffer[..request],
            device.read_timeout(),
        )
        .map_err(|status| {
            debug!("{}: error reading: {}", device.name(), status);
            ReadError::Transport(status)
        })?
        .min(request);

    sink.write_all(&buffer[..received]).map_err(|e| {
        warn!("{}: copy to caller failed: {}", device.name(), e);
        ReadError::CopyFault
    })?;

    debug!("{}: read {} bytes", device.name(), received);
    Ok(received)
}

/// Submit `len` bytes taken from `source` as one bulk OUT transfer
///
/// Returns once the transport has accepted the transfer, reporting the full
/// length. A zero length is a no-op that never touches the transport. On any
/// error nothing has been written and the transfer buffer has been released.
pub fn bulk_write<R: Read + ?Sized>(
    device: &DeviceObject,
    source: &mut R,
    len: usize,
) -> Result<usize, WriteError> {
    if len == 0 {
        return Ok(0);
    }

    let handle = device.handle();
    let handle = handle.as_deref().ok_or(WriteError::NotFound)?;

    let mut buffer =
        TransferBuffer::allocate(len, device.ledger()).map_err(|_| WriteError::OutOfMemory)?;

    source.read_exact(buffer.as_mut_slice()).map_err(|e| {
        warn!("{}: copy from caller failed: {}", device.name(), e);
        WriteError::CopyFault
    })?;

    let transfer = OutTransfer::new(
        device.output_endpoint(),
        buffer,
        completion_handler(
            device.slot(),
            device.name().to_string(),
            device.output_endpoint(),
            device.events().clone(),
        ),
    );

    if let Err(Rejected { status, transfer }) = handle.submit_bulk_out(transfer) {
        drop(transfer);
        warn!(
            "{}: failed submitting write of {} bytes: {}",
            device.name(),
            len,
            status
        );
        return Err(match status {
            TransferStatus::NoMemory => WriteError::OutOfMemory,
            status => WriteError::Transport(status),
        });
    }

    debug!("{}: queued write of {} bytes", device.name(), len);
    Ok(len)
}

/// What a finished OUT transfer means for the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Sent; carries the byte count
    Delivered(usize),
    /// Cancelled, reset or shut down during teardown; not a failure
    ExpectedTeardown(TransferStatus),
    /// Genuine failure, reported out-of-band
    Failed(TransferStatus),
}

pub fn classify_completion(status: Result<usize, TransferStatus>) -> CompletionOutcome {
    match status {
        Ok(sent) => CompletionOutcome::Delivered(sent),
        Err(status) if status.is_expected_teardown() => {
            CompletionOutcome::ExpectedTeardown(status)
        }
        Err(status) => CompletionOutcome::Failed(status),
    }
}

/// Build the completion callback for one OUT transfer
///
/// Runs in the transport's completion context: it only releases the buffer,
/// inspects the status, logs and publishes without blocking.
fn completion_handler(slot: Slot, name: String, endpoint: u8, events: EventSink) -> CompletionFn {
    Box::new(move |completion: Completion| {
        let Completion { status, buffer } = completion;
        let len = buffer.len();
        drop(buffer);

        match classify_completion(status) {
            CompletionOutcome::Delivered(sent) => {
                trace!("{}: write completed, {}/{} bytes", name, sent, len);
            }
            CompletionOutcome::ExpectedTeardown(status) => {
                trace!("{}: write ended by teardown: {}", name, status);
            }
            CompletionOutcome::Failed(status) => {
                warn!(
                    "{}: nonzero write bulk status received: {} ({})",
                    name,
                    status,
                    status.errno()
                );
                events.notify(BridgeEvent::WriteFailed {
                    slot,
                    endpoint,
                    len,
                    status,
                });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::device::{BulkEndpoints, allocate_input_buffer};
    use common::create_event_channel;
    use common::test_utils::{MockState, MockTransport, arduino_descriptor};
    use std::io;
    use std::sync::Arc;
    use transport::UsbTransport;

    fn make_device(events: EventSink) -> (Arc<DeviceObject>, Arc<MockState>) {
        let transport = MockTransport::new();
        let descriptor = arduino_descriptor(1, 4);
        let endpoints = BulkEndpoints::discover(&descriptor).unwrap();
        let device = DeviceObject::new(
            Slot(192),
            "ttyardu192".to_string(),
            endpoints,
            allocate_input_buffer(endpoints.input_max_packet).unwrap(),
            transport.open(&descriptor).unwrap(),
            DEFAULT_READ_TIMEOUT,
            events,
        );
        (device, transport.state())
    }

    struct FaultySink;

    impl Write for FaultySink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("unmapped page"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FaultySource;

    impl Read for FaultySource {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("unmapped page"))
        }
    }

    #[test]
    fn test_read_clamps_to_buffer_size() {
        let (device, state) = make_device(EventSink::disconnected());
        state.push_read(vec![0xAA; 64]);

        let mut out = Vec::new();
        assert_eq!(bulk_read(&device, &mut out, 4096), Ok(64));
        assert_eq!(out.len(), 64);
        assert_eq!(state.read_requests(), vec![64]);
    }

    #[test]
    fn test_read_clamps_to_requested_len() {
        let (device, state) = make_device(EventSink::disconnected());
        state.push_read(b"ok".to_vec());

        let mut out = Vec::new();
        assert_eq!(bulk_read(&device, &mut out, 5), Ok(2));
        assert_eq!(out, b"ok");
        assert_eq!(state.read_requests(), vec![5]);
    }

    #[test]
    fn test_zero_length_read_skips_transport() {
        let (device, state) = make_device(EventSink::disconnected());
        let mut out = Vec::new();
        assert_eq!(bulk_read(&device, &mut out, 0), Ok(0));
        assert!(state.read_requests().is_empty());
    }

    #[test]
    fn test_read_timeout_is_transport_error() {
        let (device, state) = make_device(EventSink::disconnected());
        state.push_read_error(TransferStatus::Timeout);

        let mut out = Vec::new();
        assert_eq!(
            bulk_read(&device, &mut out, 16),
            Err(ReadError::Transport(TransferStatus::Timeout))
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_read_copy_fault_is_not_retried() {
        let (device, state) = make_device(EventSink::disconnected());
        state.push_read(b"data".to_vec());
        state.push_read(b"more".to_vec());

        assert_eq!(
            bulk_read(&device, &mut FaultySink, 16),
            Err(ReadError::CopyFault)
        );
        assert_eq!(state.read_requests().len(), 1);
    }

    #[test]
    fn test_zero_length_write_skips_transport() {
        let (device, state) = make_device(EventSink::disconnected());
        assert_eq!(bulk_write(&device, &mut &b""[..], 0), Ok(0));
        assert_eq!(state.submit_count(), 0);
        assert_eq!(device.outstanding_writes(), 0);
    }

    #[test]
    fn test_write_reports_full_length_on_acceptance() {
        let (device, state) = make_device(EventSink::disconnected());
        state.defer_completions(true);

        assert_eq!(bulk_write(&device, &mut &b"m10,20\n"[..], 7), Ok(7));
        assert_eq!(state.pending_count(), 1);
        assert_eq!(device.outstanding_writes(), 1);

        state.complete_pending(Ok(()));
        assert_eq!(device.outstanding_writes(), 0);
        assert_eq!(state.written(), vec![b"m10,20\n".to_vec()]);
    }

    #[test]
    fn test_submit_failure_releases_buffer() {
        let (device, state) = make_device(EventSink::disconnected());
        state.fail_next_submit(TransferStatus::NoDevice);

        assert_eq!(
            bulk_write(&device, &mut &b"p\n"[..], 2),
            Err(WriteError::Transport(TransferStatus::NoDevice))
        );
        assert_eq!(device.outstanding_writes(), 0);
        assert!(state.written().is_empty());

        state.fail_next_submit(TransferStatus::NoMemory);
        assert_eq!(
            bulk_write(&device, &mut &b"p\n"[..], 2),
            Err(WriteError::OutOfMemory)
        );
        assert_eq!(device.outstanding_writes(), 0);
    }

    #[test]
    fn test_write_copy_fault_releases_buffer() {
        let (device, state) = make_device(EventSink::disconnected());
        assert_eq!(
            bulk_write(&device, &mut FaultySource, 8),
            Err(WriteError::CopyFault)
        );
        assert_eq!(state.submit_count(), 0);
        assert_eq!(device.outstanding_writes(), 0);
    }

    #[test]
    fn test_short_source_is_copy_fault() {
        let (device, _state) = make_device(EventSink::disconnected());
        assert_eq!(
            bulk_write(&device, &mut &b"ab"[..], 4),
            Err(WriteError::CopyFault)
        );
    }

    #[test]
    fn test_oversized_write_is_out_of_memory() {
        let (device, state) = make_device(EventSink::disconnected());
        assert_eq!(
            bulk_write(&device, &mut &b""[..], usize::MAX),
            Err(WriteError::OutOfMemory)
        );
        assert_eq!(state.submit_count(), 0);
    }

    #[test]
    fn test_failed_completion_is_reported_out_of_band() {
        let (sink, stream) = create_event_channel(8);
        let (device, state) = make_device(sink);
        state.defer_completions(true);

        bulk_write(&device, &mut &b"d\n"[..], 2).unwrap();
        bulk_write(&device, &mut &b"p\n"[..], 2).unwrap();

        // Stall: reported
        assert_eq!(state.complete_pending(Err(TransferStatus::Pipe)), 2);
        assert_eq!(device.outstanding_writes(), 0);

        let events = stream.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| *event
            == BridgeEvent::WriteFailed {
                slot: Slot(192),
                endpoint: 0x04,
                len: 2,
                status: TransferStatus::Pipe,
            }));
    }

    #[test]
    fn test_teardown_completion_is_suppressed() {
        let (sink, stream) = create_event_channel(8);
        let (device, state) = make_device(sink);
        state.defer_completions(true);

        for status in [
            TransferStatus::Canceled,
            TransferStatus::ConnectionReset,
            TransferStatus::Shutdown,
        ] {
            bulk_write(&device, &mut &b"x"[..], 1).unwrap();
            state.complete_pending(Err(status));
        }

        assert_eq!(device.outstanding_writes(), 0);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_classify_completion() {
        assert_eq!(
            classify_completion(Ok(8)),
            CompletionOutcome::Delivered(8)
        );
        assert_eq!(
            classify_completion(Err(TransferStatus::Shutdown)),
            CompletionOutcome::ExpectedTeardown(TransferStatus::Shutdown)
        );
        assert_eq!(
            classify_completion(Err(TransferStatus::Timeout)),
            CompletionOutcome::Failed(TransferStatus::Timeout)
        );
    }
}
