//! Test utilities for ardu-usb
//!
//! Provides a scriptable mock transport and descriptor helpers for testing
//! across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockTransport, arduino_descriptor};
//! use transport::UsbTransport;
//!
//! let transport = MockTransport::new().with_device(arduino_descriptor(1, 4));
//! assert_eq!(transport.devices().unwrap().len(), 1);
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use transport::{
    BulkDevice, DeviceDescriptor, DeviceLocation, EndpointDescriptor, OutTransfer, Rejected,
    TransferKind, TransferStatus, UsbTransport,
};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Arduino Uno R3 vendor ID
pub const ARDUINO_VID: u16 = 0x2341;
/// Arduino Uno R3 product ID
pub const ARDUINO_PID: u16 = 0x0043;
/// Bulk IN endpoint of the Uno's CDC data interface
pub const ARDUINO_BULK_IN: u8 = 0x83;
/// Bulk OUT endpoint of the Uno's CDC data interface
pub const ARDUINO_BULK_OUT: u8 = 0x04;

/// Create a bulk endpoint descriptor
pub fn bulk_endpoint(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        kind: TransferKind::Bulk,
        max_packet_size,
    }
}

/// Create an interrupt endpoint descriptor
pub fn interrupt_endpoint(address: u8, max_packet_size: u16) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        kind: TransferKind::Interrupt,
        max_packet_size,
    }
}

/// Create a descriptor for an arbitrary interface
pub fn create_mock_descriptor(
    location: DeviceLocation,
    vendor_id: u16,
    product_id: u16,
    endpoints: Vec<EndpointDescriptor>,
) -> DeviceDescriptor {
    DeviceDescriptor {
        location,
        vendor_id,
        product_id,
        endpoints,
    }
}

/// The Uno's CDC data interface (interface 1): bulk OUT 0x04, bulk IN 0x83
pub fn arduino_descriptor(bus: u8, address: u8) -> DeviceDescriptor {
    create_mock_descriptor(
        DeviceLocation::new(bus, address, 1),
        ARDUINO_VID,
        ARDUINO_PID,
        vec![
            bulk_endpoint(ARDUINO_BULK_OUT, 64),
            bulk_endpoint(ARDUINO_BULK_IN, 64),
        ],
    )
}

/// The Uno's CDC communication interface (interface 0): interrupt IN only
pub fn arduino_comm_descriptor(bus: u8, address: u8) -> DeviceDescriptor {
    create_mock_descriptor(
        DeviceLocation::new(bus, address, 0),
        ARDUINO_VID,
        ARDUINO_PID,
        vec![interrupt_endpoint(0x82, 8)],
    )
}

/// Create mock bulk data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared, scriptable state behind a `MockTransport` and its devices
#[derive(Default)]
pub struct MockState {
    reads: Mutex<VecDeque<Result<Vec<u8>, TransferStatus>>>,
    read_requests: Mutex<Vec<usize>>,
    read_delay: Mutex<Option<Duration>>,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
    submit_failures: Mutex<VecDeque<TransferStatus>>,
    open_failures: Mutex<VecDeque<TransferStatus>>,
    deferred: AtomicBool,
    pending: Mutex<Vec<OutTransfer>>,
    written: Mutex<Vec<Vec<u8>>>,
    submits: AtomicUsize,
    opened: AtomicUsize,
    released: AtomicUsize,
}

impl MockState {
    /// Queue data for the next bulk IN transfer
    pub fn push_read(&self, data: impl Into<Vec<u8>>) {
        lock(&self.reads).push_back(Ok(data.into()));
    }

    /// Make the next bulk IN transfer fail
    pub fn push_read_error(&self, status: TransferStatus) {
        lock(&self.reads).push_back(Err(status));
    }

    /// Sleep this long inside every bulk IN transfer
    pub fn set_read_delay(&self, delay: Duration) {
        *lock(&self.read_delay) = Some(delay);
    }

    /// Buffer lengths requested by each bulk IN transfer so far
    pub fn read_requests(&self) -> Vec<usize> {
        lock(&self.read_requests).clone()
    }

    /// Highest number of bulk IN transfers seen running at the same time
    pub fn max_reads_in_flight(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::SeqCst)
    }

    /// Make the next submission be rejected with `status`
    pub fn fail_next_submit(&self, status: TransferStatus) {
        lock(&self.submit_failures).push_back(status);
    }

    /// Make the next `open` fail with `status`
    pub fn fail_next_open(&self, status: TransferStatus) {
        lock(&self.open_failures).push_back(status);
    }

    /// Hold accepted transfers until `complete_pending` instead of completing
    /// them inside `submit_bulk_out`
    pub fn defer_completions(&self, deferred: bool) {
        self.deferred.store(deferred, Ordering::SeqCst);
    }

    /// Number of accepted transfers not yet completed
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Complete every deferred transfer
    ///
    /// `Ok` completions report the full transfer length and record the data as
    /// written. Returns the number of transfers completed.
    pub fn complete_pending(&self, status: Result<(), TransferStatus>) -> usize {
        let pending: Vec<OutTransfer> = lock(&self.pending).drain(..).collect();
        let count = pending.len();

        for transfer in pending {
            match status {
                Ok(()) => {
                    let len = transfer.len();
                    lock(&self.written).push(transfer.data().to_vec());
                    transfer.complete(Ok(len));
                }
                Err(status) => transfer.complete(Err(status)),
            }
        }

        count
    }

    /// Data of every successfully completed OUT transfer, in completion order
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }

    /// Number of `submit_bulk_out` calls, accepted or not
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Number of device handles opened
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of device handles dropped
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// In-memory transport with a mutable device list
pub struct MockTransport {
    devices: Mutex<Vec<DeviceDescriptor>>,
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            state: Arc::new(MockState::default()),
        }
    }

    /// Builder form of `plug`
    pub fn with_device(self, descriptor: DeviceDescriptor) -> Self {
        self.plug(descriptor);
        self
    }

    /// Make an interface visible to enumeration
    pub fn plug(&self, descriptor: DeviceDescriptor) {
        lock(&self.devices).push(descriptor);
    }

    /// Remove every interface of the device at `location`
    pub fn unplug(&self, location: DeviceLocation) {
        lock(&self.devices).retain(|d| !d.location.same_device(&location));
    }

    /// Scripting handle shared with every device this transport opens
    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransferStatus> {
        Ok(lock(&self.devices).clone())
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn BulkDevice>, TransferStatus> {
        if let Some(status) = lock(&self.state.open_failures).pop_front() {
            return Err(status);
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDevice {
            location: descriptor.location,
            state: self.state.clone(),
        }))
    }
}

/// Device handle produced by `MockTransport::open`
pub struct MockDevice {
    location: DeviceLocation,
    state: Arc<MockState>,
}

impl BulkDevice for MockDevice {
    fn location(&self) -> DeviceLocation {
        self.location
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransferStatus> {
        lock(&self.state.read_requests).push(buf.len());

        let in_flight = self.state.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_reads_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let delay = *lock(&self.state.read_delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let result = match lock(&self.state.reads).pop_front() {
            Some(Ok(data)) if data.len() > buf.len() => Err(TransferStatus::Overflow),
            Some(Ok(data)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Some(Err(status)) => Err(status),
            None => Err(TransferStatus::Timeout),
        };

        self.state.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn submit_bulk_out(&self, transfer: OutTransfer) -> Result<(), Rejected> {
        self.state.submits.fetch_add(1, Ordering::SeqCst);

        if let Some(status) = lock(&self.state.submit_failures).pop_front() {
            return Err(Rejected::new(status, transfer));
        }

        if self.state.deferred.load(Ordering::SeqCst) {
            lock(&self.state.pending).push(transfer);
        } else {
            let len = transfer.len();
            lock(&self.state.written).push(transfer.data().to_vec());
            transfer.complete(Ok(len));
        }

        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Run an async operation with a timeout
///
/// # Example
/// ```no_run
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::{BufferLedger, TransferBuffer};

    #[test]
    fn test_arduino_descriptor_layout() {
        let descriptor = arduino_descriptor(1, 4);
        assert_eq!(descriptor.vendor_id, ARDUINO_VID);
        assert_eq!(
            descriptor.first_bulk_in().map(|ep| ep.address),
            Some(ARDUINO_BULK_IN)
        );
        assert_eq!(
            descriptor.first_bulk_out().map(|ep| ep.address),
            Some(ARDUINO_BULK_OUT)
        );
        assert!(arduino_comm_descriptor(1, 4).first_bulk_in().is_none());
    }

    #[test]
    fn test_unplug_removes_all_interfaces() {
        let transport = MockTransport::new()
            .with_device(arduino_comm_descriptor(1, 4))
            .with_device(arduino_descriptor(1, 4))
            .with_device(arduino_descriptor(1, 5));

        transport.unplug(DeviceLocation::new(1, 4, 0));

        let remaining = transport.devices().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].location.address, 5);
    }

    #[test]
    fn test_mock_read_script() {
        let transport = MockTransport::new();
        let device = transport.open(&arduino_descriptor(1, 4)).unwrap();
        let state = transport.state();
        state.push_read(b"ok\n".to_vec());

        let mut buf = [0u8; 8];
        assert_eq!(device.read_bulk(0x83, &mut buf, DEFAULT_TEST_TIMEOUT), Ok(3));
        assert_eq!(&buf[..3], b"ok\n");
        assert_eq!(
            device.read_bulk(0x83, &mut buf, DEFAULT_TEST_TIMEOUT),
            Err(TransferStatus::Timeout)
        );
        assert_eq!(state.read_requests(), vec![8, 8]);

        drop(device);
        assert_eq!(state.released(), 1);
    }

    #[test]
    fn test_mock_deferred_completion() {
        let transport = MockTransport::new();
        let device = transport.open(&arduino_descriptor(1, 4)).unwrap();
        let state = transport.state();
        state.defer_completions(true);

        let ledger = BufferLedger::new();
        let buffer = TransferBuffer::allocate(2, &ledger).unwrap();
        device
            .submit_bulk_out(OutTransfer::new(0x04, buffer, Box::new(|_| {})))
            .unwrap();
        assert_eq!(state.pending_count(), 1);
        assert_eq!(ledger.outstanding(), 1);

        assert_eq!(state.complete_pending(Ok(())), 1);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(state.written(), vec![vec![0u8, 0u8]]);
    }
}
