//! Device object and holds
//!
//! A `DeviceObject` is the per-interface state shared by the registry and every
//! caller that opened it. Its lifetime is governed by an explicit atomic
//! reference count:
//! - the registry owns one hold from attach until detach
//! - every successful open owns one hold until close
//!
//! When the count drops to zero the object is destroyed: the transport handle
//! is dropped (releasing the interface) and the input buffer is freed. This
//! happens exactly once, on whichever release comes last.

use crate::error::AttachError;
use common::{BridgeEvent, EventSink};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, error, info};
use transport::{BufferLedger, BulkDevice, DeviceDescriptor, DeviceLocation, Slot};

/// Mask for the packet size bits of wMaxPacketSize
const MAX_PACKET_SIZE_MASK: u16 = 0x07ff;

/// Bulk endpoint pair selected from an interface descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    /// Address of the first bulk IN endpoint
    pub input: u8,
    /// Address of the first bulk OUT endpoint
    pub output: u8,
    /// Max packet size of the bulk IN endpoint
    pub input_max_packet: usize,
}

impl BulkEndpoints {
    /// Select the first bulk IN and first bulk OUT endpoint
    ///
    /// Both addresses must be non-zero and the IN endpoint must report a
    /// non-zero packet size.
    pub fn discover(descriptor: &DeviceDescriptor) -> Result<Self, AttachError> {
        let input = descriptor
            .first_bulk_in()
            .filter(|ep| ep.address != 0 && ep.max_packet_size & MAX_PACKET_SIZE_MASK != 0);
        let output = descriptor.first_bulk_out().filter(|ep| ep.address != 0);

        match (input, output) {
            (Some(input), Some(output)) => Ok(Self {
                input: input.address,
                output: output.address,
                input_max_packet: usize::from(input.max_packet_size & MAX_PACKET_SIZE_MASK),
            }),
            (input, output) => Err(AttachError::EndpointsNotFound {
                has_in: input.is_some(),
                has_out: output.is_some(),
            }),
        }
    }
}

/// Allocate the input buffer without aborting on allocation failure
pub(crate) fn allocate_input_buffer(len: usize) -> Result<Vec<u8>, AttachError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| AttachError::OutOfMemory)?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// State of one attached interface
pub struct DeviceObject {
    slot: Slot,
    name: String,
    location: DeviceLocation,
    endpoints: BulkEndpoints,
    read_timeout: Duration,
    /// Transport handle; `None` once destroyed
    handle: RwLock<Option<Box<dyn BulkDevice>>>,
    /// Reused by every read; length fixed at creation
    input_buffer: Mutex<Vec<u8>>,
    ref_count: AtomicUsize,
    destroyed: AtomicBool,
    ledger: BufferLedger,
    events: EventSink,
}

impl DeviceObject {
    /// Create a device object holding one reference (the registry's)
    pub(crate) fn new(
        slot: Slot,
        name: String,
        endpoints: BulkEndpoints,
        input_buffer: Vec<u8>,
        handle: Box<dyn BulkDevice>,
        read_timeout: Duration,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            slot,
            name,
            location: handle.location(),
            endpoints,
            read_timeout,
            handle: RwLock::new(Some(handle)),
            input_buffer: Mutex::new(input_buffer),
            ref_count: AtomicUsize::new(1),
            destroyed: AtomicBool::new(false),
            ledger: BufferLedger::new(),
            events,
        })
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Device name, e.g. "ttyardu192"
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> DeviceLocation {
        self.location
    }

    pub fn input_endpoint(&self) -> u8 {
        self.endpoints.input
    }

    pub fn output_endpoint(&self) -> u8 {
        self.endpoints.output
    }

    /// Size of the input buffer (the bulk IN max packet size)
    pub fn input_buffer_len(&self) -> usize {
        self.endpoints.input_max_packet
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Current number of holds, including the registry's while attached
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Write buffers submitted through this device and not yet released
    pub fn outstanding_writes(&self) -> usize {
        self.ledger.outstanding()
    }

    pub(crate) fn ledger(&self) -> &BufferLedger {
        &self.ledger
    }

    pub(crate) fn events(&self) -> &EventSink {
        &self.events
    }

    pub(crate) fn handle(&self) -> RwLockReadGuard<'_, Option<Box<dyn BulkDevice>>> {
        self.handle.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn input_buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        self.input_buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a new hold
    ///
    /// Fails once the count has reached zero; a destroyed object is never
    /// brought back.
    pub(crate) fn acquire(self: &Arc<Self>) -> Option<DeviceHold> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 { None } else { Some(count + 1) }
            })
            .ok()
            .map(|_| DeviceHold {
                device: Arc::clone(self),
            })
    }

    /// Drop one hold, destroying the object if it was the last
    pub(crate) fn release(&self) {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(1) => self.destroy(),
            Ok(_) => {}
            Err(_) => error!("{}: release with no outstanding holds", self.name),
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            error!("{}: destroy called twice", self.name);
            return;
        }

        let handle = self
            .handle
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(handle);

        let mut buffer = self.input_buffer();
        buffer.clear();
        buffer.shrink_to_fit();
        drop(buffer);

        if self.ledger.outstanding() > 0 {
            debug!(
                "{}: {} write buffers still owned by their transfers",
                self.name,
                self.ledger.outstanding()
            );
        }

        info!("{} destroyed ({})", self.name, self.location);
        self.events
            .notify(BridgeEvent::DeviceDestroyed { slot: self.slot });
    }
}

impl fmt::Debug for DeviceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceObject")
            .field("slot", &self.slot)
            .field("name", &self.name)
            .field("location", &self.location)
            .field("endpoints", &self.endpoints)
            .field("ref_count", &self.ref_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// A caller's claim on a device object
///
/// Dropping the hold releases it, so each successful open is paired with
/// exactly one release.
pub struct DeviceHold {
    device: Arc<DeviceObject>,
}

impl DeviceHold {
    /// Release the hold explicitly
    pub fn release(self) {
        drop(self);
    }

    /// A memory reference to the object that does not count as a hold
    pub fn object(&self) -> Arc<DeviceObject> {
        Arc::clone(&self.device)
    }
}

impl Deref for DeviceHold {
    type Target = DeviceObject;

    fn deref(&self) -> &DeviceObject {
        &self.device
    }
}

impl Drop for DeviceHold {
    fn drop(&mut self) {
        self.device.release();
    }
}

impl fmt::Debug for DeviceHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceHold").field(&self.device).finish()
    }
}
