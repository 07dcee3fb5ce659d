//! libusb transport
//!
//! Implements the transport traits on top of rusb. Reads call `read_bulk`
//! directly on the caller's thread. Writes are queued to a per-device writer
//! thread that performs the blocking `write_bulk` and runs the completion
//! callback, so submission never waits for the bus.

use async_channel::{Receiver, Sender, TrySendError};
use rusb::{Context, Device, DeviceHandle, TransferType, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};
use transport::{
    BulkDevice, DeviceDescriptor, DeviceLocation, EndpointDescriptor, OutTransfer, Rejected,
    TransferKind, TransferStatus, UsbTransport,
};

/// Default timeout of one blocking bulk OUT transfer (10 seconds)
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of OUT transfers that may wait for the writer thread
pub const DEFAULT_WRITE_QUEUE_DEPTH: usize = 32;

/// Writer thread parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub write_timeout: Duration,
    pub write_queue_depth: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

/// Transport backed by a libusb context
pub struct RusbTransport {
    context: Context,
    settings: TransportSettings,
}

impl RusbTransport {
    pub fn new(settings: TransportSettings) -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            settings,
        })
    }

    /// The libusb context, for event handling and hotplug registration
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn find_device(&self, location: DeviceLocation) -> Result<Device<Context>, TransferStatus> {
        self.context
            .devices()
            .map_err(map_rusb_error)?
            .iter()
            .find(|device| {
                device.bus_number() == location.bus && device.address() == location.address
            })
            .ok_or(TransferStatus::NoDevice)
    }
}

impl UsbTransport for RusbTransport {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, TransferStatus> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut descriptors = Vec::new();

        for device in devices.iter() {
            match interface_descriptors(&device) {
                Ok(mut found) => descriptors.append(&mut found),
                Err(e) => trace!(
                    "Skipping device bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        Ok(descriptors)
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn BulkDevice>, TransferStatus> {
        let location = descriptor.location;
        let device = self.find_device(location)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open {}: {}", location, e);
            map_rusb_error(e)
        })?;

        let interface = location.interface;
        let kernel_driver_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from {}", location);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Failed to detach kernel driver from {}: {}", location, e);
                        false
                    }
                }
            }
            Ok(false) => false,
            Err(e) => {
                debug!("Could not check kernel driver status for {}: {}", location, e);
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim {}: {}", location, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e));
        }
        debug!("Claimed {}", location);

        let handle = Arc::new(handle);
        let (queue, pending) = async_channel::bounded(self.settings.write_queue_depth.max(1));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let writer = {
            let handle = handle.clone();
            let shutting_down = shutting_down.clone();
            let timeout = self.settings.write_timeout;
            std::thread::Builder::new()
                .name(format!(
                    "usb-writer-{:03}-{:03}-{}",
                    location.bus, location.address, interface
                ))
                .spawn(move || writer_loop(&handle, &pending, &shutting_down, timeout))
        };
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                warn!("Failed to spawn writer thread for {}: {}", location, e);
                release_interface(&handle, location, kernel_driver_detached);
                return Err(TransferStatus::NoMemory);
            }
        };

        Ok(Box::new(RusbDevice {
            location,
            handle,
            queue,
            shutting_down,
            writer: Some(writer),
            kernel_driver_detached,
        }))
    }
}

/// Descriptors of every interface of `device` (alternate setting 0 of the
/// active configuration)
fn interface_descriptors(device: &Device<Context>) -> Result<Vec<DeviceDescriptor>, rusb::Error> {
    let device_descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;

    let descriptors = config
        .interfaces()
        .filter_map(|interface| {
            let setting = interface
                .descriptors()
                .find(|setting| setting.setting_number() == 0)?;
            Some(DeviceDescriptor {
                location: DeviceLocation::new(
                    device.bus_number(),
                    device.address(),
                    interface.number(),
                ),
                vendor_id: device_descriptor.vendor_id(),
                product_id: device_descriptor.product_id(),
                endpoints: setting
                    .endpoint_descriptors()
                    .map(|endpoint| convert_endpoint(&endpoint))
                    .collect(),
            })
        })
        .collect();

    Ok(descriptors)
}

pub fn convert_endpoint(endpoint: &rusb::EndpointDescriptor<'_>) -> EndpointDescriptor {
    EndpointDescriptor {
        address: endpoint.address(),
        kind: convert_transfer_type(endpoint.transfer_type()),
        max_packet_size: endpoint.max_packet_size(),
    }
}

fn convert_transfer_type(transfer_type: TransferType) -> TransferKind {
    match transfer_type {
        TransferType::Control => TransferKind::Control,
        TransferType::Isochronous => TransferKind::Isochronous,
        TransferType::Bulk => TransferKind::Bulk,
        TransferType::Interrupt => TransferKind::Interrupt,
    }
}

/// Drain the submission queue until it is closed
fn writer_loop(
    handle: &DeviceHandle<Context>,
    pending: &Receiver<OutTransfer>,
    shutting_down: &AtomicBool,
    timeout: Duration,
) {
    while let Ok(transfer) = pending.recv_blocking() {
        if shutting_down.load(Ordering::Acquire) {
            transfer.complete(Err(TransferStatus::Canceled));
            continue;
        }

        let result = handle
            .write_bulk(transfer.endpoint(), transfer.data(), timeout)
            .map_err(map_rusb_error);
        trace!(
            "Bulk OUT endpoint={:#x}, len={}: {:?}",
            transfer.endpoint(),
            transfer.len(),
            result
        );
        transfer.complete(result);
    }
}

fn release_interface(handle: &DeviceHandle<Context>, location: DeviceLocation, reattach: bool) {
    if let Err(e) = handle.release_interface(location.interface) {
        warn!("Failed to release {}: {}", location, e);
    }

    if reattach {
        match handle.attach_kernel_driver(location.interface) {
            Ok(()) => debug!("Reattached kernel driver to {}", location),
            Err(e) => debug!("Could not reattach kernel driver to {}: {}", location, e),
        }
    }
}

/// An opened and claimed interface
pub struct RusbDevice {
    location: DeviceLocation,
    handle: Arc<DeviceHandle<Context>>,
    queue: Sender<OutTransfer>,
    shutting_down: Arc<AtomicBool>,
    writer: Option<JoinHandle<()>>,
    kernel_driver_detached: bool,
}

impl BulkDevice for RusbDevice {
    fn location(&self) -> DeviceLocation {
        self.location
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransferStatus> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn submit_bulk_out(&self, transfer: OutTransfer) -> Result<(), Rejected> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Rejected::new(TransferStatus::Shutdown, transfer));
        }

        self.queue.try_send(transfer).map_err(|e| match e {
            TrySendError::Full(transfer) => Rejected::new(TransferStatus::Busy, transfer),
            TrySendError::Closed(transfer) => Rejected::new(TransferStatus::Shutdown, transfer),
        })
    }
}

impl Drop for RusbDevice {
    fn drop(&mut self) {
        // Queued transfers complete as cancelled; the one on the bus finishes
        // within the write timeout
        self.shutting_down.store(true, Ordering::Release);
        self.queue.close();

        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            warn!("Writer thread for {} panicked", self.location);
        }

        release_interface(&self.handle, self.location, self.kernel_driver_detached);
        debug!("Closed {}", self.location);
    }
}

/// Convert rusb::Error to TransferStatus
pub fn map_rusb_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::Timeout,
        rusb::Error::Pipe => TransferStatus::Pipe,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::NotFound => TransferStatus::NotFound,
        rusb::Error::Busy => TransferStatus::Busy,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Io => TransferStatus::Io,
        rusb::Error::InvalidParam => TransferStatus::InvalidParam,
        rusb::Error::Access => TransferStatus::Access,
        rusb::Error::NoMem => TransferStatus::NoMemory,
        rusb::Error::Interrupted => TransferStatus::Canceled,
        // EOPNOTSUPP
        rusb::Error::NotSupported => TransferStatus::Other(-95),
        _ => TransferStatus::Io,
    }
}
