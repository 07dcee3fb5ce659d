//! Bridge lifecycle
//!
//! `Bridge` owns the registry and the USB worker thread. Starting it creates
//! the libusb transport, attaches everything already plugged in, and hands
//! hotplug tracking to the worker. Shutting down stops the worker first and
//! then detaches every device.

use crate::config::BridgeConfig;
use crate::error::LookupError;
use crate::file::DeviceFile;
use crate::usb::libusb::RusbTransport;
use crate::usb::registry::{DeviceRegistry, ScanSummary, SlotInfo};
use crate::usb::worker::{WorkerHandle, spawn_usb_worker};
use anyhow::{Context, Result, anyhow};
use common::{DEFAULT_EVENT_CAPACITY, EventStream, create_event_channel};
use std::sync::Arc;
use tracing::{info, warn};
use transport::{Slot, TransferStatus, UsbTransport};

pub struct Bridge {
    registry: Arc<DeviceRegistry>,
    worker: Option<WorkerHandle>,
}

impl Bridge {
    /// Start the bridge on the host's USB stack
    ///
    /// Returns the bridge and the stream of out-of-band events.
    pub fn start(config: &BridgeConfig) -> Result<(Self, EventStream)> {
        config.validate()?;

        let (events, stream) = create_event_channel(DEFAULT_EVENT_CAPACITY);

        let transport = RusbTransport::new(config.transport_settings())
            .context("Failed to initialize libusb")?;
        let context = transport.context().clone();
        let transport: Arc<dyn UsbTransport> = Arc::new(transport);

        let registry = Arc::new(DeviceRegistry::new(
            transport,
            config.registry_settings()?,
            events,
        ));

        let summary = registry
            .rescan()
            .map_err(|status| anyhow!("Initial device scan failed: {}", status))?;
        info!(
            "Bridge started for {}: {} attached, {} rejected",
            registry.settings().matcher,
            summary.attached.len(),
            summary.rejected.len()
        );

        let worker = spawn_usb_worker(registry.clone(), Some(context), config.worker_settings()?)
            .context("Failed to spawn USB worker thread")?;

        Ok((
            Self {
                registry,
                worker: Some(worker),
            },
            stream,
        ))
    }

    /// A bridge over an existing registry, without a worker thread
    ///
    /// Attach and detach are driven by the caller through the registry.
    pub fn with_registry(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            worker: None,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Open the device in `slot`
    pub fn open(&self, slot: Slot) -> Result<DeviceFile, LookupError> {
        DeviceFile::open(&self.registry, slot)
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.registry.slots()
    }

    /// Reconcile the registry with the bus now, on the calling thread
    pub fn rescan(&self) -> Result<ScanSummary, TransferStatus> {
        self.registry.rescan()
    }

    /// Ask the worker thread for a rescan without waiting for it
    pub fn request_rescan(&self) {
        if let Some(worker) = &self.worker {
            worker.request_rescan();
        }
    }

    /// Stop the worker and detach every device
    ///
    /// Returns the number of device objects still held by open files; they
    /// are destroyed when the last of those files closes.
    pub fn shutdown(&mut self) -> usize {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }

        let still_held = self.registry.shutdown();
        if still_held > 0 {
            warn!("{} devices still open at shutdown", still_held);
        }
        still_held
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
