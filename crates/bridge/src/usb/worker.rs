//! USB worker thread
//!
//! Dedicated thread that keeps the registry in sync with the bus. It runs the
//! libusb event loop (`handle_events`), which also delivers hotplug
//! callbacks, and reconciles the registry whenever a hotplug notification or
//! an explicit rescan request arrives. Without hotplug support it rescans on a
//! fixed interval instead.

use crate::usb::registry::DeviceRegistry;
use async_channel::{Receiver, Sender};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use transport::DeviceMatch;

/// Default interval between rescans when hotplug is unavailable (1 second)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long one event-loop iteration waits for USB events
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Commands accepted by the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Reconcile the registry with the bus
    Rescan,
    /// Stop the thread
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Device the hotplug callback is filtered to
    pub matcher: DeviceMatch,
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            matcher: DeviceMatch::ARDUINO_UNO_R3,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// USB worker thread
pub struct UsbWorkerThread {
    registry: Arc<DeviceRegistry>,
    /// Event source; without one the thread only polls
    context: Option<Context>,
    settings: WorkerSettings,
    commands: Receiver<WorkerCommand>,
    notifier: Sender<WorkerCommand>,
}

impl UsbWorkerThread {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        context: Option<Context>,
        settings: WorkerSettings,
        (notifier, commands): (Sender<WorkerCommand>, Receiver<WorkerCommand>),
    ) -> Self {
        Self {
            registry,
            context,
            settings,
            commands,
            notifier,
        }
    }

    /// Register a hotplug callback filtered to the configured device
    ///
    /// Returns `None` when libusb has no hotplug support on this platform.
    /// The callback stays registered while the registration is alive.
    fn register_hotplug(&self) -> Option<Registration<Context>> {
        let context = self.context.as_ref()?;

        if !rusb::has_hotplug() {
            info!(
                "Hotplug not supported, polling every {:?}",
                self.settings.poll_interval
            );
            return None;
        }

        let callback = HotplugCallback {
            notifier: self.notifier.clone(),
        };
        match HotplugBuilder::new()
            .vendor_id(self.settings.matcher.vendor_id)
            .product_id(self.settings.matcher.product_id)
            .enumerate(false)
            .register(context, Box::new(callback))
        {
            Ok(registration) => {
                debug!("Hotplug callback registered for {}", self.settings.matcher);
                Some(registration)
            }
            Err(e) => {
                warn!("Failed to register hotplug callback, polling instead: {}", e);
                None
            }
        }
    }

    /// Run until a Shutdown command arrives or every command sender is gone
    pub fn run(self) {
        let registration = self.register_hotplug();
        let hotplug = registration.is_some();
        info!("USB worker thread started (hotplug: {})", hotplug);

        let mut last_scan = Instant::now();

        loop {
            let mut rescan = false;
            loop {
                match self.commands.try_recv() {
                    Ok(WorkerCommand::Rescan) => rescan = true,
                    Ok(WorkerCommand::Shutdown) => {
                        info!("USB worker shutting down");
                        return;
                    }
                    Err(async_channel::TryRecvError::Empty) => break,
                    Err(async_channel::TryRecvError::Closed) => {
                        debug!("Command channel closed, USB worker exiting");
                        return;
                    }
                }
            }

            if !hotplug && last_scan.elapsed() >= self.settings.poll_interval {
                rescan = true;
            }

            if rescan {
                self.rescan();
                last_scan = Instant::now();
            }

            self.wait_for_events();
        }
    }

    fn rescan(&self) {
        // Keep the thread alive if reconciliation panics
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.registry.rescan()
        }));

        match result {
            Ok(Ok(summary)) if !summary.is_empty() => debug!("Rescan result: {:?}", summary),
            Ok(Ok(_)) => {}
            Ok(Err(status)) => warn!("Device enumeration failed: {}", status),
            Err(e) => error!("Panic during rescan: {:?}", e),
        }
    }

    fn wait_for_events(&self) {
        let Some(context) = &self.context else {
            std::thread::sleep(EVENT_TIMEOUT);
            return;
        };

        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => debug!("USB event handling interrupted"),
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }
}

/// Hotplug callback
///
/// Runs inside libusb's event handling, where opening devices is not
/// allowed, so it only asks the worker loop for a rescan.
struct HotplugCallback {
    notifier: Sender<WorkerCommand>,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notifier.try_send(WorkerCommand::Rescan);
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.notifier.try_send(WorkerCommand::Rescan);
    }
}

/// Handle to a running worker thread
pub struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to reconcile the registry
    pub fn request_rescan(&self) {
        let _ = self.commands.try_send(WorkerCommand::Rescan);
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };

        let _ = self.commands.send_blocking(WorkerCommand::Shutdown);
        if thread.join().is_err() {
            error!("USB worker thread panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the USB worker thread
pub fn spawn_usb_worker(
    registry: Arc<DeviceRegistry>,
    context: Option<Context>,
    settings: WorkerSettings,
) -> std::io::Result<WorkerHandle> {
    let (commands, receiver) = async_channel::bounded(16);
    let worker = UsbWorkerThread::new(registry, context, settings, (commands.clone(), receiver));

    let thread = std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || worker.run())?;

    Ok(WorkerHandle {
        commands,
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::registry::RegistrySettings;
    use common::test_utils::{MockTransport, arduino_descriptor};
    use common::{BridgeEvent, create_event_channel};
    use transport::{Slot, UsbTransport};

    #[test]
    fn test_rescan_request_attaches_devices() {
        let transport = Arc::new(MockTransport::new());
        let dyn_transport: Arc<dyn UsbTransport> = transport.clone();
        let (sink, stream) = create_event_channel(16);
        let registry = Arc::new(DeviceRegistry::new(
            dyn_transport,
            RegistrySettings::default(),
            sink,
        ));
        let settings = WorkerSettings {
            poll_interval: Duration::from_secs(3600),
            ..Default::default()
        };

        let mut worker = spawn_usb_worker(registry.clone(), None, settings).unwrap();
        assert!(worker.is_running());

        transport.plug(arduino_descriptor(1, 4));
        worker.request_rescan();

        let event = stream.recv_blocking().unwrap();
        assert!(matches!(
            event,
            BridgeEvent::DeviceAttached {
                slot: Slot(192),
                ..
            }
        ));

        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_polling_detects_removal() {
        let transport = Arc::new(MockTransport::new().with_device(arduino_descriptor(1, 4)));
        let dyn_transport: Arc<dyn UsbTransport> = transport.clone();
        let (sink, stream) = create_event_channel(16);
        let registry = Arc::new(DeviceRegistry::new(
            dyn_transport,
            RegistrySettings::default(),
            sink,
        ));
        registry.rescan().unwrap();
        stream.drain();

        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let _worker = spawn_usb_worker(registry.clone(), None, settings).unwrap();

        transport.unplug(arduino_descriptor(1, 4).location);

        let event = stream.recv_blocking().unwrap();
        assert!(matches!(
            event,
            BridgeEvent::DeviceDetached {
                slot: Slot(192),
                open_holds: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let transport: Arc<dyn UsbTransport> = Arc::new(MockTransport::new());
        let registry = Arc::new(DeviceRegistry::new(
            transport,
            RegistrySettings::default(),
            common::EventSink::disconnected(),
        ));

        let mut worker =
            spawn_usb_worker(registry, None, WorkerSettings::default()).unwrap();
        worker.stop();
        worker.stop();
    }
}
