//! Device registry
//!
//! Maps slots to attached device objects. The registry owns one hold on every
//! object it publishes; callers get their own holds through `lookup`. The
//! registry lock protects only the slot table and is never held during a
//! transfer or while a device object is being destroyed.

use crate::error::{AttachError, LookupError};
use crate::usb::device::{BulkEndpoints, DeviceHold, DeviceObject, allocate_input_buffer};
use crate::usb::transfers::DEFAULT_READ_TIMEOUT;
use common::{BridgeEvent, EventSink};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use transport::{DeviceDescriptor, DeviceLocation, DeviceMatch, Slot, TransferStatus, UsbTransport};

/// First slot handed out
pub const DEFAULT_SLOT_BASE: u32 = 192;
/// Number of slots in the range
pub const DEFAULT_MAX_SLOTS: u32 = 64;
/// Device names are `<prefix><slot>`
pub const DEFAULT_NAME_PREFIX: &str = "ttyardu";

/// Registry parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    /// The one vendor/product pair the registry binds to
    pub matcher: DeviceMatch,
    pub slot_base: u32,
    pub max_slots: u32,
    pub name_prefix: String,
    /// Timeout of every bulk IN transfer
    pub read_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            matcher: DeviceMatch::ARDUINO_UNO_R3,
            slot_base: DEFAULT_SLOT_BASE,
            max_slots: DEFAULT_MAX_SLOTS,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl RegistrySettings {
    /// One past the last usable slot
    fn slot_end(&self) -> u32 {
        self.slot_base.saturating_add(self.max_slots)
    }
}

/// Snapshot of one published slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: Slot,
    pub name: String,
    pub location: DeviceLocation,
    pub input_endpoint: u8,
    pub output_endpoint: u8,
    pub input_buffer_len: usize,
    /// Holds owned by callers (the registry's own hold is not counted)
    pub open_holds: usize,
    pub outstanding_writes: usize,
}

/// Result of reconciling the registry with the transport's device list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub attached: Vec<Slot>,
    pub detached: Vec<Slot>,
    pub rejected: Vec<DeviceLocation>,
}

impl ScanSummary {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty() && self.rejected.is_empty()
    }
}

#[derive(Default)]
struct SlotTable {
    /// Published objects, each carrying the registry's hold
    slots: BTreeMap<Slot, Arc<DeviceObject>>,
    /// Location -> slot of every published object
    locations: HashMap<DeviceLocation, Slot>,
    /// Matching interfaces that failed to attach; not retried until they vanish
    rejected: HashSet<DeviceLocation>,
}

impl SlotTable {
    fn free_slot(&self, settings: &RegistrySettings) -> Option<Slot> {
        (settings.slot_base..settings.slot_end())
            .map(Slot)
            .find(|slot| !self.slots.contains_key(slot))
    }
}

/// Device registry
pub struct DeviceRegistry {
    transport: Arc<dyn UsbTransport>,
    settings: RegistrySettings,
    events: EventSink,
    table: Mutex<SlotTable>,
}

impl DeviceRegistry {
    pub fn new(
        transport: Arc<dyn UsbTransport>,
        settings: RegistrySettings,
        events: EventSink,
    ) -> Self {
        Self {
            transport,
            settings,
            events,
            table: Mutex::new(SlotTable::default()),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Name a device in `slot` would be published under
    pub fn device_name(&self, slot: Slot) -> String {
        format!("{}{}", self.settings.name_prefix, slot)
    }

    fn table(&self) -> MutexGuard<'_, SlotTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach one interface and publish it under a slot
    ///
    /// Attaching a location that is already published returns its slot. Any
    /// failure leaves nothing published; partially built state is dropped.
    pub fn on_attach(&self, descriptor: &DeviceDescriptor) -> Result<Slot, AttachError> {
        let location = descriptor.location;
        match self.attach(descriptor) {
            Ok(slot) => Ok(slot),
            Err(err) => {
                self.reject(location, &err);
                Err(err)
            }
        }
    }

    fn attach(&self, descriptor: &DeviceDescriptor) -> Result<Slot, AttachError> {
        let location = descriptor.location;

        if !self.settings.matcher.matches(descriptor) {
            return Err(AttachError::NoMatchingDevice {
                expected: self.settings.matcher,
                found: DeviceMatch::new(descriptor.vendor_id, descriptor.product_id),
            });
        }

        if let Some(slot) = self.table().locations.get(&location) {
            debug!("{} already attached as slot {}", location, slot);
            return Ok(*slot);
        }

        let endpoints = BulkEndpoints::discover(descriptor)?;
        debug!(
            "{}: bulk in {:#x} ({} bytes), bulk out {:#x}",
            location, endpoints.input, endpoints.input_max_packet, endpoints.output
        );

        let input_buffer = allocate_input_buffer(endpoints.input_max_packet)?;
        let handle = self
            .transport
            .open(descriptor)
            .map_err(AttachError::Open)?;

        let mut table = self.table();

        // Raced with another attach of the same location; the fresh handle is
        // dropped after the lock is released
        if let Some(slot) = table.locations.get(&location).copied() {
            drop(table);
            drop(handle);
            return Ok(slot);
        }

        let slot = table
            .free_slot(&self.settings)
            .ok_or(AttachError::NoFreeSlot {
                first: self.settings.slot_base,
                end: self.settings.slot_end(),
            })?;
        let name = self.device_name(slot);

        let device = DeviceObject::new(
            slot,
            name.clone(),
            endpoints,
            input_buffer,
            handle,
            self.settings.read_timeout,
            self.events.clone(),
        );

        table.slots.insert(slot, device);
        table.locations.insert(location, slot);
        table.rejected.remove(&location);
        drop(table);

        info!("{} now attached to {} ({})", name, location, self.settings.matcher);
        self.events.notify(BridgeEvent::DeviceAttached {
            slot,
            name,
            location,
        });

        Ok(slot)
    }

    fn reject(&self, location: DeviceLocation, err: &AttachError) {
        if let AttachError::NoMatchingDevice { .. } = err {
            debug!("{}: {}", location, err);
            return;
        }

        warn!("{}: attach failed: {} ({})", location, err, err.errno());
        self.table().rejected.insert(location);
        self.events.notify(BridgeEvent::AttachRejected {
            location,
            reason: err.to_string(),
        });
    }

    /// Unpublish `slot` and drop the registry's hold
    ///
    /// The object survives until every caller hold is released. Returns
    /// `false` if nothing was published in `slot`.
    pub fn on_detach(&self, slot: Slot) -> bool {
        let device = {
            let mut table = self.table();
            let Some(device) = table.slots.remove(&slot) else {
                return false;
            };
            table.locations.remove(&device.location());
            device
        };

        let open_holds = device.ref_count().saturating_sub(1);
        info!(
            "{} now disconnected ({}), {} open holds",
            device.name(),
            device.location(),
            open_holds
        );
        self.events.notify(BridgeEvent::DeviceDetached {
            slot,
            location: device.location(),
            open_holds,
        });

        device.release();
        true
    }

    /// Detach the interface at `location`, if published
    pub fn on_detach_location(&self, location: DeviceLocation) -> Option<Slot> {
        let slot = self.table().locations.get(&location).copied()?;
        self.on_detach(slot).then_some(slot)
    }

    /// Take a new hold on the object published in `slot`
    pub fn lookup(&self, slot: Slot) -> Result<DeviceHold, LookupError> {
        let table = self.table();
        table
            .slots
            .get(&slot)
            .and_then(|device| device.acquire())
            .ok_or(LookupError::NotFound(slot))
    }

    /// Reconcile the registry with the transport's current device list
    ///
    /// New matching interfaces are attached, published interfaces that are no
    /// longer listed are detached. Interfaces that failed to attach are not
    /// retried until they disappear.
    pub fn rescan(&self) -> Result<ScanSummary, TransferStatus> {
        let descriptors: Vec<DeviceDescriptor> = self
            .transport
            .devices()?
            .into_iter()
            .filter(|descriptor| self.settings.matcher.matches(descriptor))
            .collect();
        let present: HashSet<DeviceLocation> =
            descriptors.iter().map(|descriptor| descriptor.location).collect();

        let mut summary = ScanSummary::default();

        let vanished: Vec<Slot> = {
            let mut table = self.table();
            table.rejected.retain(|location| present.contains(location));
            table
                .locations
                .iter()
                .filter(|(location, _)| !present.contains(location))
                .map(|(_, slot)| *slot)
                .collect()
        };
        for slot in vanished {
            if self.on_detach(slot) {
                summary.detached.push(slot);
            }
        }

        for descriptor in &descriptors {
            let known = {
                let table = self.table();
                table.locations.contains_key(&descriptor.location)
                    || table.rejected.contains(&descriptor.location)
            };
            if known {
                continue;
            }

            match self.on_attach(descriptor) {
                Ok(slot) => summary.attached.push(slot),
                Err(_) => summary.rejected.push(descriptor.location),
            }
        }

        if !summary.is_empty() {
            debug!(
                "Rescan: {} attached, {} detached, {} rejected",
                summary.attached.len(),
                summary.detached.len(),
                summary.rejected.len()
            );
        }

        Ok(summary)
    }

    /// Published slots in ascending order
    pub fn slots(&self) -> Vec<SlotInfo> {
        self.table()
            .slots
            .values()
            .map(|device| SlotInfo {
                slot: device.slot(),
                name: device.name().to_string(),
                location: device.location(),
                input_endpoint: device.input_endpoint(),
                output_endpoint: device.output_endpoint(),
                input_buffer_len: device.input_buffer_len(),
                open_holds: device.ref_count().saturating_sub(1),
                outstanding_writes: device.outstanding_writes(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach everything
    ///
    /// Returns the number of objects that are still alive because callers
    /// hold them.
    pub fn shutdown(&self) -> usize {
        let devices: Vec<Arc<DeviceObject>> = {
            let mut table = self.table();
            table.locations.clear();
            table.rejected.clear();
            std::mem::take(&mut table.slots).into_values().collect()
        };

        let mut still_held = 0;
        for device in devices {
            self.events.notify(BridgeEvent::DeviceDetached {
                slot: device.slot(),
                location: device.location(),
                open_holds: device.ref_count().saturating_sub(1),
            });
            device.release();

            if !device.is_destroyed() {
                warn!("{} still held by callers at shutdown", device.name());
                still_held += 1;
            }
        }

        still_held
    }
}
