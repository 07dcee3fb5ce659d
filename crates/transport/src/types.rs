//! USB descriptor and identifier types
//!
//! These are the values a transport reports during enumeration and the
//! identifiers the bridge hands out to callers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Published device identifier (minor number)
///
/// Allocated by the registry from a fixed base when a device attaches and
/// released again when it detaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(pub u32);

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical position of a device interface on the host
///
/// Bus number and address identify the device; the interface number selects
/// one of its interfaces, since attach happens per interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
    pub interface: u8,
}

impl DeviceLocation {
    pub fn new(bus: u8, address: u8, interface: u8) -> Self {
        Self {
            bus,
            address,
            interface,
        }
    }

    /// True if both locations refer to the same physical device
    pub fn same_device(&self, other: &DeviceLocation) -> bool {
        self.bus == other.bus && self.address == other.address
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus {:03} addr {:03} if {}",
            self.bus, self.address, self.interface
        )
    }
}

/// Endpoint transfer type (bmAttributes bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint direction, taken from bit 7 of the endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// One endpoint of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit (e.g. 0x83)
    pub address: u8,
    pub kind: TransferKind,
    /// wMaxPacketSize
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn direction(&self) -> EndpointDirection {
        if self.address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    pub fn is_bulk_in(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction() == EndpointDirection::In
    }

    pub fn is_bulk_out(&self) -> bool {
        self.kind == TransferKind::Bulk && self.direction() == EndpointDirection::Out
    }
}

/// Descriptor of one interface of an attached device, as seen at enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub location: DeviceLocation,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Endpoints of the interface's current alternate setting, in descriptor order
    pub endpoints: Vec<EndpointDescriptor>,
}

impl DeviceDescriptor {
    /// First bulk IN endpoint in descriptor order
    pub fn first_bulk_in(&self) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.is_bulk_in())
    }

    /// First bulk OUT endpoint in descriptor order
    pub fn first_bulk_out(&self) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.is_bulk_out())
    }
}

/// The single vendor/product pair the bridge binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMatch {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceMatch {
    /// Arduino Uno R3 (ATmega16U2 USB bridge)
    pub const ARDUINO_UNO_R3: DeviceMatch = DeviceMatch {
        vendor_id: 0x2341,
        product_id: 0x0043,
    };

    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.vendor_id == self.vendor_id && descriptor.product_id == self.product_id
    }
}

impl Default for DeviceMatch {
    fn default() -> Self {
        Self::ARDUINO_UNO_R3
    }
}

impl fmt::Display for DeviceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(address: u8, kind: TransferKind) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            kind,
            max_packet_size: 64,
        }
    }

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(
            endpoint(0x83, TransferKind::Bulk).direction(),
            EndpointDirection::In
        );
        assert_eq!(
            endpoint(0x04, TransferKind::Bulk).direction(),
            EndpointDirection::Out
        );
    }

    #[test]
    fn test_first_bulk_endpoints_skip_other_kinds() {
        let descriptor = DeviceDescriptor {
            location: DeviceLocation::new(1, 4, 1),
            vendor_id: 0x2341,
            product_id: 0x0043,
            endpoints: vec![
                endpoint(0x82, TransferKind::Interrupt),
                endpoint(0x04, TransferKind::Bulk),
                endpoint(0x83, TransferKind::Bulk),
                endpoint(0x85, TransferKind::Bulk),
            ],
        };

        assert_eq!(descriptor.first_bulk_in().map(|ep| ep.address), Some(0x83));
        assert_eq!(descriptor.first_bulk_out().map(|ep| ep.address), Some(0x04));
    }

    #[test]
    fn test_device_match() {
        let descriptor = DeviceDescriptor {
            location: DeviceLocation::new(1, 4, 0),
            vendor_id: 0x2341,
            product_id: 0x0043,
            endpoints: Vec::new(),
        };
        assert!(DeviceMatch::default().matches(&descriptor));
        assert!(!DeviceMatch::new(0x2341, 0x0001).matches(&descriptor));
        assert_eq!(DeviceMatch::default().to_string(), "2341:0043");
    }

    #[test]
    fn test_same_device_ignores_interface() {
        let a = DeviceLocation::new(1, 4, 0);
        let b = DeviceLocation::new(1, 4, 1);
        assert!(a.same_device(&b));
        assert_ne!(a, b);
        assert!(!a.same_device(&DeviceLocation::new(2, 4, 0)));
    }
}
