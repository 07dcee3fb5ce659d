//! Character-device style access to an attached Arduino
//!
//! A `DeviceFile` is one open of a slot. It owns a hold on the device object,
//! so the object outlives a detach for as long as the file stays open.
//!
//! ```no_run
//! use bridge::{Bridge, BridgeConfig};
//! use std::io::{Read, Write};
//! use transport::Slot;
//!
//! # fn main() -> anyhow::Result<()> {
//! let (bridge, _events) = Bridge::start(&BridgeConfig::default())?;
//! let mut file = bridge.open(Slot(192))?;
//! file.write_all(b"p\n")?;
//!
//! let mut reply = [0u8; 64];
//! let n = file.read(&mut reply)?;
//! println!("{}", String::from_utf8_lossy(&reply[..n]));
//! # Ok(())
//! # }
//! ```

use crate::error::{LookupError, ReadError, WriteError};
use crate::usb::device::{DeviceHold, DeviceObject};
use crate::usb::registry::DeviceRegistry;
use crate::usb::transfers::{bulk_read, bulk_write};
use std::io;
use std::sync::Arc;
use tracing::trace;
use transport::Slot;

/// An open device
#[derive(Debug)]
pub struct DeviceFile {
    hold: DeviceHold,
}

impl DeviceFile {
    /// Open the device published in `slot`
    pub fn open(registry: &DeviceRegistry, slot: Slot) -> Result<Self, LookupError> {
        let hold = registry.lookup(slot)?;
        trace!("{} opened, ref_count {}", hold.name(), hold.ref_count());
        Ok(Self { hold })
    }

    pub fn slot(&self) -> Slot {
        self.hold.slot()
    }

    pub fn name(&self) -> &str {
        self.hold.name()
    }

    /// The device object behind this file
    pub fn device(&self) -> &DeviceObject {
        &self.hold
    }

    /// A reference to the device object that does not keep it open
    pub fn object(&self) -> Arc<DeviceObject> {
        self.hold.object()
    }

    /// One bulk IN transfer of at most `min(buf.len(), max packet size)` bytes
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        let len = buf.len();
        bulk_read(&self.hold, &mut io::Cursor::new(buf), len)
    }

    /// One bulk IN transfer of at most `max_len` bytes, copied into `sink`
    pub fn read_to<W: io::Write + ?Sized>(
        &self,
        sink: &mut W,
        max_len: usize,
    ) -> Result<usize, ReadError> {
        bulk_read(&self.hold, sink, max_len)
    }

    /// Submit `buf` as one bulk OUT transfer
    ///
    /// Returns `buf.len()` once the transfer is accepted; delivery failures
    /// are reported on the event channel.
    pub fn write(&self, buf: &[u8]) -> Result<usize, WriteError> {
        let mut source = buf;
        bulk_write(&self.hold, &mut source, buf.len())
    }

    /// Submit `len` bytes read from `source` as one bulk OUT transfer
    pub fn write_from<R: io::Read + ?Sized>(
        &self,
        source: &mut R,
        len: usize,
    ) -> Result<usize, WriteError> {
        bulk_write(&self.hold, source, len)
    }

    /// Close the file, releasing its hold
    pub fn close(self) {
        trace!("{} closed", self.hold.name());
        self.hold.release();
    }
}

impl io::Read for DeviceFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        DeviceFile::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Write for DeviceFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        DeviceFile::write(self, buf).map_err(io::Error::from)
    }

    /// Writes are handed to the transport on acceptance; there is nothing
    /// buffered here to flush
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::registry::RegistrySettings;
    use common::EventSink;
    use common::test_utils::{MockState, MockTransport, arduino_descriptor};
    use std::io::{Read, Write};
    use transport::{TransferStatus, UsbTransport};

    fn setup() -> (DeviceRegistry, Arc<MockState>) {
        let transport = Arc::new(MockTransport::new());
        let state = transport.state();
        let transport: Arc<dyn UsbTransport> = transport;
        let registry =
            DeviceRegistry::new(transport, RegistrySettings::default(), EventSink::disconnected());
        registry.on_attach(&arduino_descriptor(1, 4)).unwrap();
        (registry, state)
    }

    #[test]
    fn test_open_close_restores_count() {
        let (registry, _state) = setup();
        let file = DeviceFile::open(&registry, Slot(192)).unwrap();
        assert_eq!(file.name(), "ttyardu192");
        assert_eq!(file.device().ref_count(), 2);

        let device = file.object();
        file.close();
        assert_eq!(device.ref_count(), 1);
    }

    #[test]
    fn test_open_unknown_slot() {
        let (registry, _state) = setup();
        assert_eq!(
            DeviceFile::open(&registry, Slot(193)).unwrap_err(),
            LookupError::NotFound(Slot(193))
        );
    }

    #[test]
    fn test_io_traits() {
        let (registry, state) = setup();
        let mut file = DeviceFile::open(&registry, Slot(192)).unwrap();

        file.write_all(b"m10,20\n").unwrap();
        assert_eq!(state.written(), vec![b"m10,20\n".to_vec()]);

        state.push_read(b"ok\n".to_vec());
        let mut buf = [0u8; 16];
        assert_eq!(Read::read(&mut file, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ok\n");

        let err = Read::read(&mut file, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_write_all_stops_on_refused_submit() {
        let (registry, state) = setup();
        let mut file = DeviceFile::open(&registry, Slot(192)).unwrap();

        for _ in 0..3 {
            state.fail_next_submit(TransferStatus::Shutdown);
        }
        let err = file.write_all(b"p\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(state.submit_count(), 1);
        assert!(state.written().is_empty());
        assert_eq!(file.device().outstanding_writes(), 0);
    }

    #[test]
    fn test_read_to_sink() {
        let (registry, state) = setup();
        let file = DeviceFile::open(&registry, Slot(192)).unwrap();
        state.push_read(b"42\n".to_vec());

        let mut out = Vec::new();
        assert_eq!(file.read_to(&mut out, 8), Ok(3));
        assert_eq!(out, b"42\n");
    }

    #[test]
    fn test_write_from_source() {
        let (registry, state) = setup();
        let file = DeviceFile::open(&registry, Slot(192)).unwrap();

        let mut source = io::Cursor::new(b"d3\nignored".to_vec());
        assert_eq!(file.write_from(&mut source, 3), Ok(3));
        assert_eq!(state.written(), vec![b"d3\n".to_vec()]);
    }
}
