//! Out-of-band event channel
//!
//! Things that happen without a caller to report them to (hotplug attach and
//! detach, deferred destruction, failed write completions) are published here.
//! Publishing never blocks: completion callbacks call `notify` from a context
//! that must not wait, so a full channel drops the event and counts it.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use transport::{DeviceLocation, Slot, TransferStatus};

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events published by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A matching interface was attached and published
    DeviceAttached {
        slot: Slot,
        /// Device name, e.g. "ttyardu192"
        name: String,
        location: DeviceLocation,
    },

    /// A matching interface could not be attached
    AttachRejected {
        location: DeviceLocation,
        reason: String,
    },

    /// A device was unpublished
    DeviceDetached {
        slot: Slot,
        location: DeviceLocation,
        /// Holds still owned by callers at the time of detach
        open_holds: usize,
    },

    /// The last hold was released and the device object torn down
    DeviceDestroyed { slot: Slot },

    /// An accepted write failed after its caller had already returned
    WriteFailed {
        slot: Slot,
        endpoint: u8,
        len: usize,
        status: TransferStatus,
    },
}

/// Publishing half of the event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<BridgeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// A sink whose events go nowhere
    pub fn disconnected() -> Self {
        let (sink, _stream) = create_event_channel(1);
        sink
    }

    /// Publish an event without blocking
    pub fn notify(&self, event: BridgeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Event channel full, dropped {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                // Nobody is listening
            }
        }
    }

    /// Number of events dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving half of the event channel
#[derive(Debug, Clone)]
pub struct EventStream {
    rx: Receiver<BridgeEvent>,
}

impl EventStream {
    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<BridgeEvent> {
        self.rx
            .recv()
            .await
            .map_err(|_| crate::Error::ChannelClosed)
    }

    /// Receive the next event (blocking)
    pub fn recv_blocking(&self) -> crate::Result<BridgeEvent> {
        self.rx
            .recv_blocking()
            .map_err(|_| crate::Error::ChannelClosed)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<BridgeEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every event currently queued
    pub fn drain(&self) -> Vec<BridgeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create the event channel
///
/// Returns (EventSink for publishers, EventStream for the consumer)
pub fn create_event_channel(capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = bounded(capacity.max(1));

    (
        EventSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventStream { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_channel() {
        let (sink, stream) = create_event_channel(4);

        // Publish from a plain thread, as completion callbacks do
        let handle = std::thread::spawn(move || {
            sink.notify(BridgeEvent::DeviceDestroyed { slot: Slot(192) });
        });

        let event = stream.recv().await.unwrap();
        assert_eq!(event, BridgeEvent::DeviceDestroyed { slot: Slot(192) });
        handle.join().unwrap();
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (sink, stream) = create_event_channel(1);
        sink.notify(BridgeEvent::DeviceDestroyed { slot: Slot(192) });
        sink.notify(BridgeEvent::DeviceDestroyed { slot: Slot(193) });

        assert_eq!(sink.dropped(), 1);
        assert_eq!(
            stream.drain(),
            vec![BridgeEvent::DeviceDestroyed { slot: Slot(192) }]
        );
    }

    #[test]
    fn test_disconnected_sink_accepts_events() {
        let sink = EventSink::disconnected();
        sink.notify(BridgeEvent::DeviceDestroyed { slot: Slot(192) });
        assert_eq!(sink.dropped(), 0);
    }
}
