//! Common utilities for ardu-usb
//!
//! This crate provides functionality shared by the bridge library, its binary
//! and the test suites: error handling, logging setup, the out-of-band event
//! channel, and a scriptable mock transport.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    BridgeEvent, DEFAULT_EVENT_CAPACITY, EventSink, EventStream, create_event_channel,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
