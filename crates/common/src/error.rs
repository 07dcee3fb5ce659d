//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Every publisher of the event channel is gone
    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidLogFilter { filter: String, reason: String },

    /// A global tracing subscriber is already installed
    #[error("Logging already initialized: {0}")]
    LoggingInitialized(String),
}

pub type Result<T> = std::result::Result<T, Error>;
