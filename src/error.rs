use crate::types::Zone;
use thiserror::Error;

/// Result type for receiver operations
pub type Result<T> = std::result::Result<T, AvrError>;

/// Errors that can occur when talking to a receiver
#[derive(Error, Debug)]
pub enum AvrError {
    /// TCP connection was refused or failed
    #[error("Connection error: {0}")]
    Connection(#[source] std::io::Error),

    /// TCP connection could not be established in time
    #[error("Connection timeout")]
    ConnectTimeout,

    /// Command attempted while the socket is down
    #[error("Not connected")]
    NotConnected,

    /// Receiver answered with an error code
    #[error("Device error: {code}")]
    Device {
        /// Raw error frame returned by the receiver (e.g. `E04`)
        code: String,
    },

    /// No matching response arrived before the deadline
    #[error("Request timeout")]
    Timeout,

    /// Receiver did not answer for the main zone during discovery
    #[error("Main zone not found")]
    NoMainZone,

    /// Volume is outside the range the zone accepts
    #[error("Volume {volume} out of range for {zone} (max {max})")]
    InvalidVolume { zone: Zone, volume: i32, max: u16 },

    /// Source name is not in the source table
    #[error("Unknown source: {0}")]
    UnknownSource(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// State update channel failed
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// JSON error while loading configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
