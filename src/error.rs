//! WolfMQ Error Types

use thiserror::Error;

/// Result type alias for WolfMQ operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMQ error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Packet codec errors
    #[error("Packet error: {0}")]
    Packet(String),

    #[error("Packet truncated: need {needed} bytes, have {available}")]
    PacketTruncated { needed: usize, available: usize },

    #[error("Bad packet magic: {0:#010x}")]
    BadMagic(u32),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("Property block corrupted: {0}")]
    PropertyCorrupted(String),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Protocol anomalies
    #[error("Received Unexpected {packet} from {sender}")]
    UnexpectedPacket { packet: String, sender: String },

    // Membership errors
    #[error("Membership error: {0}")]
    Membership(String),

    #[error("Broker not found: {0}")]
    BrokerNotFound(String),

    #[error("Stale session for {broker}: held {held}, offered {offered}")]
    StaleSession { broker: String, held: u64, offered: u64 },

    // Takeover errors
    #[error("Takeover error: {0}")]
    Takeover(String),

    #[error("Takeover of {target} lost to {winner}")]
    TakeoverConflict { target: String, winner: String },

    #[error("Store lock denied for {0}")]
    StoreLockDenied(String),

    #[error("Takeover watchdog expired for {0}")]
    TakeoverExpired(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Store recovery failed for {target}: {reason}")]
    RecoveryFailed { target: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a protocol anomaly: logged and dropped at the
    /// dispatch boundary, never fatal to the link.
    pub fn is_protocol_anomaly(&self) -> bool {
        matches!(
            self,
            Error::UnexpectedPacket { .. }
                | Error::BadMagic(_)
                | Error::UnsupportedVersion(_)
                | Error::PropertyCorrupted(_)
        )
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_) | Error::Network(_) | Error::StoreLockDenied(_)
        )
    }
}
