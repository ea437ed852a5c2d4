//! Core protocol errors

use cadet_crypto::PeerIdentity;
use thiserror::Error;

use crate::channel::ChannelNumber;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Peer is not known to the registry
    #[error("Unknown peer: {0:?}")]
    UnknownPeer(PeerIdentity),

    /// Tunnels to the local peer are not supported
    #[error("Cannot open a tunnel to the local peer")]
    LoopbackTunnel,

    /// No tunnel exists towards the peer
    #[error("No tunnel to {0:?}")]
    NoTunnel(PeerIdentity),

    /// Channel not found on the tunnel
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelNumber),

    /// Channel exists but cannot carry data yet
    #[error("Channel {0} is not open")]
    ChannelNotOpen(ChannelNumber),

    /// Port already opened by a client
    #[error("Port already open")]
    PortInUse,

    /// Port was never opened
    #[error("Port not open")]
    PortNotOpen,

    /// Payload does not fit into one message
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Path construction failed
    #[error("Path error: {0}")]
    Path(#[from] PathBuildError),

    /// Invalid state transition
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Message could not be encoded or decoded
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    CryptoError(#[from] cadet_crypto::CryptoError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The core was shut down
    #[error("Core is shut down")]
    ShutDown,
}

/// Errors building a path from a raw identity sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathBuildError {
    /// The local peer does not appear in the sequence
    #[error("local peer is not part of the path")]
    LocalPeerAbsent,

    /// The sequence was empty
    #[error("empty peer sequence")]
    Empty,
}

/// Errors cancelling a queued send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    /// The continuation already fired
    #[error("message was already sent")]
    AlreadySent,
}

/// Wire codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the message needs
    #[error("Truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Header size disagrees with the buffer
    #[error("Bad message size: header says {declared}, got {actual}")]
    BadSize { declared: usize, actual: usize },

    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownType(u16),

    /// Message type not valid in this context
    #[error("Unexpected message type: {0}")]
    UnexpectedType(u16),

    /// Structurally invalid content
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
