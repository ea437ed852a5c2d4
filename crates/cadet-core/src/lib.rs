//! CADET Core Protocol
//!
//! Implements the overlay messaging core:
//! - Path discovery and the peer registry
//! - Relay routes with bounded, rung-ordered buffering
//! - Connections with hop-by-hop ACK windows
//! - Tunnels with authenticated key exchange and channel multiplexing

pub mod channel;
pub mod config;
pub mod connection;
pub mod core;
pub mod engine;
pub mod error;
pub mod kx;
pub mod message;
pub mod mq;
pub mod output;
pub mod path;
pub mod peer;
pub mod relay;
pub mod router;
pub mod sim;
pub mod stats;
pub mod timer;
pub mod tunnel;

pub use crate::core::{Core, TimerEvent};
pub use channel::{ChannelEvent, ChannelNumber, ChannelOptions, Port};
pub use config::{CoreConfig, RungEviction};
pub use connection::{ConnectionId, ConnectionState};
pub use engine::{Engine, EngineCommand, EngineHandle, Transport};
pub use error::{CancelError, CoreError, CoreResult, PathBuildError, WireError};
pub use kx::EncryptionState;
pub use message::{MessageType, MAX_CHANNEL_PAYLOAD};
pub use output::{Continuation, Output, SendHandle, SendOutcome};
pub use sim::Network;
pub use stats::Statistics;
pub use tunnel::{ConnectivityState, TunnelInfo};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;
