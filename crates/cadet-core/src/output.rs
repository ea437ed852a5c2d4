//! What the core asks its environment to do

use bytes::Bytes;
use cadet_crypto::PeerIdentity;

use crate::channel::ChannelEvent;

/// Result reported to a send continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the neighbor transport
    Sent,
    /// Cancelled or dropped before transmission
    NotSent,
}

/// Completion callback of a queued send; invoked exactly once
pub type Continuation = Box<dyn FnOnce(SendOutcome) + Send>;

/// Handle to a queued send, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendHandle(pub(crate) u64);

/// Action requested from the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Transmit a message to a direct neighbor, then call `transmit_done`
    Transmit { to: PeerIdentity, message: Bytes },
    /// Start looking up paths to `target` in the DHT
    DhtSearch { target: PeerIdentity },
    /// Stop a running DHT lookup
    DhtStop { target: PeerIdentity },
    /// Ask the transport to connect to `peer` using its HELLO
    TryConnect { peer: PeerIdentity, hello: Bytes },
    /// Notification for the local client front end
    Channel(ChannelEvent),
}
