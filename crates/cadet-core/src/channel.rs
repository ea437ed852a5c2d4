//! Channel endpoint
//!
//! Channels are logical streams multiplexed over a tunnel. The core only
//! keeps what it needs to demultiplex traffic and to answer the remote
//! side: channel numbers, the port a channel was opened on, its options and
//! whether the open handshake completed. Everything else is reported upward
//! as [`ChannelEvent`]s.

use std::fmt;
use std::ops::BitOr;

use bytes::Bytes;
use cadet_crypto::PeerIdentity;
use serde::{Deserialize, Serialize};

/// Bit set in locally chosen channel numbers when our identity sorts lower
pub const LOCAL_CHANNEL_BIT: u32 = 0x4000_0000;

/// Per-tunnel channel number
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelNumber(u32);

impl ChannelNumber {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({:#x})", self.0)
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Port a channel is opened on (32 bytes, usually a hash of a service name)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port([u8; 32]);

impl Port {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Port named by a short string, zero padded (longer names are cut)
    pub fn from_name(name: &str) -> Self {
        let mut bytes = [0u8; 32];
        let len = name.len().min(32);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(32);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(name) if end > 0 => write!(f, "Port({})", name),
            _ => write!(f, "Port({})", hex::encode(&self.0[..4])),
        }
    }
}

/// Channel options, also used by relays to pick buffering priority
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelOptions(u32);

impl ChannelOptions {
    /// Buffered, unreliable, in order
    pub const DEFAULT: Self = Self(0);
    /// Prefer latency over throughput
    pub const LOW_LATENCY: Self = Self(1);
    /// Retransmit and deliver every message
    pub const RELIABLE: Self = Self(2);
    /// Delivery order does not matter
    pub const OUT_OF_ORDER: Self = Self(4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ChannelOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::LOW_LATENCY) {
            names.push("low-latency");
        }
        if self.contains(Self::RELIABLE) {
            names.push("reliable");
        }
        if self.contains(Self::OUT_OF_ORDER) {
            names.push("out-of-order");
        }
        if names.is_empty() {
            names.push("default");
        }
        write!(f, "{}", names.join("|"))
    }
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN queued or sent, waiting for the answer
    OpenSent,
    /// Data may flow
    Ready,
}

/// One channel on a tunnel
#[derive(Debug)]
pub struct Channel {
    pub chid: ChannelNumber,
    pub port: Port,
    pub options: ChannelOptions,
    pub state: ChannelState,
    /// Whether we opened it
    pub is_origin: bool,
    next_mid: u32,
    last_mid_recv: Option<u32>,
}

impl Channel {
    /// Channel opened by the local client
    pub fn outbound(chid: ChannelNumber, port: Port, options: ChannelOptions) -> Self {
        Self {
            chid,
            port,
            options,
            state: ChannelState::OpenSent,
            is_origin: true,
            next_mid: 0,
            last_mid_recv: None,
        }
    }

    /// Channel opened by the remote peer on one of our ports
    pub fn inbound(chid: ChannelNumber, port: Port, options: ChannelOptions) -> Self {
        Self {
            chid,
            port,
            options,
            state: ChannelState::Ready,
            is_origin: false,
            next_mid: 0,
            last_mid_recv: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    /// Message id for the next outgoing data message
    pub fn next_mid(&mut self) -> u32 {
        let mid = self.next_mid;
        self.next_mid = self.next_mid.wrapping_add(1);
        mid
    }

    /// Record a received message id; false for a reliable duplicate
    pub fn accept_mid(&mut self, mid: u32) -> bool {
        if self.options.contains(ChannelOptions::RELIABLE) {
            if let Some(last) = self.last_mid_recv {
                if !crate::connection::is_pid_bigger(mid, last) {
                    return false;
                }
            }
        }
        self.last_mid_recv = Some(mid);
        true
    }

    /// Highest message id received so far
    pub fn last_mid_recv(&self) -> Option<u32> {
        self.last_mid_recv
    }
}

/// Pick the channel number for the `counter`th locally created channel
pub fn local_channel_number(counter: u32, me: &PeerIdentity, peer: &PeerIdentity) -> ChannelNumber {
    let base = counter & !LOCAL_CHANNEL_BIT & 0x7FFF_FFFF;
    if me < peer {
        ChannelNumber(base | LOCAL_CHANNEL_BIT)
    } else {
        ChannelNumber(base)
    }
}

/// Events reported to the local client front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The remote peer opened a channel on one of our ports
    IncomingChannel {
        peer: PeerIdentity,
        chid: ChannelNumber,
        port: Port,
        options: ChannelOptions,
    },
    /// Our channel was accepted
    ChannelOpened { peer: PeerIdentity, chid: ChannelNumber },
    /// Our channel was refused (port closed)
    ChannelRefused { peer: PeerIdentity, chid: ChannelNumber },
    /// Payload arrived
    Data {
        peer: PeerIdentity,
        chid: ChannelNumber,
        payload: Bytes,
    },
    /// The remote client consumed data up to `mid`
    DataAck {
        peer: PeerIdentity,
        chid: ChannelNumber,
        mid: u32,
    },
    /// The channel is gone
    ChannelDestroyed { peer: PeerIdentity, chid: ChannelNumber },
}
