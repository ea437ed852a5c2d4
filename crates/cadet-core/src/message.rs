//! Wire messages of the CADET overlay
//!
//! Every message starts with a 4 byte header:
//! [Size: 2 bytes, including header][Type: 2 bytes]
//!
//! Hop-level messages carry a 32 byte connection id and are forwarded by
//! relays without being decoded beyond the header and connection id. The
//! plaintext inside `TUNNEL_ENCRYPTED` is a concatenation of tunnel payload
//! messages using the same header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cadet_crypto::constants::{HMAC_SIZE, PEER_IDENTITY_SIZE, SIGNATURE_SIZE, X25519_KEY_SIZE};
use cadet_crypto::{AuthCode, EphemeralPublicKey, PeerIdentity, Signature};

use crate::channel::{ChannelNumber, ChannelOptions, Port};
use crate::connection::ConnectionId;
use crate::error::WireError;

/// Header size
pub const HEADER_SIZE: usize = 4;

/// Largest encodable message
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Largest channel payload that still fits one encrypted message
pub const MAX_CHANNEL_PAYLOAD: usize = 60 * 1024;

/// Connection id size
pub const CID_SIZE: usize = 32;

/// Signature purpose of ephemeral key announcements
pub const SIGNATURE_PURPOSE_KX: u32 = 0x4341_4b58;

/// KX flag: the receiver must answer with its own KX
pub const KX_FLAG_FORCE_REPLY: u32 = 1;

/// KX flag: the message carries an encrypted ping
pub const KX_FLAG_HAS_PING: u32 = 2;

const SIGNED_EPHEMERAL_SIZE: usize =
    4 + 8 + 8 + X25519_KEY_SIZE + PEER_IDENTITY_SIZE + SIGNATURE_SIZE;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Connection create (path + cid)
    ConnectionCreate = 1000,

    /// Connection create acknowledgment
    ConnectionCreateAck = 1001,

    /// Connection broken notification
    ConnectionBroken = 1002,

    /// Connection destroy
    ConnectionDestroy = 1003,

    /// Hop ACK window update
    ConnectionAck = 1004,

    /// Request for a fresh ACK
    ConnectionPoll = 1005,

    /// Ephemeral key exchange
    TunnelKx = 1010,

    /// Key exchange answer with authentication
    TunnelKxAuth = 1011,

    /// Encrypted tunnel payload
    TunnelEncrypted = 1012,

    /// Tunnel keepalive (inside encrypted payload)
    Keepalive = 1020,

    /// Channel open request
    ChannelOpen = 1021,

    /// Channel open accepted
    ChannelOpenAck = 1022,

    /// Channel open refused
    ChannelOpenNack = 1023,

    /// Channel destroy
    ChannelDestroy = 1024,

    /// Channel data
    ChannelData = 1025,

    /// Channel data acknowledgment
    ChannelDataAck = 1026,
}

impl TryFrom<u16> for MessageType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1000 => Ok(Self::ConnectionCreate),
            1001 => Ok(Self::ConnectionCreateAck),
            1002 => Ok(Self::ConnectionBroken),
            1003 => Ok(Self::ConnectionDestroy),
            1004 => Ok(Self::ConnectionAck),
            1005 => Ok(Self::ConnectionPoll),
            1010 => Ok(Self::TunnelKx),
            1011 => Ok(Self::TunnelKxAuth),
            1012 => Ok(Self::TunnelEncrypted),
            1020 => Ok(Self::Keepalive),
            1021 => Ok(Self::ChannelOpen),
            1022 => Ok(Self::ChannelOpenAck),
            1023 => Ok(Self::ChannelOpenNack),
            1024 => Ok(Self::ChannelDestroy),
            1025 => Ok(Self::ChannelData),
            1026 => Ok(Self::ChannelDataAck),
            _ => Err(WireError::UnknownType(value)),
        }
    }
}

impl MessageType {
    /// Whether relays must not answer a missing route with BROKEN
    pub fn is_teardown(self) -> bool {
        matches!(self, Self::ConnectionBroken | Self::ConnectionDestroy)
    }
}

/// Read the header of the first message in `bytes`
pub fn peek_header(bytes: &[u8]) -> Result<(usize, MessageType), WireError> {
    need(bytes, HEADER_SIZE)?;
    let size = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let msg_type = MessageType::try_from(u16::from_be_bytes([bytes[2], bytes[3]]))?;
    if size < HEADER_SIZE {
        return Err(WireError::BadSize {
            declared: size,
            actual: bytes.len(),
        });
    }
    Ok((size, msg_type))
}

fn need(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn begin(msg_type: MessageType, body: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body);
    buf.put_u16(0);
    buf.put_u16(msg_type as u16);
    buf
}

fn finish(mut buf: BytesMut) -> Result<Bytes, WireError> {
    let size = buf.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(WireError::Malformed(format!("message of {} bytes is too large", size)));
    }
    buf[0..2].copy_from_slice(&(size as u16).to_be_bytes());
    Ok(buf.freeze())
}

fn get_cid(buf: &mut &[u8]) -> Result<ConnectionId, WireError> {
    need(buf, CID_SIZE)?;
    let mut bytes = [0u8; CID_SIZE];
    buf.copy_to_slice(&mut bytes);
    Ok(ConnectionId::from_bytes(bytes))
}

fn get_peer(buf: &mut &[u8]) -> Result<PeerIdentity, WireError> {
    need(buf, PEER_IDENTITY_SIZE)?;
    let mut bytes = [0u8; PEER_IDENTITY_SIZE];
    buf.copy_to_slice(&mut bytes);
    Ok(PeerIdentity::from_bytes(bytes))
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

/// Create a connection along `path` (first entry is the initiator)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCreate {
    pub options: ChannelOptions,
    pub cid: ConnectionId,
    pub path: Vec<PeerIdentity>,
}

/// Connection create acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCreateAck {
    pub cid: ConnectionId,
}

/// The link between `peer1` and `peer2` on the connection broke
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionBroken {
    pub cid: ConnectionId,
    pub peer1: PeerIdentity,
    pub peer2: PeerIdentity,
}

/// Connection destroyed by an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDestroy {
    pub cid: ConnectionId,
}

/// Receiver allows packet ids up to and including `ack`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAck {
    pub cid: ConnectionId,
    pub ack: u32,
}

/// Sender asks for an ACK; `pid` is the last packet id it sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPoll {
    pub cid: ConnectionId,
    pub pid: u32,
}

/// Ephemeral key announcement signed by the long-term identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEphemeral {
    pub purpose: u32,
    /// Microseconds since the UNIX epoch
    pub created: u64,
    /// Microseconds since the UNIX epoch
    pub expires: u64,
    pub key: EphemeralPublicKey,
    pub origin: PeerIdentity,
    pub signature: Signature,
}

impl SignedEphemeral {
    /// Bytes covered by the signature
    pub fn signed_bytes(purpose: u32, created: u64, expires: u64, key: &EphemeralPublicKey, origin: &PeerIdentity) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 + 8 + X25519_KEY_SIZE + PEER_IDENTITY_SIZE);
        buf.put_u32(purpose);
        buf.put_u64(created);
        buf.put_u64(expires);
        buf.put_slice(key.as_bytes());
        buf.put_slice(origin.as_bytes());
        buf
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.purpose);
        buf.put_u64(self.created);
        buf.put_u64(self.expires);
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(self.origin.as_bytes());
        buf.put_slice(self.signature.as_bytes());
    }

    fn get(buf: &mut &[u8]) -> Result<Self, WireError> {
        need(buf, SIGNED_EPHEMERAL_SIZE)?;
        let purpose = buf.get_u32();
        let created = buf.get_u64();
        let expires = buf.get_u64();
        let mut key = [0u8; X25519_KEY_SIZE];
        buf.copy_to_slice(&mut key);
        let origin = get_peer(buf)?;
        let mut signature = [0u8; SIGNATURE_SIZE];
        buf.copy_to_slice(&mut signature);
        Ok(Self {
            purpose,
            created,
            expires,
            key: EphemeralPublicKey::from_bytes(key),
            origin,
            signature: Signature::from_bytes(signature),
        })
    }
}

/// Small encrypted blob used for the ping challenge and pong answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub iv: u32,
    pub ciphertext: Bytes,
}

impl EncryptedBlob {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.iv);
        buf.put_u16(self.ciphertext.len() as u16);
        buf.put_slice(&self.ciphertext);
    }

    fn get(buf: &mut &[u8]) -> Result<Self, WireError> {
        need(buf, 6)?;
        let iv = buf.get_u32();
        let len = buf.get_u16() as usize;
        need(buf, len)?;
        let ciphertext = Bytes::copy_from_slice(&buf[..len]);
        buf.advance(len);
        Ok(Self { iv, ciphertext })
    }

    fn size(&self) -> usize {
        6 + self.ciphertext.len()
    }
}

/// Ephemeral key exchange, optionally carrying an encrypted ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelKx {
    pub cid: ConnectionId,
    pub flags: u32,
    pub sender_status: u32,
    pub ephemeral: SignedEphemeral,
    pub ping: Option<EncryptedBlob>,
}

impl TunnelKx {
    pub fn force_reply(&self) -> bool {
        self.flags & KX_FLAG_FORCE_REPLY != 0
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(self.cid.as_bytes());
        let mut flags = self.flags & !KX_FLAG_HAS_PING;
        if self.ping.is_some() {
            flags |= KX_FLAG_HAS_PING;
        }
        buf.put_u32(flags);
        buf.put_u32(self.sender_status);
        self.ephemeral.put(buf);
        if let Some(ping) = &self.ping {
            ping.put(buf);
        }
    }

    fn get(buf: &mut &[u8]) -> Result<Self, WireError> {
        let cid = get_cid(buf)?;
        let flags = get_u32(buf)?;
        let sender_status = get_u32(buf)?;
        let ephemeral = SignedEphemeral::get(buf)?;
        let ping = if flags & KX_FLAG_HAS_PING != 0 {
            Some(EncryptedBlob::get(buf)?)
        } else {
            None
        };
        Ok(Self {
            cid,
            flags: flags & !KX_FLAG_HAS_PING,
            sender_status,
            ephemeral,
            ping,
        })
    }

    fn size(&self) -> usize {
        CID_SIZE + 8 + SIGNED_EPHEMERAL_SIZE + self.ping.as_ref().map_or(0, EncryptedBlob::size)
    }
}

/// Answer to a ping: the sender's KX plus the encrypted challenge nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelKxAuth {
    pub kx: TunnelKx,
    pub pong: EncryptedBlob,
    pub auth: AuthCode,
}

/// Encrypted end-to-end payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEncrypted {
    pub cid: ConnectionId,
    pub pid: u32,
    pub ttl: u32,
    pub iv: u32,
    pub hmac: AuthCode,
    pub ciphertext: Bytes,
}

/// Hop-level message, as exchanged between neighbors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectionCreate(ConnectionCreate),
    ConnectionCreateAck(ConnectionCreateAck),
    ConnectionBroken(ConnectionBroken),
    ConnectionDestroy(ConnectionDestroy),
    ConnectionAck(ConnectionAck),
    ConnectionPoll(ConnectionPoll),
    TunnelKx(TunnelKx),
    TunnelKxAuth(TunnelKxAuth),
    TunnelEncrypted(TunnelEncrypted),
}

impl Message {
    /// Message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConnectionCreate(_) => MessageType::ConnectionCreate,
            Self::ConnectionCreateAck(_) => MessageType::ConnectionCreateAck,
            Self::ConnectionBroken(_) => MessageType::ConnectionBroken,
            Self::ConnectionDestroy(_) => MessageType::ConnectionDestroy,
            Self::ConnectionAck(_) => MessageType::ConnectionAck,
            Self::ConnectionPoll(_) => MessageType::ConnectionPoll,
            Self::TunnelKx(_) => MessageType::TunnelKx,
            Self::TunnelKxAuth(_) => MessageType::TunnelKxAuth,
            Self::TunnelEncrypted(_) => MessageType::TunnelEncrypted,
        }
    }

    /// Connection the message belongs to
    pub fn cid(&self) -> &ConnectionId {
        match self {
            Self::ConnectionCreate(m) => &m.cid,
            Self::ConnectionCreateAck(m) => &m.cid,
            Self::ConnectionBroken(m) => &m.cid,
            Self::ConnectionDestroy(m) => &m.cid,
            Self::ConnectionAck(m) => &m.cid,
            Self::ConnectionPoll(m) => &m.cid,
            Self::TunnelKx(m) => &m.cid,
            Self::TunnelKxAuth(m) => &m.kx.cid,
            Self::TunnelEncrypted(m) => &m.cid,
        }
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf;
        match self {
            Self::ConnectionCreate(m) => {
                buf = begin(MessageType::ConnectionCreate, 4 + CID_SIZE + m.path.len() * PEER_IDENTITY_SIZE);
                buf.put_u32(m.options.bits());
                buf.put_slice(m.cid.as_bytes());
                for peer in &m.path {
                    buf.put_slice(peer.as_bytes());
                }
            }
            Self::ConnectionCreateAck(m) => {
                buf = begin(MessageType::ConnectionCreateAck, 4 + CID_SIZE);
                buf.put_u32(0);
                buf.put_slice(m.cid.as_bytes());
            }
            Self::ConnectionBroken(m) => {
                buf = begin(MessageType::ConnectionBroken, 4 + CID_SIZE + 2 * PEER_IDENTITY_SIZE);
                buf.put_u32(0);
                buf.put_slice(m.cid.as_bytes());
                buf.put_slice(m.peer1.as_bytes());
                buf.put_slice(m.peer2.as_bytes());
            }
            Self::ConnectionDestroy(m) => {
                buf = begin(MessageType::ConnectionDestroy, 4 + CID_SIZE);
                buf.put_u32(0);
                buf.put_slice(m.cid.as_bytes());
            }
            Self::ConnectionAck(m) => {
                buf = begin(MessageType::ConnectionAck, 4 + CID_SIZE);
                buf.put_u32(m.ack);
                buf.put_slice(m.cid.as_bytes());
            }
            Self::ConnectionPoll(m) => {
                buf = begin(MessageType::ConnectionPoll, 4 + CID_SIZE);
                buf.put_u32(m.pid);
                buf.put_slice(m.cid.as_bytes());
            }
            Self::TunnelKx(m) => {
                buf = begin(MessageType::TunnelKx, m.size());
                m.put(&mut buf);
            }
            Self::TunnelKxAuth(m) => {
                buf = begin(MessageType::TunnelKxAuth, m.kx.size() + m.pong.size() + HMAC_SIZE);
                m.kx.put(&mut buf);
                m.pong.put(&mut buf);
                buf.put_slice(&m.auth);
            }
            Self::TunnelEncrypted(m) => {
                buf = begin(MessageType::TunnelEncrypted, CID_SIZE + 12 + HMAC_SIZE + m.ciphertext.len());
                buf.put_slice(m.cid.as_bytes());
                buf.put_u32(m.pid);
                buf.put_u32(m.ttl);
                buf.put_u32(m.iv);
                buf.put_slice(&m.hmac);
                buf.put_slice(&m.ciphertext);
            }
        }
        finish(buf)
    }

    /// Deserialize from bytes; the header size must match exactly
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (size, msg_type) = peek_header(bytes)?;
        if size != bytes.len() {
            return Err(WireError::BadSize {
                declared: size,
                actual: bytes.len(),
            });
        }
        let mut buf = &bytes[HEADER_SIZE..];

        let message = match msg_type {
            MessageType::ConnectionCreate => {
                let options = ChannelOptions::from_bits(get_u32(&mut buf)?);
                let cid = get_cid(&mut buf)?;
                if buf.len() % PEER_IDENTITY_SIZE != 0 {
                    return Err(WireError::Malformed(format!(
                        "path of {} bytes is not a whole number of identities",
                        buf.len()
                    )));
                }
                let mut path = Vec::with_capacity(buf.len() / PEER_IDENTITY_SIZE);
                while !buf.is_empty() {
                    path.push(get_peer(&mut buf)?);
                }
                Self::ConnectionCreate(ConnectionCreate { options, cid, path })
            }
            MessageType::ConnectionCreateAck => {
                get_u32(&mut buf)?;
                Self::ConnectionCreateAck(ConnectionCreateAck { cid: get_cid(&mut buf)? })
            }
            MessageType::ConnectionBroken => {
                get_u32(&mut buf)?;
                let cid = get_cid(&mut buf)?;
                let peer1 = get_peer(&mut buf)?;
                let peer2 = get_peer(&mut buf)?;
                Self::ConnectionBroken(ConnectionBroken { cid, peer1, peer2 })
            }
            MessageType::ConnectionDestroy => {
                get_u32(&mut buf)?;
                Self::ConnectionDestroy(ConnectionDestroy { cid: get_cid(&mut buf)? })
            }
            MessageType::ConnectionAck => {
                let ack = get_u32(&mut buf)?;
                Self::ConnectionAck(ConnectionAck { cid: get_cid(&mut buf)?, ack })
            }
            MessageType::ConnectionPoll => {
                let pid = get_u32(&mut buf)?;
                Self::ConnectionPoll(ConnectionPoll { cid: get_cid(&mut buf)?, pid })
            }
            MessageType::TunnelKx => Self::TunnelKx(TunnelKx::get(&mut buf)?),
            MessageType::TunnelKxAuth => {
                let kx = TunnelKx::get(&mut buf)?;
                let pong = EncryptedBlob::get(&mut buf)?;
                need(buf, HMAC_SIZE)?;
                let mut auth = [0u8; HMAC_SIZE];
                buf.copy_to_slice(&mut auth);
                Self::TunnelKxAuth(TunnelKxAuth { kx, pong, auth })
            }
            MessageType::TunnelEncrypted => {
                let cid = get_cid(&mut buf)?;
                let pid = get_u32(&mut buf)?;
                let ttl = get_u32(&mut buf)?;
                let iv = get_u32(&mut buf)?;
                need(buf, HMAC_SIZE)?;
                let mut hmac = [0u8; HMAC_SIZE];
                buf.copy_to_slice(&mut hmac);
                let ciphertext = Bytes::copy_from_slice(buf);
                buf = &[];
                Self::TunnelEncrypted(TunnelEncrypted { cid, pid, ttl, iv, hmac, ciphertext })
            }
            other => return Err(WireError::UnexpectedType(other as u16)),
        };

        if !buf.is_empty() {
            return Err(WireError::Malformed(format!(
                "{} trailing bytes after {:?}",
                buf.len(),
                msg_type
            )));
        }
        Ok(message)
    }
}

/// Read the connection id of a hop-level message without decoding the rest
pub fn peek_cid(bytes: &[u8]) -> Result<ConnectionId, WireError> {
    let (_, msg_type) = peek_header(bytes)?;
    let offset = match msg_type {
        MessageType::ConnectionCreate
        | MessageType::ConnectionCreateAck
        | MessageType::ConnectionBroken
        | MessageType::ConnectionDestroy
        | MessageType::ConnectionAck
        | MessageType::ConnectionPoll => HEADER_SIZE + 4,
        MessageType::TunnelKx | MessageType::TunnelKxAuth | MessageType::TunnelEncrypted => HEADER_SIZE,
        other => return Err(WireError::UnexpectedType(other as u16)),
    };
    let mut buf = bytes.get(offset..).unwrap_or(&[]);
    get_cid(&mut buf)
}

/// Plaintext message carried inside an encrypted tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelPayload {
    Keepalive,
    ChannelOpen {
        chid: ChannelNumber,
        options: ChannelOptions,
        port: Port,
    },
    ChannelOpenAck {
        chid: ChannelNumber,
    },
    ChannelOpenNack {
        chid: ChannelNumber,
    },
    ChannelDestroy {
        chid: ChannelNumber,
    },
    ChannelData {
        chid: ChannelNumber,
        mid: u32,
        payload: Bytes,
    },
    ChannelDataAck {
        chid: ChannelNumber,
        mid: u32,
        futures: u64,
    },
}

impl TunnelPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Keepalive => MessageType::Keepalive,
            Self::ChannelOpen { .. } => MessageType::ChannelOpen,
            Self::ChannelOpenAck { .. } => MessageType::ChannelOpenAck,
            Self::ChannelOpenNack { .. } => MessageType::ChannelOpenNack,
            Self::ChannelDestroy { .. } => MessageType::ChannelDestroy,
            Self::ChannelData { .. } => MessageType::ChannelData,
            Self::ChannelDataAck { .. } => MessageType::ChannelDataAck,
        }
    }

    /// Channel addressed by the message, if any
    pub fn channel(&self) -> Option<ChannelNumber> {
        match self {
            Self::Keepalive => None,
            Self::ChannelOpen { chid, .. }
            | Self::ChannelOpenAck { chid }
            | Self::ChannelOpenNack { chid }
            | Self::ChannelDestroy { chid }
            | Self::ChannelData { chid, .. }
            | Self::ChannelDataAck { chid, .. } => Some(*chid),
        }
    }

    /// Whether losing the message is harmless
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Keepalive | Self::ChannelData { .. })
    }

    /// Serialize to bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = begin(self.message_type(), 48);
        match self {
            Self::Keepalive => {}
            Self::ChannelOpen { chid, options, port } => {
                buf.put_u32(chid.as_u32());
                buf.put_u32(options.bits());
                buf.put_slice(port.as_bytes());
            }
            Self::ChannelOpenAck { chid }
            | Self::ChannelOpenNack { chid }
            | Self::ChannelDestroy { chid } => {
                buf.put_u32(chid.as_u32());
            }
            Self::ChannelData { chid, mid, payload } => {
                buf.put_u32(chid.as_u32());
                buf.put_u32(*mid);
                buf.put_slice(payload);
            }
            Self::ChannelDataAck { chid, mid, futures } => {
                buf.put_u32(chid.as_u32());
                buf.put_u32(*mid);
                buf.put_u64(*futures);
            }
        }
        finish(buf)
    }

    /// Split a decrypted plaintext into its payload messages
    pub fn decode_all(mut plaintext: &[u8]) -> Result<Vec<Self>, WireError> {
        let mut out = Vec::new();
        while !plaintext.is_empty() {
            let (size, _) = peek_header(plaintext)?;
            need(plaintext, size)?;
            out.push(Self::decode(&plaintext[..size])?);
            plaintext = &plaintext[size..];
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (_, msg_type) = peek_header(bytes)?;
        let mut buf = &bytes[HEADER_SIZE..];
        let payload = match msg_type {
            MessageType::Keepalive => Self::Keepalive,
            MessageType::ChannelOpen => {
                let chid = ChannelNumber::new(get_u32(&mut buf)?);
                let options = ChannelOptions::from_bits(get_u32(&mut buf)?);
                need(buf, 32)?;
                let mut port = [0u8; 32];
                buf.copy_to_slice(&mut port);
                Self::ChannelOpen {
                    chid,
                    options,
                    port: Port::from_bytes(port),
                }
            }
            MessageType::ChannelOpenAck => Self::ChannelOpenAck {
                chid: ChannelNumber::new(get_u32(&mut buf)?),
            },
            MessageType::ChannelOpenNack => Self::ChannelOpenNack {
                chid: ChannelNumber::new(get_u32(&mut buf)?),
            },
            MessageType::ChannelDestroy => Self::ChannelDestroy {
                chid: ChannelNumber::new(get_u32(&mut buf)?),
            },
            MessageType::ChannelData => {
                let chid = ChannelNumber::new(get_u32(&mut buf)?);
                let mid = get_u32(&mut buf)?;
                let payload = Bytes::copy_from_slice(buf);
                buf = &[];
                Self::ChannelData { chid, mid, payload }
            }
            MessageType::ChannelDataAck => {
                let chid = ChannelNumber::new(get_u32(&mut buf)?);
                let mid = get_u32(&mut buf)?;
                let futures = get_u64(&mut buf)?;
                Self::ChannelDataAck { chid, mid, futures }
            }
            other => return Err(WireError::UnexpectedType(other as u16)),
        };
        if !buf.is_empty() {
            return Err(WireError::Malformed(format!(
                "{} trailing bytes after {:?}",
                buf.len(),
                msg_type
            )));
        }
        Ok(payload)
    }
}

/// Plaintext of a ping: who it is meant for and the challenge nonce
pub fn encode_ping(target: &PeerIdentity, nonce: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PEER_IDENTITY_SIZE + 4);
    buf.put_slice(target.as_bytes());
    buf.put_u32(nonce);
    buf
}

/// Inverse of [`encode_ping`]
pub fn decode_ping(mut plaintext: &[u8]) -> Result<(PeerIdentity, u32), WireError> {
    let target = get_peer(&mut plaintext)?;
    let nonce = get_u32(&mut plaintext)?;
    if !plaintext.is_empty() {
        return Err(WireError::Malformed("oversized ping".into()));
    }
    Ok((target, nonce))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadet_crypto::Identity;

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::from_bytes([byte; CID_SIZE])
    }

    fn peer(byte: u8) -> PeerIdentity {
        PeerIdentity::from_bytes([byte; PEER_IDENTITY_SIZE])
    }

    #[test]
    fn test_connection_create_layout() {
        let msg = Message::ConnectionCreate(ConnectionCreate {
            options: ChannelOptions::RELIABLE,
            cid: cid(7),
            path: vec![peer(1), peer(2), peer(3)],
        });
        let bytes = msg.encode().unwrap();

        assert_eq!(bytes.len(), HEADER_SIZE + 4 + CID_SIZE + 3 * PEER_IDENTITY_SIZE);
        assert_eq!(&bytes[0..2], &(bytes.len() as u16).to_be_bytes());
        assert_eq!(&bytes[2..4], &1000u16.to_be_bytes());
        assert_eq!(peek_cid(&bytes).unwrap(), cid(7));
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_create_with_partial_identity_rejected() {
        let msg = Message::ConnectionCreate(ConnectionCreate {
            options: ChannelOptions::default(),
            cid: cid(1),
            path: vec![peer(1)],
        });
        let mut bytes = BytesMut::from(&msg.encode().unwrap()[..]);
        bytes.put_u8(0xAA);
        let len = bytes.len() as u16;
        bytes[0..2].copy_from_slice(&len.to_be_bytes());

        assert!(matches!(Message::decode(&bytes), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let bytes = Message::ConnectionDestroy(ConnectionDestroy { cid: cid(2) })
            .encode()
            .unwrap();
        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::BadSize { .. })
        ));
        assert!(matches!(
            Message::decode(&[0, 4, 0xFF, 0xFF]),
            Err(WireError::UnknownType(0xFFFF))
        ));
    }

    #[test]
    fn test_kx_auth_with_ping() {
        let identity = Identity::generate();
        let ephemeral = SignedEphemeral {
            purpose: SIGNATURE_PURPOSE_KX,
            created: 1,
            expires: 2,
            key: EphemeralPublicKey::from_bytes([9; 32]),
            origin: identity.peer_id(),
            signature: identity.sign(b"x"),
        };
        let kx = TunnelKx {
            cid: cid(3),
            flags: KX_FLAG_FORCE_REPLY,
            sender_status: 2,
            ephemeral,
            ping: Some(EncryptedBlob {
                iv: 5,
                ciphertext: Bytes::from_static(b"challenge"),
            }),
        };
        let msg = Message::TunnelKxAuth(TunnelKxAuth {
            kx,
            pong: EncryptedBlob {
                iv: 6,
                ciphertext: Bytes::from_static(b"nonce"),
            },
            auth: [4; HMAC_SIZE],
        });
        let bytes = msg.encode().unwrap();
        let decoded = Message::decode(&bytes).unwrap();

        assert_eq!(decoded, msg);
        match decoded {
            Message::TunnelKxAuth(auth) => assert!(auth.kx.force_reply()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_payload_concatenation() {
        let chid = ChannelNumber::new(0x4000_0001);
        let payloads = vec![
            TunnelPayload::Keepalive,
            TunnelPayload::ChannelData {
                chid,
                mid: 3,
                payload: Bytes::from_static(b"hello"),
            },
            TunnelPayload::ChannelDataAck {
                chid,
                mid: 3,
                futures: 0,
            },
        ];
        let mut plaintext = Vec::new();
        for payload in &payloads {
            plaintext.extend_from_slice(&payload.encode().unwrap());
        }

        assert_eq!(TunnelPayload::decode_all(&plaintext).unwrap(), payloads);
        assert!(TunnelPayload::decode_all(&plaintext[..plaintext.len() - 2]).is_err());
    }

    #[test]
    fn test_ping_plaintext() {
        let plaintext = encode_ping(&peer(4), 77);
        assert_eq!(decode_ping(&plaintext).unwrap(), (peer(4), 77));
        assert!(decode_ping(&plaintext[..10]).is_err());
    }
}
