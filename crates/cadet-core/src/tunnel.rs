//! Tunnels
//!
//! A tunnel is the end-to-end relationship with one destination peer. It
//! owns the connections leading there, the key exchange state and the
//! channels multiplexed on top. Payload handed to a tunnel waits in
//! plaintext until the keys are confirmed, then goes out encrypted over
//! the least loaded ready connection, one message per free slot.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use cadet_crypto::PeerIdentity;
use tracing::{debug, info, trace, warn};

use crate::channel::{
    local_channel_number, Channel, ChannelEvent, ChannelNumber, ChannelOptions, ChannelState, Port,
};
use crate::connection::ConnectionId;
use crate::core::{Core, SendLocation, TimerEvent};
use crate::error::{CoreError, CoreResult};
use crate::kx::{EncryptionState, TunnelCrypto};
use crate::message::{Message, TunnelEncrypted, TunnelPayload, MAX_CHANNEL_PAYLOAD};
use crate::output::{Continuation, Output, SendHandle, SendOutcome};
use crate::path::PathId;
use crate::timer::TimerId;

/// Connections a tunnel tries to keep open
pub const DESIRED_CONNECTIONS_PER_TUNNEL: usize = 3;

/// Connections above this are trimmed
pub const MAX_CONNECTIONS_PER_TUNNEL: usize = 6;

/// Connectivity state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Just created
    New,
    /// No connection, looking for paths
    Searching,
    /// Connections exist, none ready
    Waiting,
    /// At least one connection is ready
    Ready,
    /// Being destroyed
    Shutdown,
}

/// Plaintext payload waiting for a connection
struct QueuedPayload {
    handle: SendHandle,
    plaintext: Bytes,
    droppable: bool,
}

/// End-to-end state towards one peer
pub(crate) struct Tunnel {
    pub(crate) peer: PeerIdentity,
    pub(crate) cstate: ConnectivityState,
    pub(crate) crypto: TunnelCrypto,
    /// Local connections, oldest first
    connections: Vec<ConnectionId>,
    channels: HashMap<ChannelNumber, Channel>,
    next_chid: u32,
    queue: VecDeque<QueuedPayload>,
    destroy_timer: Option<TimerId>,
}

impl Tunnel {
    fn new(peer: PeerIdentity) -> Self {
        Self {
            peer,
            cstate: ConnectivityState::New,
            crypto: TunnelCrypto::new(),
            connections: Vec::new(),
            channels: HashMap::new(),
            next_chid: 0,
            queue: VecDeque::new(),
            destroy_timer: None,
        }
    }

    /// Someone locally wants traffic to flow
    fn is_wanted(&self) -> bool {
        !self.channels.is_empty() || !self.queue.is_empty()
    }
}

/// Snapshot of a tunnel for callers outside the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub peer: PeerIdentity,
    pub cstate: ConnectivityState,
    pub estate: EncryptionState,
    pub connections: usize,
    pub ready_connections: usize,
    pub channels: usize,
    pub queued: usize,
    pub kx_in_progress: bool,
}

impl Core {
    /// Create the tunnel to `peer` if needed; true if it was created
    fn get_or_create_tunnel(&mut self, peer: PeerIdentity) -> CoreResult<bool> {
        if peer == self.me {
            return Err(CoreError::LoopbackTunnel);
        }
        if self.tunnels.contains_key(&peer) {
            return Ok(false);
        }
        let now = self.now;
        self.peers.get_or_create(peer, now);
        self.tunnels.insert(peer, Tunnel::new(peer));
        self.stats.update("# tunnels", 1);
        info!("Tunnel to {:?} created", peer);

        let hello = self
            .peers
            .by_id(&peer)
            .filter(|p| !p.is_neighbor())
            .and_then(|p| p.hello.clone());
        if let Some(hello) = hello {
            self.emit(Output::TryConnect { peer, hello });
        }
        self.evict_peers_if_needed();
        Ok(true)
    }

    pub(crate) fn tunnel_ready_connection(&self, peer: PeerIdentity) -> Option<ConnectionId> {
        let tunnel = self.tunnels.get(&peer)?;
        tunnel
            .connections
            .iter()
            .filter_map(|cid| self.connections.get(cid))
            .filter(|c| c.is_ready())
            .min_by_key(|c| c.queue_len())
            .map(|c| c.cid)
    }

    /// Ready connection with room for payload, least queued first
    pub(crate) fn tunnel_get_connection(&self, peer: PeerIdentity) -> Option<ConnectionId> {
        let tunnel = self.tunnels.get(&peer)?;
        tunnel
            .connections
            .iter()
            .filter_map(|cid| self.connections.get(cid))
            .filter(|c| c.is_ready() && c.get_buffer() > 0)
            .min_by_key(|c| c.queue_len())
            .map(|c| c.cid)
    }

    fn tunnel_update_cstate(&mut self, peer: PeerIdentity) {
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        if tunnel.cstate == ConnectivityState::Shutdown {
            return;
        }
        let ready = tunnel
            .connections
            .iter()
            .filter(|cid| self.connections.get(cid).map_or(false, |c| c.is_ready()))
            .count();
        let cstate = if ready > 0 {
            ConnectivityState::Ready
        } else if !tunnel.connections.is_empty() {
            ConnectivityState::Waiting
        } else {
            ConnectivityState::Searching
        };
        let wanted = tunnel.is_wanted();
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            if tunnel.cstate != cstate {
                debug!("Tunnel {:?} cstate: {:?} -> {:?}", peer, tunnel.cstate, cstate);
                tunnel.cstate = cstate;
            }
        }

        let searching = self.peers.by_id(&peer).map_or(false, |p| p.searching);
        if cstate == ConnectivityState::Searching && wanted && !searching {
            if let Some(entry) = self.peers.by_id_mut(&peer) {
                entry.searching = true;
            }
            debug!("Looking up paths to {:?}", peer);
            self.emit(Output::DhtSearch { target: peer });
        } else if searching && cstate == ConnectivityState::Ready && ready >= DESIRED_CONNECTIONS_PER_TUNNEL {
            self.tunnel_stop_search(peer);
        }
    }

    fn tunnel_stop_search(&mut self, peer: PeerIdentity) {
        let Some(entry) = self.peers.by_id_mut(&peer) else {
            return;
        };
        if entry.searching {
            entry.searching = false;
            self.emit(Output::DhtStop { target: peer });
        }
    }

    /// Open connections over the best unused paths, trim surplus ones
    pub(crate) fn tunnel_maintain_connections(&mut self, peer: PeerIdentity) {
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        if tunnel.cstate == ConnectivityState::Shutdown {
            return;
        }
        let have = tunnel.connections.len();
        if tunnel.is_wanted() && have < DESIRED_CONNECTIONS_PER_TUNNEL {
            let mut candidates: Vec<(PathId, usize, f64)> = self
                .peers
                .paths_through(&peer)
                .into_iter()
                .filter(|(_, off)| *off >= 1)
                .filter_map(|(id, off)| {
                    let path = self.peers.path(id)?;
                    if path.is_invalid() || path.entry(off)?.connection.is_some() {
                        return None;
                    }
                    let first = self.peers.hop_identity(id, 1)?;
                    self.peers
                        .is_neighbor(&first)
                        .then_some((id, off, path.desirability()))
                })
                .collect();
            candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| b.2.total_cmp(&a.2)));
            for (id, off, _) in candidates.into_iter().take(DESIRED_CONNECTIONS_PER_TUNNEL - have) {
                if let Some(cid) = self.connection_open(peer, id, off, ChannelOptions::RELIABLE) {
                    if let Some(tunnel) = self.tunnels.get_mut(&peer) {
                        tunnel.connections.push(cid);
                    }
                }
            }
        }
        self.tunnel_trim_connections(peer);
        self.tunnel_update_cstate(peer);
    }

    /// Destroy the newest indirect connections above the maximum
    fn tunnel_trim_connections(&mut self, peer: PeerIdentity) {
        loop {
            let Some(tunnel) = self.tunnels.get(&peer) else {
                return;
            };
            if tunnel.connections.len() <= MAX_CONNECTIONS_PER_TUNNEL {
                return;
            }
            let victim = tunnel
                .connections
                .iter()
                .rev()
                .find(|cid| self.connections.get(cid).map_or(true, |c| c.off > 1))
                .or(tunnel.connections.last())
                .copied();
            let Some(cid) = victim else {
                return;
            };
            debug!("Tunnel {:?} has too many connections, dropping {}", peer, cid);
            if let Some(tunnel) = self.tunnels.get_mut(&peer) {
                tunnel.connections.retain(|c| *c != cid);
            }
            self.connection_destroy(cid, true);
        }
    }

    /// The last hop got a CREATE from `origin`; accept it into a tunnel
    pub(crate) fn tunnel_accept_connection(
        &mut self,
        origin: PeerIdentity,
        path: PathId,
        off: usize,
        cid: ConnectionId,
        options: ChannelOptions,
    ) -> bool {
        if origin == self.me {
            return false;
        }
        let Some(entry) = self.peers.path(path).and_then(|p| p.entry(off)) else {
            return false;
        };
        // Both ends created a connection over the same path at once: the
        // larger connection id survives on both sides
        let replaced = match entry.connection {
            None => None,
            Some(existing) if cid > existing => Some(existing),
            Some(_) => {
                debug!("Path {:?} to {:?} already carries a connection", path, origin);
                return false;
            }
        };
        let created = match self.get_or_create_tunnel(origin) {
            Ok(created) => created,
            Err(_) => return false,
        };
        if let Some(existing) = replaced {
            debug!("Replacing connection {} with {} on path {:?}", existing, cid, path);
            self.peers.del_connection(path, off, existing);
        }
        if !self.connection_accept(origin, path, off, cid, options) {
            return false;
        }
        if let Some(tunnel) = self.tunnels.get_mut(&origin) {
            tunnel.connections.push(cid);
        }
        if let Some(existing) = replaced {
            self.connection_destroy(existing, true);
        }
        if created {
            self.tunnel_schedule_destroy(origin);
        }
        self.tunnel_trim_connections(origin);
        self.tunnel_update_cstate(origin);
        true
    }

    /// A connection of the tunnel became ready
    pub(crate) fn tunnel_connection_ready(&mut self, peer: PeerIdentity, cid: ConnectionId) {
        trace!("Tunnel {:?}: connection {} ready", peer, cid);
        self.tunnel_update_cstate(peer);
        let generation = self.kx.generation();
        let Some(tunnel) = self.tunnels.get(&peer) else {
            return;
        };
        let crypto = &tunnel.crypto;
        let needs_kx = crypto.estate == EncryptionState::Uninitialized || crypto.is_stale(generation);
        if needs_kx && crypto.rekey_timer.is_none() {
            self.tunnel_rekey(peer);
            return;
        }
        let idle = tunnel.queue.is_empty() && crypto.estate.is_sendable();
        let ours = self.connections.get(&cid).map_or(false, |c| c.is_origin);
        if idle && ours {
            // The destination only confirms after seeing traffic
            self.tunnel_send_keepalive(peer, cid);
        } else {
            self.tunnel_send_queued(peer);
        }
    }

    /// A connection of the tunnel is gone
    pub(crate) fn tunnel_connection_lost(&mut self, peer: PeerIdentity, cid: ConnectionId) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        tunnel.connections.retain(|c| *c != cid);
        if tunnel.cstate == ConnectivityState::Shutdown {
            return;
        }
        debug!("Tunnel {:?} lost connection {}", peer, cid);
        self.tunnel_maintain_connections(peer);
    }

    /// Flush queued payload while keys and connection slots allow
    pub(crate) fn tunnel_send_queued(&mut self, peer: PeerIdentity) {
        loop {
            let Some(tunnel) = self.tunnels.get(&peer) else {
                return;
            };
            if !tunnel.crypto.estate.is_sendable() || tunnel.queue.is_empty() {
                return;
            }
            let Some(cid) = self.tunnel_get_connection(peer) else {
                trace!("Tunnel {:?}: no connection with free buffer", peer);
                return;
            };
            let Some(item) = self.tunnels.get_mut(&peer).and_then(|t| t.queue.pop_front()) else {
                return;
            };
            let encrypted = match self.tunnel_encrypt(peer, cid, &item.plaintext) {
                Ok(encrypted) => encrypted,
                Err(e) => {
                    warn!("Cannot encrypt for {:?}: {}", peer, e);
                    self.complete_send(item.handle, SendOutcome::NotSent);
                    continue;
                }
            };
            self.connection_send(cid, Message::TunnelEncrypted(encrypted), Some(item.handle), item.droppable);
        }
    }

    /// Queue a payload message on the tunnel
    pub(crate) fn tunnel_send_payload(
        &mut self,
        peer: PeerIdentity,
        payload: TunnelPayload,
        continuation: Option<Continuation>,
    ) -> CoreResult<SendHandle> {
        let plaintext = payload.encode()?;
        let droppable = payload.is_droppable();
        let max = self.config.max_msgs_queue;
        let tunnel = self.tunnels.get(&peer).ok_or(CoreError::NoTunnel(peer))?;
        let full = tunnel.queue.len() >= max;
        let handle = self.register_send(SendLocation::Tunnel(peer), continuation);
        if full && droppable {
            debug!("Tunnel {:?} queue full, dropping {:?}", peer, payload.message_type());
            self.stats.bump("# messages dropped due to full queue");
            self.complete_send(handle, SendOutcome::NotSent);
            return Ok(handle);
        }
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.queue.push_back(QueuedPayload {
                handle,
                plaintext,
                droppable,
            });
        }
        self.tunnel_send_queued(peer);
        Ok(handle)
    }

    /// Take a cancelled send out of the tunnel queue
    pub(crate) fn tunnel_cancel(&mut self, peer: PeerIdentity, handle: SendHandle) {
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.queue.retain(|item| item.handle != handle);
        }
    }

    /// Keep the routes of a ready connection alive
    pub(crate) fn tunnel_send_keepalive(&mut self, peer: PeerIdentity, cid: ConnectionId) {
        let sendable = self
            .tunnels
            .get(&peer)
            .map_or(false, |t| t.crypto.estate.is_sendable());
        if !sendable {
            return;
        }
        let plaintext = match TunnelPayload::Keepalive.encode() {
            Ok(plaintext) => plaintext,
            Err(_) => return,
        };
        match self.tunnel_encrypt(peer, cid, &plaintext) {
            Ok(encrypted) => {
                trace!("Keepalive on {}", cid);
                self.stats.bump("# keepalives sent");
                self.connection_send(cid, Message::TunnelEncrypted(encrypted), None, true);
            }
            Err(e) => warn!("Cannot encrypt keepalive for {:?}: {}", peer, e),
        }
    }

    /// TUNNEL_ENCRYPTED arrived on a local connection
    pub(crate) fn tunnel_handle_encrypted(&mut self, cid: ConnectionId, encrypted: TunnelEncrypted) {
        let Some(peer) = self.connections.get(&cid).map(|c| c.peer) else {
            return;
        };
        let Some(plaintext) = self.tunnel_decrypt(peer, &encrypted) else {
            debug!("Cannot decrypt message from {:?} on {}", peer, cid);
            return;
        };
        let payloads = match TunnelPayload::decode_all(&plaintext) {
            Ok(payloads) => payloads,
            Err(e) => {
                warn!("Malformed payload from {:?}: {}", peer, e);
                self.stats.bump("# malformed payloads");
                return;
            }
        };
        for payload in payloads {
            self.tunnel_handle_payload(peer, payload);
        }
    }

    fn channel_mut(&mut self, peer: PeerIdentity, chid: ChannelNumber) -> Option<&mut Channel> {
        self.tunnels.get_mut(&peer)?.channels.get_mut(&chid)
    }

    fn tunnel_handle_payload(&mut self, peer: PeerIdentity, payload: TunnelPayload) {
        trace!("Tunnel {:?}: {:?}", peer, payload.message_type());
        let chid = match payload {
            TunnelPayload::Keepalive => {
                self.stats.bump("# keepalives received");
                return;
            }
            TunnelPayload::ChannelOpen { chid, options, port } => {
                self.channel_handle_open(peer, chid, options, port);
                return;
            }
            ref other => match other.channel() {
                Some(chid) => chid,
                None => return,
            },
        };
        if self.channel_mut(peer, chid).is_none() {
            debug!("{:?} for unknown {:?} from {:?}", payload.message_type(), chid, peer);
            self.stats.bump("# data on unknown channel");
            let answer = !matches!(
                payload,
                TunnelPayload::ChannelDestroy { .. } | TunnelPayload::ChannelOpenNack { .. }
            );
            if answer && self.tunnels.contains_key(&peer) {
                self.send_control(peer, TunnelPayload::ChannelDestroy { chid });
            }
            return;
        }

        match payload {
            TunnelPayload::ChannelOpenAck { .. } => {
                let opened = match self.channel_mut(peer, chid) {
                    Some(channel) if !channel.is_ready() => {
                        channel.state = ChannelState::Ready;
                        true
                    }
                    _ => false,
                };
                if opened {
                    debug!("{:?} to {:?} opened", chid, peer);
                    self.emit(Output::Channel(ChannelEvent::ChannelOpened { peer, chid }));
                }
            }
            TunnelPayload::ChannelOpenNack { .. } => {
                self.channel_forget(peer, chid);
                debug!("{:?} to {:?} refused", chid, peer);
                self.emit(Output::Channel(ChannelEvent::ChannelRefused { peer, chid }));
                self.tunnel_schedule_destroy(peer);
            }
            TunnelPayload::ChannelDestroy { .. } => {
                self.channel_forget(peer, chid);
                debug!("{:?} to {:?} destroyed remotely", chid, peer);
                self.emit(Output::Channel(ChannelEvent::ChannelDestroyed { peer, chid }));
                self.tunnel_schedule_destroy(peer);
            }
            TunnelPayload::ChannelData { mid, payload, .. } => {
                let fresh = self.channel_mut(peer, chid).map_or(false, |c| c.accept_mid(mid));
                if !fresh {
                    self.stats.bump("# duplicate channel data");
                    return;
                }
                self.stats.bump("# channel data received");
                self.emit(Output::Channel(ChannelEvent::Data { peer, chid, payload }));
            }
            TunnelPayload::ChannelDataAck { mid, .. } => {
                self.emit(Output::Channel(ChannelEvent::DataAck { peer, chid, mid }));
            }
            TunnelPayload::Keepalive | TunnelPayload::ChannelOpen { .. } => {}
        }
    }

    fn channel_forget(&mut self, peer: PeerIdentity, chid: ChannelNumber) {
        if let Some(tunnel) = self.tunnels.get_mut(&peer) {
            tunnel.channels.remove(&chid);
        }
    }

    fn channel_handle_open(&mut self, peer: PeerIdentity, chid: ChannelNumber, options: ChannelOptions, port: Port) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if let Some(channel) = tunnel.channels.get(&chid) {
            // Our OPEN_ACK got lost
            if !channel.is_origin {
                self.send_control(peer, TunnelPayload::ChannelOpenAck { chid });
            }
            return;
        }
        if !self.ports.contains(&port) {
            debug!("{:?} from {:?} for closed {:?}", chid, peer, port);
            self.stats.bump("# channel opens refused");
            self.send_control(peer, TunnelPayload::ChannelOpenNack { chid });
            return;
        }
        tunnel.channels.insert(chid, Channel::inbound(chid, port, options));
        if let Some(timer) = tunnel.destroy_timer.take() {
            self.timers.cancel(timer);
        }
        debug!("Incoming {:?} from {:?} on {:?}", chid, peer, port);
        self.send_control(peer, TunnelPayload::ChannelOpenAck { chid });
        self.emit(Output::Channel(ChannelEvent::IncomingChannel {
            peer,
            chid,
            port,
            options,
        }));
    }

    fn send_control(&mut self, peer: PeerIdentity, payload: TunnelPayload) {
        if let Err(e) = self.tunnel_send_payload(peer, payload, None) {
            warn!("Cannot queue control message for {:?}: {}", peer, e);
        }
    }

    fn tunnel_schedule_destroy(&mut self, peer: PeerIdentity) {
        let delay = self.config.tunnel_destroy_delay;
        let now = self.now;
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        if !tunnel.channels.is_empty() || tunnel.destroy_timer.is_some() {
            return;
        }
        trace!("Tunnel {:?} has no channels, destroying in {:?}", peer, delay);
        tunnel.destroy_timer = Some(self.timers.schedule(now, delay, TimerEvent::TunnelDestroy(peer)));
    }

    pub(crate) fn tunnel_destroy_if_empty(&mut self, peer: PeerIdentity) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        tunnel.destroy_timer = None;
        if tunnel.channels.is_empty() {
            self.tunnel_destroy(peer);
        }
    }

    /// Tear a tunnel down with its channels, queue and connections
    pub(crate) fn tunnel_destroy(&mut self, peer: PeerIdentity) {
        let Some(tunnel) = self.tunnels.get_mut(&peer) else {
            return;
        };
        debug!("Destroying tunnel to {:?}", peer);
        tunnel.cstate = ConnectivityState::Shutdown;
        let mut timers = tunnel.crypto.take_timers();
        timers.extend(tunnel.destroy_timer.take());
        let mut channels: Vec<ChannelNumber> = tunnel.channels.drain().map(|(chid, _)| chid).collect();
        channels.sort();
        let queued: Vec<SendHandle> = tunnel.queue.drain(..).map(|item| item.handle).collect();
        let connections = std::mem::take(&mut tunnel.connections);

        for timer in timers {
            self.timers.cancel(timer);
        }
        for chid in channels {
            self.emit(Output::Channel(ChannelEvent::ChannelDestroyed { peer, chid }));
        }
        for handle in queued {
            self.complete_send(handle, SendOutcome::NotSent);
        }
        for cid in connections {
            self.connection_destroy(cid, true);
        }
        self.tunnel_stop_search(peer);
        self.tunnels.remove(&peer);
        self.stats.update("# tunnels", -1);
        info!("Tunnel to {:?} destroyed", peer);
    }

    /// Snapshot of the tunnel to `peer`
    pub fn tunnel_info(&self, peer: &PeerIdentity) -> Option<TunnelInfo> {
        let tunnel = self.tunnels.get(peer)?;
        let ready_connections = tunnel
            .connections
            .iter()
            .filter(|cid| self.connections.get(cid).map_or(false, |c| c.is_ready()))
            .count();
        Some(TunnelInfo {
            peer: tunnel.peer,
            cstate: tunnel.cstate,
            estate: tunnel.crypto.estate,
            connections: tunnel.connections.len(),
            ready_connections,
            channels: tunnel.channels.len(),
            queued: tunnel.queue.len(),
            kx_in_progress: tunnel.crypto.kx_in_progress(),
        })
    }

    /// Peers we have a tunnel to
    pub fn tunnel_peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self.tunnels.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Accept channels on `port`
    pub fn open_port(&mut self, port: Port) -> CoreResult<()> {
        if self.is_shut_down() {
            return Err(CoreError::ShutDown);
        }
        if !self.ports.insert(port) {
            return Err(CoreError::PortInUse);
        }
        debug!("Opened {:?}", port);
        Ok(())
    }

    /// Stop accepting channels on `port`; open channels stay
    pub fn close_port(&mut self, port: Port) -> CoreResult<()> {
        if !self.ports.remove(&port) {
            return Err(CoreError::PortNotOpen);
        }
        debug!("Closed {:?}", port);
        Ok(())
    }

    /// Open a channel to `port` on `peer`
    ///
    /// The tunnel is created on demand. The channel can carry data once
    /// [`ChannelEvent::ChannelOpened`] was reported.
    pub fn channel_create(&mut self, peer: PeerIdentity, port: Port, options: ChannelOptions) -> CoreResult<ChannelNumber> {
        if self.is_shut_down() {
            return Err(CoreError::ShutDown);
        }
        self.get_or_create_tunnel(peer)?;
        let me = self.me;
        let tunnel = self.tunnels.get_mut(&peer).ok_or(CoreError::NoTunnel(peer))?;
        let chid = loop {
            let chid = local_channel_number(tunnel.next_chid, &me, &peer);
            tunnel.next_chid = tunnel.next_chid.wrapping_add(1);
            if !tunnel.channels.contains_key(&chid) {
                break chid;
            }
        };
        tunnel.channels.insert(chid, Channel::outbound(chid, port, options));
        if let Some(timer) = tunnel.destroy_timer.take() {
            self.timers.cancel(timer);
        }
        debug!("Opening {:?} to {:?} on {:?}", chid, peer, port);
        self.tunnel_send_payload(peer, TunnelPayload::ChannelOpen { chid, options, port }, None)?;
        self.tunnel_maintain_connections(peer);
        Ok(chid)
    }

    /// Send data on an open channel
    ///
    /// The continuation fires once the message left for the first hop, or
    /// with [`SendOutcome::NotSent`] if it was dropped or cancelled.
    pub fn channel_send(
        &mut self,
        peer: PeerIdentity,
        chid: ChannelNumber,
        payload: Bytes,
        continuation: Option<Continuation>,
    ) -> CoreResult<SendHandle> {
        if self.is_shut_down() {
            return Err(CoreError::ShutDown);
        }
        if payload.len() > MAX_CHANNEL_PAYLOAD {
            return Err(CoreError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_CHANNEL_PAYLOAD,
            });
        }
        let tunnel = self.tunnels.get_mut(&peer).ok_or(CoreError::NoTunnel(peer))?;
        let channel = tunnel
            .channels
            .get_mut(&chid)
            .ok_or(CoreError::ChannelNotFound(chid))?;
        if !channel.is_ready() {
            return Err(CoreError::ChannelNotOpen(chid));
        }
        let mid = channel.next_mid();
        self.tunnel_send_payload(peer, TunnelPayload::ChannelData { chid, mid, payload }, continuation)
    }

    /// Tell the remote side we consumed what arrived on a channel
    pub fn channel_ack(&mut self, peer: PeerIdentity, chid: ChannelNumber) -> CoreResult<()> {
        let tunnel = self.tunnels.get(&peer).ok_or(CoreError::NoTunnel(peer))?;
        let channel = tunnel.channels.get(&chid).ok_or(CoreError::ChannelNotFound(chid))?;
        let mid = channel.last_mid_recv().unwrap_or(0);
        self.tunnel_send_payload(peer, TunnelPayload::ChannelDataAck { chid, mid, futures: 0 }, None)?;
        Ok(())
    }

    /// Close a channel; the tunnel goes once it has none left
    pub fn channel_destroy(&mut self, peer: PeerIdentity, chid: ChannelNumber) -> CoreResult<()> {
        let tunnel = self.tunnels.get_mut(&peer).ok_or(CoreError::NoTunnel(peer))?;
        if tunnel.channels.remove(&chid).is_none() {
            return Err(CoreError::ChannelNotFound(chid));
        }
        debug!("Destroying {:?} to {:?}", chid, peer);
        self.tunnel_send_payload(peer, TunnelPayload::ChannelDestroy { chid }, None)?;
        self.tunnel_schedule_destroy(peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::CancelError;
    use cadet_crypto::Identity;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn core() -> Core {
        Core::new(Identity::generate(), CoreConfig::testing(), Instant::now()).unwrap()
    }

    fn outputs(core: &mut Core) -> Vec<Output> {
        std::iter::from_fn(|| core.poll_output()).collect()
    }

    #[test]
    fn test_loopback_rejected() {
        let mut core = core();
        let me = *core.local_id();
        assert!(matches!(
            core.channel_create(me, Port::from_name("echo"), ChannelOptions::DEFAULT),
            Err(CoreError::LoopbackTunnel)
        ));
        assert!(core.tunnel_peers().is_empty());
    }

    #[test]
    fn test_ports() {
        let mut core = core();
        let port = Port::from_name("echo");
        core.open_port(port).unwrap();
        assert!(matches!(core.open_port(port), Err(CoreError::PortInUse)));
        core.close_port(port).unwrap();
        assert!(matches!(core.close_port(port), Err(CoreError::PortNotOpen)));
    }

    #[test]
    fn test_unreachable_peer_starts_search() {
        let mut core = core();
        let peer = Identity::generate().peer_id();
        let chid = core
            .channel_create(peer, Port::from_name("echo"), ChannelOptions::RELIABLE)
            .unwrap();

        let info = core.tunnel_info(&peer).unwrap();
        assert_eq!(info.cstate, ConnectivityState::Searching);
        assert_eq!(info.estate, EncryptionState::Uninitialized);
        assert_eq!(info.channels, 1);
        // CHANNEL_OPEN waits for the keys
        assert_eq!(info.queued, 1);
        assert!(outputs(&mut core).contains(&Output::DhtSearch { target: peer }));

        assert!(matches!(
            core.channel_send(peer, chid, Bytes::from_static(b"x"), None),
            Err(CoreError::ChannelNotOpen(_))
        ));
        assert!(matches!(
            core.channel_send(peer, ChannelNumber::new(77), Bytes::from_static(b"x"), None),
            Err(CoreError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_oversized_payload() {
        let mut core = core();
        let peer = Identity::generate().peer_id();
        let chid = core
            .channel_create(peer, Port::from_name("echo"), ChannelOptions::DEFAULT)
            .unwrap();
        let payload = Bytes::from(vec![0u8; MAX_CHANNEL_PAYLOAD + 1]);
        assert!(matches!(
            core.channel_send(peer, chid, payload, None),
            Err(CoreError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_cancel_queued_payload_fires_once() {
        let mut core = core();
        let peer = Identity::generate().peer_id();
        core.channel_create(peer, Port::from_name("echo"), ChannelOptions::DEFAULT)
            .unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let handle = core
            .tunnel_send_payload(
                peer,
                TunnelPayload::Keepalive,
                Some(Box::new(move |outcome| sink.lock().unwrap().push(outcome))),
            )
            .unwrap();
        assert_eq!(core.tunnel_info(&peer).unwrap().queued, 2);

        core.cancel_send(handle).unwrap();
        assert_eq!(core.cancel_send(handle), Err(CancelError::AlreadySent));
        assert_eq!(*fired.lock().unwrap(), vec![SendOutcome::NotSent]);
        assert_eq!(core.tunnel_info(&peer).unwrap().queued, 1);
    }

    #[test]
    fn test_tunnel_destroyed_after_last_channel() {
        let mut core = core();
        let peer = Identity::generate().peer_id();
        let chid = core
            .channel_create(peer, Port::from_name("echo"), ChannelOptions::DEFAULT)
            .unwrap();
        outputs(&mut core);

        core.channel_destroy(peer, chid).unwrap();
        assert!(matches!(core.channel_destroy(peer, chid), Err(CoreError::ChannelNotFound(_))));
        assert!(core.tunnel_info(&peer).is_some());

        let later = core.now() + core.config().tunnel_destroy_delay;
        core.advance(later);
        assert!(core.tunnel_info(&peer).is_none());
        assert_eq!(core.statistics().get("# tunnels"), 0);
        assert!(outputs(&mut core).contains(&Output::DhtStop { target: peer }));
    }

    #[test]
    fn test_new_channel_cancels_pending_destroy() {
        let mut core = core();
        let peer = Identity::generate().peer_id();
        let port = Port::from_name("echo");
        let first = core.channel_create(peer, port, ChannelOptions::DEFAULT).unwrap();
        core.channel_destroy(peer, first).unwrap();
        let second = core.channel_create(peer, port, ChannelOptions::DEFAULT).unwrap();
        assert_ne!(first, second);

        let later = core.now() + core.config().tunnel_destroy_delay * 2;
        core.advance(later);
        assert_eq!(core.tunnel_info(&peer).unwrap().channels, 1);
    }

    #[test]
    fn test_shutdown_reports_channels_and_sends() {
        let mut core = core();
        let peer = Identity::generate().peer_id();
        let chid = core
            .channel_create(peer, Port::from_name("echo"), ChannelOptions::DEFAULT)
            .unwrap();
        let fired = Arc::new(Mutex::new(0));
        let sink = fired.clone();
        core.tunnel_send_payload(
            peer,
            TunnelPayload::Keepalive,
            Some(Box::new(move |_| *sink.lock().unwrap() += 1)),
        )
        .unwrap();
        outputs(&mut core);

        core.shutdown();
        assert!(core.is_shut_down());
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(outputs(&mut core).contains(&Output::Channel(ChannelEvent::ChannelDestroyed { peer, chid })));
        assert!(matches!(
            core.channel_create(peer, Port::from_name("echo"), ChannelOptions::DEFAULT),
            Err(CoreError::ShutDown)
        ));
    }
}
