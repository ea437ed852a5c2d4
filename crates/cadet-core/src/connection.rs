//! Connection endpoints
//!
//! A connection is the use of one path by one tunnel. Only the two endpoints
//! keep a `Connection`; relays in between only keep a route entry under the
//! same connection id.
//!
//! Flow control is per traffic direction. `Forward` is traffic from the
//! initiator to the destination, `Backward` the reverse. Each endpoint sends
//! in one direction and receives in the other. Packet ids are compared with
//! wrap-around.

use std::fmt;
use std::time::Duration;

use cadet_crypto::PeerIdentity;
use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::channel::ChannelOptions;
use crate::core::{Core, SendLocation, TimerEvent};
use crate::message::{
    ConnectionAck, ConnectionCreate, ConnectionCreateAck, ConnectionDestroy, ConnectionPoll,
    Message, CID_SIZE,
};
use crate::mq::{Envelope, Origin};
use crate::output::{SendHandle, SendOutcome};
use crate::path::PathId;
use crate::timer::TimerId;

/// Initial poll period
pub const INITIAL_POLL_TIME: Duration = Duration::from_secs(1);

/// Upper bound of the create retry multiplier
pub const MAX_CREATE_RETRY: u32 = 64;

/// Connection identifier, chosen at random by the initiator
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId([u8; CID_SIZE]);

impl ConnectionId {
    pub fn from_bytes(bytes: [u8; CID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CID_SIZE] {
        &self.0
    }

    /// Generate a random connection id
    pub fn random(rng: &mut impl RngCore) -> Self {
        let mut bytes = [0u8; CID_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, CONNECTION_CREATE not sent yet
    New,
    /// CONNECTION_CREATE sent, waiting for the ACK
    Sent,
    /// We are the destination and answered the CREATE
    Ack,
    /// Confirmed in both directions
    Ready,
    /// Torn down locally
    Destroyed,
    /// Torn down by the network
    Broken,
}

/// Direction of traffic on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiator to destination
    Forward,
    /// Destination to initiator
    Backward,
}

impl Direction {
    fn index(self) -> usize {
        match self {
            Self::Forward => 0,
            Self::Backward => 1,
        }
    }
}

/// Whether packet id `bigger` comes after `smaller`, allowing for wrap-around
pub fn is_pid_bigger(bigger: u32, smaller: u32) -> bool {
    let overflow = |pid: u32, max: u32| pid > max && pid - max > u32::MAX / 2;
    overflow(smaller, bigger) || (bigger > smaller && !overflow(bigger, smaller))
}

/// ACK window and queue accounting of one direction
#[derive(Debug)]
pub struct FlowControl {
    pub last_pid_sent: u32,
    pub last_pid_recv: u32,
    pub last_ack_sent: u32,
    pub last_ack_recv: u32,
    /// Messages handed to the neighbor queue and not yet transmitted
    pub queue_n: usize,
    pub queue_max: usize,
    poll_time: Duration,
    poll_timer: Option<TimerId>,
}

impl FlowControl {
    fn new(queue_max: usize) -> Self {
        Self {
            last_pid_sent: u32::MAX,
            last_pid_recv: u32::MAX,
            last_ack_sent: 0,
            last_ack_recv: 0,
            queue_n: 0,
            queue_max,
            poll_time: INITIAL_POLL_TIME,
            poll_timer: None,
        }
    }

    /// Packet ids the receiver still allows us to send
    pub fn window(&self) -> u32 {
        if is_pid_bigger(self.last_ack_recv, self.last_pid_sent) {
            self.last_ack_recv.wrapping_sub(self.last_pid_sent)
        } else {
            0
        }
    }

    /// Remaining capacity for encrypted traffic
    pub fn buffer(&self) -> usize {
        self.queue_max
            .saturating_sub(self.queue_n)
            .min(self.window() as usize)
    }
}

/// Local endpoint of a connection
#[derive(Debug)]
pub struct Connection {
    pub cid: ConnectionId,
    /// Remote endpoint (the tunnel peer)
    pub peer: PeerIdentity,
    /// First hop
    pub next_hop: PeerIdentity,
    pub path: PathId,
    /// Offset of `peer` on `path`
    pub off: usize,
    pub options: ChannelOptions,
    pub is_origin: bool,
    state: ConnectionState,
    fc: [FlowControl; 2],
    create_retry: u32,
    keepalive_timer: Option<TimerId>,
    timeout_timer: Option<TimerId>,
    last_recv: std::time::Instant,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Direction of the traffic we send
    pub fn outbound(&self) -> Direction {
        if self.is_origin {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    /// Direction of the traffic we receive
    pub fn inbound(&self) -> Direction {
        if self.is_origin {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    pub fn fc(&self, direction: Direction) -> &FlowControl {
        &self.fc[direction.index()]
    }

    fn fc_mut(&mut self, direction: Direction) -> &mut FlowControl {
        &mut self.fc[direction.index()]
    }

    /// Remaining allowed-unacked capacity of our sending direction
    pub fn get_buffer(&self) -> usize {
        self.fc(self.outbound()).buffer()
    }

    /// Messages queued towards the first hop
    pub fn queue_len(&self) -> usize {
        self.fc(self.outbound()).queue_n
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection {} state: {:?} -> {:?}", self.cid, self.state, state);
            self.state = state;
        }
    }

    /// Open the receive window up to `last_pid_recv + buffer`
    ///
    /// Returns the ACK value to send, or None when the peer already knows.
    fn allow(&mut self, buffer: u32, force: bool) -> Option<u32> {
        let fc = self.fc_mut(self.inbound());
        let delta = fc.last_ack_sent.wrapping_sub(fc.last_pid_recv);
        if delta > 3 && buffer < delta && !force {
            return None;
        }
        let ack = fc.last_pid_recv.wrapping_add(buffer);
        if ack == fc.last_ack_sent && !force {
            return None;
        }
        fc.last_ack_sent = ack;
        Some(ack)
    }
}

impl Core {
    fn new_connection(
        &mut self,
        cid: ConnectionId,
        peer: PeerIdentity,
        path: PathId,
        off: usize,
        options: ChannelOptions,
        is_origin: bool,
    ) -> Option<Connection> {
        let next_hop = self.peers.hop_identity(path, 1)?;
        let queue_max = self.config.connection_queue_max();
        Some(Connection {
            cid,
            peer,
            next_hop,
            path,
            off,
            options,
            is_origin,
            state: if is_origin {
                ConnectionState::New
            } else {
                ConnectionState::Ack
            },
            fc: [FlowControl::new(queue_max), FlowControl::new(queue_max)],
            create_retry: 1,
            keepalive_timer: None,
            timeout_timer: None,
            last_recv: self.now,
        })
    }

    /// Open a connection to `peer` over `path`, on which it sits at `off`
    pub(crate) fn connection_open(
        &mut self,
        peer: PeerIdentity,
        path: PathId,
        off: usize,
        options: ChannelOptions,
    ) -> Option<ConnectionId> {
        let cid = ConnectionId::random(&mut self.rng);
        let connection = self.new_connection(cid, peer, path, off, options, true)?;
        self.peers.add_connection(path, off, cid);
        self.connections.insert(cid, connection);
        self.stats.update("# connections", 1);
        debug!("Opening connection {} to {:?} over path {:?}", cid, peer, path);

        self.connection_send_create(cid);
        self.connection_schedule_keepalive(cid);
        self.connection_reset_timeout(cid);
        Some(cid)
    }

    /// Accept a connection created by `peer`, reaching us over `path`
    pub(crate) fn connection_accept(
        &mut self,
        peer: PeerIdentity,
        path: PathId,
        off: usize,
        cid: ConnectionId,
        options: ChannelOptions,
    ) -> bool {
        let Some(connection) = self.new_connection(cid, peer, path, off, options, false) else {
            return false;
        };
        self.peers.add_connection(path, off, cid);
        self.connections.insert(cid, connection);
        self.stats.update("# connections", 1);
        debug!("Accepted connection {} from {:?}", cid, peer);

        self.connection_send_create_ack(cid);
        self.connection_schedule_keepalive(cid);
        self.connection_reset_timeout(cid);
        true
    }

    fn connection_send_create(&mut self, cid: ConnectionId) {
        let Some(connection) = self.connections.get(&cid) else {
            return;
        };
        let path = self.peers.path_identities(connection.path, connection.off);
        let message = Message::ConnectionCreate(ConnectionCreate {
            options: connection.options,
            cid,
            path,
        });
        if self.connection_send(cid, message, None, false) {
            if let Some(connection) = self.connections.get_mut(&cid) {
                if connection.state == ConnectionState::New {
                    connection.set_state(ConnectionState::Sent);
                }
            }
            self.stats.bump("# CONNECTION_CREATE transmitted");
        }
    }

    fn connection_send_create_ack(&mut self, cid: ConnectionId) {
        let message = Message::ConnectionCreateAck(ConnectionCreateAck { cid });
        self.connection_send(cid, message, None, false);
    }

    /// Queue a message on a connection
    ///
    /// Encrypted messages get the next packet id and a TTL. Droppable
    /// messages are dropped when the queue is over its limit. Returns false
    /// when the message was not queued; the continuation behind `handle`
    /// then already fired with `NotSent`.
    pub(crate) fn connection_send(
        &mut self,
        cid: ConnectionId,
        mut message: Message,
        handle: Option<SendHandle>,
        droppable: bool,
    ) -> bool {
        let default_ttl = self.config.default_ttl;
        let Some(connection) = self.connections.get_mut(&cid) else {
            if let Some(handle) = handle {
                self.complete_send(handle, SendOutcome::NotSent);
            }
            return false;
        };
        let out = connection.outbound();
        let fc = connection.fc_mut(out);
        if droppable && fc.queue_n >= fc.queue_max {
            trace!("Connection {} queue full, dropping {:?}", cid, message.message_type());
            self.stats.bump("# messages dropped due to full queue");
            if let Some(handle) = handle {
                self.complete_send(handle, SendOutcome::NotSent);
            }
            return false;
        }

        let mut start_poll = false;
        if let Message::TunnelEncrypted(encrypted) = &mut message {
            fc.last_pid_sent = fc.last_pid_sent.wrapping_add(1);
            encrypted.pid = fc.last_pid_sent;
            if encrypted.ttl == 0 {
                encrypted.ttl = default_ttl;
            }
            start_poll = fc.window() == 0;
        }
        fc.queue_n += 1;
        let to = connection.next_hop;

        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode message on connection {}: {}", cid, e);
                if let Some(connection) = self.connections.get_mut(&cid) {
                    connection.fc_mut(out).queue_n -= 1;
                }
                if let Some(handle) = handle {
                    self.complete_send(handle, SendOutcome::NotSent);
                }
                return false;
            }
        };
        if let Some(handle) = handle {
            self.relocate_send(handle, SendLocation::Connection { cid, hop: to });
        }
        if start_poll {
            self.connection_start_poll(cid);
        }
        let envelope = Envelope {
            message: bytes,
            origin: Origin::Connection { cid, handle },
        };
        if !self.send_envelope(&to, envelope, false) {
            // Neighbor is gone; the disconnect handler breaks this connection
            if let Some(connection) = self.connections.get_mut(&cid) {
                connection.fc_mut(out).queue_n -= 1;
            }
            if let Some(handle) = handle {
                self.complete_send(handle, SendOutcome::NotSent);
            }
            return false;
        }
        true
    }

    /// The neighbor transport took a message queued by a connection
    pub(crate) fn connection_transmitted(&mut self, cid: ConnectionId, handle: Option<SendHandle>) {
        if let Some(connection) = self.connections.get_mut(&cid) {
            let out = connection.outbound();
            let fc = connection.fc_mut(out);
            fc.queue_n = fc.queue_n.saturating_sub(1);
        }
        if let Some(handle) = handle {
            self.complete_send(handle, SendOutcome::Sent);
        }
        if let Some(peer) = self.connections.get(&cid).map(|c| c.peer) {
            self.tunnel_send_queued(peer);
        }
    }

    /// Take a cancelled send out of the neighbor queue
    pub(crate) fn connection_cancel(&mut self, cid: ConnectionId, hop: PeerIdentity, handle: SendHandle) {
        let removed = match self.peers.queue_mut(&hop) {
            Some(queue) => {
                let removed = queue.cancel(handle);
                if !removed {
                    queue.detach_in_flight(handle);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(connection) = self.connections.get_mut(&cid) {
                let out = connection.outbound();
                let fc = connection.fc_mut(out);
                fc.queue_n = fc.queue_n.saturating_sub(1);
            }
        }
    }

    /// Any valid message arrived on the connection
    pub(crate) fn connection_received(&mut self, cid: ConnectionId) {
        let now = self.now;
        if let Some(connection) = self.connections.get_mut(&cid) {
            connection.last_recv = now;
        }
    }

    /// CONNECTION_CREATE_ACK reached the initiator
    pub(crate) fn connection_handle_create_ack(&mut self, cid: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        if !connection.is_origin {
            warn!("CREATE_ACK for connection {} we did not initiate", cid);
            self.stats.bump("# CREATE_ACK for inbound connection");
            return;
        }
        if connection.state == ConnectionState::Ready {
            trace!("Duplicate CREATE_ACK on {}", cid);
            self.connection_received(cid);
            return;
        }
        connection.set_state(ConnectionState::Ready);
        connection.create_retry = 1;
        let (peer, path, off) = (connection.peer, connection.path, connection.off);
        self.connection_received(cid);
        self.peers.update_score(path, off, 1);
        self.connection_schedule_keepalive(cid);
        self.tunnel_connection_ready(peer, cid);
    }

    /// A duplicate CREATE reached the destination: the ACK was lost
    pub(crate) fn connection_handle_duplicate_create(&mut self, cid: ConnectionId) {
        debug!("Duplicate CREATE on {}, resending CREATE_ACK", cid);
        self.connection_received(cid);
        self.connection_send_create_ack(cid);
    }

    /// The destination saw traffic from the initiator: the connection works
    pub(crate) fn connection_confirm(&mut self, cid: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        if connection.state != ConnectionState::Ack {
            return;
        }
        connection.set_state(ConnectionState::Ready);
        let peer = connection.peer;
        self.connection_schedule_keepalive(cid);
        self.tunnel_connection_ready(peer, cid);
    }

    /// CONNECTION_ACK: the peer allows more packets
    pub(crate) fn connection_handle_ack(&mut self, cid: ConnectionId, ack: u32) {
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        let out = connection.outbound();
        let fc = connection.fc_mut(out);
        if is_pid_bigger(ack, fc.last_ack_recv) {
            trace!("Connection {} ACK {} (was {})", cid, ack, fc.last_ack_recv);
            fc.last_ack_recv = ack;
        }
        let mut cancel = None;
        if fc.poll_timer.is_some() && is_pid_bigger(fc.last_ack_recv, fc.last_pid_sent) {
            cancel = fc.poll_timer.take();
            fc.poll_time = INITIAL_POLL_TIME;
        }
        let peer = connection.peer;
        if let Some(timer) = cancel {
            self.timers.cancel(timer);
        }
        self.connection_received(cid);
        self.tunnel_send_queued(peer);
    }

    /// CONNECTION_POLL: the peer lost our ACK, send a fresh one
    pub(crate) fn connection_handle_poll(&mut self, cid: ConnectionId, pid: u32) {
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        let inbound = connection.inbound();
        let fc = connection.fc_mut(inbound);
        if is_pid_bigger(pid, fc.last_pid_recv) {
            fc.last_pid_recv = pid;
        }
        self.connection_received(cid);
        self.connection_send_ack(cid, true);
    }

    /// Check the packet id of a received encrypted message
    ///
    /// Returns false for unsolicited and duplicate packets.
    pub(crate) fn connection_accept_pid(&mut self, cid: ConnectionId, pid: u32) -> bool {
        let Some(connection) = self.connections.get_mut(&cid) else {
            return false;
        };
        let inbound = connection.inbound();
        let fc = connection.fc_mut(inbound);
        if is_pid_bigger(pid, fc.last_ack_sent) {
            warn!(
                "Connection {} got unsolicited pid {} (allowed up to {})",
                cid, pid, fc.last_ack_sent
            );
            self.stats.bump("# unsolicited message");
            return false;
        }
        if !is_pid_bigger(pid, fc.last_pid_recv) {
            trace!("Connection {} duplicate pid {}", cid, pid);
            self.stats.bump("# duplicate PID");
            return false;
        }
        fc.last_pid_recv = pid;
        true
    }

    /// Send a CONNECTION_ACK if the peer's view of our window is stale
    pub(crate) fn connection_send_ack(&mut self, cid: ConnectionId, force: bool) {
        let buffer = self.config.connection_queue_max() as u32;
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        let Some(ack) = connection.allow(buffer, force) else {
            self.stats.bump("# ACK not needed");
            return;
        };
        trace!("Connection {} sending ACK {}", cid, ack);
        self.connection_send(cid, Message::ConnectionAck(ConnectionAck { cid, ack }), None, false);
    }

    fn connection_start_poll(&mut self, cid: ConnectionId) {
        let now = self.now;
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        let out = connection.outbound();
        let fc = connection.fc_mut(out);
        if fc.poll_timer.is_some() {
            return;
        }
        let delay = fc.poll_time;
        fc.poll_timer = Some(self.timers.schedule(now, delay, TimerEvent::ConnectionPoll(cid)));
    }

    /// Poll timer: ask for an ACK and back off
    pub(crate) fn connection_poll(&mut self, cid: ConnectionId) {
        let max_poll = self.config.max_poll_time;
        let now = self.now;
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        let out = connection.outbound();
        let fc = connection.fc_mut(out);
        fc.poll_timer = None;
        let pid = fc.last_pid_sent;
        fc.poll_time = (fc.poll_time * 2).min(max_poll);
        let delay = fc.poll_time;
        fc.poll_timer = Some(self.timers.schedule(now, delay, TimerEvent::ConnectionPoll(cid)));
        debug!("Connection {} polling at pid {}, next poll in {:?}", cid, pid, delay);
        self.stats.bump("# POLL transmitted");
        self.connection_send(cid, Message::ConnectionPoll(ConnectionPoll { cid, pid }), None, false);
    }

    fn connection_schedule_keepalive(&mut self, cid: ConnectionId) {
        let keepalive = self.config.keepalive_period;
        let create_time = self.config.create_connection_time;
        let now = self.now;
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        let delay = if connection.state == ConnectionState::Ready {
            keepalive
        } else {
            let delay = create_time * connection.create_retry;
            if connection.create_retry < MAX_CREATE_RETRY {
                connection.create_retry *= 2;
            }
            delay
        };
        if let Some(timer) = connection.keepalive_timer.take() {
            self.timers.cancel(timer);
        }
        connection.keepalive_timer =
            Some(self.timers.schedule(now, delay, TimerEvent::ConnectionKeepalive(cid)));
    }

    /// Keepalive timer: retry the CREATE or keep the route alive
    pub(crate) fn connection_keepalive(&mut self, cid: ConnectionId) {
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        connection.keepalive_timer = None;
        let (state, is_origin, peer) = (connection.state, connection.is_origin, connection.peer);
        match state {
            ConnectionState::New | ConnectionState::Sent if is_origin => {
                debug!("Connection {} not confirmed yet, resending CREATE", cid);
                self.connection_send_create(cid);
            }
            ConnectionState::Ready => {
                self.tunnel_send_keepalive(peer, cid);
            }
            _ => {}
        }
        self.connection_schedule_keepalive(cid);
    }

    fn connection_reset_timeout(&mut self, cid: ConnectionId) {
        let timeout = self.config.connection_timeout();
        let now = self.now;
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        if let Some(timer) = connection.timeout_timer.take() {
            self.timers.cancel(timer);
        }
        let at = connection.last_recv + timeout;
        connection.timeout_timer = Some(self.timers.schedule_at(at.max(now), TimerEvent::ConnectionTimeout(cid)));
    }

    /// Timeout timer: destroy the connection if it went silent
    pub(crate) fn connection_timeout(&mut self, cid: ConnectionId) {
        let timeout = self.config.connection_timeout();
        let Some(connection) = self.connections.get_mut(&cid) else {
            return;
        };
        connection.timeout_timer = None;
        if connection.last_recv + timeout > self.now {
            self.connection_reset_timeout(cid);
            return;
        }
        warn!("Connection {} timed out", cid);
        self.stats.bump("# connections timed out");
        self.connection_destroy(cid, true);
    }

    /// Tear down a connection, optionally telling the path
    pub(crate) fn connection_destroy(&mut self, cid: ConnectionId, notify: bool) {
        self.connection_teardown(cid, notify, ConnectionState::Destroyed);
    }

    /// The network reported the connection broken
    pub(crate) fn connection_broken(&mut self, cid: ConnectionId) {
        if let Some(path) = self.connections.get(&cid).map(|c| c.path) {
            self.connection_teardown(cid, false, ConnectionState::Broken);
            self.invalidate_path(path);
        }
    }

    fn connection_teardown(&mut self, cid: ConnectionId, notify: bool, state: ConnectionState) {
        let next_hop = self.connections.get(&cid).map(|c| c.next_hop);
        if let (true, Some(to)) = (notify, next_hop) {
            let message = Message::ConnectionDestroy(ConnectionDestroy { cid });
            if let Ok(bytes) = message.encode() {
                self.send_envelope(
                    &to,
                    Envelope {
                        message: bytes,
                        origin: Origin::Plain,
                    },
                    false,
                );
            }
        }
        let Some(mut connection) = self.connections.remove(&cid) else {
            return;
        };
        connection.set_state(state);
        self.stats.update("# connections", -1);
        for timer in [connection.keepalive_timer.take(), connection.timeout_timer.take()]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(timer);
        }
        for fc in connection.fc.iter_mut() {
            if let Some(timer) = fc.poll_timer.take() {
                self.timers.cancel(timer);
            }
        }
        let orphaned = self
            .peers
            .queue_mut(&connection.next_hop)
            .map(|queue| queue.remove_connection(&cid))
            .unwrap_or_default();
        for handle in orphaned {
            self.complete_send(handle, SendOutcome::NotSent);
        }
        self.peers.del_connection(connection.path, connection.off, cid);
        self.tunnel_connection_lost(connection.peer, cid);
    }

    /// Current state of a local connection
    pub fn connection_state(&self, cid: &ConnectionId) -> Option<ConnectionState> {
        self.connections.get(cid).map(|c| c.state)
    }

    /// Local connections towards `peer`
    pub fn connections_to(&self, peer: &PeerIdentity) -> Vec<ConnectionId> {
        let mut cids: Vec<_> = self
            .connections
            .values()
            .filter(|c| c.peer == *peer)
            .map(|c| c.cid)
            .collect();
        cids.sort();
        cids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_comparison_wraps() {
        assert!(is_pid_bigger(1, 0));
        assert!(!is_pid_bigger(0, 1));
        assert!(!is_pid_bigger(5, 5));
        assert!(is_pid_bigger(0, u32::MAX));
        assert!(is_pid_bigger(3, u32::MAX - 3));
        assert!(!is_pid_bigger(u32::MAX, 0));
    }

    #[test]
    fn test_initial_window_allows_one_packet() {
        let fc = FlowControl::new(11);
        assert_eq!(fc.window(), 1);
        assert_eq!(fc.buffer(), 1);
    }

    #[test]
    fn test_window_closes_and_reopens() {
        let mut fc = FlowControl::new(11);
        fc.last_pid_sent = 0;
        assert_eq!(fc.window(), 0);
        fc.last_ack_recv = 10;
        assert_eq!(fc.window(), 10);
        fc.queue_n = 8;
        assert_eq!(fc.buffer(), 3);
    }

    fn test_connection() -> Connection {
        Connection {
            cid: ConnectionId::from_bytes([1; CID_SIZE]),
            peer: PeerIdentity::from_bytes([2; 32]),
            next_hop: PeerIdentity::from_bytes([2; 32]),
            path: PathId::for_tests(1),
            off: 1,
            options: ChannelOptions::DEFAULT,
            is_origin: false,
            state: ConnectionState::Ack,
            fc: [FlowControl::new(11), FlowControl::new(11)],
            create_retry: 1,
            keepalive_timer: None,
            timeout_timer: None,
            last_recv: std::time::Instant::now(),
        }
    }

    #[test]
    fn test_ack_only_when_needed() {
        let mut connection = test_connection();
        assert_eq!(connection.inbound(), Direction::Forward);

        // First packet: the window opens to pid + buffer
        connection.fc_mut(Direction::Forward).last_pid_recv = 0;
        assert_eq!(connection.allow(11, false), Some(11));

        // Nothing new: no ACK, unless forced (POLL)
        assert_eq!(connection.allow(11, false), None);
        assert_eq!(connection.allow(11, true), Some(11));

        // Plenty of window left: skip
        connection.fc_mut(Direction::Forward).last_pid_recv = 2;
        assert_eq!(connection.allow(5, false), None);

        // Window nearly used up
        connection.fc_mut(Direction::Forward).last_pid_recv = 9;
        assert_eq!(connection.allow(11, false), Some(20));
    }
}
