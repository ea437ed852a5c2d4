//! Core context
//!
//! All protocol state of one peer lives in [`Core`]. It is driven from the
//! outside: transport events, DHT results, client calls and `advance` for
//! timers go in, [`Output`]s come out through `poll_output`. Nothing inside
//! blocks or spawns; every transition happens synchronously in one call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use cadet_crypto::{Identity, PeerIdentity};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::channel::Port;
use crate::config::CoreConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{CancelError, CoreError, CoreResult};
use crate::kx::GlobalKx;
use crate::message::Message;
use crate::mq::{Envelope, Origin};
use crate::output::{Continuation, Output, SendHandle, SendOutcome};
use crate::path::PathId;
use crate::peer::PeerRegistry;
use crate::router::RouteTable;
use crate::stats::Statistics;
use crate::timer::{TimerId, TimerQueue};
use crate::tunnel::Tunnel;

/// Delayed work of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Sweep idle relay routes
    RouteTimeout,
    ConnectionKeepalive(ConnectionId),
    ConnectionTimeout(ConnectionId),
    ConnectionPoll(ConnectionId),
    /// Replace the ephemeral key
    GlobalRekey,
    /// Send or resend our KX on a tunnel
    TunnelRekey(PeerIdentity),
    /// Forget the old keys of a tunnel
    KxFinish(PeerIdentity),
    PathInvalidated(PathId),
    /// Destroy a tunnel left without channels
    TunnelDestroy(PeerIdentity),
}

/// Where a queued send currently waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendLocation {
    /// Plaintext waiting in the tunnel until the KX completes
    Tunnel(PeerIdentity),
    /// Handed to a connection, waiting in the neighbor queue of `hop`
    Connection { cid: ConnectionId, hop: PeerIdentity },
}

pub(crate) struct PendingSend {
    pub(crate) location: SendLocation,
    pub(crate) continuation: Option<Continuation>,
}

/// Protocol state of the local peer
pub struct Core {
    pub(crate) identity: Identity,
    pub(crate) me: PeerIdentity,
    pub(crate) config: CoreConfig,
    pub(crate) now: Instant,
    pub(crate) peers: PeerRegistry,
    pub(crate) routes: RouteTable,
    pub(crate) route_timer: Option<TimerId>,
    pub(crate) connections: HashMap<ConnectionId, Connection>,
    pub(crate) tunnels: HashMap<PeerIdentity, Tunnel>,
    pub(crate) kx: GlobalKx,
    pub(crate) ports: HashSet<Port>,
    pub(crate) pending_sends: HashMap<SendHandle, PendingSend>,
    next_send: u64,
    pub(crate) timers: TimerQueue<TimerEvent>,
    outputs: VecDeque<Output>,
    pub(crate) stats: Statistics,
    pub(crate) rng: StdRng,
    shut_down: bool,
}

impl Core {
    /// Start the core for `identity`
    pub fn new(identity: Identity, config: CoreConfig, now: Instant) -> CoreResult<Self> {
        config.validate().map_err(CoreError::Config)?;
        if config.drop_percent > 0 {
            warn!(
                "**************************************************************\n\
                 Dropping {}% of all messages handed to neighbors on purpose!\n\
                 **************************************************************",
                config.drop_percent
            );
        }
        let me = identity.peer_id();
        let rng = StdRng::from_entropy();
        let kx = GlobalKx::new(&identity, &config)?;
        let routes = RouteTable::new(config.max_routes, config.max_route_buffers, config.rung_eviction);
        let mut core = Self {
            peers: PeerRegistry::new(me, now),
            identity,
            me,
            config,
            now,
            routes,
            route_timer: None,
            connections: HashMap::new(),
            tunnels: HashMap::new(),
            kx,
            ports: HashSet::new(),
            pending_sends: HashMap::new(),
            next_send: 0,
            timers: TimerQueue::new(),
            outputs: VecDeque::new(),
            stats: Statistics::new(),
            rng,
            shut_down: false,
        };
        core.schedule_global_rekey();
        info!("Core started as {:?}", me);
        Ok(core)
    }

    /// Identity of the local peer
    pub fn local_id(&self) -> &PeerIdentity {
        &self.me
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Statistics {
        &self.stats
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Number of relay routes
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.routes
    }

    pub fn peer_registry(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Earliest timer deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Move the clock to `now` and run every timer that became due
    pub fn advance(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
        while let Some((_, event)) = self.timers.pop_expired(self.now) {
            self.dispatch_timer(event);
        }
    }

    fn dispatch_timer(&mut self, event: TimerEvent) {
        trace!("Timer {:?}", event);
        match event {
            TimerEvent::RouteTimeout => self.route_timeout(),
            TimerEvent::ConnectionKeepalive(cid) => self.connection_keepalive(cid),
            TimerEvent::ConnectionTimeout(cid) => self.connection_timeout(cid),
            TimerEvent::ConnectionPoll(cid) => self.connection_poll(cid),
            TimerEvent::GlobalRekey => self.global_rekey(),
            TimerEvent::TunnelRekey(peer) => self.tunnel_rekey(peer),
            TimerEvent::KxFinish(peer) => self.finish_kx(peer),
            TimerEvent::PathInvalidated(id) => self.path_invalidation_expired(id),
            TimerEvent::TunnelDestroy(peer) => self.tunnel_destroy_if_empty(peer),
        }
    }

    /// Next action for the driver
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    pub(crate) fn emit(&mut self, output: Output) {
        self.outputs.push_back(output);
    }

    /// Queue an envelope towards a neighbor; false if it is not one
    pub(crate) fn send_envelope(&mut self, to: &PeerIdentity, envelope: Envelope, front: bool) -> bool {
        let Some(queue) = self.peers.queue_mut(to) else {
            trace!("{:?} is not a neighbor, dropping envelope", to);
            return false;
        };
        if front {
            queue.push_front(envelope);
        } else {
            queue.push(envelope);
        }
        self.pump(to);
        true
    }

    /// Hand the next queued envelope to the transport if it is idle
    fn pump(&mut self, to: &PeerIdentity) {
        loop {
            let Some(message) = self.peers.queue_mut(to).and_then(|q| q.next_to_transmit()) else {
                return;
            };
            let drop_percent = self.config.drop_percent;
            if drop_percent > 0 && self.rng.gen_range(0..100u8) < drop_percent {
                warn!("Dropping message to {:?} on purpose", to);
                self.stats.bump("# messages dropped on purpose");
                // Completes as if sent, without reaching the wire
                self.envelope_done(to);
                continue;
            }
            self.emit(Output::Transmit { to: *to, message });
            return;
        }
    }

    /// The transport finished sending the message handed out for `peer`
    pub fn transmit_done(&mut self, peer: PeerIdentity) {
        if !self.envelope_done(&peer) {
            return;
        }
        self.pump(&peer);
    }

    fn envelope_done(&mut self, peer: &PeerIdentity) -> bool {
        let Some(envelope) = self.peers.queue_mut(peer).and_then(|q| q.complete()) else {
            debug!("transmit_done for {:?} without message in flight", peer);
            return false;
        };
        match envelope.origin {
            Origin::Route { cid, hop } => self.route_dir_ready(cid, hop),
            Origin::Connection { cid, handle } => self.connection_transmitted(cid, handle),
            Origin::Plain => {}
        }
        true
    }

    /// A message arrived from the direct neighbor `from`
    pub fn handle_message(&mut self, from: PeerIdentity, bytes: Bytes) {
        if self.shut_down {
            return;
        }
        if !self.peers.is_neighbor(&from) {
            warn!("Message from {:?}, which is not a neighbor", from);
            self.stats.bump("# messages from non-neighbors");
            return;
        }
        self.touch_peer(&from);
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed message from {:?}: {}", from, e);
                self.stats.bump("# malformed messages");
                return;
            }
        };
        trace!("Got {:?} from {:?} on {:?}", message.message_type(), from, message.cid());
        match message {
            Message::ConnectionCreate(create) => self.handle_connection_create(from, create, bytes),
            other => self.handle_connection_message(from, other, bytes),
        }
    }

    pub(crate) fn register_send(&mut self, location: SendLocation, continuation: Option<Continuation>) -> SendHandle {
        let handle = SendHandle(self.next_send);
        self.next_send += 1;
        self.pending_sends.insert(
            handle,
            PendingSend {
                location,
                continuation,
            },
        );
        handle
    }

    pub(crate) fn relocate_send(&mut self, handle: SendHandle, location: SendLocation) {
        if let Some(pending) = self.pending_sends.get_mut(&handle) {
            pending.location = location;
        }
    }

    /// Fire the continuation of a send; later calls for it do nothing
    pub(crate) fn complete_send(&mut self, handle: SendHandle, outcome: SendOutcome) {
        if let Some(pending) = self.pending_sends.remove(&handle) {
            if let Some(continuation) = pending.continuation {
                continuation(outcome);
            }
        }
    }

    /// Cancel a queued send; its continuation fires with `NotSent`
    pub fn cancel_send(&mut self, handle: SendHandle) -> Result<(), CancelError> {
        let location = match self.pending_sends.get(&handle) {
            Some(pending) => pending.location,
            None => return Err(CancelError::AlreadySent),
        };
        match location {
            SendLocation::Tunnel(peer) => self.tunnel_cancel(peer, handle),
            SendLocation::Connection { cid, hop } => self.connection_cancel(cid, hop, handle),
        }
        self.complete_send(handle, SendOutcome::NotSent);
        Ok(())
    }

    /// Tear everything down; the core ignores input afterwards
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        info!("Shutting down core {:?}", self.me);
        let tunnels: Vec<PeerIdentity> = self.tunnels.keys().copied().collect();
        for peer in tunnels {
            self.tunnel_destroy(peer);
        }
        let cids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for cid in cids {
            self.connection_destroy(cid, true);
        }
        for cid in self.routes.cids() {
            self.destroy_route(cid);
        }
        let handles: Vec<SendHandle> = self.pending_sends.keys().copied().collect();
        for handle in handles {
            self.complete_send(handle, SendOutcome::NotSent);
        }
        self.ports.clear();
        self.timers.clear();
        self.route_timer = None;
        self.shut_down = true;
    }
}
