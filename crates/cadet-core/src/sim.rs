//! In-process network with virtual time
//!
//! Runs several cores side by side, carries their transmissions over
//! lossless links and answers DHT lookups with the shortest path in the
//! link topology. Time moves only when asked to, so a scenario plays out
//! the same way every run apart from key material and connection ids.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cadet_crypto::{Identity, PeerIdentity};
use tracing::{debug, trace, warn};

use crate::channel::ChannelEvent;
use crate::config::CoreConfig;
use crate::core::Core;
use crate::error::CoreResult;
use crate::message::{peek_header, MessageType};
use crate::output::Output;

/// Upper bound of delivery rounds in one `run_until_idle`
const MAX_ROUNDS: usize = 100_000;

/// One message carried over a link
#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: PeerIdentity,
    pub to: PeerIdentity,
    pub message_type: Option<MessageType>,
    pub message: Bytes,
}

/// A set of cores joined by links
pub struct Network {
    now: Instant,
    nodes: BTreeMap<PeerIdentity, Core>,
    links: BTreeSet<(PeerIdentity, PeerIdentity)>,
    in_flight: VecDeque<(PeerIdentity, PeerIdentity, Bytes)>,
    /// Running DHT lookups as (searcher, target)
    searches: BTreeSet<(PeerIdentity, PeerIdentity)>,
    events: Vec<(PeerIdentity, ChannelEvent)>,
    connect_requests: Vec<(PeerIdentity, PeerIdentity)>,
    log: Vec<Delivery>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

fn link(a: PeerIdentity, b: PeerIdentity) -> (PeerIdentity, PeerIdentity) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Network {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            nodes: BTreeMap::new(),
            links: BTreeSet::new(),
            in_flight: VecDeque::new(),
            searches: BTreeSet::new(),
            events: Vec::new(),
            connect_requests: Vec::new(),
            log: Vec::new(),
        }
    }

    /// Current virtual time
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Add a peer with a fresh identity
    pub fn add_peer(&mut self, config: CoreConfig) -> CoreResult<PeerIdentity> {
        self.add_identity(Identity::generate(), config)
    }

    pub fn add_identity(&mut self, identity: Identity, config: CoreConfig) -> CoreResult<PeerIdentity> {
        let core = Core::new(identity, config, self.now)?;
        let id = *core.local_id();
        self.nodes.insert(id, core);
        Ok(id)
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.nodes.keys().copied().collect()
    }

    pub fn core(&self, id: &PeerIdentity) -> Option<&Core> {
        self.nodes.get(id)
    }

    pub fn core_mut(&mut self, id: &PeerIdentity) -> Option<&mut Core> {
        self.nodes.get_mut(id)
    }

    pub fn is_linked(&self, a: PeerIdentity, b: PeerIdentity) -> bool {
        self.links.contains(&link(a, b))
    }

    /// Bring up a link between two peers
    pub fn connect(&mut self, a: PeerIdentity, b: PeerIdentity) {
        if a == b || !self.links.insert(link(a, b)) {
            return;
        }
        debug!("Link up: {:?} - {:?}", a, b);
        if let Some(core) = self.nodes.get_mut(&a) {
            core.peer_connected(b);
        }
        if let Some(core) = self.nodes.get_mut(&b) {
            core.peer_connected(a);
        }
        self.answer_searches();
    }

    /// Take a link down; messages on it are lost
    pub fn disconnect(&mut self, a: PeerIdentity, b: PeerIdentity) {
        if !self.links.remove(&link(a, b)) {
            return;
        }
        debug!("Link down: {:?} - {:?}", a, b);
        self.in_flight
            .retain(|(from, to, _)| link(*from, *to) != link(a, b));
        if let Some(core) = self.nodes.get_mut(&a) {
            core.peer_disconnected(b);
        }
        if let Some(core) = self.nodes.get_mut(&b) {
            core.peer_disconnected(a);
        }
        self.answer_searches();
    }

    /// Shortest path over the links, both ends included
    pub fn shortest_path(&self, from: PeerIdentity, to: PeerIdentity) -> Option<Vec<PeerIdentity>> {
        let mut parent: BTreeMap<PeerIdentity, PeerIdentity> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = BTreeSet::from([from]);
        while let Some(at) = queue.pop_front() {
            if at == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(prev) = parent.get(&cursor) {
                    path.push(*prev);
                    cursor = *prev;
                }
                path.reverse();
                return Some(path);
            }
            let neighbors = self.links.iter().filter_map(|(a, b)| {
                if *a == at {
                    Some(*b)
                } else if *b == at {
                    Some(*a)
                } else {
                    None
                }
            });
            for next in neighbors {
                if seen.insert(next) {
                    parent.insert(next, at);
                    queue.push_back(next);
                }
            }
        }
        None
    }

    fn answer_search(&mut self, searcher: PeerIdentity, target: PeerIdentity) {
        let Some(path) = self.shortest_path(searcher, target) else {
            trace!("No path from {:?} to {:?} yet", searcher, target);
            return;
        };
        if path.len() < 2 {
            return;
        }
        // As a DHT records it: hops nearest to the searcher last
        let put_path: Vec<PeerIdentity> = path[1..].iter().rev().copied().collect();
        let hello = Bytes::from(target.to_hex());
        if let Some(core) = self.nodes.get_mut(&searcher) {
            core.handle_dht_result(&[], &put_path, Some(hello));
        }
    }

    fn answer_searches(&mut self) {
        let searches: Vec<_> = self.searches.iter().copied().collect();
        for (searcher, target) in searches {
            self.answer_search(searcher, target);
        }
    }

    /// Handle every pending output; false if there was none
    fn drain_outputs(&mut self) -> bool {
        let mut progressed = false;
        for id in self.peers() {
            while let Some(output) = self.nodes.get_mut(&id).and_then(Core::poll_output) {
                progressed = true;
                match output {
                    Output::Transmit { to, message } => {
                        if self.is_linked(id, to) {
                            self.in_flight.push_back((id, to, message));
                        } else {
                            trace!("Link {:?} - {:?} is down, message lost", id, to);
                        }
                        if let Some(core) = self.nodes.get_mut(&id) {
                            core.transmit_done(to);
                        }
                    }
                    Output::DhtSearch { target } => {
                        self.searches.insert((id, target));
                        self.answer_search(id, target);
                    }
                    Output::DhtStop { target } => {
                        self.searches.remove(&(id, target));
                    }
                    Output::TryConnect { peer, .. } => {
                        self.connect_requests.push((id, peer));
                    }
                    Output::Channel(event) => self.events.push((id, event)),
                }
            }
        }
        progressed
    }

    /// Carry messages until no core has anything left to say
    ///
    /// Returns the number of messages delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_ROUNDS {
            let progressed = self.drain_outputs();
            if self.in_flight.is_empty() && !progressed {
                return delivered;
            }
            let batch: Vec<_> = self.in_flight.drain(..).collect();
            for (from, to, message) in batch {
                if !self.is_linked(from, to) {
                    continue;
                }
                self.log.push(Delivery {
                    from,
                    to,
                    message_type: peek_header(&message).ok().map(|(_, t)| t),
                    message: message.clone(),
                });
                if let Some(core) = self.nodes.get_mut(&to) {
                    core.handle_message(from, message);
                    delivered += 1;
                }
            }
        }
        warn!("Network did not settle after {} rounds", MAX_ROUNDS);
        delivered
    }

    /// Let virtual time pass, firing timers in order
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        loop {
            let next = self.nodes.values_mut().filter_map(Core::next_deadline).min();
            match next {
                Some(at) if at <= target => {
                    self.now = self.now.max(at);
                    let now = self.now;
                    for core in self.nodes.values_mut() {
                        core.advance(now);
                    }
                    self.run_until_idle();
                }
                _ => break,
            }
        }
        self.now = target;
        for core in self.nodes.values_mut() {
            core.advance(target);
        }
        self.run_until_idle();
    }

    /// Channel events reported so far, oldest first
    pub fn take_events(&mut self) -> Vec<(PeerIdentity, ChannelEvent)> {
        std::mem::take(&mut self.events)
    }

    /// Every delivered message, oldest first
    pub fn deliveries(&self) -> &[Delivery] {
        &self.log
    }

    /// Transport connects asked for, as (asking peer, target)
    pub fn connect_requests(&self) -> &[(PeerIdentity, PeerIdentity)] {
        &self.connect_requests
    }

    /// Shut every core down and deliver the goodbyes
    pub fn shutdown(&mut self) {
        for core in self.nodes.values_mut() {
            core.shutdown();
        }
        self.run_until_idle();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::channel::{ChannelNumber, ChannelOptions, Port};
    use crate::connection::ConnectionState;
    use crate::error::CancelError;
    use crate::message::Message;
    use crate::output::{Continuation, SendOutcome};
    use crate::kx::EncryptionState;
    use crate::router::Hop;
    use crate::tunnel::ConnectivityState;

    fn port() -> Port {
        Port::from_name("test")
    }

    fn line(n: usize) -> (Network, Vec<PeerIdentity>) {
        let mut net = Network::new();
        let ids: Vec<_> = (0..n)
            .map(|_| net.add_peer(CoreConfig::testing()).unwrap())
            .collect();
        for pair in ids.windows(2) {
            net.connect(pair[0], pair[1]);
        }
        (net, ids)
    }

    fn open_channel(net: &mut Network, from: PeerIdentity, to: PeerIdentity) -> ChannelNumber {
        net.core_mut(&to).unwrap().open_port(port()).unwrap();
        let chid = net
            .core_mut(&from)
            .unwrap()
            .channel_create(to, port(), ChannelOptions::RELIABLE)
            .unwrap();
        net.run_until_idle();
        let events = net.take_events();
        assert!(events.contains(&(from, ChannelEvent::ChannelOpened { peer: to, chid })));
        assert!(events.iter().any(|(at, e)| *at == to
            && matches!(e, ChannelEvent::IncomingChannel { peer, port: p, .. } if *peer == from && *p == port())));
        chid
    }

    fn received(events: &[(PeerIdentity, ChannelEvent)], at: PeerIdentity) -> Vec<Bytes> {
        events
            .iter()
            .filter(|(peer, _)| *peer == at)
            .filter_map(|(_, e)| match e {
                ChannelEvent::Data { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn send(net: &mut Network, from: PeerIdentity, to: PeerIdentity, chid: ChannelNumber, data: &'static [u8]) {
        net.core_mut(&from)
            .unwrap()
            .channel_send(to, chid, Bytes::from_static(data), None)
            .unwrap();
        net.run_until_idle();
    }

    fn recorder() -> (Arc<Mutex<Vec<SendOutcome>>>, Continuation) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        (fired, Box::new(move |outcome| sink.lock().unwrap().push(outcome)))
    }

    /// Messages the connection of `core` towards `to` has at the first hop
    fn queued(core: &Core, to: &PeerIdentity) -> usize {
        let cid = core.connections_to(to)[0];
        core.connections[&cid].queue_len()
    }

    #[test]
    fn test_three_hop_relay() {
        let (mut net, ids) = line(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        open_channel(&mut net, a, c);

        // A's connection runs over B and is ready
        let cids = net.core(&a).unwrap().connections_to(&c);
        assert_eq!(cids.len(), 1);
        let cid = cids[0];
        assert_eq!(net.core(&a).unwrap().connection_state(&cid), Some(ConnectionState::Ready));

        // B only relays
        let relay = net.core(&b).unwrap();
        assert_eq!(relay.route_count(), 1);
        let route = relay.route_table().get(&cid).unwrap();
        assert_eq!(route.dir(Hop::Prev).hop, a);
        assert_eq!(route.dir(Hop::Next).hop, c);
        assert!(relay.tunnel_peers().is_empty());

        // C knows the inverted path back to A
        let dest = net.core(&c).unwrap();
        assert_eq!(dest.connections_to(&a), vec![cid]);
        let registry = dest.peer_registry();
        let back = registry
            .paths_through(&a)
            .into_iter()
            .find(|(id, off)| *off == 2 && registry.path(*id).map_or(false, |p| p.len() == 3))
            .map(|(id, _)| id)
            .unwrap();
        assert_eq!(registry.path_identities(back, 2), vec![c, b, a]);

        for (peer, other) in [(a, c), (c, a)] {
            let info = net.core(&peer).unwrap().tunnel_info(&other).unwrap();
            assert_eq!(info.estate, EncryptionState::Ok);
            assert_eq!(info.cstate, ConnectivityState::Ready);
        }
    }

    #[test]
    fn test_data_both_ways() {
        let (mut net, ids) = line(4);
        let (a, d) = (ids[0], ids[3]);
        let chid = open_channel(&mut net, a, d);

        send(&mut net, a, d, chid, b"ping");
        send(&mut net, d, a, chid, b"pong");
        net.core_mut(&d).unwrap().channel_ack(a, chid).unwrap();
        net.run_until_idle();

        let events = net.take_events();
        assert_eq!(received(&events, d), vec![Bytes::from_static(b"ping")]);
        assert_eq!(received(&events, a), vec![Bytes::from_static(b"pong")]);
        assert!(events
            .iter()
            .any(|(at, e)| *at == a && matches!(e, ChannelEvent::DataAck { mid: 0, .. })));

        // Relays only keep routes
        for relay in [ids[1], ids[2]] {
            let core = net.core(&relay).unwrap();
            assert!(core.tunnel_peers().is_empty());
            assert_eq!(core.route_count(), 1);
        }
        assert!(net
            .deliveries()
            .iter()
            .all(|d| d.message_type.is_some()));
    }

    #[test]
    fn test_closed_port_refuses_channel() {
        let (mut net, ids) = line(2);
        let (a, b) = (ids[0], ids[1]);
        let chid = net
            .core_mut(&a)
            .unwrap()
            .channel_create(b, port(), ChannelOptions::DEFAULT)
            .unwrap();
        net.run_until_idle();
        let events = net.take_events();
        assert!(events.contains(&(a, ChannelEvent::ChannelRefused { peer: b, chid })));
        assert_eq!(net.core(&b).unwrap().statistics().get("# channel opens refused"), 1);
    }

    #[test]
    fn test_remote_destroy() {
        let (mut net, ids) = line(3);
        let (a, c) = (ids[0], ids[2]);
        let chid = open_channel(&mut net, a, c);

        net.core_mut(&a).unwrap().channel_destroy(c, chid).unwrap();
        net.run_until_idle();
        let events = net.take_events();
        assert!(events.contains(&(c, ChannelEvent::ChannelDestroyed { peer: a, chid })));

        // Both tunnels go once the destroy delay passed
        net.advance(CoreConfig::testing().tunnel_destroy_delay + Duration::from_secs(1));
        assert!(net.core(&a).unwrap().tunnel_info(&c).is_none());
        assert!(net.core(&c).unwrap().tunnel_info(&a).is_none());
        assert_eq!(net.core(&ids[1]).unwrap().route_count(), 0);
    }

    #[test]
    fn test_key_rollover_keeps_traffic_flowing() {
        let (mut net, ids) = line(3);
        let (a, c) = (ids[0], ids[2]);
        let chid = open_channel(&mut net, a, c);

        let period = CoreConfig::testing().rekey_period;
        net.advance(period + Duration::from_secs(61));
        for peer in [a, c] {
            assert!(net.core(&peer).unwrap().statistics().get("# global rekeys") >= 1);
        }
        send(&mut net, a, c, chid, b"after rekey");

        let events = net.take_events();
        assert_eq!(received(&events, c), vec![Bytes::from_static(b"after rekey")]);
        for (peer, other) in [(a, c), (c, a)] {
            let info = net.core(&peer).unwrap().tunnel_info(&other).unwrap();
            assert_eq!(info.estate, EncryptionState::Ok);
            assert!(!info.kx_in_progress);
        }
        assert_eq!(net.core(&c).unwrap().statistics().get("# wrong HMAC"), 0);
    }

    #[test]
    fn test_traffic_under_old_key_during_rekey() {
        let (mut net, ids) = line(2);
        let (a, b) = (ids[0], ids[1]);
        let chid = open_channel(&mut net, a, b);

        // A switches keys; its data still goes out under the old key and
        // B, which moves to the new key first, still reads it
        let core = net.core_mut(&a).unwrap();
        core.global_rekey();
        core.tunnel_rekey(b);
        core.channel_send(b, chid, Bytes::from_static(b"in flight"), None)
            .unwrap();
        net.run_until_idle();

        let events = net.take_events();
        assert_eq!(received(&events, b), vec![Bytes::from_static(b"in flight")]);
        assert_eq!(net.core(&b).unwrap().statistics().get("# wrong HMAC"), 0);
        assert_eq!(
            net.core(&a).unwrap().tunnel_info(&b).unwrap().estate,
            EncryptionState::Ok
        );
    }

    #[test]
    fn test_simultaneous_rekeys() {
        let (mut net, ids) = line(3);
        let (a, c) = (ids[0], ids[2]);
        let chid = open_channel(&mut net, a, c);

        for (peer, other) in [(a, c), (c, a)] {
            let core = net.core_mut(&peer).unwrap();
            core.global_rekey();
            core.tunnel_rekey(other);
        }
        net.run_until_idle();

        for (peer, other) in [(a, c), (c, a)] {
            let info = net.core(&peer).unwrap().tunnel_info(&other).unwrap();
            assert_eq!(info.estate, EncryptionState::Ok, "{:?}", peer);
        }
        send(&mut net, a, c, chid, b"one");
        send(&mut net, c, a, chid, b"two");
        let events = net.take_events();
        assert_eq!(received(&events, c), vec![Bytes::from_static(b"one")]);
        assert_eq!(received(&events, a), vec![Bytes::from_static(b"two")]);

        // Old keys are dropped after the finish delay
        net.advance(Duration::from_secs(61));
        assert!(!net.core(&a).unwrap().tunnel_info(&c).unwrap().kx_in_progress);
    }

    #[test]
    fn test_cancel_send_queued_behind_busy_neighbor() {
        let (mut net, ids) = line(2);
        let (a, b) = (ids[0], ids[1]);
        let chid = open_channel(&mut net, a, b);
        net.take_events();

        let core = net.core_mut(&a).unwrap();
        let cid = core.connections_to(&b)[0];
        assert!(core.connections[&cid].get_buffer() >= 2);
        assert_eq!(queued(core, &b), 0);

        // The first message occupies the transport, the second waits
        core.channel_send(b, chid, Bytes::from_static(b"first"), None)
            .unwrap();
        let (fired, continuation) = recorder();
        let handle = core
            .channel_send(b, chid, Bytes::from_static(b"second"), Some(continuation))
            .unwrap();
        assert_eq!(queued(core, &b), 2);

        core.cancel_send(handle).unwrap();
        assert_eq!(*fired.lock().unwrap(), vec![SendOutcome::NotSent]);
        assert_eq!(queued(core, &b), 1);

        net.run_until_idle();
        assert_eq!(*fired.lock().unwrap(), vec![SendOutcome::NotSent]);
        assert_eq!(queued(net.core(&a).unwrap(), &b), 0);
        let events = net.take_events();
        assert_eq!(received(&events, b), vec![Bytes::from_static(b"first")]);
        assert_eq!(
            net.core_mut(&a).unwrap().cancel_send(handle),
            Err(CancelError::AlreadySent)
        );
    }

    #[test]
    fn test_cancel_send_in_flight_completes_without_sent() {
        let (mut net, ids) = line(2);
        let (a, b) = (ids[0], ids[1]);
        let chid = open_channel(&mut net, a, b);

        let core = net.core_mut(&a).unwrap();
        let (fired, continuation) = recorder();
        let handle = core
            .channel_send(b, chid, Bytes::from_static(b"gone"), Some(continuation))
            .unwrap();
        let mut handed_out = Vec::new();
        while let Some(output) = core.poll_output() {
            if let Output::Transmit { to, .. } = output {
                handed_out.push(to);
            }
        }
        assert_eq!(handed_out, vec![b]);
        assert_eq!(queued(core, &b), 1);

        // Already with the transport: only the continuation goes
        core.cancel_send(handle).unwrap();
        assert_eq!(*fired.lock().unwrap(), vec![SendOutcome::NotSent]);
        assert_eq!(queued(core, &b), 1);

        core.transmit_done(b);
        assert_eq!(*fired.lock().unwrap(), vec![SendOutcome::NotSent]);
        assert_eq!(queued(core, &b), 0);
        assert_eq!(core.cancel_send(handle), Err(CancelError::AlreadySent));
    }

    #[test]
    fn test_old_key_rejected_after_kx_finish() {
        let (mut net, ids) = line(2);
        let (a, b) = (ids[0], ids[1]);
        let chid = open_channel(&mut net, a, b);
        send(&mut net, a, b, chid, b"before");
        assert_eq!(received(&net.take_events(), b), vec![Bytes::from_static(b"before")]);
        let sealed = net
            .deliveries()
            .iter()
            .rev()
            .find(|d| d.from == a && d.to == b && d.message_type == Some(MessageType::TunnelEncrypted))
            .map(|d| d.message.clone())
            .unwrap();

        let core = net.core_mut(&a).unwrap();
        core.global_rekey();
        core.tunnel_rekey(b);
        net.run_until_idle();
        net.advance(Duration::from_secs(61));
        for (peer, other) in [(a, b), (b, a)] {
            let info = net.core(&peer).unwrap().tunnel_info(&other).unwrap();
            assert_eq!(info.estate, EncryptionState::Ok);
            assert!(!info.kx_in_progress);
        }
        net.take_events();

        // Replay under a fresh packet id so only the key can reject it
        let receiver = net.core(&b).unwrap();
        let cid = receiver.connections_to(&a)[0];
        let connection = &receiver.connections[&cid];
        let next_pid = connection.fc(connection.inbound()).last_pid_recv.wrapping_add(1);
        let Message::TunnelEncrypted(mut replay) = Message::decode(&sealed).unwrap() else {
            panic!("captured message is not TUNNEL_ENCRYPTED");
        };
        assert_eq!(replay.cid, cid);
        replay.pid = next_pid;
        let bytes = Message::TunnelEncrypted(replay).encode().unwrap();

        let stats = receiver.statistics();
        let (unsolicited, duplicate) = (stats.get("# unsolicited message"), stats.get("# duplicate PID"));
        assert_eq!(stats.get("# wrong HMAC"), 0);

        net.core_mut(&b).unwrap().handle_message(a, bytes);
        net.run_until_idle();

        let stats = net.core(&b).unwrap().statistics();
        assert_eq!(stats.get("# wrong HMAC"), 1);
        assert_eq!(stats.get("# unsolicited message"), unsolicited);
        assert_eq!(stats.get("# duplicate PID"), duplicate);
        assert!(received(&net.take_events(), b).is_empty());
    }

    #[test]
    fn test_reroute_after_link_loss() {
        // A - B - C and A - D - C
        let mut net = Network::new();
        let ids: Vec<_> = (0..4)
            .map(|_| net.add_peer(CoreConfig::testing()).unwrap())
            .collect();
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
        for (x, y) in [(a, b), (b, c), (a, d), (d, c)] {
            net.connect(x, y);
        }
        let chid = open_channel(&mut net, a, c);

        let relay = if net.core(&b).unwrap().route_count() == 1 { b } else { d };
        let spare = if relay == b { d } else { b };
        net.disconnect(relay, c);
        net.run_until_idle();

        assert_eq!(net.core(&spare).unwrap().route_count(), 1);
        assert_eq!(net.core(&relay).unwrap().route_count(), 0);
        send(&mut net, a, c, chid, b"rerouted");
        let events = net.take_events();
        assert_eq!(received(&events, c), vec![Bytes::from_static(b"rerouted")]);
        assert!(net.core(&a).unwrap().statistics().get("# paths invalidated") >= 1);
    }

    #[test]
    fn test_shutdown_tears_down_routes() {
        let (mut net, ids) = line(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        open_channel(&mut net, a, c);
        let cid = net.core(&a).unwrap().connections_to(&c)[0];

        net.core_mut(&a).unwrap().shutdown();
        net.run_until_idle();

        assert!(net.core(&b).unwrap().route_table().get(&cid).is_none());
        assert_eq!(net.core(&c).unwrap().connection_state(&cid), None);
        let destroys = net
            .deliveries()
            .iter()
            .filter(|d| d.message_type == Some(MessageType::ConnectionDestroy))
            .count();
        assert_eq!(destroys, 2);
    }
}
