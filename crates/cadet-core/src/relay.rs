//! Relay operations
//!
//! Handles connection-level traffic arriving from neighbors: CREATE sets up
//! a route (or a local connection at the last hop), everything else goes to
//! a local connection endpoint or is routed to the other side of the route.
//! Broken links are reported back with CONNECTION_BROKEN.

use bytes::Bytes;
use cadet_crypto::PeerIdentity;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionId;
use crate::core::{Core, TimerEvent};
use crate::message::{peek_header, ConnectionBroken, ConnectionCreate, Message};
use crate::mq::{Envelope, Origin};
use crate::path;
use crate::router::{Hop, Priority, Routed};

/// Identity used in BROKEN messages when the broken link is unknown
const UNKNOWN_PEER: PeerIdentity = PeerIdentity::from_bytes([0; 32]);

impl Core {
    /// CONNECTION_CREATE from neighbor `from`
    pub(crate) fn handle_connection_create(&mut self, from: PeerIdentity, create: ConnectionCreate, raw: Bytes) {
        let ConnectionCreate { options, cid, path } = create;
        if path.is_empty() || !path::is_loop_free(&path) {
            warn!("CREATE {:?} from {:?} with bad path", cid, from);
            self.stats.bump("# malformed CREATE");
            return;
        }
        let me = self.me;
        let Some(off) = path.iter().skip(1).position(|p| *p == me).map(|i| i + 1) else {
            warn!("CREATE {:?} from {:?} does not include us", cid, from);
            self.stats.bump("# CREATE not for us");
            return;
        };
        if path[off - 1] != from {
            warn!("CREATE {:?} came from {:?}, expected {:?}", cid, from, path[off - 1]);
            self.stats.bump("# CREATE from wrong hop");
            return;
        }

        if self.routes.contains(&cid) {
            trace!("Duplicate CREATE {:?}, routing it on", cid);
            self.route_message(from, cid, raw, Priority::from_bits(Priority::LOW_LATENCY));
            return;
        }

        if off == path.len() - 1 {
            if self.connections.contains_key(&cid) {
                self.connection_handle_duplicate_create(cid);
                return;
            }
            let origin = path[0];
            let to_origin = path::invert(&path[..=off]);
            let now = self.now;
            let accepted = match self.peers.get_path_from_route(&to_origin, now) {
                Some((path_id, origin_off)) => {
                    self.tunnel_accept_connection(origin, path_id, origin_off, cid, options)
                }
                None => false,
            };
            if !accepted {
                debug!("Refusing connection {:?} from {:?}", cid, origin);
                self.send_broken(&from, cid, me, UNKNOWN_PEER);
            }
            self.process_path_attachments();
            return;
        }

        let next = path[off + 1];
        if !self.peers.is_neighbor(&next) {
            debug!("CREATE {:?}: next hop {:?} is not a neighbor", cid, next);
            self.stats.bump("# CREATE for unreachable hop");
            self.send_broken(&from, cid, me, next);
            return;
        }
        if self.routes.is_full() {
            warn!("Route table full, refusing {:?}", cid);
            self.stats.bump("# CREATE refused, route table full");
            self.send_broken(&from, cid, me, next);
            return;
        }
        let now = self.now;
        self.routes.insert(cid, (from, true), (next, true), options, now);
        self.stats.set("# route entries", self.routes.len() as i64);
        debug!("Route {:?}: {:?} <-> {:?}", cid, from, next);
        self.schedule_route_timeout();
        self.route_message(from, cid, raw, Priority::from_bits(Priority::LOW_LATENCY));
    }

    /// Any connection-level message other than CREATE
    pub(crate) fn handle_connection_message(&mut self, from: PeerIdentity, message: Message, raw: Bytes) {
        let cid = *message.cid();
        if let Some(connection) = self.connections.get(&cid) {
            if connection.next_hop != from {
                warn!("{:?} for {:?} from {:?}, not our next hop", message.message_type(), cid, from);
                self.stats.bump("# messages from wrong hop");
                return;
            }
            self.dispatch_local(cid, message);
            return;
        }

        if message.message_type().is_teardown() {
            self.relay_teardown(from, cid, raw);
            return;
        }
        let priority = match &message {
            Message::TunnelEncrypted(_) => self
                .routes
                .get(&cid)
                .map(|route| Priority::for_options(route.options))
                .unwrap_or_default(),
            _ => Priority::CONTROL,
        };
        self.route_message(from, cid, raw, priority);
    }

    fn dispatch_local(&mut self, cid: ConnectionId, message: Message) {
        match message {
            Message::ConnectionCreate(_) => {}
            Message::ConnectionCreateAck(_) => self.connection_handle_create_ack(cid),
            Message::ConnectionBroken(broken) => {
                debug!(
                    "Connection {:?} broken between {:?} and {:?}",
                    cid, broken.peer1, broken.peer2
                );
                self.stats.bump("# BROKEN received");
                self.connection_broken(cid);
            }
            Message::ConnectionDestroy(_) => {
                debug!("Connection {:?} destroyed by the remote end", cid);
                self.stats.bump("# DESTROY received");
                self.connection_destroy(cid, false);
            }
            Message::ConnectionAck(ack) => self.connection_handle_ack(cid, ack.ack),
            Message::ConnectionPoll(poll) => self.connection_handle_poll(cid, poll.pid),
            Message::TunnelKx(kx) => {
                self.connection_received(cid);
                self.connection_confirm(cid);
                self.handle_kx(cid, kx);
            }
            Message::TunnelKxAuth(auth) => {
                self.connection_received(cid);
                self.connection_confirm(cid);
                self.handle_kx_auth(cid, auth);
            }
            Message::TunnelEncrypted(encrypted) => {
                self.connection_received(cid);
                if !self.connection_accept_pid(cid, encrypted.pid) {
                    return;
                }
                if encrypted.ttl == 0 {
                    warn!("Encrypted message on {:?} with TTL 0", cid);
                    self.stats.bump("# TTL expired");
                    return;
                }
                self.connection_confirm(cid);
                self.tunnel_handle_encrypted(cid, encrypted);
                self.connection_send_ack(cid, false);
            }
        }
    }

    /// Pass BROKEN or DESTROY on and drop the route
    fn relay_teardown(&mut self, from: PeerIdentity, cid: ConnectionId, raw: Bytes) {
        let Some(route) = self.routes.get(&cid) else {
            trace!("Teardown for unknown route {:?}", cid);
            return;
        };
        let Some(side) = route.side_of(&from) else {
            warn!("Teardown for {:?} from {:?}, not on the route", cid, from);
            self.stats.bump("# messages from wrong hop");
            return;
        };
        let to = route.dir(side.other()).hop;
        self.send_envelope(
            &to,
            Envelope {
                message: raw,
                origin: Origin::Plain,
            },
            false,
        );
        self.destroy_route(cid);
    }

    /// Forward a message along its route
    pub(crate) fn route_message(&mut self, from: PeerIdentity, cid: ConnectionId, raw: Bytes, priority: Priority) {
        let now = self.now;
        match self.routes.route(&cid, &from, raw.clone(), priority, now) {
            Routed::NoRoute => {
                let teardown = peek_header(&raw).map_or(false, |(_, t)| t.is_teardown());
                if teardown {
                    return;
                }
                debug!("No route for {:?} from {:?}", cid, from);
                self.stats.bump("# messages for unknown connection");
                let me = self.me;
                self.send_broken(&from, cid, me, UNKNOWN_PEER);
            }
            Routed::WrongHop => {
                warn!("Message for {:?} from {:?}, which is not on the route", cid, from);
                self.stats.bump("# messages from wrong hop");
            }
            Routed::Transmit { hop, to, message } => {
                trace!("Routing {:?} to {:?}", cid, to);
                let envelope = Envelope {
                    message,
                    origin: Origin::Route { cid, hop },
                };
                if !self.send_envelope(&to, envelope, false) {
                    self.route_dir_unavailable(cid, hop);
                }
            }
            Routed::Buffered { hop, evicted } => {
                trace!("Buffered message for {:?} towards {:?}", cid, hop);
                if evicted > 0 {
                    self.stats.update("# messages dropped due to full buffer", evicted as i64);
                }
            }
            Routed::Duplicate => {
                self.stats.bump("# duplicate messages discarded");
            }
            Routed::Dropped => {
                self.stats.bump("# messages dropped due to full buffer");
            }
        }
        self.stats.set("# buffered messages", self.routes.buffered() as i64);
    }

    /// The neighbor queue took the last message of a route direction
    pub(crate) fn route_dir_ready(&mut self, cid: ConnectionId, hop: Hop) {
        let Some((to, message)) = self.routes.dir_ready(&cid, hop) else {
            return;
        };
        let envelope = Envelope {
            message,
            origin: Origin::Route { cid, hop },
        };
        if !self.send_envelope(&to, envelope, false) {
            self.route_dir_unavailable(cid, hop);
        }
    }

    /// The neighbor of one direction went away
    ///
    /// The other side learns which link broke; the route goes.
    pub(crate) fn route_dir_unavailable(&mut self, cid: ConnectionId, hop: Hop) {
        let Some(route) = self.routes.get(&cid) else {
            return;
        };
        let lost = route.dir(hop).hop;
        let other = route.dir(hop.other()).hop;
        debug!("Route {:?} lost {:?}", cid, lost);
        let me = self.me;
        self.send_broken(&other, cid, me, lost);
        self.destroy_route(cid);
    }

    pub(crate) fn destroy_route(&mut self, cid: ConnectionId) {
        if self.routes.remove(&cid).is_some() {
            trace!("Route {:?} destroyed", cid);
            self.stats.set("# route entries", self.routes.len() as i64);
            self.stats.set("# buffered messages", self.routes.buffered() as i64);
        }
    }

    /// Tell `to` that connection `cid` broke between `peer1` and `peer2`
    pub(crate) fn send_broken(&mut self, to: &PeerIdentity, cid: ConnectionId, peer1: PeerIdentity, peer2: PeerIdentity) {
        let message = Message::ConnectionBroken(ConnectionBroken { cid, peer1, peer2 });
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode BROKEN: {}", e);
                return;
            }
        };
        let envelope = Envelope {
            message: bytes,
            origin: Origin::Plain,
        };
        if self.send_envelope(to, envelope, true) {
            self.stats.bump("# BROKEN transmitted");
        }
    }

    pub(crate) fn schedule_route_timeout(&mut self) {
        if self.route_timer.is_some() {
            return;
        }
        if let Some(at) = self.routes.next_expiry(self.config.route_linger()) {
            self.route_timer = Some(self.timers.schedule_at(at, TimerEvent::RouteTimeout));
        }
    }

    /// Drop routes that saw no traffic for too long
    pub(crate) fn route_timeout(&mut self) {
        self.route_timer = None;
        let linger = self.config.route_linger();
        for cid in self.routes.expired(self.now, linger) {
            let Some(route) = self.routes.get(&cid) else {
                continue;
            };
            debug!("Route {:?} timed out", cid);
            self.stats.bump("# routes timed out");
            let hops = [route.dir(Hop::Prev).hop, route.dir(Hop::Next).hop];
            for to in hops {
                self.send_broken(&to, cid, UNKNOWN_PEER, UNKNOWN_PEER);
            }
            self.destroy_route(cid);
        }
        self.schedule_route_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelOptions;
    use crate::config::CoreConfig;
    use crate::output::Output;
    use cadet_crypto::Identity;
    use std::time::{Duration, Instant};

    struct Relay {
        core: Core,
        prev: PeerIdentity,
        next: PeerIdentity,
        start: Instant,
    }

    /// Core in the middle of `prev -> core -> next`, both neighbors connected
    fn relay() -> Relay {
        let start = Instant::now();
        let identity = Identity::generate();
        let mut core = Core::new(identity, CoreConfig::testing(), start).unwrap();
        let prev = Identity::generate().peer_id();
        let next = Identity::generate().peer_id();
        core.peer_connected(prev);
        core.peer_connected(next);
        Relay { core, prev, next, start }
    }

    fn transmits(core: &mut Core) -> Vec<(PeerIdentity, Bytes)> {
        std::iter::from_fn(|| core.poll_output())
            .filter_map(|output| match output {
                Output::Transmit { to, message } => Some((to, message)),
                _ => None,
            })
            .collect()
    }

    fn create(relay: &Relay, byte: u8) -> (ConnectionId, Bytes) {
        let cid = ConnectionId::from_bytes([byte; 32]);
        let me = *relay.core.local_id();
        let message = Message::ConnectionCreate(ConnectionCreate {
            options: ChannelOptions::DEFAULT,
            cid,
            path: vec![relay.prev, me, relay.next],
        });
        (cid, message.encode().unwrap())
    }

    #[test]
    fn test_create_sets_up_route() {
        let mut relay = relay();
        let (_, raw) = create(&relay, 1);
        relay.core.handle_message(relay.prev, raw.clone());

        assert_eq!(relay.core.route_count(), 1);
        assert_eq!(transmits(&mut relay.core), vec![(relay.next, raw)]);
    }

    #[test]
    fn test_duplicate_create_is_forwarded_once_more() {
        let mut relay = relay();
        let (_, raw) = create(&relay, 1);
        relay.core.handle_message(relay.prev, raw.clone());
        assert_eq!(transmits(&mut relay.core).len(), 1);

        // The first copy is still in flight, so the retry waits its turn
        relay.core.handle_message(relay.prev, raw.clone());
        assert_eq!(relay.core.route_count(), 1);
        assert!(transmits(&mut relay.core).is_empty());

        let next = relay.next;
        relay.core.transmit_done(next);
        assert_eq!(transmits(&mut relay.core), vec![(next, raw)]);
        assert_eq!(relay.core.route_count(), 1);
    }

    #[test]
    fn test_create_towards_stranger_is_refused() {
        let mut relay = relay();
        let stranger = Identity::generate().peer_id();
        let cid = ConnectionId::from_bytes([7; 32]);
        let me = *relay.core.local_id();
        let raw = Message::ConnectionCreate(ConnectionCreate {
            options: ChannelOptions::DEFAULT,
            cid,
            path: vec![relay.prev, me, stranger],
        })
        .encode()
        .unwrap();
        relay.core.handle_message(relay.prev, raw);

        assert_eq!(relay.core.route_count(), 0);
        let sent = transmits(&mut relay.core);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, relay.prev);
        match Message::decode(&sent[0].1).unwrap() {
            Message::ConnectionBroken(broken) => {
                assert_eq!(broken.cid, cid);
                assert_eq!(broken.peer1, me);
                assert_eq!(broken.peer2, stranger);
            }
            other => panic!("expected BROKEN, got {:?}", other.message_type()),
        }
    }

    #[test]
    fn test_idle_route_times_out() {
        let mut relay = relay();
        let (cid, raw) = create(&relay, 3);
        relay.core.handle_message(relay.prev, raw);
        let next = relay.next;
        relay.core.transmit_done(next);
        transmits(&mut relay.core);

        let linger = relay.core.config().route_linger();
        relay.core.advance(relay.start + linger + Duration::from_secs(1));

        assert_eq!(relay.core.route_count(), 0);
        let mut sent = transmits(&mut relay.core);
        sent.sort_by_key(|(to, _)| *to);
        let mut expected = vec![relay.prev, relay.next];
        expected.sort();
        assert_eq!(sent.iter().map(|(to, _)| *to).collect::<Vec<_>>(), expected);
        for (_, message) in &sent {
            assert!(matches!(
                Message::decode(message).unwrap(),
                Message::ConnectionBroken(ref broken) if broken.cid == cid
            ));
        }
        assert_eq!(relay.core.statistics().get("# routes timed out"), 1);
    }

    #[test]
    fn test_teardown_is_relayed_and_drops_route() {
        let mut relay = relay();
        let (cid, raw) = create(&relay, 4);
        relay.core.handle_message(relay.prev, raw);
        let next = relay.next;
        relay.core.transmit_done(next);
        transmits(&mut relay.core);

        let destroy = Message::ConnectionDestroy(crate::message::ConnectionDestroy { cid })
            .encode()
            .unwrap();
        relay.core.handle_message(next, destroy.clone());

        assert_eq!(relay.core.route_count(), 0);
        assert_eq!(transmits(&mut relay.core), vec![(relay.prev, destroy)]);
    }
}
