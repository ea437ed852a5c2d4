//! Relay Route Table
//!
//! Intermediate hops keep one route per connection id, with a direction
//! towards the previous and one towards the next hop. A direction whose
//! neighbor queue is busy buffers messages. All buffers share one global
//! bound; directions are grouped into rungs by buffer depth so that the
//! deepest buffers can be found and trimmed cheaply when the bound is hit.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cadet_crypto::PeerIdentity;
use tracing::trace;

use crate::channel::ChannelOptions;
use crate::config::RungEviction;
use crate::connection::ConnectionId;

/// Side of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hop {
    /// Towards the connection initiator
    Prev,
    /// Towards the connection destination
    Next,
}

impl Hop {
    pub fn other(self) -> Self {
        match self {
            Self::Prev => Self::Next,
            Self::Next => Self::Prev,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Prev => 0,
            Self::Next => 1,
        }
    }
}

/// Buffering preferences of a relayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Priority(u32);

impl Priority {
    /// Reliable, in order, normal latency
    pub const CONTROL: Self = Self(0);
    pub const LOW_LATENCY: u32 = 1;
    pub const OUT_OF_ORDER: u32 = 2;
    pub const UNRELIABLE: u32 = 4;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Priority of payload traffic on a route opened with `options`
    pub fn for_options(options: ChannelOptions) -> Self {
        let mut bits = 0;
        if options.contains(ChannelOptions::LOW_LATENCY) {
            bits |= Self::LOW_LATENCY;
        }
        if options.contains(ChannelOptions::OUT_OF_ORDER) {
            bits |= Self::OUT_OF_ORDER;
        }
        if !options.contains(ChannelOptions::RELIABLE) {
            bits |= Self::UNRELIABLE;
        }
        Self(bits)
    }

    pub fn is_low_latency(&self) -> bool {
        self.0 & Self::LOW_LATENCY != 0
    }

    pub fn is_out_of_order(&self) -> bool {
        self.0 & Self::OUT_OF_ORDER != 0
    }

    pub fn is_unreliable(&self) -> bool {
        self.0 & Self::UNRELIABLE != 0
    }
}

#[derive(Debug)]
struct Buffered {
    message: Bytes,
    priority: Priority,
}

/// One direction of a route
#[derive(Debug)]
pub struct RouteDirection {
    /// Neighbor in this direction
    pub hop: PeerIdentity,
    buffer: VecDeque<Buffered>,
    is_ready: bool,
    /// Index of this direction within its rung
    rung_slot: usize,
}

impl RouteDirection {
    fn new(hop: PeerIdentity, is_ready: bool) -> Self {
        Self {
            hop,
            buffer: VecDeque::new(),
            is_ready,
            rung_slot: 0,
        }
    }

    /// Messages waiting for the neighbor queue
    pub fn depth(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }
}

/// Forwarding entry of a connection we relay
#[derive(Debug)]
pub struct Route {
    pub cid: ConnectionId,
    pub options: ChannelOptions,
    last_use: Instant,
    dirs: [RouteDirection; 2],
}

impl Route {
    pub fn dir(&self, hop: Hop) -> &RouteDirection {
        &self.dirs[hop.index()]
    }

    fn dir_mut(&mut self, hop: Hop) -> &mut RouteDirection {
        &mut self.dirs[hop.index()]
    }

    /// Side on which `peer` sits
    pub fn side_of(&self, peer: &PeerIdentity) -> Option<Hop> {
        if self.dirs[0].hop == *peer {
            Some(Hop::Prev)
        } else if self.dirs[1].hop == *peer {
            Some(Hop::Next)
        } else {
            None
        }
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }
}

/// Result of handing a message to the route table
#[derive(Debug, PartialEq, Eq)]
pub enum Routed {
    /// No route for the connection id
    NoRoute,
    /// The sender is on neither side of the route
    WrongHop,
    /// The target direction was idle: transmit now
    Transmit { hop: Hop, to: PeerIdentity, message: Bytes },
    /// Buffered; `evicted` messages were dropped to make room
    Buffered { hop: Hop, evicted: usize },
    /// Identical message already buffered
    Duplicate,
    /// Buffering is disabled
    Dropped,
}

/// Relay route table with rung-based buffer accounting
#[derive(Debug)]
pub struct RouteTable {
    routes: HashMap<ConnectionId, Route>,
    /// Directions grouped by buffer depth; rung 0 always exists
    rungs: BTreeMap<usize, Vec<(ConnectionId, Hop)>>,
    /// Routes ordered by last use
    expiry: BTreeSet<(Instant, ConnectionId)>,
    cur_buffers: usize,
    max_buffers: usize,
    max_routes: usize,
    policy: RungEviction,
}

impl RouteTable {
    pub fn new(max_routes: usize, max_buffers: usize, policy: RungEviction) -> Self {
        let mut rungs = BTreeMap::new();
        rungs.insert(0, Vec::new());
        Self {
            routes: HashMap::new(),
            rungs,
            expiry: BTreeSet::new(),
            cur_buffers: 0,
            max_buffers,
            max_routes,
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.routes.len() >= self.max_routes
    }

    pub fn get(&self, cid: &ConnectionId) -> Option<&Route> {
        self.routes.get(cid)
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.routes.contains_key(cid)
    }

    /// Connection ids of all routes
    pub fn cids(&self) -> Vec<ConnectionId> {
        let mut cids: Vec<_> = self.routes.keys().copied().collect();
        cids.sort();
        cids
    }

    /// Messages buffered over all routes
    pub fn buffered(&self) -> usize {
        self.cur_buffers
    }

    /// Create a route; directions start ready when their neighbor queue is idle
    pub fn insert(
        &mut self,
        cid: ConnectionId,
        prev: (PeerIdentity, bool),
        next: (PeerIdentity, bool),
        options: ChannelOptions,
        now: Instant,
    ) {
        if self.routes.contains_key(&cid) {
            return;
        }
        let route = Route {
            cid,
            options,
            last_use: now,
            dirs: [
                RouteDirection::new(prev.0, prev.1),
                RouteDirection::new(next.0, next.1),
            ],
        };
        self.expiry.insert((now, cid));
        self.routes.insert(cid, route);
        self.join_rung(0, &cid, Hop::Prev);
        self.join_rung(0, &cid, Hop::Next);
    }

    /// Remove a route, dropping whatever it still buffers
    pub fn remove(&mut self, cid: &ConnectionId) -> Option<Route> {
        for hop in [Hop::Prev, Hop::Next] {
            let dir = self.routes.get(cid)?.dir(hop);
            let (depth, slot) = (dir.depth(), dir.rung_slot);
            self.leave_rung(depth, slot);
        }
        let route = self.routes.remove(cid)?;
        self.expiry.remove(&(route.last_use, *cid));
        self.cur_buffers -= route.dir(Hop::Prev).depth() + route.dir(Hop::Next).depth();
        Some(route)
    }

    /// Record traffic on a route
    pub fn touch(&mut self, cid: &ConnectionId, now: Instant) {
        if let Some(route) = self.routes.get_mut(cid) {
            self.expiry.remove(&(route.last_use, *cid));
            route.last_use = now;
            self.expiry.insert((now, *cid));
        }
    }

    /// Route a message received from `from` towards the other side
    pub fn route(
        &mut self,
        cid: &ConnectionId,
        from: &PeerIdentity,
        message: Bytes,
        priority: Priority,
        now: Instant,
    ) -> Routed {
        let hop = match self.routes.get(cid) {
            None => return Routed::NoRoute,
            Some(route) => match route.side_of(from) {
                Some(side) => side.other(),
                None => return Routed::WrongHop,
            },
        };
        self.touch(cid, now);

        let max_buffers = self.max_buffers;
        let Some(route) = self.routes.get_mut(cid) else {
            return Routed::NoRoute;
        };
        let dir = route.dir_mut(hop);
        if dir.is_ready {
            dir.is_ready = false;
            return Routed::Transmit {
                hop,
                to: dir.hop,
                message,
            };
        }

        if dir.buffer.iter().any(|b| b.message == message) {
            return Routed::Duplicate;
        }
        let mut depth = dir.depth();

        // Fresh low latency traffic supersedes a stale unreliable head
        if priority.is_low_latency()
            && dir.buffer.front().map_or(false, |head| head.priority.is_unreliable())
        {
            dir.buffer.pop_front();
            self.cur_buffers -= 1;
            self.change_rung(cid, hop, depth, depth - 1);
            depth -= 1;
            trace!("Discarded unreliable head on {:?} {:?}", cid, hop);
        }

        if max_buffers == 0 {
            return Routed::Dropped;
        }

        let mut evicted = 0;
        if self.cur_buffers >= max_buffers {
            let deepest = self.deepest_rung();
            if deepest > depth {
                evicted = self.evict_deepest();
            } else {
                self.discard_head(cid, hop);
                depth -= 1;
                evicted = 1;
            }
        }

        let Some(route) = self.routes.get_mut(cid) else {
            return Routed::NoRoute;
        };
        let dir = route.dir_mut(hop);
        let jump = priority.is_low_latency()
            && priority.is_out_of_order()
            && dir.buffer.front().map_or(false, |head| !head.priority.is_low_latency());
        let entry = Buffered { message, priority };
        if jump {
            dir.buffer.push_front(entry);
        } else {
            dir.buffer.push_back(entry);
        }
        self.cur_buffers += 1;
        self.change_rung(cid, hop, depth, depth + 1);

        Routed::Buffered { hop, evicted }
    }

    /// The neighbor queue of a direction became idle
    ///
    /// Returns the next buffered message to transmit, if any; otherwise the
    /// direction is marked ready.
    pub fn dir_ready(&mut self, cid: &ConnectionId, hop: Hop) -> Option<(PeerIdentity, Bytes)> {
        let route = self.routes.get_mut(cid)?;
        let dir = route.dir_mut(hop);
        let depth = dir.depth();
        match dir.buffer.pop_front() {
            Some(buffered) => {
                dir.is_ready = false;
                let to = dir.hop;
                self.cur_buffers -= 1;
                self.change_rung(cid, hop, depth, depth - 1);
                Some((to, buffered.message))
            }
            None => {
                dir.is_ready = true;
                None
            }
        }
    }

    /// Routes with a direction towards `peer`
    pub fn routes_via(&self, peer: &PeerIdentity) -> Vec<(ConnectionId, Hop)> {
        let mut found: Vec<_> = self
            .routes
            .values()
            .filter_map(|route| route.side_of(peer).map(|hop| (route.cid, hop)))
            .collect();
        found.sort();
        found
    }

    /// Routes idle for at least `linger`, oldest first
    pub fn expired(&self, now: Instant, linger: Duration) -> Vec<ConnectionId> {
        self.expiry
            .iter()
            .take_while(|(last_use, _)| *last_use + linger <= now)
            .map(|(_, cid)| *cid)
            .collect()
    }

    /// When the oldest route expires
    pub fn next_expiry(&self, linger: Duration) -> Option<Instant> {
        self.expiry.iter().next().map(|(last_use, _)| *last_use + linger)
    }

    /// Verify rung and buffer accounting
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.rungs.contains_key(&0) {
            return Err("rung 0 is missing".into());
        }
        let mut total = 0;
        let mut members = 0;
        for route in self.routes.values() {
            for hop in [Hop::Prev, Hop::Next] {
                let depth = route.dir(hop).depth();
                total += depth;
                let rung = self
                    .rungs
                    .get(&depth)
                    .ok_or_else(|| format!("no rung {} for {:?} {:?}", depth, route.cid, hop))?;
                let count = rung.iter().filter(|m| **m == (route.cid, hop)).count();
                if count != 1 {
                    return Err(format!(
                        "{:?} {:?} appears {} times in rung {}",
                        route.cid, hop, count, depth
                    ));
                }
                let slot = route.dir(hop).rung_slot;
                if rung.get(slot) != Some(&(route.cid, hop)) {
                    return Err(format!(
                        "{:?} {:?} is not at slot {} of rung {}",
                        route.cid, hop, slot, depth
                    ));
                }
            }
        }
        for (depth, rung) in &self.rungs {
            if *depth != 0 && rung.is_empty() {
                return Err(format!("empty rung {}", depth));
            }
            members += rung.len();
        }
        if members != self.routes.len() * 2 {
            return Err(format!(
                "{} rung members for {} routes",
                members,
                self.routes.len()
            ));
        }
        if total != self.cur_buffers {
            return Err(format!("buffer count {} != {}", self.cur_buffers, total));
        }
        if self.max_buffers > 0 && self.cur_buffers > self.max_buffers {
            return Err(format!(
                "{} buffered exceeds bound {}",
                self.cur_buffers, self.max_buffers
            ));
        }
        Ok(())
    }

    fn deepest_rung(&self) -> usize {
        self.rungs.keys().next_back().copied().unwrap_or(0)
    }

    fn evict_deepest(&mut self) -> usize {
        let deepest = self.deepest_rung();
        if deepest == 0 {
            return 0;
        }
        let victims: Vec<(ConnectionId, Hop)> = match self.policy {
            RungEviction::WholeRung => self.rungs.get(&deepest).cloned().unwrap_or_default(),
            RungEviction::SingleDirection => self
                .rungs
                .get(&deepest)
                .and_then(|rung| rung.first().copied())
                .into_iter()
                .collect(),
        };
        for (cid, hop) in &victims {
            self.discard_head(cid, *hop);
        }
        victims.len()
    }

    fn discard_head(&mut self, cid: &ConnectionId, hop: Hop) {
        let Some(route) = self.routes.get_mut(cid) else {
            return;
        };
        let dir = route.dir_mut(hop);
        let depth = dir.depth();
        if dir.buffer.pop_front().is_some() {
            self.cur_buffers -= 1;
            self.change_rung(cid, hop, depth, depth - 1);
            trace!("Queue full, dropped old message on {:?} {:?}", cid, hop);
        }
    }

    fn change_rung(&mut self, cid: &ConnectionId, hop: Hop, from: usize, to: usize) {
        let Some(slot) = self.routes.get(cid).map(|route| route.dir(hop).rung_slot) else {
            return;
        };
        self.leave_rung(from, slot);
        self.join_rung(to, cid, hop);
    }

    fn join_rung(&mut self, depth: usize, cid: &ConnectionId, hop: Hop) {
        let rung = self.rungs.entry(depth).or_default();
        let slot = rung.len();
        rung.push((*cid, hop));
        if let Some(route) = self.routes.get_mut(cid) {
            route.dir_mut(hop).rung_slot = slot;
        }
    }

    /// Swap-remove the member at `slot`, re-indexing the one moved into it
    fn leave_rung(&mut self, depth: usize, slot: usize) {
        let Some(rung) = self.rungs.get_mut(&depth) else {
            return;
        };
        if slot >= rung.len() {
            return;
        }
        rung.swap_remove(slot);
        if let Some((moved, hop)) = rung.get(slot).copied() {
            if let Some(route) = self.routes.get_mut(&moved) {
                route.dir_mut(hop).rung_slot = slot;
            }
        }
        if rung.is_empty() && depth != 0 {
            self.rungs.remove(&depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(byte: u8) -> PeerIdentity {
        PeerIdentity::from_bytes([byte; 32])
    }

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::from_bytes([byte; 32])
    }

    fn msg(tag: u32) -> Bytes {
        Bytes::from(tag.to_be_bytes().to_vec())
    }

    /// Route `cid` from peer 1 (prev) to peer 2 (next), next side busy
    fn table_with_busy_routes(max_buffers: usize, routes: &[u8], policy: RungEviction) -> RouteTable {
        let now = Instant::now();
        let mut table = RouteTable::new(100, max_buffers, policy);
        for id in routes {
            table.insert(cid(*id), (peer(1), true), (peer(2), false), ChannelOptions::RELIABLE, now);
        }
        table
    }

    #[test]
    fn test_ready_direction_transmits() {
        let now = Instant::now();
        let mut table = RouteTable::new(10, 10, RungEviction::WholeRung);
        table.insert(cid(1), (peer(1), true), (peer(2), true), ChannelOptions::DEFAULT, now);

        let routed = table.route(&cid(1), &peer(1), msg(1), Priority::CONTROL, now);
        assert_eq!(
            routed,
            Routed::Transmit { hop: Hop::Next, to: peer(2), message: msg(1) }
        );
        assert!(!table.get(&cid(1)).unwrap().dir(Hop::Next).is_ready());

        // Second message buffers until the queue reports ready
        assert!(matches!(
            table.route(&cid(1), &peer(1), msg(2), Priority::CONTROL, now),
            Routed::Buffered { hop: Hop::Next, evicted: 0 }
        ));
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(2))));
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), None);
        assert!(table.get(&cid(1)).unwrap().dir(Hop::Next).is_ready());
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_unknown_and_wrong_hop() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(10, &[1], RungEviction::WholeRung);
        assert_eq!(
            table.route(&cid(9), &peer(1), msg(1), Priority::CONTROL, now),
            Routed::NoRoute
        );
        assert_eq!(
            table.route(&cid(1), &peer(7), msg(1), Priority::CONTROL, now),
            Routed::WrongHop
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(10, &[1], RungEviction::WholeRung);
        table.route(&cid(1), &peer(1), msg(1), Priority::CONTROL, now);
        assert_eq!(
            table.route(&cid(1), &peer(1), msg(1), Priority::CONTROL, now),
            Routed::Duplicate
        );
        assert_eq!(table.buffered(), 1);
    }

    #[test]
    fn test_zero_buffers_drops() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(0, &[1], RungEviction::WholeRung);
        assert_eq!(
            table.route(&cid(1), &peer(1), msg(1), Priority::CONTROL, now),
            Routed::Dropped
        );
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_low_latency_replaces_unreliable_head() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(10, &[1], RungEviction::WholeRung);
        let unreliable = Priority::from_bits(Priority::UNRELIABLE);
        let urgent = Priority::from_bits(Priority::LOW_LATENCY);

        table.route(&cid(1), &peer(1), msg(1), unreliable, now);
        table.route(&cid(1), &peer(1), msg(2), urgent, now);

        assert_eq!(table.buffered(), 1);
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(2))));
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_duplicate_low_latency_keeps_unreliable_head() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(10, &[1], RungEviction::WholeRung);
        let unreliable = Priority::from_bits(Priority::UNRELIABLE);
        let urgent = Priority::from_bits(Priority::LOW_LATENCY);

        table.route(&cid(1), &peer(1), msg(1), unreliable, now);
        assert_eq!(
            table.route(&cid(1), &peer(1), msg(1), urgent, now),
            Routed::Duplicate
        );
        assert_eq!(table.buffered(), 1);
        assert_eq!(table.get(&cid(1)).unwrap().dir(Hop::Next).depth(), 1);
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(1))));
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_low_latency_out_of_order_jumps_queue() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(10, &[1], RungEviction::WholeRung);
        let urgent = Priority::from_bits(Priority::LOW_LATENCY | Priority::OUT_OF_ORDER);

        table.route(&cid(1), &peer(1), msg(1), Priority::CONTROL, now);
        table.route(&cid(1), &peer(1), msg(2), Priority::CONTROL, now);
        table.route(&cid(1), &peer(1), msg(3), urgent, now);

        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(3))));
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(1))));
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(2))));
    }

    #[test]
    fn test_overflow_evicts_fullest_rung() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(4, &[1, 2], RungEviction::WholeRung);

        // Route 1 holds three messages, route 2 one: the buffer is full
        for tag in 0..3 {
            table.route(&cid(1), &peer(1), msg(tag), Priority::CONTROL, now);
        }
        table.route(&cid(2), &peer(1), msg(10), Priority::CONTROL, now);
        assert_eq!(table.buffered(), 4);

        // Overflow from the shallower direction trims the deeper one
        let routed = table.route(&cid(2), &peer(1), msg(11), Priority::CONTROL, now);
        assert_eq!(routed, Routed::Buffered { hop: Hop::Next, evicted: 1 });
        assert_eq!(table.get(&cid(1)).unwrap().dir(Hop::Next).depth(), 2);
        assert_eq!(table.get(&cid(2)).unwrap().dir(Hop::Next).depth(), 2);
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(1))));
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_overflow_from_fullest_drops_own_head() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(3, &[1, 2], RungEviction::WholeRung);
        table.route(&cid(1), &peer(1), msg(0), Priority::CONTROL, now);
        table.route(&cid(1), &peer(1), msg(1), Priority::CONTROL, now);
        table.route(&cid(2), &peer(1), msg(10), Priority::CONTROL, now);

        let routed = table.route(&cid(1), &peer(1), msg(2), Priority::CONTROL, now);
        assert_eq!(routed, Routed::Buffered { hop: Hop::Next, evicted: 1 });
        assert_eq!(table.get(&cid(2)).unwrap().dir(Hop::Next).depth(), 1);
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(1))));
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_whole_rung_versus_single_direction() {
        let now = Instant::now();
        for (policy, expected) in [(RungEviction::WholeRung, 2), (RungEviction::SingleDirection, 1)] {
            let mut table = table_with_busy_routes(5, &[1, 2, 3], policy);
            for id in [1u8, 2] {
                table.route(&cid(id), &peer(1), msg(0), Priority::CONTROL, now);
                table.route(&cid(id), &peer(1), msg(1), Priority::CONTROL, now);
            }
            table.route(&cid(3), &peer(1), msg(0), Priority::CONTROL, now);

            let routed = table.route(&cid(3), &peer(1), msg(1), Priority::CONTROL, now);
            assert_eq!(routed, Routed::Buffered { hop: Hop::Next, evicted: expected });
            table.check_invariants().unwrap();
        }
    }

    #[test]
    fn test_expiry_order() {
        let start = Instant::now();
        let linger = Duration::from_secs(180);
        let mut table = RouteTable::new(10, 10, RungEviction::WholeRung);
        table.insert(cid(1), (peer(1), true), (peer(2), true), ChannelOptions::DEFAULT, start);
        table.insert(
            cid(2),
            (peer(1), true),
            (peer(3), true),
            ChannelOptions::DEFAULT,
            start + Duration::from_secs(10),
        );

        assert_eq!(table.next_expiry(linger), Some(start + linger));
        assert!(table.expired(start + Duration::from_secs(100), linger).is_empty());

        table.touch(&cid(1), start + Duration::from_secs(60));
        assert_eq!(table.next_expiry(linger), Some(start + Duration::from_secs(190)));
        assert_eq!(table.expired(start + Duration::from_secs(200), linger), vec![cid(2)]);

        table.remove(&cid(2));
        assert_eq!(table.routes_via(&peer(1)), vec![(cid(1), Hop::Prev)]);
        table.check_invariants().unwrap();
    }

    #[test]
    fn test_rung_slots_follow_removal_from_middle() {
        let now = Instant::now();
        let mut table = table_with_busy_routes(10, &[1, 2, 3, 4], RungEviction::WholeRung);
        for id in [1u8, 2, 3, 4] {
            table.route(&cid(id), &peer(1), msg(id as u32), Priority::CONTROL, now);
        }
        table.check_invariants().unwrap();

        // Leave rung 1 from the middle, then from the front
        table.remove(&cid(2));
        table.check_invariants().unwrap();
        assert_eq!(table.dir_ready(&cid(1), Hop::Next), Some((peer(2), msg(1))));
        table.check_invariants().unwrap();
        assert_eq!(table.rungs.get(&1).map(Vec::len), Some(2));

        table.route(&cid(3), &peer(1), msg(30), Priority::CONTROL, now);
        table.remove(&cid(4));
        table.check_invariants().unwrap();
        assert!(!table.rungs.contains_key(&1));
        assert_eq!(table.rungs.get(&2), Some(&vec![(cid(3), Hop::Next)]));
        assert_eq!(table.buffered(), 2);
    }

    proptest! {
        #[test]
        fn prop_buffer_bound_and_rungs(
            max_buffers in 1usize..12,
            ops in proptest::collection::vec((0u8..4, any::<bool>(), 0u32..8, any::<bool>()), 0..200),
        ) {
            let now = Instant::now();
            let mut table = table_with_busy_routes(max_buffers, &[0, 1, 2, 3], RungEviction::WholeRung);
            for (i, (route, drain, bits, from_next)) in ops.into_iter().enumerate() {
                let id = cid(route);
                if drain {
                    let hop = if from_next { Hop::Prev } else { Hop::Next };
                    table.dir_ready(&id, hop);
                } else {
                    let from = if from_next { peer(2) } else { peer(1) };
                    table.route(&id, &from, msg(i as u32), Priority::from_bits(bits), now);
                }
                prop_assert!(table.buffered() <= max_buffers);
                prop_assert!(table.check_invariants().is_ok(), "{:?}", table.check_invariants());
            }
        }
    }
}
