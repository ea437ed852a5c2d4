//! Peer registry and path ownership
//!
//! Peers live in a slot arena addressed by [`PeerIndex`]; paths live in a
//! map addressed by [`PathId`]. A path links an entry into every peer it
//! passes (keyed by offset) and is owned by the peer at its tail, which
//! keeps a bounded collection of its most desirable paths. Paths nobody
//! wants are cut back hop by hop until some peer takes them, or dropped.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use cadet_crypto::PeerIdentity;
use tracing::{debug, info, trace, warn};

use crate::connection::ConnectionId;
use crate::core::Core;
use crate::mq::{NeighborQueue, Origin};
use crate::output::{Output, SendOutcome};
use crate::path::{self, Path, PathId};

/// Paths a peer keeps before it starts dropping the least desirable one
pub const MAX_PATHS_PER_PEER: usize = 6;

/// Slot of a peer in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerIndex(u32);

/// A peer we know something about
#[derive(Debug)]
pub struct Peer {
    pub id: PeerIdentity,
    /// Path entries through this peer, indexed by offset
    entries: Vec<Vec<PathId>>,
    /// Paths ending here
    owned: Vec<PathId>,
    /// Present while the peer is a direct neighbor
    pub(crate) queue: Option<NeighborQueue>,
    /// A DHT lookup for this peer is running
    pub(crate) searching: bool,
    pub(crate) hello: Option<Bytes>,
    pub(crate) last_contact: Instant,
}

impl Peer {
    fn new(id: PeerIdentity, now: Instant) -> Self {
        Self {
            id,
            entries: Vec::new(),
            owned: Vec::new(),
            queue: None,
            searching: false,
            hello: None,
            last_contact: now,
        }
    }

    pub fn is_neighbor(&self) -> bool {
        self.queue.is_some()
    }

    /// Number of path entries through this peer
    pub fn entry_count(&self) -> usize {
        self.entries.iter().map(Vec::len).sum()
    }

    /// Number of paths this peer owns
    #[cfg(test)]
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    fn add_entry(&mut self, off: usize, id: PathId) {
        if self.entries.len() <= off {
            self.entries.resize_with(off + 1, Vec::new);
        }
        self.entries[off].push(id);
    }

    fn remove_entry(&mut self, off: usize, id: PathId) {
        if let Some(at) = self.entries.get_mut(off) {
            at.retain(|p| *p != id);
        }
        while self.entries.last().map_or(false, Vec::is_empty) {
            self.entries.pop();
        }
    }
}

/// Registry of peers and the paths between them
#[derive(Debug)]
pub struct PeerRegistry {
    local: PeerIndex,
    slots: Vec<Option<Peer>>,
    free: Vec<u32>,
    by_id: HashMap<PeerIdentity, PeerIndex>,
    paths: HashMap<PathId, Path>,
    next_path: u64,
    /// Paths attached since the last `take_attachments`
    attached: Vec<PathId>,
}

impl PeerRegistry {
    pub fn new(local: PeerIdentity, now: Instant) -> Self {
        let mut registry = Self {
            local: PeerIndex(0),
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            paths: HashMap::new(),
            next_path: 0,
            attached: Vec::new(),
        };
        registry.local = registry.get_or_create(local, now);
        registry
    }

    /// Number of known peers, the local one included
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn local(&self) -> PeerIndex {
        self.local
    }

    pub fn get_or_create(&mut self, id: PeerIdentity, now: Instant) -> PeerIndex {
        if let Some(index) = self.by_id.get(&id) {
            return *index;
        }
        let peer = Peer::new(id, now);
        let index = match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(peer);
                PeerIndex(slot)
            }
            None => {
                self.slots.push(Some(peer));
                PeerIndex(self.slots.len() as u32 - 1)
            }
        };
        self.by_id.insert(id, index);
        trace!("New peer {:?} at {:?}", id, index);
        index
    }

    pub fn index_of(&self, id: &PeerIdentity) -> Option<PeerIndex> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, index: PeerIndex) -> Option<&Peer> {
        self.slots.get(index.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: PeerIndex) -> Option<&mut Peer> {
        self.slots.get_mut(index.0 as usize).and_then(Option::as_mut)
    }

    pub fn by_id(&self, id: &PeerIdentity) -> Option<&Peer> {
        self.index_of(id).and_then(|index| self.get(index))
    }

    pub fn by_id_mut(&mut self, id: &PeerIdentity) -> Option<&mut Peer> {
        let index = self.index_of(id)?;
        self.get_mut(index)
    }

    pub fn identity(&self, index: PeerIndex) -> Option<PeerIdentity> {
        self.get(index).map(|p| p.id)
    }

    pub fn is_neighbor(&self, id: &PeerIdentity) -> bool {
        self.by_id(id).map_or(false, Peer::is_neighbor)
    }

    pub fn queue_mut(&mut self, id: &PeerIdentity) -> Option<&mut NeighborQueue> {
        self.by_id_mut(id).and_then(|p| p.queue.as_mut())
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.slots.iter().flatten()
    }

    fn remove(&mut self, index: PeerIndex) -> Option<Peer> {
        let peer = self.slots.get_mut(index.0 as usize)?.take()?;
        self.by_id.remove(&peer.id);
        self.free.push(index.0);
        Some(peer)
    }

    pub fn path(&self, id: PathId) -> Option<&Path> {
        self.paths.get(&id)
    }

    pub(crate) fn path_mut(&mut self, id: PathId) -> Option<&mut Path> {
        self.paths.get_mut(&id)
    }

    pub fn path_count(&self) -> usize {
        self.paths.len()
    }

    /// Identity of the peer at `off` on a path
    pub fn hop_identity(&self, path: PathId, off: usize) -> Option<PeerIdentity> {
        let entry = self.paths.get(&path)?.entry(off)?;
        self.identity(entry.peer)
    }

    /// Identities of a path from the local peer up to and including `off`
    pub fn path_identities(&self, path: PathId, off: usize) -> Vec<PeerIdentity> {
        self.paths
            .get(&path)
            .map(|p| {
                p.entries
                    .iter()
                    .take(off + 1)
                    .filter_map(|e| self.identity(e.peer))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Offset of `peer` on a path
    #[cfg(test)]
    pub fn find_peer(&self, path: PathId, peer: &PeerIdentity) -> Option<usize> {
        let index = self.index_of(peer)?;
        self.paths
            .get(&path)?
            .entries
            .iter()
            .position(|e| e.peer == index)
    }

    /// Every path passing `peer`, with the offset at which it does
    pub fn paths_through(&self, peer: &PeerIdentity) -> Vec<(PathId, usize)> {
        let Some(peer) = self.by_id(peer) else {
            return Vec::new();
        };
        let mut found: Vec<_> = peer
            .entries
            .iter()
            .enumerate()
            .flat_map(|(off, ids)| ids.iter().map(move |id| (*id, off)))
            .collect();
        found.sort();
        found
    }

    /// Paths that got an owner since the last call
    pub fn take_attachments(&mut self) -> Vec<PathId> {
        std::mem::take(&mut self.attached)
    }

    /// How much `peer` would like a path on which it sits at `off`
    fn peer_desirability(&self, peer: PeerIndex, off: usize) -> f64 {
        let Some(peer) = self.get(peer) else {
            return 0.0;
        };
        let mut count = 0usize;
        let mut sum = 0usize;
        for (at, ids) in peer.entries.iter().enumerate() {
            count += ids.len();
            sum += at * ids.len();
        }
        let off = off as f64;
        let num_alts = count.max(1) as f64;
        let avg = if count == 0 { off } else { sum as f64 / count as f64 };
        let delta = off - avg;
        let weight = if delta <= -1.0 {
            -num_alts / delta
        } else if delta >= 1.0 {
            num_alts * delta
        } else {
            num_alts
        };
        off / (weight * weight)
    }

    /// Desirability of a path cut after `off`
    fn desirability_to(&self, id: PathId, off: usize) -> f64 {
        let Some(path) = self.paths.get(&id) else {
            return 0.0;
        };
        path.entries
            .iter()
            .enumerate()
            .take(off + 1)
            .skip(1)
            .map(|(at, e)| self.peer_desirability(e.peer, at))
            .sum()
    }

    fn owner_of(&self, id: PathId) -> Option<PeerIndex> {
        let path = self.paths.get(&id)?;
        let tail = path.tail()?;
        self.get(tail)?.owned.contains(&id).then_some(tail)
    }

    /// Store a new path and link it into its peers; not attached yet
    fn create_path(&mut self, identities: &[PeerIdentity], now: Instant) -> PathId {
        let id = PathId::new(self.next_path);
        self.next_path += 1;
        let indices: Vec<PeerIndex> = identities
            .iter()
            .map(|peer| self.get_or_create(*peer, now))
            .collect();
        for (off, index) in indices.iter().enumerate().skip(1) {
            if let Some(peer) = self.get_mut(*index) {
                peer.add_entry(off, id);
            }
        }
        self.paths.insert(id, Path::new(indices));
        id
    }

    /// Unlink and forget a path
    pub(crate) fn destroy_path(&mut self, id: PathId) {
        if let Some(owner) = self.owner_of(id) {
            if let Some(peer) = self.get_mut(owner) {
                peer.owned.retain(|p| *p != id);
            }
        }
        let Some(path) = self.paths.remove(&id) else {
            return;
        };
        debug_assert!(!path.has_connection(), "destroying a path in use");
        for (off, entry) in path.entries.iter().enumerate().skip(1) {
            if let Some(peer) = self.get_mut(entry.peer) {
                peer.remove_entry(off, id);
            }
        }
        trace!("Destroyed path {:?}", id);
    }

    /// Cut a path down to `len` entries
    fn truncate(&mut self, id: PathId, len: usize) {
        let Some(path) = self.paths.get_mut(&id) else {
            return;
        };
        let cut: Vec<(usize, PeerIndex)> = path
            .entries
            .iter()
            .enumerate()
            .skip(len)
            .map(|(off, e)| (off, e.peer))
            .collect();
        path.entries.truncate(len);
        for (off, peer) in cut {
            if let Some(peer) = self.get_mut(peer) {
                peer.remove_entry(off, id);
            }
        }
    }

    /// Offer a path to `peer` at `off`
    fn try_attach(&mut self, peer: PeerIndex, id: PathId, desirability: f64, force: bool) -> bool {
        let Some(owner) = self.get(peer) else {
            return false;
        };
        if owner.owned.len() >= MAX_PATHS_PER_PEER && !force {
            let least = owner
                .owned
                .iter()
                .filter_map(|p| self.paths.get(p))
                .map(Path::desirability)
                .fold(f64::INFINITY, f64::min);
            if desirability <= least {
                return false;
            }
        }
        if let Some(owner) = self.get_mut(peer) {
            owner.owned.push(id);
        }

        // Make room by letting go of the least desirable unused paths
        while self.get(peer).map_or(0, |p| p.owned.len()) > MAX_PATHS_PER_PEER {
            let victim = self.get(peer).and_then(|p| {
                p.owned
                    .iter()
                    .filter(|other| **other != id)
                    .filter_map(|other| self.paths.get(other).map(|path| (*other, path)))
                    .filter(|(_, path)| !path.has_connection())
                    .min_by(|a, b| a.1.desirability().total_cmp(&b.1.desirability()))
                    .map(|(other, _)| other)
            });
            match victim {
                Some(victim) => self.release(victim),
                None => break,
            }
        }
        true
    }

    /// Find an owner for a path, walking back from its tail to `stop_at`
    ///
    /// Rejected tail hops are cut off. An entry carrying a connection
    /// forces the attach; `force` also forces the first candidate.
    fn attach_path(&mut self, id: PathId, stop_at: usize, force: bool) -> bool {
        let stop_at = stop_at.max(1);
        let mut first = true;
        loop {
            let Some(path) = self.paths.get(&id) else {
                return false;
            };
            let len = path.len();
            if len < 2 || len - 1 < stop_at {
                return false;
            }
            let off = len - 1;
            let Some(tail) = path.entry(off) else {
                return false;
            };
            let (peer, has_connection) = (tail.peer, tail.connection.is_some());
            let desirability = self.desirability_to(id, off);
            if let Some(path) = self.paths.get_mut(&id) {
                path.desirability = desirability;
            }
            if self.try_attach(peer, id, desirability, has_connection || (force && first)) {
                trace!("Path {:?} attached at offset {}", id, off);
                self.attached.push(id);
                return true;
            }
            first = false;
            if off <= stop_at {
                return false;
            }
            self.truncate(id, off);
        }
    }

    /// The owner no longer wants a path: cut its tail and offer the rest
    pub(crate) fn release(&mut self, id: PathId) {
        let Some(owner) = self.owner_of(id) else {
            return;
        };
        if let Some(peer) = self.get_mut(owner) {
            peer.owned.retain(|p| *p != id);
        }
        let len = self.paths.get(&id).map_or(0, Path::len);
        if len <= 2 {
            self.destroy_path(id);
            return;
        }
        self.truncate(id, len - 1);
        if !self.attach_path(id, 1, false) {
            self.destroy_path(id);
        }
    }

    /// Append hops to an existing path and move it to its new tail
    fn extend_path(&mut self, id: PathId, extra: &[PeerIdentity], force: bool, now: Instant) {
        let Some(old_len) = self.paths.get(&id).map(Path::len) else {
            return;
        };
        if let Some(owner) = self.owner_of(id) {
            if let Some(peer) = self.get_mut(owner) {
                peer.owned.retain(|p| *p != id);
            }
        }
        for (i, identity) in extra.iter().enumerate() {
            let index = self.get_or_create(*identity, now);
            if let Some(peer) = self.get_mut(index) {
                peer.add_entry(old_len + i, id);
            }
            if let Some(path) = self.paths.get_mut(&id) {
                path.entries.push(crate::path::PathEntry {
                    peer: index,
                    connection: None,
                    score: 0,
                });
            }
        }
        if self.attach_path(id, old_len, force) {
            debug!("Extended path {:?} by {} hops", id, extra.len());
            return;
        }
        // Nobody wants the extension; the old path goes back where it was
        self.truncate(id, old_len);
        let off = old_len - 1;
        let desirability = self.desirability_to(id, off);
        if let Some(tail) = self.paths.get(&id).and_then(|p| p.entry(off)).map(|e| e.peer) {
            self.try_attach(tail, id, desirability, true);
        }
    }

    /// Longest stored path whose first `off + 1` hops equal `sequence`'s
    fn find_prefix_match(&self, sequence: &[PeerIdentity], off: usize) -> Option<PathId> {
        let peer = self.by_id(sequence.get(off)?)?;
        let candidates = peer.entries.get(off)?;
        candidates
            .iter()
            .filter_map(|id| self.paths.get(id).map(|p| (*id, p)))
            .filter(|(_, path)| {
                path.entries
                    .iter()
                    .take(off + 1)
                    .zip(&sequence[..=off])
                    .all(|(e, identity)| self.identity(e.peer).as_ref() == Some(identity))
            })
            .max_by_key(|(id, path)| (path.len(), std::cmp::Reverse(*id)))
            .map(|(id, _)| id)
    }

    /// Learn a path found in the DHT; `sequence` starts at the local peer
    pub fn try_path_from_dht(&mut self, sequence: &[PeerIdentity], now: Instant) {
        if sequence.len() < 2 {
            return;
        }
        let last = sequence.len() - 1;
        for off in (1..=last).rev() {
            let Some(found) = self.find_prefix_match(sequence, off) else {
                continue;
            };
            if off == last {
                trace!("DHT path already known as {:?}", found);
                return;
            }
            if self.paths.get(&found).map(Path::len) == Some(off + 1) {
                self.extend_path(found, &sequence[off + 1..], false, now);
                return;
            }
        }
        let id = self.create_path(sequence, now);
        if !self.attach_path(id, 1, false) {
            trace!("Nobody wants DHT path {:?}", id);
            self.destroy_path(id);
        }
    }

    /// Path for a connection created by someone else
    ///
    /// `sequence` runs from the local peer to the connection's origin.
    /// Returns the stored path and the offset of the origin on it.
    pub fn get_path_from_route(&mut self, sequence: &[PeerIdentity], now: Instant) -> Option<(PathId, usize)> {
        if sequence.len() < 2 {
            return None;
        }
        let last = sequence.len() - 1;
        for off in (1..=last).rev() {
            let Some(found) = self.find_prefix_match(sequence, off) else {
                continue;
            };
            if off == last {
                return Some((found, last));
            }
            if self.paths.get(&found).map(Path::len) == Some(off + 1) {
                self.extend_path(found, &sequence[off + 1..], true, now);
                return Some((found, last));
            }
        }
        let id = self.create_path(sequence, now);
        if !self.attach_path(id, last, true) {
            self.destroy_path(id);
            return None;
        }
        Some((id, last))
    }

    pub fn add_connection(&mut self, path: PathId, off: usize, cid: ConnectionId) {
        if let Some(entry) = self.paths.get_mut(&path).and_then(|p| p.entries.get_mut(off)) {
            debug_assert!(entry.connection.is_none());
            entry.connection = Some(cid);
        }
    }

    pub fn del_connection(&mut self, path: PathId, off: usize, cid: ConnectionId) {
        if let Some(entry) = self.paths.get_mut(&path).and_then(|p| p.entries.get_mut(off)) {
            if entry.connection == Some(cid) {
                entry.connection = None;
            }
        }
    }

    /// Adjust the score of a hop
    pub fn update_score(&mut self, path: PathId, off: usize, delta: i32) {
        if let Some(entry) = self.paths.get_mut(&path).and_then(|p| p.entries.get_mut(off)) {
            entry.score = entry.score.saturating_add(delta);
        }
    }

    /// Whether a peer only appears on paths it owns itself
    fn only_own_entries(&self, index: PeerIndex) -> bool {
        let Some(peer) = self.get(index) else {
            return false;
        };
        peer.entries
            .iter()
            .flatten()
            .all(|id| peer.owned.contains(id))
    }

    /// Release every path a peer owns, then forget the peer
    fn evict(&mut self, index: PeerIndex) -> Option<PeerIdentity> {
        let owned = self.get(index)?.owned.clone();
        for id in owned {
            self.release(id);
        }
        let peer = self.remove(index)?;
        debug_assert_eq!(peer.entry_count(), 0);
        Some(peer.id)
    }
}

impl Core {
    /// A direct transport-level link to `peer` came up
    pub fn peer_connected(&mut self, peer: PeerIdentity) {
        if peer == self.me {
            warn!("Ignoring connect notification for ourselves");
            return;
        }
        let now = self.now;
        let index = self.peers.get_or_create(peer, now);
        let Some(entry) = self.peers.get_mut(index) else {
            return;
        };
        if entry.queue.is_some() {
            debug!("Duplicate connect for {:?}", peer);
            return;
        }
        entry.queue = Some(NeighborQueue::new());
        entry.last_contact = now;
        info!("Peer {:?} connected", peer);
        self.stats.update("# peers connected", 1);

        let me = self.me;
        self.peers.get_path_from_route(&[me, peer], now);
        self.process_path_attachments();
        self.evict_peers_if_needed();
    }

    /// The direct link to `peer` went down
    pub fn peer_disconnected(&mut self, peer: PeerIdentity) {
        let Some(mut queue) = self.peers.by_id_mut(&peer).and_then(|p| p.queue.take()) else {
            debug!("Disconnect for {:?}, which was not connected", peer);
            return;
        };
        info!("Peer {:?} disconnected", peer);
        self.stats.update("# peers connected", -1);

        for envelope in queue.drain() {
            if let Origin::Connection { handle: Some(handle), .. } = envelope.origin {
                self.complete_send(handle, SendOutcome::NotSent);
            }
        }

        for (cid, hop) in self.routes.routes_via(&peer) {
            self.route_dir_unavailable(cid, hop);
        }

        let broken: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.next_hop == peer)
            .map(|c| c.cid)
            .collect();
        for cid in broken {
            self.connection_broken(cid);
        }

        // The direct path goes unless a connection still sits on it
        let direct: Vec<PathId> = self
            .peers
            .paths_through(&peer)
            .into_iter()
            .filter(|(_, off)| *off == 1)
            .map(|(id, _)| id)
            .filter(|id| self.peers.path(*id).map_or(false, |p| p.len() == 2 && !p.has_connection()))
            .collect();
        for id in direct {
            self.peers.release(id);
        }

        let tunnels: Vec<PeerIdentity> = self.tunnels.keys().copied().collect();
        for target in tunnels {
            self.tunnel_maintain_connections(target);
        }
        self.evict_peers_if_needed();
    }

    /// Remember how to reach a peer at transport level
    pub fn set_hello(&mut self, peer: PeerIdentity, hello: Bytes) {
        if peer == self.me {
            return;
        }
        let now = self.now;
        let index = self.peers.get_or_create(peer, now);
        let is_neighbor = match self.peers.get_mut(index) {
            Some(entry) => {
                entry.hello = Some(hello.clone());
                entry.is_neighbor()
            }
            None => return,
        };
        if self.tunnels.contains_key(&peer) && !is_neighbor {
            debug!("Have a tunnel to {:?}, asking transport to connect", peer);
            self.emit(Output::TryConnect { peer, hello });
        }
        self.evict_peers_if_needed();
    }

    /// A DHT lookup produced a path
    ///
    /// Both paths are as recorded by the DHT, with the hops nearest to us
    /// last; neither includes the local peer.
    pub fn handle_dht_result(&mut self, get_path: &[PeerIdentity], put_path: &[PeerIdentity], hello: Option<Bytes>) {
        let me = self.me;
        let mut raw = Vec::with_capacity(1 + get_path.len() + put_path.len());
        raw.push(me);
        raw.extend(get_path.iter().rev());
        raw.extend(put_path.iter().rev());
        let sequence = match path::build_from_identity_sequence(&raw, &me) {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!("Unusable DHT path: {}", e);
                self.stats.bump("# malformed DHT paths");
                return;
            }
        };
        let Some(target) = sequence.last().copied() else {
            return;
        };
        if target == me {
            return;
        }
        debug!("DHT path of length {} to {:?}", sequence.len(), target);
        self.stats.bump("# DHT paths received");
        let now = self.now;
        self.peers.try_path_from_dht(&sequence, now);
        if let Some(hello) = hello {
            self.set_hello(target, hello);
        }
        self.process_path_attachments();
        self.evict_peers_if_needed();
    }

    /// Let tunnels look at newly attached paths
    pub(crate) fn process_path_attachments(&mut self) {
        let attached = self.peers.take_attachments();
        if attached.is_empty() {
            return;
        }
        let mut targets: Vec<PeerIdentity> = attached
            .into_iter()
            .flat_map(|id| {
                let len = self.peers.path(id).map_or(0, Path::len);
                (1..len)
                    .filter_map(|off| self.peers.hop_identity(id, off))
                    .collect::<Vec<_>>()
            })
            .filter(|peer| self.tunnels.contains_key(peer))
            .collect();
        targets.sort();
        targets.dedup();
        for target in targets {
            self.tunnel_maintain_connections(target);
        }
    }

    pub(crate) fn touch_peer(&mut self, peer: &PeerIdentity) {
        let now = self.now;
        if let Some(entry) = self.peers.by_id_mut(peer) {
            entry.last_contact = now;
        }
    }

    /// Forget idle peers while the registry is over its limit
    pub(crate) fn evict_peers_if_needed(&mut self) {
        while self.peers.len() > self.config.max_peers {
            let local = self.peers.local();
            let victim = self
                .peers
                .peers()
                .filter(|p| p.queue.is_none() && !self.tunnels.contains_key(&p.id))
                .filter_map(|p| self.peers.index_of(&p.id).map(|index| (index, p.last_contact)))
                .filter(|(index, _)| *index != local && self.peers.only_own_entries(*index))
                .min_by_key(|(_, last_contact)| *last_contact)
                .map(|(index, _)| index);
            let Some(victim) = victim else {
                break;
            };
            if let Some(id) = self.peers.evict(victim) {
                debug!("Evicted idle peer {:?}", id);
                self.stats.bump("# peers evicted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> PeerIdentity {
        PeerIdentity::from_bytes([byte; 32])
    }

    fn ids(bytes: &[u8]) -> Vec<PeerIdentity> {
        bytes.iter().map(|b| id(*b)).collect()
    }

    fn registry() -> (PeerRegistry, Instant) {
        let now = Instant::now();
        (PeerRegistry::new(id(0), now), now)
    }

    fn owner_identity(registry: &PeerRegistry, path: PathId) -> Option<PeerIdentity> {
        registry.owner_of(path).and_then(|index| registry.identity(index))
    }

    #[test]
    fn test_neighbor_path_attaches_to_neighbor() {
        let (mut registry, now) = registry();
        let (path, off) = registry.get_path_from_route(&ids(&[0, 1]), now).unwrap();
        assert_eq!(off, 1);
        assert_eq!(owner_identity(&registry, path), Some(id(1)));
        assert_eq!(registry.paths_through(&id(1)), vec![(path, 1)]);
        assert_eq!(registry.take_attachments(), vec![path]);
    }

    #[test]
    fn test_route_path_reuses_prefix() {
        let (mut registry, now) = registry();
        let (short, _) = registry.get_path_from_route(&ids(&[0, 1]), now).unwrap();
        let (long, off) = registry.get_path_from_route(&ids(&[0, 1, 2]), now).unwrap();

        // The direct path was extended to reach 2
        assert_eq!(short, long);
        assert_eq!(off, 2);
        assert_eq!(owner_identity(&registry, long), Some(id(2)));
        assert_eq!(registry.path_identities(long, 2), ids(&[0, 1, 2]));

        // A prefix of a known path resolves to it
        let (again, off) = registry.get_path_from_route(&ids(&[0, 1]), now).unwrap();
        assert_eq!(again, long);
        assert_eq!(off, 1);
    }

    #[test]
    fn test_dht_path_known_and_new() {
        let (mut registry, now) = registry();
        registry.try_path_from_dht(&ids(&[0, 1, 2, 3]), now);
        assert_eq!(registry.path_count(), 1);

        registry.try_path_from_dht(&ids(&[0, 1, 2]), now);
        assert_eq!(registry.path_count(), 1);

        registry.try_path_from_dht(&ids(&[0, 4, 3]), now);
        assert_eq!(registry.path_count(), 2);
        assert_eq!(registry.paths_through(&id(3)).len(), 2);
    }

    #[test]
    fn test_release_cuts_tail() {
        let (mut registry, now) = registry();
        let (path, _) = registry.get_path_from_route(&ids(&[0, 1, 2]), now).unwrap();
        registry.release(path);

        // Peer 1 takes the shortened path
        assert_eq!(registry.path(path).map(Path::len), Some(2));
        assert_eq!(owner_identity(&registry, path), Some(id(1)));
        assert!(registry.paths_through(&id(2)).is_empty());

        registry.release(path);
        assert!(registry.path(path).is_none());
        assert!(registry.paths_through(&id(1)).is_empty());
    }

    #[test]
    fn test_owner_keeps_bounded_collection() {
        let (mut registry, now) = registry();
        // Many distinct two-relay paths to peer 99
        for relay in 1..=(MAX_PATHS_PER_PEER as u8 + 4) {
            registry.try_path_from_dht(&ids(&[0, relay, 99]), now);
        }
        let owner = registry.index_of(&id(99)).unwrap();
        assert!(registry.get(owner).unwrap().owned_count() <= MAX_PATHS_PER_PEER);
    }

    #[test]
    fn test_connection_forces_attach() {
        let (mut registry, now) = registry();
        let (path, off) = registry.get_path_from_route(&ids(&[0, 1, 2]), now).unwrap();
        let cid = ConnectionId::from_bytes([7; 32]);
        registry.add_connection(path, off, cid);
        assert!(registry.path(path).unwrap().has_connection());

        registry.update_score(path, off, i32::MAX);
        registry.update_score(path, off, 5);
        assert_eq!(registry.path(path).unwrap().entry(off).unwrap().score, i32::MAX);

        registry.del_connection(path, off, cid);
        assert!(!registry.path(path).unwrap().has_connection());
    }

    #[test]
    fn test_find_peer() {
        let (mut registry, now) = registry();
        let (path, _) = registry.get_path_from_route(&ids(&[0, 1, 2]), now).unwrap();
        assert_eq!(registry.find_peer(path, &id(2)), Some(2));
        assert_eq!(registry.find_peer(path, &id(0)), Some(0));
        assert_eq!(registry.find_peer(path, &id(5)), None);
        assert_eq!(registry.hop_identity(path, 1), Some(id(1)));
    }

    #[test]
    fn test_eviction_releases_owned_paths() {
        let (mut registry, now) = registry();
        let (path, _) = registry.get_path_from_route(&ids(&[0, 1]), now).unwrap();
        let index = registry.index_of(&id(1)).unwrap();
        assert!(registry.only_own_entries(index));
        assert_eq!(registry.evict(index), Some(id(1)));
        assert!(registry.path(path).is_none());
        assert!(registry.index_of(&id(1)).is_none());

        // Slot is reused
        let again = registry.get_or_create(id(5), now);
        assert_eq!(again, index);
    }
}
