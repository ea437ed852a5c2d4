//! Paths
//!
//! A path is a loop-free sequence of peers starting at the local peer. The
//! sequence functions here work on plain identity slices; the registry
//! stores built paths as [`Path`] objects whose entries are linked into the
//! peers along them.
//!
//! Offsets count from the local peer: offset 0 is us, offset 1 the first
//! hop. A path of length 2 therefore leads to a direct neighbor.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;

use cadet_crypto::PeerIdentity;
use tracing::debug;

use crate::connection::ConnectionId;
use crate::core::{Core, TimerEvent};
use crate::error::PathBuildError;
use crate::peer::PeerIndex;
use crate::timer::TimerId;

/// How long an invalidated path stays excluded from selection
pub const PATH_INVALIDATION_TIME: Duration = Duration::from_secs(60);

/// Build a loop-free path from a raw identity sequence
///
/// The result starts at the first occurrence of `local`. When a peer shows
/// up again, the cycle since its earlier occurrence is cut out.
pub fn build_from_identity_sequence(
    peers: &[PeerIdentity],
    local: &PeerIdentity,
) -> Result<Vec<PeerIdentity>, PathBuildError> {
    if peers.is_empty() {
        return Err(PathBuildError::Empty);
    }
    let start = peers
        .iter()
        .position(|p| p == local)
        .ok_or(PathBuildError::LocalPeerAbsent)?;

    let mut path: Vec<PeerIdentity> = Vec::with_capacity(peers.len() - start);
    for peer in &peers[start..] {
        match path.iter().position(|p| p == peer) {
            Some(earlier) => path.truncate(earlier + 1),
            None => path.push(*peer),
        }
    }
    Ok(path)
}

/// Reverse the hop order
pub fn invert(path: &[PeerIdentity]) -> Vec<PeerIdentity> {
    path.iter().rev().copied().collect()
}

/// Same hops, in the same or in reverse order
pub fn equivalent(a: &[PeerIdentity], b: &[PeerIdentity]) -> bool {
    a.len() == b.len() && (a == b || a.iter().eq(b.iter().rev()))
}

/// Shorter paths first, then by identities along the path
pub fn path_cmp(a: &[PeerIdentity], b: &[PeerIdentity]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// No peer appears twice
pub fn is_loop_free(path: &[PeerIdentity]) -> bool {
    let mut seen = HashSet::with_capacity(path.len());
    path.iter().all(|p| seen.insert(*p))
}

/// Handle of a stored path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(u64);

impl PathId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(value: u64) -> Self {
        Self(value)
    }
}

/// One hop of a stored path
#[derive(Debug, Clone)]
pub struct PathEntry {
    pub peer: PeerIndex,
    /// Local connection ending at this hop, if any
    pub connection: Option<ConnectionId>,
    /// Accumulated reliability score of the hop
    ///
    /// Recorded only; path desirability does not weight it.
    pub score: i32,
}

/// Stored path, owned by the peer at its tail
#[derive(Debug, Clone)]
pub struct Path {
    pub(crate) entries: Vec<PathEntry>,
    pub(crate) desirability: f64,
    pub(crate) invalid_timer: Option<TimerId>,
}

impl Path {
    pub(crate) fn new(peers: Vec<PeerIndex>) -> Self {
        Self {
            entries: peers
                .into_iter()
                .map(|peer| PathEntry {
                    peer,
                    connection: None,
                    score: 0,
                })
                .collect(),
            desirability: 0.0,
            invalid_timer: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, off: usize) -> Option<&PathEntry> {
        self.entries.get(off)
    }

    /// Peer at the tail (the owner)
    pub fn tail(&self) -> Option<PeerIndex> {
        self.entries.last().map(|e| e.peer)
    }

    pub fn desirability(&self) -> f64 {
        self.desirability
    }

    /// Excluded from selection until the invalidation expires
    pub fn is_invalid(&self) -> bool {
        self.invalid_timer.is_some()
    }

    /// Whether any hop carries a local connection
    pub fn has_connection(&self) -> bool {
        self.entries.iter().any(|e| e.connection.is_some())
    }
}

impl Core {
    /// Exclude a path from selection for a while
    ///
    /// Direct paths are never invalidated.
    pub(crate) fn invalidate_path(&mut self, id: PathId) {
        let now = self.now;
        let Some(path) = self.peers.path_mut(id) else {
            return;
        };
        if path.len() <= 2 {
            return;
        }
        if let Some(timer) = path.invalid_timer.take() {
            self.timers.cancel(timer);
        }
        debug!("Invalidating path {:?} for {:?}", id, PATH_INVALIDATION_TIME);
        path.invalid_timer = Some(self.timers.schedule(
            now,
            PATH_INVALIDATION_TIME,
            TimerEvent::PathInvalidated(id),
        ));
        self.stats.bump("# paths invalidated");
    }

    /// Invalidation cool-down over: keep the path if a connection still
    /// uses it, otherwise drop it
    pub(crate) fn path_invalidation_expired(&mut self, id: PathId) {
        let Some(path) = self.peers.path_mut(id) else {
            return;
        };
        path.invalid_timer = None;
        if path.has_connection() {
            return;
        }
        debug!("Dropping invalidated path {:?}", id);
        self.peers.destroy_path(id);
    }
}
