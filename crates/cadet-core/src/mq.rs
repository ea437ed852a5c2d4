//! Per-neighbor message queue
//!
//! A queue exists for every directly connected peer. The transport accepts
//! one message at a time: the head envelope is handed out, and the next one
//! only after `transmit_done`. Each envelope remembers who queued it so that
//! the completion can be routed back (relay direction readiness or a
//! connection send continuation).

use std::collections::VecDeque;

use bytes::Bytes;

use crate::connection::ConnectionId;
use crate::output::SendHandle;
use crate::router::Hop;

/// Who queued an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Relay traffic for one direction of a route
    Route { cid: ConnectionId, hop: Hop },
    /// Traffic of a local connection endpoint
    Connection { cid: ConnectionId, handle: Option<SendHandle> },
    /// Fire-and-forget control message
    Plain,
}

/// Message waiting for the transport
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: Bytes,
    pub origin: Origin,
}

/// FIFO towards one neighbor
#[derive(Debug, Default)]
pub struct NeighborQueue {
    pending: VecDeque<Envelope>,
    in_flight: Option<Envelope>,
    transmitted: u64,
}

impl NeighborQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope
    pub fn push(&mut self, envelope: Envelope) {
        self.pending.push_back(envelope);
    }

    /// Put an envelope in front of everything still pending
    pub fn push_front(&mut self, envelope: Envelope) {
        self.pending.push_front(envelope);
    }

    /// Whether the transport is busy with an envelope
    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Hand the next envelope to the transport, if it is idle
    pub fn next_to_transmit(&mut self) -> Option<Bytes> {
        if self.in_flight.is_some() {
            return None;
        }
        let envelope = self.pending.pop_front()?;
        let message = envelope.message.clone();
        self.in_flight = Some(envelope);
        Some(message)
    }

    /// The transport finished with the in-flight envelope
    pub fn complete(&mut self) -> Option<Envelope> {
        let envelope = self.in_flight.take()?;
        self.transmitted += 1;
        Some(envelope)
    }

    /// Remove a pending connection send; false if it is in flight or gone
    pub fn cancel(&mut self, handle: SendHandle) -> bool {
        let position = self.pending.iter().position(|e| {
            matches!(e.origin, Origin::Connection { handle: Some(h), .. } if h == handle)
        });
        match position {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop pending envelopes queued by a connection, returning their handles
    pub fn remove_connection(&mut self, cid: &ConnectionId) -> Vec<SendHandle> {
        let mut handles = Vec::new();
        self.pending.retain(|e| match e.origin {
            Origin::Connection { cid: c, handle } if c == *cid => {
                handles.extend(handle);
                false
            }
            _ => true,
        });
        handles
    }

    /// Forget the in-flight marker of a connection send that was cancelled
    pub fn detach_in_flight(&mut self, handle: SendHandle) {
        if let Some(envelope) = self.in_flight.as_mut() {
            if let Origin::Connection { handle: h, .. } = &mut envelope.origin {
                if *h == Some(handle) {
                    *h = None;
                }
            }
        }
    }

    /// Empty the queue (neighbor went away)
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut all: Vec<Envelope> = self.in_flight.take().into_iter().collect();
        all.extend(self.pending.drain(..));
        all
    }

    /// Number of envelopes not yet completed
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Envelopes completed over the lifetime of the queue
    pub fn transmitted(&self) -> u64 {
        self.transmitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(byte: u8, origin: Origin) -> Envelope {
        Envelope {
            message: Bytes::from(vec![byte]),
            origin,
        }
    }

    #[test]
    fn test_one_in_flight() {
        let mut queue = NeighborQueue::new();
        queue.push(envelope(1, Origin::Plain));
        queue.push(envelope(2, Origin::Plain));
        queue.push_front(envelope(0, Origin::Plain));

        assert_eq!(queue.next_to_transmit().unwrap()[0], 0);
        assert!(queue.next_to_transmit().is_none());
        assert!(queue.is_busy());
        assert_eq!(queue.len(), 3);

        queue.complete();
        assert_eq!(queue.next_to_transmit().unwrap()[0], 1);
        queue.complete();
        assert_eq!(queue.next_to_transmit().unwrap()[0], 2);
        queue.complete();
        assert!(queue.is_empty());
        assert_eq!(queue.transmitted(), 3);
    }

    #[test]
    fn test_cancel_pending_only() {
        let cid = ConnectionId::from_bytes([1; 32]);
        let first = SendHandle(1);
        let second = SendHandle(2);
        let mut queue = NeighborQueue::new();
        queue.push(envelope(1, Origin::Connection { cid, handle: Some(first) }));
        queue.push(envelope(2, Origin::Connection { cid, handle: Some(second) }));

        queue.next_to_transmit();
        assert!(!queue.cancel(first));
        assert!(queue.cancel(second));
        assert!(!queue.cancel(second));

        queue.detach_in_flight(first);
        let done = queue.complete().unwrap();
        assert_eq!(done.origin, Origin::Connection { cid, handle: None });
    }

    #[test]
    fn test_remove_connection() {
        let a = ConnectionId::from_bytes([1; 32]);
        let b = ConnectionId::from_bytes([2; 32]);
        let mut queue = NeighborQueue::new();
        queue.push(envelope(1, Origin::Connection { cid: a, handle: Some(SendHandle(1)) }));
        queue.push(envelope(2, Origin::Connection { cid: b, handle: Some(SendHandle(2)) }));
        queue.push(envelope(3, Origin::Connection { cid: a, handle: None }));

        assert_eq!(queue.remove_connection(&a), vec![SendHandle(1)]);
        assert_eq!(queue.len(), 1);
    }
}
