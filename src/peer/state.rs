//! Peer state module
//!
//! Defines peer identity, live session flags, and the per-peer piece
//! bookkeeping built from incoming messages.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// A peer as reported by a tracker or seen on an inbound connection.
///
/// Ordering is by numeric address, then port, then peer id, so
/// `127.0.0.2` sorts before `127.0.0.100`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KnownPeer {
    pub ip: IpAddr,
    pub port: u16,
    pub peer_id: Option<String>,
}

impl KnownPeer {
    /// Create a new known peer
    pub fn new(ip: IpAddr, port: u16, peer_id: Option<String>) -> Self {
        Self { ip, port, peer_id }
    }

    /// Create a known peer from a socket address
    pub fn from_addr(addr: SocketAddr, peer_id: Option<String>) -> Self {
        Self::new(addr.ip(), addr.port(), peer_id)
    }

    /// Socket address to connect to
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for KnownPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Handshake in progress
    Handshaking,
    /// Handshake done, messages flow
    Connected,
    /// Transport failed or closed
    #[default]
    Disconnected,
}

impl PeerState {
    /// Check if the peer is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }
}

/// A known peer plus the live choke/interest flags of its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedPeer {
    pub peer: KnownPeer,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
}

impl ConnectedPeer {
    /// Flags right after a completed handshake
    pub fn new(peer: KnownPeer) -> Self {
        Self {
            peer,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }

    /// Check if we can request pieces from the peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking
    }
}

/// Pieces a peer has announced, one byte per piece
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerBitfield {
    bits: Vec<u8>,
}

impl PeerBitfield {
    /// Empty bitfield
    pub fn new() -> Self {
        Self::default()
    }

    /// Record possession of one piece, growing as needed
    pub fn set(&mut self, index: u32) {
        let index = index as usize;
        if index >= self.bits.len() {
            self.bits.resize(index + 1, 0);
        }
        self.bits[index] = 1;
    }

    /// Merge a `bitfield` payload
    pub fn merge(&mut self, payload: &[u8]) {
        if payload.len() > self.bits.len() {
            self.bits.resize(payload.len(), 0);
        }
        for (slot, &byte) in self.bits.iter_mut().zip(payload) {
            if byte != 0 {
                *slot = 1;
            }
        }
    }

    /// Whether the peer has the piece at `index`
    pub fn has(&self, index: u32) -> bool {
        self.bits.get(index as usize).is_some_and(|&b| b != 0)
    }

    /// Indices of all announced pieces
    pub fn pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b != 0)
            .map(|(i, _)| i as u32)
    }

    /// Number of slots seen so far
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether nothing was announced yet
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

/// Result of queuing an incoming `request`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    Duplicate,
    Full,
}

/// Block requests a peer is waiting on, grouped by piece index
#[derive(Debug, Clone, Default)]
pub struct PeerRequestQueue {
    pending: BTreeMap<u32, VecDeque<(u32, u32)>>,
    len: usize,
}

impl PeerRequestQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `(offset, length)` for `index`; identical requests are coalesced
    /// and the queue holds at most `capacity` entries
    pub fn push(&mut self, index: u32, offset: u32, length: u32, capacity: usize) -> QueueOutcome {
        let entries = self.pending.entry(index).or_default();
        if entries.contains(&(offset, length)) {
            trace!("Coalescing duplicate request {}:{}+{}", index, offset, length);
            return QueueOutcome::Duplicate;
        }
        if self.len >= capacity {
            warn!("Request queue full ({} entries), dropping {}:{}+{}", capacity, index, offset, length);
            if entries.is_empty() {
                self.pending.remove(&index);
            }
            return QueueOutcome::Full;
        }
        entries.push_back((offset, length));
        self.len += 1;
        QueueOutcome::Queued
    }

    /// Drop a request the peer no longer wants
    pub fn cancel(&mut self, index: u32, offset: u32, length: u32) -> bool {
        let Some(entries) = self.pending.get_mut(&index) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|&e| e != (offset, length));
        let removed = before - entries.len();
        if entries.is_empty() {
            self.pending.remove(&index);
        }
        self.len -= removed;
        removed > 0
    }

    /// Pop the oldest request for `index`
    pub fn pop(&mut self, index: u32) -> Option<(u32, u32)> {
        let entries = self.pending.get_mut(&index)?;
        let next = entries.pop_front();
        if entries.is_empty() {
            self.pending.remove(&index);
        }
        if next.is_some() {
            self.len -= 1;
        }
        next
    }

    /// Whether anything is pending for `index`
    pub fn has_pending(&self, index: u32) -> bool {
        self.pending.get(&index).is_some_and(|e| !e.is_empty())
    }

    /// Piece indices with pending requests, ascending
    pub fn pieces(&self) -> Vec<u32> {
        self.pending.keys().copied().collect()
    }

    /// Total pending entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str, port: u16) -> KnownPeer {
        KnownPeer::new(ip.parse().unwrap(), port, None)
    }

    #[test]
    fn test_known_peer_numeric_order() {
        let mut peers = vec![peer("127.0.0.100", 6881), peer("127.0.0.2", 6881)];
        peers.sort();
        assert_eq!(peers[0], peer("127.0.0.2", 6881));
    }

    #[test]
    fn test_known_peer_identity_includes_peer_id() {
        let a = peer("10.0.0.1", 1);
        let b = KnownPeer::new(a.ip, 1, Some("abc".to_string()));
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "10.0.0.1:1");
    }

    #[test]
    fn test_connected_peer_defaults() {
        let session = ConnectedPeer::new(peer("10.0.0.1", 1));
        assert!(session.am_choking);
        assert!(session.peer_choking);
        assert!(!session.am_interested);
        assert!(!session.peer_interested);
        assert!(!session.can_request());
    }

    #[test]
    fn test_bitfield_grows_and_never_shrinks() {
        let mut bitfield = PeerBitfield::new();
        bitfield.set(4);
        assert_eq!(bitfield.len(), 5);
        bitfield.merge(&[1, 0]);
        assert_eq!(bitfield.len(), 5);
        assert!(bitfield.has(0));
        assert!(bitfield.has(4));
        assert!(!bitfield.has(1));
        assert!(!bitfield.has(100));
        assert_eq!(bitfield.pieces().collect::<Vec<_>>(), vec![0, 4]);
    }

    #[test]
    fn test_request_queue_coalesces_and_bounds() {
        let mut queue = PeerRequestQueue::new();
        assert_eq!(queue.push(1, 0, 16384, 2), QueueOutcome::Queued);
        assert_eq!(queue.push(1, 0, 16384, 2), QueueOutcome::Duplicate);
        assert_eq!(queue.push(2, 0, 16384, 2), QueueOutcome::Queued);
        assert_eq!(queue.push(3, 0, 16384, 2), QueueOutcome::Full);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pieces(), vec![1, 2]);
    }

    #[test]
    fn test_request_queue_pop_and_cancel() {
        let mut queue = PeerRequestQueue::new();
        queue.push(1, 0, 10, 8);
        queue.push(1, 10, 10, 8);
        assert!(queue.cancel(1, 0, 10));
        assert!(!queue.cancel(1, 0, 10));
        assert_eq!(queue.pop(1), Some((10, 10)));
        assert_eq!(queue.pop(1), None);
        assert!(!queue.has_pending(1));
        assert!(queue.is_empty());
    }
}
