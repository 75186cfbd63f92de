//! Mutable state of one crawl run.
//!
//! A fresh [`CrawlState`] is built for every call to
//! [`Crawler::crawl`](crate::Crawler::crawl) and only the crawl's event loop
//! touches it, so none of it is shared between runs or guarded by locks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;

use lookout_common::Hash256;
use lru::LruCache;
use stellar_xdr::curr::{NodeId, ScpQuorumSet};
use tokio_util::time::{delay_queue, DelayQueue};

use crate::connection::{ConnectionHandle, ConnectionId, NodeAddress};
use crate::peer_node::PeerNodeCollection;
use crate::quorum::get_all_nodes;
use crate::quorum_set_manager::QuorumSetState;
use crate::slots::Slots;

/// A closed ledger checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ledger {
    pub sequence: u64,
    /// Close time in seconds since the Unix epoch, 0 when unknown.
    pub close_time: u64,
}

/// What a previous crawl hands to the next one.
#[derive(Debug, Clone, Default)]
pub struct CrawlCheckpoint {
    /// Statements for slots older than this are ignored.
    pub latest_closed_ledger: Ledger,
    /// Quorum sets that need not be fetched again.
    pub quorum_sets: HashMap<Hash256, ScpQuorumSet>,
}

/// Timers owned by the crawl state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTimer {
    /// Listen period `cycle` of a connection has elapsed.
    Listen {
        public_key: NodeId,
        connection: ConnectionId,
        cycle: u32,
    },
    /// A quorum set request went unanswered.
    QuorumSetRequest { public_key: NodeId, hash: Hash256 },
}

/// The connection currently bound to an identity.
#[derive(Debug, Clone)]
pub struct OpenConnection {
    pub id: ConnectionId,
    pub address: NodeAddress,
    pub handle: ConnectionHandle,
}

pub struct CrawlState {
    /// Canonical connection per identity; at most one.
    pub open_connections: BTreeMap<NodeId, OpenConnection>,
    pub peer_nodes: PeerNodeCollection,
    /// Quorum set cache keyed by content hash. Only grows.
    pub quorum_sets: HashMap<Hash256, ScpQuorumSet>,
    /// `ip:port` keys already scheduled. Only grows.
    pub crawled_node_addresses: HashSet<String>,
    /// Digests of recently seen envelope signatures.
    pub envelope_cache: LruCache<Hash256, ()>,
    pub slots: Slots,
    pub listen_timeouts: HashMap<NodeId, delay_queue::Key>,
    /// `ip:port` keys of connections that never completed a handshake.
    pub failed_connections: Vec<String>,
    pub top_tier_nodes: HashSet<NodeId>,
    /// `ip:port` keys that completed a handshake as a top tier node.
    pub top_tier_addresses: HashSet<String>,
    pub max_crawl_time_hit: bool,
    pub latest_closed_ledger: Ledger,
    pub quorum_set_state: QuorumSetState,
    pub timers: DelayQueue<CrawlTimer>,
}

impl CrawlState {
    pub fn new(
        top_tier_quorum_set: ScpQuorumSet,
        checkpoint: CrawlCheckpoint,
        envelope_cache_size: NonZeroUsize,
    ) -> Self {
        Self {
            open_connections: BTreeMap::new(),
            peer_nodes: PeerNodeCollection::new(),
            quorum_sets: checkpoint.quorum_sets,
            crawled_node_addresses: HashSet::new(),
            envelope_cache: LruCache::new(envelope_cache_size),
            top_tier_nodes: get_all_nodes(&top_tier_quorum_set),
            slots: Slots::new(top_tier_quorum_set),
            listen_timeouts: HashMap::new(),
            failed_connections: Vec::new(),
            top_tier_addresses: HashSet::new(),
            max_crawl_time_hit: false,
            latest_closed_ledger: checkpoint.latest_closed_ledger,
            quorum_set_state: QuorumSetState::default(),
            timers: DelayQueue::new(),
        }
    }

    /// Whether `connection` is the one currently bound to `public_key`.
    pub fn is_canonical(&self, public_key: &NodeId, connection: ConnectionId) -> bool {
        self.open_connections
            .get(public_key)
            .is_some_and(|open| open.id == connection)
    }

    /// Cancel the pending listen timer for `public_key`, if any.
    pub fn clear_listen_timeout(&mut self, public_key: &NodeId) {
        if let Some(key) = self.listen_timeouts.remove(public_key) {
            self.timers.try_remove(&key);
        }
    }

    /// Mark an envelope signature digest as seen. Returns `false` if it
    /// already was.
    pub fn remember_envelope(&mut self, digest: Hash256) -> bool {
        if self.envelope_cache.contains(&digest) {
            return false;
        }
        self.envelope_cache.put(digest, ());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::simple_quorum_set;
    use std::time::Duration;
    use stellar_xdr::curr::{PublicKey, Uint256};
    use tokio::sync::mpsc;

    fn make_node_id(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn make_state(cache: usize) -> CrawlState {
        CrawlState::new(
            simple_quorum_set(1, vec![make_node_id(1), make_node_id(2)]),
            CrawlCheckpoint::default(),
            NonZeroUsize::new(cache).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_new_state_derives_top_tier() {
        let state = make_state(10);
        assert_eq!(state.top_tier_nodes.len(), 2);
        assert!(state.top_tier_nodes.contains(&make_node_id(2)));
        assert_eq!(state.latest_closed_ledger, Ledger::default());
        assert!(state.timers.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_seeds_state() {
        let qs = simple_quorum_set(1, vec![make_node_id(5)]);
        let hash = Hash256::hash_xdr(&qs).unwrap();
        let checkpoint = CrawlCheckpoint {
            latest_closed_ledger: Ledger {
                sequence: 42,
                close_time: 1000,
            },
            quorum_sets: HashMap::from([(hash, qs)]),
        };
        let state = CrawlState::new(
            simple_quorum_set(1, vec![make_node_id(1)]),
            checkpoint,
            NonZeroUsize::new(10).unwrap(),
        );
        assert_eq!(state.latest_closed_ledger.sequence, 42);
        assert!(state.quorum_sets.contains_key(&hash));
    }

    #[tokio::test]
    async fn test_envelope_cache_is_bounded() {
        let mut state = make_state(2);
        let (a, b, c) = (Hash256::hash(b"a"), Hash256::hash(b"b"), Hash256::hash(b"c"));
        assert!(state.remember_envelope(a));
        assert!(!state.remember_envelope(a));
        assert!(state.remember_envelope(b));
        assert!(state.remember_envelope(c));
        // `a` was evicted as least recently used.
        assert!(state.remember_envelope(a));
        assert_eq!(state.envelope_cache.len(), 2);
    }

    #[tokio::test]
    async fn test_canonical_connection() {
        let mut state = make_state(10);
        let (tx, _rx) = mpsc::unbounded_channel();
        state.open_connections.insert(
            make_node_id(1),
            OpenConnection {
                id: ConnectionId(7),
                address: NodeAddress::new("1.1.1.1", 1),
                handle: ConnectionHandle::new(tx),
            },
        );
        assert!(state.is_canonical(&make_node_id(1), ConnectionId(7)));
        assert!(!state.is_canonical(&make_node_id(1), ConnectionId(8)));
        assert!(!state.is_canonical(&make_node_id(2), ConnectionId(7)));
    }

    #[tokio::test]
    async fn test_clear_listen_timeout() {
        let mut state = make_state(10);
        let key = state.timers.insert(
            CrawlTimer::Listen {
                public_key: make_node_id(1),
                connection: ConnectionId(1),
                cycle: 1,
            },
            Duration::from_secs(60),
        );
        state.listen_timeouts.insert(make_node_id(1), key);
        state.clear_listen_timeout(&make_node_id(1));
        assert!(state.timers.is_empty());
        assert!(state.listen_timeouts.is_empty());
        // Clearing twice is harmless.
        state.clear_listen_timeout(&make_node_id(1));
    }
}
