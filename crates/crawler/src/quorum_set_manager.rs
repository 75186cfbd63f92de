//! Resolves quorum set hashes to quorum sets.
//!
//! SCP statements only carry the hash of the sender's quorum set. The
//! manager asks connected peers for the contents, one peer at a time:
//!
//! 1. Prefer an open connection to a node that announced the hash and has not
//!    been asked for it yet.
//! 2. Otherwise any open connection not yet asked.
//! 3. Otherwise give up until the hash is seen again.
//!
//! At most one request per hash and one request per peer are in flight. A
//! request ends with a reply, a `DONT_HAVE`, a timeout or the peer
//! disconnecting; all but a reply move on to the next candidate.
//!
//! Replies are cached under the hash of the received quorum set, never
//! under the hash that was asked for, so a peer cannot attach an unrelated
//! quorum set to someone else's hash.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use lookout_common::Hash256;
use stellar_xdr::curr::{NodeId, ScpQuorumSet, StellarMessage, Uint256};
use tokio_util::time::delay_queue;
use tracing::{debug, info, warn};

use crate::crawl_state::{CrawlState, CrawlTimer};
use crate::error::ScpError;
use crate::format::short_node_id;
use crate::quorum::{hash_quorum_set, is_quorum_set_sane};

/// An outstanding request to one peer.
#[derive(Debug, Clone)]
pub struct QuorumSetRequest {
    pub hash: Hash256,
    timer: delay_queue::Key,
}

/// Request bookkeeping, part of the crawl state.
#[derive(Debug, Default)]
pub struct QuorumSetState {
    /// Nodes that announced each hash in a statement. This map and
    /// `quorum_set_requested_to` only grow, bounded by one crawl.
    pub quorum_set_owners: HashMap<Hash256, BTreeSet<NodeId>>,
    /// Nodes already asked for each hash.
    pub quorum_set_requested_to: HashMap<Hash256, HashSet<NodeId>>,
    /// The request in flight to each node.
    pub quorum_set_requests: HashMap<NodeId, QuorumSetRequest>,
    pub quorum_set_hashes_in_progress: HashSet<Hash256>,
}

/// Outcome of a received quorum set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumSetReply {
    /// Cached and applied to its owners.
    Resolved(Hash256),
    /// Already cached.
    Known(Hash256),
    /// Nobody announced or asked for this hash.
    Unsolicited(Hash256),
}

#[derive(Debug, Clone)]
pub struct QuorumSetManager {
    request_timeout: Duration,
}

impl QuorumSetManager {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Record that `public_key` uses the quorum set `hash`, attaching it
    /// directly when cached and requesting it otherwise.
    pub fn process_quorum_set_hash(&self, state: &mut CrawlState, public_key: &NodeId, hash: Hash256) {
        let owners = state
            .quorum_set_state
            .quorum_set_owners
            .entry(hash)
            .or_default();
        if owners.insert(public_key.clone()) {
            debug!(pk = %short_node_id(public_key), hash = %hash.to_base64(), "Detected new quorum set hash");
        }

        let cached = state.quorum_sets.get(&hash).cloned();
        let peer = state.peer_nodes.get_or_add(public_key);
        if peer.quorum_set_hash != Some(hash) {
            peer.quorum_set_hash = Some(hash);
            peer.quorum_set = None;
        }

        match cached {
            Some(quorum_set) => peer.quorum_set = Some(quorum_set),
            None => {
                debug!(pk = %short_node_id(public_key), hash = %hash.to_base64(), "Unknown quorum set");
                self.request_quorum_set(state, hash);
            }
        }
    }

    /// Handle a quorum set received from `sender`.
    ///
    /// # Errors
    ///
    /// [`ScpError::InvalidQuorumSet`] if the quorum set is not sane; the
    /// sender should be disconnected.
    pub fn process_quorum_set(
        &self,
        state: &mut CrawlState,
        sender: &NodeId,
        quorum_set: &ScpQuorumSet,
    ) -> Result<QuorumSetReply, ScpError> {
        let hash = hash_quorum_set(quorum_set)?;
        is_quorum_set_sane(quorum_set).map_err(ScpError::InvalidQuorumSet)?;

        if state.quorum_sets.contains_key(&hash) {
            self.clear_request_if(state, sender, hash);
            return Ok(QuorumSetReply::Known(hash));
        }

        let qs_state = &state.quorum_set_state;
        let has_owners = qs_state
            .quorum_set_owners
            .get(&hash)
            .is_some_and(|owners| !owners.is_empty());
        if !has_owners && !qs_state.quorum_set_hashes_in_progress.contains(&hash) {
            debug!(pk = %short_node_id(sender), hash = %hash.to_base64(), "Ignoring unsolicited quorum set");
            return Ok(QuorumSetReply::Unsolicited(hash));
        }

        info!(pk = %short_node_id(sender), hash = %hash.to_base64(), "Quorum set received");
        state.quorum_sets.insert(hash, quorum_set.clone());

        if let Some(owners) = state.quorum_set_state.quorum_set_owners.get(&hash) {
            for owner in owners {
                if let Some(peer) = state.peer_nodes.get_mut(owner) {
                    if peer.quorum_set_hash == Some(hash) {
                        peer.quorum_set = Some(quorum_set.clone());
                    }
                }
            }
        }

        self.cancel_requests_for(state, hash);
        Ok(QuorumSetReply::Resolved(hash))
    }

    /// `public_key` answered `DONT_HAVE` for `hash`; try someone else.
    pub fn peer_node_does_not_have_quorum_set(
        &self,
        state: &mut CrawlState,
        public_key: &NodeId,
        hash: Hash256,
    ) {
        if self.clear_request_if(state, public_key, hash) {
            self.request_quorum_set(state, hash);
        }
    }

    /// The canonical connection of `public_key` closed; reassign its request.
    pub fn peer_node_disconnected(&self, state: &mut CrawlState, public_key: &NodeId) {
        if let Some(hash) = self.clear_request(state, public_key) {
            debug!(pk = %short_node_id(public_key), hash = %hash.to_base64(), "Reassigning quorum set request");
            self.request_quorum_set(state, hash);
        }
    }

    /// A request timer fired. The timer entry is already gone from the queue.
    pub fn on_request_timeout(&self, state: &mut CrawlState, public_key: &NodeId, hash: Hash256) {
        let qs_state = &mut state.quorum_set_state;
        let matches = qs_state
            .quorum_set_requests
            .get(public_key)
            .is_some_and(|request| request.hash == hash);
        if !matches {
            return;
        }
        qs_state.quorum_set_requests.remove(public_key);
        qs_state.quorum_set_hashes_in_progress.remove(&hash);
        info!(pk = %short_node_id(public_key), hash = %hash.to_base64(), "Quorum set request timeout reached");
        self.request_quorum_set(state, hash);
    }

    /// Ask the next eligible peer for `hash`, unless it is cached or
    /// already in flight.
    pub fn request_quorum_set(&self, state: &mut CrawlState, hash: Hash256) {
        if state.quorum_sets.contains_key(&hash) {
            return;
        }

        let qs_state = &mut state.quorum_set_state;
        if qs_state.quorum_set_hashes_in_progress.contains(&hash) {
            debug!(hash = %hash.to_base64(), "Request already in progress");
            return;
        }

        let requested_to = qs_state.quorum_set_requested_to.get(&hash);
        let busy = &qs_state.quorum_set_requests;
        let eligible = |pk: &NodeId| {
            !requested_to.is_some_and(|asked| asked.contains(pk))
                && !busy.contains_key(pk)
                && state.open_connections.contains_key(pk)
        };

        let owner = qs_state
            .quorum_set_owners
            .get(&hash)
            .and_then(|owners| owners.iter().find(|pk| eligible(pk)).cloned());
        let target = owner.or_else(|| {
            state
                .open_connections
                .keys()
                .find(|pk| eligible(pk))
                .cloned()
        });

        match target {
            Some(public_key) => self.send_request(state, &public_key, hash),
            None => {
                warn!(hash = %hash.to_base64(), "No active connections to request quorum set from");
            }
        }
    }

    fn send_request(&self, state: &mut CrawlState, public_key: &NodeId, hash: Hash256) {
        let Some(connection) = state.open_connections.get(public_key) else {
            return;
        };
        info!(pk = %short_node_id(public_key), hash = %hash.to_base64(), "Requesting quorum set");
        if !connection
            .handle
            .send(StellarMessage::GetScpQuorumset(Uint256::from(hash)))
        {
            debug!(pk = %short_node_id(public_key), "Connection gone before quorum set request");
        }

        let timer = state.timers.insert(
            CrawlTimer::QuorumSetRequest {
                public_key: public_key.clone(),
                hash,
            },
            self.request_timeout,
        );
        let qs_state = &mut state.quorum_set_state;
        qs_state
            .quorum_set_requested_to
            .entry(hash)
            .or_default()
            .insert(public_key.clone());
        qs_state.quorum_set_hashes_in_progress.insert(hash);
        qs_state
            .quorum_set_requests
            .insert(public_key.clone(), QuorumSetRequest { hash, timer });
    }

    /// Drop the request in flight to `public_key`, returning its hash.
    fn clear_request(&self, state: &mut CrawlState, public_key: &NodeId) -> Option<Hash256> {
        let request = state
            .quorum_set_state
            .quorum_set_requests
            .remove(public_key)?;
        state.timers.try_remove(&request.timer);
        state
            .quorum_set_state
            .quorum_set_hashes_in_progress
            .remove(&request.hash);
        Some(request.hash)
    }

    /// Drop the request to `public_key` only if it is for `hash`.
    fn clear_request_if(&self, state: &mut CrawlState, public_key: &NodeId, hash: Hash256) -> bool {
        let matches = state
            .quorum_set_state
            .quorum_set_requests
            .get(public_key)
            .is_some_and(|request| request.hash == hash);
        matches && self.clear_request(state, public_key).is_some()
    }

    /// Drop every request in flight for a hash that just resolved.
    fn cancel_requests_for(&self, state: &mut CrawlState, hash: Hash256) {
        let peers: Vec<NodeId> = state
            .quorum_set_state
            .quorum_set_requests
            .iter()
            .filter(|(_, request)| request.hash == hash)
            .map(|(pk, _)| pk.clone())
            .collect();
        for public_key in peers {
            self.clear_request(state, &public_key);
        }
        state
            .quorum_set_state
            .quorum_set_hashes_in_progress
            .remove(&hash);
    }

    /// The request currently in flight to `public_key`.
    #[cfg(test)]
    pub fn pending_request(&self, state: &CrawlState, public_key: &NodeId) -> Option<Hash256> {
        state
            .quorum_set_state
            .quorum_set_requests
            .get(public_key)
            .map(|request| request.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionCommand, ConnectionHandle, ConnectionId, NodeAddress};
    use crate::crawl_state::{CrawlCheckpoint, OpenConnection};
    use crate::quorum::simple_quorum_set;
    use futures::StreamExt;
    use std::num::NonZeroUsize;
    use stellar_xdr::curr::{PublicKey, Uint256};
    use tokio::sync::mpsc;

    fn make_node_id(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn make_state() -> CrawlState {
        CrawlState::new(
            simple_quorum_set(1, vec![make_node_id(100)]),
            CrawlCheckpoint::default(),
            NonZeroUsize::new(100).unwrap(),
        )
    }

    fn open(state: &mut CrawlState, seed: u8) -> mpsc::UnboundedReceiver<ConnectionCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.open_connections.insert(
            make_node_id(seed),
            OpenConnection {
                id: ConnectionId(seed as u64),
                address: NodeAddress::new(format!("10.0.0.{seed}"), 11625),
                handle: ConnectionHandle::new(tx),
            },
        );
        rx
    }

    fn requested_hash(rx: &mut mpsc::UnboundedReceiver<ConnectionCommand>) -> Option<Hash256> {
        match rx.try_recv() {
            Ok(ConnectionCommand::Send(StellarMessage::GetScpQuorumset(hash))) => Some(hash.into()),
            _ => None,
        }
    }

    fn manager() -> QuorumSetManager {
        QuorumSetManager::new(Duration::from_millis(2000))
    }

    fn sample_quorum_set() -> (ScpQuorumSet, Hash256) {
        let qs = simple_quorum_set(1, vec![make_node_id(1), make_node_id(2)]);
        let hash = hash_quorum_set(&qs).unwrap();
        (qs, hash)
    }

    #[tokio::test]
    async fn test_requests_from_owner_first() {
        let mut state = make_state();
        let mut rx_other = open(&mut state, 1);
        let mut rx_owner = open(&mut state, 2);
        let (_, hash) = sample_quorum_set();

        manager().process_quorum_set_hash(&mut state, &make_node_id(2), hash);

        assert_eq!(requested_hash(&mut rx_owner), Some(hash));
        assert_eq!(requested_hash(&mut rx_other), None);
        assert!(state.quorum_set_state.quorum_set_hashes_in_progress.contains(&hash));
        assert_eq!(manager().pending_request(&state, &make_node_id(2)), Some(hash));
    }

    #[tokio::test]
    async fn test_in_flight_hash_not_requested_twice() {
        let mut state = make_state();
        let mut rx1 = open(&mut state, 1);
        let mut rx2 = open(&mut state, 2);
        let (_, hash) = sample_quorum_set();
        let manager = manager();

        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);
        manager.process_quorum_set_hash(&mut state, &make_node_id(2), hash);
        manager.request_quorum_set(&mut state, hash);

        assert_eq!(requested_hash(&mut rx1), Some(hash));
        assert_eq!(requested_hash(&mut rx2), None);
        assert_eq!(state.timers.len(), 1);
        assert_eq!(state.quorum_set_state.quorum_set_requests.len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_non_owner() {
        let mut state = make_state();
        let mut rx = open(&mut state, 1);
        let (_, hash) = sample_quorum_set();

        // The owner has no open connection.
        manager().process_quorum_set_hash(&mut state, &make_node_id(9), hash);
        assert_eq!(requested_hash(&mut rx), Some(hash));
    }

    #[tokio::test]
    async fn test_gives_up_without_connections() {
        let mut state = make_state();
        let (_, hash) = sample_quorum_set();
        manager().process_quorum_set_hash(&mut state, &make_node_id(9), hash);
        assert!(state.quorum_set_state.quorum_set_hashes_in_progress.is_empty());
        assert!(state.timers.is_empty());
    }

    #[tokio::test]
    async fn test_reply_resolves_owners() {
        let mut state = make_state();
        let _rx = open(&mut state, 1);
        let (qs, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);
        manager.process_quorum_set_hash(&mut state, &make_node_id(5), hash);

        let reply = manager
            .process_quorum_set(&mut state, &make_node_id(1), &qs)
            .unwrap();
        assert_eq!(reply, QuorumSetReply::Resolved(hash));
        assert_eq!(state.quorum_sets.get(&hash), Some(&qs));
        assert_eq!(state.peer_nodes.get(&make_node_id(1)).unwrap().quorum_set, Some(qs.clone()));
        assert_eq!(state.peer_nodes.get(&make_node_id(5)).unwrap().quorum_set, Some(qs));
        assert!(state.quorum_set_state.quorum_set_requests.is_empty());
        assert!(state.quorum_set_state.quorum_set_hashes_in_progress.is_empty());
        assert!(state.timers.is_empty());
    }

    #[tokio::test]
    async fn test_reply_keyed_by_received_content() {
        let mut state = make_state();
        let _rx = open(&mut state, 1);
        let (_, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);

        // Answer with a different quorum set than the one announced.
        let forged = simple_quorum_set(1, vec![make_node_id(66)]);
        let reply = manager
            .process_quorum_set(&mut state, &make_node_id(1), &forged)
            .unwrap();
        assert!(matches!(reply, QuorumSetReply::Unsolicited(h) if h != hash));
        assert!(!state.quorum_sets.contains_key(&hash));
        assert!(state.peer_nodes.get(&make_node_id(1)).unwrap().quorum_set.is_none());
        // The real request is still outstanding.
        assert_eq!(manager.pending_request(&state, &make_node_id(1)), Some(hash));
    }

    #[tokio::test]
    async fn test_insane_reply_is_rejected() {
        let mut state = make_state();
        let insane = simple_quorum_set(5, vec![make_node_id(1)]);
        let result = manager().process_quorum_set(&mut state, &make_node_id(1), &insane);
        assert!(matches!(result, Err(ScpError::InvalidQuorumSet(_))));
    }

    #[tokio::test]
    async fn test_dont_have_moves_to_next_candidate() {
        let mut state = make_state();
        let mut rx1 = open(&mut state, 1);
        let mut rx2 = open(&mut state, 2);
        let (_, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);
        assert_eq!(requested_hash(&mut rx1), Some(hash));

        manager.peer_node_does_not_have_quorum_set(&mut state, &make_node_id(1), hash);
        assert_eq!(requested_hash(&mut rx2), Some(hash));
        assert_eq!(manager.pending_request(&state, &make_node_id(1)), None);
        assert_eq!(manager.pending_request(&state, &make_node_id(2)), Some(hash));
        assert_eq!(state.timers.len(), 1);
    }

    #[tokio::test]
    async fn test_dont_have_for_other_hash_ignored() {
        let mut state = make_state();
        let _rx = open(&mut state, 1);
        let (_, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);
        manager.peer_node_does_not_have_quorum_set(&mut state, &make_node_id(1), Hash256::hash(b"x"));
        assert_eq!(manager.pending_request(&state, &make_node_id(1)), Some(hash));
    }

    #[tokio::test]
    async fn test_disconnect_reassigns() {
        let mut state = make_state();
        let _rx1 = open(&mut state, 1);
        let mut rx2 = open(&mut state, 2);
        let (_, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);

        state.open_connections.remove(&make_node_id(1));
        manager.peer_node_disconnected(&mut state, &make_node_id(1));
        assert_eq!(requested_hash(&mut rx2), Some(hash));
    }

    #[tokio::test]
    async fn test_exhausted_candidates_give_up() {
        let mut state = make_state();
        let _rx = open(&mut state, 1);
        let (_, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);
        manager.peer_node_does_not_have_quorum_set(&mut state, &make_node_id(1), hash);

        assert!(state.quorum_set_state.quorum_set_requests.is_empty());
        assert!(!state.quorum_set_state.quorum_set_hashes_in_progress.contains(&hash));
        assert!(state.timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_next_candidate() {
        let mut state = make_state();
        let _rx1 = open(&mut state, 1);
        let mut rx2 = open(&mut state, 2);
        let (_, hash) = sample_quorum_set();
        let manager = manager();
        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash);

        let expired = state.timers.next().await.unwrap().into_inner();
        let CrawlTimer::QuorumSetRequest { public_key, hash: timed_out } = expired else {
            panic!("unexpected timer {expired:?}");
        };
        assert_eq!(public_key, make_node_id(1));
        manager.on_request_timeout(&mut state, &public_key, timed_out);

        assert_eq!(requested_hash(&mut rx2), Some(hash));
        assert_eq!(manager.pending_request(&state, &make_node_id(2)), Some(hash));
    }

    #[tokio::test]
    async fn test_cached_hash_attached_without_request() {
        let mut state = make_state();
        let mut rx = open(&mut state, 1);
        let (qs, hash) = sample_quorum_set();
        state.quorum_sets.insert(hash, qs.clone());

        manager().process_quorum_set_hash(&mut state, &make_node_id(1), hash);
        assert_eq!(requested_hash(&mut rx), None);
        assert_eq!(state.peer_nodes.get(&make_node_id(1)).unwrap().quorum_set, Some(qs));
    }

    #[tokio::test]
    async fn test_busy_peer_not_asked_twice() {
        let mut state = make_state();
        let mut rx = open(&mut state, 1);
        let manager = manager();
        let (_, hash1) = sample_quorum_set();
        let hash2 = hash_quorum_set(&simple_quorum_set(1, vec![make_node_id(3)])).unwrap();

        manager.process_quorum_set_hash(&mut state, &make_node_id(1), hash1);
        manager.process_quorum_set_hash(&mut state, &make_node_id(7), hash2);
        assert_eq!(requested_hash(&mut rx), Some(hash1));
        assert_eq!(requested_hash(&mut rx), None);
    }
}
