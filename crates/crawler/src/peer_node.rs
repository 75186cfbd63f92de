//! What the crawl learns about each network participant.

use std::collections::HashMap;

use lookout_common::Hash256;
use stellar_xdr::curr::{NodeId, ScpQuorumSet};

use crate::connection::{NodeAddress, NodeInfo};
use crate::error::PeerNodeError;
use crate::format::node_id_to_strkey;

/// A network participant, keyed by its public key.
///
/// Created on the first successful handshake or the first statement signed
/// by the key, whichever comes first, and kept for the rest of the crawl.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerNode {
    pub public_key: NodeId,
    /// Set on a successful handshake.
    pub address: Option<NodeAddress>,
    pub node_info: Option<NodeInfo>,
    pub successfully_connected: bool,
    /// Sent at least one validly signed SCP statement.
    pub participating_in_scp: bool,
    /// Externalized the value a slot closed with.
    pub is_validating: bool,
    /// Externalized a value other than the one a slot closed with.
    pub is_validating_incorrect_values: bool,
    /// Answered with an `ERR_LOAD` error.
    pub over_loaded: bool,
    pub quorum_set_hash: Option<Hash256>,
    pub quorum_set: Option<ScpQuorumSet>,
    pub supplied_peer_list: bool,
    pub latest_active_slot_index: Option<u64>,
}

impl PeerNode {
    pub fn new(public_key: NodeId) -> Self {
        Self {
            public_key,
            address: None,
            node_info: None,
            successfully_connected: false,
            participating_in_scp: false,
            is_validating: false,
            is_validating_incorrect_values: false,
            over_loaded: false,
            quorum_set_hash: None,
            quorum_set: None,
            supplied_peer_list: false,
            latest_active_slot_index: None,
        }
    }

    /// `ip:port` of the connection that introduced this node, if any.
    pub fn key(&self) -> Option<String> {
        self.address.as_ref().map(NodeAddress::key)
    }

    pub fn strkey(&self) -> String {
        node_id_to_strkey(&self.public_key)
    }
}

/// Peer records indexed by public key.
#[derive(Debug, Clone, Default)]
pub struct PeerNodeCollection {
    nodes: HashMap<NodeId, PeerNode>,
}

impl PeerNodeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, public_key: &NodeId) -> Option<&PeerNode> {
        self.nodes.get(public_key)
    }

    pub fn get_mut(&mut self, public_key: &NodeId) -> Option<&mut PeerNode> {
        self.nodes.get_mut(public_key)
    }

    /// Fetch the record for `public_key`, creating an empty one if needed.
    pub fn get_or_add(&mut self, public_key: &NodeId) -> &mut PeerNode {
        self.nodes
            .entry(public_key.clone())
            .or_insert_with(|| PeerNode::new(public_key.clone()))
    }

    /// Record a completed handshake.
    ///
    /// Fails without touching anything if the key already completed a
    /// handshake from a different address; the first address wins.
    pub fn add_successfully_connected(
        &mut self,
        public_key: &NodeId,
        address: &NodeAddress,
        node_info: NodeInfo,
    ) -> Result<&mut PeerNode, PeerNodeError> {
        if let Some(existing) = self.nodes.get(public_key) {
            if existing.successfully_connected {
                if let Some(existing_address) = &existing.address {
                    if existing_address != address {
                        return Err(PeerNodeError::PublicKeyReuse {
                            public_key: existing.strkey(),
                            existing: existing_address.clone(),
                        });
                    }
                }
            }
        }

        let node = self.get_or_add(public_key);
        node.address = Some(address.clone());
        node.node_info = Some(node_info);
        node.successfully_connected = true;
        Ok(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &PeerNode> {
        self.nodes.values()
    }

    pub fn into_map(self) -> HashMap<NodeId, PeerNode> {
        self.nodes
    }
}
