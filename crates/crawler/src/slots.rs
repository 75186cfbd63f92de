//! Federated voting tally over externalize statements.
//!
//! Each [`Slot`] records, per candidate value, the set of nodes that
//! externalized it. A slot closes the first time the voters of one value
//! contain a slice of the trusted quorum set; the closing value is final and
//! later votes are only recorded.
//!
//! Closure decides what "ledger closed" means for the crawl, and the
//! agreeing/disagreeing split decides which nodes validate correctly.

use std::collections::{BTreeMap, HashMap, HashSet};

use stellar_xdr::curr::{NodeId, ScpQuorumSet, Value};
use tracing::debug;

use crate::format::{short_node_id, value_to_str};
use crate::quorum::{get_all_nodes, is_quorum_slice};

/// What a vote did to its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// This voter already recorded this value for this slot.
    Duplicate,
    /// Recorded; the slot is still open.
    Recorded,
    /// Recorded, and the slot closed with this vote.
    Closed,
    /// Recorded on a slot that was already closed.
    RecordedAfterClose,
}

/// Votes for one ledger index.
#[derive(Debug, Clone)]
pub struct Slot {
    pub index: u64,
    values: HashMap<Value, HashSet<NodeId>>,
    externalized_value: Option<Value>,
}

impl Slot {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            values: HashMap::new(),
            externalized_value: None,
        }
    }

    /// Record `voter` externalizing `value`.
    ///
    /// A close is only attempted when the voter is one of
    /// `trusted_validators`: no other vote can change whether the voters of
    /// a value contain a trusted slice.
    pub fn add_externalize_value(
        &mut self,
        voter: &NodeId,
        value: &Value,
        trusted_quorum_set: &ScpQuorumSet,
        trusted_validators: &HashSet<NodeId>,
    ) -> VoteOutcome {
        let voters = self.values.entry(value.clone()).or_default();
        if !voters.insert(voter.clone()) {
            return VoteOutcome::Duplicate;
        }

        if self.externalized_value.is_some() {
            return VoteOutcome::RecordedAfterClose;
        }

        if !trusted_validators.contains(voter) {
            return VoteOutcome::Recorded;
        }

        debug!(
            slot = self.index,
            pk = %short_node_id(voter),
            "Node part of trusted quorum set, attempting slot close"
        );
        if is_quorum_slice(trusted_quorum_set, voters) {
            self.externalized_value = Some(value.clone());
            return VoteOutcome::Closed;
        }
        VoteOutcome::Recorded
    }

    pub fn closed(&self) -> bool {
        self.externalized_value.is_some()
    }

    pub fn externalized_value(&self) -> Option<&Value> {
        self.externalized_value.as_ref()
    }

    /// Voters of the closing value. Empty while open.
    pub fn nodes_agreeing_on_externalized_value(&self) -> HashSet<NodeId> {
        self.externalized_value
            .as_ref()
            .and_then(|value| self.values.get(value))
            .cloned()
            .unwrap_or_default()
    }

    /// Voters of any other value. Empty while open.
    pub fn nodes_disagreeing_on_externalized_value(&self) -> HashSet<NodeId> {
        let Some(externalized) = &self.externalized_value else {
            return HashSet::new();
        };
        self.values
            .iter()
            .filter(|(value, _)| *value != externalized)
            .flat_map(|(_, voters)| voters.iter().cloned())
            .collect()
    }

    #[cfg(test)]
    pub fn voters(&self, value: &Value) -> Option<&HashSet<NodeId>> {
        self.values.get(value)
    }
}

/// All slots seen during one crawl, judged against one trusted quorum set.
#[derive(Debug, Clone)]
pub struct Slots {
    slots: BTreeMap<u64, Slot>,
    trusted_quorum_set: ScpQuorumSet,
    trusted_validators: HashSet<NodeId>,
}

impl Slots {
    pub fn new(trusted_quorum_set: ScpQuorumSet) -> Self {
        let trusted_validators = get_all_nodes(&trusted_quorum_set);
        Self {
            slots: BTreeMap::new(),
            trusted_quorum_set,
            trusted_validators,
        }
    }

    pub fn get(&self, index: u64) -> Option<&Slot> {
        self.slots.get(&index)
    }

    /// Record a vote in the slot at `index`, creating it if needed.
    pub fn add_externalize_value(&mut self, index: u64, voter: &NodeId, value: &Value) -> VoteOutcome {
        let slot = self.slots.entry(index).or_insert_with(|| Slot::new(index));
        let outcome = slot.add_externalize_value(
            voter,
            value,
            &self.trusted_quorum_set,
            &self.trusted_validators,
        );
        if outcome == VoteOutcome::Closed {
            debug!(slot = index, value = %value_to_str(value), "Slot closed");
        }
        outcome
    }

    /// Indexes of closed slots, ascending.
    pub fn closed_slot_indexes(&self) -> Vec<u64> {
        self.slots
            .values()
            .filter(|slot| slot.closed())
            .map(|slot| slot.index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[cfg(test)]
    pub fn has_closed_slot(&self) -> bool {
        !self.closed_slot_indexes().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quorum::simple_quorum_set;
    use stellar_xdr::curr::{PublicKey, Uint256};

    fn make_node_id(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn make_value(byte: u8) -> Value {
        Value(vec![byte; 4].try_into().unwrap())
    }

    fn two_of_three() -> (Slots, NodeId, NodeId, NodeId) {
        let (a, b, c) = (make_node_id(1), make_node_id(2), make_node_id(3));
        let slots = Slots::new(simple_quorum_set(2, vec![a.clone(), b.clone(), c.clone()]));
        (slots, a, b, c)
    }

    #[test]
    fn test_closes_only_after_threshold() {
        let (mut slots, a, b, _) = two_of_three();
        let v1 = make_value(1);

        assert_eq!(slots.add_externalize_value(1, &a, &v1), VoteOutcome::Recorded);
        assert!(!slots.get(1).unwrap().closed());
        assert!(slots.closed_slot_indexes().is_empty());

        assert_eq!(slots.add_externalize_value(1, &b, &v1), VoteOutcome::Closed);
        assert_eq!(slots.get(1).unwrap().externalized_value(), Some(&v1));
        assert_eq!(slots.closed_slot_indexes(), vec![1]);
    }

    #[test]
    fn test_duplicate_vote_is_noop() {
        let (mut slots, a, _, _) = two_of_three();
        let v1 = make_value(1);
        slots.add_externalize_value(7, &a, &v1);
        assert_eq!(slots.add_externalize_value(7, &a, &v1), VoteOutcome::Duplicate);
        assert_eq!(slots.get(7).unwrap().voters(&v1).unwrap().len(), 1);
        assert!(!slots.get(7).unwrap().closed());
    }

    #[test]
    fn test_closure_is_monotonic() {
        let (mut slots, a, b, c) = two_of_three();
        let (v1, v2) = (make_value(1), make_value(2));
        slots.add_externalize_value(1, &a, &v1);
        slots.add_externalize_value(1, &b, &v1);

        assert_eq!(
            slots.add_externalize_value(1, &c, &v2),
            VoteOutcome::RecordedAfterClose
        );
        let d = make_node_id(4);
        slots.add_externalize_value(1, &d, &v2);
        assert_eq!(slots.get(1).unwrap().externalized_value(), Some(&v1));
    }

    #[test]
    fn test_split_votes_do_not_close() {
        let (mut slots, a, b, _) = two_of_three();
        slots.add_externalize_value(1, &a, &make_value(1));
        slots.add_externalize_value(1, &b, &make_value(2));
        assert!(!slots.has_closed_slot());
    }

    #[test]
    fn test_untrusted_votes_never_close() {
        let (mut slots, _, _, _) = two_of_three();
        let v1 = make_value(1);
        for seed in 10..20 {
            assert_eq!(
                slots.add_externalize_value(1, &make_node_id(seed), &v1),
                VoteOutcome::Recorded
            );
        }
        assert!(!slots.has_closed_slot());
    }

    #[test]
    fn test_untrusted_votes_do_not_block_trusted_close() {
        // Closure is judged on the trusted set only, so an early untrusted
        // voter neither helps nor hurts.
        let (mut slots, a, b, _) = two_of_three();
        let v1 = make_value(1);
        slots.add_externalize_value(1, &make_node_id(50), &v1);
        slots.add_externalize_value(1, &a, &v1);
        assert_eq!(slots.add_externalize_value(1, &b, &v1), VoteOutcome::Closed);
    }

    #[test]
    fn test_agreeing_and_disagreeing() {
        let (mut slots, a, b, c) = two_of_three();
        let (v1, v2) = (make_value(1), make_value(2));
        slots.add_externalize_value(1, &c, &v2);
        slots.add_externalize_value(1, &a, &v1);
        assert!(slots.get(1).unwrap().nodes_agreeing_on_externalized_value().is_empty());
        assert!(slots.get(1).unwrap().nodes_disagreeing_on_externalized_value().is_empty());

        slots.add_externalize_value(1, &b, &v1);
        let slot = slots.get(1).unwrap();
        assert_eq!(
            slot.nodes_agreeing_on_externalized_value(),
            HashSet::from([a, b])
        );
        assert_eq!(slot.nodes_disagreeing_on_externalized_value(), HashSet::from([c]));
    }

    #[test]
    fn test_slot_per_index() {
        let (mut slots, a, _, _) = two_of_three();
        assert!(slots.is_empty());
        slots.add_externalize_value(5, &a, &make_value(1));
        slots.add_externalize_value(3, &a, &make_value(1));
        slots.add_externalize_value(5, &a, &make_value(1));
        assert_eq!(slots.len(), 2);
        assert!(slots.get(4).is_none());
    }
}
