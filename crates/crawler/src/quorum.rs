//! Quorum set operations.
//!
//! A quorum set is a threshold over a list of validators and nested inner
//! quorum sets. A set of nodes *satisfies* a quorum set (contains one of its
//! slices) when at least `threshold` of its members are satisfied, where a
//! validator is satisfied by being in the node set and an inner set is
//! satisfied recursively.
//!
//! The crawler uses this against the caller's trusted (top tier) quorum set
//! to decide when a slot has closed.

use std::collections::HashSet;

use lookout_common::Hash256;
use stellar_xdr::curr::{NodeId, ScpQuorumSet, VecM};

/// Maximum depth of nested inner sets.
pub const MAXIMUM_QUORUM_NESTING_LEVEL: u32 = 4;

/// Maximum number of validators referenced by one quorum set, all levels.
pub const MAXIMUM_QUORUM_NODES: usize = 1000;

/// Check whether `nodes` contains a slice of `quorum_set`.
///
/// A zero threshold is trivially satisfied.
pub fn is_quorum_slice(quorum_set: &ScpQuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return true;
    }
    let satisfied_validators = quorum_set
        .validators
        .iter()
        .filter(|validator| nodes.contains(*validator));
    let satisfied_inner_sets = quorum_set
        .inner_sets
        .iter()
        .filter(|inner| is_quorum_slice(inner, nodes));
    // Lazily chained so evaluation stops at the threshold.
    satisfied_validators
        .map(|_| ())
        .chain(satisfied_inner_sets.map(|_| ()))
        .nth(threshold - 1)
        .is_some()
}

/// Check structural sanity of a quorum set.
///
/// Rejects zero thresholds, thresholds above the member count, duplicate
/// validators, nesting beyond [`MAXIMUM_QUORUM_NESTING_LEVEL`] and sets that
/// reference no validators (or more than [`MAXIMUM_QUORUM_NODES`]).
pub fn is_quorum_set_sane(quorum_set: &ScpQuorumSet) -> Result<(), String> {
    let mut checker = SanityChecker {
        known_nodes: HashSet::new(),
        count: 0,
    };
    checker.check(quorum_set, 0)?;

    if checker.count < 1 || checker.count > MAXIMUM_QUORUM_NODES {
        return Err(format!(
            "total number of nodes in a quorum set must be within 1 and {MAXIMUM_QUORUM_NODES}"
        ));
    }
    Ok(())
}

struct SanityChecker {
    known_nodes: HashSet<NodeId>,
    count: usize,
}

impl SanityChecker {
    fn check(&mut self, quorum_set: &ScpQuorumSet, depth: u32) -> Result<(), String> {
        if depth > MAXIMUM_QUORUM_NESTING_LEVEL {
            return Err("maximum quorum nesting level exceeded".to_string());
        }

        if quorum_set.threshold < 1 {
            return Err("threshold must be greater than 0".to_string());
        }

        let total = quorum_set.validators.len() + quorum_set.inner_sets.len();
        if quorum_set.threshold as usize > total {
            return Err(format!(
                "threshold {} exceeds the {} entries of the set",
                quorum_set.threshold, total
            ));
        }

        self.count = self.count.saturating_add(quorum_set.validators.len());
        for node in quorum_set.validators.iter() {
            if !self.known_nodes.insert(node.clone()) {
                return Err("duplicate node in quorum set".to_string());
            }
        }

        for inner in quorum_set.inner_sets.iter() {
            self.check(inner, depth + 1)?;
        }

        Ok(())
    }
}

/// All validators referenced by a quorum set, at any level.
pub fn get_all_nodes(quorum_set: &ScpQuorumSet) -> HashSet<NodeId> {
    quorum_set
        .validators
        .iter()
        .cloned()
        .chain(quorum_set.inner_sets.iter().flat_map(get_all_nodes))
        .collect()
}

/// A flat quorum set over `validators`.
pub fn simple_quorum_set(threshold: u32, validators: Vec<NodeId>) -> ScpQuorumSet {
    ScpQuorumSet {
        threshold,
        validators: validators.try_into().unwrap_or_default(),
        inner_sets: VecM::default(),
    }
}

/// The hash peers use to refer to a quorum set: SHA-256 of its XDR.
pub fn hash_quorum_set(
    quorum_set: &ScpQuorumSet,
) -> Result<Hash256, stellar_xdr::curr::Error> {
    Hash256::hash_xdr(quorum_set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{PublicKey, Uint256};

    fn make_node_id(seed: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        NodeId(PublicKey::PublicKeyTypeEd25519(Uint256(bytes)))
    }

    fn nested(threshold: u32, validators: Vec<NodeId>, inner: Vec<ScpQuorumSet>) -> ScpQuorumSet {
        ScpQuorumSet {
            threshold,
            validators: validators.try_into().unwrap(),
            inner_sets: inner.try_into().unwrap(),
        }
    }

    #[test]
    fn test_flat_slice() {
        let (a, b, c) = (make_node_id(1), make_node_id(2), make_node_id(3));
        let qs = simple_quorum_set(2, vec![a.clone(), b.clone(), c.clone()]);

        assert!(!is_quorum_slice(&qs, &HashSet::from([a.clone()])));
        assert!(is_quorum_slice(&qs, &HashSet::from([a.clone(), c.clone()])));
        assert!(is_quorum_slice(&qs, &HashSet::from([a, b, c])));
        assert!(!is_quorum_slice(&qs, &HashSet::from([make_node_id(9), make_node_id(8)])));
    }

    #[test]
    fn test_nested_slice_counts_inner_sets() {
        let org1 = simple_quorum_set(2, vec![make_node_id(1), make_node_id(2), make_node_id(3)]);
        let org2 = simple_quorum_set(2, vec![make_node_id(4), make_node_id(5), make_node_id(6)]);
        let org3 = simple_quorum_set(1, vec![make_node_id(7), make_node_id(8)]);
        let top = nested(2, vec![], vec![org1, org2, org3]);

        // One validator per org only satisfies org3.
        let spread = HashSet::from([make_node_id(1), make_node_id(4), make_node_id(7)]);
        assert!(!is_quorum_slice(&top, &spread));

        let two_orgs = HashSet::from([make_node_id(1), make_node_id(2), make_node_id(8)]);
        assert!(is_quorum_slice(&top, &two_orgs));
    }

    #[test]
    fn test_mixed_validators_and_inner_sets() {
        let inner = simple_quorum_set(1, vec![make_node_id(2), make_node_id(3)]);
        let qs = nested(2, vec![make_node_id(1)], vec![inner]);

        assert!(!is_quorum_slice(&qs, &HashSet::from([make_node_id(1)])));
        assert!(!is_quorum_slice(&qs, &HashSet::from([make_node_id(3)])));
        assert!(is_quorum_slice(&qs, &HashSet::from([make_node_id(1), make_node_id(3)])));
    }

    #[test]
    fn test_zero_threshold_trivially_satisfied() {
        let qs = simple_quorum_set(0, vec![make_node_id(1)]);
        assert!(is_quorum_slice(&qs, &HashSet::new()));
    }

    #[test]
    fn test_sanity() {
        let good = simple_quorum_set(2, vec![make_node_id(1), make_node_id(2)]);
        assert!(is_quorum_set_sane(&good).is_ok());

        let zero = simple_quorum_set(0, vec![make_node_id(1)]);
        assert!(is_quorum_set_sane(&zero).is_err());

        let too_high = simple_quorum_set(3, vec![make_node_id(1), make_node_id(2)]);
        assert!(is_quorum_set_sane(&too_high).is_err());

        let duplicate = simple_quorum_set(1, vec![make_node_id(1), make_node_id(1)]);
        assert!(is_quorum_set_sane(&duplicate).is_err());

        let empty = nested(1, vec![], vec![simple_quorum_set(0, vec![])]);
        assert!(is_quorum_set_sane(&empty).is_err());
    }

    #[test]
    fn test_sanity_nesting_limit() {
        let mut qs = simple_quorum_set(1, vec![make_node_id(1)]);
        for _ in 0..MAXIMUM_QUORUM_NESTING_LEVEL {
            qs = nested(1, vec![], vec![qs]);
        }
        assert!(is_quorum_set_sane(&qs).is_ok());

        let deeper = nested(1, vec![], vec![qs]);
        assert!(is_quorum_set_sane(&deeper).is_err());
    }

    #[test]
    fn test_get_all_nodes() {
        let inner = simple_quorum_set(1, vec![make_node_id(2), make_node_id(3)]);
        let qs = nested(1, vec![make_node_id(1)], vec![inner]);
        let nodes = get_all_nodes(&qs);
        assert_eq!(nodes.len(), 3);
        assert!(nodes.contains(&make_node_id(3)));
    }

    #[test]
    fn test_hash_quorum_set_is_content_bound() {
        let a = simple_quorum_set(1, vec![make_node_id(1)]);
        let b = simple_quorum_set(1, vec![make_node_id(2)]);
        assert_eq!(hash_quorum_set(&a).unwrap(), hash_quorum_set(&a.clone()).unwrap());
        assert_ne!(hash_quorum_set(&a).unwrap(), hash_quorum_set(&b).unwrap());
    }
}
