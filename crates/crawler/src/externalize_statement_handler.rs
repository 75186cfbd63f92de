//! Feeds externalize votes into the slot tally and applies closures.

use stellar_xdr::curr::{Limits, NodeId, ReadXdr, StellarValue, Value};
use tracing::{debug, info};

use crate::crawl_state::{CrawlState, Ledger};
use crate::format::{short_node_id, value_to_str};
use crate::slots::VoteOutcome;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalizeStatementHandler;

impl ExternalizeStatementHandler {
    pub fn new() -> Self {
        Self
    }

    /// Record `voter` externalizing `value` for `slot_index`.
    ///
    /// When the vote closes the slot, every voter recorded so far is
    /// classified. Votes arriving after closure classify only their voter.
    pub fn process_externalize_statement(
        &self,
        state: &mut CrawlState,
        voter: &NodeId,
        slot_index: u64,
        value: &Value,
    ) -> VoteOutcome {
        let outcome = state.slots.add_externalize_value(slot_index, voter, value);
        match outcome {
            VoteOutcome::Duplicate | VoteOutcome::Recorded => {}
            VoteOutcome::Closed => {
                self.on_slot_closed(state, slot_index, value);
                self.classify_all(state, slot_index);
            }
            VoteOutcome::RecordedAfterClose => self.classify(state, slot_index, voter, value),
        }
        outcome
    }

    fn on_slot_closed(&self, state: &mut CrawlState, slot_index: u64, value: &Value) {
        if slot_index <= state.latest_closed_ledger.sequence {
            return;
        }
        let close_time = close_time(value);
        state.latest_closed_ledger = Ledger {
            sequence: slot_index,
            close_time,
        };
        info!(
            slot = slot_index,
            close_time,
            value = %value_to_str(value),
            "Ledger closed"
        );
    }

    fn classify_all(&self, state: &mut CrawlState, slot_index: u64) {
        let Some(slot) = state.slots.get(slot_index) else {
            return;
        };
        let agreeing = slot.nodes_agreeing_on_externalized_value();
        let disagreeing = slot.nodes_disagreeing_on_externalized_value();

        for public_key in &agreeing {
            state.peer_nodes.get_or_add(public_key).is_validating = true;
        }
        for public_key in &disagreeing {
            debug!(pk = %short_node_id(public_key), slot = slot_index, "Node externalized a different value");
            state.peer_nodes.get_or_add(public_key).is_validating_incorrect_values = true;
        }
    }

    fn classify(&self, state: &mut CrawlState, slot_index: u64, voter: &NodeId, value: &Value) {
        let agrees = state
            .slots
            .get(slot_index)
            .and_then(|slot| slot.externalized_value())
            .is_some_and(|externalized| externalized == value);
        let peer = state.peer_nodes.get_or_add(voter);
        if agrees {
            peer.is_validating = true;
        } else {
            debug!(pk = %short_node_id(voter), slot = slot_index, "Node externalized a different value");
            peer.is_validating_incorrect_values = true;
        }
    }
}

/// Close time carried in an externalized `StellarValue`, 0 if the value
/// does not decode as one.
pub fn close_time(value: &Value) -> u64 {
    StellarValue::from_xdr(value.as_slice(), Limits::none())
        .map(|stellar_value| stellar_value.close_time.0)
        .unwrap_or(0)
}
