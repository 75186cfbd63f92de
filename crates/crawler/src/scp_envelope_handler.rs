//! Authenticates SCP envelopes and routes their contents.
//!
//! Per envelope, in order, each step possibly ending processing:
//!
//! 1. Drop gossip duplicates by signature digest.
//! 2. Drop statements for slots older than the latest closed ledger.
//! 3. Verify the signature; a bad one is an error for the sending connection.
//! 4. Mark the signer as participating in SCP.
//! 5. Hand the statement's quorum set hash to the [`QuorumSetManager`].
//! 6. For externalize statements, record the vote.

use lookout_common::{Hash256, NetworkId};
use lookout_crypto::verify_scp_envelope;
use stellar_xdr::curr::{ScpEnvelope, ScpStatement, ScpStatementPledges};
use tracing::{debug, trace};

use crate::crawl_state::CrawlState;
use crate::error::ScpError;
use crate::externalize_statement_handler::ExternalizeStatementHandler;
use crate::format::{pledges_name, short_node_id};
use crate::quorum_set_manager::QuorumSetManager;

/// What happened to an envelope that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// Seen before.
    Duplicate,
    /// For a slot older than the latest closed ledger.
    Stale,
    Processed,
}

#[derive(Debug, Clone)]
pub struct ScpEnvelopeHandler {
    network_id: NetworkId,
    quorum_set_manager: QuorumSetManager,
    externalize_handler: ExternalizeStatementHandler,
}

impl ScpEnvelopeHandler {
    pub fn new(
        network_id: NetworkId,
        quorum_set_manager: QuorumSetManager,
        externalize_handler: ExternalizeStatementHandler,
    ) -> Self {
        Self {
            network_id,
            quorum_set_manager,
            externalize_handler,
        }
    }

    pub fn quorum_set_manager(&self) -> &QuorumSetManager {
        &self.quorum_set_manager
    }

    /// Process one envelope.
    ///
    /// # Errors
    ///
    /// [`ScpError::InvalidSignature`] if the envelope is not signed by the
    /// node it names. The sending connection should be dropped.
    pub fn process_scp_envelope(
        &self,
        state: &mut CrawlState,
        envelope: &ScpEnvelope,
    ) -> Result<EnvelopeOutcome, ScpError> {
        let digest = Hash256::hash(envelope.signature.as_slice());
        if !state.remember_envelope(digest) {
            return Ok(EnvelopeOutcome::Duplicate);
        }

        let slot_index = envelope.statement.slot_index;
        if slot_index < state.latest_closed_ledger.sequence {
            trace!(slot = slot_index, "Ignoring statement for old slot");
            return Ok(EnvelopeOutcome::Stale);
        }

        verify_scp_envelope(envelope, &self.network_id).map_err(ScpError::InvalidSignature)?;

        self.process_scp_statement(state, &envelope.statement);
        Ok(EnvelopeOutcome::Processed)
    }

    fn process_scp_statement(&self, state: &mut CrawlState, statement: &ScpStatement) {
        let public_key = &statement.node_id;
        let slot_index = statement.slot_index;
        debug!(
            pk = %short_node_id(public_key),
            slot = slot_index,
            "Processing new SCP statement: {}",
            pledges_name(&statement.pledges)
        );

        let peer = state.peer_nodes.get_or_add(public_key);
        peer.participating_in_scp = true;
        peer.latest_active_slot_index = Some(slot_index);

        let hash = Hash256::from(quorum_set_hash(&statement.pledges).clone());
        self.quorum_set_manager
            .process_quorum_set_hash(state, public_key, hash);

        if let ScpStatementPledges::Externalize(externalize) = &statement.pledges {
            self.externalize_handler.process_externalize_statement(
                state,
                public_key,
                slot_index,
                &externalize.commit.value,
            );
        }
    }
}

/// The quorum set hash a statement carries; its field differs per kind.
pub fn quorum_set_hash(pledges: &ScpStatementPledges) -> &stellar_xdr::curr::Hash {
    match pledges {
        ScpStatementPledges::Nominate(nominate) => &nominate.quorum_set_hash,
        ScpStatementPledges::Prepare(prepare) => &prepare.quorum_set_hash,
        ScpStatementPledges::Confirm(confirm) => &confirm.quorum_set_hash,
        ScpStatementPledges::Externalize(externalize) => &externalize.commit_quorum_set_hash,
    }
}
