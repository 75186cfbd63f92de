//! How long to keep listening to a connected peer.
//!
//! Every `period` the crawler asks [`DisconnectTimeout::listen_further`]
//! whether the peer still has something to tell. Peers that never take part
//! in SCP, or that have already shown what they validate and which quorum
//! set they use, are let go. Top tier peers are kept until the rest of the
//! crawl is done, since their votes are what closes later slots.

use std::time::Duration;

use stellar_xdr::curr::NodeId;
use tracing::debug;

use crate::connection::ConnectionId;
use crate::crawl_state::{CrawlState, CrawlTimer};
use crate::format::short_node_id;
use crate::peer_node::PeerNode;

#[derive(Debug, Clone, Copy)]
pub struct DisconnectTimeout {
    period: Duration,
    max_cycles: u32,
}

impl DisconnectTimeout {
    pub fn new(period: Duration, max_cycles: u32) -> Self {
        Self { period, max_cycles }
    }

    /// Decide whether to keep listening once period `cycle` has elapsed.
    ///
    /// `ready` reports whether the rest of the crawl has drained, which is
    /// when top tier peers may be released too.
    pub fn listen_further(&self, peer: Option<&PeerNode>, cycle: u32, top_tier: bool, ready: bool) -> bool {
        if cycle == 0 {
            return true;
        }
        if cycle >= self.max_cycles {
            return false;
        }
        let Some(peer) = peer else {
            return false;
        };
        if peer.is_validating_incorrect_values {
            return false;
        }
        if !peer.participating_in_scp {
            return false;
        }
        if peer.is_validating && peer.quorum_set.is_some() {
            return top_tier && !ready;
        }
        true
    }

    /// Schedule the check that ends period `cycle` for `public_key`'s
    /// canonical connection, replacing any pending one.
    pub fn start(&self, state: &mut CrawlState, public_key: &NodeId, connection: ConnectionId, cycle: u32) {
        state.clear_listen_timeout(public_key);
        debug!(pk = %short_node_id(public_key), cycle, "Listening for SCP traffic");
        let key = state.timers.insert(
            CrawlTimer::Listen {
                public_key: public_key.clone(),
                connection,
                cycle,
            },
            self.period,
        );
        state.listen_timeouts.insert(public_key.clone(), key);
    }
}
