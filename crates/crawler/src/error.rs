//! Error types for crawl operations.
//!
//! Errors are split by the scope they affect:
//!
//! - [`CrawlerError`]: aborts or prevents a whole crawl
//! - [`ScpError`]: a protocol violation by one peer, handled by disconnecting it
//! - [`ConnectionError`]: reported by a connection about itself
//! - [`PeerNodeError`]: an identity conflict between two connections

use std::time::Duration;

use lookout_crypto::CryptoError;
use thiserror::Error;

use crate::connection::NodeAddress;

/// Errors that abort or prevent a crawl.
#[derive(Debug, Error)]
pub enum CrawlerError {
    /// The global crawl deadline fired before the worker pool drained.
    ///
    /// All connections were destroyed and no partial result is returned.
    #[error("max crawl time of {0:?} hit, crawl aborted")]
    MaxCrawlTimeHit(Duration),

    /// The trusted quorum set cannot be used to close slots.
    #[error("invalid top tier quorum set: {0}")]
    InvalidTopTierQuorumSet(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CrawlerError {
    /// Whether running the same crawl again could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, CrawlerError::MaxCrawlTimeHit(_))
    }
}

/// Protocol violations found while processing SCP traffic from one peer.
#[derive(Debug, Error)]
pub enum ScpError {
    /// Envelope signature did not verify for the claimed node.
    #[error("invalid SCP signature: {0}")]
    InvalidSignature(#[source] CryptoError),

    /// Received quorum set is structurally unusable.
    #[error("invalid quorum set: {0}")]
    InvalidQuorumSet(String),

    /// A payload could not be re-encoded for hashing.
    #[error("XDR error: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),
}

/// Errors a connection reports about itself.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection refused by {0}")]
    Refused(NodeAddress),

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: NodeAddress, reason: String },

    /// The peer sent an error message that ends the session.
    #[error("peer sent error {code}: {message}")]
    Remote { code: String, message: String },

    /// A protocol violation detected while processing the peer's traffic.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ScpError),

    /// This public key is already connected from another address.
    #[error(transparent)]
    PeerNode(#[from] PeerNodeError),
}

/// Identity conflicts between connections.
#[derive(Debug, Error)]
pub enum PeerNodeError {
    /// A second address completed a handshake with an identity that is
    /// already connected elsewhere.
    #[error("peer node {public_key} reusing public key, already connected from {existing}")]
    PublicKeyReuse {
        public_key: String,
        existing: NodeAddress,
    },
}
