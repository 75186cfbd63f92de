//! Common types for the lookout crawler.
//!
//! - [`Hash256`]: SHA-256 digest used for quorum set hashes and dedup keys
//! - [`NetworkId`]: hash of the network passphrase, mixed into every SCP signature

pub mod network;
pub mod types;

pub use network::{NetworkId, MAINNET_PASSPHRASE, TESTNET_PASSPHRASE};
pub use types::Hash256;
