//! Cryptographic primitives for the lookout crawler.
//!
//! - **Ed25519**: [`PublicKey`], [`SecretKey`] and [`Signature`]
//! - **SHA-256**: [`sha256`] and [`sha256_multi`]
//! - **SCP signatures**: [`verify_scp_envelope`] checks a statement's signature
//!   against the network identifier; [`sign_scp_statement`] produces one
//!
//! # Example
//!
//! ```
//! use lookout_common::NetworkId;
//! use lookout_crypto::{sha256, SecretKey};
//!
//! let secret = SecretKey::generate();
//! let signature = secret.sign(b"hello stellar");
//! assert!(secret.public_key().verify(b"hello stellar", &signature).is_ok());
//!
//! let network = NetworkId::testnet();
//! assert_eq!(network.0, sha256(b"Test SDF Network ; September 2015"));
//! ```

mod error;
mod hash;
mod keys;
mod scp;

pub use error::CryptoError;
pub use hash::*;
pub use keys::*;
pub use scp::*;

pub use lookout_common::Hash256;
