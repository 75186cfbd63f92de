//! Content hashes.

use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use stellar_xdr::curr::{Hash, Limits, Uint256, WriteXdr};

/// SHA-256 digest identifying a quorum set or an envelope signature.
///
/// Quorum sets travel on the wire as a `Hash` inside statements and as a
/// `Uint256` in `GET_SCP_QUORUMSET`, so both convert losslessly.
///
/// ```rust
/// use lookout_common::Hash256;
///
/// let hash = Hash256::hash(b"quorum set bytes");
/// assert_eq!(hash.to_base64().len(), 44);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn hash(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash the XDR encoding of `value`, the way quorum sets are named.
    pub fn hash_xdr<T: WriteXdr>(value: &T) -> Result<Self, stellar_xdr::curr::Error> {
        Ok(Self::hash(&value.to_xdr(Limits::none())?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Form used in crawl logs and explorer reports.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", hex::encode(self.0))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

macro_rules! xdr_bytes32 {
    ($xdr:ident) => {
        impl From<$xdr> for Hash256 {
            fn from(value: $xdr) -> Self {
                Self(value.0)
            }
        }

        impl From<Hash256> for $xdr {
            fn from(hash: Hash256) -> Self {
                $xdr(hash.0)
            }
        }
    };
}

xdr_bytes32!(Hash);
xdr_bytes32!(Uint256);
