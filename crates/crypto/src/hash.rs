//! SHA-256 helpers.

use lookout_common::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    Hash256::hash(data)
}

/// Digest of `chunks` as if they were concatenated.
pub fn sha256_multi(chunks: &[&[u8]]) -> Hash256 {
    let hasher = chunks
        .iter()
        .fold(Sha256::new(), |hasher, chunk| hasher.chain_update(chunk));
    Hash256(hasher.finalize().into())
}
