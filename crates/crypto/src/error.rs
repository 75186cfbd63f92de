use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// A node id whose bytes are not an Ed25519 curve point.
    #[error("public key is not a valid ed25519 point")]
    InvalidPublicKey,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed account id {0}")]
    InvalidStrKey(String),

    #[error("expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("XDR encoding failed: {0}")]
    Xdr(#[from] stellar_xdr::curr::Error),
}
