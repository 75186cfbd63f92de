//! Ed25519 node keys.
//!
//! Overlay identities are `NodeId`s, which carry a raw Ed25519 key. Only a
//! [`PublicKey`] that decodes to a curve point can verify anything, so
//! statements from a `NodeId` that fails [`PublicKey::try_from`] are
//! treated like badly signed ones.
//!
//! ```
//! use lookout_crypto::{PublicKey, SecretKey};
//!
//! let node = SecretKey::generate().public_key();
//! let strkey = node.to_strkey();
//! assert_eq!(PublicKey::from_strkey(&strkey).unwrap(), node);
//! ```

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use stellar_xdr::curr::{BytesM, NodeId, Uint256};

use crate::error::CryptoError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// # Errors
    ///
    /// [`CryptoError::InvalidPublicKey`] if `bytes` is not a curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.0
            .verify(message, &ed25519_dalek::Signature::from_bytes(&signature.0))
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// `G...` account id form, used in configuration and logs.
    pub fn to_strkey(&self) -> String {
        stellar_strkey::ed25519::PublicKey(*self.as_bytes()).to_string()
    }

    pub fn from_strkey(s: &str) -> Result<Self, CryptoError> {
        let decoded = stellar_strkey::ed25519::PublicKey::from_string(s)
            .map_err(|e| CryptoError::InvalidStrKey(format!("{s}: {e}")))?;
        Self::from_bytes(&decoded.0)
    }

    pub fn to_node_id(&self) -> NodeId {
        NodeId(stellar_xdr::curr::PublicKey::PublicKeyTypeEd25519(Uint256(
            *self.as_bytes(),
        )))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_strkey()).finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_strkey())
    }
}

impl TryFrom<&NodeId> for PublicKey {
    type Error = CryptoError;

    fn try_from(node_id: &NodeId) -> Result<Self, Self::Error> {
        let stellar_xdr::curr::PublicKey::PublicKeyTypeEd25519(Uint256(bytes)) = &node_id.0;
        Self::from_bytes(bytes)
    }
}

/// Signing half of a node key.
///
/// The crawler only ever verifies. Secret keys let simulated peers and
/// tests produce statements that pass verification.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    pub fn generate() -> Self {
        Self(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(seed))
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message).to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey")
            .field(&self.public_key().to_strkey())
            .finish()
    }
}

/// Raw Ed25519 signature. Not checked until [`PublicKey::verify`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl TryFrom<Signature> for stellar_xdr::curr::Signature {
    type Error = CryptoError;

    fn try_from(signature: Signature) -> Result<Self, Self::Error> {
        let bytes: BytesM<64> = signature.0.to_vec().try_into()?;
        Ok(Self(bytes))
    }
}

impl TryFrom<&stellar_xdr::curr::Signature> for Signature {
    type Error = CryptoError;

    fn try_from(xdr: &stellar_xdr::curr::Signature) -> Result<Self, Self::Error> {
        <[u8; 64]>::try_from(xdr.0.as_slice())
            .map(Self)
            .map_err(|_| CryptoError::InvalidLength {
                expected: 64,
                got: xdr.0.len(),
            })
    }
}
