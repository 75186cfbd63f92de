//! SCP envelope signatures.
//!
//! A statement is signed over `network_id || ENVELOPE_TYPE_SCP || statement`,
//! where the envelope type is a big-endian `i32` and the statement is its
//! canonical XDR encoding.

use crate::error::CryptoError;
use crate::keys::{PublicKey, SecretKey, Signature};
use lookout_common::NetworkId;
use stellar_xdr::curr::{EnvelopeType, Limits, ScpEnvelope, ScpStatement, WriteXdr};

/// The exact bytes a validator signs for a statement.
pub fn scp_signature_payload(
    statement: &ScpStatement,
    network_id: &NetworkId,
) -> Result<Vec<u8>, CryptoError> {
    let statement_bytes = statement.to_xdr(Limits::none())?;
    let mut data = Vec::with_capacity(32 + 4 + statement_bytes.len());
    data.extend_from_slice(network_id.as_bytes());
    data.extend_from_slice(&(EnvelopeType::Scp as i32).to_be_bytes());
    data.extend_from_slice(&statement_bytes);
    Ok(data)
}

/// Sign a statement and wrap it in an envelope.
pub fn sign_scp_statement(
    secret: &SecretKey,
    statement: ScpStatement,
    network_id: &NetworkId,
) -> Result<ScpEnvelope, CryptoError> {
    let payload = scp_signature_payload(&statement, network_id)?;
    let signature = stellar_xdr::curr::Signature::try_from(secret.sign(&payload))?;
    Ok(ScpEnvelope {
        statement,
        signature,
    })
}

/// Verify an envelope's signature against the key in its statement.
///
/// # Errors
///
/// - [`CryptoError::InvalidPublicKey`] if the node id is not a curve point
/// - [`CryptoError::InvalidLength`] if the signature is not 64 bytes
/// - [`CryptoError::InvalidSignature`] if verification fails
pub fn verify_scp_envelope(
    envelope: &ScpEnvelope,
    network_id: &NetworkId,
) -> Result<(), CryptoError> {
    let public_key = PublicKey::try_from(&envelope.statement.node_id)?;
    let signature = Signature::try_from(&envelope.signature)?;
    let payload = scp_signature_payload(&envelope.statement, network_id)?;
    public_key.verify(&payload, &signature)
}
