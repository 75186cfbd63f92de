//! Display helpers for log fields.

use stellar_xdr::curr::{NodeId, PublicKey, ScpStatementPledges, Uint256, Value};

/// Full strkey (G...) of a node identity.
pub fn node_id_to_strkey(node_id: &NodeId) -> String {
    let PublicKey::PublicKeyTypeEd25519(Uint256(bytes)) = &node_id.0;
    stellar_strkey::ed25519::PublicKey(*bytes).to_string()
}

/// First five strkey characters, enough to tell nodes apart in logs.
pub fn short_node_id(node_id: &NodeId) -> String {
    let mut key = node_id_to_strkey(node_id);
    key.truncate(5);
    key
}

/// Hex of the first eight bytes of a value.
pub fn value_to_str(value: &Value) -> String {
    hex::encode(&value.as_slice()[..8.min(value.len())])
}

pub fn pledges_name(pledges: &ScpStatementPledges) -> &'static str {
    match pledges {
        ScpStatementPledges::Nominate(_) => "nominate",
        ScpStatementPledges::Prepare(_) => "prepare",
        ScpStatementPledges::Confirm(_) => "confirm",
        ScpStatementPledges::Externalize(_) => "externalize",
    }
}
