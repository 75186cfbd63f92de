//! In-memory overlay network for exercising the crawler.
//!
//! [`MemoryNetwork`] implements [`Connector`] over scripted
//! [`SimulatedPeer`]s instead of sockets. Each connection runs as its own
//! task that follows the connector contract: a handshake outcome first, one
//! frame at a time waiting for the crawler's acknowledgement, replies to
//! quorum set requests, and a final `Close` once destroyed.
//!
//! Envelopes are signed with real keys, so crawls driven through this
//! network exercise signature verification end to end.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use lookout_common::{Hash256, NetworkId};
use lookout_crawler::{
    hash_quorum_set, ConnectionCommand, ConnectionError, ConnectionEvent, ConnectionHandle,
    Connector, MessageWork, NodeAddress, NodeInfo, PeerConnection,
};
use lookout_crypto::{sha256_multi, sign_scp_statement, CryptoError, SecretKey};
use parking_lot::Mutex;
use stellar_xdr::curr::{
    DontHave, ErrorCode, Hash, Limits, MessageType, NodeId, PeerAddress, PeerAddressIp, SError,
    ScpBallot, ScpEnvelope, ScpNomination, ScpQuorumSet, ScpStatement, ScpStatementExternalize,
    ScpStatementPledges, StellarMessage, StellarValue, StellarValueExt, TimePoint, Value, VecM,
    WriteXdr,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Capacity of a simulated connection's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How a simulated peer answers a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    Accept,
    /// Fail the handshake and close.
    Refuse,
    /// Never finish the handshake; close only when destroyed.
    Hang,
}

/// How a simulated peer answers `GET_SCP_QUORUMSET`.
#[derive(Debug, Clone, PartialEq)]
pub enum QuorumSetReply {
    /// Send the quorum set when its hash is asked for, `DONT_HAVE` otherwise.
    Serve(ScpQuorumSet),
    /// Send this quorum set whatever hash is asked for.
    Forge(ScpQuorumSet),
    DontHave,
    /// Never answer.
    Ignore,
}

/// A scripted overlay node.
#[derive(Debug, Clone)]
pub struct SimulatedPeer {
    secret: SecretKey,
    info: NodeInfo,
    handshake: Handshake,
    script: Vec<StellarMessage>,
    /// Frames still in flight when the crawler destroys the connection.
    closing_script: Vec<StellarMessage>,
    linger: Duration,
    quorum_set_reply: QuorumSetReply,
}

impl SimulatedPeer {
    pub fn new(secret: SecretKey) -> Self {
        Self {
            secret,
            info: NodeInfo {
                ledger_version: 22,
                overlay_version: 35,
                overlay_min_version: 33,
                version_string: "lookout-simulation".to_string(),
            },
            handshake: Handshake::Accept,
            script: Vec::new(),
            closing_script: Vec::new(),
            linger: Duration::ZERO,
            quorum_set_reply: QuorumSetReply::DontHave,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.secret.public_key().to_node_id()
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn with_info(mut self, info: NodeInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = handshake;
        self
    }

    /// Queue a message to send after the handshake, after those already queued.
    pub fn sends(mut self, message: StellarMessage) -> Self {
        self.script.push(message);
        self
    }

    /// On destroy, wait `linger` and deliver `message` before closing.
    pub fn sends_while_closing(mut self, linger: Duration, message: StellarMessage) -> Self {
        self.linger = linger;
        self.closing_script.push(message);
        self
    }

    pub fn serves_quorum_set(mut self, quorum_set: ScpQuorumSet) -> Self {
        self.quorum_set_reply = QuorumSetReply::Serve(quorum_set);
        self
    }

    pub fn with_quorum_set_reply(mut self, reply: QuorumSetReply) -> Self {
        self.quorum_set_reply = reply;
        self
    }

    fn reply_to(&self, message: &StellarMessage) -> Option<StellarMessage> {
        let StellarMessage::GetScpQuorumset(requested) = message else {
            return None;
        };
        let dont_have = StellarMessage::DontHave(DontHave {
            type_: MessageType::ScpQuorumset,
            req_hash: requested.clone(),
        });
        match &self.quorum_set_reply {
            QuorumSetReply::Serve(quorum_set) => match hash_quorum_set(quorum_set) {
                Ok(hash) if hash == Hash256::from(requested.clone()) => {
                    Some(StellarMessage::ScpQuorumset(quorum_set.clone()))
                }
                _ => Some(dont_have),
            },
            QuorumSetReply::Forge(quorum_set) => {
                Some(StellarMessage::ScpQuorumset(quorum_set.clone()))
            }
            QuorumSetReply::DontHave => Some(dont_have),
            QuorumSetReply::Ignore => None,
        }
    }
}

/// A set of simulated peers reachable by address.
///
/// Clones share the recorded traffic, so a test can hand one clone to the
/// crawler and inspect the other afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    peers: HashMap<String, Arc<SimulatedPeer>>,
    attempts: Arc<Mutex<Vec<NodeAddress>>>,
    received: Arc<Mutex<Vec<(NodeAddress, StellarMessage)>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` reachable at `address`. Unknown addresses refuse connections.
    pub fn add_peer(&mut self, address: &NodeAddress, peer: SimulatedPeer) -> &mut Self {
        self.peers.insert(address.key(), Arc::new(peer));
        self
    }

    /// Every address the crawler tried to connect to, in order.
    pub fn connection_attempts(&self) -> Vec<NodeAddress> {
        self.attempts.lock().clone()
    }

    /// Every message the crawler sent, with the address it went to.
    pub fn messages_received(&self) -> Vec<(NodeAddress, StellarMessage)> {
        self.received.lock().clone()
    }

    /// Quorum set requests the crawler sent, with the address they went to.
    pub fn quorum_set_requests(&self) -> Vec<(NodeAddress, Hash256)> {
        self.received
            .lock()
            .iter()
            .filter_map(|(address, message)| match message {
                StellarMessage::GetScpQuorumset(hash) => {
                    Some((address.clone(), Hash256::from(hash.clone())))
                }
                _ => None,
            })
            .collect()
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, address: &NodeAddress) -> PeerConnection {
        self.attempts.lock().push(address.clone());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let connection = SimulatedConnection {
            address: address.clone(),
            peer: self.peers.get(&address.key()).cloned(),
            events: event_tx,
            commands: command_rx,
            received: Arc::clone(&self.received),
        };
        tokio::spawn(connection.run());

        PeerConnection {
            handle: ConnectionHandle::new(command_tx),
            events: event_rx,
        }
    }
}

struct SimulatedConnection {
    address: NodeAddress,
    peer: Option<Arc<SimulatedPeer>>,
    events: mpsc::Sender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    received: Arc<Mutex<Vec<(NodeAddress, StellarMessage)>>>,
}

impl SimulatedConnection {
    async fn run(mut self) {
        let handshake = self.peer.as_ref().map(|peer| peer.handshake);
        match (handshake, self.peer.clone()) {
            (Some(Handshake::Accept), Some(peer)) => {
                let connected = ConnectionEvent::Connect {
                    public_key: peer.node_id(),
                    info: peer.info.clone(),
                };
                if self.events.send(connected).await.is_ok() {
                    self.serve(&peer).await;
                }
            }
            (Some(Handshake::Hang), _) => {
                trace!(peer = %self.address, "Holding handshake");
                while let Some(command) = self.commands.recv().await {
                    if matches!(command, ConnectionCommand::Destroy) {
                        break;
                    }
                }
            }
            (Some(Handshake::Refuse), _) => {
                let error = ConnectionError::Handshake {
                    address: self.address.clone(),
                    reason: "peer refused".to_string(),
                };
                let _ = self.events.send(ConnectionEvent::Error(error)).await;
            }
            _ => {
                let error = ConnectionError::Refused(self.address.clone());
                let _ = self.events.send(ConnectionEvent::Error(error)).await;
            }
        }
        debug!(peer = %self.address, "Simulated connection closed");
        let _ = self.events.send(ConnectionEvent::Close).await;
    }

    /// Deliver the script one acknowledged frame at a time, answering
    /// requests in between, until destroyed.
    async fn serve(&mut self, peer: &SimulatedPeer) {
        let mut outbox: VecDeque<StellarMessage> = peer.script.iter().cloned().collect();
        let mut pending_ack: Option<oneshot::Receiver<()>> = None;

        loop {
            if pending_ack.is_none() {
                if let Some(message) = outbox.pop_front() {
                    let (work, ack) = MessageWork::new(message);
                    if self.events.send(ConnectionEvent::Data(work)).await.is_err() {
                        return;
                    }
                    pending_ack = Some(ack);
                }
            }

            tokio::select! {
                _ = wait_for_ack(&mut pending_ack), if pending_ack.is_some() => {
                    pending_ack = None;
                }
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Send(message)) => {
                        self.received.lock().push((self.address.clone(), message.clone()));
                        if let Some(reply) = peer.reply_to(&message) {
                            outbox.push_back(reply);
                        }
                    }
                    Some(ConnectionCommand::Destroy) => return self.linger(peer).await,
                    None => return,
                },
            }
        }
    }

    async fn linger(&mut self, peer: &SimulatedPeer) {
        if peer.closing_script.is_empty() {
            return;
        }
        tokio::time::sleep(peer.linger).await;
        for message in &peer.closing_script {
            let (work, ack) = MessageWork::new(message.clone());
            if self.events.send(ConnectionEvent::Data(work)).await.is_err() {
                return;
            }
            let _ = ack.await;
        }
    }
}

async fn wait_for_ack(ack: &mut Option<oneshot::Receiver<()>>) {
    if let Some(ack) = ack {
        let _ = ack.await;
    }
}

/// Deterministic key for simulated node `index`.
pub fn secret_for(index: u32) -> SecretKey {
    let seed = sha256_multi(&[b"lookout simulated node", &index.to_be_bytes()]);
    SecretKey::from_seed(seed.as_bytes())
}

/// A signed externalize statement for `slot_index` with `value`.
pub fn externalize_envelope(
    secret: &SecretKey,
    slot_index: u64,
    value: &Value,
    quorum_set_hash: Hash256,
    network_id: &NetworkId,
) -> Result<ScpEnvelope, CryptoError> {
    let statement = ScpStatement {
        node_id: secret.public_key().to_node_id(),
        slot_index,
        pledges: ScpStatementPledges::Externalize(ScpStatementExternalize {
            commit: ScpBallot {
                counter: 1,
                value: value.clone(),
            },
            n_h: 1,
            commit_quorum_set_hash: Hash::from(quorum_set_hash),
        }),
    };
    sign_scp_statement(secret, statement, network_id)
}

/// A signed nominate statement for `slot_index` that votes for nothing.
pub fn nominate_envelope(
    secret: &SecretKey,
    slot_index: u64,
    quorum_set_hash: Hash256,
    network_id: &NetworkId,
) -> Result<ScpEnvelope, CryptoError> {
    let statement = ScpStatement {
        node_id: secret.public_key().to_node_id(),
        slot_index,
        pledges: ScpStatementPledges::Nominate(ScpNomination {
            quorum_set_hash: Hash::from(quorum_set_hash),
            votes: VecM::default(),
            accepted: VecM::default(),
        }),
    };
    sign_scp_statement(secret, statement, network_id)
}

/// An encoded `StellarValue` closing at `close_time`.
pub fn stellar_value(tx_set_seed: u8, close_time: u64) -> Result<Value, stellar_xdr::curr::Error> {
    let value = StellarValue {
        tx_set_hash: Hash([tx_set_seed; 32]),
        close_time: TimePoint(close_time),
        upgrades: VecM::default(),
        ext: StellarValueExt::Basic,
    };
    Ok(Value(value.to_xdr(Limits::none())?.try_into()?))
}

/// A `PEERS` message listing the IPv4 addresses among `addresses`.
pub fn peers_message(addresses: &[NodeAddress]) -> StellarMessage {
    let peers: Vec<PeerAddress> = addresses
        .iter()
        .filter_map(|address| {
            let ip: Ipv4Addr = address.ip.parse().ok()?;
            Some(PeerAddress {
                ip: PeerAddressIp::IPv4(ip.octets()),
                port: u32::from(address.port),
                num_failures: 0,
            })
        })
        .collect();
    StellarMessage::Peers(peers.try_into().unwrap_or_default())
}

/// An `ERROR_MSG` with `code`.
pub fn error_message(code: ErrorCode, message: &str) -> StellarMessage {
    StellarMessage::ErrorMsg(SError {
        code,
        msg: message.try_into().unwrap_or_default(),
    })
}
