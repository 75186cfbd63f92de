//! The contract between the crawler and the overlay transport.
//!
//! The crawler never touches sockets. A [`Connector`] opens a logical
//! connection to a [`NodeAddress`] and hands back a [`PeerConnection`]: an
//! event stream plus a [`ConnectionHandle`] for sending messages and
//! destroying the connection. Frames arrive already decoded as
//! [`StellarMessage`]s.
//!
//! Per connection, events are strictly ordered and a connector must not
//! deliver the next [`ConnectionEvent::Data`] frame before the previous
//! [`MessageWork`] has been acknowledged. A connection ends with exactly one
//! [`ConnectionEvent::Close`]; a connector that drops its event sender
//! without sending one is treated as closed.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use stellar_xdr::curr::{NodeId, PeerAddress, PeerAddressIp, StellarMessage};
use tokio::sync::{mpsc, oneshot};

use crate::error::ConnectionError;

/// Address of a peer on the overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub ip: String,
    pub port: u16,
}

impl NodeAddress {
    /// # Example
    ///
    /// ```rust
    /// use lookout_crawler::NodeAddress;
    ///
    /// let addr = NodeAddress::new("127.0.0.1", 11625);
    /// assert_eq!(addr.key(), "127.0.0.1:11625");
    /// ```
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// The `ip:port` key used to deduplicate addresses within a crawl.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Convert an address gossiped in a `PEERS` message.
    ///
    /// Returns `None` for ports that do not fit in a `u16`.
    pub fn from_peer_address(peer: &PeerAddress) -> Option<Self> {
        let port = u16::try_from(peer.port).ok()?;
        let ip = match &peer.ip {
            PeerAddressIp::IPv4(bytes) => Ipv4Addr::from(*bytes).to_string(),
            PeerAddressIp::IPv6(bytes) => Ipv6Addr::from(*bytes).to_string(),
        };
        Some(Self { ip, port })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Version information a peer presents during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub ledger_version: u32,
    pub overlay_version: u32,
    pub overlay_min_version: u32,
    pub version_string: String,
}

/// Identifies one connection attempt within a crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Something a connection reports to the crawler.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The handshake completed and the peer proved this identity.
    Connect { public_key: NodeId, info: NodeInfo },
    /// One decoded inbound frame.
    Data(MessageWork),
    /// The connection failed. A `Close` follows.
    Error(ConnectionError),
    /// The connection went idle for too long.
    Timeout,
    /// The connection is gone. Always the last event.
    Close,
}

/// An inbound message together with its processing acknowledgement.
///
/// Dropping the work acknowledges it too, so every exit path from message
/// handling releases the next frame.
#[derive(Debug)]
pub struct MessageWork {
    message: StellarMessage,
    ack: Option<oneshot::Sender<()>>,
}

impl MessageWork {
    /// Wrap a message; the receiver resolves once the crawler is done with it.
    pub fn new(message: StellarMessage) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                ack: Some(tx),
            },
            rx,
        )
    }

    pub fn message(&self) -> &StellarMessage {
        &self.message
    }

    /// Acknowledge the frame.
    pub fn done(mut self) {
        self.ack();
    }

    fn ack(&mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

impl Drop for MessageWork {
    fn drop(&mut self) {
        self.ack();
    }
}

/// Commands the crawler sends to a connection.
#[derive(Debug, Clone)]
pub enum ConnectionCommand {
    Send(StellarMessage),
    Destroy,
}

/// Sending half of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

impl ConnectionHandle {
    pub fn new(commands: mpsc::UnboundedSender<ConnectionCommand>) -> Self {
        Self { commands }
    }

    /// Queue a message for the peer. Returns `false` if the connection is gone.
    pub fn send(&self, message: StellarMessage) -> bool {
        self.commands.send(ConnectionCommand::Send(message)).is_ok()
    }

    /// Tear the connection down. The connection answers with `Close`.
    pub fn destroy(&self) {
        let _ = self.commands.send(ConnectionCommand::Destroy);
    }
}

/// A connection as returned by [`Connector::connect`].
#[derive(Debug)]
pub struct PeerConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Opens connections to overlay peers.
///
/// `connect` must return immediately; the handshake outcome is reported
/// through the event stream.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, address: &NodeAddress) -> PeerConnection;
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::Uint256;

    #[test]
    fn test_address_key() {
        let addr = NodeAddress::new("10.0.0.1", 11625);
        assert_eq!(addr.key(), "10.0.0.1:11625");
        assert_eq!(addr, NodeAddress::new("10.0.0.1".to_string(), 11625));
    }

    #[test]
    fn test_from_peer_address() {
        let v4 = PeerAddress {
            ip: PeerAddressIp::IPv4([192, 168, 1, 7]),
            port: 11625,
            num_failures: 0,
        };
        assert_eq!(
            NodeAddress::from_peer_address(&v4),
            Some(NodeAddress::new("192.168.1.7", 11625))
        );

        let mut v6_bytes = [0u8; 16];
        v6_bytes[15] = 1;
        let v6 = PeerAddress {
            ip: PeerAddressIp::IPv6(v6_bytes),
            port: 1,
            num_failures: 3,
        };
        assert_eq!(NodeAddress::from_peer_address(&v6).unwrap().key(), "::1:1");

        let bad_port = PeerAddress {
            ip: PeerAddressIp::IPv4([1, 2, 3, 4]),
            port: 70000,
            num_failures: 0,
        };
        assert!(NodeAddress::from_peer_address(&bad_port).is_none());
    }

    #[tokio::test]
    async fn test_message_work_done_acks() {
        let (work, rx) = MessageWork::new(StellarMessage::GetScpQuorumset(Uint256([0; 32])));
        assert!(matches!(work.message(), StellarMessage::GetScpQuorumset(_)));
        work.done();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_message_work_drop_acks() {
        let (work, rx) = MessageWork::new(StellarMessage::GetScpQuorumset(Uint256([0; 32])));
        drop(work);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx);
        assert!(handle.send(StellarMessage::GetScpQuorumset(Uint256([1; 32]))));
        handle.destroy();
        assert!(matches!(rx.recv().await, Some(ConnectionCommand::Send(_))));
        assert!(matches!(rx.recv().await, Some(ConnectionCommand::Destroy)));
        drop(rx);
        assert!(!handle.send(StellarMessage::GetScpQuorumset(Uint256([1; 32]))));
    }
}
