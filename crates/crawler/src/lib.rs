//! Passive crawler for SCP overlay networks.
//!
//! Starting from a list of seed addresses, the crawler connects to every
//! node it can reach, follows the addresses peers gossip, and listens to
//! their SCP traffic without ever voting itself. From that traffic it works
//! out:
//!
//! - which quorum set each node declares, fetched by hash from peers
//! - which ledger slots closed, judged against a caller-trusted top tier
//!   quorum set
//! - which nodes externalize the values slots close with, and which do not
//!
//! # Key Types
//!
//! - [`Crawler`]: runs crawls over a [`Connector`]
//! - [`CrawlResult`]: the peers, closed ledgers and quorum sets of a crawl
//! - [`CrawlCheckpoint`]: what one crawl hands to the next
//! - [`CrawlerConfig`]: timeouts, pool size and blacklist
//! - [`Connector`], [`ConnectionEvent`], [`ConnectionHandle`]: the contract
//!   with the overlay transport, which this crate does not implement
//!
//! # Example
//!
//! ```ignore
//! use lookout_crawler::{Crawler, CrawlerConfig, NodeAddress};
//!
//! let crawler = Crawler::new(CrawlerConfig::mainnet(), connector)?;
//! let seeds = vec![NodeAddress::new("54.161.82.181", 11625)];
//! let result = crawler.crawl(&seeds, &top_tier, None).await?;
//! println!("closed ledgers: {:?}", result.closed_ledgers);
//!
//! // Seed the next crawl with what this one learned.
//! let next = crawler.crawl(&seeds, &top_tier, Some(result.checkpoint())).await?;
//! ```

pub mod config;
pub mod connection;
pub mod crawl_queue;
pub mod crawl_state;
mod crawler;
pub mod disconnect_timeout;
pub mod error;
pub mod externalize_statement_handler;
pub mod format;
pub mod logging;
pub mod peer_node;
pub mod quorum;
pub mod quorum_set_manager;
pub mod scp_envelope_handler;
pub mod slots;

pub use config::{CrawlerConfig, LoggingConfig};
pub use connection::{
    ConnectionCommand, ConnectionEvent, ConnectionHandle, ConnectionId, Connector, MessageWork,
    NodeAddress, NodeInfo, PeerConnection,
};
pub use crawl_state::{CrawlCheckpoint, Ledger};
pub use crawler::{CrawlResult, Crawler};
pub use error::{ConnectionError, CrawlerError, PeerNodeError, ScpError};
pub use logging::{LogConfig, LogFormat};
pub use peer_node::{PeerNode, PeerNodeCollection};
pub use quorum::{hash_quorum_set, is_quorum_set_sane, is_quorum_slice, simple_quorum_set};
pub use slots::{Slot, Slots, VoteOutcome};
