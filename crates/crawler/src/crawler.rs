//! Crawl orchestration.
//!
//! [`Crawler::crawl`] visits every seed address and every address peers
//! gossip, listens to each connected node's SCP traffic for as long as the
//! [`DisconnectTimeout`] policy allows, and assembles a [`CrawlResult`] once
//! every connection has closed.
//!
//! # Event loop
//!
//! All crawl state lives in one [`CrawlState`] owned by a single loop that
//! multiplexes:
//!
//! - connection events, funneled from one forwarding task per connection
//!   into a shared channel tagged with the [`ConnectionId`]
//! - crawl timers (listen periods and quorum set request timeouts)
//! - the global crawl deadline
//! - the progress log interval
//!
//! Handlers run to completion one at a time, so state needs no locking.
//! A connection's next frame is held back by its connector until the
//! previous [`MessageWork`] is acknowledged, which happens at the end of the
//! frame's handler.
//!
//! # Termination
//!
//! The crawl ends when no address is pending and no connection is open. If
//! the global deadline fires first, pending addresses are discarded, every
//! connection is destroyed, and once they have all closed the crawl fails
//! with [`CrawlerError::MaxCrawlTimeHit`] instead of returning partial data.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use futures::StreamExt;
use lookout_common::Hash256;
use stellar_xdr::curr::{
    DontHave, ErrorCode, MessageType, NodeId, PeerAddress, SError, ScpQuorumSet, StellarMessage,
};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::time::delay_queue::Expired;
use tracing::{debug, error, info, trace, warn};

use crate::config::CrawlerConfig;
use crate::connection::{
    ConnectionEvent, ConnectionId, Connector, MessageWork, NodeAddress, NodeInfo, PeerConnection,
};
use crate::crawl_queue::{CrawlQueue, TaskState};
use crate::crawl_state::{CrawlCheckpoint, CrawlState, CrawlTimer, Ledger, OpenConnection};
use crate::disconnect_timeout::DisconnectTimeout;
use crate::error::{ConnectionError, CrawlerError};
use crate::externalize_statement_handler::ExternalizeStatementHandler;
use crate::format::short_node_id;
use crate::peer_node::PeerNode;
use crate::quorum::is_quorum_set_sane;
use crate::quorum_set_manager::QuorumSetManager;
use crate::scp_envelope_handler::ScpEnvelopeHandler;

/// Capacity of the channel all connection forwarders feed.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The outcome of a completed crawl.
#[derive(Debug, Clone)]
pub struct CrawlResult {
    /// Every node seen, connected to or only heard of through SCP.
    pub peers: HashMap<NodeId, PeerNode>,
    /// Indexes of the slots that closed during the crawl, ascending.
    pub closed_ledgers: Vec<u64>,
    pub latest_closed_ledger: Ledger,
    /// Every quorum set known at the end of the crawl, keyed by hash.
    pub quorum_sets: HashMap<Hash256, ScpQuorumSet>,
}

impl CrawlResult {
    /// What the next crawl needs in order to pick up where this one ended.
    pub fn checkpoint(&self) -> CrawlCheckpoint {
        CrawlCheckpoint {
            latest_closed_ledger: self.latest_closed_ledger,
            quorum_sets: self.quorum_sets.clone(),
        }
    }

    /// Peers seen validating the closing values.
    pub fn validating_peers(&self) -> impl Iterator<Item = &PeerNode> {
        self.peers.values().filter(|peer| peer.is_validating)
    }
}

/// Crawls an overlay network through a [`Connector`].
///
/// A crawler holds only configuration; every call to [`Crawler::crawl`]
/// starts from fresh state, so successive crawls share nothing except what
/// is passed in through a [`CrawlCheckpoint`].
pub struct Crawler<C: Connector> {
    config: CrawlerConfig,
    connector: C,
    blacklist: HashSet<NodeId>,
    envelope_handler: ScpEnvelopeHandler,
    disconnect_timeout: DisconnectTimeout,
}

impl<C: Connector> Crawler<C> {
    /// Create a crawler.
    ///
    /// # Errors
    ///
    /// [`CrawlerError::InvalidConfig`] if `config` does not validate.
    pub fn new(config: CrawlerConfig, connector: C) -> Result<Self, CrawlerError> {
        config.validate()?;
        let blacklist = config.blacklisted_nodes()?;
        let quorum_set_manager = QuorumSetManager::new(config.quorum_set_request_timeout());
        let envelope_handler = ScpEnvelopeHandler::new(
            config.network_id(),
            quorum_set_manager,
            ExternalizeStatementHandler::new(),
        );
        let disconnect_timeout =
            DisconnectTimeout::new(config.scp_listen_timeout(), config.max_listen_cycles);
        Ok(Self {
            config,
            connector,
            blacklist,
            envelope_handler,
            disconnect_timeout,
        })
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Crawl the network reachable from `seeds`.
    ///
    /// `top_tier` is the quorum set trusted to close slots. `checkpoint`
    /// carries the latest closed ledger and known quorum sets of a previous
    /// crawl, if any.
    ///
    /// # Errors
    ///
    /// - [`CrawlerError::InvalidTopTierQuorumSet`] if `top_tier` is not sane
    /// - [`CrawlerError::MaxCrawlTimeHit`] if the crawl did not finish in time
    pub async fn crawl(
        &self,
        seeds: &[NodeAddress],
        top_tier: &ScpQuorumSet,
        checkpoint: Option<CrawlCheckpoint>,
    ) -> Result<CrawlResult, CrawlerError> {
        is_quorum_set_sane(top_tier).map_err(CrawlerError::InvalidTopTierQuorumSet)?;
        let cache_size = NonZeroUsize::new(self.config.envelope_cache_size).ok_or_else(|| {
            CrawlerError::InvalidConfig("envelope_cache_size must be > 0".to_string())
        })?;

        let state = CrawlState::new(top_tier.clone(), checkpoint.unwrap_or_default(), cache_size);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut run = CrawlRun {
            crawler: self,
            state,
            queue: CrawlQueue::new(self.config.max_open_connections),
            events_tx,
        };

        info!(
            seeds = seeds.len(),
            top_tier = run.state.top_tier_nodes.len(),
            latest_ledger = run.state.latest_closed_ledger.sequence,
            known_quorum_sets = run.state.quorum_sets.len(),
            "Starting crawl"
        );
        for address in seeds {
            run.crawl_peer_node(address.clone());
        }
        run.start_pending_tasks();
        run.run(events_rx).await
    }
}

/// One crawl in progress.
struct CrawlRun<'a, C: Connector> {
    crawler: &'a Crawler<C>,
    state: CrawlState,
    queue: CrawlQueue,
    events_tx: mpsc::Sender<(ConnectionId, ConnectionEvent)>,
}

impl<C: Connector> CrawlRun<'_, C> {
    async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<(ConnectionId, ConnectionEvent)>,
    ) -> Result<CrawlResult, CrawlerError> {
        let config = &self.crawler.config;
        let deadline = tokio::time::sleep(config.max_crawl_time());
        tokio::pin!(deadline);

        let period = config.progress_log_interval();
        let mut progress = tokio::time::interval_at(Instant::now() + period, period);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.queue.is_drained() {
            tokio::select! {
                Some((id, event)) = events_rx.recv() => {
                    self.on_event(id, event);
                }
                Some(expired) = self.state.timers.next(), if !self.state.timers.is_empty() => {
                    self.on_timer(expired);
                }
                () = &mut deadline, if !self.state.max_crawl_time_hit => {
                    self.on_max_crawl_time();
                }
                _ = progress.tick() => {
                    self.log_progress();
                }
            }
            self.start_pending_tasks();
        }

        self.wrap_up()
    }

    /// Schedule `address` unless it was already scheduled this crawl.
    fn crawl_peer_node(&mut self, address: NodeAddress) {
        if self.state.max_crawl_time_hit {
            return;
        }
        if !self.state.crawled_node_addresses.insert(address.key()) {
            trace!(peer = %address, "Address already crawled");
            return;
        }
        debug!(peer = %address, "Adding address to crawl queue");
        self.queue.push(address);
    }

    /// Open connections for pending addresses while the pool has room.
    fn start_pending_tasks(&mut self) {
        while let Some((id, address)) = self.queue.next_startable() {
            debug!(peer = %address, conn = %id, "Connecting");
            let PeerConnection { handle, events } = self.crawler.connector.connect(&address);
            spawn_forwarder(id, events, self.events_tx.clone());
            self.queue.start(id, address, handle);
        }
    }

    fn on_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connect { public_key, info } => self.on_connected(id, public_key, info),
            ConnectionEvent::Data(work) => self.on_data(id, work),
            ConnectionEvent::Error(error) => {
                debug!(conn = %id, error = %error, "Connection error");
                self.disconnect(id, Some(&error));
            }
            ConnectionEvent::Timeout => {
                debug!(conn = %id, "Connection timeout");
                self.disconnect(id, None);
            }
            ConnectionEvent::Close => self.on_connection_close(id),
        }
    }

    fn on_connected(&mut self, id: ConnectionId, public_key: NodeId, info: NodeInfo) {
        let Some(task) = self.queue.task_mut(id) else {
            return;
        };
        if task.state != TaskState::Connecting {
            return;
        }
        let top_tier = self.state.top_tier_nodes.contains(&public_key);
        task.public_key = Some(public_key.clone());
        task.top_tier = top_tier;
        task.state = TaskState::Connected;
        let address = task.address.clone();
        let handle = task.handle.clone();
        debug!(peer = %address, pk = %short_node_id(&public_key), "Connected");

        if self.crawler.blacklist.contains(&public_key) {
            info!(peer = %address, pk = %short_node_id(&public_key), "Peer node on blacklist");
            self.disconnect(id, None);
            return;
        }

        if let Err(error) = self
            .state
            .peer_nodes
            .add_successfully_connected(&public_key, &address, info)
        {
            self.disconnect(id, Some(&ConnectionError::from(error)));
            return;
        }

        if top_tier {
            self.state.top_tier_addresses.insert(address.key());
        }
        self.state
            .open_connections
            .insert(public_key.clone(), OpenConnection { id, address, handle });
        self.crawler
            .disconnect_timeout
            .start(&mut self.state, &public_key, id, 0);
        if let Some(task) = self.queue.task_mut(id) {
            task.state = TaskState::Listening { cycle: 0 };
        }
    }

    fn on_data(&mut self, id: ConnectionId, work: MessageWork) {
        let Some(task) = self.queue.task(id) else {
            return;
        };
        if !task.state.is_live() {
            trace!(conn = %id, "Ignoring frame from closing connection");
            return;
        }
        let public_key = task.public_key.clone();
        let result = self.on_stellar_message(id, public_key.as_ref(), work.message());
        work.done();

        if let Err(error) = result {
            self.disconnect(id, Some(&error));
        }
    }

    fn on_stellar_message(
        &mut self,
        id: ConnectionId,
        public_key: Option<&NodeId>,
        message: &StellarMessage,
    ) -> Result<(), ConnectionError> {
        match message {
            StellarMessage::ScpMessage(envelope) => {
                self.crawler
                    .envelope_handler
                    .process_scp_envelope(&mut self.state, envelope)?;
            }
            StellarMessage::Peers(peers) => self.on_peers_received(id, public_key, peers),
            StellarMessage::ScpQuorumset(quorum_set) => {
                if let Some(public_key) = public_key {
                    self.crawler
                        .envelope_handler
                        .quorum_set_manager()
                        .process_quorum_set(&mut self.state, public_key, quorum_set)?;
                }
            }
            StellarMessage::DontHave(dont_have) => self.on_dont_have(public_key, dont_have),
            StellarMessage::ErrorMsg(error) => self.on_error_message(id, public_key, error)?,
            other => trace!(conn = %id, kind = other.name(), "Ignoring message"),
        }
        Ok(())
    }

    fn on_peers_received(&mut self, id: ConnectionId, public_key: Option<&NodeId>, peers: &[PeerAddress]) {
        debug!(conn = %id, count = peers.len(), "Peers received");
        if let Some(peer) = public_key.and_then(|pk| self.state.peer_nodes.get_mut(pk)) {
            peer.supplied_peer_list = true;
        }
        for address in peers.iter().filter_map(NodeAddress::from_peer_address) {
            self.crawl_peer_node(address);
        }
    }

    fn on_dont_have(&mut self, public_key: Option<&NodeId>, dont_have: &DontHave) {
        let Some(public_key) = public_key else {
            return;
        };
        if !matches!(
            dont_have.type_,
            MessageType::ScpQuorumset | MessageType::GetScpQuorumset
        ) {
            trace!(pk = %short_node_id(public_key), kind = dont_have.type_.name(), "Don't have");
            return;
        }
        let hash = Hash256::from(dont_have.req_hash.clone());
        info!(pk = %short_node_id(public_key), hash = %hash.to_base64(), "Don't have quorum set");
        self.crawler
            .envelope_handler
            .quorum_set_manager()
            .peer_node_does_not_have_quorum_set(&mut self.state, public_key, hash);
    }

    fn on_error_message(
        &mut self,
        id: ConnectionId,
        public_key: Option<&NodeId>,
        error: &SError,
    ) -> Result<(), ConnectionError> {
        if error.code == ErrorCode::Load {
            debug!(conn = %id, "Load too high message received");
            if let Some(peer) = public_key.and_then(|pk| self.state.peer_nodes.get_mut(pk)) {
                peer.over_loaded = true;
            }
            return Ok(());
        }
        Err(ConnectionError::Remote {
            code: error.code.name().to_string(),
            message: error.msg.to_string(),
        })
    }

    fn on_connection_close(&mut self, id: ConnectionId) {
        let Some(task) = self.queue.complete(id) else {
            return;
        };
        match &task.public_key {
            Some(public_key) => {
                debug!(peer = %task.address, pk = %short_node_id(public_key), "Node disconnected");
                // A rejected duplicate must not tear down the accepted connection.
                if self.state.is_canonical(public_key, id) {
                    self.state.open_connections.remove(public_key);
                    self.state.clear_listen_timeout(public_key);
                    self.crawler
                        .envelope_handler
                        .quorum_set_manager()
                        .peer_node_disconnected(&mut self.state, public_key);
                }
            }
            None => {
                debug!(
                    peer = %task.address,
                    left_in_queue = self.queue.metrics().pending,
                    "Handshake failed"
                );
                self.state.failed_connections.push(task.address.key());
            }
        }
    }

    fn on_timer(&mut self, expired: Expired<CrawlTimer>) {
        let key = expired.key();
        match expired.into_inner() {
            CrawlTimer::Listen {
                public_key,
                connection,
                cycle,
            } => {
                if self.state.listen_timeouts.get(&public_key) == Some(&key) {
                    self.state.listen_timeouts.remove(&public_key);
                }
                self.on_listen_timeout(&public_key, connection, cycle);
            }
            CrawlTimer::QuorumSetRequest { public_key, hash } => {
                self.crawler
                    .envelope_handler
                    .quorum_set_manager()
                    .on_request_timeout(&mut self.state, &public_key, hash);
            }
        }
    }

    fn on_listen_timeout(&mut self, public_key: &NodeId, connection: ConnectionId, cycle: u32) {
        if !self.state.is_canonical(public_key, connection) {
            return;
        }
        let Some(task) = self.queue.task(connection) else {
            return;
        };
        if !task.state.is_live() {
            return;
        }
        let top_tier = task.top_tier;
        let ready = self.queue.ready_with_non_top_tier_peers();
        let listen = self.crawler.disconnect_timeout.listen_further(
            self.state.peer_nodes.get(public_key),
            cycle,
            top_tier,
            ready,
        );

        if listen {
            self.crawler
                .disconnect_timeout
                .start(&mut self.state, public_key, connection, cycle + 1);
            if let Some(task) = self.queue.task_mut(connection) {
                task.state = TaskState::Listening { cycle: cycle + 1 };
            }
        } else {
            debug!(pk = %short_node_id(public_key), cycle, "Done listening");
            self.disconnect(connection, None);
        }
    }

    fn on_max_crawl_time(&mut self) {
        error!("Max crawl time hit, closing all connections");
        self.state.max_crawl_time_hit = true;
        let dropped = self.queue.clear_pending();
        if dropped > 0 {
            warn!(dropped, "Discarding addresses left in crawl queue");
        }
        for id in self.queue.active_ids() {
            self.disconnect(id, None);
        }
    }

    fn disconnect(&mut self, id: ConnectionId, error: Option<&ConnectionError>) {
        let Some(task) = self.queue.task_mut(id) else {
            return;
        };
        let pk = task.public_key.as_ref().map(short_node_id).unwrap_or_default();
        match error {
            Some(error) => debug!(peer = %task.address, pk = %pk, error = %error, "Disconnecting"),
            None => trace!(peer = %task.address, pk = %pk, "Disconnecting"),
        }
        task.disconnect();
        // Listen periods end with the disconnect decision.
        if let Some(public_key) = task.public_key.clone() {
            if self.state.is_canonical(&public_key, id) {
                self.state.clear_listen_timeout(&public_key);
            }
        }
    }

    fn log_progress(&self) {
        let metrics = self.queue.metrics();
        info!(
            queue_length = metrics.pending,
            active = metrics.active,
            open_connections = self.state.open_connections.len(),
            peers = self.state.peer_nodes.len(),
            slots = self.state.slots.len(),
            closed_slots = self.state.slots.closed_slot_indexes().len(),
            "Crawl progress"
        );
    }

    fn wrap_up(self) -> Result<CrawlResult, CrawlerError> {
        if self.state.max_crawl_time_hit {
            return Err(CrawlerError::MaxCrawlTimeHit(self.crawler.config.max_crawl_time()));
        }

        let state = self.state;
        let metrics = self.queue.metrics();
        let peers: Vec<&PeerNode> = state.peer_nodes.values().collect();
        let count = |f: fn(&PeerNode) -> bool| peers.iter().filter(|peer| f(peer)).count();
        debug!(failed = ?state.failed_connections, "Failed connections");
        info!(
            connection_attempts = metrics.started,
            failed_connections = state.failed_connections.len(),
            detected_public_keys = peers.len(),
            successful_connections = count(|peer| peer.successfully_connected),
            top_tier_connections = state.top_tier_addresses.len(),
            validating_nodes = count(|peer| peer.is_validating),
            overloaded_nodes = count(|peer| peer.over_loaded),
            supplied_peer_list = count(|peer| peer.supplied_peer_list),
            closed_ledgers = state.slots.closed_slot_indexes().len(),
            latest_ledger = state.latest_closed_ledger.sequence,
            "Crawl finished"
        );

        let closed_ledgers = state.slots.closed_slot_indexes();
        Ok(CrawlResult {
            peers: state.peer_nodes.into_map(),
            closed_ledgers,
            latest_closed_ledger: state.latest_closed_ledger,
            quorum_sets: state.quorum_sets,
        })
    }
}

/// Relay one connection's events into the crawl loop, ending with exactly
/// one `Close` even if the connector drops its sender without one.
fn spawn_forwarder(
    id: ConnectionId,
    mut events: mpsc::Receiver<ConnectionEvent>,
    crawl_events: mpsc::Sender<(ConnectionId, ConnectionEvent)>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let closed = matches!(event, ConnectionEvent::Close);
            if crawl_events.send((id, event)).await.is_err() || closed {
                return;
            }
        }
        let _ = crawl_events.send((id, ConnectionEvent::Close)).await;
    });
}
