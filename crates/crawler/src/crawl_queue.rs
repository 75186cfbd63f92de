//! Bounded pool of connection tasks.
//!
//! Every address the crawl decides to visit becomes a [`CrawlTask`]. At most
//! `max_active` tasks hold a connection at once; the rest wait in FIFO order
//! and start as active ones complete.
//!
//! # Task Lifecycle
//!
//! ```text
//! Pending -> Connecting -> Connected -> Listening(n) -> Disconnecting -> Closed
//!                 |             |             |
//!                 +-------------+-------------+--> Closed (error, timeout, close)
//! ```
//!
//! A task is only removed from the pool by [`CrawlQueue::complete`], which
//! the crawler calls for the connection's `Close` event. Connections always
//! end with one, so the pool cannot leak slots.

use std::collections::{HashMap, VecDeque};

use stellar_xdr::curr::NodeId;

use crate::connection::{ConnectionHandle, ConnectionId, NodeAddress};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, no connection yet.
    Pending,
    /// Connection requested, handshake not finished.
    Connecting,
    /// Handshake done, identity accepted.
    Connected,
    /// Listen cycle `cycle` is running.
    Listening { cycle: u32 },
    /// Destroy requested, waiting for `Close`.
    Disconnecting,
    Closed,
}

impl TaskState {
    /// Whether the task holds a live connection that still processes frames.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Listening { .. }
        )
    }
}

/// One connection attempt.
#[derive(Debug)]
pub struct CrawlTask {
    pub id: ConnectionId,
    pub address: NodeAddress,
    /// Identity proven in the handshake.
    pub public_key: Option<NodeId>,
    /// Decided once at connect time.
    pub top_tier: bool,
    pub state: TaskState,
    pub handle: ConnectionHandle,
}

impl CrawlTask {
    /// Request the connection be torn down. Idempotent.
    pub fn disconnect(&mut self) {
        if matches!(self.state, TaskState::Disconnecting | TaskState::Closed) {
            return;
        }
        self.state = TaskState::Disconnecting;
        self.handle.destroy();
    }
}

/// Counters for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlQueueMetrics {
    pub pending: usize,
    pub active: usize,
    pub started: usize,
    pub completed: usize,
}

#[derive(Debug)]
pub struct CrawlQueue {
    pending: VecDeque<NodeAddress>,
    active: HashMap<ConnectionId, CrawlTask>,
    max_active: usize,
    next_id: u64,
    started: usize,
    completed: usize,
}

impl CrawlQueue {
    pub fn new(max_active: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            max_active: max_active.max(1),
            next_id: 1,
            started: 0,
            completed: 0,
        }
    }

    pub fn push(&mut self, address: NodeAddress) {
        self.pending.push_back(address);
    }

    /// Take the next pending address if a slot is free, reserving an id.
    pub fn next_startable(&mut self) -> Option<(ConnectionId, NodeAddress)> {
        if self.active.len() >= self.max_active {
            return None;
        }
        let address = self.pending.pop_front()?;
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        Some((id, address))
    }

    /// Register a task whose connection was just requested.
    pub fn start(&mut self, id: ConnectionId, address: NodeAddress, handle: ConnectionHandle) {
        self.started += 1;
        self.active.insert(
            id,
            CrawlTask {
                id,
                address,
                public_key: None,
                top_tier: false,
                state: TaskState::Connecting,
                handle,
            },
        );
    }

    /// Remove a finished task and free its slot.
    pub fn complete(&mut self, id: ConnectionId) -> Option<CrawlTask> {
        let mut task = self.active.remove(&id)?;
        task.state = TaskState::Closed;
        self.completed += 1;
        Some(task)
    }

    pub fn task(&self, id: ConnectionId) -> Option<&CrawlTask> {
        self.active.get(&id)
    }

    pub fn task_mut(&mut self, id: ConnectionId) -> Option<&mut CrawlTask> {
        self.active.get_mut(&id)
    }

    pub fn active_ids(&self) -> Vec<ConnectionId> {
        self.active.keys().copied().collect()
    }

    /// Nothing pending and nothing active.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    /// Only top tier connections are left, so they may be released.
    pub fn ready_with_non_top_tier_peers(&self) -> bool {
        self.pending.is_empty() && self.active.values().all(|task| task.top_tier)
    }

    /// Drop every pending address, returning how many were dropped.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn metrics(&self) -> CrawlQueueMetrics {
        CrawlQueueMetrics {
            pending: self.pending.len(),
            active: self.active.len(),
            started: self.started,
            completed: self.completed,
        }
    }
}
