//! State shared between the supervisor, its tailers and the indexer.

use bson::Document;
use mongodb::change_stream::event::ResumeToken;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle of the river as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiverStatus {
    Unknown,
    Starting,
    Running,
    StartFailed,
    Stopped,
}

/// One raw change event on its way to the indexer.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Label of the source (shard name, or the river name when unsharded).
    pub source: String,
    pub event: Document,
    pub resume_token: Option<ResumeToken>,
}

/// Queue from tailers to the indexer plus the river status.
pub struct SharedContext {
    queue: mpsc::Sender<QueueEntry>,
    status: RwLock<RiverStatus>,
}

impl SharedContext {
    /// Creates a context whose queue holds at most `capacity` entries.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueueEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let context = Self {
            queue: tx,
            status: RwLock::new(RiverStatus::Unknown),
        };
        (context, rx)
    }

    pub fn queue(&self) -> &mpsc::Sender<QueueEntry> {
        &self.queue
    }

    pub fn status(&self) -> RiverStatus {
        match self.status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_status(&self, status: RiverStatus) {
        debug!(?status, "River status changed");
        match self.status.write() {
            Ok(mut guard) => *guard = status,
            Err(poisoned) => *poisoned.into_inner() = status,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.status() == RiverStatus::Stopped
    }
}
