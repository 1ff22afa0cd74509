//! Downstream side of the river.
//!
//! The [`Indexer`] trait is the boundary to whatever consumes change events.
//! [`CheckpointIndexer`] is the bundled implementation: it logs each bulk and
//! records the last resume token of every source so tailers can resume.

use async_trait::async_trait;
use bson::Bson;
use mongodb::change_stream::event::ResumeToken;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::QueueEntry;
use crate::{Error, Result};

#[async_trait]
pub trait Indexer: Send + Sync {
    /// Last position of `source` that was indexed, if any.
    async fn resume_token(&self, source: &str) -> Result<Option<ResumeToken>>;

    /// Applies one bulk of change events.
    async fn index(&self, batch: Vec<QueueEntry>) -> Result<()>;
}

pub struct CheckpointIndexer {
    store: CheckpointStore,
    counts: Mutex<HashMap<String, u64>>,
}

impl CheckpointIndexer {
    pub fn new(store: CheckpointStore) -> Self {
        Self {
            store,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn bump(&self, source: &str, by: u64) -> u64 {
        let mut counts = match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = counts.entry(source.to_string()).or_insert(0);
        *count += by;
        *count
    }
}

#[async_trait]
impl Indexer for CheckpointIndexer {
    async fn resume_token(&self, source: &str) -> Result<Option<ResumeToken>> {
        let Some(checkpoint) = self.store.load(source).await? else {
            return Ok(None);
        };
        if checkpoint.resume_token.is_null() {
            return Ok(None);
        }
        let token = Bson::try_from(checkpoint.resume_token).map_err(|e| Error::Checkpoint {
            message: format!("Invalid resume token for {}: {}", source, e),
        })?;
        Ok(Some(bson::from_bson(token)?))
    }

    async fn index(&self, batch: Vec<QueueEntry>) -> Result<()> {
        let mut last: HashMap<String, (Option<ResumeToken>, u64)> = HashMap::new();
        for entry in batch {
            debug!(
                source = %entry.source,
                operation = entry.event.get_str("operationType").unwrap_or("unknown"),
                "Indexing change event"
            );
            let slot = last.entry(entry.source).or_insert((None, 0));
            if entry.resume_token.is_some() {
                slot.0 = entry.resume_token;
            }
            slot.1 += 1;
        }

        for (source, (token, indexed)) in last {
            let total = self.bump(&source, indexed);
            info!(source = %source, indexed, total, "Indexed bulk");
            if let Some(token) = token {
                let value = bson::to_bson(&token)?.into_relaxed_extjson();
                self.store
                    .save(&Checkpoint::new(source, value, total))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Drains the shared queue into `indexer` in bulks of up to `bulk_size`,
/// flushing partial bulks every `flush_interval`.
pub async fn run_indexer(
    mut queue: mpsc::Receiver<QueueEntry>,
    indexer: Arc<dyn Indexer>,
    bulk_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let bulk_size = bulk_size.max(1);
    let mut batch = Vec::with_capacity(bulk_size);
    let mut ticker = interval(flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(bulk_size, ?flush_interval, "Indexer started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = queue.recv() => match received {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= bulk_size {
                        flush(indexer.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(indexer.as_ref(), &mut batch).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        flush(indexer.as_ref(), &mut batch).await;
    }
    info!("Indexer stopped");
}

async fn flush(indexer: &dyn Indexer, batch: &mut Vec<QueueEntry>) {
    let bulk = std::mem::take(batch);
    let size = bulk.len();
    if let Err(e) = indexer.index(bulk).await {
        error!(size, error = %e, "Failed to index bulk");
    }
}
