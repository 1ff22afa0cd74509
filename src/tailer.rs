//! Tailers: one independent worker per data source.
//!
//! The supervisor only builds and starts tailers; once started a tailer runs
//! on its own task and nothing it does is reported back.

use async_trait::async_trait;
use bson::Document;
use futures::StreamExt;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::context::{QueueEntry, SharedContext};
use crate::endpoint::EndpointSet;
use crate::indexer::Indexer;
use crate::pool::PooledClient;
use crate::Result;

#[async_trait]
pub trait Tailer: Send + 'static {
    async fn run(self: Box<Self>);
}

/// Everything a tailer is built from.
pub struct TailerParts<C> {
    /// Worker label, e.g. `mongodb_river_slurper_shard0000:products`.
    pub label: String,
    /// Source label used for checkpoints and queue entries.
    pub source: String,
    pub client: Arc<PooledClient<C>>,
    pub definition: Arc<Config>,
    pub context: Arc<SharedContext>,
    pub indexer: Arc<dyn Indexer>,
}

pub trait TailerFactory<C>: Send + Sync {
    fn build(&self, parts: TailerParts<C>) -> Box<dyn Tailer>;
}

/// A started tailer.
#[derive(Debug)]
pub struct TailerHandle {
    label: String,
    endpoints: EndpointSet,
    task: JoinHandle<()>,
}

impl TailerHandle {
    pub(crate) fn start(label: String, endpoints: EndpointSet, tailer: Box<dyn Tailer>) -> Self {
        let span = info_span!("tailer", name = %label);
        let task = tokio::spawn(tailer.run().instrument(span));
        Self {
            label,
            endpoints,
            task,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Follows a source's change stream and forwards raw events to the queue.
pub struct ChangeStreamTailer {
    parts: TailerParts<mongodb::Client>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeStreamTailerFactory;

impl TailerFactory<mongodb::Client> for ChangeStreamTailerFactory {
    fn build(&self, parts: TailerParts<mongodb::Client>) -> Box<dyn Tailer> {
        Box::new(ChangeStreamTailer { parts })
    }
}

impl ChangeStreamTailer {
    async fn open(&self) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        let TailerParts {
            source,
            client,
            definition,
            indexer,
            ..
        } = &self.parts;

        let token = match indexer.resume_token(source).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Could not load resume token, starting from now");
                None
            }
        };
        if token.is_some() {
            info!("Resuming change stream from checkpoint");
        }

        let client = client.client();
        let stream = match (&definition.mongodb.database, &definition.mongodb.collection) {
            (Some(db), Some(coll)) => {
                let collection = client.database(db).collection::<Document>(coll);
                let mut watch = collection.watch();
                if let Some(token) = token {
                    watch = watch.resume_after(token);
                }
                watch.await?
            }
            (Some(db), None) => {
                let database = client.database(db);
                let mut watch = database.watch();
                if let Some(token) = token {
                    watch = watch.resume_after(token);
                }
                watch.await?
            }
            _ => {
                let mut watch = client.watch();
                if let Some(token) = token {
                    watch = watch.resume_after(token);
                }
                watch.await?
            }
        };
        Ok(stream)
    }
}

#[async_trait]
impl Tailer for ChangeStreamTailer {
    async fn run(self: Box<Self>) {
        info!(endpoints = %self.parts.client.endpoints(), "Tailer starting");

        let mut stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Failed to open change stream");
                return;
            }
        };

        let context = &self.parts.context;
        while !context.is_stopped() {
            let event = match stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(error = %e, "Change stream failed");
                    break;
                }
                None => break,
            };

            let event = match bson::to_document(&event) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "Skipping unencodable change event");
                    continue;
                }
            };

            let entry = QueueEntry {
                source: self.parts.source.clone(),
                event,
                resume_token: stream.resume_token(),
            };
            if context.queue().send(entry).await.is_err() {
                info!("Queue closed");
                break;
            }
        }

        info!("Tailer stopped");
    }
}
