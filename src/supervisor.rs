//! Startup supervisor.
//!
//! One run classifies the deployment, lists its data sources (every shard,
//! or the seed deployment itself), builds one tailer per source and starts
//! them all. Each run is split into attempts; an attempt that fails on the
//! network is thrown away and the next one starts over from classification.
//!
//! ```text
//! Classifying ──► Enumerating ──┐
//!      │                        ├──► Starting ──► Done
//!      └────────► SingleSource ─┘
//!   ▲   │
//!   └───┘ transient network failure      other failure ──► Failed
//! ```
//!
//! The supervisor does not watch the tailers once they are started.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, SupervisorConfig};
use crate::context::{RiverStatus, SharedContext};
use crate::endpoint::{parse_seeds, DnsResolver, HostResolver, NoopResolver};
use crate::indexer::Indexer;
use crate::mongo::DriverClient;
use crate::pool::{Connector, ConnectionPool, PooledClient};
use crate::tailer::{TailerFactory, TailerHandle, TailerParts};
use crate::topology::{AdminAccess, ShardEnumerator, TopologyClassifier};
use crate::{Error, FailureKind, Result};

/// Where an attempt currently is; used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classifying,
    Enumerating,
    SingleSource,
    Starting,
    Done,
    Failed,
}

/// How many attempts to make and how long to wait between them.
///
/// The default retries forever without delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }
}

impl From<&SupervisorConfig> for RetryPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max_backoff.max(self.initial_backoff);
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(cap)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// How a supervisor run ended.
#[derive(Debug)]
pub enum SupervisorOutcome {
    /// Every tailer of the successful attempt was started.
    Started(Vec<TailerHandle>),
    /// Cancelled before anything was started.
    Interrupted,
    /// A non-retryable error.
    Failed(Error),
    /// The retry policy gave up on transient failures.
    RetriesExhausted { attempts: u32, last_error: Error },
}

/// A data source found by a successful attempt. Tailers are only built
/// once the whole attempt has succeeded.
struct PendingSource<C> {
    label: String,
    source: String,
    client: Arc<PooledClient<C>>,
}

pub struct TailerSupervisor<K: Connector, F> {
    pool: Arc<ConnectionPool<K>>,
    resolver: Arc<dyn HostResolver>,
    definition: Arc<Config>,
    context: Arc<SharedContext>,
    indexer: Arc<dyn Indexer>,
    factory: F,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<K, F> TailerSupervisor<K, F>
where
    K: Connector,
    K::Client: DriverClient,
    F: TailerFactory<K::Client>,
{
    pub fn new(
        pool: Arc<ConnectionPool<K>>,
        definition: Arc<Config>,
        context: Arc<SharedContext>,
        indexer: Arc<dyn Indexer>,
        factory: F,
    ) -> Self {
        let resolver: Arc<dyn HostResolver> = if definition.mongodb.resolve_hosts {
            Arc::new(DnsResolver)
        } else {
            Arc::new(NoopResolver)
        };
        let policy = RetryPolicy::from(&definition.supervisor);

        Self {
            pool,
            resolver,
            definition,
            context,
            indexer,
            factory,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Token that interrupts the run when cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs attempts until tailers are started or the run is abandoned.
    pub async fn run(self) -> SupervisorOutcome {
        info!(index = %self.definition.index_name(), "Tailer supervisor starting");
        self.context.set_status(RiverStatus::Starting);

        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let error = match self.attempt(attempts).await {
                Ok(sources) if self.cancel.is_cancelled() => {
                    info!(discarded = sources.len(), "Interrupted before starting tailers");
                    return self.finish(SupervisorOutcome::Interrupted);
                }
                Ok(sources) => {
                    debug!(stage = ?Stage::Starting, count = sources.len(), "Starting tailers");
                    let handles: Vec<TailerHandle> =
                        sources.into_iter().map(|source| self.start(source)).collect();
                    info!(stage = ?Stage::Done, count = handles.len(), "All tailers started");
                    return self.finish(SupervisorOutcome::Started(handles));
                }
                Err(e) => e,
            };

            match error.failure_kind() {
                FailureKind::Interrupted if self.cancel.is_cancelled() => {
                    info!("Startup interrupted");
                    return self.finish(SupervisorOutcome::Interrupted);
                }
                FailureKind::Interrupted => {
                    error!(error = %error, "Mongo driver has been interrupted");
                    return self.finish(SupervisorOutcome::Interrupted);
                }
                FailureKind::ProtocolFatal => {
                    error!(stage = ?Stage::Failed, error = %error, "Mongo gave an exception: giving up");
                    return self.finish(SupervisorOutcome::Failed(error));
                }
                FailureKind::TransientNetwork => {
                    warn!(attempt = attempts, error = %error, "Mongo gave a network exception");
                    if self.policy.exhausted(attempts) {
                        error!(attempts, "Giving up after repeated network failures");
                        return self.finish(SupervisorOutcome::RetriesExhausted {
                            attempts,
                            last_error: error,
                        });
                    }

                    let delay = self.policy.delay_after(attempts);
                    if !delay.is_zero() {
                        debug!(?delay, "Backing off before next attempt");
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                info!("Interrupted while backing off");
                                return self.finish(SupervisorOutcome::Interrupted);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, outcome: SupervisorOutcome) -> SupervisorOutcome {
        let status = match &outcome {
            SupervisorOutcome::Started(_) => RiverStatus::Running,
            SupervisorOutcome::Interrupted => RiverStatus::Stopped,
            SupervisorOutcome::Failed(_) | SupervisorOutcome::RetriesExhausted { .. } => {
                RiverStatus::StartFailed
            }
        };
        self.context.set_status(status);
        outcome
    }

    /// One pass from classification to the list of sources to tail.
    ///
    /// Cancellation is observed here rather than by dropping the attempt, so
    /// the admin session is always released.
    async fn attempt(&self, attempt: u32) -> Result<Vec<PendingSource<K::Client>>> {
        debug!(attempt, stage = ?Stage::Classifying, "Startup attempt");

        let seeds = parse_seeds(&self.definition.mongodb.servers);
        if seeds.is_empty() {
            return Err(Error::Config("mongodb.servers has no valid host".to_string()));
        }
        let seed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Interrupted),
            seed = self.pool.get(&seeds) => seed?,
        };

        let mut admin = AdminAccess::new(
            self.pool.connector(),
            seed,
            self.definition.admin_credentials(),
        );
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Interrupted),
            result = self.discover(&mut admin) => result,
        };
        admin.release().await;
        result
    }

    async fn discover(
        &self,
        admin: &mut AdminAccess<'_, K>,
    ) -> Result<Vec<PendingSource<K::Client>>> {
        let verdict = TopologyClassifier::new(self.definition.is_mongos())
            .classify(admin)
            .await?;
        debug!(?verdict, "Topology classified");

        if verdict.is_sharded() {
            self.enumerate(admin).await
        } else {
            trace!(stage = ?Stage::SingleSource, "Not mongos");
            let label = format!("mongodb_river_slurper:{}", self.definition.index_name());
            let source = self.definition.river.name.clone();
            let client = Arc::clone(admin.seed());
            Ok(vec![PendingSource {
                label,
                source,
                client,
            }])
        }
    }

    async fn enumerate(
        &self,
        admin: &mut AdminAccess<'_, K>,
    ) -> Result<Vec<PendingSource<K::Client>>> {
        debug!(stage = ?Stage::Enumerating, "Listing shards");
        let config_client = admin.config_client().await;
        let mut shards = ShardEnumerator::open(&config_client, self.resolver.as_ref()).await?;

        let mut pending = Vec::new();
        while let Some(shard) = shards.next_shard().await {
            let shard = shard?;
            let name = shard.descriptor.name;
            if shard.endpoints.is_empty() {
                warn!(shard = %name, host = %shard.descriptor.host, "No usable host for shard, skipping");
                continue;
            }

            let client = self.pool.get(&shard.endpoints).await?;
            let label = format!(
                "mongodb_river_slurper_{}:{}",
                name,
                self.definition.index_name()
            );
            pending.push(PendingSource {
                label,
                source: name,
                client,
            });
        }

        if pending.is_empty() {
            warn!("No shard produced a tailer");
        }
        Ok(pending)
    }

    fn start(&self, pending: PendingSource<K::Client>) -> TailerHandle {
        let PendingSource {
            label,
            source,
            client,
        } = pending;
        let endpoints = client.endpoints().clone();
        let tailer = self.factory.build(TailerParts {
            label: label.clone(),
            source,
            client,
            definition: Arc::clone(&self.definition),
            context: Arc::clone(&self.context),
            indexer: Arc::clone(&self.indexer),
        });
        info!(tailer = %label, endpoints = %endpoints, "Starting tailer");
        TailerHandle::start(label, endpoints, tailer)
    }
}
