//! Scripted stand-ins for the driver, tailers and indexer.

use async_trait::async_trait;
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::change_stream::event::ResumeToken;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Barrier};

use crate::config::{
    Config, Credentials, IndexerConfig, MongoConfig, RiverConfig, SupervisorConfig,
};
use crate::context::QueueEntry;
use crate::endpoint::EndpointSet;
use crate::indexer::Indexer;
use crate::mongo::{DocumentStream, DriverClient};
use crate::pool::Connector;
use crate::tailer::{Tailer, TailerFactory, TailerParts};
use crate::{Error, Result};

pub fn network_error() -> Error {
    Error::Network("connection reset by peer".to_string())
}

pub fn admin_credentials() -> Credentials {
    Credentials {
        username: "root".to_string(),
        password: "secret".to_string(),
        source: "admin".to_string(),
    }
}

pub fn test_config() -> Config {
    Config {
        mongodb: MongoConfig {
            servers: vec!["seed:27017".to_string()],
            user: String::new(),
            password: String::new(),
            auth_database: String::new(),
            admin_user: String::new(),
            admin_password: String::new(),
            admin_auth_database: String::new(),
            is_mongos: None,
            database: None,
            collection: None,
            connect_timeout_secs: 1,
            server_selection_timeout_secs: 1,
            max_pool_size: 4,
            resolve_hosts: false,
        },
        river: RiverConfig {
            name: "mongodb".to_string(),
            index_name: "idx".to_string(),
        },
        supervisor: SupervisorConfig::default(),
        indexer: IndexerConfig::default(),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

/// What the mocked deployment answers.
pub struct MockDeployment {
    status: Mutex<Document>,
    status_failures: Mutex<VecDeque<fn() -> Error>>,
    shards: Mutex<Vec<Document>>,
    find_failures: Mutex<VecDeque<fn() -> Error>>,
    cursor_failures: Mutex<VecDeque<(usize, fn() -> Error)>>,
    hang_find: AtomicBool,
    commands: Mutex<Vec<(String, Document)>>,
    reject_credentials: AtomicBool,
}

impl Default for MockDeployment {
    fn default() -> Self {
        Self {
            status: Mutex::new(doc! { "ok": 1.0, "version": "7.0.0", "process": "mongod" }),
            status_failures: Mutex::new(VecDeque::new()),
            shards: Mutex::new(Vec::new()),
            find_failures: Mutex::new(VecDeque::new()),
            cursor_failures: Mutex::new(VecDeque::new()),
            hang_find: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            reject_credentials: AtomicBool::new(false),
        }
    }
}

impl MockDeployment {
    pub fn set_status(&self, reply: Document) {
        *lock(&self.status) = reply;
    }

    /// The next `serverStatus` fails with `make()`.
    pub fn push_status_failure(&self, make: fn() -> Error) {
        lock(&self.status_failures).push_back(make);
    }

    pub fn set_shards(&self, shards: Vec<Document>) {
        *lock(&self.shards) = shards;
    }

    /// The next `find` fails with `make()`.
    pub fn push_find_failure(&self, make: fn() -> Error) {
        lock(&self.find_failures).push_back(make);
    }

    /// The next cursor yields `after` documents, then fails with `make()`.
    pub fn push_cursor_failure(&self, after: usize, make: fn() -> Error) {
        lock(&self.cursor_failures).push_back((after, make));
    }

    /// Every `find` from now on never returns.
    pub fn hang_find(&self) {
        self.hang_find.store(true, Ordering::SeqCst);
    }

    pub fn reject_credentials(&self) {
        self.reject_credentials.store(true, Ordering::SeqCst);
    }

    /// Every command run so far, with its database.
    pub fn commands(&self) -> Vec<(String, Document)> {
        lock(&self.commands).clone()
    }
}

#[derive(Clone)]
pub struct MockClient {
    pub id: usize,
    pub credentialed: bool,
    deployment: Arc<MockDeployment>,
}

#[async_trait]
impl DriverClient for MockClient {
    async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
        lock(&self.deployment.commands).push((database.to_string(), command.clone()));

        if command.contains_key("connectionStatus") {
            let accepted =
                self.credentialed && !self.deployment.reject_credentials.load(Ordering::SeqCst);
            let users: Vec<Document> = if accepted {
                vec![doc! { "user": "root", "db": database }]
            } else {
                Vec::new()
            };
            return Ok(doc! { "ok": 1.0, "authInfo": { "authenticatedUsers": users } });
        }

        if let Some(make) = lock(&self.deployment.status_failures).pop_front() {
            return Err(make());
        }
        Ok(lock(&self.deployment.status).clone())
    }

    async fn find(&self, _database: &str, _collection: &str) -> Result<DocumentStream> {
        if let Some(make) = lock(&self.deployment.find_failures).pop_front() {
            return Err(make());
        }
        if self.deployment.hang_find.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let docs = lock(&self.deployment.shards).clone();
        let failure = lock(&self.deployment.cursor_failures).pop_front();
        match failure {
            Some((after, make)) => {
                let items: Vec<Result<Document>> = docs
                    .into_iter()
                    .take(after)
                    .map(Ok)
                    .chain(std::iter::once(Err(make())))
                    .collect();
                Ok(futures::stream::iter(items).boxed())
            }
            None => Ok(futures::stream::iter(docs.into_iter().map(Ok)).boxed()),
        }
    }
}

struct ConnectorState {
    deployment: Arc<MockDeployment>,
    next_id: AtomicUsize,
    credentialed: AtomicUsize,
    closed: Mutex<Vec<usize>>,
    barrier: Option<Barrier>,
    always_fail: bool,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    fn build(barrier: Option<Barrier>, always_fail: bool) -> Self {
        Self {
            state: Arc::new(ConnectorState {
                deployment: Arc::new(MockDeployment::default()),
                next_id: AtomicUsize::new(0),
                credentialed: AtomicUsize::new(0),
                closed: Mutex::new(Vec::new()),
                barrier,
                always_fail,
            }),
        }
    }

    pub fn new() -> Self {
        Self::build(None, false)
    }

    /// Every `connect` waits until `callers` connects are in flight.
    pub fn with_barrier(callers: usize) -> Self {
        Self::build(Some(Barrier::new(callers)), false)
    }

    pub fn failing() -> Self {
        Self::build(None, true)
    }

    pub fn deployment(&self) -> &MockDeployment {
        &self.state.deployment
    }

    /// Number of clients created, credentialed or not.
    pub fn created(&self) -> usize {
        self.state.next_id.load(Ordering::SeqCst)
    }

    pub fn credentialed(&self) -> usize {
        self.state.credentialed.load(Ordering::SeqCst)
    }

    pub fn closed_ids(&self) -> Vec<usize> {
        lock(&self.state.closed).clone()
    }

    fn new_client(&self, credentialed: bool) -> MockClient {
        MockClient {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            credentialed,
            deployment: Arc::clone(&self.state.deployment),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Client = MockClient;

    async fn connect(&self, _endpoints: &EndpointSet) -> Result<MockClient> {
        if self.state.always_fail {
            return Err(network_error());
        }
        let client = self.new_client(false);
        if let Some(barrier) = &self.state.barrier {
            barrier.wait().await;
        }
        Ok(client)
    }

    async fn connect_with_credentials(
        &self,
        _endpoints: &EndpointSet,
        _credentials: &Credentials,
    ) -> Result<MockClient> {
        if self.state.always_fail {
            return Err(network_error());
        }
        self.state.credentialed.fetch_add(1, Ordering::SeqCst);
        Ok(self.new_client(true))
    }

    async fn close(&self, client: MockClient) {
        lock(&self.state.closed).push(client.id);
    }
}

struct FactoryState {
    sources: Mutex<Vec<String>>,
    runs_tx: mpsc::UnboundedSender<String>,
    runs_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

/// Builds tailers that report their label when run.
#[derive(Clone)]
pub struct MockTailerFactory {
    state: Arc<FactoryState>,
}

impl MockTailerFactory {
    pub fn new() -> Self {
        let (runs_tx, runs_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(FactoryState {
                sources: Mutex::new(Vec::new()),
                runs_tx,
                runs_rx: tokio::sync::Mutex::new(runs_rx),
            }),
        }
    }

    pub fn built(&self) -> usize {
        lock(&self.state.sources).len()
    }

    pub fn sources(&self) -> Vec<String> {
        lock(&self.state.sources).clone()
    }

    /// Waits until `count` tailers have run and returns their labels.
    pub async fn wait_for_runs(&self, count: usize) -> Vec<String> {
        let mut rx = self.state.runs_rx.lock().await;
        let mut labels = Vec::with_capacity(count);
        while labels.len() < count {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(label)) => labels.push(label),
                _ => break,
            }
        }
        labels
    }
}

struct MockTailer {
    label: String,
    runs: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Tailer for MockTailer {
    async fn run(self: Box<Self>) {
        let _ = self.runs.send(self.label.clone());
    }
}

impl<C: Send + Sync + 'static> TailerFactory<C> for MockTailerFactory {
    fn build(&self, parts: TailerParts<C>) -> Box<dyn Tailer> {
        lock(&self.state.sources).push(parts.source);
        Box::new(MockTailer {
            label: parts.label,
            runs: self.state.runs_tx.clone(),
        })
    }
}

pub struct MockIndexer;

#[async_trait]
impl Indexer for MockIndexer {
    async fn resume_token(&self, _source: &str) -> Result<Option<ResumeToken>> {
        Ok(None)
    }

    async fn index(&self, _batch: Vec<QueueEntry>) -> Result<()> {
        Ok(())
    }
}
