//! Keyed pool of long-lived driver clients.
//!
//! One client exists per distinct [`EndpointSet`] for the lifetime of the
//! pool. Clients are built without holding any lock, so two callers asking
//! for the same endpoints at the same time may both build one; the first to
//! publish wins and the other closes its candidate.
//!
//! `close_all` is meant for process teardown. Calling `get` concurrently
//! with `close_all` is not supported: a client published after the drain
//! stays open.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::Credentials;
use crate::endpoint::EndpointSet;
use crate::{Error, Result};

/// Builds and tears down driver clients.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Clone + Send + Sync + 'static;

    /// Establishes a client for `endpoints` with the connector's own settings.
    async fn connect(&self, endpoints: &EndpointSet) -> Result<Self::Client>;

    /// Establishes a client authenticating with `credentials`.
    async fn connect_with_credentials(
        &self,
        endpoints: &EndpointSet,
        credentials: &Credentials,
    ) -> Result<Self::Client>;

    async fn close(&self, client: Self::Client);
}

/// A live client and the endpoints it was created for.
pub struct PooledClient<C> {
    endpoints: EndpointSet,
    client: C,
}

impl<C> PooledClient<C> {
    pub(crate) fn new(endpoints: EndpointSet, client: C) -> Self {
        Self { endpoints, client }
    }

    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C> fmt::Debug for PooledClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledClient")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

pub struct ConnectionPool<K: Connector> {
    connector: K,
    clients: DashMap<EndpointSet, Arc<PooledClient<K::Client>>>,
}

impl<K: Connector> ConnectionPool<K> {
    pub fn new(connector: K) -> Self {
        Self {
            connector,
            clients: DashMap::new(),
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// Returns the pooled client for `endpoints`, creating it on first use.
    ///
    /// Every caller observes the same `Arc` for a given endpoint set.
    #[instrument(skip(self, endpoints), fields(endpoints = %endpoints))]
    pub async fn get(&self, endpoints: &EndpointSet) -> Result<Arc<PooledClient<K::Client>>> {
        debug_assert!(!endpoints.is_empty(), "pool key must not be empty");
        if endpoints.is_empty() {
            return Err(Error::EmptyEndpointSet);
        }

        if let Some(existing) = self.clients.get(endpoints) {
            return Ok(Arc::clone(existing.value()));
        }

        info!("Creating MongoDB client for {}", endpoints);
        let candidate = self.connector.connect(endpoints).await?;

        // The entry guard is released before closing the loser.
        let outcome = match self.clients.entry(endpoints.clone()) {
            Entry::Occupied(entry) => Err(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let pooled = Arc::new(PooledClient::new(endpoints.clone(), candidate.clone()));
                entry.insert(Arc::clone(&pooled));
                Ok(pooled)
            }
        };

        match outcome {
            Ok(pooled) => Ok(pooled),
            Err(winner) => {
                info!("Raced in creating MongoDB client for {}", endpoints);
                self.connector.close(candidate).await;
                Ok(winner)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Closes every pooled client. Safe to call more than once.
    pub async fn close_all(&self) {
        let keys: Vec<EndpointSet> = self.clients.iter().map(|e| e.key().clone()).collect();
        if keys.is_empty() {
            debug!("Connection pool already empty");
            return;
        }

        info!(count = keys.len(), "Closing pooled MongoDB clients");
        for key in keys {
            if let Some((_, pooled)) = self.clients.remove(&key) {
                debug!(endpoints = %key, "Closing client");
                self.connector.close(pooled.client.clone()).await;
            }
        }
    }
}
