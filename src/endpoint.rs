//! Server endpoints and the host specifications that describe them.
//!
//! An [`EndpointSet`] identifies one data source: a single node, or the
//! members of one replica set. It is the key under which the connection pool
//! keeps its clients, so equality is order-sensitive.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const DEFAULT_PORT: u16 = 27017;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6addr]` or `[v6addr]:port`.
    pub fn parse(token: &str) -> Result<Self> {
        let token = token.trim();
        let invalid = |reason: &str| Error::InvalidEndpoint {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = if let Some(rest) = token.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid("unterminated '['"))?;
            match tail {
                "" => (host, None),
                _ => (
                    host,
                    Some(tail.strip_prefix(':').ok_or_else(|| invalid("expected ':' after ']'"))?),
                ),
            }
        } else {
            match token.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (token, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| invalid(&format!("bad port: {}", e)))?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Ordered, immutable list of endpoints. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointSet(Arc<[Endpoint]>);

impl EndpointSet {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self(endpoints.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Endpoint] {
        &self.0
    }
}

impl FromIterator<Endpoint> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for EndpointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, endpoint) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", endpoint)?;
        }
        f.write_str("]")
    }
}

/// Checks that an endpoint's host is resolvable.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, endpoint: &Endpoint) -> Result<()>;
}

/// Resolves through the system resolver; at least one address is required.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, endpoint: &Endpoint) -> Result<()> {
        let unknown = |reason: String| Error::UnknownHost {
            host: endpoint.host.clone(),
            reason,
        };

        let mut addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| unknown(e.to_string()))?;

        match addrs.next() {
            Some(addr) => {
                debug!(endpoint = %endpoint, %addr, "Resolved host");
                Ok(())
            }
            None => Err(unknown("no addresses".to_string())),
        }
    }
}

/// Accepts every syntactically valid endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

#[async_trait]
impl HostResolver for NoopResolver {
    async fn resolve(&self, _endpoint: &Endpoint) -> Result<()> {
        Ok(())
    }
}

/// Strips an optional `replicaSetName/` prefix and splits the host list.
///
/// Only the first `/` is significant.
pub fn split_host_spec(spec: &str) -> impl Iterator<Item = &str> {
    let hosts = match spec.split_once('/') {
        Some((_, hosts)) => hosts,
        None => spec,
    };
    hosts.split(',').map(str::trim).filter(|t| !t.is_empty())
}

/// Turns a host specification into the endpoints that parse and resolve.
///
/// Bad tokens are dropped with a warning; the result may be empty.
pub async fn resolve_host_spec(spec: &str, resolver: &dyn HostResolver) -> EndpointSet {
    debug!(spec, "Resolving host specification");

    let mut endpoints = Vec::new();
    for token in split_host_spec(spec) {
        let endpoint = match Endpoint::parse(token) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(token, error = %e, "Dropping unparsable host");
                continue;
            }
        };
        match resolver.resolve(&endpoint).await {
            Ok(()) => endpoints.push(endpoint),
            Err(e) => warn!(endpoint = %endpoint, error = %e, "Dropping unresolvable host"),
        }
    }

    EndpointSet::new(endpoints)
}

/// Parses the configured seed list. Name resolution is left to the driver.
pub fn parse_seeds(servers: &[String]) -> EndpointSet {
    servers
        .iter()
        .filter_map(|token| match Endpoint::parse(token) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(token = %token, error = %e, "Ignoring invalid seed");
                None
            }
        })
        .collect()
}
