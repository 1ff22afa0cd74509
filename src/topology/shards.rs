//! Shard discovery from the cluster's `config.shards` collection.

use bson::{Bson, Document};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::config::CONFIG_DATABASE;
use crate::endpoint::{resolve_host_spec, EndpointSet, HostResolver};
use crate::mongo::{DocumentStream, DriverClient};
use crate::Result;

pub const SHARDS_COLLECTION: &str = "shards";

/// A shard as listed in cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub name: String,
    /// Raw host specification, e.g. `rs0/h1:27017,h2:27017`.
    pub host: String,
}

impl ShardDescriptor {
    pub fn from_document(doc: &Document) -> Option<Self> {
        let name = match doc.get("_id")? {
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        };
        let host = doc.get_str("host").ok()?.to_string();
        Some(Self { name, host })
    }
}

/// A shard and the endpoints that resolved for it (possibly none).
#[derive(Debug, Clone)]
pub struct Shard {
    pub descriptor: ShardDescriptor,
    pub endpoints: EndpointSet,
}

/// Walks `config.shards` one document at a time.
///
/// The server cursor is released when the enumerator is dropped.
pub struct ShardEnumerator<'r> {
    cursor: DocumentStream,
    resolver: &'r dyn HostResolver,
}

impl<'r> ShardEnumerator<'r> {
    pub async fn open<C: DriverClient>(client: &C, resolver: &'r dyn HostResolver) -> Result<Self> {
        let cursor = client.find(CONFIG_DATABASE, SHARDS_COLLECTION).await?;
        Ok(Self { cursor, resolver })
    }

    /// The next shard, `None` once the cursor is exhausted.
    ///
    /// Documents without a usable `host` are skipped.
    pub async fn next_shard(&mut self) -> Option<Result<Shard>> {
        loop {
            let doc = match self.cursor.next().await? {
                Ok(doc) => doc,
                Err(e) => return Some(Err(e)),
            };
            debug!("shards: {}", doc);

            let Some(descriptor) = ShardDescriptor::from_document(&doc) else {
                warn!("Skipping shard document without _id/host: {}", doc);
                continue;
            };

            let endpoints = resolve_host_spec(&descriptor.host, self.resolver).await;
            return Some(Ok(Shard {
                descriptor,
                endpoints,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, NoopResolver};
    use crate::test_utils::{network_error, MockConnector, MockDeployment};
    use crate::pool::Connector;
    use crate::Error;
    use bson::doc;

    async fn client_for(deployment_setup: impl FnOnce(&MockDeployment)) -> crate::test_utils::MockClient {
        let connector = MockConnector::new();
        deployment_setup(connector.deployment());
        connector
            .connect(&EndpointSet::new(vec![Endpoint::new("mongos", 27017)]))
            .await
            .unwrap()
    }

    #[test]
    fn test_descriptor_from_document() {
        let d = ShardDescriptor::from_document(&doc! { "_id": "shard0000", "host": "rs0/h1:1" }).unwrap();
        assert_eq!(d.name, "shard0000");
        assert_eq!(d.host, "rs0/h1:1");

        assert!(ShardDescriptor::from_document(&doc! { "_id": "shard0001" }).is_none());
        assert!(ShardDescriptor::from_document(&doc! { "host": "h1" }).is_none());
    }

    #[tokio::test]
    async fn test_enumerates_all_shards_in_order() {
        let client = client_for(|d| {
            d.set_shards(vec![
                doc! { "_id": "shard0000", "host": "rs0/h1:27017,h2:27018" },
                doc! { "_id": "shard0001", "host": "h3:27019" },
            ])
        })
        .await;

        let mut shards = ShardEnumerator::open(&client, &NoopResolver).await.unwrap();

        let first = shards.next_shard().await.unwrap().unwrap();
        assert_eq!(first.descriptor.name, "shard0000");
        assert_eq!(
            first.endpoints,
            EndpointSet::new(vec![Endpoint::new("h1", 27017), Endpoint::new("h2", 27018)])
        );

        let second = shards.next_shard().await.unwrap().unwrap();
        assert_eq!(second.descriptor.name, "shard0001");
        assert_eq!(second.endpoints, EndpointSet::new(vec![Endpoint::new("h3", 27019)]));

        assert!(shards.next_shard().await.is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_shard_yields_empty_set_and_continues() {
        let client = client_for(|d| {
            d.set_shards(vec![
                doc! { "_id": "broken" },
                doc! { "_id": "shard0000", "host": "rs0/bad::host" },
                doc! { "_id": "shard0001", "host": "rs1/bad::host,h2:27018" },
            ])
        })
        .await;

        let mut shards = ShardEnumerator::open(&client, &NoopResolver).await.unwrap();

        let empty = shards.next_shard().await.unwrap().unwrap();
        assert_eq!(empty.descriptor.name, "shard0000");
        assert!(empty.endpoints.is_empty());

        let partial = shards.next_shard().await.unwrap().unwrap();
        assert_eq!(partial.endpoints, EndpointSet::new(vec![Endpoint::new("h2", 27018)]));

        assert!(shards.next_shard().await.is_none());
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let client = client_for(|d| d.push_find_failure(network_error)).await;
        let result = ShardEnumerator::open(&client, &NoopResolver).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
