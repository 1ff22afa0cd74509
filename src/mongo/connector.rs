use async_trait::async_trait;
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::options::{
    ClientOptions, Credential, ReadPreference, SelectionCriteria, ServerAddress,
};
use mongodb::Client;
use tracing::{debug, info, trace};

use super::{DocumentStream, DriverClient};
use crate::config::{Config, Credentials, DEFAULT_ADMIN_DATABASE};
use crate::endpoint::EndpointSet;
use crate::pool::Connector;
use crate::{Error, Result};

/// Creates `mongodb` clients for endpoint sets using the river's settings.
#[derive(Debug, Clone)]
pub struct MongoConnector {
    app_name: String,
    connect_timeout: std::time::Duration,
    server_selection_timeout: std::time::Duration,
    max_pool_size: u32,
    credentials: Option<Credentials>,
}

impl MongoConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            app_name: format!("mongo-river:{}", config.index_name()),
            connect_timeout: config.connect_timeout(),
            server_selection_timeout: config.server_selection_timeout(),
            max_pool_size: config.mongodb.max_pool_size,
            credentials: config.data_credentials(),
        }
    }

    fn client_options(
        &self,
        endpoints: &EndpointSet,
        credentials: Option<&Credentials>,
    ) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.hosts = endpoints
            .iter()
            .map(|e| ServerAddress::Tcp {
                host: e.host.clone(),
                port: Some(e.port),
            })
            .collect();
        options.app_name = Some(self.app_name.clone());
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.server_selection_timeout);
        options.max_pool_size = Some(self.max_pool_size);
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            ReadPreference::PrimaryPreferred {
                options: Default::default(),
            },
        ));

        if let Some(creds) = credentials {
            let mut credential = Credential::default();
            credential.username = Some(creds.username.clone());
            credential.password = Some(creds.password.clone());
            credential.source = Some(creds.source.clone());
            options.credential = Some(credential);
        }

        options
    }

    async fn open(&self, endpoints: &EndpointSet, credentials: Option<&Credentials>) -> Result<Client> {
        let client = Client::with_options(self.client_options(endpoints, credentials))?;

        // The driver connects lazily; force server selection so that
        // unreachable deployments fail here.
        client
            .database(DEFAULT_ADMIN_DATABASE)
            .run_command(doc! { "ping": 1 })
            .await?;

        debug!(endpoints = %endpoints, "Connected to MongoDB");
        Ok(client)
    }
}

#[async_trait]
impl Connector for MongoConnector {
    type Client = Client;

    async fn connect(&self, endpoints: &EndpointSet) -> Result<Client> {
        self.open(endpoints, self.credentials.as_ref()).await
    }

    async fn connect_with_credentials(
        &self,
        endpoints: &EndpointSet,
        credentials: &Credentials,
    ) -> Result<Client> {
        info!(
            endpoints = %endpoints,
            user = %credentials.username,
            source = %credentials.source,
            "Opening authenticated MongoDB client"
        );
        self.open(endpoints, Some(credentials)).await
    }

    async fn close(&self, client: Client) {
        client.shutdown().await;
    }
}

#[async_trait]
impl DriverClient for Client {
    async fn run_command(&self, database: &str, command: Document) -> Result<Document> {
        trace!(database, %command, "About to execute command");
        let reply = self
            .database(database)
            .run_command(command)
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .await?;
        trace!(database, %reply, "Command executed");
        Ok(reply)
    }

    async fn find(&self, database: &str, collection: &str) -> Result<DocumentStream> {
        let cursor = self
            .database(database)
            .collection::<Document>(collection)
            .find(doc! {})
            .await?;
        Ok(cursor.map(|item| item.map_err(Error::from)).boxed())
    }
}
