//! Sharded or not: the first question of every startup attempt.

use bson::{doc, Bson, Document};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Credentials, DEFAULT_ADMIN_DATABASE};
use crate::mongo::DriverClient;
use crate::pool::{Connector, PooledClient};
use crate::Result;

/// Result of one classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyVerdict {
    ForcedSharded,
    ForcedUnsharded,
    Detected(bool),
}

impl TopologyVerdict {
    pub fn is_sharded(self) -> bool {
        match self {
            TopologyVerdict::ForcedSharded => true,
            TopologyVerdict::ForcedUnsharded => false,
            TopologyVerdict::Detected(sharded) => sharded,
        }
    }
}

/// Handle on the admin database.
pub struct AdminSession<C> {
    client: C,
    dedicated: bool,
    authenticated: bool,
}

impl<C> AdminSession<C> {
    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

enum SessionState<C> {
    Untried,
    Ready(AdminSession<C>),
    Unavailable,
}

/// Lazily opened admin session, scoped to one startup attempt.
///
/// Authentication is attempted at most once; a failure is remembered until
/// the attempt ends.
pub struct AdminAccess<'a, K: Connector> {
    connector: &'a K,
    seed: Arc<PooledClient<K::Client>>,
    credentials: Option<Credentials>,
    state: SessionState<K::Client>,
}

impl<'a, K> AdminAccess<'a, K>
where
    K: Connector,
    K::Client: DriverClient,
{
    pub fn new(
        connector: &'a K,
        seed: Arc<PooledClient<K::Client>>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            connector,
            seed,
            credentials,
            state: SessionState::Untried,
        }
    }

    pub fn seed(&self) -> &Arc<PooledClient<K::Client>> {
        &self.seed
    }

    /// The admin session, or `None` when it could not be opened.
    pub async fn session(&mut self) -> Option<&AdminSession<K::Client>> {
        if matches!(self.state, SessionState::Untried) {
            self.state = self.open().await;
        }
        match &self.state {
            SessionState::Ready(session) => Some(session),
            _ => None,
        }
    }

    /// Client to read cluster metadata with: the admin session's when admin
    /// credentials are configured and accepted, the seed client otherwise.
    pub async fn config_client(&mut self) -> K::Client {
        let use_admin = self.credentials.is_some();
        let seed = self.seed.client().clone();
        match self.session().await {
            Some(session) if use_admin && session.is_authenticated() => session.client.clone(),
            _ => seed,
        }
    }

    /// Closes the dedicated admin client, if one was opened.
    pub async fn release(self) {
        if let SessionState::Ready(session) = self.state {
            if session.dedicated {
                debug!("Closing admin client");
                self.connector.close(session.client).await;
            }
        }
    }

    async fn open(&self) -> SessionState<K::Client> {
        let Some(creds) = &self.credentials else {
            trace!("No admin credentials, using the seed client");
            return SessionState::Ready(AdminSession {
                client: self.seed.client().clone(),
                dedicated: false,
                authenticated: false,
            });
        };

        info!("Authenticate {} with {}", creds.source, creds.username);
        let client = match self
            .connector
            .connect_with_credentials(self.seed.endpoints(), creds)
            .await
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Could not open the admin database");
                return SessionState::Unavailable;
            }
        };

        match client
            .run_command(&creds.source, doc! { "connectionStatus": 1 })
            .await
        {
            Ok(reply) if has_authenticated_users(&reply) => {
                trace!(%reply, "connectionStatus");
                SessionState::Ready(AdminSession {
                    client,
                    dedicated: true,
                    authenticated: true,
                })
            }
            Ok(reply) => {
                error!("Authentication failed for {}: {}", creds.source, reply);
                self.connector.close(client).await;
                SessionState::Unavailable
            }
            Err(e) => {
                error!("Authentication failed for {}: {}", creds.source, e);
                self.connector.close(client).await;
                SessionState::Unavailable
            }
        }
    }
}

fn has_authenticated_users(reply: &Document) -> bool {
    reply
        .get_document("authInfo")
        .and_then(|info| info.get_array("authenticatedUsers"))
        .map(|users| !users.is_empty())
        .unwrap_or(false)
}

/// `serverStatus` asking only for the top-level fields.
pub fn server_status_command() -> Document {
    doc! {
        "serverStatus": 1,
        "asserts": 0,
        "backgroundFlushing": 0,
        "connections": 0,
        "cursors": 0,
        "dur": 0,
        "extra_info": 0,
        "globalLock": 0,
        "indexCounters": 0,
        "locks": 0,
        "metrics": 0,
        "network": 0,
        "opcounters": 0,
        "opcountersRepl": 0,
        "recordStats": 0,
        "repl": 0,
    }
}

fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v != 0.0,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

fn bson_text(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decides whether the deployment is a sharded cluster.
#[derive(Debug, Clone, Copy)]
pub struct TopologyClassifier {
    forced: Option<bool>,
}

impl TopologyClassifier {
    /// `forced` is the configured override; `None` probes the server.
    pub fn new(forced: Option<bool>) -> Self {
        Self { forced }
    }

    pub async fn classify<K>(&self, admin: &mut AdminAccess<'_, K>) -> Result<TopologyVerdict>
    where
        K: Connector,
        K::Client: DriverClient,
    {
        match self.forced {
            Some(true) => return Ok(TopologyVerdict::ForcedSharded),
            Some(false) => return Ok(TopologyVerdict::ForcedUnsharded),
            None => {}
        }

        let Some(session) = admin.session().await else {
            warn!("Admin database unavailable, assuming not mongos");
            return Ok(TopologyVerdict::Detected(false));
        };
        trace!("Found {} database", DEFAULT_ADMIN_DATABASE);

        let reply = match session
            .client()
            .run_command(DEFAULT_ADMIN_DATABASE, server_status_command())
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.is_command_failure() => {
                warn!("serverStatus returns error: {}", e);
                return Ok(TopologyVerdict::Detected(false));
            }
            Err(e) => return Err(e),
        };

        info!(
            "MongoDB version - {}",
            reply.get("version").map(bson_text).unwrap_or_default()
        );
        trace!(%reply, "serverStatus");

        if !reply_ok(&reply) {
            warn!(
                "serverStatus returns error: {}",
                reply.get_str("errmsg").unwrap_or("unknown error")
            );
            return Ok(TopologyVerdict::Detected(false));
        }

        let Some(process) = reply.get("process") else {
            warn!("serverStatus.process return null.");
            return Ok(TopologyVerdict::Detected(false));
        };

        // Some servers report e.g. "mongos.exe" or a full path.
        let process = bson_text(process).to_lowercase();
        trace!(process = %process, "process");
        Ok(TopologyVerdict::Detected(process.contains("mongos")))
    }
}
