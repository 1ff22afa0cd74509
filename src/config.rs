use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database used for administrative commands when no override is configured.
pub const DEFAULT_ADMIN_DATABASE: &str = "admin";

/// Database holding cluster metadata on a sharded deployment.
pub const CONFIG_DATABASE: &str = "config";

/// The river definition: everything the supervisor and its tailers are told
/// about the deployment they read from and the index they feed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mongodb: MongoConfig,
    pub river: RiverConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MongoConfig {
    /// Seed `host[:port]` list of the deployment (a node, replica set or mongos).
    pub servers: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth_database: String,
    #[serde(default)]
    pub admin_user: String,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default)]
    pub admin_auth_database: String,
    /// Skips topology detection when set.
    #[serde(default)]
    pub is_mongos: Option<bool>,
    /// Limits the change stream to one database.
    #[serde(default)]
    pub database: Option<String>,
    /// Limits the change stream to one collection of `database`.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_server_selection_timeout")]
    pub server_selection_timeout_secs: u64,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,
    /// Resolve shard hosts through DNS before connecting.
    #[serde(default = "default_resolve_hosts")]
    pub resolve_hosts: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiverConfig {
    #[serde(default = "default_river_name")]
    pub name: String,
    pub index_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Upper bound on startup attempts; unbounded when absent.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Delay before the first retry; zero retries immediately.
    #[serde(default)]
    pub initial_backoff_ms: u64,
    #[serde(default)]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexerConfig {
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

/// A username/password pair and the database it authenticates against.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub source: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("source", &self.source)
            .finish()
    }
}

impl Credentials {
    fn from_parts(username: &str, password: &str, source: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
            source: source.to_string(),
        })
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("MONGO_RIVER")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Explicit sharded/unsharded override, if any.
    pub fn is_mongos(&self) -> Option<bool> {
        self.mongodb.is_mongos
    }

    pub fn admin_auth_database(&self) -> &str {
        if self.mongodb.admin_auth_database.is_empty() {
            DEFAULT_ADMIN_DATABASE
        } else {
            &self.mongodb.admin_auth_database
        }
    }

    /// Admin credentials; empty user or password means none.
    pub fn admin_credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(
            &self.mongodb.admin_user,
            &self.mongodb.admin_password,
            self.admin_auth_database(),
        )
    }

    /// Credentials used by the data (tailer) connections.
    pub fn data_credentials(&self) -> Option<Credentials> {
        let source = if self.mongodb.auth_database.is_empty() {
            DEFAULT_ADMIN_DATABASE
        } else {
            &self.mongodb.auth_database
        };
        Credentials::from_parts(&self.mongodb.user, &self.mongodb.password, source)
    }

    pub fn index_name(&self) -> &str {
        &self.river.index_name
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mongodb.connect_timeout_secs)
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_secs(self.mongodb.server_selection_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            bulk_size: default_bulk_size(),
            flush_interval_ms: default_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_server_selection_timeout() -> u64 {
    30
}

fn default_max_pool_size() -> u32 {
    100
}

fn default_resolve_hosts() -> bool {
    true
}

fn default_river_name() -> String {
    "mongodb".to_string()
}

fn default_bulk_size() -> usize {
    100
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
