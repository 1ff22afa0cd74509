#![allow(dead_code)]

use mongo_river::config::{
    Config, IndexerConfig, MongoConfig, RiverConfig, SupervisorConfig,
};
use std::env;
use std::path::Path;

/// Get test configuration, with seeds overridable from the environment
pub fn get_test_config(servers: Vec<String>) -> Config {
    // Use TEST_ prefix for test environment variables
    let servers = match env::var("TEST_MONGO_SERVERS") {
        Ok(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        Err(_) => servers,
    };

    let mongodb = MongoConfig {
        servers,
        user: env::var("TEST_MONGO_USER").unwrap_or_default(),
        password: env::var("TEST_MONGO_PASSWORD").unwrap_or_default(),
        auth_database: String::new(),
        admin_user: String::new(),
        admin_password: String::new(),
        admin_auth_database: String::new(),
        is_mongos: None,
        database: None,
        collection: None,
        connect_timeout_secs: 5,
        server_selection_timeout_secs: 5,
        max_pool_size: 4,
        resolve_hosts: false,
    };

    let river = RiverConfig {
        name: "mongodb".to_string(),
        index_name: format!("test_{}", std::process::id()),
    };

    Config {
        mongodb,
        river,
        supervisor: SupervisorConfig::default(),
        indexer: IndexerConfig::default(),
    }
}

pub fn with_checkpoint_dir(mut config: Config, dir: &Path) -> Config {
    config.indexer.checkpoint_dir = dir.to_path_buf();
    config
}
