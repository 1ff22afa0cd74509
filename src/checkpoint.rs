//! Per-source checkpoints of the last indexed change stream position.
//!
//! Each source (a shard, or the whole deployment when it is not sharded)
//! gets its own JSON file so that tailers can resume where the indexer left
//! off after a restart.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongo_river::checkpoint::{Checkpoint, CheckpointStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CheckpointStore::new("checkpoints");
//!
//!     if let Some(checkpoint) = store.load("shard0000").await? {
//!         println!("Resuming {} after {} events", checkpoint.source, checkpoint.message_count);
//!     }
//!
//!     let checkpoint = Checkpoint::new("shard0000".to_string(), json!({"_data": "8263"}), 100);
//!     store.save(&checkpoint).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// The last position of one source that reached the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Source label the position belongs to
    pub source: String,
    /// Change stream resume token, as relaxed extended JSON
    pub resume_token: serde_json::Value,
    /// The timestamp when this checkpoint was created
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Number of events indexed for this source since startup
    pub message_count: u64,
}

impl Checkpoint {
    /// Creates a new checkpoint with the current timestamp.
    pub fn new(source: String, resume_token: serde_json::Value, message_count: u64) -> Self {
        Self {
            source,
            resume_token,
            timestamp: chrono::Utc::now(),
            message_count,
        }
    }
}

/// Stores checkpoints as `<dir>/<source>.json`.
///
/// Writes go to a temporary file that is synced and renamed into place, so a
/// checkpoint file is never partially written.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, source: &str) -> PathBuf {
        let file_name: String = source
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    /// Loads the checkpoint for `source`, or `None` on first run.
    pub async fn load(&self, source: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(source);
        if !path.exists() {
            debug!("No checkpoint file found at {:?}", path);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            error!("Failed to read checkpoint file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(checkpoint) => {
                info!(
                    source = %checkpoint.source,
                    timestamp = %checkpoint.timestamp,
                    "Loaded checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Err(e) => {
                error!("Failed to parse checkpoint file: {}", e);
                Err(Error::Checkpoint {
                    message: format!("Invalid checkpoint file {:?}: {}", path, e),
                })
            }
        }
    }

    /// Saves the checkpoint atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.source);
        debug!(source = %checkpoint.source, "Saving checkpoint");

        fs::create_dir_all(&self.dir).await?;

        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &path).await?;

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    /// Deletes the checkpoint for `source` so its tailer starts from "now".
    pub async fn delete(&self, source: &str) -> Result<()> {
        let path = self.path_for(source);
        if path.exists() {
            fs::remove_file(&path).await?;
            info!(source, "Deleted checkpoint file");
        }
        Ok(())
    }
}
