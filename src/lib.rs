pub mod checkpoint;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod indexer;
pub mod pool;
pub mod supervisor;
pub mod tailer;

pub mod mongo;
pub mod topology;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Config;
pub use error::{Error, FailureKind, Result};
pub use pool::ConnectionPool;
pub use supervisor::{SupervisorOutcome, TailerSupervisor};
