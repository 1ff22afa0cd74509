//! MongoDB driver adapter.
//!
//! The rest of the crate talks to the deployment through [`DriverClient`]
//! and builds clients through [`Connector`](crate::pool::Connector);
//! [`MongoConnector`] implements both on top of the `mongodb` crate.

pub mod connector;

pub use connector::MongoConnector;

use async_trait::async_trait;
use bson::Document;
use futures::stream::BoxStream;

use crate::Result;

/// A server-side cursor as a stream. Dropping it releases the cursor.
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// The small part of a driver client the supervisor needs.
#[async_trait]
pub trait DriverClient: Clone + Send + Sync + 'static {
    /// Runs `command` against `database` on the primary and returns the reply.
    async fn run_command(&self, database: &str, command: Document) -> Result<Document>;

    /// Opens a cursor over every document of `database.collection`.
    async fn find(&self, database: &str, collection: &str) -> Result<DocumentStream>;
}
