//! The boundary between the engine and a remote service.
//!
//! A [Connector] knows how to enumerate and fetch items of one service for one account.
//! It maps its own errors into the engine's [ErrorClass] taxonomy; the engine decides
//! what to do with each class and holds no service-specific logic.
//!
//! Currently the following connectors ship with the crate:
//!
//! - [LocalDir]: files below a local directory.

pub mod local;

pub use local::LocalDir;

use std::fmt::Display;
use std::io::Read;
use std::time::Duration;

use crate::model::{ItemMetadata, ListFilters};

/// How the engine treats a connector error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttled by the remote; retry after the given delay or with backoff.
    RateLimited { retry_after: Option<Duration> },
    /// Retry with exponential backoff and jitter until attempts run out.
    Transient,
    /// The item itself is unavailable; no retry, the run continues.
    Permanent,
    /// Authentication, storage or permission failure; abort the whole run.
    Fatal,
}

/// Byte stream of a fetched item.
pub type ItemStream = Box<dyn Read + Send>;

/// A source of items for one `(connector, account)` pair.
pub trait Connector: Send + Sync + 'static {
    /// Native error of the connector.
    type Error: Display + Send + 'static;

    /// Enumerate all items matching `filters`.
    ///
    /// The engine materialises the whole listing before ordering it, so pagination is
    /// entirely up to the implementation.
    fn list_items(&self, filters: &ListFilters) -> Result<Vec<ItemMetadata>, Self::Error>;

    /// Open the content of `item`.
    fn fetch_item(&self, item: &ItemMetadata) -> Result<ItemStream, Self::Error>;

    /// Map a native error into the engine's taxonomy.
    fn classify(&self, error: &Self::Error) -> ErrorClass;

    /// Identity of the backed-up account; namespaces output and download archive.
    fn account_identity(&self) -> String;

    /// Preferred file name of `item` inside the snapshot directory.
    ///
    /// The engine sanitises whatever is returned here.
    fn file_name(&self, item: &ItemMetadata) -> String {
        item.id.clone()
    }
}
