//! Local storage index.
//!
//! The query router only sees the [`StorageIndex`] trait: a query text goes
//! in, an ordered list of records comes out. [`MediaIndex`] is the SQLite
//! backed implementation the daemon runs with, filled by [`scanner`] from the
//! shared folder.

mod media;
pub mod scanner;

pub use media::{MediaIndex, MediaKind, MediaRecord};

use async_trait::async_trait;
use thiserror::Error;

/// A matched record, rendered by the index that produced it.
///
/// Local records read `description<TAB>file name`, where the file name is
/// relative to the shared folder and is what `startDownload` expects.
pub type Record = String;

/// Separates a record's description from its file name
pub const FILENAME_SEPARATOR: char = '\t';

/// The downloadable file name carried by a record, if any
pub fn record_filename(record: &str) -> Option<&str> {
    record
        .split_once(FILENAME_SEPARATOR)
        .map(|(_, filename)| filename)
        .filter(|filename| !filename.is_empty())
}

/// The fixed query behind `queryMovies`
pub const MOVIES_QUERY: &str = "type:movie";

/// Errors reported by a storage index
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    /// The index could not be reached; never reported as an empty result
    #[error("Index unavailable: {0}")]
    Unavailable(String),

    /// The index rejected the query syntax
    #[error("Malformed query: {0}")]
    MalformedQuery(String),
}

impl IndexError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedQuery(reason.into())
    }
}

/// Call boundary to the local index. Implementations do not retry.
#[async_trait]
pub trait StorageIndex: Send + Sync {
    /// Run a query and return matching records in index order
    async fn query(&self, text: &str) -> Result<Vec<Record>, IndexError>;

    /// All movie records
    async fn query_movies(&self) -> Result<Vec<Record>, IndexError> {
        self.query(MOVIES_QUERY).await
    }
}
