//! Boundary to the record store supplied by the embedding application.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

mod memory;

pub use memory::InMemoryRepository;

/// Tags a record can be queried by
pub type Tags = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("{record_type} record '{id}' not found")]
    NotFound { record_type: &'static str, id: String },
    #[error("{record_type} record '{id}' already exists")]
    Duplicate { record_type: &'static str, id: String },
    #[error("{record_type} record '{id}' was modified concurrently")]
    Conflict { record_type: &'static str, id: String },
    #[error("{count} {record_type} records match where one was expected")]
    Ambiguous { record_type: &'static str, count: usize },
    #[error("(de)serializing record failed: {0}")]
    Serde(String),
    #[error("storage unavailable")]
    Internal,
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal
    }
}

/// A persistent entity. `version` is managed by the repository and used for
/// optimistic concurrency control: an update carrying a stale version fails
/// with [`StorageError::Conflict`].
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const RECORD_TYPE: &'static str;

    fn id(&self) -> &str;

    fn tags(&self) -> Tags;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);
}

#[async_trait]
pub trait Repository<R: Record>: Send + Sync {
    async fn save(&self, record: &mut R) -> Result<(), StorageError>;

    async fn update(&self, record: &mut R) -> Result<(), StorageError>;

    async fn get_by_id(&self, id: &str) -> Result<R, StorageError>;

    /// All records whose tags contain every entry of `query`
    async fn find_by_query(&self, query: &Tags) -> Result<Vec<R>, StorageError>;

    async fn get_all(&self) -> Result<Vec<R>, StorageError>;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// The only record matching `query`; several matches are an error
    async fn find_single_by_query(&self, query: &Tags) -> Result<Option<R>, StorageError> {
        let mut records = self.find_by_query(query).await?;

        match records.len() {
            0 | 1 => Ok(records.pop()),
            count => Err(StorageError::Ambiguous {
                record_type: R::RECORD_TYPE,
                count,
            }),
        }
    }
}

/// Build a query from `(name, value)` pairs
pub fn query<const N: usize>(pairs: [(&str, &str); N]) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
