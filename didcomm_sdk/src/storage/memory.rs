use async_trait::async_trait;
use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, RwLock},
};

use super::{Record, Repository, StorageError, Tags};

#[derive(Clone, Debug)]
struct StoredRecord {
    value: serde_json::Value,
    tags: Tags,
    version: u64,
}

/// Repository keeping serialized records in memory
pub struct InMemoryRepository<R> {
    records: Arc<RwLock<HashMap<String, StoredRecord>>>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for InMemoryRepository<R> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            _record: PhantomData,
        }
    }
}

impl<R> Default for InMemoryRepository<R> {
    fn default() -> Self {
        Self {
            records: Default::default(),
            _record: PhantomData,
        }
    }
}

impl<R: Record> InMemoryRepository<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(stored: &StoredRecord) -> Result<R, StorageError> {
        let mut record: R = serde_json::from_value(stored.value.clone())
            .map_err(|e| StorageError::Serde(e.to_string()))?;
        record.set_version(stored.version);

        Ok(record)
    }

    fn encode(record: &R) -> Result<serde_json::Value, StorageError> {
        serde_json::to_value(record).map_err(|e| StorageError::Serde(e.to_string()))
    }
}

#[async_trait]
impl<R: Record> Repository<R> for InMemoryRepository<R> {
    async fn save(&self, record: &mut R) -> Result<(), StorageError> {
        let mut records = self.records.write()?;

        if records.contains_key(record.id()) {
            return Err(StorageError::Duplicate {
                record_type: R::RECORD_TYPE,
                id: record.id().to_string(),
            });
        }

        record.set_version(1);
        let stored = StoredRecord {
            value: Self::encode(record)?,
            tags: record.tags(),
            version: 1,
        };
        records.insert(record.id().to_string(), stored);

        Ok(())
    }

    async fn update(&self, record: &mut R) -> Result<(), StorageError> {
        let mut records = self.records.write()?;

        let Some(stored) = records.get_mut(record.id()) else {
            return Err(StorageError::NotFound {
                record_type: R::RECORD_TYPE,
                id: record.id().to_string(),
            });
        };

        if stored.version != record.version() {
            return Err(StorageError::Conflict {
                record_type: R::RECORD_TYPE,
                id: record.id().to_string(),
            });
        }

        let version = stored.version + 1;
        *stored = StoredRecord {
            value: Self::encode(record)?,
            tags: record.tags(),
            version,
        };
        record.set_version(version);

        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<R, StorageError> {
        let records = self.records.read()?;

        let stored = records.get(id).ok_or_else(|| StorageError::NotFound {
            record_type: R::RECORD_TYPE,
            id: id.to_string(),
        })?;

        Self::decode(stored)
    }

    async fn find_by_query(&self, query: &Tags) -> Result<Vec<R>, StorageError> {
        let records = self.records.read()?;

        records
            .values()
            .filter(|stored| {
                query
                    .iter()
                    .all(|(name, value)| stored.tags.get(name) == Some(value))
            })
            .map(Self::decode)
            .collect()
    }

    async fn get_all(&self) -> Result<Vec<R>, StorageError> {
        self.find_by_query(&Tags::new()).await
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        match self.records.write()?.remove(id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                record_type: R::RECORD_TYPE,
                id: id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::storage::query;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        topic: String,
        #[serde(skip)]
        version: u64,
    }

    impl Record for Note {
        const RECORD_TYPE: &'static str = "Note";

        fn id(&self) -> &str {
            &self.id
        }

        fn tags(&self) -> Tags {
            query([("topic", self.topic.as_str())])
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    fn note(id: &str, topic: &str) -> Note {
        Note {
            id: id.to_string(),
            topic: topic.to_string(),
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_save_and_query() {
        let repository = InMemoryRepository::<Note>::new();

        repository.save(&mut note("1", "rust")).await.unwrap();
        repository.save(&mut note("2", "rust")).await.unwrap();
        repository.save(&mut note("3", "didcomm")).await.unwrap();

        assert_eq!(
            repository.save(&mut note("1", "again")).await,
            Err(StorageError::Duplicate {
                record_type: "Note",
                id: "1".to_string()
            })
        );

        let rust = repository.find_by_query(&query([("topic", "rust")])).await.unwrap();
        assert_eq!(rust.len(), 2);
        assert_eq!(repository.get_all().await.unwrap().len(), 3);

        let found = repository
            .find_single_by_query(&query([("topic", "didcomm")]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "3");
        assert_eq!(found.version, 1);

        assert_eq!(
            repository.find_single_by_query(&query([("topic", "rust")])).await,
            Err(StorageError::Ambiguous {
                record_type: "Note",
                count: 2
            })
        );
        assert_eq!(
            repository.find_single_by_query(&query([("topic", "none")])).await,
            Ok(None)
        );
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let repository = InMemoryRepository::<Note>::new();
        let mut original = note("1", "rust");
        repository.save(&mut original).await.unwrap();

        let mut first = repository.get_by_id("1").await.unwrap();
        let mut second = repository.get_by_id("1").await.unwrap();

        first.topic = "didcomm".to_string();
        repository.update(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.topic = "lost update".to_string();
        assert!(matches!(
            repository.update(&mut second).await,
            Err(StorageError::Conflict { .. })
        ));

        let stored = repository.get_by_id("1").await.unwrap();
        assert_eq!(stored.topic, "didcomm");
        assert!(
            repository
                .find_by_query(&query([("topic", "rust")]))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Unencodable {
        id: String,
        #[serde(serialize_with = "fail_after_first")]
        payload: u32,
        #[serde(skip)]
        version: u64,
    }

    fn fail_after_first<S: serde::Serializer>(payload: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        if *payload > 0 {
            return Err(serde::ser::Error::custom("payload cannot be stored"));
        }

        serializer.serialize_u32(*payload)
    }

    impl Record for Unencodable {
        const RECORD_TYPE: &'static str = "Unencodable";

        fn id(&self) -> &str {
            &self.id
        }

        fn tags(&self) -> Tags {
            Tags::new()
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    #[tokio::test]
    async fn test_failed_update_keeps_version() {
        let repository = InMemoryRepository::<Unencodable>::new();
        let mut record = Unencodable {
            id: "1".to_string(),
            payload: 0,
            version: 0,
        };
        repository.save(&mut record).await.unwrap();

        record.payload = 1;
        assert!(matches!(
            repository.update(&mut record).await,
            Err(StorageError::Serde(_))
        ));
        assert_eq!(record.version, 1);

        // the caller can fix the record and retry
        record.payload = 0;
        repository.update(&mut record).await.unwrap();
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_delete() {
        let repository = InMemoryRepository::<Note>::new();
        repository.save(&mut note("1", "rust")).await.unwrap();

        repository.delete("1").await.unwrap();
        assert!(matches!(
            repository.get_by_id("1").await,
            Err(StorageError::NotFound { .. })
        ));
        assert!(repository.delete("1").await.is_err());
    }
}
