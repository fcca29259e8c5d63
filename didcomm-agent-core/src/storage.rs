//! Record store contract.
//!
//! Protocol state lives in untyped [`StorageRecord`]s grouped by record type.
//! Every record carries a version that is bumped on each update; an update
//! naming a stale version fails with [`Error::StateConflict`], which is how
//! concurrent transitions of the same thread are detected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::{Error, Result};

/// Tags a record is queryable by.
pub type Tags = BTreeMap<String, String>;

/// An untyped stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Record category, e.g. `ConnectionRecord`
    pub record_type: String,
    /// Id, unique within the category
    pub id: String,
    /// Serialized record
    pub value: serde_json::Value,
    /// Query tags
    pub tags: Tags,
    /// Incremented on every update, starting at 1
    pub version: u64,
}

/// Durable storage of protocol records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stores a new record at version 1.
    ///
    /// # Errors
    /// - If a record of the same type and id exists
    async fn insert(
        &self,
        record_type: &str,
        id: &str,
        value: serde_json::Value,
        tags: Tags,
    ) -> Result<StorageRecord>;

    /// Reads a record.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if it does not exist
    async fn get(&self, record_type: &str, id: &str) -> Result<StorageRecord>;

    /// Replaces a record if it is still at `expected_version`, returning the
    /// stored record with its new version.
    ///
    /// # Errors
    /// - [`Error::StateConflict`] if the record changed since it was read
    /// - [`Error::NotFound`] if it does not exist
    async fn update(
        &self,
        record_type: &str,
        id: &str,
        value: serde_json::Value,
        tags: Tags,
        expected_version: u64,
    ) -> Result<StorageRecord>;

    /// All records of a type whose tags contain every given pair.
    async fn query(&self, record_type: &str, tags: &Tags) -> Result<Vec<StorageRecord>>;

    /// Removes a record.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if it does not exist
    async fn delete(&self, record_type: &str, id: &str) -> Result<()>;
}

/// A [`RecordStore`] held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<(String, String), StorageRecord>>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(record_type: &str, id: &str) -> (String, String) {
    (record_type.to_string(), id.to_string())
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert(
        &self,
        record_type: &str,
        id: &str,
        value: serde_json::Value,
        tags: Tags,
    ) -> Result<StorageRecord> {
        let mut records = self.records.write().await;
        let key = key(record_type, id);
        if records.contains_key(&key) {
            return Err(Error::Storage(format!("{record_type} {id} already exists")));
        }

        let record = StorageRecord {
            record_type: record_type.to_string(),
            id: id.to_string(),
            value,
            tags,
            version: 1,
        };
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn get(&self, record_type: &str, id: &str) -> Result<StorageRecord> {
        self.records
            .read()
            .await
            .get(&key(record_type, id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{record_type} {id}")))
    }

    async fn update(
        &self,
        record_type: &str,
        id: &str,
        value: serde_json::Value,
        tags: Tags,
        expected_version: u64,
    ) -> Result<StorageRecord> {
        let mut records = self.records.write().await;
        let stored = records
            .get_mut(&key(record_type, id))
            .ok_or_else(|| Error::NotFound(format!("{record_type} {id}")))?;

        if stored.version != expected_version {
            return Err(Error::StateConflict(format!(
                "{record_type} {id} is at version {}, expected {expected_version}",
                stored.version
            )));
        }

        stored.value = value;
        stored.tags = tags;
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn query(&self, record_type: &str, tags: &Tags) -> Result<Vec<StorageRecord>> {
        let records = self.records.read().await;
        let mut matches: Vec<StorageRecord> = records
            .values()
            .filter(|r| r.record_type == record_type)
            .filter(|r| tags.iter().all(|(k, v)| r.tags.get(k) == Some(v)))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn delete(&self, record_type: &str, id: &str) -> Result<()> {
        self.records
            .write()
            .await
            .remove(&key(record_type, id))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{record_type} {id}")))
    }
}
