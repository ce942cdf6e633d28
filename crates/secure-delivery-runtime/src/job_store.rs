use secure_delivery::StorageAdapter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::Result;

pub const JOB_PREFIX: &str = "v1/delivery-job/";

/// Persisted form of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub factory_key: String,
    pub queue_key: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: u64,
}

/// Job records in a [`StorageAdapter`], so queued work survives a restart.
#[derive(Clone)]
pub struct JobStore {
    storage: Arc<dyn StorageAdapter>,
    prefix: String,
}

impl JobStore {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::with_prefix(storage, JOB_PREFIX)
    }

    pub fn with_prefix(storage: Arc<dyn StorageAdapter>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn put(&self, record: &JobRecord) -> Result<()> {
        self.storage
            .put(&self.key(&record.id), serde_json::to_string(record)?)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        match self.storage.get(&self.key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.storage.del(&self.key(id))?;
        Ok(())
    }

    /// All records in enqueue order. Unreadable records are skipped.
    pub fn load_all(&self) -> Result<Vec<JobRecord>> {
        let mut out = Vec::new();
        for key in self.storage.list(&self.prefix)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<JobRecord>(&raw) {
                Ok(record) => out.push(record),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable job record"),
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn load_queue(&self, queue_key: &str) -> Result<Vec<JobRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.queue_key == queue_key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secure_delivery::InMemoryStorage;

    fn record(id: &str, queue_key: &str, created_at: u64) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            factory_key: "Test".to_string(),
            queue_key: queue_key.to_string(),
            data: serde_json::json!({ "n": created_at }),
            attempt: 0,
            created_at,
        }
    }

    #[test]
    fn load_all_is_sorted_by_creation() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let store = JobStore::new(storage);
        store.put(&record("b", "q", 200)).unwrap();
        store.put(&record("a", "q", 100)).unwrap();
        store.put(&record("c", "other", 150)).unwrap();

        let ids: Vec<String> = store.load_all().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let queue: Vec<String> = store
            .load_queue("q")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(queue, vec!["a", "b"]);
    }

    #[test]
    fn unreadable_records_are_skipped() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let store = JobStore::new(storage.clone());
        store.put(&record("a", "q", 1)).unwrap();
        storage
            .put(&format!("{}broken", JOB_PREFIX), "{not json".to_string())
            .unwrap();

        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn remove_and_prefix_isolation() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let jobs = JobStore::new(storage.clone());
        let other = JobStore::with_prefix(storage, "v1/other-job/");
        jobs.put(&record("a", "q", 1)).unwrap();
        other.put(&record("a", "q", 1)).unwrap();

        jobs.remove("a").unwrap();
        assert!(jobs.get("a").unwrap().is_none());
        assert!(other.get("a").unwrap().is_some());
    }
}
