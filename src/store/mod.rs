//! Key-value store adapter.
//!
//! Everything the poll and vote components persist goes through [`KvStore`]:
//! hashes of string fields, sets of members, integer increments on hash
//! fields, cursor-paged prefix scans, and atomic batches. Two backends
//! implement it: [`RedisStore`] for deployments and [`MemoryStore`] for tests
//! and single-process runs.
//!
//! Key layout for a poll `<id>`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `poll:<id>` | hash | metadata fields |
//! | `poll:<id>:options` | hash | `"0"`, `"1"`, ... -> option text |
//! | `poll:<id>:votes` | hash | canonical option text -> count |
//! | `poll:<id>:voters` | set | identities that voted |
//! | `user:<identity>:votes` | hash | poll id -> option text |
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

pub mod memory;
pub mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type Fields = HashMap<String, String>;

/// A single mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    SetFields {
        key: String,
        fields: Vec<(String, String)>,
    },
    IncrementField {
        key: String,
        field: String,
        delta: i64,
    },
    AddToSet {
        key: String,
        member: String,
    },
    DeleteField {
        key: String,
        field: String,
    },
    Delete {
        key: String,
    },
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Like `set_fields`, but only when `key` already exists, checked and
    /// written as one step. Returns whether the write happened.
    async fn set_fields_if_exists(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError>;

    /// Returns an empty map when the key does not exist.
    async fn get_fields(&self, key: &str) -> Result<Fields, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Returns `true` if the member was newly added.
    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// One page of keys starting with `prefix`. A returned cursor of 0 means
    /// the scan is complete; pages may be empty before that.
    async fn scan_page(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    /// Applies every op or none of them. Readers never observe a prefix of
    /// the batch.
    async fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Adds `member` to `set_key` and, only if it was not already present,
    /// applies `ops`, all as one indivisible step. Returns whether the batch
    /// was applied.
    async fn atomic_batch_if_added(
        &self,
        set_key: &str,
        member: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError>;

    /// Walks the whole key space under `prefix`, page by page.
    async fn scan_keys_by_prefix(
        &self,
        prefix: &str,
        page_size: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page) = self.scan_page(prefix, cursor, page_size).await?;
            keys.extend(page);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

pub mod keys {
    pub const POLL_PREFIX: &str = "poll:";

    pub fn poll(id: &str) -> String {
        format!("{POLL_PREFIX}{id}")
    }

    pub fn options(id: &str) -> String {
        format!("{POLL_PREFIX}{id}:options")
    }

    pub fn votes(id: &str) -> String {
        format!("{POLL_PREFIX}{id}:votes")
    }

    pub fn voters(id: &str) -> String {
        format!("{POLL_PREFIX}{id}:voters")
    }

    pub fn user_votes(identity: &str) -> String {
        format!("user:{identity}:votes")
    }

    /// The poll id if `key` is a poll metadata key, `None` for the auxiliary
    /// options/votes/voters keys.
    pub fn poll_id(key: &str) -> Option<&str> {
        let id = key.strip_prefix(POLL_PREFIX)?;
        (!id.is_empty() && !id.contains(':')).then_some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_id_skips_auxiliary_keys() {
        let id = "5f1c7f0e-2b7a-4a53-9d0e-1f1f0c2a9b11";
        assert_eq!(keys::poll_id(&keys::poll(id)), Some(id));
        assert_eq!(keys::poll_id(&keys::options(id)), None);
        assert_eq!(keys::poll_id(&keys::votes(id)), None);
        assert_eq!(keys::poll_id(&keys::voters(id)), None);
        assert_eq!(keys::poll_id("poll:"), None);
        assert_eq!(keys::poll_id("user:u1:votes"), None);
    }

    #[tokio::test]
    async fn scan_keys_by_prefix_pages_through_everything() {
        let store = MemoryStore::new();
        for i in 0..25 {
            store
                .set_fields(&format!("poll:{i}"), &[("id".into(), i.to_string())])
                .await
                .unwrap();
        }
        store.add_to_set("other:set", "x").await.unwrap();

        let keys = store.scan_keys_by_prefix("poll:", 4).await.unwrap();
        assert_eq!(keys.len(), 25);
        assert!(keys.iter().all(|k| k.starts_with("poll:")));
    }
}
