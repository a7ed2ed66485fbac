// src/store/testing.rs
//! A [`KvStore`] wrapper that replays awkward interleavings on demand.
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BatchOp, Fields, KvStore, MemoryStore};
use crate::error::StoreError;

#[derive(Default)]
pub(crate) struct Interleaving {
    pub(crate) inner: MemoryStore,
    /// `is_member` answers `false`, as if another request had not committed yet.
    pub(crate) stale_membership: bool,
    /// Keys deleted right before the next conditional write, as if a
    /// concurrent delete had landed between a read and that write.
    pub(crate) delete_before_conditional_write: Mutex<Vec<String>>,
}

#[async_trait]
impl KvStore for Interleaving {
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        self.inner.set_fields(key, fields).await
    }

    async fn set_fields_if_exists(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        let doomed = std::mem::take(&mut *self.delete_before_conditional_write.lock());
        self.inner.delete(&doomed).await?;
        self.inner.set_fields_if_exists(key, fields).await
    }

    async fn get_fields(&self, key: &str) -> Result<Fields, StoreError> {
        self.inner.get_fields(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.inner.delete(keys).await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.add_to_set(key, member).await
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        if self.stale_membership {
            return Ok(false);
        }
        self.inner.is_member(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(key).await
    }

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.inner.increment_field(key, field, delta).await
    }

    async fn scan_page(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        self.inner.scan_page(prefix, cursor, count).await
    }

    async fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.inner.atomic_batch(ops).await
    }

    async fn atomic_batch_if_added(
        &self,
        set_key: &str,
        member: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError> {
        self.inner.atomic_batch_if_added(set_key, member, ops).await
    }
}
