// src/store/memory.rs
use std::collections::{HashMap, HashSet};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{BatchOp, Fields, KvStore};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Entry {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Hash(h) => h.is_empty(),
            Entry::Set(s) => s.is_empty(),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::MalformedResponse(format!("WRONGTYPE operation against key {key}"))
}

fn as_hash<'a>(
    slot: &'a mut Option<Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>, StoreError> {
    match slot.get_or_insert_with(|| Entry::Hash(HashMap::new())) {
        Entry::Hash(h) => Ok(h),
        Entry::Set(_) => Err(wrong_type(key)),
    }
}

fn as_set<'a>(slot: &'a mut Option<Entry>, key: &str) -> Result<&'a mut HashSet<String>, StoreError> {
    match slot.get_or_insert_with(|| Entry::Set(HashSet::new())) {
        Entry::Set(s) => Ok(s),
        Entry::Hash(_) => Err(wrong_type(key)),
    }
}

fn increment(
    slot: &mut Option<Entry>,
    key: &str,
    field: &str,
    delta: i64,
) -> Result<i64, StoreError> {
    let hash = as_hash(slot, key)?;
    let current = match hash.get(field) {
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| StoreError::MalformedResponse(format!("hash value is not an integer: {key}.{field}")))?,
        None => 0,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| StoreError::MalformedResponse(format!("increment would overflow: {key}.{field}")))?;
    hash.insert(field.to_string(), next.to_string());
    Ok(next)
}

#[derive(Debug)]
struct Slot {
    /// Assigned when the key is created and kept across updates.
    seq: u64,
    entry: Entry,
}

/// The key space plus a creation counter. Scan cursors are creation
/// sequence numbers, so deleting a key never moves the keys after it.
#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
    last_seq: u64,
}

impl Keyspace {
    fn get(&self, key: &str) -> Option<&Entry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    /// Writes back a staged entry. Empty entries are removed, as redis does.
    fn commit(&mut self, key: String, entry: Option<Entry>) {
        match entry {
            Some(entry) if !entry.is_empty() => match self.slots.get_mut(&key) {
                Some(slot) => slot.entry = entry,
                None => {
                    self.last_seq += 1;
                    self.slots.insert(
                        key,
                        Slot {
                            seq: self.last_seq,
                            entry,
                        },
                    );
                }
            },
            _ => {
                self.slots.remove(&key);
            }
        }
    }

    /// Stages every op against copies of the touched entries and only
    /// writes them back once all ops succeeded.
    fn apply(&mut self, ops: &[BatchOp]) -> Result<(), StoreError> {
        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();

        for op in ops {
            let key = match op {
                BatchOp::SetFields { key, .. }
                | BatchOp::IncrementField { key, .. }
                | BatchOp::AddToSet { key, .. }
                | BatchOp::DeleteField { key, .. }
                | BatchOp::Delete { key } => key,
            };
            let slot = staged
                .entry(key.clone())
                .or_insert_with(|| self.get(key).cloned());

            match op {
                BatchOp::SetFields { fields, .. } => {
                    let hash = as_hash(slot, key)?;
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                }
                BatchOp::IncrementField { field, delta, .. } => {
                    increment(slot, key, field, *delta)?;
                }
                BatchOp::AddToSet { member, .. } => {
                    as_set(slot, key)?.insert(member.clone());
                }
                BatchOp::DeleteField { field, .. } => {
                    if slot.is_some() {
                        as_hash(slot, key)?.remove(field);
                    }
                }
                BatchOp::Delete { .. } => *slot = None,
            }
        }

        for (key, slot) in staged {
            self.commit(key, slot);
        }
        Ok(())
    }
}

/// Process-local store with the same observable semantics as the redis
/// backend. A single lock serializes every call, which is what makes
/// batches atomic here.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Keyspace>,
    #[cfg(test)]
    read_latency: Option<Duration>,
    #[cfg(test)]
    fail_next_batch: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn with_read_latency(latency: Duration) -> Self {
        Self {
            read_latency: Some(latency),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    async fn before_read(&self) {
        #[cfg(test)]
        if let Some(latency) = self.read_latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_batch_fault(&self) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Connection("injected batch failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        let ops = [BatchOp::SetFields {
            key: key.to_string(),
            fields: fields.to_vec(),
        }];
        self.data.lock().apply(&ops)
    }

    async fn set_fields_if_exists(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock();
        if data.get(key).is_none() {
            return Ok(false);
        }
        data.apply(&[BatchOp::SetFields {
            key: key.to_string(),
            fields: fields.to_vec(),
        }])?;
        Ok(true)
    }

    async fn get_fields(&self, key: &str) -> Result<Fields, StoreError> {
        self.before_read().await;
        match self.data.lock().get(key) {
            Some(Entry::Hash(h)) => Ok(h.clone()),
            Some(Entry::Set(_)) => Err(wrong_type(key)),
            None => Ok(Fields::new()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.lock().get(key).is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        for key in keys {
            data.commit(key.clone(), None);
        }
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut data = self.data.lock();
        let mut slot = data.get(key).cloned();
        let added = as_set(&mut slot, key)?.insert(member.to_string());
        data.commit(key.to_string(), slot);
        Ok(added)
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        match self.data.lock().get(key) {
            Some(Entry::Set(s)) => Ok(s.contains(member)),
            Some(Entry::Hash(_)) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.data.lock().get(key) {
            Some(Entry::Set(s)) => Ok(s.iter().cloned().collect()),
            Some(Entry::Hash(_)) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut data = self.data.lock();
        let mut slot = data.get(key).cloned();
        let next = increment(&mut slot, key, field, delta)?;
        data.commit(key.to_string(), slot);
        Ok(next)
    }

    /// Pages in key creation order. The cursor is the sequence number of the
    /// last key returned, so every key alive for the whole scan is returned.
    async fn scan_page(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let count = count.max(1);
        let data = self.data.lock();
        let mut matching: Vec<(u64, &String)> = data
            .slots
            .iter()
            .filter(|(key, slot)| slot.seq > cursor && key.starts_with(prefix))
            .map(|(key, slot)| (slot.seq, key))
            .collect();
        matching.sort_unstable();

        let next = if matching.len() > count {
            matching[count - 1].0
        } else {
            0
        };
        let page = matching
            .into_iter()
            .take(count)
            .map(|(_, key)| key.clone())
            .collect();
        Ok((next, page))
    }

    async fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        self.check_batch_fault()?;
        self.data.lock().apply(&ops)
    }

    async fn atomic_batch_if_added(
        &self,
        set_key: &str,
        member: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError> {
        self.check_batch_fault()?;
        let mut data = self.data.lock();
        match data.get(set_key) {
            Some(Entry::Set(s)) if s.contains(member) => return Ok(false),
            Some(Entry::Hash(_)) => return Err(wrong_type(set_key)),
            _ => {}
        }

        let mut gated = Vec::with_capacity(ops.len() + 1);
        gated.push(BatchOp::AddToSet {
            key: set_key.to_string(),
            member: member.to_string(),
        });
        gated.extend(ops);
        data.apply(&gated)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_with_type_error_applies_nothing() {
        let store = MemoryStore::new();
        store.add_to_set("s", "a").await.unwrap();

        let result = store
            .atomic_batch(vec![
                BatchOp::SetFields {
                    key: "h".into(),
                    fields: vec![("f".into(), "v".into())],
                },
                BatchOp::IncrementField {
                    key: "s".into(),
                    field: "f".into(),
                    delta: 1,
                },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::MalformedResponse(_))));
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn conditional_batch_runs_once_per_member() {
        let store = MemoryStore::new();
        let ops = || {
            vec![BatchOp::IncrementField {
                key: "tally".into(),
                field: "A".into(),
                delta: 1,
            }]
        };

        assert!(store.atomic_batch_if_added("voters", "u1", ops()).await.unwrap());
        assert!(!store.atomic_batch_if_added("voters", "u1", ops()).await.unwrap());
        assert!(store.atomic_batch_if_added("voters", "u2", ops()).await.unwrap());

        let tally = store.get_fields("tally").await.unwrap();
        assert_eq!(tally.get("A").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn emptied_hash_disappears() {
        let store = MemoryStore::new();
        store
            .set_fields("h", &[("f".into(), "v".into())])
            .await
            .unwrap();
        store
            .atomic_batch(vec![BatchOp::DeleteField {
                key: "h".into(),
                field: "f".into(),
            }])
            .await
            .unwrap();
        assert!(!store.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn increment_rejects_non_integer_value() {
        let store = MemoryStore::new();
        store
            .set_fields("h", &[("f".into(), "abc".into())])
            .await
            .unwrap();
        let err = store.increment_field("h", "f", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn increment_past_i64_max_is_an_error() {
        let store = MemoryStore::new();
        store
            .set_fields("h", &[("f".into(), i64::MAX.to_string())])
            .await
            .unwrap();
        let err = store.increment_field("h", "f", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedResponse(_)));

        let fields = store.get_fields("h").await.unwrap();
        assert_eq!(fields.get("f"), Some(&i64::MAX.to_string()));
    }

    #[tokio::test]
    async fn scan_returns_surviving_keys_when_earlier_ones_are_deleted() {
        let store = MemoryStore::new();
        for name in ["a", "b", "c", "d"] {
            store
                .set_fields(&format!("poll:{name}"), &[("id".into(), name.into())])
                .await
                .unwrap();
        }

        let (cursor, first) = store.scan_page("poll:", 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_ne!(cursor, 0);
        store.delete(&[first[0].clone()]).await.unwrap();

        let mut seen = first;
        let mut cursor = cursor;
        while cursor != 0 {
            let (next, page) = store.scan_page("poll:", cursor, 2).await.unwrap();
            seen.extend(page);
            cursor = next;
        }
        seen.sort();
        assert_eq!(seen, ["poll:a", "poll:b", "poll:c", "poll:d"]);
    }

    #[tokio::test]
    async fn updating_a_key_keeps_its_scan_position() {
        let store = MemoryStore::new();
        store.set_fields("poll:a", &[("n".into(), "1".into())]).await.unwrap();
        store.set_fields("poll:b", &[("n".into(), "1".into())]).await.unwrap();

        let (cursor, first) = store.scan_page("poll:", 0, 1).await.unwrap();
        assert_eq!(first, ["poll:a"]);
        store.increment_field("poll:a", "n", 1).await.unwrap();

        let (cursor, second) = store.scan_page("poll:", cursor, 1).await.unwrap();
        assert_eq!(second, ["poll:b"]);
        assert_eq!(cursor, 0);
    }

    #[tokio::test]
    async fn conditional_set_only_touches_existing_keys() {
        let store = MemoryStore::new();
        let fields = [("is_closed".to_string(), "true".to_string())];

        assert!(!store.set_fields_if_exists("h", &fields).await.unwrap());
        assert!(!store.exists("h").await.unwrap());

        store.set_fields("h", &[("created_by".into(), "u1".into())]).await.unwrap();
        assert!(store.set_fields_if_exists("h", &fields).await.unwrap());
        let stored = store.get_fields("h").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.get("is_closed").map(String::as_str), Some("true"));
    }
}
