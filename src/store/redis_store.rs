// src/store/redis_store.rs
use std::{future::Future, time::Duration};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, RedisResult, Script};

use super::{BatchOp, Fields, KvStore};
use crate::error::StoreError;

/// Adds ARGV[1] to KEYS[1]; if it was new, replays the encoded ops. Op `n`
/// writes KEYS[n + 1] and carries three arguments (name, a, b) after the
/// member. Scripts run atomically on the server.
const CONDITIONAL_BATCH: &str = r#"
if redis.call('SADD', KEYS[1], ARGV[1]) == 0 then
  return 0
end
for n = 1, #KEYS - 1 do
  local key = KEYS[n + 1]
  local i = 2 + (n - 1) * 3
  local op, a, b = ARGV[i], ARGV[i + 1], ARGV[i + 2]
  if op == 'HSET' then
    redis.call('HSET', key, a, b)
  elseif op == 'HINCRBY' then
    redis.call('HINCRBY', key, a, b)
  elseif op == 'SADD' then
    redis.call('SADD', key, a)
  elseif op == 'HDEL' then
    redis.call('HDEL', key, a)
  elseif op == 'DEL' then
    redis.call('DEL', key)
  end
end
return 1
"#;

/// HSET on KEYS[1] with ARGV as field/value pairs, only if the key exists.
const SET_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
    conditional_batch: Script,
    set_if_exists: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, timeout: Duration) -> Self {
        Self {
            conn,
            timeout,
            conditional_batch: Script::new(CONDITIONAL_BATCH),
            set_if_exists: Script::new(SET_IF_EXISTS),
        }
    }

    async fn run<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

/// Escapes glob metacharacters so the prefix matches literally in SCAN.
fn glob_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

/// Script operands for a conditional batch: one key per op and three
/// arguments per op, in the same order.
#[derive(Debug, Default, PartialEq, Eq)]
struct ScriptOps {
    keys: Vec<String>,
    args: Vec<String>,
}

impl ScriptOps {
    fn push(&mut self, op: &str, key: &str, a: &str, b: &str) {
        self.keys.push(key.to_string());
        self.args.extend([op.to_string(), a.to_string(), b.to_string()]);
    }
}

fn script_ops(ops: &[BatchOp]) -> ScriptOps {
    let mut encoded = ScriptOps::default();
    for op in ops {
        match op {
            BatchOp::SetFields { key, fields } => {
                for (field, value) in fields {
                    encoded.push("HSET", key, field, value);
                }
            }
            BatchOp::IncrementField { key, field, delta } => {
                encoded.push("HINCRBY", key, field, &delta.to_string());
            }
            BatchOp::AddToSet { key, member } => encoded.push("SADD", key, member, ""),
            BatchOp::DeleteField { key, field } => encoded.push("HDEL", key, field, ""),
            BatchOp::Delete { key } => encoded.push("DEL", key, "", ""),
        }
    }
    encoded
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        self.run(async { conn.hset_multiple::<_, _, _, ()>(key, fields).await })
            .await
    }

    async fn set_fields_if_exists(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        if fields.is_empty() {
            return self.exists(key).await;
        }
        let mut invocation = self.set_if_exists.prepare_invoke();
        invocation.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.conn.clone();
        let written = self
            .run(async { invocation.invoke_async::<i64>(&mut conn).await })
            .await?;
        Ok(written == 1)
    }

    async fn get_fields(&self, key: &str) -> Result<Fields, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async { conn.hgetall::<_, Fields>(key).await }).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async { conn.exists::<_, bool>(key).await }).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let keys = keys.to_vec();
        self.run(async { conn.del::<_, ()>(keys).await }).await
    }

    async fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let added = self
            .run(async { conn.sadd::<_, _, i64>(key, member).await })
            .await?;
        Ok(added == 1)
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async { conn.sismember::<_, _, bool>(key, member).await })
            .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async { conn.smembers::<_, Vec<String>>(key).await })
            .await
    }

    async fn increment_field(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        self.run(async { conn.hincr::<_, _, _, i64>(key, field, delta).await })
            .await
    }

    async fn scan_page(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.conn.clone();
        let pattern = glob_prefix(prefix);
        self.run(async {
            redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(count)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
        })
        .await
    }

    async fn atomic_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                BatchOp::SetFields { key, fields } => {
                    if !fields.is_empty() {
                        pipe.hset_multiple(key, fields).ignore();
                    }
                }
                BatchOp::IncrementField { key, field, delta } => {
                    pipe.hincr(key, field, *delta).ignore();
                }
                BatchOp::AddToSet { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                BatchOp::DeleteField { key, field } => {
                    pipe.hdel(key, field).ignore();
                }
                BatchOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        self.run(async { pipe.query_async::<()>(&mut conn).await })
            .await
    }

    async fn atomic_batch_if_added(
        &self,
        set_key: &str,
        member: &str,
        ops: Vec<BatchOp>,
    ) -> Result<bool, StoreError> {
        let encoded = script_ops(&ops);
        let mut invocation = self.conditional_batch.prepare_invoke();
        invocation.key(set_key).arg(member);
        for key in &encoded.keys {
            invocation.key(key);
        }
        for arg in &encoded.args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let applied = self
            .run(async { invocation.invoke_async::<i64>(&mut conn).await })
            .await?;
        Ok(applied == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_escapes_metacharacters() {
        assert_eq!(glob_prefix("poll:"), "poll:*");
        assert_eq!(glob_prefix("a*b?[c]"), "a\\*b\\?\\[c\\]*");
    }

    #[test]
    fn script_ops_declare_every_written_key() {
        let encoded = script_ops(&[
            BatchOp::IncrementField {
                key: "poll:1:votes".into(),
                field: "Dog".into(),
                delta: 1,
            },
            BatchOp::SetFields {
                key: "user:u2:votes".into(),
                fields: vec![("1".into(), "Dog".into())],
            },
            BatchOp::Delete {
                key: "poll:1:voters".into(),
            },
        ]);
        assert_eq!(encoded.keys, vec!["poll:1:votes", "user:u2:votes", "poll:1:voters"]);
        assert_eq!(
            encoded.args,
            vec!["HINCRBY", "Dog", "1", "HSET", "1", "Dog", "DEL", "", ""]
        );
        assert_eq!(encoded.args.len(), encoded.keys.len() * 3);
    }
}
