// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend.
//!
//! Records map onto Redis hashes and Sets onto native Redis sets:
//! ```text
//! {prefix}{collection}:{key}  →  HASH  field → JSON-encoded value
//! {prefix}{collection}:{key}  →  SET   member, member, ...
//! ```
//!
//! Values are stored as JSON text so numbers, booleans and nested values
//! survive the trip; integers encode as bare digits, which keeps `HINCRBY`
//! working on them. Batched operations go out as one pipeline. Redis writes
//! never collide on a key, so this backend never reports
//! [`StorageError::DuplicateKey`].

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use rand::rngs::OsRng;
use rand::Rng;
use redis::{cmd, pipe, Client, Script};
use serde_json::Value;

use super::traits::{project, Backend, Document, StorageError};
use crate::resilience::retry::{retry, RetryConfig};

/// Removes and returns the member at `ARGV[1] mod SCARD`, nil when empty.
const POP_AT_INDEX: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
if #members == 0 then
    return false
end
local member = members[(tonumber(ARGV[1]) % #members) + 1]
redis.call('SREM', KEYS[1], member)
return member
";

/// Draws stay below 2^52 so Lua's doubles hold them exactly.
const POP_DRAW_RANGE: u64 = 1 << 52;

fn redis_error(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn encode_value(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// Stored text back to a value. Text written by other clients that is not
/// JSON comes back as a plain string.
fn decode_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn decode_hash(hash: HashMap<String, String>) -> Document {
    hash.into_iter().map(|(f, v)| (f, decode_value(v))).collect()
}

pub struct RedisBackend {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:objects:user:1")
    prefix: String,
}

impl RedisBackend {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Create a backend whose keys are all prefixed, for sharing a Redis
    /// instance with other applications.
    ///
    /// ```rust,no_run
    /// # use record_store::storage::redis::RedisBackend;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let backend = RedisBackend::with_prefix("redis://localhost", Some("myapp:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(redis_error)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(redis_error)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
        })
    }

    #[inline]
    fn redis_key(&self, collection: &str, key: &str) -> String {
        format!("{}{}:{}", self.prefix, collection, key)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn upsert(&self, collection: &str, key: &str, fields: &Document) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let mut hset = cmd("HSET");
        hset.arg(self.redis_key(collection, key));
        for (field, value) in fields {
            hset.arg(field).arg(encode_value(value));
        }
        let _: () = hset.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn upsert_many(&self, collection: &str, entries: &[(String, Document)]) -> Result<(), StorageError> {
        let mut pipeline = pipe();
        let mut queued = 0usize;
        for (key, fields) in entries.iter().filter(|(_, f)| !f.is_empty()) {
            let hset = pipeline.cmd("HSET").arg(self.redis_key(collection, key));
            for (field, value) in fields {
                hset.arg(field).arg(encode_value(value));
            }
            hset.ignore();
            queued += 1;
        }
        if queued == 0 {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        key: &str,
        projection: Option<&[String]>,
    ) -> Result<Option<Document>, StorageError> {
        let mut conn = self.connection.clone();
        let redis_key = self.redis_key(collection, key);

        match projection {
            None => {
                let hash: HashMap<String, String> = cmd("HGETALL")
                    .arg(&redis_key)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                Ok(if hash.is_empty() { None } else { Some(decode_hash(hash)) })
            }
            Some([]) => {
                let exists: bool = cmd("EXISTS").arg(&redis_key).query_async(&mut conn).await.map_err(redis_error)?;
                Ok(exists.then(Document::new))
            }
            Some(fields) => {
                let (exists, values): (bool, Vec<Option<String>>) = pipe()
                    .cmd("EXISTS")
                    .arg(&redis_key)
                    .cmd("HMGET")
                    .arg(&redis_key)
                    .arg(fields)
                    .query_async(&mut conn)
                    .await
                    .map_err(redis_error)?;
                if !exists {
                    return Ok(None);
                }
                Ok(Some(
                    fields
                        .iter()
                        .zip(values)
                        .filter_map(|(f, v)| v.map(|v| (f.clone(), decode_value(v))))
                        .collect(),
                ))
            }
        }
    }

    async fn find_many(
        &self,
        collection: &str,
        keys: &[String],
        projection: Option<&[String]>,
    ) -> Result<Vec<(String, Document)>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("HGETALL").arg(self.redis_key(collection, key));
        }
        let mut conn = self.connection.clone();
        let hashes: Vec<HashMap<String, String>> = pipeline.query_async(&mut conn).await.map_err(redis_error)?;

        Ok(keys
            .iter()
            .zip(hashes)
            .filter(|(_, h)| !h.is_empty())
            .map(|(k, h)| {
                let doc = decode_hash(h);
                let doc = match projection {
                    Some(fields) => project(doc, fields),
                    None => doc,
                };
                (k.clone(), doc)
            })
            .collect())
    }

    async fn unset_fields(&self, collection: &str, keys: &[String], fields: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() || fields.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("HDEL").arg(self.redis_key(collection, key)).arg(fields).ignore();
        }
        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn increment(&self, collection: &str, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let value: i64 = cmd("HINCRBY")
            .arg(self.redis_key(collection, key))
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(value)
    }

    async fn increment_many(
        &self,
        collection: &str,
        entries: &[(String, Vec<(String, i64)>)],
    ) -> Result<(), StorageError> {
        let mut pipeline = pipe();
        let mut queued = 0usize;
        for (key, deltas) in entries {
            let redis_key = self.redis_key(collection, key);
            for (field, delta) in deltas {
                pipeline.cmd("HINCRBY").arg(&redis_key).arg(field).arg(*delta).ignore();
                queued += 1;
            }
        }
        if queued == 0 {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() {
            return Ok(());
        }
        let redis_keys: Vec<String> = keys.iter().map(|k| self.redis_key(collection, k)).collect();
        let mut conn = self.connection.clone();
        let _: () = cmd("DEL").arg(&redis_keys).query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("EXISTS").arg(self.redis_key(collection, key));
        }
        let mut conn = self.connection.clone();
        pipeline.query_async(&mut conn).await.map_err(redis_error)
    }

    async fn set_add(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() || members.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("SADD").arg(self.redis_key(collection, key)).arg(members).ignore();
        }
        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn set_remove(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError> {
        if keys.is_empty() || members.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("SREM").arg(self.redis_key(collection, key)).arg(members).ignore();
        }
        let mut conn = self.connection.clone();
        let _: () = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    /// `SPOP` draws from Redis' own PRNG, so the index is drawn here from
    /// the OS source and the pick and removal run as one script.
    async fn set_pop(&self, collection: &str, key: &str) -> Result<Option<String>, StorageError> {
        let draw: u64 = OsRng.gen_range(0..POP_DRAW_RANGE);
        let mut conn = self.connection.clone();
        Script::new(POP_AT_INDEX)
            .key(self.redis_key(collection, key))
            .arg(draw)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn set_members(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("SMEMBERS").arg(self.redis_key(collection, key));
        }
        let mut conn = self.connection.clone();
        let members: Vec<Vec<String>> = pipeline.query_async(&mut conn).await.map_err(redis_error)?;

        // Redis drops a set once its last member goes, so empty means absent.
        Ok(keys
            .iter()
            .cloned()
            .zip(members)
            .filter(|(_, m)| !m.is_empty())
            .collect())
    }

    async fn sets_containing(&self, collection: &str, keys: &[String], member: &str) -> Result<Vec<String>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("SISMEMBER").arg(self.redis_key(collection, key)).arg(member);
        }
        let mut conn = self.connection.clone();
        let flags: Vec<bool> = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(keys
            .iter()
            .zip(flags)
            .filter(|(_, is_member)| *is_member)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn set_counts(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, usize)>, StorageError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = pipe();
        for key in keys {
            pipeline.cmd("SCARD").arg(self.redis_key(collection, key));
        }
        let mut conn = self.connection.clone();
        let counts: Vec<usize> = pipeline.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(keys.iter().cloned().zip(counts).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_encoding_preserves_types() {
        for value in [json!(3), json!("Ann"), json!(true), json!({"nested": [1, 2]}), json!(null)] {
            assert_eq!(decode_value(encode_value(&value)), value);
        }
    }

    #[test]
    fn test_integers_encode_as_bare_digits() {
        assert_eq!(encode_value(&json!(42)), "42");
        assert_eq!(encode_value(&json!(-7)), "-7");
    }

    #[test]
    fn test_foreign_text_decodes_as_string() {
        assert_eq!(decode_value("not json".to_string()), json!("not json"));
    }

    #[test]
    fn test_decode_hash() {
        let mut hash = HashMap::new();
        hash.insert("hits".to_string(), "3".to_string());
        hash.insert("name".to_string(), "\"Ann\"".to_string());
        let doc = decode_hash(hash);
        assert_eq!(doc["hits"], json!(3));
        assert_eq!(doc["name"], json!("Ann"));
    }
}
