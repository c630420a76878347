// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL document backend (SQLite / MySQL via the sqlx `Any` driver).
//!
//! Every Record or Set is one row holding its document as JSON text:
//! ```sql
//! CREATE TABLE record_store (
//!   collection VARCHAR(64)  NOT NULL,
//!   record_key VARCHAR(255) NOT NULL,
//!   data       LONGTEXT     NOT NULL,  -- JSON document
//!   PRIMARY KEY (collection, record_key)
//! )
//! ```
//!
//! Writes are read-merge-write inside a transaction.
//!
//! - **SQLite** allows one writer at a time, and a deferred transaction that
//!   read first cannot upgrade while another connection writes. Writes
//!   therefore queue on a per-backend writer lock before opening their
//!   transaction. Every pooled connection also sets `busy_timeout`, so a
//!   writer in another process makes us wait rather than fail at once.
//! - **MySQL** seeds an absent row with `INSERT IGNORE` before the locking
//!   read. Racing creators then queue on the row lock; a locking read of a
//!   missing row would take gap locks, and two creators holding them
//!   deadlock on their inserts.
//!
//! If the row is still missing when the transaction reads it, the write is a
//! plain `INSERT`. A primary-key violation there surfaces as
//! [`StorageError::DuplicateKey`] and the caller decides whether to retry.
//!
//! ## sqlx Any Driver Quirks
//!
//! The document column is TEXT rather than a native JSON type, and MySQL
//! LONGTEXT comes back as bytes, so reads try `String` first and fall back to
//! `Vec<u8>`.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, any::AnyRow, AnyPool, Row};
use std::collections::HashSet;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::traits::{
    add_members, apply_increment, check_field_name, members_of, project, remove_members, take_random_member, Backend,
    Document, StorageError,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Chunk size for `IN (...)` lists.
const IN_CHUNK_SIZE: usize = 500;

/// How long a SQLite connection waits on another process's write lock.
const SQLITE_BUSY_TIMEOUT: &str = "PRAGMA busy_timeout = 5000";

const INSERT_DOCUMENT: &str = "INSERT INTO record_store (collection, record_key, data) VALUES (?, ?, ?)";

fn sql_error(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Map an INSERT failure, surfacing primary-key violations as collisions.
fn insert_error(e: sqlx::Error, collection: &str, key: &str) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::DuplicateKey {
            collection: collection.to_string(),
            key: key.to_string(),
        },
        _ => sql_error(e),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqlBackend {
    pool: AnyPool,
    is_sqlite: bool,
    /// Held for the whole of each SQLite write transaction.
    write_lock: Option<Mutex<()>>,
}

impl SqlBackend {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the table if needed.
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            let mut options = AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300));
            if is_sqlite {
                // Per-connection settings; journal_mode is persisted in the file
                options = options.after_connect(|conn, _meta| {
                    Box::pin(async move {
                        sqlx::query(SQLITE_BUSY_TIMEOUT).execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                        Ok(())
                    })
                });
            }
            options.connect(connection_string).await.map_err(sql_error)
        })
        .await?;

        let backend = Self {
            pool,
            is_sqlite,
            write_lock: is_sqlite.then(|| Mutex::new(())),
        };

        if is_sqlite {
            backend.enable_wal_mode().await?;
        }

        backend.init_schema().await?;
        Ok(backend)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS record_store (
                collection TEXT NOT NULL,
                record_key TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (collection, record_key)
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS record_store (
                collection VARCHAR(64) NOT NULL,
                record_key VARCHAR(255) NOT NULL,
                data LONGTEXT NOT NULL,
                PRIMARY KEY (collection, record_key)
            )
            "#
        };

        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql).execute(&self.pool).await.map_err(sql_error)
        })
        .await?;

        Ok(())
    }

    fn select_for_update(&self) -> &'static str {
        if self.is_sqlite {
            "SELECT data FROM record_store WHERE collection = ? AND record_key = ?"
        } else {
            "SELECT data FROM record_store WHERE collection = ? AND record_key = ? FOR UPDATE"
        }
    }

    fn read_document(row: &AnyRow) -> Result<Document, StorageError> {
        let text: String = row
            .try_get::<String, _>("data")
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>("data")
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .ok_or_else(|| StorageError::Backend("No data column in row".to_string()))?;
        serde_json::from_str(&text).map_err(|e| StorageError::Backend(format!("Invalid stored document: {}", e)))
    }

    fn read_key(row: &AnyRow) -> Result<String, StorageError> {
        row.try_get::<String, _>("record_key")
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>("record_key")
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .ok_or_else(|| StorageError::Backend("No record_key column in row".to_string()))
    }

    /// Read-modify-write one document inside a transaction.
    ///
    /// With `upsert` the document is created when absent; otherwise an absent
    /// document yields `Ok(None)` and nothing is written.
    async fn modify<R, F>(&self, collection: &str, key: &str, upsert: bool, apply: F) -> Result<Option<R>, StorageError>
    where
        F: FnOnce(&mut Document) -> Result<R, StorageError> + Send,
        R: Send,
    {
        let _writer = self.writer().await;
        if upsert && !self.is_sqlite {
            self.seed_document(collection, key).await?;
        }

        let mut tx = self.pool.begin().await.map_err(sql_error)?;

        let row = sqlx::query(self.select_for_update())
            .bind(collection)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_error)?;

        let (mut doc, is_new) = match row {
            Some(row) => (Self::read_document(&row)?, false),
            None if upsert => (Document::new(), true),
            None => return Ok(None),
        };

        let out = apply(&mut doc)?;
        let data = serde_json::to_string(&doc).map_err(|e| StorageError::Backend(e.to_string()))?;

        if is_new {
            sqlx::query(INSERT_DOCUMENT)
                .bind(collection)
                .bind(key)
                .bind(&data)
                .execute(&mut *tx)
                .await
                .map_err(|e| insert_error(e, collection, key))?;
        } else {
            sqlx::query("UPDATE record_store SET data = ? WHERE collection = ? AND record_key = ?")
                .bind(&data)
                .bind(collection)
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(sql_error)?;
        }

        tx.commit().await.map_err(sql_error)?;
        Ok(Some(out))
    }

    /// Queue behind other writers of this backend. No-op outside SQLite.
    async fn writer(&self) -> Option<MutexGuard<'_, ()>> {
        match &self.write_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Create an empty document for `key` unless one exists. Runs outside
    /// the write transaction so its locks are released on return.
    async fn seed_document(&self, collection: &str, key: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT IGNORE INTO record_store (collection, record_key, data) VALUES (?, ?, '{}')")
            .bind(collection)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(sql_error)?;
        Ok(())
    }

    /// Fetch the documents that exist among `keys`.
    async fn fetch_documents(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, Document)>, StorageError> {
        let mut found = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(IN_CHUNK_SIZE) {
            let sql = format!(
                "SELECT record_key, data FROM record_store WHERE collection = ? AND record_key IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(collection);
            for key in chunk {
                query = query.bind(key);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(sql_error)?;
            for row in rows {
                found.push((Self::read_key(&row)?, Self::read_document(&row)?));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn name(&self) -> &'static str {
        "sql"
    }

    async fn upsert(&self, collection: &str, key: &str, fields: &Document) -> Result<(), StorageError> {
        for field in fields.keys() {
            check_field_name(field)?;
        }
        self.modify(collection, key, true, |doc| {
            for (field, value) in fields {
                doc.insert(field.clone(), value.clone());
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        key: &str,
        projection: Option<&[String]>,
    ) -> Result<Option<Document>, StorageError> {
        let row = sqlx::query("SELECT data FROM record_store WHERE collection = ? AND record_key = ?")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_error)?;

        let doc = row.map(|r| Self::read_document(&r)).transpose()?;
        Ok(match projection {
            Some(fields) => doc.map(|d| project(d, fields)),
            None => doc,
        })
    }

    async fn find_many(
        &self,
        collection: &str,
        keys: &[String],
        projection: Option<&[String]>,
    ) -> Result<Vec<(String, Document)>, StorageError> {
        let found = self.fetch_documents(collection, keys).await?;
        Ok(match projection {
            Some(fields) => found.into_iter().map(|(k, d)| (k, project(d, fields))).collect(),
            None => found,
        })
    }

    async fn unset_fields(&self, collection: &str, keys: &[String], fields: &[String]) -> Result<(), StorageError> {
        for field in fields {
            check_field_name(field)?;
        }
        let mut first_error = None;
        for key in keys {
            let result = self
                .modify(collection, key, false, |doc| {
                    for field in fields {
                        doc.remove(field);
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn increment(&self, collection: &str, key: &str, field: &str, delta: i64) -> Result<i64, StorageError> {
        check_field_name(field)?;
        let value = self
            .modify(collection, key, true, |doc| apply_increment(doc, collection, key, field, delta))
            .await?;
        value.ok_or_else(|| StorageError::Backend(format!("Increment on '{}' wrote nothing", key)))
    }

    async fn delete(&self, collection: &str, keys: &[String]) -> Result<(), StorageError> {
        let _writer = self.writer().await;
        for chunk in keys.chunks(IN_CHUNK_SIZE) {
            let sql = format!(
                "DELETE FROM record_store WHERE collection = ? AND record_key IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(collection);
            for key in chunk {
                query = query.bind(key);
            }
            let result = query.execute(&self.pool).await.map_err(sql_error)?;
            debug!(collection, deleted = result.rows_affected(), "sql delete");
        }
        Ok(())
    }

    async fn exists(&self, collection: &str, keys: &[String]) -> Result<Vec<bool>, StorageError> {
        let mut present = HashSet::new();
        for chunk in keys.chunks(IN_CHUNK_SIZE) {
            let sql = format!(
                "SELECT record_key FROM record_store WHERE collection = ? AND record_key IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(collection);
            for key in chunk {
                query = query.bind(key);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(sql_error)?;
            for row in rows {
                present.insert(Self::read_key(&row)?);
            }
        }
        Ok(keys.iter().map(|k| present.contains(k)).collect())
    }

    async fn set_add(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in keys {
            let result = self
                .modify(collection, key, true, |doc| add_members(doc, collection, key, members))
                .await;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn set_remove(&self, collection: &str, keys: &[String], members: &[String]) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in keys {
            let result = self
                .modify(collection, key, false, |doc| remove_members(doc, collection, key, members))
                .await;
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn set_pop(&self, collection: &str, key: &str) -> Result<Option<String>, StorageError> {
        let popped = self
            .modify(collection, key, false, |doc| take_random_member(doc, collection, key))
            .await?;
        Ok(popped.flatten())
    }

    async fn set_members(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, Vec<String>)>, StorageError> {
        self.fetch_documents(collection, keys)
            .await?
            .into_iter()
            .map(|(key, doc)| {
                let members = members_of(&doc, collection, &key)?;
                Ok((key, members))
            })
            .collect()
    }

    async fn sets_containing(&self, collection: &str, keys: &[String], member: &str) -> Result<Vec<String>, StorageError> {
        let members = self.set_members(collection, keys).await?;
        Ok(members
            .into_iter()
            .filter(|(_, m)| m.iter().any(|x| x == member))
            .map(|(k, _)| k)
            .collect())
    }

    async fn set_counts(&self, collection: &str, keys: &[String]) -> Result<Vec<(String, usize)>, StorageError> {
        let members = self.set_members(collection, keys).await?;
        Ok(members.into_iter().map(|(k, m)| (k, m.len())).collect())
    }
}
