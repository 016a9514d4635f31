//! facetag-store — SQLite persistence for facetag.
//!
//! One database file holds the person map, the deferred work queues and
//! the outbox of tag updates waiting for the host to apply them.

pub mod outbox;
pub mod person_map;
pub mod queue;
pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

pub use outbox::TagOutbox;
pub use person_map::SqliteMappingStore;
pub use queue::SqliteQueue;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Owner of the SQLite connection. Not `Sync`; keep it on one thread.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::apply_schema(&conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        schema::apply_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn mappings(&self) -> SqliteMappingStore<'_> {
        SqliteMappingStore::new(&self.conn)
    }

    pub fn queue(&self) -> SqliteQueue<'_> {
        SqliteQueue::new(&self.conn)
    }

    pub fn outbox(&self) -> TagOutbox<'_> {
        TagOutbox::new(&self.conn)
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
