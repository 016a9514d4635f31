//! Tag updates produced by queued detection, waiting for the host.

use crate::now_millis;
use facetag_core::types::{LocalEntityRef, TagUpdate};
use rusqlite::{params, Connection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("undecodable tags for {entity}: {source}")]
    Tags {
        entity: LocalEntityRef,
        #[source]
        source: serde_json::Error,
    },
}

pub struct TagOutbox<'c> {
    conn: &'c Connection,
}

impl<'c> TagOutbox<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Store `update`, replacing any unclaimed update for the same field.
    pub fn push(&self, update: &TagUpdate) -> Result<(), OutboxError> {
        let tags = serde_json::to_string(&update.tags).map_err(|source| OutboxError::Tags {
            entity: update.entity.clone(),
            source,
        })?;
        self.conn.execute(
            "INSERT INTO tag_outbox (entity_type, entity_id, tag_field, tags, created)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(entity_type, entity_id, tag_field) DO UPDATE SET tags = excluded.tags, created = excluded.created",
            params![
                update.entity.entity_type,
                update.entity.local_id,
                update.tag_field,
                tags,
                now_millis()
            ],
        )?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize, OutboxError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tag_outbox", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, OutboxError> {
        Ok(self.len()? == 0)
    }

    /// Remove and return every pending update, oldest first.
    pub fn take_all(&self) -> Result<Vec<TagUpdate>, OutboxError> {
        let tx = self.conn.unchecked_transaction()?;
        let raw = {
            let mut stmt =
                tx.prepare("SELECT entity_type, entity_id, tag_field, tags FROM tag_outbox ORDER BY id")?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        let mut updates = Vec::with_capacity(raw.len());
        for (entity_type, entity_id, tag_field, tags) in raw {
            let entity = LocalEntityRef::new(entity_type, entity_id);
            let tags = serde_json::from_str(&tags).map_err(|source| OutboxError::Tags {
                entity: entity.clone(),
                source,
            })?;
            updates.push(TagUpdate {
                entity,
                tag_field,
                tags,
            });
        }
        tx.execute("DELETE FROM tag_outbox", [])?;
        tx.commit()?;
        Ok(updates)
    }
}
