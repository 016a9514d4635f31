//! `work_queue` table behind the [`WorkQueue`] trait.

use crate::now_millis;
use facetag_core::jobs::{QueueError, QueueName, QueuedItem, WorkItem, WorkQueue};
use rusqlite::{params, Connection, OptionalExtension};

pub struct SqliteQueue<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteQueue<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Pending counts for every queue, in drain order.
    pub fn counts(&self) -> Result<Vec<(QueueName, usize)>, QueueError> {
        QueueName::ALL
            .into_iter()
            .map(|q| Ok((q, self.len(q)?)))
            .collect()
    }
}

fn decode(id: i64, payload: &str) -> Result<WorkItem, QueueError> {
    serde_json::from_str(payload).map_err(|source| QueueError::Payload { id, source })
}

fn encode(id: i64, item: &WorkItem) -> Result<String, QueueError> {
    serde_json::to_string(item).map_err(|source| QueueError::Payload { id, source })
}

impl WorkQueue for SqliteQueue<'_> {
    fn push(&self, item: WorkItem) -> Result<(), QueueError> {
        let queue = item.queue();
        let key = item.dedup_key();
        let tx = self.conn.unchecked_transaction().map_err(QueueError::backend)?;

        if let WorkItem::DeletedEntity { .. } = item {
            // Sync keys equal the entity key; detection keys append `#field`.
            let cancelled = tx
                .execute(
                    "DELETE FROM work_queue
                     WHERE queue IN (?1, ?2)
                       AND (item_key = ?3 OR substr(item_key, 1, length(?3) + 1) = ?3 || '#')",
                    params![
                        QueueName::ProcessPerson.as_str(),
                        QueueName::DetectFaces.as_str(),
                        key
                    ],
                )
                .map_err(QueueError::backend)?;
            if cancelled > 0 {
                tracing::info!(entity = %key, cancelled, "entity deleted, cancelled pending work");
            }
        }

        let pending: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, payload FROM work_queue WHERE queue = ?1 AND item_key = ?2",
                params![queue.as_str(), key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(QueueError::backend)?;

        match pending {
            Some((id, payload)) => {
                let merged = decode(id, &payload)?.coalesce(item);
                tx.execute(
                    "UPDATE work_queue SET payload = ?1, attempts = 0, last_error = NULL WHERE id = ?2",
                    params![encode(id, &merged)?, id],
                )
                .map_err(QueueError::backend)?;
                tracing::debug!(queue = %queue, key = %key, "coalesced with pending item");
            }
            None => {
                tx.execute(
                    "INSERT INTO work_queue (queue, item_key, payload, created) VALUES (?1, ?2, ?3, ?4)",
                    params![queue.as_str(), key, encode(0, &item)?, now_millis()],
                )
                .map_err(QueueError::backend)?;
                tracing::debug!(queue = %queue, key = %key, "queued item");
            }
        }
        tx.commit().map_err(QueueError::backend)
    }

    fn peek(&self, queue: QueueName, limit: usize) -> Result<Vec<QueuedItem>, QueueError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, payload, attempts FROM work_queue WHERE queue = ?1 ORDER BY id LIMIT ?2")
            .map_err(QueueError::backend)?;
        let raw = stmt
            .query_map(params![queue.as_str(), limit as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, u32>(2)?))
            })
            .map_err(QueueError::backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(QueueError::backend)?;
        let mut items = Vec::with_capacity(raw.len());
        for (id, payload, attempts) in raw {
            match decode(id, &payload) {
                Ok(item) => items.push(QueuedItem { id, item, attempts }),
                Err(e) => {
                    // An undecodable row can never succeed; drop it so it
                    // does not block the rest of the queue.
                    tracing::error!(queue = %queue, id, error = %e, "dropping undecodable queue item");
                    self.complete(id)?;
                }
            }
        }
        Ok(items)
    }

    fn complete(&self, id: i64) -> Result<(), QueueError> {
        self.conn
            .execute("DELETE FROM work_queue WHERE id = ?1", params![id])
            .map_err(QueueError::backend)?;
        Ok(())
    }

    fn release(&self, id: i64, error: &str) -> Result<u32, QueueError> {
        self.conn
            .execute(
                "UPDATE work_queue SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
                params![error, id],
            )
            .map_err(QueueError::backend)?;
        let attempts: Option<u32> = self
            .conn
            .query_row("SELECT attempts FROM work_queue WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(QueueError::backend)?;
        Ok(attempts.unwrap_or(0))
    }

    fn len(&self, queue: QueueName) -> Result<usize, QueueError> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM work_queue WHERE queue = ?1",
                params![queue.as_str()],
                |r| r.get(0),
            )
            .map_err(QueueError::backend)?;
        Ok(n as usize)
    }

    fn clear(&self, queue: QueueName) -> Result<usize, QueueError> {
        let removed = self
            .conn
            .execute("DELETE FROM work_queue WHERE queue = ?1", params![queue.as_str()])
            .map_err(QueueError::backend)?;
        if removed > 0 {
            tracing::info!(queue = %queue, removed, "cleared queue");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use facetag_core::types::{ContentEntity, PersonEntity};

    fn jane(label: &str) -> PersonEntity {
        PersonEntity {
            entity_type: "node".into(),
            bundle: "person".into(),
            id: "1".into(),
            label: label.into(),
            images: Vec::new(),
        }
    }

    fn deleted(id: &str) -> WorkItem {
        WorkItem::DeletedEntity {
            entity_type: "node".into(),
            entity_id: id.into(),
        }
    }

    #[test]
    fn test_push_peek_complete_in_order() {
        let db = Database::open_in_memory().unwrap();
        let q = db.queue();
        q.push(deleted("1")).unwrap();
        q.push(deleted("2")).unwrap();

        let pending = q.peek(QueueName::DeletedEntity, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].item, deleted("1"));
        assert_eq!(pending[0].attempts, 0);

        q.complete(pending[0].id).unwrap();
        assert_eq!(q.len(QueueName::DeletedEntity).unwrap(), 1);
    }

    #[test]
    fn test_same_entity_coalesces_keeping_oldest_previous() {
        let db = Database::open_in_memory().unwrap();
        let q = db.queue();
        q.push(WorkItem::ProcessPerson {
            person: jane("B"),
            previous: Some(jane("A")),
        })
        .unwrap();
        q.push(WorkItem::ProcessPerson {
            person: jane("C"),
            previous: Some(jane("B")),
        })
        .unwrap();

        let pending = q.peek(QueueName::ProcessPerson, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].item,
            WorkItem::ProcessPerson {
                person: jane("C"),
                previous: Some(jane("A")),
            }
        );
    }

    #[test]
    fn test_release_counts_attempts_and_push_resets_them() {
        let db = Database::open_in_memory().unwrap();
        let q = db.queue();
        q.push(deleted("1")).unwrap();
        let id = q.peek(QueueName::DeletedEntity, 1).unwrap()[0].id;
        assert_eq!(q.release(id, "boom").unwrap(), 1);
        assert_eq!(q.release(id, "boom").unwrap(), 2);
        q.push(deleted("1")).unwrap();
        assert_eq!(q.peek(QueueName::DeletedEntity, 1).unwrap()[0].attempts, 0);
        assert_eq!(q.release(999, "gone").unwrap(), 0);
    }

    #[test]
    fn test_counts_and_clear() {
        let db = Database::open_in_memory().unwrap();
        let q = db.queue();
        q.push(deleted("1")).unwrap();
        q.push(WorkItem::ProcessPerson {
            person: jane("A"),
            previous: None,
        })
        .unwrap();
        let counts = q.counts().unwrap();
        assert_eq!(
            counts,
            vec![
                (QueueName::DeletedEntity, 1),
                (QueueName::ProcessPerson, 1),
                (QueueName::DetectFaces, 0),
            ]
        );
        assert_eq!(q.clear(QueueName::DeletedEntity).unwrap(), 1);
        assert_eq!(q.len(QueueName::DeletedEntity).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_payload_is_dropped_without_blocking_queue() {
        let db = Database::open_in_memory().unwrap();
        db.conn_for_tests()
            .execute(
                "INSERT INTO work_queue (queue, item_key, payload, created) VALUES ('deleted_entity', 'k', 'not json', 0)",
                [],
            )
            .unwrap();
        let q = db.queue();
        q.push(deleted("1")).unwrap();

        let pending = q.peek(QueueName::DeletedEntity, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item, deleted("1"));
        assert_eq!(q.len(QueueName::DeletedEntity).unwrap(), 1);
    }

    #[test]
    fn test_deletion_cancels_pending_work_for_entity() {
        let db = Database::open_in_memory().unwrap();
        let q = db.queue();
        let content = |id: &str| ContentEntity {
            entity_type: "node".into(),
            bundle: "article".into(),
            id: id.into(),
            images: Default::default(),
        };
        q.push(WorkItem::ProcessPerson {
            person: jane("A"),
            previous: None,
        })
        .unwrap();
        q.push(WorkItem::DetectFaces {
            content: content("1"),
            field_name: "field_image".into(),
        })
        .unwrap();
        // Shares the "node/1" prefix but is a different entity.
        q.push(WorkItem::DetectFaces {
            content: content("10"),
            field_name: "field_image".into(),
        })
        .unwrap();
        q.push(deleted("1")).unwrap();

        assert_eq!(q.len(QueueName::ProcessPerson).unwrap(), 0);
        let detect = q.peek(QueueName::DetectFaces, 10).unwrap();
        assert_eq!(detect.len(), 1);
        assert_eq!(detect[0].item.entity().local_id, "10");
        assert_eq!(q.len(QueueName::DeletedEntity).unwrap(), 1);
    }
}
