//! `person_map` table behind the [`MappingStore`] trait.

use crate::{from_millis, now_millis};
use facetag_core::store::{MapQuery, MappingStore, StoreError};
use facetag_core::types::{NewPersonMap, PersonMap};
use rusqlite::{params, params_from_iter, Connection, Row};

const COLUMNS: &str = "id, foreign_id, local_id, local_entity_type, created, changed";
const ID_CHUNK: usize = 500;

pub struct SqliteMappingStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteMappingStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

/// `WHERE` clause and bound values for a query. Single values compare with
/// `=`, longer lists with `IN`.
fn where_clause(query: &MapQuery) -> (String, Vec<&str>) {
    let mut parts = Vec::new();
    let mut values = Vec::new();
    for cond in query.conditions() {
        let column = cond.field.column();
        if cond.values.len() == 1 {
            parts.push(format!("{column} = ?"));
        } else {
            let marks = vec!["?"; cond.values.len()].join(", ");
            parts.push(format!("{column} IN ({marks})"));
        }
        values.extend(cond.values.iter().map(String::as_str));
    }
    if parts.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", parts.join(" AND ")), values)
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<(PersonMap, i64, i64)> {
    let created: i64 = row.get(4)?;
    let changed: i64 = row.get(5)?;
    let map = PersonMap {
        id: row.get(0)?,
        foreign_id: row.get(1)?,
        local_id: row.get(2)?,
        local_entity_type: row.get(3)?,
        created: Default::default(),
        changed: Default::default(),
    };
    Ok((map, created, changed))
}

fn with_timestamps((mut map, created, changed): (PersonMap, i64, i64)) -> Result<PersonMap, StoreError> {
    let id = map.id;
    let corrupt = |field: &str, value: i64| StoreError::Corrupt {
        id,
        reason: format!("{field} timestamp {value} out of range"),
    };
    let created_at = from_millis(created).ok_or_else(|| corrupt("created", created))?;
    let changed_at = from_millis(changed).ok_or_else(|| corrupt("changed", changed))?;
    map.created = created_at;
    map.changed = changed_at;
    Ok(map)
}

impl MappingStore for SqliteMappingStore<'_> {
    fn create(&self, row: NewPersonMap) -> Result<PersonMap, StoreError> {
        let now = now_millis();
        self.conn
            .execute(
                "INSERT INTO person_map (foreign_id, local_id, local_entity_type, created, changed)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![row.foreign_id, row.local_id, row.local_entity_type, now],
            )
            .map_err(StoreError::backend)?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, foreign_id = %row.foreign_id, local_entity_type = %row.local_entity_type, "person map row created");
        with_timestamps((
            PersonMap {
                id,
                foreign_id: row.foreign_id,
                local_id: row.local_id,
                local_entity_type: row.local_entity_type,
                created: Default::default(),
                changed: Default::default(),
            },
            now,
            now,
        ))
    }

    fn query(&self, query: &MapQuery) -> Result<Vec<i64>, StoreError> {
        if query.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let (clause, values) = where_clause(query);
        let sql = format!("SELECT id FROM person_map{clause} ORDER BY id");
        let mut stmt = self.conn.prepare(&sql).map_err(StoreError::backend)?;
        let ids = stmt
            .query_map(params_from_iter(values), |r| r.get::<_, i64>(0))
            .map_err(StoreError::backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::backend)?;
        Ok(ids)
    }

    fn load_multiple(&self, ids: &[i64]) -> Result<Vec<PersonMap>, StoreError> {
        let mut rows = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let marks = vec!["?"; chunk.len()].join(", ");
            let sql = format!("SELECT {COLUMNS} FROM person_map WHERE id IN ({marks})");
            let mut stmt = self.conn.prepare(&sql).map_err(StoreError::backend)?;
            let raw = stmt
                .query_map(params_from_iter(chunk), read_row)
                .map_err(StoreError::backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::backend)?;
            for r in raw {
                rows.push(with_timestamps(r)?);
            }
        }
        rows.sort_by_key(|r| r.id);
        rows.dedup_by_key(|r| r.id);
        Ok(rows)
    }

    fn delete(&self, rows: &[PersonMap]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction().map_err(StoreError::backend)?;
        let mut removed = 0;
        {
            let mut stmt = tx
                .prepare("DELETE FROM person_map WHERE id = ?1")
                .map_err(StoreError::backend)?;
            for row in rows {
                removed += stmt.execute(params![row.id]).map_err(StoreError::backend)?;
            }
        }
        tx.commit().map_err(StoreError::backend)?;
        Ok(removed)
    }

    fn count(&self, query: &MapQuery) -> Result<usize, StoreError> {
        if query.is_unsatisfiable() {
            return Ok(0);
        }
        let (clause, values) = where_clause(query);
        let sql = format!("SELECT COUNT(*) FROM person_map{clause}");
        let n: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |r| r.get(0))
            .map_err(StoreError::backend)?;
        Ok(n as usize)
    }
}
