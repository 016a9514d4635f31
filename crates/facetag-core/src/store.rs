//! Mapping store interface and an in-memory implementation.

use crate::types::{NewPersonMap, PersonMap};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("mapping backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("mapping store lock poisoned")]
    Poisoned,
    #[error("corrupt mapping row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapField {
    ForeignId,
    LocalId,
    LocalEntityType,
}

impl MapField {
    /// Column name in persistent backends.
    pub fn column(self) -> &'static str {
        match self {
            MapField::ForeignId => "foreign_id",
            MapField::LocalId => "local_id",
            MapField::LocalEntityType => "local_entity_type",
        }
    }

    fn value_of(self, row: &PersonMap) -> &str {
        match self {
            MapField::ForeignId => &row.foreign_id,
            MapField::LocalId => &row.local_id,
            MapField::LocalEntityType => &row.local_entity_type,
        }
    }
}

/// One condition: the field must equal one of `values`. A single value is
/// plain equality; an empty list matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: MapField,
    pub values: Vec<String>,
}

/// Conjunction of field conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapQuery {
    conditions: Vec<Condition>,
}

impl MapQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: MapField, value: impl Into<String>) -> Self {
        self.conditions.push(Condition {
            field,
            values: vec![value.into()],
        });
        self
    }

    pub fn any_of<I, S>(mut self, field: MapField, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conditions.push(Condition {
            field,
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// True when some IN-list is empty, so no row can match.
    pub fn is_unsatisfiable(&self) -> bool {
        self.conditions.iter().any(|c| c.values.is_empty())
    }

    pub fn matches(&self, row: &PersonMap) -> bool {
        self.conditions.iter().all(|c| {
            let value = c.field.value_of(row);
            c.values.iter().any(|v| v == value)
        })
    }
}

/// Persistent table of [`PersonMap`] rows.
///
/// Implementations return rows ordered by ascending id, so the oldest
/// mapping comes first.
pub trait MappingStore {
    fn create(&self, row: NewPersonMap) -> Result<PersonMap, StoreError>;
    fn query(&self, query: &MapQuery) -> Result<Vec<i64>, StoreError>;
    fn load_multiple(&self, ids: &[i64]) -> Result<Vec<PersonMap>, StoreError>;
    /// Delete the given rows, returning how many existed.
    fn delete(&self, rows: &[PersonMap]) -> Result<usize, StoreError>;
    fn count(&self, query: &MapQuery) -> Result<usize, StoreError>;

    fn find(&self, query: &MapQuery) -> Result<Vec<PersonMap>, StoreError> {
        let ids = self.query(query)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.load_multiple(&ids)
    }
}

impl<T: MappingStore + ?Sized> MappingStore for &T {
    fn create(&self, row: NewPersonMap) -> Result<PersonMap, StoreError> {
        (**self).create(row)
    }
    fn query(&self, query: &MapQuery) -> Result<Vec<i64>, StoreError> {
        (**self).query(query)
    }
    fn load_multiple(&self, ids: &[i64]) -> Result<Vec<PersonMap>, StoreError> {
        (**self).load_multiple(ids)
    }
    fn delete(&self, rows: &[PersonMap]) -> Result<usize, StoreError> {
        (**self).delete(rows)
    }
    fn count(&self, query: &MapQuery) -> Result<usize, StoreError> {
        (**self).count(query)
    }
}

#[derive(Default)]
struct MemoryTable {
    next_id: i64,
    rows: BTreeMap<i64, PersonMap>,
}

/// Process-local mapping table, used by tests and embedders without a database.
#[derive(Default)]
pub struct MemoryMappingStore {
    table: Mutex<MemoryTable>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, oldest first.
    pub fn rows(&self) -> Result<Vec<PersonMap>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.values().cloned().collect())
    }
}

impl MappingStore for MemoryMappingStore {
    fn create(&self, row: NewPersonMap) -> Result<PersonMap, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        table.next_id += 1;
        let now = Utc::now();
        let stored = PersonMap {
            id: table.next_id,
            foreign_id: row.foreign_id,
            local_id: row.local_id,
            local_entity_type: row.local_entity_type,
            created: now,
            changed: now,
        };
        table.rows.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn query(&self, query: &MapQuery) -> Result<Vec<i64>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table
            .rows
            .values()
            .filter(|row| query.matches(row))
            .map(|row| row.id)
            .collect())
    }

    fn load_multiple(&self, ids: &[i64]) -> Result<Vec<PersonMap>, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        let mut rows: Vec<PersonMap> = ids
            .iter()
            .filter_map(|id| table.rows.get(id).cloned())
            .collect();
        rows.sort_by_key(|row| row.id);
        rows.dedup_by_key(|row| row.id);
        Ok(rows)
    }

    fn delete(&self, rows: &[PersonMap]) -> Result<usize, StoreError> {
        let mut table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(rows
            .iter()
            .filter(|row| table.rows.remove(&row.id).is_some())
            .count())
    }

    fn count(&self, query: &MapQuery) -> Result<usize, StoreError> {
        let table = self.table.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(table.rows.values().filter(|row| query.matches(row)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FILE_ENTITY_TYPE;

    fn row(foreign: &str, local: &str, kind: &str) -> NewPersonMap {
        NewPersonMap {
            foreign_id: foreign.into(),
            local_id: local.into(),
            local_entity_type: kind.into(),
        }
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let store = MemoryMappingStore::new();
        let a = store.create(row("p1", "1", "node")).unwrap();
        let b = store.create(row("f1", "9", FILE_ENTITY_TYPE)).unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.created, a.changed);
    }

    #[test]
    fn test_equality_and_in_conditions() {
        let store = MemoryMappingStore::new();
        store.create(row("p1", "1", "node")).unwrap();
        store.create(row("p2", "2", "node")).unwrap();
        store.create(row("f1", "1", FILE_ENTITY_TYPE)).unwrap();

        let q = MapQuery::new()
            .eq(MapField::LocalId, "1")
            .eq(MapField::LocalEntityType, "node");
        let found = store.find(&q).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].foreign_id, "p1");

        let q = MapQuery::new().any_of(MapField::ForeignId, ["p1", "p2", "nope"]);
        assert_eq!(store.count(&q).unwrap(), 2);
    }

    #[test]
    fn test_empty_in_list_matches_nothing() {
        let store = MemoryMappingStore::new();
        store.create(row("p1", "1", "node")).unwrap();
        let q = MapQuery::new().any_of(MapField::ForeignId, Vec::<String>::new());
        assert!(q.is_unsatisfiable());
        assert!(store.find(&q).unwrap().is_empty());
    }

    #[test]
    fn test_delete_reports_existing_rows_only() {
        let store = MemoryMappingStore::new();
        let a = store.create(row("p1", "1", "node")).unwrap();
        assert_eq!(store.delete(&[a.clone()]).unwrap(), 1);
        assert_eq!(store.delete(&[a]).unwrap(), 0);
        assert!(store.rows().unwrap().is_empty());
    }
}
