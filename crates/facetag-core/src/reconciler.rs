//! Person/face reconciliation between local person entities and the remote
//! person group.

use crate::service::{FaceService, ServiceError};
use crate::settings::Settings;
use crate::store::{MapField, MapQuery, MappingStore, StoreError};
use crate::types::{
    FaceImage, LocalEntityRef, NewPersonMap, PersonEntity, PersonMap, RemotePerson,
    FILE_ENTITY_TYPE,
};
use serde::Serialize;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("face service: {0}")]
    Service(#[from] ServiceError),
    #[error("mapping store: {0}")]
    Store(#[from] StoreError),
    #[error("{0} is not a configured person entity")]
    NotAPerson(LocalEntityRef),
    #[error("field {0:?} is not configured for face detection")]
    NotADetectionField(String),
}

impl SyncError {
    /// Whether the same work could succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Service(e) => e.is_transient(),
            SyncError::Store(StoreError::Backend(_)) => true,
            _ => false,
        }
    }
}

/// What a single person sync changed on the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub person_id: String,
    pub created: bool,
    pub renamed: bool,
    pub faces_added: Vec<String>,
    pub faces_removed: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        !self.created && !self.renamed && self.faces_added.is_empty() && self.faces_removed.is_empty()
    }
}

/// Keeps remote persons and their persisted faces in step with local
/// person entities, recording every correlation in the mapping store.
pub struct Reconciler<S, M> {
    service: S,
    store: M,
    settings: Settings,
}

impl<S: FaceService, M: MappingStore> Reconciler<S, M> {
    pub fn new(service: S, store: M, settings: Settings) -> Self {
        Self {
            service,
            store,
            settings,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mapping row for a local person entity. `Ok(None)` means the entity
    /// was never mapped; lookup failures are errors.
    ///
    /// When duplicates exist the oldest row wins.
    pub fn person_mapping(&self, entity: &LocalEntityRef) -> Result<Option<PersonMap>, SyncError> {
        let rows = self.store.find(
            &MapQuery::new()
                .eq(MapField::LocalId, entity.local_id.as_str())
                .eq(MapField::LocalEntityType, entity.entity_type.as_str()),
        )?;
        if rows.len() > 1 {
            tracing::warn!(entity = %entity, count = rows.len(), "duplicate person mappings, using the oldest");
        }
        Ok(rows.into_iter().next())
    }

    fn face_rows(&self, image: &FaceImage) -> Result<Vec<PersonMap>, SyncError> {
        Ok(self.store.find(
            &MapQuery::new()
                .eq(MapField::LocalId, image.file_id.as_str())
                .eq(MapField::LocalEntityType, FILE_ENTITY_TYPE),
        )?)
    }

    /// Bring the remote person for `current` in line with it.
    ///
    /// `previous` is the last snapshot the caller saw. Without one the
    /// remote record is fetched and treated as the previous state.
    pub fn sync_person(
        &self,
        current: &PersonEntity,
        previous: Option<&PersonEntity>,
    ) -> Result<SyncReport, SyncError> {
        if !self.settings.is_person(current) {
            return Err(SyncError::NotAPerson(current.local_ref()));
        }
        match self.person_mapping(&current.local_ref())? {
            None => self.create_person(current),
            Some(mapping) => self.update_person(current, previous, mapping),
        }
    }

    fn create_person(&self, entity: &PersonEntity) -> Result<SyncReport, SyncError> {
        let person_id = self.service.create_person(&entity.label)?;
        self.store.create(NewPersonMap::person(&person_id, entity))?;
        tracing::info!(entity = %entity.local_ref(), person_id = %person_id, "created remote person");

        let mut report = SyncReport {
            person_id,
            created: true,
            ..SyncReport::default()
        };
        let mut enrolled = BTreeSet::new();
        for image in &entity.images {
            if !enrolled.insert(image.file_id.as_str()) {
                continue;
            }
            let stale = self.face_rows(image)?;
            if !stale.is_empty() {
                self.store.delete(&stale)?;
            }
            report.faces_added.push(self.enroll_face(&report.person_id, image)?);
        }
        Ok(report)
    }

    fn enroll_face(&self, person_id: &str, image: &FaceImage) -> Result<String, SyncError> {
        let face_id = self.service.add_face(person_id, &image.uri)?;
        self.store.create(NewPersonMap::face(&face_id, image))?;
        tracing::debug!(person_id, face_id = %face_id, file = %image.file_id, "enrolled face");
        Ok(face_id)
    }

    /// Remote person for a mapping, or `None` after dropping a mapping whose
    /// person no longer exists remotely.
    fn fetch_remote(&self, mapping: &PersonMap) -> Result<Option<RemotePerson>, SyncError> {
        match self.service.get_person(&mapping.foreign_id) {
            Ok(person) => Ok(Some(person)),
            Err(e) if e.status() == Some(404) => {
                tracing::warn!(
                    entity = %mapping.local_ref(),
                    person_id = %mapping.foreign_id,
                    "mapped person is gone remotely, recreating"
                );
                self.store.delete(std::slice::from_ref(mapping))?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update_person(
        &self,
        current: &PersonEntity,
        previous: Option<&PersonEntity>,
        mapping: PersonMap,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport {
            person_id: mapping.foreign_id.clone(),
            ..SyncReport::default()
        };

        let mut remote = None;
        let renamed = match previous {
            Some(prev) => prev.label != current.label,
            None => {
                let Some(fetched) = self.fetch_remote(&mapping)? else {
                    return self.create_person(current);
                };
                let changed = fetched.name != current.label;
                remote = Some(fetched);
                changed
            }
        };
        if renamed {
            self.service.update_person(&report.person_id, &current.label)?;
            report.renamed = true;
            tracing::info!(person_id = %report.person_id, name = %current.label, "renamed remote person");
        }

        let images_changed = previous.map_or(true, |prev| prev.images != current.images);
        if !images_changed {
            return Ok(report);
        }
        let remote = match remote {
            Some(r) => r,
            None => match self.fetch_remote(&mapping)? {
                Some(r) => r,
                None => return self.create_person(current),
            },
        };
        self.reconcile_faces(current, &remote, &mut report)?;
        Ok(report)
    }

    /// Enroll images missing remotely and delete remote faces that no
    /// current image accounts for.
    fn reconcile_faces(
        &self,
        current: &PersonEntity,
        remote: &RemotePerson,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let remote_faces: BTreeSet<&str> = remote.persisted_face_ids.iter().map(String::as_str).collect();
        let mut kept: BTreeSet<String> = BTreeSet::new();

        for image in &current.images {
            let rows = self.face_rows(image)?;
            let live = rows.iter().find(|row| {
                remote_faces.contains(row.foreign_id.as_str()) || kept.contains(&row.foreign_id)
            });
            if let Some(row) = live {
                kept.insert(row.foreign_id.clone());
                continue;
            }
            if !rows.is_empty() {
                tracing::debug!(file = %image.file_id, "mapped face missing remotely, re-enrolling");
                self.store.delete(&rows)?;
            }
            let face_id = self.enroll_face(&report.person_id, image)?;
            kept.insert(face_id.clone());
            report.faces_added.push(face_id);
        }

        for face_id in remote.persisted_face_ids.iter().filter(|id| !kept.contains(*id)) {
            self.service.delete_face(&report.person_id, face_id)?;
            tracing::debug!(person_id = %report.person_id, face_id = %face_id, "deleted orphaned face");
            report.faces_removed.push(face_id.clone());
        }
        if !report.faces_removed.is_empty() {
            let stale = self.store.find(
                &MapQuery::new()
                    .any_of(MapField::ForeignId, report.faces_removed.iter().cloned())
                    .eq(MapField::LocalEntityType, FILE_ENTITY_TYPE),
            )?;
            self.store.delete(&stale)?;
        }
        Ok(())
    }

    /// Forget every mapping row for a deleted local entity.
    ///
    /// Remote persons and faces are left in place; a later reset or resync
    /// removes them.
    pub fn delete_entity(&self, entity_type: &str, local_id: &str) -> Result<usize, SyncError> {
        let rows = self.store.find(
            &MapQuery::new()
                .eq(MapField::LocalId, local_id)
                .eq(MapField::LocalEntityType, entity_type),
        )?;
        let removed = self.store.delete(&rows)?;
        if removed > 0 {
            tracing::info!(entity_type, local_id, removed, "dropped mappings for deleted entity");
        }
        Ok(removed)
    }
}
