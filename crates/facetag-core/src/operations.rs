//! Administrative operations on the person group as a whole.

use crate::reconciler::{Reconciler, SyncError};
use crate::service::{FaceService, ServiceError};
use crate::store::{MapField, MapQuery, MappingStore, StoreError};
use crate::types::{LocalEntityRef, PersonEntity, RemotePerson, TrainingStatus, FILE_ENTITY_TYPE};
use serde::Serialize;
use thiserror::Error;

/// Display name given to a person group created at bootstrap.
pub const DEFAULT_GROUP_NAME: &str = "People recognised by facetag";

/// Error code returned with a 404 when the group exists but was never trained.
const NOT_TRAINED_CODE: &str = "PersonGroupNotTrained";

#[derive(Error, Debug)]
pub enum OperationsError {
    #[error("face service: {0}")]
    Service(#[from] ServiceError),
    #[error("mapping store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("the configured person group does not exist")]
    PersonGroupMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingState {
    NeverTrained,
    Reported(TrainingStatus),
}

/// Share of local people that have a remote person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub mapped: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        ((self.mapped.min(self.total) * 100) / self.total) as u32
    }
}

/// Outcome of a bulk submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub submitted: usize,
    pub failed: Vec<(LocalEntityRef, String)>,
    pub trained: bool,
}

pub struct Operations<S, M> {
    reconciler: Reconciler<S, M>,
}

impl<S: FaceService, M: MappingStore> Operations<S, M> {
    pub fn new(reconciler: Reconciler<S, M>) -> Self {
        Self { reconciler }
    }

    pub fn reconciler(&self) -> &Reconciler<S, M> {
        &self.reconciler
    }

    fn service(&self) -> &S {
        self.reconciler.service()
    }

    fn store(&self) -> &M {
        self.reconciler.store()
    }

    pub fn check_connection(&self) -> Result<bool, OperationsError> {
        Ok(self.service().check_status()?)
    }

    /// Create the person group unless it already exists. Returns whether
    /// it had to be created.
    pub fn ensure_person_group(&self) -> Result<bool, OperationsError> {
        let group_id = self.service().person_group_id();
        if self
            .service()
            .list_person_groups()?
            .iter()
            .any(|g| g.person_group_id == group_id)
        {
            return Ok(false);
        }
        self.service().create_person_group(DEFAULT_GROUP_NAME)?;
        tracing::info!(group_id, "created person group");
        Ok(true)
    }

    pub fn train(&self) -> Result<(), OperationsError> {
        self.service().train_person_group()?;
        tracing::info!("person group training started");
        Ok(())
    }

    pub fn training_status(&self) -> Result<TrainingState, OperationsError> {
        match self.service().get_training_status() {
            Ok(status) => Ok(TrainingState::Reported(status)),
            Err(e) if e.status() == Some(404) && e.code() == Some(NOT_TRAINED_CODE) => {
                Ok(TrainingState::NeverTrained)
            }
            Err(e) if e.status() == Some(404) => Err(OperationsError::PersonGroupMissing),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete and recreate the person group and forget every mapping.
    /// Returns the number of mapping rows removed.
    pub fn reset(&self) -> Result<usize, OperationsError> {
        match self.service().delete_person_group() {
            Ok(()) => {}
            Err(e) if e.status() == Some(404) => {
                tracing::debug!("person group already absent");
            }
            Err(e) => return Err(e.into()),
        }
        self.service().create_person_group(DEFAULT_GROUP_NAME)?;

        let person_type = self.reconciler.settings().person_entity_type();
        let rows = self.store().find(
            &MapQuery::new().any_of(MapField::LocalEntityType, [person_type, FILE_ENTITY_TYPE]),
        )?;
        let removed = self.store().delete(&rows)?;
        tracing::warn!(removed, "reset person group and cleared mappings");
        Ok(removed)
    }

    /// People from `people` with no person mapping yet.
    pub fn missing_people<'p>(&self, people: &'p [PersonEntity]) -> Result<Vec<&'p PersonEntity>, OperationsError> {
        let mut missing = Vec::new();
        for person in people {
            if self.reconciler.person_mapping(&person.local_ref())?.is_none() {
                missing.push(person);
            }
        }
        Ok(missing)
    }

    /// Sync every unmapped person, then train once if anything was submitted.
    ///
    /// A failing person is recorded and skipped; store failures abort.
    pub fn submit_missing(&self, people: &[PersonEntity]) -> Result<BatchReport, OperationsError> {
        let missing = self.missing_people(people)?;
        self.submit(&missing)
    }

    /// Reset everything and submit all of `people` again.
    pub fn resync_all(&self, people: &[PersonEntity]) -> Result<BatchReport, OperationsError> {
        self.reset()?;
        let all: Vec<&PersonEntity> = people.iter().collect();
        self.submit(&all)
    }

    fn submit(&self, people: &[&PersonEntity]) -> Result<BatchReport, OperationsError> {
        let mut report = BatchReport::default();
        for person in people {
            match self.reconciler.sync_person(person, None) {
                Ok(_) => report.submitted += 1,
                Err(SyncError::Store(e)) => return Err(e.into()),
                Err(e) => {
                    tracing::error!(entity = %person.local_ref(), error = %e, "failed to submit person");
                    report.failed.push((person.local_ref(), e.to_string()));
                }
            }
        }
        if report.submitted > 0 {
            self.train()?;
            report.trained = true;
        }
        tracing::info!(submitted = report.submitted, failed = report.failed.len(), "submission finished");
        Ok(report)
    }

    pub fn progress(&self, total_people: usize) -> Result<Progress, OperationsError> {
        let mapped = self.store().count(
            &MapQuery::new().eq(MapField::LocalEntityType, self.reconciler.settings().person_entity_type()),
        )?;
        Ok(Progress {
            mapped,
            total: total_people,
        })
    }

    pub fn remote_people(&self) -> Result<Vec<RemotePerson>, OperationsError> {
        Ok(self.service().list_people()?)
    }
}
