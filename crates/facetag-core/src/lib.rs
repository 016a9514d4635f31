//! facetag-core — Person/face reconciliation and face tagging.
//!
//! Keeps local person entities in step with a remote face-recognition
//! person group and maps identified faces back to local entities. The
//! remote service and the mapping table are reached only through the
//! [`FaceService`] and [`MappingStore`] traits.

pub mod jobs;
pub mod operations;
pub mod pipeline;
pub mod reconciler;
pub mod service;
pub mod settings;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use jobs::{JobDispatcher, JobOutcome, QueueName, WorkItem, WorkQueue};
pub use operations::{Operations, OperationsError, TrainingState};
pub use pipeline::Pipeline;
pub use reconciler::{Reconciler, SyncError, SyncReport};
pub use service::{FaceService, ServiceError, MAX_IDENTIFY_BATCH};
pub use settings::{ConfigError, Settings};
pub use store::{MapField, MapQuery, MappingStore, MemoryMappingStore, StoreError};
pub use types::{
    ContentEntity, FaceImage, LocalEntityRef, PersonEntity, PersonMap, TagUpdate, FILE_ENTITY_TYPE,
};
