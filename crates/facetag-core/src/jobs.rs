//! Deferred work: queue items, per-queue jobs and the drain loop.

use crate::pipeline::Pipeline;
use crate::reconciler::{Reconciler, SyncError, SyncReport};
use crate::service::FaceService;
use crate::store::MappingStore;
use crate::types::{ContentEntity, LocalEntityRef, PersonEntity, TagUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    ProcessPerson,
    DetectFaces,
    DeletedEntity,
}

impl QueueName {
    /// Drain order: deletions first so stale rows never feed identification.
    pub const ALL: [QueueName; 3] = [
        QueueName::DeletedEntity,
        QueueName::ProcessPerson,
        QueueName::DetectFaces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::ProcessPerson => "process_person",
            QueueName::DetectFaces => "detect_faces",
            QueueName::DeletedEntity => "deleted_entity",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| QueueError::UnknownQueue(s.to_string()))
    }
}

/// One unit of deferred work, carrying the entity snapshot it was queued with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    ProcessPerson {
        person: PersonEntity,
        #[serde(default)]
        previous: Option<PersonEntity>,
    },
    DetectFaces {
        content: ContentEntity,
        field_name: String,
    },
    DeletedEntity {
        entity_type: String,
        entity_id: String,
    },
}

impl WorkItem {
    pub fn queue(&self) -> QueueName {
        match self {
            WorkItem::ProcessPerson { .. } => QueueName::ProcessPerson,
            WorkItem::DetectFaces { .. } => QueueName::DetectFaces,
            WorkItem::DeletedEntity { .. } => QueueName::DeletedEntity,
        }
    }

    pub fn entity(&self) -> LocalEntityRef {
        match self {
            WorkItem::ProcessPerson { person, .. } => person.local_ref(),
            WorkItem::DetectFaces { content, .. } => content.local_ref(),
            WorkItem::DeletedEntity { entity_type, entity_id } => {
                LocalEntityRef::new(entity_type, entity_id)
            }
        }
    }

    /// Pending items sharing a key coalesce into one.
    pub fn dedup_key(&self) -> String {
        match self {
            WorkItem::DetectFaces { field_name, .. } => format!("{}#{field_name}", self.entity()),
            _ => self.entity().to_string(),
        }
    }

    /// Whether queueing `self` makes the `pending` item obsolete. A deletion
    /// cancels pending sync and detection work for the same entity, since
    /// those items carry a snapshot of an entity that no longer exists.
    pub fn supersedes(&self, pending: &WorkItem) -> bool {
        matches!(self, WorkItem::DeletedEntity { .. })
            && !matches!(pending, WorkItem::DeletedEntity { .. })
            && self.entity() == pending.entity()
    }

    /// Merge a newer item for the same key into this pending one. The
    /// newest snapshot wins, but the oldest `previous` is kept since it is
    /// the last state the remote side saw.
    pub fn coalesce(self, newer: WorkItem) -> WorkItem {
        match (self, newer) {
            (
                WorkItem::ProcessPerson { previous, .. },
                WorkItem::ProcessPerson { person, previous: newer_previous },
            ) => WorkItem::ProcessPerson {
                person,
                previous: previous.or(newer_previous),
            },
            (_, newer) => newer,
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("undecodable queue item {id}: {source}")]
    Payload {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown queue {0:?}")]
    UnknownQueue(String),
    #[error("queue lock poisoned")]
    Poisoned,
}

impl QueueError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        QueueError::Backend(Box::new(err))
    }
}

/// A pending item as stored in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub id: i64,
    pub item: WorkItem,
    /// Failed processing attempts so far.
    pub attempts: u32,
}

/// Persistent FIFO queues keyed by [`QueueName`].
pub trait WorkQueue {
    /// Enqueue `item`, coalescing with a pending item of the same key and
    /// dropping pending items it [supersedes](WorkItem::supersedes).
    fn push(&self, item: WorkItem) -> Result<(), QueueError>;
    /// Up to `limit` pending items, oldest first.
    fn peek(&self, queue: QueueName, limit: usize) -> Result<Vec<QueuedItem>, QueueError>;
    fn complete(&self, id: i64) -> Result<(), QueueError>;
    /// Record a failed attempt and keep the item queued. Returns the new
    /// attempt count.
    fn release(&self, id: i64, error: &str) -> Result<u32, QueueError>;
    fn len(&self, queue: QueueName) -> Result<usize, QueueError>;
    fn clear(&self, queue: QueueName) -> Result<usize, QueueError>;
}

impl<T: WorkQueue + ?Sized> WorkQueue for &T {
    fn push(&self, item: WorkItem) -> Result<(), QueueError> {
        (**self).push(item)
    }
    fn peek(&self, queue: QueueName, limit: usize) -> Result<Vec<QueuedItem>, QueueError> {
        (**self).peek(queue, limit)
    }
    fn complete(&self, id: i64) -> Result<(), QueueError> {
        (**self).complete(id)
    }
    fn release(&self, id: i64, error: &str) -> Result<u32, QueueError> {
        (**self).release(id, error)
    }
    fn len(&self, queue: QueueName) -> Result<usize, QueueError> {
        (**self).len(queue)
    }
    fn clear(&self, queue: QueueName) -> Result<usize, QueueError> {
        (**self).clear(queue)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Synced(SyncReport),
    Tagged { update: Option<TagUpdate> },
    Deleted { rows: usize },
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("{job} job cannot process a {found} item")]
    WrongItem { job: QueueName, found: QueueName },
    #[error("no job registered for queue {0}")]
    Unregistered(QueueName),
}

/// A worker for one queue.
pub trait Job {
    fn process(&self, item: &WorkItem) -> Result<JobOutcome, JobError>;
}

pub struct PersonJob<'a, S, M>(pub &'a Reconciler<S, M>);

impl<S: FaceService, M: MappingStore> Job for PersonJob<'_, S, M> {
    fn process(&self, item: &WorkItem) -> Result<JobOutcome, JobError> {
        match item {
            WorkItem::ProcessPerson { person, previous } => {
                Ok(JobOutcome::Synced(self.0.sync_person(person, previous.as_ref())?))
            }
            other => Err(JobError::WrongItem {
                job: QueueName::ProcessPerson,
                found: other.queue(),
            }),
        }
    }
}

pub struct DetectJob<'a, S, M>(pub &'a Pipeline<S, M>);

impl<S: FaceService, M: MappingStore> Job for DetectJob<'_, S, M> {
    fn process(&self, item: &WorkItem) -> Result<JobOutcome, JobError> {
        match item {
            WorkItem::DetectFaces { content, field_name } => Ok(JobOutcome::Tagged {
                update: self.0.find_faces_and_tag(content, field_name)?,
            }),
            other => Err(JobError::WrongItem {
                job: QueueName::DetectFaces,
                found: other.queue(),
            }),
        }
    }
}

pub struct DeleteJob<'a, S, M>(pub &'a Reconciler<S, M>);

impl<S: FaceService, M: MappingStore> Job for DeleteJob<'_, S, M> {
    fn process(&self, item: &WorkItem) -> Result<JobOutcome, JobError> {
        match item {
            WorkItem::DeletedEntity { entity_type, entity_id } => Ok(JobOutcome::Deleted {
                rows: self.0.delete_entity(entity_type, entity_id)?,
            }),
            other => Err(JobError::WrongItem {
                job: QueueName::DeletedEntity,
                found: other.queue(),
            }),
        }
    }
}

/// Routes queue items to the job registered for their queue.
#[derive(Default)]
pub struct JobDispatcher<'a> {
    jobs: BTreeMap<QueueName, Box<dyn Job + 'a>>,
}

impl<'a> JobDispatcher<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, queue: QueueName, job: impl Job + 'a) -> Self {
        self.jobs.insert(queue, Box::new(job));
        self
    }

    /// Dispatcher with the three standard jobs.
    pub fn standard<S, M>(reconciler: &'a Reconciler<S, M>, pipeline: &'a Pipeline<S, M>) -> Self
    where
        S: FaceService + 'a,
        M: MappingStore + 'a,
    {
        Self::new()
            .register(QueueName::ProcessPerson, PersonJob(reconciler))
            .register(QueueName::DetectFaces, DetectJob(pipeline))
            .register(QueueName::DeletedEntity, DeleteJob(reconciler))
    }

    pub fn dispatch(&self, item: &WorkItem) -> Result<JobOutcome, JobError> {
        let queue = item.queue();
        self.jobs
            .get(&queue)
            .ok_or(JobError::Unregistered(queue))?
            .process(item)
    }
}

/// Counters from one drain of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueRun {
    pub processed: usize,
    pub released: usize,
    pub dropped: usize,
    #[serde(skip)]
    pub outcomes: Vec<JobOutcome>,
}

/// Process up to `budget` pending items of `queue`, oldest first.
///
/// Failed items stay queued with an incremented attempt counter until they
/// reach `max_attempts`, after which they are dropped. Items released in
/// this run are not retried until the next one.
pub fn run_queue<Q: WorkQueue>(
    dispatcher: &JobDispatcher<'_>,
    queue: &Q,
    name: QueueName,
    budget: usize,
    max_attempts: u32,
) -> Result<QueueRun, QueueError> {
    let mut run = QueueRun::default();
    for pending in queue.peek(name, budget)? {
        match dispatcher.dispatch(&pending.item) {
            Ok(outcome) => {
                queue.complete(pending.id)?;
                run.processed += 1;
                run.outcomes.push(outcome);
            }
            Err(e) => {
                let attempts = queue.release(pending.id, &e.to_string())?;
                if attempts >= max_attempts {
                    tracing::error!(
                        queue = %name,
                        entity = %pending.item.entity(),
                        attempts,
                        error = %e,
                        "dropping queue item after repeated failures"
                    );
                    queue.complete(pending.id)?;
                    run.dropped += 1;
                } else {
                    tracing::warn!(queue = %name, entity = %pending.item.entity(), attempts, error = %e, "queue item failed");
                    run.released += 1;
                }
            }
        }
    }
    if run.processed + run.released + run.dropped > 0 {
        tracing::info!(
            queue = %name,
            processed = run.processed,
            released = run.released,
            dropped = run.dropped,
            "queue run finished"
        );
    }
    Ok(run)
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: i64,
    items: Vec<QueuedItem>,
}

/// Process-local queue with the same coalescing rules as persistent backends.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkQueue for MemoryQueue {
    fn push(&self, item: WorkItem) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        let key = item.dedup_key();
        let queue = item.queue();
        state.items.retain(|p| !item.supersedes(&p.item));
        if let Some(pending) = state
            .items
            .iter_mut()
            .find(|p| p.item.queue() == queue && p.item.dedup_key() == key)
        {
            pending.item = pending.item.clone().coalesce(item);
            pending.attempts = 0;
            return Ok(());
        }
        state.next_id += 1;
        let id = state.next_id;
        state.items.push(QueuedItem { id, item, attempts: 0 });
        Ok(())
    }

    fn peek(&self, queue: QueueName, limit: usize) -> Result<Vec<QueuedItem>, QueueError> {
        let state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(state
            .items
            .iter()
            .filter(|p| p.item.queue() == queue)
            .take(limit)
            .cloned()
            .collect())
    }

    fn complete(&self, id: i64) -> Result<(), QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        state.items.retain(|p| p.id != id);
        Ok(())
    }

    fn release(&self, id: i64, _error: &str) -> Result<u32, QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(match state.items.iter_mut().find(|p| p.id == id) {
            Some(pending) => {
                pending.attempts += 1;
                pending.attempts
            }
            None => 0,
        })
    }

    fn len(&self, queue: QueueName) -> Result<usize, QueueError> {
        let state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        Ok(state.items.iter().filter(|p| p.item.queue() == queue).count())
    }

    fn clear(&self, queue: QueueName) -> Result<usize, QueueError> {
        let mut state = self.state.lock().map_err(|_| QueueError::Poisoned)?;
        let before = state.items.len();
        state.items.retain(|p| p.item.queue() != queue);
        Ok(before - state.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMappingStore;
    use crate::testing::{person, settings, MockFaceService};

    fn process(p: PersonEntity, previous: Option<PersonEntity>) -> WorkItem {
        WorkItem::ProcessPerson { person: p, previous }
    }

    #[test]
    fn test_queue_name_round_trip_through_str() {
        for q in QueueName::ALL {
            assert_eq!(q.as_str().parse::<QueueName>().unwrap(), q);
        }
        assert!("bogus".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_work_item_json_shape() {
        let item = WorkItem::DeletedEntity {
            entity_type: "node".into(),
            entity_id: "4".into(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"], "deleted_entity");
        assert_eq!(json["entity_id"], "4");
    }

    #[test]
    fn test_push_coalesces_same_entity() {
        let q = MemoryQueue::new();
        let v1 = person("1", "Jane", &[]);
        let v2 = person("1", "Jane Doe", &[]);
        let v3 = person("1", "Jane Q. Doe", &[]);
        q.push(process(v2.clone(), Some(v1.clone()))).unwrap();
        q.push(process(v3.clone(), Some(v2))).unwrap();
        q.push(process(person("2", "John", &[]), None)).unwrap();

        assert_eq!(q.len(QueueName::ProcessPerson).unwrap(), 2);
        let pending = q.peek(QueueName::ProcessPerson, 10).unwrap();
        assert_eq!(pending[0].item, process(v3, Some(v1)));
    }

    #[test]
    fn test_detect_items_coalesce_per_field() {
        let q = MemoryQueue::new();
        let content = ContentEntity {
            entity_type: "node".into(),
            bundle: "article".into(),
            id: "5".into(),
            images: Default::default(),
        };
        for field in ["field_a", "field_b", "field_a"] {
            q.push(WorkItem::DetectFaces {
                content: content.clone(),
                field_name: field.into(),
            })
            .unwrap();
        }
        assert_eq!(q.len(QueueName::DetectFaces).unwrap(), 2);
    }

    #[test]
    fn test_dispatch_routes_by_queue() {
        let service = MockFaceService::new();
        let store = MemoryMappingStore::new();
        let reconciler = Reconciler::new(&service, &store, settings());
        let pipeline = Pipeline::new(&service, &store, settings());
        let dispatcher = JobDispatcher::standard(&reconciler, &pipeline);

        let outcome = dispatcher.dispatch(&process(person("1", "Jane", &["10"]), None)).unwrap();
        assert!(matches!(outcome, JobOutcome::Synced(ref r) if r.created));

        let outcome = dispatcher
            .dispatch(&WorkItem::DeletedEntity {
                entity_type: "node".into(),
                entity_id: "1".into(),
            })
            .unwrap();
        assert_eq!(outcome, JobOutcome::Deleted { rows: 1 });
    }

    #[test]
    fn test_unregistered_queue() {
        let dispatcher = JobDispatcher::new();
        let err = dispatcher
            .dispatch(&WorkItem::DeletedEntity {
                entity_type: "node".into(),
                entity_id: "1".into(),
            })
            .unwrap_err();
        assert!(matches!(err, JobError::Unregistered(QueueName::DeletedEntity)));
    }

    #[test]
    fn test_job_rejects_foreign_item() {
        let service = MockFaceService::new();
        let store = MemoryMappingStore::new();
        let reconciler = Reconciler::new(&service, &store, settings());
        let err = DeleteJob(&reconciler)
            .process(&process(person("1", "Jane", &[]), None))
            .unwrap_err();
        assert!(matches!(err, JobError::WrongItem { job: QueueName::DeletedEntity, .. }));
    }

    #[test]
    fn test_run_queue_completes_and_respects_budget() {
        let service = MockFaceService::new();
        let store = MemoryMappingStore::new();
        let reconciler = Reconciler::new(&service, &store, settings());
        let pipeline = Pipeline::new(&service, &store, settings());
        let dispatcher = JobDispatcher::standard(&reconciler, &pipeline);
        let q = MemoryQueue::new();
        for id in ["1", "2", "3"] {
            q.push(process(person(id, "P", &[]), None)).unwrap();
        }

        let run = run_queue(&dispatcher, &q, QueueName::ProcessPerson, 2, 3).unwrap();
        assert_eq!(run.processed, 2);
        assert_eq!(q.len(QueueName::ProcessPerson).unwrap(), 1);
        assert_eq!(service.count("create_person"), 2);
    }

    #[test]
    fn test_failing_item_released_then_dropped() {
        let service = MockFaceService::new();
        let store = MemoryMappingStore::new();
        let mut wrong = settings();
        wrong.person_entity_bundle = "node.staff".parse().unwrap();
        let reconciler = Reconciler::new(&service, &store, wrong.clone());
        let pipeline = Pipeline::new(&service, &store, wrong);
        let dispatcher = JobDispatcher::standard(&reconciler, &pipeline);
        let q = MemoryQueue::new();
        q.push(process(person("1", "Jane", &[]), None)).unwrap();

        let run = run_queue(&dispatcher, &q, QueueName::ProcessPerson, 10, 2).unwrap();
        assert_eq!(run.released, 1);
        assert_eq!(q.peek(QueueName::ProcessPerson, 1).unwrap()[0].attempts, 1);

        let run = run_queue(&dispatcher, &q, QueueName::ProcessPerson, 10, 2).unwrap();
        assert_eq!(run.dropped, 1);
        assert_eq!(q.len(QueueName::ProcessPerson).unwrap(), 0);
    }

    #[test]
    fn test_deletion_cancels_pending_work_for_entity() {
        let q = MemoryQueue::new();
        let content = ContentEntity {
            entity_type: "node".into(),
            bundle: "article".into(),
            id: "1".into(),
            images: Default::default(),
        };
        q.push(process(person("1", "Jane", &["10"]), None)).unwrap();
        q.push(process(person("2", "John", &["20"]), None)).unwrap();
        q.push(WorkItem::DetectFaces {
            content,
            field_name: "field_image".into(),
        })
        .unwrap();
        q.push(WorkItem::DeletedEntity {
            entity_type: "node".into(),
            entity_id: "1".into(),
        })
        .unwrap();

        assert_eq!(q.len(QueueName::DetectFaces).unwrap(), 0);
        let pending = q.peek(QueueName::ProcessPerson, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item.entity(), LocalEntityRef::new("node", "2"));
        assert_eq!(q.len(QueueName::DeletedEntity).unwrap(), 1);
    }

    #[test]
    fn test_saved_then_deleted_person_is_never_synced() {
        let service = MockFaceService::new();
        let store = MemoryMappingStore::new();
        let reconciler = Reconciler::new(&service, &store, settings());
        let pipeline = Pipeline::new(&service, &store, settings());
        let dispatcher = JobDispatcher::standard(&reconciler, &pipeline);
        let q = MemoryQueue::new();
        q.push(process(person("1", "Jane", &["10"]), None)).unwrap();
        q.push(WorkItem::DeletedEntity {
            entity_type: "node".into(),
            entity_id: "1".into(),
        })
        .unwrap();

        for queue in QueueName::ALL {
            run_queue(&dispatcher, &q, queue, 10, 3).unwrap();
        }
        assert_eq!(service.count("create_person"), 0);
        assert_eq!(service.count("add_face"), 0);
        assert!(store.rows().unwrap().is_empty());
    }

    #[test]
    fn test_clear_only_touches_one_queue() {
        let q = MemoryQueue::new();
        q.push(process(person("1", "Jane", &[]), None)).unwrap();
        q.push(WorkItem::DeletedEntity {
            entity_type: "node".into(),
            entity_id: "9".into(),
        })
        .unwrap();
        assert_eq!(q.clear(QueueName::ProcessPerson).unwrap(), 1);
        assert_eq!(q.len(QueueName::DeletedEntity).unwrap(), 1);
    }
}
