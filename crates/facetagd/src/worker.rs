use crate::config::Config;
use facetag_azure::AzureFaceClient;
use facetag_core::jobs::{run_queue, JobError, QueueError, QueueRun};
use facetag_core::operations::{BatchReport, Progress};
use facetag_core::types::RemotePerson;
use facetag_core::{
    ContentEntity, FaceService, JobDispatcher, JobOutcome, MappingStore, Operations, OperationsError,
    PersonEntity, Pipeline, QueueName, Reconciler, ServiceError, Settings, TagUpdate, TrainingState,
    WorkItem, WorkQueue,
};
use facetag_store::outbox::OutboxError;
use facetag_store::{Database, DbError, SqliteMappingStore, SqliteQueue, TagOutbox};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("face service: {0}")]
    Service(#[from] ServiceError),
    #[error("database: {0}")]
    Database(#[from] DbError),
    #[error(transparent)]
    Operations(#[from] OperationsError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error("worker thread exited")]
    ChannelClosed,
}

/// Reply to an entity event: handled inline or deferred to a queue.
#[derive(Debug, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EventOutcome {
    Processed { outcomes: Vec<JobOutcome> },
    Queued { items: usize },
}

#[derive(Debug, Serialize)]
pub struct QueueCount {
    pub queue: QueueName,
    pub pending: usize,
}

#[derive(Debug, Serialize)]
pub struct QueueReport {
    pub queue: QueueName,
    #[serde(flatten)]
    pub run: QueueRun,
}

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub connected: bool,
    pub person_group: String,
    pub synchronous: bool,
    pub mapped_people: usize,
    pub queues: Vec<QueueCount>,
    pub pending_tag_updates: usize,
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

/// Messages sent from D-Bus handlers to the worker thread.
enum WorkerRequest {
    PersonSaved {
        current: PersonEntity,
        previous: Option<PersonEntity>,
        reply: Reply<EventOutcome>,
    },
    ContentSaved {
        content: ContentEntity,
        reply: Reply<EventOutcome>,
    },
    EntityDeleted {
        entity_type: String,
        entity_id: String,
        reply: Reply<EventOutcome>,
    },
    Train {
        reply: Reply<()>,
    },
    TrainingStatus {
        reply: Reply<TrainingState>,
    },
    QueueStatus {
        reply: Reply<Vec<QueueCount>>,
    },
    RunQueues {
        reply: Reply<Vec<QueueReport>>,
    },
    Reset {
        reply: Reply<usize>,
    },
    SubmitMissing {
        people: Vec<PersonEntity>,
        reply: Reply<BatchReport>,
    },
    RequeueAll {
        people: Vec<PersonEntity>,
        reply: Reply<usize>,
    },
    TakeTagUpdates {
        reply: Reply<Vec<TagUpdate>>,
    },
    Progress {
        total: usize,
        reply: Reply<Progress>,
    },
    ListPeople {
        reply: Reply<Vec<RemotePerson>>,
    },
    Status {
        reply: Reply<WorkerStatus>,
    },
}

/// Clone-safe handle to the worker thread.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> WorkerRequest) -> Result<T, WorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| WorkerError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WorkerError::ChannelClosed)?
    }

    pub async fn person_saved(
        &self,
        current: PersonEntity,
        previous: Option<PersonEntity>,
    ) -> Result<EventOutcome, WorkerError> {
        self.call(|reply| WorkerRequest::PersonSaved { current, previous, reply }).await
    }

    pub async fn content_saved(&self, content: ContentEntity) -> Result<EventOutcome, WorkerError> {
        self.call(|reply| WorkerRequest::ContentSaved { content, reply }).await
    }

    pub async fn entity_deleted(&self, entity_type: String, entity_id: String) -> Result<EventOutcome, WorkerError> {
        self.call(|reply| WorkerRequest::EntityDeleted {
            entity_type,
            entity_id,
            reply,
        })
        .await
    }

    pub async fn train(&self) -> Result<(), WorkerError> {
        self.call(|reply| WorkerRequest::Train { reply }).await
    }

    pub async fn training_status(&self) -> Result<TrainingState, WorkerError> {
        self.call(|reply| WorkerRequest::TrainingStatus { reply }).await
    }

    pub async fn queue_status(&self) -> Result<Vec<QueueCount>, WorkerError> {
        self.call(|reply| WorkerRequest::QueueStatus { reply }).await
    }

    pub async fn run_queues(&self) -> Result<Vec<QueueReport>, WorkerError> {
        self.call(|reply| WorkerRequest::RunQueues { reply }).await
    }

    pub async fn reset(&self) -> Result<usize, WorkerError> {
        self.call(|reply| WorkerRequest::Reset { reply }).await
    }

    pub async fn submit_missing(&self, people: Vec<PersonEntity>) -> Result<BatchReport, WorkerError> {
        self.call(|reply| WorkerRequest::SubmitMissing { people, reply }).await
    }

    pub async fn requeue_all(&self, people: Vec<PersonEntity>) -> Result<usize, WorkerError> {
        self.call(|reply| WorkerRequest::RequeueAll { people, reply }).await
    }

    pub async fn take_tag_updates(&self) -> Result<Vec<TagUpdate>, WorkerError> {
        self.call(|reply| WorkerRequest::TakeTagUpdates { reply }).await
    }

    pub async fn progress(&self, total: usize) -> Result<Progress, WorkerError> {
        self.call(|reply| WorkerRequest::Progress { total, reply }).await
    }

    pub async fn list_people(&self) -> Result<Vec<RemotePerson>, WorkerError> {
        self.call(|reply| WorkerRequest::ListPeople { reply }).await
    }

    pub async fn status(&self) -> Result<WorkerStatus, WorkerError> {
        self.call(|reply| WorkerRequest::Status { reply }).await
    }
}

/// Everything the worker thread needs, detached from the config.
struct WorkerSetup {
    azure: facetag_azure::AzureConfig,
    db_path: PathBuf,
    settings: Settings,
    queue_budget: usize,
    queue_max_attempts: u32,
}

/// Spawn the worker on a dedicated OS thread.
///
/// The HTTP client and the database connection are created on that thread
/// and never leave it. Startup failures are reported back before this
/// returns; an unreachable Face API is only logged.
pub async fn spawn_worker(config: &Config) -> Result<WorkerHandle, WorkerError> {
    let setup = WorkerSetup {
        azure: config.azure_config(),
        db_path: config.db_path.clone(),
        settings: config.settings.clone(),
        queue_budget: config.queue.budget,
        queue_max_attempts: config.queue.max_attempts,
    };
    let (tx, rx) = mpsc::channel::<WorkerRequest>(16);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), WorkerError>>();

    std::thread::Builder::new()
        .name("facetag-worker".into())
        .spawn(move || run_worker(setup, rx, ready_tx))
        .expect("failed to spawn worker thread");

    ready_rx.await.map_err(|_| WorkerError::ChannelClosed)??;
    Ok(WorkerHandle { tx })
}

fn run_worker(
    setup: WorkerSetup,
    mut rx: mpsc::Receiver<WorkerRequest>,
    ready: oneshot::Sender<Result<(), WorkerError>>,
) {
    let opened = AzureFaceClient::new(setup.azure)
        .map_err(WorkerError::from)
        .and_then(|client| Ok((client, Database::open(&setup.db_path)?)));
    let (client, db) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let state = WorkerState::new(
        &client,
        &db,
        setup.settings,
        setup.queue_budget,
        setup.queue_max_attempts,
    );
    state.bootstrap();
    let _ = ready.send(Ok(()));

    tracing::info!("worker thread started");
    while let Some(req) = rx.blocking_recv() {
        state.handle(req);
    }
    tracing::info!("worker thread exiting");
}

struct WorkerState<'a, S: FaceService, M: MappingStore> {
    pipeline: Pipeline<S, M>,
    operations: Operations<S, M>,
    queue: SqliteQueue<'a>,
    outbox: TagOutbox<'a>,
    settings: Settings,
    queue_budget: usize,
    queue_max_attempts: u32,
}

impl<'a, S: FaceService + Copy> WorkerState<'a, S, SqliteMappingStore<'a>> {
    fn new(service: S, db: &'a Database, settings: Settings, queue_budget: usize, queue_max_attempts: u32) -> Self {
        Self {
            pipeline: Pipeline::new(service, db.mappings(), settings.clone()),
            operations: Operations::new(Reconciler::new(service, db.mappings(), settings.clone())),
            queue: db.queue(),
            outbox: db.outbox(),
            settings,
            queue_budget,
            queue_max_attempts,
        }
    }
}

impl<S: FaceService, M: MappingStore> WorkerState<'_, S, M> {
    /// Check credentials and make sure the person group exists.
    fn bootstrap(&self) {
        match self.operations.check_connection() {
            Ok(true) => match self.operations.ensure_person_group() {
                Ok(created) => tracing::info!(created, "person group ready"),
                Err(e) => tracing::warn!(error = %e, "could not prepare person group"),
            },
            Ok(false) => tracing::warn!("face service rejected the configured endpoint or key"),
            Err(e) => tracing::warn!(error = %e, "face service unreachable at startup"),
        }
    }

    fn handle(&self, req: WorkerRequest) {
        match req {
            WorkerRequest::PersonSaved { current, previous, reply } => {
                let item = WorkItem::ProcessPerson {
                    person: current,
                    previous,
                };
                let _ = reply.send(self.handle_events(vec![item]));
            }
            WorkerRequest::ContentSaved { content, reply } => {
                let items = self
                    .settings
                    .detection_fields_on(&content)
                    .map(|field| WorkItem::DetectFaces {
                        content: content.clone(),
                        field_name: field.to_string(),
                    })
                    .collect();
                let _ = reply.send(self.handle_events(items));
            }
            WorkerRequest::EntityDeleted {
                entity_type,
                entity_id,
                reply,
            } => {
                let item = WorkItem::DeletedEntity {
                    entity_type,
                    entity_id,
                };
                let _ = reply.send(self.handle_events(vec![item]));
            }
            WorkerRequest::Train { reply } => {
                let _ = reply.send(self.operations.train().map_err(Into::into));
            }
            WorkerRequest::TrainingStatus { reply } => {
                let _ = reply.send(self.operations.training_status().map_err(Into::into));
            }
            WorkerRequest::QueueStatus { reply } => {
                let _ = reply.send(self.queue_counts());
            }
            WorkerRequest::RunQueues { reply } => {
                let _ = reply.send(self.run_queues());
            }
            WorkerRequest::Reset { reply } => {
                let _ = reply.send(self.reset());
            }
            WorkerRequest::SubmitMissing { people, reply } => {
                let _ = reply.send(self.operations.submit_missing(&people).map_err(Into::into));
            }
            WorkerRequest::RequeueAll { people, reply } => {
                let _ = reply.send(self.requeue_all(people));
            }
            WorkerRequest::TakeTagUpdates { reply } => {
                let _ = reply.send(self.outbox.take_all().map_err(Into::into));
            }
            WorkerRequest::Progress { total, reply } => {
                let _ = reply.send(self.operations.progress(total).map_err(Into::into));
            }
            WorkerRequest::ListPeople { reply } => {
                let _ = reply.send(self.operations.remote_people().map_err(Into::into));
            }
            WorkerRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Process entity events inline, or queue them when running deferred.
    fn handle_events(&self, items: Vec<WorkItem>) -> Result<EventOutcome, WorkerError> {
        if !self.settings.synchronous {
            let count = items.len();
            for item in items {
                self.queue.push(item)?;
            }
            return Ok(EventOutcome::Queued { items: count });
        }

        let dispatcher = JobDispatcher::standard(self.operations.reconciler(), &self.pipeline);
        let mut outcomes = Vec::with_capacity(items.len());
        for item in &items {
            outcomes.push(dispatcher.dispatch(item)?);
        }
        Ok(EventOutcome::Processed { outcomes })
    }

    fn queue_counts(&self) -> Result<Vec<QueueCount>, WorkerError> {
        Ok(self
            .queue
            .counts()?
            .into_iter()
            .map(|(queue, pending)| QueueCount { queue, pending })
            .collect())
    }

    /// Drain every queue once; tag updates from detection go to the outbox.
    fn run_queues(&self) -> Result<Vec<QueueReport>, WorkerError> {
        let dispatcher = JobDispatcher::standard(self.operations.reconciler(), &self.pipeline);
        let mut reports = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            let run = run_queue(&dispatcher, &self.queue, queue, self.queue_budget, self.queue_max_attempts)?;
            for outcome in &run.outcomes {
                if let JobOutcome::Tagged { update: Some(update) } = outcome {
                    self.outbox.push(update)?;
                }
            }
            reports.push(QueueReport { queue, run });
        }
        Ok(reports)
    }

    /// Reset remote data and mappings and drop work queued against them.
    fn reset(&self) -> Result<usize, WorkerError> {
        let removed = self.operations.reset()?;
        for queue in [QueueName::ProcessPerson, QueueName::DeletedEntity] {
            self.queue.clear(queue)?;
        }
        Ok(removed)
    }

    /// Reset, then queue every person for a fresh sync.
    fn requeue_all(&self, people: Vec<PersonEntity>) -> Result<usize, WorkerError> {
        self.reset()?;
        let count = people.len();
        for person in people {
            self.queue.push(WorkItem::ProcessPerson { person, previous: None })?;
        }
        tracing::info!(count, "queued all people for resubmission");
        Ok(count)
    }

    fn status(&self) -> Result<WorkerStatus, WorkerError> {
        let connected = self.operations.check_connection().unwrap_or_else(|e| {
            tracing::debug!(error = %e, "status: face service unreachable");
            false
        });
        Ok(WorkerStatus {
            connected,
            person_group: self.operations.reconciler().service().person_group_id().to_string(),
            synchronous: self.settings.synchronous,
            mapped_people: self.operations.progress(0)?.mapped,
            queues: self.queue_counts()?,
            pending_tag_updates: self.outbox.len()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetag_core::testing::{identified, image, person, settings, MockFaceService};
    use facetag_core::types::LocalEntityRef;
    use std::collections::BTreeMap;

    fn worker_settings(synchronous: bool) -> Settings {
        let mut settings = settings();
        settings.synchronous = synchronous;
        settings
    }

    /// Send one request through `handle` and collect the reply.
    fn ask<T>(
        state: &WorkerState<'_, &MockFaceService, SqliteMappingStore<'_>>,
        build: impl FnOnce(Reply<T>) -> WorkerRequest,
    ) -> Result<T, WorkerError> {
        let (tx, mut rx) = oneshot::channel();
        state.handle(build(tx));
        rx.try_recv().expect("worker replied")
    }

    fn photo(id: &str) -> ContentEntity {
        let mut images = BTreeMap::new();
        images.insert("field_image".to_string(), image("50"));
        ContentEntity {
            entity_type: "node".into(),
            bundle: "article".into(),
            id: id.into(),
            images,
        }
    }

    #[test]
    fn test_synchronous_person_saved_syncs_inline() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let state = WorkerState::new(&service, &db, worker_settings(true), 10, 3);

        let outcome = ask(&state, |reply| WorkerRequest::PersonSaved {
            current: person("1", "Jane", &["10"]),
            previous: None,
            reply,
        })
        .unwrap();
        match outcome {
            EventOutcome::Processed { outcomes } => {
                assert!(matches!(&outcomes[..], [JobOutcome::Synced(r)] if r.created));
            }
            other => panic!("expected inline processing, got {other:?}"),
        }
        assert_eq!(service.count("create_person"), 1);
        assert_eq!(service.count("add_face"), 1);
        assert_eq!(state.queue.len(QueueName::ProcessPerson).unwrap(), 0);
    }

    #[test]
    fn test_queued_person_saved_waits_for_queue_run() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let state = WorkerState::new(&service, &db, worker_settings(false), 10, 3);

        let outcome = ask(&state, |reply| WorkerRequest::PersonSaved {
            current: person("1", "Jane", &["10"]),
            previous: None,
            reply,
        })
        .unwrap();
        assert!(matches!(outcome, EventOutcome::Queued { items: 1 }));
        assert!(service.calls().is_empty());

        let reports = ask(&state, |reply| WorkerRequest::RunQueues { reply }).unwrap();
        let person_run = reports
            .iter()
            .find(|r| r.queue == QueueName::ProcessPerson)
            .unwrap();
        assert_eq!(person_run.run.processed, 1);
        assert_eq!(service.count("create_person"), 1);
        assert_eq!(state.queue.len(QueueName::ProcessPerson).unwrap(), 0);
    }

    #[test]
    fn test_queued_detection_fills_outbox() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let sync = WorkerState::new(&service, &db, worker_settings(true), 10, 3);
        ask(&sync, |reply| WorkerRequest::PersonSaved {
            current: person("1", "Jane", &["10"]),
            previous: None,
            reply,
        })
        .unwrap();

        let state = WorkerState::new(&service, &db, worker_settings(false), 10, 3);
        service.set_detected(&["fid1"]);
        service.set_identified(vec![identified("fid1", &[("person-1", 0.9)])]);
        let outcome = ask(&state, |reply| WorkerRequest::ContentSaved {
            content: photo("50"),
            reply,
        })
        .unwrap();
        assert!(matches!(outcome, EventOutcome::Queued { items: 1 }));
        assert_eq!(service.count("detect_faces"), 0);

        ask(&state, |reply| WorkerRequest::RunQueues { reply }).unwrap();
        let updates = ask(&state, |reply| WorkerRequest::TakeTagUpdates { reply }).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].entity, LocalEntityRef::new("node", "50"));
        assert_eq!(updates[0].tag_field, "field_people");
        assert_eq!(updates[0].tags, vec![LocalEntityRef::new("node", "1")]);
        assert!(state.outbox.is_empty().unwrap());
    }

    #[test]
    fn test_synchronous_detection_returns_update_without_outbox() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let state = WorkerState::new(&service, &db, worker_settings(true), 10, 3);
        service.set_detected(&[]);

        let outcome = ask(&state, |reply| WorkerRequest::ContentSaved {
            content: photo("50"),
            reply,
        })
        .unwrap();
        match outcome {
            EventOutcome::Processed { outcomes } => {
                assert_eq!(outcomes, vec![JobOutcome::Tagged { update: None }]);
            }
            other => panic!("expected inline processing, got {other:?}"),
        }
        assert_eq!(service.count("identify_faces"), 0);
        assert!(state.outbox.is_empty().unwrap());
    }

    #[test]
    fn test_reset_clears_person_and_deletion_queues() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let state = WorkerState::new(&service, &db, worker_settings(false), 10, 3);
        state
            .queue
            .push(WorkItem::ProcessPerson {
                person: person("1", "Jane", &[]),
                previous: None,
            })
            .unwrap();
        state
            .queue
            .push(WorkItem::DeletedEntity {
                entity_type: "node".into(),
                entity_id: "2".into(),
            })
            .unwrap();
        state
            .queue
            .push(WorkItem::DetectFaces {
                content: photo("50"),
                field_name: "field_image".into(),
            })
            .unwrap();

        ask(&state, |reply| WorkerRequest::Reset { reply }).unwrap();
        assert_eq!(service.count("delete_person_group"), 1);
        assert_eq!(service.count("create_person_group"), 1);
        assert_eq!(state.queue.len(QueueName::ProcessPerson).unwrap(), 0);
        assert_eq!(state.queue.len(QueueName::DeletedEntity).unwrap(), 0);
        assert_eq!(state.queue.len(QueueName::DetectFaces).unwrap(), 1);
    }

    #[test]
    fn test_requeue_all_resets_then_queues_everyone_fresh() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let state = WorkerState::new(&service, &db, worker_settings(true), 10, 3);
        ask(&state, |reply| WorkerRequest::PersonSaved {
            current: person("1", "Jane", &["10"]),
            previous: None,
            reply,
        })
        .unwrap();

        let people = vec![person("1", "Jane", &["10"]), person("2", "John", &[])];
        let queued = ask(&state, |reply| WorkerRequest::RequeueAll { people, reply }).unwrap();
        assert_eq!(queued, 2);
        assert_eq!(state.operations.progress(2).unwrap().mapped, 0);

        let pending = state.queue.peek(QueueName::ProcessPerson, 10).unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|p| matches!(&p.item, WorkItem::ProcessPerson { previous: None, .. })));
    }

    #[test]
    fn test_status_reports_queues_and_outbox() {
        let service = MockFaceService::new();
        let db = Database::open_in_memory().unwrap();
        let state = WorkerState::new(&service, &db, worker_settings(false), 10, 3);
        ask(&state, |reply| WorkerRequest::EntityDeleted {
            entity_type: "node".into(),
            entity_id: "7".into(),
            reply,
        })
        .unwrap();

        let status = ask(&state, |reply| WorkerRequest::Status { reply }).unwrap();
        assert!(status.connected);
        assert_eq!(status.person_group, "test_group");
        assert!(!status.synchronous);
        assert_eq!(status.mapped_people, 0);
        assert_eq!(status.pending_tag_updates, 0);
        let deletions = status
            .queues
            .iter()
            .find(|q| q.queue == QueueName::DeletedEntity)
            .unwrap();
        assert_eq!(deletions.pending, 1);
    }
}
