use crate::worker::{WorkerError, WorkerHandle};
use facetag_core::{ContentEntity, PersonEntity};
use serde::de::DeserializeOwned;
use serde::Serialize;
use zbus::interface;

pub const BUS_NAME: &str = "org.facetag.Reconciler1";
pub const OBJECT_PATH: &str = "/org/facetag/Reconciler1";

/// D-Bus interface for the facetag daemon.
///
/// Bus name: org.facetag.Reconciler1
/// Object path: /org/facetag/Reconciler1
///
/// Entities go in and results come out as JSON strings.
pub struct FacetagService {
    worker: WorkerHandle,
}

impl FacetagService {
    pub fn new(worker: WorkerHandle) -> Self {
        Self { worker }
    }
}

fn parse_arg<T: DeserializeOwned>(name: &str, json: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{name}: {e}")))
}

/// An empty string stands for "no previous revision".
fn parse_optional<T: DeserializeOwned>(name: &str, json: &str) -> zbus::fdo::Result<Option<T>> {
    if json.trim().is_empty() {
        return Ok(None);
    }
    parse_arg(name, json).map(Some)
}

fn to_reply<T: Serialize>(method: &str, result: Result<T, WorkerError>) -> zbus::fdo::Result<String> {
    let value = result.map_err(|e| {
        tracing::warn!(method, error = %e, "request failed");
        zbus::fdo::Error::Failed(e.to_string())
    })?;
    serde_json::to_string(&value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.facetag.Reconciler1")]
impl FacetagService {
    /// A person entity was created or updated. `previous` may be empty.
    async fn person_saved(&self, current: &str, previous: &str) -> zbus::fdo::Result<String> {
        let current: PersonEntity = parse_arg("current", current)?;
        let previous = parse_optional("previous", previous)?;
        tracing::info!(person = %current.local_ref(), "person saved");
        to_reply("PersonSaved", self.worker.person_saved(current, previous).await)
    }

    /// A content entity was created or updated.
    async fn content_saved(&self, content: &str) -> zbus::fdo::Result<String> {
        let content: ContentEntity = parse_arg("content", content)?;
        tracing::info!(content = %content.local_ref(), "content saved");
        to_reply("ContentSaved", self.worker.content_saved(content).await)
    }

    async fn entity_deleted(&self, entity_type: &str, entity_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(entity_type, entity_id, "entity deleted");
        to_reply(
            "EntityDeleted",
            self.worker
                .entity_deleted(entity_type.to_string(), entity_id.to_string())
                .await,
        )
    }

    async fn train(&self) -> zbus::fdo::Result<()> {
        tracing::info!("training requested");
        self.worker.train().await.map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn training_status(&self) -> zbus::fdo::Result<String> {
        to_reply("TrainingStatus", self.worker.training_status().await)
    }

    async fn queue_status(&self) -> zbus::fdo::Result<String> {
        to_reply("QueueStatus", self.worker.queue_status().await)
    }

    /// Drain each queue once, as the cron tick does.
    async fn run_queues(&self) -> zbus::fdo::Result<String> {
        to_reply("RunQueues", self.worker.run_queues().await)
    }

    /// Delete the remote person group and every local mapping.
    async fn reset(&self) -> zbus::fdo::Result<u64> {
        tracing::warn!("reset requested");
        self.worker
            .reset()
            .await
            .map(|rows| rows as u64)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Sync every person in `people` (a JSON array) that has no mapping yet.
    async fn submit_missing(&self, people: &str) -> zbus::fdo::Result<String> {
        let people: Vec<PersonEntity> = parse_arg("people", people)?;
        to_reply("SubmitMissing", self.worker.submit_missing(people).await)
    }

    /// Reset, then queue every person in `people` for a fresh sync.
    async fn requeue_all(&self, people: &str) -> zbus::fdo::Result<String> {
        let people: Vec<PersonEntity> = parse_arg("people", people)?;
        to_reply("RequeueAll", self.worker.requeue_all(people).await)
    }

    /// Remove and return tag updates produced by queued detection.
    async fn take_tag_updates(&self) -> zbus::fdo::Result<String> {
        to_reply("TakeTagUpdates", self.worker.take_tag_updates().await)
    }

    async fn progress(&self, total: u64) -> zbus::fdo::Result<String> {
        to_reply("Progress", self.worker.progress(total as usize).await)
    }

    async fn list_people(&self) -> zbus::fdo::Result<String> {
        to_reply("ListPeople", self.worker.list_people().await)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.worker.status().await.map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        let mut value = serde_json::to_value(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["version"] = serde_json::Value::from(env!("CARGO_PKG_VERSION"));
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_previous_is_none() {
        let previous: Option<PersonEntity> = parse_optional("previous", "  ").unwrap();
        assert!(previous.is_none());
    }

    #[test]
    fn test_person_argument_parses() {
        let json = r#"{"entity_type":"node","bundle":"person","id":"7","label":"Jane","images":[]}"#;
        let person: PersonEntity = parse_arg("current", json).unwrap();
        assert_eq!(person.label, "Jane");
        let previous: Option<PersonEntity> = parse_optional("previous", json).unwrap();
        assert_eq!(previous.unwrap().id, "7");
    }

    #[test]
    fn test_bad_json_is_invalid_args() {
        let err = parse_arg::<PersonEntity>("current", "{").unwrap_err();
        match err {
            zbus::fdo::Error::InvalidArgs(msg) => assert!(msg.starts_with("current:")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_worker_error_is_failed() {
        let err = to_reply::<()>("Train", Err(WorkerError::ChannelClosed)).unwrap_err();
        assert!(matches!(err, zbus::fdo::Error::Failed(_)));
    }
}
