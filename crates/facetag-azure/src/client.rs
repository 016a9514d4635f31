//! Blocking Azure Face API client.

use crate::files::FileRoots;
use crate::retry::{parse_retry_after, RetryPolicy};
use crate::wire::{self, CreatedPerson, IdentifyRequest, NameBody, PersistedFace};
use facetag_core::types::{DetectedFace, Identification, PersonGroup, RemotePerson, TrainingStatus};
use facetag_core::{FaceService, ServiceError};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde::de::DeserializeOwned;
use std::time::Duration;

const KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OCTET_STREAM: &str = "application/octet-stream";

/// Default person group id.
pub const DEFAULT_PERSON_GROUP: &str = "facetag_people";

/// Whether a request may be sent again after a failure that left its fate
/// unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resend {
    /// Repeating the request cannot leave extra state behind.
    Safe,
    /// The request creates a remote record. It is only resent when the
    /// service cannot have processed it.
    Undelivered,
}

/// Decide whether a failed attempt is worth another try.
fn may_resend(err: &ServiceError, connect_failed: bool, resend: Resend) -> bool {
    if !err.is_transient() {
        return false;
    }
    match (resend, err.status()) {
        (Resend::Safe, _) => true,
        (Resend::Undelivered, Some(status)) => status == 429 || status == 503,
        (Resend::Undelivered, None) => connect_failed,
    }
}

/// Only rejected credentials count as "not connected"; throttling and
/// outages surface as errors.
fn connection_verdict(result: Result<(), ServiceError>) -> Result<bool, ServiceError> {
    match result {
        Ok(()) => Ok(true),
        Err(ServiceError::Status { status: status @ (401 | 403), .. }) => {
            tracing::warn!(status, "face service rejected the configured credentials");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// Base URL including the API version path, e.g.
    /// `https://westeurope.api.cognitive.microsoft.com/face/v1.0/`.
    pub endpoint: String,
    pub api_key: String,
    pub person_group_id: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub file_roots: FileRoots,
}

impl AzureConfig {
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint),
            api_key: api_key.to_string(),
            person_group_id: DEFAULT_PERSON_GROUP.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            file_roots: FileRoots::new(),
        }
    }
}

/// Endpoint with exactly one trailing slash, so relative paths join onto it.
pub fn normalize_endpoint(endpoint: &str) -> String {
    format!("{}/", endpoint.trim().trim_end_matches('/'))
}

/// [`FaceService`] backed by the Azure Face REST API.
///
/// Holds a blocking HTTP client, so it must live on a plain OS thread and
/// never inside an async runtime.
pub struct AzureFaceClient {
    http: Client,
    endpoint: String,
    api_key: String,
    person_group_id: String,
    retry: RetryPolicy,
    files: FileRoots,
}

impl AzureFaceClient {
    pub fn new(config: AzureConfig) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        tracing::info!(
            endpoint = %config.endpoint,
            person_group = %config.person_group_id,
            timeout_secs = config.timeout.as_secs(),
            "Azure Face client ready"
        );

        Ok(Self {
            http,
            endpoint: normalize_endpoint(&config.endpoint),
            api_key: config.api_key,
            person_group_id: config.person_group_id,
            retry: config.retry,
            files: config.file_roots,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn group_url(&self, rest: &str) -> String {
        if rest.is_empty() {
            self.url(&format!("persongroups/{}", self.person_group_id))
        } else {
            self.url(&format!("persongroups/{}/{rest}", self.person_group_id))
        }
    }

    /// Send the request built by `build`, retrying transient failures per
    /// the retry policy.
    fn execute(
        &self,
        what: &str,
        resend: Resend,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut connect_failed = false;
            let (err, retry_after) = match build(&self.http).header(KEY_HEADER, &self.api_key).send() {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = resp
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    let body = resp.text().unwrap_or_default();
                    (wire::status_error(status, &body), retry_after)
                }
                Err(e) => {
                    connect_failed = e.is_connect();
                    (ServiceError::Transport(e.to_string()), None)
                }
            };

            if !may_resend(&err, connect_failed, resend) || !self.retry.should_retry(attempt) {
                tracing::debug!(request = what, attempt, error = %err, "face service request failed");
                return Err(err);
            }
            let wait = self.retry.retry_interval(attempt, retry_after);
            tracing::warn!(
                request = what,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "transient face service failure, retrying"
            );
            std::thread::sleep(wait);
        }
    }

    fn json<T: DeserializeOwned>(
        &self,
        what: &str,
        resend: Resend,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<T, ServiceError> {
        let resp = self.execute(what, resend, build)?;
        resp.json::<T>()
            .map_err(|e| ServiceError::Decode(format!("{what}: {e}")))
    }
}

impl FaceService for AzureFaceClient {
    fn person_group_id(&self) -> &str {
        &self.person_group_id
    }

    fn check_status(&self) -> Result<bool, ServiceError> {
        let result = self
            .execute("list person groups", Resend::Safe, |http| http.get(self.url("persongroups")))
            .map(|_| ());
        connection_verdict(result)
    }

    fn create_person_group(&self, name: &str) -> Result<(), ServiceError> {
        self.execute("create person group", Resend::Safe, |http| {
            http.put(self.group_url("")).json(&NameBody { name })
        })?;
        Ok(())
    }

    fn delete_person_group(&self) -> Result<(), ServiceError> {
        self.execute("delete person group", Resend::Safe, |http| http.delete(self.group_url("")))?;
        Ok(())
    }

    fn list_person_groups(&self) -> Result<Vec<PersonGroup>, ServiceError> {
        self.json("list person groups", Resend::Safe, |http| http.get(self.url("persongroups")))
    }

    fn create_person(&self, name: &str) -> Result<String, ServiceError> {
        let created: CreatedPerson = self.json("create person", Resend::Undelivered, |http| {
            http.post(self.group_url("persons")).json(&NameBody { name })
        })?;
        Ok(created.person_id)
    }

    fn get_person(&self, person_id: &str) -> Result<RemotePerson, ServiceError> {
        self.json("get person", Resend::Safe, |http| {
            http.get(self.group_url(&format!("persons/{person_id}")))
        })
    }

    fn update_person(&self, person_id: &str, name: &str) -> Result<(), ServiceError> {
        self.execute("update person", Resend::Safe, |http| {
            http.patch(self.group_url(&format!("persons/{person_id}")))
                .json(&NameBody { name })
        })?;
        Ok(())
    }

    fn delete_person(&self, person_id: &str) -> Result<(), ServiceError> {
        self.execute("delete person", Resend::Safe, |http| {
            http.delete(self.group_url(&format!("persons/{person_id}")))
        })?;
        Ok(())
    }

    fn list_people(&self) -> Result<Vec<RemotePerson>, ServiceError> {
        self.json("list people", Resend::Safe, |http| http.get(self.group_url("persons")))
    }

    fn add_face(&self, person_id: &str, file_uri: &str) -> Result<String, ServiceError> {
        let image = self.files.read(file_uri)?;
        let face: PersistedFace = self.json("add face", Resend::Undelivered, |http| {
            http.post(self.group_url(&format!("persons/{person_id}/persistedFaces")))
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(image.clone())
        })?;
        Ok(face.persisted_face_id)
    }

    fn delete_face(&self, person_id: &str, persisted_face_id: &str) -> Result<(), ServiceError> {
        self.execute("delete face", Resend::Safe, |http| {
            http.delete(self.group_url(&format!("persons/{person_id}/persistedFaces/{persisted_face_id}")))
        })?;
        Ok(())
    }

    fn train_person_group(&self) -> Result<(), ServiceError> {
        self.execute("train person group", Resend::Safe, |http| http.post(self.group_url("train")))?;
        Ok(())
    }

    fn get_training_status(&self) -> Result<TrainingStatus, ServiceError> {
        self.json("training status", Resend::Safe, |http| http.get(self.group_url("training")))
    }

    fn detect_faces(&self, file_uri: &str) -> Result<Vec<DetectedFace>, ServiceError> {
        let image = self.files.read(file_uri)?;
        self.json("detect", Resend::Safe, |http| {
            http.post(self.url("detect"))
                .query(&[("returnFaceId", "true"), ("returnFaceLandmarks", "false")])
                .header(CONTENT_TYPE, OCTET_STREAM)
                .body(image.clone())
        })
    }

    fn identify_faces(&self, face_ids: &[String]) -> Result<Vec<Identification>, ServiceError> {
        self.json("identify", Resend::Safe, |http| {
            http.post(self.url("identify")).json(&IdentifyRequest {
                face_ids,
                person_group_id: &self.person_group_id,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AzureFaceClient {
        let mut config = AzureConfig::new("https://example.cognitiveservices.azure.com/face/v1.0", "k");
        config.person_group_id = "people".into();
        AzureFaceClient::new(config).unwrap()
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("https://x/face/v1.0"), "https://x/face/v1.0/");
        assert_eq!(normalize_endpoint("https://x/face/v1.0//"), "https://x/face/v1.0/");
        assert_eq!(normalize_endpoint(" https://x/ "), "https://x/");
    }

    #[test]
    fn test_group_scoped_urls() {
        let c = client();
        assert_eq!(
            c.group_url(""),
            "https://example.cognitiveservices.azure.com/face/v1.0/persongroups/people"
        );
        assert_eq!(
            c.group_url("persons/p1/persistedFaces/f1"),
            "https://example.cognitiveservices.azure.com/face/v1.0/persongroups/people/persons/p1/persistedFaces/f1"
        );
        assert_eq!(c.url("identify"), "https://example.cognitiveservices.azure.com/face/v1.0/identify");
        assert_eq!(c.person_group_id(), "people");
    }

    fn status(status: u16) -> ServiceError {
        ServiceError::Status {
            status,
            code: None,
            message: String::new(),
        }
    }

    #[test]
    fn test_safe_requests_resend_on_any_transient_failure() {
        let timeout = ServiceError::Transport("operation timed out".into());
        assert!(may_resend(&timeout, false, Resend::Safe));
        assert!(may_resend(&status(500), false, Resend::Safe));
        assert!(!may_resend(&status(400), false, Resend::Safe));
    }

    #[test]
    fn test_creating_requests_resend_only_when_undelivered() {
        let timeout = ServiceError::Transport("operation timed out".into());
        assert!(!may_resend(&timeout, false, Resend::Undelivered));
        assert!(may_resend(&timeout, true, Resend::Undelivered));
        assert!(may_resend(&status(429), false, Resend::Undelivered));
        assert!(may_resend(&status(503), false, Resend::Undelivered));
        assert!(!may_resend(&status(500), false, Resend::Undelivered));
        assert!(!may_resend(&status(504), false, Resend::Undelivered));
    }

    #[test]
    fn test_only_rejected_credentials_mean_disconnected() {
        assert!(connection_verdict(Ok(())).unwrap());
        assert!(!connection_verdict(Err(status(401))).unwrap());
        assert!(!connection_verdict(Err(status(403))).unwrap());
        assert_eq!(connection_verdict(Err(status(429))).unwrap_err().status(), Some(429));
        assert_eq!(connection_verdict(Err(status(503))).unwrap_err().status(), Some(503));
        assert!(matches!(
            connection_verdict(Err(ServiceError::Transport("refused".into()))),
            Err(ServiceError::Transport(_))
        ));
    }

    #[test]
    fn test_unreadable_image_fails_before_any_request() {
        let c = client();
        let err = c.add_face("p1", "public://jane.jpeg").unwrap_err();
        assert!(matches!(err, ServiceError::Image { .. }));
        assert!(!err.is_transient());
    }
}
