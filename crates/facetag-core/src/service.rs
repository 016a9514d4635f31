//! Remote face service capability.
//!
//! The reconciler and pipeline only see this trait; the concrete backend
//! (Azure Face API) is picked once when the daemon starts.

use crate::types::{DetectedFace, Identification, PersonGroup, RemotePerson, TrainingStatus};
use thiserror::Error;

/// Azure's hard limit on face ids per identify call.
pub const MAX_IDENTIFY_BATCH: usize = 10;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("remote returned HTTP {status}: {message}")]
    Status {
        status: u16,
        /// Service-specific error code from the response body, if any.
        code: Option<String>,
        message: String,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("cannot read image {uri}: {reason}")]
    Image { uri: String, reason: String },
}

impl ServiceError {
    /// HTTP status code, when the remote answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            ServiceError::Status { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Whether retrying later could succeed: connection failures, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transport(_) => true,
            ServiceError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            ServiceError::Decode(_) | ServiceError::Image { .. } => false,
        }
    }
}

/// Operations consumed from the remote face service. All person and face
/// calls are scoped to the person group the implementation was built for.
pub trait FaceService {
    /// Id of the person group every call is scoped to.
    fn person_group_id(&self) -> &str;

    /// True when the configured endpoint and key are accepted.
    fn check_status(&self) -> Result<bool, ServiceError>;

    fn create_person_group(&self, name: &str) -> Result<(), ServiceError>;
    fn delete_person_group(&self) -> Result<(), ServiceError>;
    fn list_person_groups(&self) -> Result<Vec<PersonGroup>, ServiceError>;

    /// Create a person and return its remote id.
    fn create_person(&self, name: &str) -> Result<String, ServiceError>;
    fn get_person(&self, person_id: &str) -> Result<RemotePerson, ServiceError>;
    fn update_person(&self, person_id: &str, name: &str) -> Result<(), ServiceError>;
    fn delete_person(&self, person_id: &str) -> Result<(), ServiceError>;
    fn list_people(&self) -> Result<Vec<RemotePerson>, ServiceError>;

    /// Enroll the image at `file_uri` for a person and return the persisted-face id.
    fn add_face(&self, person_id: &str, file_uri: &str) -> Result<String, ServiceError>;
    fn delete_face(&self, person_id: &str, persisted_face_id: &str) -> Result<(), ServiceError>;

    fn train_person_group(&self) -> Result<(), ServiceError>;
    fn get_training_status(&self) -> Result<TrainingStatus, ServiceError>;

    fn detect_faces(&self, file_uri: &str) -> Result<Vec<DetectedFace>, ServiceError>;
    /// Identify up to [`MAX_IDENTIFY_BATCH`] detected faces against the person group.
    fn identify_faces(&self, face_ids: &[String]) -> Result<Vec<Identification>, ServiceError>;
}

impl<T: FaceService + ?Sized> FaceService for &T {
    fn person_group_id(&self) -> &str {
        (**self).person_group_id()
    }
    fn check_status(&self) -> Result<bool, ServiceError> {
        (**self).check_status()
    }
    fn create_person_group(&self, name: &str) -> Result<(), ServiceError> {
        (**self).create_person_group(name)
    }
    fn delete_person_group(&self) -> Result<(), ServiceError> {
        (**self).delete_person_group()
    }
    fn list_person_groups(&self) -> Result<Vec<PersonGroup>, ServiceError> {
        (**self).list_person_groups()
    }
    fn create_person(&self, name: &str) -> Result<String, ServiceError> {
        (**self).create_person(name)
    }
    fn get_person(&self, person_id: &str) -> Result<RemotePerson, ServiceError> {
        (**self).get_person(person_id)
    }
    fn update_person(&self, person_id: &str, name: &str) -> Result<(), ServiceError> {
        (**self).update_person(person_id, name)
    }
    fn delete_person(&self, person_id: &str) -> Result<(), ServiceError> {
        (**self).delete_person(person_id)
    }
    fn list_people(&self) -> Result<Vec<RemotePerson>, ServiceError> {
        (**self).list_people()
    }
    fn add_face(&self, person_id: &str, file_uri: &str) -> Result<String, ServiceError> {
        (**self).add_face(person_id, file_uri)
    }
    fn delete_face(&self, person_id: &str, persisted_face_id: &str) -> Result<(), ServiceError> {
        (**self).delete_face(person_id, persisted_face_id)
    }
    fn train_person_group(&self) -> Result<(), ServiceError> {
        (**self).train_person_group()
    }
    fn get_training_status(&self) -> Result<TrainingStatus, ServiceError> {
        (**self).get_training_status()
    }
    fn detect_faces(&self, file_uri: &str) -> Result<Vec<DetectedFace>, ServiceError> {
        (**self).detect_faces(file_uri)
    }
    fn identify_faces(&self, face_ids: &[String]) -> Result<Vec<Identification>, ServiceError> {
        (**self).identify_faces(face_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ServiceError {
        ServiceError::Status { status: code, code: None, message: String::new() }
    }

    #[test]
    fn test_transient_classification() {
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(ServiceError::Transport("reset".into()).is_transient());
        assert!(!status(400).is_transient());
        assert!(!status(404).is_transient());
        assert!(!ServiceError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn test_status_accessors() {
        let err = ServiceError::Status {
            status: 404,
            code: Some("PersonGroupNotTrained".into()),
            message: "not trained".into(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.code(), Some("PersonGroupNotTrained"));
        assert_eq!(ServiceError::Transport("x".into()).status(), None);
    }
}
