use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entity type used for mapping rows that point at a single face image.
pub const FILE_ENTITY_TYPE: &str = "file";

/// Reference to a local entity, as stored in a tag reference field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalEntityRef {
    pub entity_type: String,
    pub local_id: String,
}

impl LocalEntityRef {
    pub fn new(entity_type: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            local_id: local_id.into(),
        }
    }
}

impl std::fmt::Display for LocalEntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.local_id)
    }
}

/// A persisted row correlating a remote person or persisted face with a
/// local entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonMap {
    pub id: i64,
    /// Remote person id, or persisted-face id when `local_entity_type` is `"file"`.
    pub foreign_id: String,
    pub local_id: String,
    pub local_entity_type: String,
    pub created: DateTime<Utc>,
    pub changed: DateTime<Utc>,
}

impl PersonMap {
    pub fn is_face(&self) -> bool {
        self.local_entity_type == FILE_ENTITY_TYPE
    }

    pub fn local_ref(&self) -> LocalEntityRef {
        LocalEntityRef::new(&self.local_entity_type, &self.local_id)
    }
}

/// Values for a mapping row that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPersonMap {
    pub foreign_id: String,
    pub local_id: String,
    pub local_entity_type: String,
}

impl NewPersonMap {
    pub fn person(person_id: &str, entity: &PersonEntity) -> Self {
        Self {
            foreign_id: person_id.to_string(),
            local_id: entity.id.clone(),
            local_entity_type: entity.entity_type.clone(),
        }
    }

    pub fn face(persisted_face_id: &str, image: &FaceImage) -> Self {
        Self {
            foreign_id: persisted_face_id.to_string(),
            local_id: image.file_id.clone(),
            local_entity_type: FILE_ENTITY_TYPE.to_string(),
        }
    }
}

/// An image file attached to a local entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceImage {
    pub file_id: String,
    /// Stream URI of the file, e.g. `public://people/jane.jpeg`.
    pub uri: String,
}

/// Snapshot of a local "person" entity and its training images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonEntity {
    pub entity_type: String,
    pub bundle: String,
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub images: Vec<FaceImage>,
}

impl PersonEntity {
    pub fn local_ref(&self) -> LocalEntityRef {
        LocalEntityRef::new(&self.entity_type, &self.id)
    }
}

/// Snapshot of a content entity carrying image fields that may be tagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntity {
    pub entity_type: String,
    pub bundle: String,
    pub id: String,
    /// Image field name → referenced image.
    #[serde(default)]
    pub images: BTreeMap<String, FaceImage>,
}

impl ContentEntity {
    pub fn local_ref(&self) -> LocalEntityRef {
        LocalEntityRef::new(&self.entity_type, &self.id)
    }
}

/// Value the host should write into a content entity's tag field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagUpdate {
    pub entity: LocalEntityRef,
    pub tag_field: String,
    pub tags: Vec<LocalEntityRef>,
}

/// A person record on the remote face service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePerson {
    pub person_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub persisted_face_ids: Vec<String>,
    #[serde(default)]
    pub user_data: Option<String>,
}

/// A person group on the remote face service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonGroup {
    pub person_group_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub user_data: Option<String>,
}

/// A face found by detection. The id is transient and unrelated to
/// persisted-face ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedFace {
    pub face_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub person_id: String,
    pub confidence: f32,
}

/// Identification result for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub face_id: String,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// Training state of the person group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingStatus {
    /// One of `notstarted`, `running`, `succeeded`, `failed`.
    pub status: String,
    #[serde(default)]
    pub created_date_time: Option<String>,
    #[serde(default)]
    pub last_action_date_time: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_row_points_at_file() {
        let image = FaceImage { file_id: "7".into(), uri: "public://a.jpeg".into() };
        let row = NewPersonMap::face("face-1", &image);
        assert_eq!(row.local_entity_type, FILE_ENTITY_TYPE);
        assert_eq!(row.local_id, "7");
        assert_eq!(row.foreign_id, "face-1");
    }

    #[test]
    fn test_remote_person_decodes_camel_case() {
        let person: RemotePerson = serde_json::from_str(
            r#"{"personId":"p1","name":"Jane","persistedFaceIds":["f1","f2"],"userData":null}"#,
        )
        .unwrap();
        assert_eq!(person.person_id, "p1");
        assert_eq!(person.persisted_face_ids, vec!["f1", "f2"]);
    }

    #[test]
    fn test_identification_without_candidates() {
        let ident: Identification = serde_json::from_str(r#"{"faceId":"d1"}"#).unwrap();
        assert!(ident.candidates.is_empty());
    }

    #[test]
    fn test_local_ref_display() {
        assert_eq!(LocalEntityRef::new("node", "12").to_string(), "node/12");
    }
}
