//! Immutable reconciler settings.

use crate::types::{ContentEntity, PersonEntity};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected \"<entity_type>.<name>\", got {0:?}")]
    MalformedPair(String),
    #[error("person image field {field:?} belongs to {found:?}, not the person entity type {expected:?}")]
    ImageFieldMismatch {
        field: String,
        expected: String,
        found: String,
    },
    #[error("min_confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(String),
    #[error("detection field {0:?} has no tag field")]
    MissingTagField(String),
}

fn split_pair(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('.') {
        Some((left, right)) if !left.is_empty() && !right.is_empty() && !right.contains('.') => {
            Ok((left.to_string(), right.to_string()))
        }
        _ => Err(ConfigError::MalformedPair(s.to_string())),
    }
}

/// An entity type and bundle, written as `node.person`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityBundle {
    pub entity_type: String,
    pub bundle: String,
}

impl FromStr for EntityBundle {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, bundle) = split_pair(s)?;
        Ok(Self { entity_type, bundle })
    }
}

impl TryFrom<String> for EntityBundle {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EntityBundle> for String {
    fn from(b: EntityBundle) -> String {
        format!("{}.{}", b.entity_type, b.bundle)
    }
}

/// A field on an entity type, written as `node.field_face`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldRef {
    pub entity_type: String,
    pub field: String,
}

impl FromStr for FieldRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, field) = split_pair(s)?;
        Ok(Self { entity_type, field })
    }
}

impl TryFrom<String> for FieldRef {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FieldRef> for String {
    fn from(f: FieldRef) -> String {
        format!("{}.{}", f.entity_type, f.field)
    }
}

/// An image field whose detected faces are written into `tag_field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionField {
    pub image_field: String,
    pub tag_field: String,
}

/// Settings shared by the reconciler, pipeline and job workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub person_entity_bundle: EntityBundle,
    pub person_image_field: FieldRef,
    /// Process entity events inline instead of queueing them.
    #[serde(default = "default_synchronous")]
    pub synchronous: bool,
    #[serde(default)]
    pub detection_fields: Vec<DetectionField>,
    /// Minimum confidence for the top identification candidate. Unset means
    /// the first candidate is always accepted.
    #[serde(default)]
    pub min_confidence: Option<f32>,
}

fn default_synchronous() -> bool {
    true
}

impl Settings {
    pub fn new(person_entity_bundle: EntityBundle, person_image_field: FieldRef) -> Self {
        Self {
            person_entity_bundle,
            person_image_field,
            synchronous: true,
            detection_fields: Vec::new(),
            min_confidence: None,
        }
    }

    pub fn with_detection_field(mut self, image_field: &str, tag_field: &str) -> Self {
        self.detection_fields.push(DetectionField {
            image_field: image_field.to_string(),
            tag_field: tag_field.to_string(),
        });
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.person_image_field.entity_type != self.person_entity_bundle.entity_type {
            return Err(ConfigError::ImageFieldMismatch {
                field: String::from(self.person_image_field.clone()),
                expected: self.person_entity_bundle.entity_type.clone(),
                found: self.person_image_field.entity_type.clone(),
            });
        }
        if let Some(min) = self.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(ConfigError::ConfidenceOutOfRange(min.to_string()));
            }
        }
        if let Some(field) = self.detection_fields.iter().find(|f| f.tag_field.is_empty()) {
            return Err(ConfigError::MissingTagField(field.image_field.clone()));
        }
        Ok(())
    }

    pub fn person_entity_type(&self) -> &str {
        &self.person_entity_bundle.entity_type
    }

    pub fn is_person(&self, entity: &PersonEntity) -> bool {
        entity.entity_type == self.person_entity_bundle.entity_type
            && entity.bundle == self.person_entity_bundle.bundle
    }

    /// Target tag field for a detection-enabled image field.
    pub fn tag_field_for(&self, image_field: &str) -> Option<&str> {
        self.detection_fields
            .iter()
            .find(|f| f.image_field == image_field)
            .map(|f| f.tag_field.as_str())
    }

    /// Detection-enabled image fields present on `content`.
    pub fn detection_fields_on<'a>(&'a self, content: &'a ContentEntity) -> impl Iterator<Item = &'a str> + 'a {
        self.detection_fields
            .iter()
            .filter(|f| content.images.contains_key(&f.image_field))
            .map(|f| f.image_field.as_str())
    }
}
