//! Detection and identification of faces in content images.

use crate::reconciler::SyncError;
use crate::service::{FaceService, MAX_IDENTIFY_BATCH};
use crate::settings::Settings;
use crate::store::{MapField, MapQuery, MappingStore};
use crate::types::{ContentEntity, LocalEntityRef, TagUpdate};

pub struct Pipeline<S, M> {
    service: S,
    store: M,
    settings: Settings,
}

impl<S: FaceService, M: MappingStore> Pipeline<S, M> {
    pub fn new(service: S, store: M, settings: Settings) -> Self {
        Self {
            service,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Transient face ids detected in `image_field`. A missing or empty
    /// field yields nothing and makes no remote call.
    pub fn detect_faces(&self, content: &ContentEntity, image_field: &str) -> Result<Vec<String>, SyncError> {
        let Some(image) = content.images.get(image_field) else {
            tracing::debug!(entity = %content.local_ref(), field = image_field, "no image to detect");
            return Ok(Vec::new());
        };
        let faces = self.service.detect_faces(&image.uri)?;
        tracing::debug!(entity = %content.local_ref(), field = image_field, faces = faces.len(), "detected faces");
        Ok(faces.into_iter().map(|f| f.face_id).collect())
    }

    /// Local person entities matching the top candidate of each face.
    ///
    /// Only the first [`MAX_IDENTIFY_BATCH`] faces are identified. Remote
    /// persons without a mapping row are skipped, and the result holds each
    /// person once, in identification order.
    pub fn identify_faces(&self, face_ids: &[String]) -> Result<Vec<LocalEntityRef>, SyncError> {
        if face_ids.is_empty() {
            return Ok(Vec::new());
        }
        if face_ids.len() > MAX_IDENTIFY_BATCH {
            tracing::debug!(detected = face_ids.len(), "identifying only the first {MAX_IDENTIFY_BATCH} faces");
        }
        let batch = &face_ids[..face_ids.len().min(MAX_IDENTIFY_BATCH)];
        let identifications = self.service.identify_faces(batch)?;

        let mut person_ids: Vec<String> = Vec::new();
        for ident in identifications {
            let Some(top) = ident.candidates.into_iter().next() else {
                continue;
            };
            if let Some(min) = self.settings.min_confidence {
                if top.confidence < min {
                    tracing::debug!(face_id = %ident.face_id, confidence = top.confidence, "candidate below threshold");
                    continue;
                }
            }
            if !person_ids.contains(&top.person_id) {
                person_ids.push(top.person_id);
            }
        }
        if person_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.store.find(
            &MapQuery::new()
                .any_of(MapField::ForeignId, person_ids.iter().cloned())
                .eq(MapField::LocalEntityType, self.settings.person_entity_type()),
        )?;
        let mut people: Vec<LocalEntityRef> = Vec::new();
        for person_id in &person_ids {
            match rows.iter().find(|row| &row.foreign_id == person_id) {
                Some(row) => {
                    let local = row.local_ref();
                    if !people.contains(&local) {
                        people.push(local);
                    }
                }
                None => tracing::warn!(person_id = %person_id, "identified person has no local mapping"),
            }
        }
        Ok(people)
    }

    pub fn detect_and_identify(
        &self,
        content: &ContentEntity,
        image_field: &str,
    ) -> Result<Vec<LocalEntityRef>, SyncError> {
        let face_ids = self.detect_faces(content, image_field)?;
        self.identify_faces(&face_ids)
    }

    /// Tag update for `image_field`, or `None` when nobody was recognised.
    pub fn find_faces_and_tag(
        &self,
        content: &ContentEntity,
        image_field: &str,
    ) -> Result<Option<TagUpdate>, SyncError> {
        let tag_field = self
            .settings
            .tag_field_for(image_field)
            .ok_or_else(|| SyncError::NotADetectionField(image_field.to_string()))?
            .to_string();
        let tags = self.detect_and_identify(content, image_field)?;
        if tags.is_empty() {
            return Ok(None);
        }
        tracing::info!(entity = %content.local_ref(), field = %tag_field, tags = tags.len(), "tagging recognised people");
        Ok(Some(TagUpdate {
            entity: content.local_ref(),
            tag_field,
            tags,
        }))
    }
}
