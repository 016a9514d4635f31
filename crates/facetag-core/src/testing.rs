//! Recording in-memory face service for unit tests.

use crate::service::{FaceService, ServiceError};
use crate::types::{
    Candidate, DetectedFace, FaceImage, Identification, PersonEntity, PersonGroup, RemotePerson,
    TrainingStatus,
};
use std::cell::RefCell;
use std::collections::BTreeMap;

#[derive(Default)]
struct MockState {
    groups: Vec<PersonGroup>,
    people: BTreeMap<String, RemotePerson>,
    next_person: u32,
    next_face: u32,
    calls: Vec<String>,
    detected: Vec<DetectedFace>,
    identified: Vec<Identification>,
    identify_batches: Vec<Vec<String>>,
    training: Option<TrainingStatus>,
    training_error: Option<(u16, Option<String>)>,
    fail_add_face: bool,
}

#[derive(Default)]
pub struct MockFaceService {
    state: RefCell<MockState>,
}

fn not_found(what: &str) -> ServiceError {
    ServiceError::Status {
        status: 404,
        code: Some("PersonNotFound".into()),
        message: format!("{what} not found"),
    }
}

impl MockFaceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every call made so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.state.borrow().calls.iter().filter(|c| *c == method).count()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub fn person(&self, person_id: &str) -> Option<RemotePerson> {
        self.state.borrow().people.get(person_id).cloned()
    }

    /// Seed a remote person directly, bypassing the call log.
    pub fn insert_person(&self, person_id: &str, name: &str, faces: &[&str]) {
        self.state.borrow_mut().people.insert(
            person_id.to_string(),
            RemotePerson {
                person_id: person_id.to_string(),
                name: name.to_string(),
                persisted_face_ids: faces.iter().map(|f| f.to_string()).collect(),
                user_data: None,
            },
        );
    }

    pub fn remove_person(&self, person_id: &str) {
        self.state.borrow_mut().people.remove(person_id);
    }

    pub fn set_detected(&self, face_ids: &[&str]) {
        self.state.borrow_mut().detected = face_ids
            .iter()
            .map(|id| DetectedFace { face_id: id.to_string() })
            .collect();
    }

    pub fn set_identified(&self, results: Vec<Identification>) {
        self.state.borrow_mut().identified = results;
    }

    pub fn identify_batches(&self) -> Vec<Vec<String>> {
        self.state.borrow().identify_batches.clone()
    }

    pub fn set_training(&self, status: TrainingStatus) {
        self.state.borrow_mut().training = Some(status);
    }

    pub fn set_training_error(&self, status: u16, code: Option<&str>) {
        self.state.borrow_mut().training_error = Some((status, code.map(str::to_string)));
    }

    pub fn fail_add_face(&self) {
        self.state.borrow_mut().fail_add_face = true;
    }

    fn record(&self, method: &str) {
        self.state.borrow_mut().calls.push(method.to_string());
    }
}

impl FaceService for MockFaceService {
    fn person_group_id(&self) -> &str {
        "test_group"
    }

    fn check_status(&self) -> Result<bool, ServiceError> {
        self.record("check_status");
        Ok(true)
    }

    fn create_person_group(&self, name: &str) -> Result<(), ServiceError> {
        self.record("create_person_group");
        let mut state = self.state.borrow_mut();
        state.groups.retain(|g| g.person_group_id != "test_group");
        state.groups.push(PersonGroup {
            person_group_id: "test_group".into(),
            name: name.into(),
            user_data: None,
        });
        Ok(())
    }

    fn delete_person_group(&self) -> Result<(), ServiceError> {
        self.record("delete_person_group");
        let mut state = self.state.borrow_mut();
        state.groups.clear();
        state.people.clear();
        Ok(())
    }

    fn list_person_groups(&self) -> Result<Vec<PersonGroup>, ServiceError> {
        self.record("list_person_groups");
        Ok(self.state.borrow().groups.clone())
    }

    fn create_person(&self, name: &str) -> Result<String, ServiceError> {
        self.record("create_person");
        let mut state = self.state.borrow_mut();
        state.next_person += 1;
        let id = format!("person-{}", state.next_person);
        state.people.insert(
            id.clone(),
            RemotePerson {
                person_id: id.clone(),
                name: name.to_string(),
                persisted_face_ids: Vec::new(),
                user_data: None,
            },
        );
        Ok(id)
    }

    fn get_person(&self, person_id: &str) -> Result<RemotePerson, ServiceError> {
        self.record("get_person");
        self.person(person_id).ok_or_else(|| not_found(person_id))
    }

    fn update_person(&self, person_id: &str, name: &str) -> Result<(), ServiceError> {
        self.record("update_person");
        let mut state = self.state.borrow_mut();
        let person = state.people.get_mut(person_id).ok_or_else(|| not_found(person_id))?;
        person.name = name.to_string();
        Ok(())
    }

    fn delete_person(&self, person_id: &str) -> Result<(), ServiceError> {
        self.record("delete_person");
        self.state.borrow_mut().people.remove(person_id);
        Ok(())
    }

    fn list_people(&self) -> Result<Vec<RemotePerson>, ServiceError> {
        self.record("list_people");
        Ok(self.state.borrow().people.values().cloned().collect())
    }

    fn add_face(&self, person_id: &str, _file_uri: &str) -> Result<String, ServiceError> {
        self.record("add_face");
        let mut state = self.state.borrow_mut();
        if state.fail_add_face {
            return Err(ServiceError::Status {
                status: 400,
                code: Some("InvalidImage".into()),
                message: "no face in image".into(),
            });
        }
        state.next_face += 1;
        let face_id = format!("face-{}", state.next_face);
        let person = state.people.get_mut(person_id).ok_or_else(|| not_found(person_id))?;
        person.persisted_face_ids.push(face_id.clone());
        Ok(face_id)
    }

    fn delete_face(&self, person_id: &str, persisted_face_id: &str) -> Result<(), ServiceError> {
        self.record("delete_face");
        let mut state = self.state.borrow_mut();
        let person = state.people.get_mut(person_id).ok_or_else(|| not_found(person_id))?;
        person.persisted_face_ids.retain(|f| f != persisted_face_id);
        Ok(())
    }

    fn train_person_group(&self) -> Result<(), ServiceError> {
        self.record("train_person_group");
        Ok(())
    }

    fn get_training_status(&self) -> Result<TrainingStatus, ServiceError> {
        self.record("get_training_status");
        let state = self.state.borrow();
        if let Some((status, code)) = &state.training_error {
            return Err(ServiceError::Status {
                status: *status,
                code: code.clone(),
                message: "training status unavailable".into(),
            });
        }
        state
            .training
            .clone()
            .ok_or_else(|| ServiceError::Decode("no training status seeded".into()))
    }

    fn detect_faces(&self, _file_uri: &str) -> Result<Vec<DetectedFace>, ServiceError> {
        self.record("detect_faces");
        Ok(self.state.borrow().detected.clone())
    }

    fn identify_faces(&self, face_ids: &[String]) -> Result<Vec<Identification>, ServiceError> {
        self.record("identify_faces");
        let mut state = self.state.borrow_mut();
        state.identify_batches.push(face_ids.to_vec());
        Ok(state.identified.clone())
    }
}

pub fn image(file_id: &str) -> FaceImage {
    FaceImage {
        file_id: file_id.to_string(),
        uri: format!("public://faces/{file_id}.jpeg"),
    }
}

pub fn person(id: &str, label: &str, images: &[&str]) -> PersonEntity {
    PersonEntity {
        entity_type: "node".into(),
        bundle: "person".into(),
        id: id.to_string(),
        label: label.to_string(),
        images: images.iter().map(|f| image(f)).collect(),
    }
}

pub fn identified(face_id: &str, person_ids: &[(&str, f32)]) -> Identification {
    Identification {
        face_id: face_id.to_string(),
        candidates: person_ids
            .iter()
            .map(|(id, confidence)| Candidate {
                person_id: id.to_string(),
                confidence: *confidence,
            })
            .collect(),
    }
}

pub fn settings() -> crate::settings::Settings {
    crate::settings::Settings::new(
        "node.person".parse().expect("valid bundle"),
        "node.field_face".parse().expect("valid field"),
    )
    .with_detection_field("field_image", "field_people")
}
