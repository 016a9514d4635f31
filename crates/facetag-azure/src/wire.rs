//! Request and response bodies of the Face REST API.

use facetag_core::ServiceError;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub(crate) struct NameBody<'a> {
    pub name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreatedPerson {
    pub person_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersistedFace {
    pub persisted_face_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdentifyRequest<'a> {
    pub face_ids: &'a [String],
    pub person_group_id: &'a str,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Error bodies come either wrapped (`{"error":{...}}`) or flat from the
/// API gateway (`{"statusCode":401,"message":"..."}`).
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Wrapped { error: ErrorDetail },
    Flat(ErrorDetail),
}

/// Build a [`ServiceError`] from a non-success response.
pub(crate) fn status_error(status: u16, body: &str) -> ServiceError {
    let detail = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Wrapped { error }) | Ok(ErrorBody::Flat(error)) => error,
        Err(_) => ErrorDetail {
            code: None,
            message: None,
        },
    };
    let message = detail.message.unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            format!("HTTP {status}")
        } else {
            trimmed.chars().take(200).collect()
        }
    });
    ServiceError::Status {
        status,
        code: detail.code,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapped_error_body() {
        let err = status_error(
            404,
            r#"{"error":{"code":"PersonGroupNotTrained","message":"Person group not trained."}}"#,
        );
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.code(), Some("PersonGroupNotTrained"));
        assert!(err.to_string().contains("Person group not trained."));
    }

    #[test]
    fn test_flat_gateway_error_body() {
        let err = status_error(401, r#"{"statusCode":401,"message":"Access denied due to invalid subscription key."}"#);
        assert_eq!(err.code(), None);
        assert!(err.to_string().contains("invalid subscription key"));
    }

    #[test]
    fn test_non_json_error_body() {
        let err = status_error(502, "<html>Bad Gateway</html>");
        assert!(err.is_transient());
        assert!(err.to_string().contains("Bad Gateway"));
        let err = status_error(500, "");
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn test_identify_request_shape() {
        let ids = vec!["d1".to_string()];
        let body = serde_json::to_value(IdentifyRequest {
            face_ids: &ids,
            person_group_id: "facetag_people",
        })
        .unwrap();
        assert_eq!(body["faceIds"][0], "d1");
        assert_eq!(body["personGroupId"], "facetag_people");
    }
}
