use serde::Serialize;
use serde_json::json;

use crate::error::SyncError;

pub const NOT_APPLICABLE_MESSAGE: &str = "not applicable";

/// Outcome of one invocation: a status code plus a `{"message": ...}` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    pub status_code: u16,
    pub message: String,
}

/// Lambda-style envelope printed by the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub body: String,
}

impl SyncResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            message: message.into(),
        }
    }

    pub fn not_applicable() -> Self {
        Self::ok(NOT_APPLICABLE_MESSAGE)
    }

    pub fn from_error(error: &SyncError) -> Self {
        Self {
            status_code: error.status_code(),
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// JSON body, pretty-printed with two-space indentation.
    pub fn body(&self) -> String {
        serde_json::to_string_pretty(&json!({ "message": self.message }))
            .unwrap_or_else(|_| format!("{{\"message\": {:?}}}", self.message))
    }

    pub fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope {
            status_code: self.status_code,
            body: self.body(),
        }
    }
}

impl From<SyncError> for SyncResponse {
    fn from(error: SyncError) -> Self {
        Self::from_error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::SyncResponse;
    use crate::error::SyncError;

    #[test]
    fn body_is_pretty_json_message() {
        let response = SyncResponse::ok("sync complete - js:greet");
        assert_eq!(
            response.body(),
            "{\n  \"message\": \"sync complete - js:greet\"\n}"
        );
    }

    #[test]
    fn errors_map_to_status_and_message() {
        let response = SyncResponse::from(SyncError::Unauthorized(
            "unauthorized signature".to_string(),
        ));
        assert_eq!(response.status_code, 401);
        assert_eq!(response.message, "unauthorized signature");
        assert!(!response.is_success());
    }

    #[test]
    fn envelope_uses_camel_case_keys() {
        let envelope = SyncResponse::not_applicable().envelope();
        let rendered = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(rendered["statusCode"], 200);
        assert!(
            rendered["body"]
                .as_str()
                .expect("body string")
                .contains("not applicable")
        );
    }
}
