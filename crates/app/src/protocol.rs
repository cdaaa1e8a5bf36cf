use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::orchestrator::{RunRequest, SourceFile};

fn default_language() -> String {
    "python".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPayload {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Seconds. Omitted uses the server default.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Path to content, written before the code runs.
    #[serde(default)]
    pub files: Option<BTreeMap<String, String>>,
}

impl From<RunPayload> for RunRequest {
    fn from(payload: RunPayload) -> Self {
        RunRequest {
            language: payload.language,
            source: payload.code,
            timeout: payload.timeout.map(Duration::from_secs),
            session_id: payload.session_id,
            files: payload
                .files
                .unwrap_or_default()
                .into_iter()
                .map(|(path, content)| SourceFile { path, content })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionPayload {
    #[serde(default = "default_language")]
    pub language: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_id: String,
    pub language: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionListQuery {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnded {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn run_payload_fills_defaults() {
        let payload: RunPayload = serde_json::from_value(json!({"code": "print(1)"})).unwrap();
        let request = RunRequest::from(payload);
        assert_eq!(request.language, "python");
        assert_eq!(request.timeout, None);
        assert!(request.session_id.is_none());
        assert!(request.files.is_empty());
    }

    #[test]
    fn run_payload_maps_files_in_path_order() {
        let payload: RunPayload = serde_json::from_value(json!({
            "code": "cat b.txt a.txt",
            "language": "bash",
            "timeout": 5,
            "files": {"b.txt": "B", "a.txt": "A"},
        }))
        .unwrap();
        let request = RunRequest::from(payload);
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        let paths: Vec<&str> = request.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, ["a.txt", "b.txt"]);
    }

    #[test]
    fn create_session_requires_user_id() {
        assert!(serde_json::from_value::<CreateSessionPayload>(json!({"language": "node"})).is_err());
    }
}
