use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filesystem locations of the artifacts written for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub turn_dir: String,
    pub jsonl_path: String,
    pub md_path: String,
    pub html_path: String,
    /// Empty when pandoc is unavailable or conversion failed
    pub docx_path: String,
}

/// Outcome of one model's call within a comparison turn. Exactly one of
/// `response` / `error` is set. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResult {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub response_time: f64,
}

impl ModelResult {
    pub fn ok(model: impl Into<String>, response: impl Into<String>, response_time: f64) -> Self {
        Self {
            model: model.into(),
            response: Some(response.into()),
            error: None,
            response_time,
        }
    }

    pub fn failed(model: impl Into<String>, error: impl Into<String>, response_time: f64) -> Self {
        Self {
            model: model.into(),
            response: None,
            error: Some(error.into()),
            response_time,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A single prompt/response exchange with one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularTurn {
    pub turn_number: usize,
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub prompt: String,
    pub response: String,
    pub response_time: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub paths: ArtifactPaths,
}

/// One prompt fanned out to several models in parallel. Results are kept in
/// the caller's requested model order and never fold into future context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonTurn {
    pub turn_number: usize,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub results: Vec<ModelResult>,
    /// Wall-clock time until the slowest model finished
    pub response_time: f64,
    #[serde(default)]
    pub paths: ArtifactPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Turn {
    Regular(RegularTurn),
    Comparison(ComparisonTurn),
}

impl Turn {
    pub fn turn_number(&self) -> usize {
        match self {
            Turn::Regular(t) => t.turn_number,
            Turn::Comparison(t) => t.turn_number,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Turn::Regular(t) => t.timestamp,
            Turn::Comparison(t) => t.timestamp,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Turn::Regular(t) => &t.prompt,
            Turn::Comparison(t) => &t.prompt,
        }
    }

    pub fn response_time(&self) -> f64 {
        match self {
            Turn::Regular(t) => t.response_time,
            Turn::Comparison(t) => t.response_time,
        }
    }
}

/// A file uploaded into a conversation. Its extracted text is prepended to
/// every later prompt until the conversation ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub filename: String,
    pub content: String,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
            uploaded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_result_exclusivity() {
        let ok = ModelResult::ok("llama3", "hi", 0.5);
        assert!(ok.is_ok());
        assert!(ok.response.is_some() && ok.error.is_none());

        let err = ModelResult::failed("llama3", "connection refused", 0.1);
        assert!(!err.is_ok());
        assert!(err.response.is_none() && err.error.is_some());
    }
}
