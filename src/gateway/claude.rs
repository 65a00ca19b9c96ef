use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::ChatMessage;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for the Anthropic messages API.
pub struct ClaudeClient {
    client: reqwest::Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl ClaudeClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key: api_key.into(),
        }
    }

    pub async fn generate(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(AppError::Backend(
                "ANTHROPIC_API_KEY not set; Claude models unavailable".to_string(),
            ));
        }

        let payload = serde_json::json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
        });

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Backend(format!("Claude request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "Claude API returned {}: {}",
                status, body
            )));
        }

        let messages: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AppError::Backend(format!("Invalid Claude response: {}", e)))?;

        messages
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| AppError::Backend("Claude response contained no content".to_string()))
    }

    /// Known Claude models, empty when no API key is configured.
    pub fn available_models(&self) -> Vec<String> {
        if self.api_key.is_empty() {
            return Vec::new();
        }
        [
            "claude-sonnet-4-5-20250929",
            "claude-opus-4-1-20250805",
            "claude-sonnet-4-20250522",
            "claude-haiku-4-5-20251015",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_api_key_fails_before_network() {
        let client = ClaudeClient::new("");
        let err = client
            .generate("claude-3-5-haiku-20241022", &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_model_list_gated_on_key() {
        assert!(ClaudeClient::new("").available_models().is_empty());
        assert!(!ClaudeClient::new("sk-test").available_models().is_empty());
    }
}
