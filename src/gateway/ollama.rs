use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::ChatMessage;

/// Long timeout: large local models can take minutes on a single reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Client for a local Ollama server.
pub struct OllamaClient {
    client: reqwest::Client,
    host: String,
    default_model: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaClient {
    pub fn new(host: impl Into<String>, default_model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            host: host.into(),
            default_model: default_model.into(),
        }
    }

    pub async fn generate(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        let url = format!("{}/api/chat", self.host);
        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Backend(format!("Ollama request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Backend(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Backend(format!("Invalid Ollama response: {}", e)))?;

        Ok(chat.message.map(|m| m.content).unwrap_or_default())
    }

    /// Installed models from `/api/tags`. Falls back to the configured
    /// default model when the server is unreachable.
    pub async fn list_models(&self) -> Vec<String> {
        let url = format!("{}/api/tags", self.host);
        let response = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Failed to list Ollama models: {}", e);
                return vec![self.default_model.clone()];
            }
        };

        match response.json::<TagsResponse>().await {
            Ok(tags) if !tags.models.is_empty() => {
                tags.models.into_iter().map(|m| m.name).collect()
            }
            Ok(_) => vec![self.default_model.clone()],
            Err(e) => {
                tracing::warn!("Invalid Ollama tags response: {}", e);
                vec![self.default_model.clone()]
            }
        }
    }
}
