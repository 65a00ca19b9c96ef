pub mod claude;
pub mod ollama;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::Result;
use crate::models::ChatMessage;
use claude::ClaudeClient;
use ollama::OllamaClient;

/// Which backend serves a given model id. Resolved once per call from the
/// model naming convention; no dynamic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local Ollama server
    Ollama,
    /// Hosted Anthropic API
    Claude,
}

impl Backend {
    pub fn resolve(model: &str) -> Self {
        if model.starts_with("claude-") {
            Backend::Claude
        } else {
            Backend::Ollama
        }
    }
}

/// Uniform completion interface over the heterogeneous backends. The
/// comparison orchestrator only depends on this seam.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate a completion for the given message list. Network errors,
    /// missing credentials, and unavailable backends all surface as
    /// `AppError::Backend`; no automatic retry.
    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> Result<String>;
}

/// Routes each call to the Ollama or Claude client by model id.
pub struct LlmGateway {
    ollama: OllamaClient,
    claude: ClaudeClient,
}

impl LlmGateway {
    pub fn new(config: &Config) -> Self {
        Self {
            ollama: OllamaClient::new(&config.ollama_host, &config.default_model),
            claude: ClaudeClient::new(&config.anthropic_api_key),
        }
    }

    /// All known models, Claude first for visibility. Ollama listing
    /// failures degrade to the configured default model.
    pub async fn list_models(&self) -> Vec<String> {
        let mut models = self.claude.available_models();
        models.extend(self.ollama.list_models().await);
        models
    }
}

#[async_trait]
impl ModelClient for LlmGateway {
    async fn generate(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        match Backend::resolve(model) {
            Backend::Claude => self.claude.generate(model, messages).await,
            Backend::Ollama => self.ollama.generate(model, messages).await,
        }
    }
}
