use serde::Deserialize;
use std::path::PathBuf;

/// Runtime configuration. Environment variables take precedence over the
/// optional `config.toml` in the data directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP API listens on
    pub port: u16,
    /// Ollama server base URL
    pub ollama_host: String,
    /// Default Ollama model when none is requested
    pub default_model: String,
    /// Anthropic API key (empty = Claude models unavailable)
    pub anthropic_api_key: String,
    /// Recent turns kept in LLM context (0 = unlimited)
    pub context_window_size: usize,
    /// Root data directory (conversations/ and logs/ live under it)
    pub data_dir: PathBuf,
}

/// Subset of fields that can be set from `config.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    port: Option<u16>,
    ollama_host: Option<String>,
    default_model: Option<String>,
    context_window_size: Option<usize>,
}

impl Config {
    pub fn load() -> Self {
        let data_dir = std::env::var("CHATLEDGER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_data_dir());

        let file = Self::read_file_config(&data_dir);

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.port)
                .unwrap_or(5005),
            ollama_host: std::env::var("OLLAMA_HOST")
                .ok()
                .or(file.ollama_host)
                .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
            default_model: std::env::var("OLLAMA_MODEL")
                .ok()
                .or(file.default_model)
                .unwrap_or_else(|| "qwen2.5:32b-instruct".to_string()),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            context_window_size: std::env::var("CONTEXT_WINDOW_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file.context_window_size)
                .unwrap_or(10),
            data_dir,
        }
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatledger")
    }

    fn read_file_config(data_dir: &PathBuf) -> FileConfig {
        let path = data_dir.join("config.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return FileConfig::default();
        };
        match toml::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Ignoring malformed config.toml at {:?}: {}", path, e);
                FileConfig::default()
            }
        }
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 9001\ncontext_window_size = 4\n",
        )
        .unwrap();

        let file = Config::read_file_config(&dir.path().to_path_buf());
        assert_eq!(file.port, Some(9001));
        assert_eq!(file.context_window_size, Some(4));
        assert!(file.ollama_host.is_none());
    }

    #[test]
    fn test_malformed_file_config_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = {").unwrap();

        let file = Config::read_file_config(&dir.path().to_path_buf());
        assert!(file.port.is_none());
    }
}
