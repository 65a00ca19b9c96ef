use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{
    turn::{ComparisonTurn, RegularTurn},
    ArtifactPaths, Conversation, ModelResult, Turn,
};

const CONVERSATIONS_CSV_HEADER: &str = "conversation_id,start_time,end_time,duration_seconds,\
total_turns,models_used,conversation_dir";
const TURNS_CSV_HEADER: &str = "conversation_id,turn_number,timestamp,model,prompt,response,\
response_time_seconds,jsonl_path,md_path,html_path,docx_path";

/// One line in the saved-conversations listing.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationListing {
    pub id: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub total_turns: usize,
    pub models_used: Vec<String>,
    pub first_prompt: String,
}

/// On-disk shape of one turn inside `conversation.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryTurn {
    pub turn: usize,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ModelResult>>,
    pub response_time: f64,
}

/// On-disk shape of `conversation.json`. Rewritten whole on every end so
/// the file is always self-consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: Option<f64>,
    pub total_turns: usize,
    pub models_used: Vec<String>,
    pub turns: Vec<SummaryTurn>,
}

/// The on-disk mirror of conversations: per-conversation directories with
/// per-turn artifacts and a JSON summary, plus two append-only CSV ledgers.
#[derive(Clone)]
pub struct ConversationStore {
    conversations_dir: PathBuf,
    logs_dir: PathBuf,
}

/// Quote a CSV field per RFC 4180 when it contains a separator, quote, or
/// newline (what Python's csv.writer does by default).
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_row(fields: &[String]) -> String {
    let mut row = fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

impl ConversationStore {
    /// Create the store, its directories, and the CSV headers if missing.
    pub fn init(config: &Config) -> Result<Self> {
        let store = Self {
            conversations_dir: config.conversations_dir(),
            logs_dir: config.logs_dir(),
        };
        std::fs::create_dir_all(&store.conversations_dir)?;
        std::fs::create_dir_all(&store.logs_dir)?;

        let conversations_csv = store.conversations_csv();
        if !conversations_csv.exists() {
            std::fs::write(&conversations_csv, format!("{}\n", CONVERSATIONS_CSV_HEADER))?;
        }
        let turns_csv = store.turns_csv();
        if !turns_csv.exists() {
            std::fs::write(&turns_csv, format!("{}\n", TURNS_CSV_HEADER))?;
        }

        Ok(store)
    }

    pub fn conversations_csv(&self) -> PathBuf {
        self.logs_dir.join("conversations.csv")
    }

    pub fn turns_csv(&self) -> PathBuf {
        self.logs_dir.join("turns.csv")
    }

    pub fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.conversations_dir.join(conversation_id)
    }

    fn summary_path(&self, conversation_id: &str) -> PathBuf {
        self.conversation_dir(conversation_id).join("conversation.json")
    }

    pub async fn create_conversation_dir(&self, conversation_id: &str) -> Result<PathBuf> {
        let dir = self.conversation_dir(conversation_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn append_csv(&self, path: PathBuf, row: String) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        file.write_all(row.as_bytes()).await?;
        Ok(())
    }

    /// Write the artifact set for a regular turn.
    pub async fn write_turn_artifacts(
        &self,
        conversation_id: &str,
        turn_number: usize,
        model: &str,
        prompt: &str,
        response: &str,
    ) -> Result<ArtifactPaths> {
        let conv_dir = self.create_conversation_dir(conversation_id).await?;
        super::artifacts::write_turn_artifacts(
            &conv_dir,
            conversation_id,
            turn_number,
            model,
            prompt,
            response,
        )
        .await
    }

    /// Write the artifact set for a comparison turn.
    pub async fn write_comparison_artifacts(
        &self,
        conversation_id: &str,
        turn_number: usize,
        prompt: &str,
        results: &[ModelResult],
    ) -> Result<ArtifactPaths> {
        let conv_dir = self.create_conversation_dir(conversation_id).await?;
        super::artifacts::write_comparison_artifacts(
            &conv_dir,
            conversation_id,
            turn_number,
            prompt,
            results,
        )
        .await
    }

    /// Append the audit rows for one turn: one row for a regular turn, one
    /// row per model result for a comparison turn.
    pub async fn log_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()> {
        match turn {
            Turn::Regular(t) => {
                self.append_csv(self.turns_csv(), Self::regular_row(conversation_id, t))
                    .await
            }
            Turn::Comparison(t) => {
                for result in &t.results {
                    self.append_csv(
                        self.turns_csv(),
                        Self::comparison_row(conversation_id, t, result),
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }

    fn regular_row(conversation_id: &str, t: &RegularTurn) -> String {
        csv_row(&[
            conversation_id.to_string(),
            t.turn_number.to_string(),
            t.timestamp.to_rfc3339(),
            t.model.clone(),
            t.prompt.clone(),
            t.response.clone(),
            format!("{:.2}", t.response_time),
            t.paths.jsonl_path.clone(),
            t.paths.md_path.clone(),
            t.paths.html_path.clone(),
            t.paths.docx_path.clone(),
        ])
    }

    fn comparison_row(conversation_id: &str, t: &ComparisonTurn, result: &ModelResult) -> String {
        let response = result
            .response
            .clone()
            .or_else(|| result.error.as_ref().map(|e| format!("ERROR: {}", e)))
            .unwrap_or_default();
        csv_row(&[
            conversation_id.to_string(),
            t.turn_number.to_string(),
            t.timestamp.to_rfc3339(),
            result.model.clone(),
            t.prompt.clone(),
            response,
            format!("{:.2}", result.response_time),
            t.paths.jsonl_path.clone(),
            t.paths.md_path.clone(),
            t.paths.html_path.clone(),
            t.paths.docx_path.clone(),
        ])
    }

    /// Persist an ended conversation: one ledger row plus the full summary.
    pub async fn finalize(&self, conv: &Conversation) -> Result<()> {
        let end_time = conv
            .end_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let row = csv_row(&[
            conv.id.clone(),
            conv.start_time.to_rfc3339(),
            end_time,
            format!("{:.2}", conv.duration_seconds()),
            conv.turns.len().to_string(),
            conv.models_used.iter().cloned().collect::<Vec<_>>().join(","),
            self.conversation_dir(&conv.id).to_string_lossy().to_string(),
        ]);
        self.append_csv(self.conversations_csv(), row).await?;
        self.save_summary(conv).await
    }

    /// Rewrite `conversation.json` in full.
    pub async fn save_summary(&self, conv: &Conversation) -> Result<()> {
        self.create_conversation_dir(&conv.id).await?;
        let summary = Self::build_summary(conv);
        let json = serde_json::to_string_pretty(&summary)?;
        tokio::fs::write(self.summary_path(&conv.id), json).await?;
        Ok(())
    }

    pub fn build_summary(conv: &Conversation) -> ConversationSummary {
        let turns = conv
            .turns
            .iter()
            .map(|turn| match turn {
                Turn::Regular(t) => SummaryTurn {
                    turn: t.turn_number,
                    timestamp: t.timestamp.to_rfc3339(),
                    model: Some(t.model.clone()),
                    prompt: t.prompt.clone(),
                    response: Some(t.response.clone()),
                    results: None,
                    response_time: t.response_time,
                },
                Turn::Comparison(t) => SummaryTurn {
                    turn: t.turn_number,
                    timestamp: t.timestamp.to_rfc3339(),
                    model: None,
                    prompt: t.prompt.clone(),
                    response: None,
                    results: Some(t.results.clone()),
                    response_time: t.response_time,
                },
            })
            .collect();

        ConversationSummary {
            conversation_id: conv.id.clone(),
            start_time: conv.start_time.to_rfc3339(),
            end_time: conv.end_time.map(|t| t.to_rfc3339()),
            duration_seconds: conv.end_time.map(|_| conv.duration_seconds()),
            total_turns: conv.turns.len(),
            models_used: conv.models_used.iter().cloned().collect(),
            turns,
        }
    }

    /// Read a saved conversation's summary.
    pub async fn load_summary(&self, conversation_id: &str) -> Result<ConversationSummary> {
        let path = self.summary_path(conversation_id);
        if !path.exists() {
            return Err(AppError::NotFound(format!(
                "conversation {} not found",
                conversation_id
            )));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&content)
            .map_err(|e| AppError::CorruptState(format!("{}: {}", conversation_id, e)))
    }

    /// List saved conversations, newest first. Conversations whose summary
    /// is missing or unreadable are skipped, never fatal.
    pub async fn list_saved(&self) -> Result<Vec<ConversationListing>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.conversations_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(Vec::new()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        names.reverse();

        let mut listings = Vec::new();
        for name in names {
            match self.load_summary(&name).await {
                Ok(summary) => {
                    let first_prompt = summary
                        .turns
                        .first()
                        .map(|t| t.prompt.chars().take(100).collect())
                        .unwrap_or_default();
                    listings.push(ConversationListing {
                        id: name,
                        start_time: Some(summary.start_time),
                        end_time: summary.end_time,
                        total_turns: summary.turns.len(),
                        models_used: summary.models_used,
                        first_prompt,
                    });
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable conversation {}: {}", name, e);
                }
            }
        }
        Ok(listings)
    }

    /// Rebuild an in-memory conversation from its summary. Regular turns
    /// replay their prompt/response pair into the message list in original
    /// order; comparison turns contribute turns but no messages.
    pub async fn restore(&self, conversation_id: &str) -> Result<Conversation> {
        let summary = self.load_summary(conversation_id).await?;

        let start_time = DateTime::parse_from_rfc3339(&summary.start_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        let mut conv = Conversation::with_start_time(conversation_id, start_time);
        conv.models_used = summary.models_used.iter().cloned().collect();

        for turn_data in summary.turns {
            let timestamp = DateTime::parse_from_rfc3339(&turn_data.timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(start_time);

            if let Some(results) = turn_data.results {
                conv.turns.push(Turn::Comparison(ComparisonTurn {
                    turn_number: turn_data.turn,
                    timestamp,
                    prompt: turn_data.prompt,
                    results,
                    response_time: turn_data.response_time,
                    paths: ArtifactPaths::default(),
                }));
                continue;
            }

            let response = turn_data.response.unwrap_or_default();
            conv.messages.push(crate::models::ChatMessage::user(turn_data.prompt.as_str()));
            conv.messages.push(crate::models::ChatMessage::assistant(response.as_str()));
            conv.turns.push(Turn::Regular(RegularTurn {
                turn_number: turn_data.turn,
                timestamp,
                model: turn_data.model.unwrap_or_default(),
                prompt: turn_data.prompt,
                response,
                response_time: turn_data.response_time,
                input_tokens: 0,
                output_tokens: 0,
                paths: ArtifactPaths::default(),
            }));
        }

        Ok(conv)
    }

    /// Export a saved conversation to markdown. Pure transform of the
    /// summary; the file lands inside the conversation directory.
    pub async fn export_markdown(&self, conversation_id: &str) -> Result<PathBuf> {
        let summary = self.load_summary(conversation_id).await?;

        let mut parts = vec![format!("# Conversation {}\n", conversation_id)];
        parts.push(format!("Started: {}\n", summary.start_time));
        parts.push(format!("Total turns: {}\n", summary.total_turns));
        parts.push(format!(
            "Models used: {}\n\n---\n\n",
            summary.models_used.join(", ")
        ));

        for turn in &summary.turns {
            parts.push(format!("## Turn {}\n\n", turn.turn));
            match (&turn.model, &turn.results) {
                (Some(model), _) => {
                    parts.push(format!("**Model:** {}\n\n", model));
                    parts.push(format!("**Prompt:**\n\n{}\n\n", turn.prompt));
                    parts.push(format!(
                        "**Response:**\n\n{}\n\n",
                        turn.response.as_deref().unwrap_or("")
                    ));
                }
                (None, Some(results)) => {
                    parts.push(format!("**Prompt:**\n\n{}\n\n", turn.prompt));
                    for result in results {
                        let body = result
                            .response
                            .clone()
                            .or_else(|| result.error.as_ref().map(|e| format!("Error: {}", e)))
                            .unwrap_or_default();
                        parts.push(format!("**{}:**\n\n{}\n\n", result.model, body));
                    }
                }
                (None, None) => {}
            }
            parts.push(format!(
                "*Response time: {:.2}s*\n\n---\n\n",
                turn.response_time
            ));
        }

        let md_path = self
            .conversation_dir(conversation_id)
            .join(format!("{}.md", conversation_id));
        tokio::fs::write(&md_path, parts.concat()).await?;
        Ok(md_path)
    }

    /// Export a saved conversation to docx via pandoc. A conversion failure
    /// is an `AppError::Conversion` and leaves the JSON summary untouched.
    pub async fn export_docx(&self, conversation_id: &str) -> Result<PathBuf> {
        let md_path = self.export_markdown(conversation_id).await?;
        let docx_path = self
            .conversation_dir(conversation_id)
            .join(format!("{}.docx", conversation_id));

        let output = tokio::process::Command::new("pandoc")
            .args(["-f", "markdown", "-t", "docx", "-o"])
            .arg(&docx_path)
            .arg(&md_path)
            .output()
            .await
            .map_err(|e| AppError::Conversion(format!("pandoc unavailable: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::Conversion(format!(
                "pandoc failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(docx_path)
    }

    pub fn summary_file(&self, conversation_id: &str) -> PathBuf {
        self.summary_path(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMessage;

    fn test_store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            port: 0,
            ollama_host: String::new(),
            default_model: String::new(),
            anthropic_api_key: String::new(),
            context_window_size: 0,
            data_dir: dir.path().to_path_buf(),
        };
        let store = ConversationStore::init(&config).unwrap();
        (dir, store)
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_init_writes_headers() {
        let (_dir, store) = test_store();
        let conversations = std::fs::read_to_string(store.conversations_csv()).unwrap();
        assert!(conversations.starts_with("conversation_id,start_time"));
        let turns = std::fs::read_to_string(store.turns_csv()).unwrap();
        assert!(turns.trim_end().ends_with("docx_path"));
    }

    #[tokio::test]
    async fn test_finalize_and_restore_round_trip() {
        let (_dir, store) = test_store();

        let mut conv = Conversation::new("conv_rt");
        conv.add_turn("m1", "p1", "r1", 0.5, ArtifactPaths::default(), 0, 0);
        conv.add_turn("m2", "p2", "r2", 0.7, ArtifactPaths::default(), 0, 0);
        conv.end();
        store.finalize(&conv).await.unwrap();

        let restored = store.restore("conv_rt").await.unwrap();
        assert_eq!(
            restored.messages,
            vec![
                ChatMessage::user("p1"),
                ChatMessage::assistant("r1"),
                ChatMessage::user("p2"),
                ChatMessage::assistant("r2"),
            ]
        );
        assert_eq!(restored.turns.len(), 2);
        assert!(restored.models_used.contains("m1"));
        assert_eq!(restored.start_time.timestamp(), conv.start_time.timestamp());
    }

    #[tokio::test]
    async fn test_restore_skips_comparison_messages() {
        let (_dir, store) = test_store();

        let mut conv = Conversation::new("conv_cmp");
        conv.add_turn("m1", "p1", "r1", 0.5, ArtifactPaths::default(), 0, 0);
        conv.add_comparison_turn(
            "which is best?",
            vec![
                ModelResult::ok("a", "ra", 0.2),
                ModelResult::failed("b", "down", 0.1),
            ],
            0.2,
            ArtifactPaths::default(),
        );
        conv.end();
        store.finalize(&conv).await.unwrap();

        let restored = store.restore("conv_cmp").await.unwrap();
        assert_eq!(restored.messages.len(), 2);
        assert_eq!(restored.turns.len(), 2);
        match &restored.turns[1] {
            Turn::Comparison(t) => {
                assert_eq!(t.results.len(), 2);
                assert_eq!(t.results[1].error.as_deref(), Some("down"));
            }
            Turn::Regular(_) => panic!("expected comparison turn"),
        }
    }

    #[tokio::test]
    async fn test_listing_skips_corrupt_summaries() {
        let (_dir, store) = test_store();

        let mut good = Conversation::new("conv_good");
        good.add_turn("m", "hello there", "hi", 0.1, ArtifactPaths::default(), 0, 0);
        good.end();
        store.finalize(&good).await.unwrap();

        let bad_dir = store.conversation_dir("conv_bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("conversation.json"), "{not json").unwrap();

        let listings = store.list_saved().await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].id, "conv_good");
        assert_eq!(listings[0].first_prompt, "hello there");
    }

    #[tokio::test]
    async fn test_turn_csv_rows_per_model() {
        let (_dir, store) = test_store();

        let mut conv = Conversation::new("conv_csv");
        conv.add_comparison_turn(
            "prompt",
            vec![
                ModelResult::ok("a", "ra", 0.2),
                ModelResult::failed("b", "down", 0.1),
                ModelResult::ok("c", "rc", 0.3),
            ],
            0.3,
            ArtifactPaths::default(),
        );
        store
            .log_turn("conv_csv", conv.turns.last().unwrap())
            .await
            .unwrap();

        let content = std::fs::read_to_string(store.turns_csv()).unwrap();
        let rows: Vec<&str> = content.lines().skip(1).collect();
        assert_eq!(rows.len(), 3);
        assert!(rows[1].contains("ERROR: down"));
    }

    #[tokio::test]
    async fn test_export_markdown() {
        let (_dir, store) = test_store();

        let mut conv = Conversation::new("conv_md");
        conv.add_turn("m1", "p1", "r1", 0.5, ArtifactPaths::default(), 0, 0);
        conv.end();
        store.finalize(&conv).await.unwrap();

        let path = store.export_markdown("conv_md").await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("# Conversation conv_md"));
        assert!(content.contains("**Model:** m1"));
    }
}
