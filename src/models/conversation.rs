use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::turn::{ArtifactPaths, ComparisonTurn, ModelResult, RegularTurn, Turn, UploadedFile};

/// One role/content pair in the LLM context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Cumulative token accounting for a conversation. Totals never decrease;
/// clearing context changes future cost, not historical counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenStats {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
}

/// Lightweight conversation metadata returned alongside turn responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub total_turns: usize,
    pub duration: f64,
    pub models_used: Vec<String>,
}

/// Rough token estimate when the backend reports no usage: ~4 characters
/// per token. Display fidelity only, not a billing oracle.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

/// An active conversation: the turn log, the flat message list used as LLM
/// context, uploaded file context, and token counters.
///
/// `messages` holds an even number of entries (user/assistant pairs) except
/// transiently inside `add_turn`. Comparison turns never touch it.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub turns: Vec<Turn>,
    pub messages: Vec<ChatMessage>,
    pub models_used: BTreeSet<String>,
    pub files: Vec<UploadedFile>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_start_time(id, Utc::now())
    }

    pub fn with_start_time(id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            start_time,
            end_time: None,
            turns: Vec::new(),
            messages: Vec::new(),
            models_used: BTreeSet::new(),
            files: Vec::new(),
            total_input_tokens: 0,
            total_output_tokens: 0,
        }
    }

    /// Generate a fresh conversation id: `conv_<timestamp>_<uuid8>`.
    pub fn generate_id() -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let uuid = uuid::Uuid::new_v4().to_string();
        format!("conv_{}_{}", stamp, &uuid[..8])
    }

    /// 1-based number the next turn will receive.
    pub fn next_turn_number(&self) -> usize {
        self.turns.len() + 1
    }

    /// Append a regular turn and its user/assistant message pair. Token
    /// counts of zero fall back to the character estimate.
    pub fn add_turn(
        &mut self,
        model: &str,
        prompt: &str,
        response: &str,
        response_time: f64,
        paths: ArtifactPaths,
        input_tokens: u64,
        output_tokens: u64,
    ) -> usize {
        let turn_number = self.next_turn_number();

        let input_tokens = if input_tokens == 0 {
            estimate_tokens(prompt)
        } else {
            input_tokens
        };
        let output_tokens = if output_tokens == 0 {
            estimate_tokens(response)
        } else {
            output_tokens
        };
        self.total_input_tokens += input_tokens;
        self.total_output_tokens += output_tokens;

        self.turns.push(Turn::Regular(RegularTurn {
            turn_number,
            timestamp: Utc::now(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            response_time,
            input_tokens,
            output_tokens,
            paths,
        }));
        self.models_used.insert(model.to_string());

        self.messages.push(ChatMessage::user(prompt));
        self.messages.push(ChatMessage::assistant(response));

        turn_number
    }

    /// Append a comparison turn. Results represent parallel alternatives,
    /// not a settled exchange, so the message list stays untouched.
    pub fn add_comparison_turn(
        &mut self,
        prompt: &str,
        results: Vec<ModelResult>,
        response_time: f64,
        paths: ArtifactPaths,
    ) -> usize {
        let turn_number = self.next_turn_number();

        for result in &results {
            self.models_used.insert(result.model.clone());
            self.total_input_tokens += estimate_tokens(prompt);
            if let Some(response) = &result.response {
                self.total_output_tokens += estimate_tokens(response);
            }
        }

        self.turns.push(Turn::Comparison(ComparisonTurn {
            turn_number,
            timestamp: Utc::now(),
            prompt: prompt.to_string(),
            results,
            response_time,
            paths,
        }));

        turn_number
    }

    pub fn add_file(&mut self, filename: &str, content: &str) {
        self.files.push(UploadedFile::new(filename, content));
    }

    /// All uploaded files formatted for prepending to a prompt.
    pub fn files_context(&self) -> String {
        if self.files.is_empty() {
            return String::new();
        }
        self.files
            .iter()
            .map(|f| {
                format!(
                    "\n--- File: {} ---\n{}\n--- End of file ---\n",
                    f.filename, f.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The trailing slice of `messages` sent to the model: the last
    /// `2 * window_size` entries, or everything when `window_size` is 0.
    pub fn windowed_messages(&self, window_size: usize) -> &[ChatMessage] {
        if window_size == 0 {
            return &self.messages;
        }
        let max_messages = window_size * 2;
        if self.messages.len() <= max_messages {
            return &self.messages;
        }
        &self.messages[self.messages.len() - max_messages..]
    }

    /// Drop the LLM context while keeping the turn log and token totals.
    pub fn clear_context(&mut self) {
        self.messages.clear();
    }

    pub fn token_stats(&self) -> TokenStats {
        TokenStats {
            total_input_tokens: self.total_input_tokens,
            total_output_tokens: self.total_output_tokens,
            total_tokens: self.total_input_tokens + self.total_output_tokens,
        }
    }

    /// Seconds from start until end (for ended conversations) or now.
    pub fn duration_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).num_milliseconds() as f64 / 1000.0
    }

    pub fn info(&self) -> ConversationInfo {
        ConversationInfo {
            total_turns: self.turns.len(),
            duration: self.duration_seconds(),
            models_used: self.models_used.iter().cloned().collect(),
        }
    }

    /// Mark the conversation ended. Terminal: callers must persist the
    /// summary and drop it from the active registry afterwards.
    pub fn end(&mut self) -> f64 {
        self.end_time = Some(Utc::now());
        self.duration_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(conv: &mut Conversation, n: usize) {
        conv.add_turn(
            "llama3",
            &format!("prompt {}", n),
            &format!("response {}", n),
            0.5,
            ArtifactPaths::default(),
            0,
            0,
        );
    }

    #[test]
    fn test_messages_stay_paired() {
        let mut conv = Conversation::new("conv_test");
        for n in 1..=3 {
            turn(&mut conv, n);
            assert_eq!(conv.messages.len() % 2, 0);
        }
        assert_eq!(conv.messages.len(), 6);
        assert_eq!(conv.messages[0], ChatMessage::user("prompt 1"));
        assert_eq!(conv.messages[1], ChatMessage::assistant("response 1"));
    }

    #[test]
    fn test_comparison_turn_leaves_messages_untouched() {
        let mut conv = Conversation::new("conv_test");
        turn(&mut conv, 1);
        let before = conv.messages.len();

        conv.add_comparison_turn(
            "compare this",
            vec![
                ModelResult::ok("a", "ra", 0.2),
                ModelResult::failed("b", "down", 0.1),
            ],
            0.2,
            ArtifactPaths::default(),
        );

        assert_eq!(conv.messages.len(), before);
        assert_eq!(conv.turns.len(), 2);
        assert!(conv.models_used.contains("a") && conv.models_used.contains("b"));
    }

    #[test]
    fn test_turn_numbers_sequential() {
        let mut conv = Conversation::new("conv_test");
        turn(&mut conv, 1);
        conv.add_comparison_turn("p", vec![ModelResult::ok("a", "r", 0.1)], 0.1, ArtifactPaths::default());
        turn(&mut conv, 3);

        let numbers: Vec<usize> = conv.turns.iter().map(|t| t.turn_number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_clear_context_preserves_log_and_totals() {
        let mut conv = Conversation::new("conv_test");
        turn(&mut conv, 1);
        turn(&mut conv, 2);
        let stats_before = conv.token_stats();

        conv.clear_context();

        assert!(conv.messages.is_empty());
        assert_eq!(conv.turns.len(), 2);
        assert_eq!(conv.token_stats().total_tokens, stats_before.total_tokens);
    }

    #[test]
    fn test_window_unlimited_and_bounded() {
        let mut conv = Conversation::new("conv_test");
        for n in 1..=5 {
            turn(&mut conv, n);
        }

        assert_eq!(conv.windowed_messages(0).len(), 10);
        let windowed = conv.windowed_messages(2);
        assert_eq!(windowed.len(), 4);
        assert_eq!(windowed[0], ChatMessage::user("prompt 4"));
        // Idempotent: same state, same slice
        assert_eq!(conv.windowed_messages(2), windowed);
        // Shorter than the window: full list
        assert_eq!(conv.windowed_messages(100).len(), 10);
    }

    #[test]
    fn test_token_estimation_fallback() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);

        let mut conv = Conversation::new("conv_test");
        conv.add_turn("m", "aaaa", "bbbbbbbb", 0.1, ArtifactPaths::default(), 0, 0);
        assert_eq!(conv.total_input_tokens, 1);
        assert_eq!(conv.total_output_tokens, 2);

        // Exact counts win when provided
        conv.add_turn("m", "aaaa", "bbbb", 0.1, ArtifactPaths::default(), 100, 50);
        assert_eq!(conv.total_input_tokens, 101);
        assert_eq!(conv.total_output_tokens, 52);
    }

    #[test]
    fn test_files_context_framing() {
        let mut conv = Conversation::new("conv_test");
        assert_eq!(conv.files_context(), "");

        conv.add_file("notes.txt", "hello");
        let ctx = conv.files_context();
        assert!(ctx.contains("--- File: notes.txt ---"));
        assert!(ctx.contains("hello"));
        assert!(ctx.contains("--- End of file ---"));
    }

    #[test]
    fn test_end_is_consistent_with_info() {
        let mut conv = Conversation::new("conv_test");
        turn(&mut conv, 1);
        let info = conv.info();

        let duration = conv.end();
        assert!(conv.end_time.is_some());
        assert_eq!(conv.turns.len(), info.total_turns);
        assert!(duration >= info.duration);
    }
}
