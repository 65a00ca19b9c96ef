use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::gateway::ModelClient;
use crate::models::{ChatMessage, ConversationInfo, ModelResult, TokenStats};

/// Typed events emitted on the comparison stream, serialized as SSE
/// `data:` frames. `Result` events arrive in completion order with a
/// running counter; the final `Complete` aggregate is in request order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompareEvent {
    Init {
        models: Vec<String>,
    },
    Result {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        response_time: f64,
        completed: usize,
        total: usize,
    },
    Complete {
        results: Vec<ModelResult>,
        conversation_info: ConversationInfo,
        token_stats: TokenStats,
    },
}

impl CompareEvent {
    pub fn from_result(result: &ModelResult, completed: usize, total: usize) -> Self {
        CompareEvent::Result {
            model: result.model.clone(),
            response: result.response.clone(),
            error: result.error.clone(),
            response_time: result.response_time,
            completed,
            total,
        }
    }

    /// Serialize to one SSE frame.
    pub fn to_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("Failed to serialize compare event: {}", e);
            "{}".to_string()
        });
        format!("data: {}\n\n", json)
    }
}

async fn call_model(
    gateway: Arc<dyn ModelClient>,
    model: String,
    messages: Arc<Vec<ChatMessage>>,
) -> ModelResult {
    let start = Instant::now();
    match gateway.generate(&model, &messages).await {
        Ok(response) => ModelResult::ok(model, response, start.elapsed().as_secs_f64()),
        Err(e) => ModelResult::failed(model, e.to_string(), start.elapsed().as_secs_f64()),
    }
}

/// Fan one prompt out to all models concurrently and wait for every result.
/// The returned vector preserves the caller's model order regardless of
/// completion order; a failing model only affects its own slot.
pub async fn run_blocking(
    gateway: Arc<dyn ModelClient>,
    models: &[String],
    messages: Vec<ChatMessage>,
) -> Vec<ModelResult> {
    let messages = Arc::new(messages);
    let tasks: Vec<_> = models
        .iter()
        .cloned()
        .enumerate()
        .map(|(slot, model)| {
            let gateway = gateway.clone();
            let messages = messages.clone();
            tokio::spawn(async move { (slot, call_model(gateway, model, messages).await) })
        })
        .collect();

    let mut slots: Vec<Option<ModelResult>> = models.iter().map(|_| None).collect();
    for joined in join_all(tasks).await {
        match joined {
            Ok((slot, result)) => slots[slot] = Some(result),
            Err(e) => tracing::error!("Comparison task panicked: {}", e),
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(slot, result)| {
            result.unwrap_or_else(|| ModelResult::failed(models[slot].clone(), "task failed", 0.0))
        })
        .collect()
}

/// Start one task per model and return a channel delivering `(slot,
/// result)` pairs in completion order. The channel closes once every task
/// has reported; no cancellation, dispatched calls run to completion or
/// their own timeout.
pub fn spawn_fan_out(
    gateway: Arc<dyn ModelClient>,
    models: &[String],
    messages: Vec<ChatMessage>,
) -> mpsc::Receiver<(usize, ModelResult)> {
    let (tx, rx) = mpsc::channel(models.len().max(1));
    let messages = Arc::new(messages);

    for (slot, model) in models.iter().cloned().enumerate() {
        let tx = tx.clone();
        let gateway = gateway.clone();
        let messages = messages.clone();
        tokio::spawn(async move {
            let result = call_model(gateway, model, messages).await;
            // Receiver dropped = client went away; result is still in the
            // aggregate the driver persists, so ignore send failures here
            let _ = tx.send((slot, result)).await;
        });
    }

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FakeGateway {
        /// model -> (delay, outcome)
        behavior: HashMap<String, (u64, std::result::Result<String, String>)>,
    }

    impl FakeGateway {
        fn new(entries: &[(&str, u64, std::result::Result<&str, &str>)]) -> Arc<Self> {
            let behavior = entries
                .iter()
                .map(|(model, delay, outcome)| {
                    let outcome = match outcome {
                        Ok(s) => Ok(s.to_string()),
                        Err(s) => Err(s.to_string()),
                    };
                    (model.to_string(), (*delay, outcome))
                })
                .collect();
            Arc::new(Self { behavior })
        }
    }

    #[async_trait]
    impl ModelClient for FakeGateway {
        async fn generate(&self, model: &str, _messages: &[ChatMessage]) -> Result<String> {
            let (delay, outcome) = self
                .behavior
                .get(model)
                .cloned()
                .unwrap_or((0, Err("unknown model".to_string())));
            tokio::time::sleep(Duration::from_millis(delay)).await;
            outcome.map_err(AppError::Backend)
        }
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_blocking_preserves_request_order() {
        // C finishes first, A last; B fails
        let gateway = FakeGateway::new(&[
            ("A", 60, Ok("answer a")),
            ("B", 10, Err("backend down")),
            ("C", 1, Ok("answer c")),
        ]);

        let results = run_blocking(gateway, &models(&["A", "B", "C"]), vec![]).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].model, "A");
        assert_eq!(results[0].response.as_deref(), Some("answer a"));
        assert_eq!(results[1].model, "B");
        assert!(results[1].response.is_none());
        assert!(results[1].error.as_deref().unwrap().contains("backend down"));
        assert_eq!(results[2].model, "C");
        assert_eq!(results[2].response.as_deref(), Some("answer c"));
    }

    #[tokio::test]
    async fn test_fan_out_delivers_in_completion_order() {
        let gateway = FakeGateway::new(&[
            ("slow", 80, Ok("slow answer")),
            ("fast", 1, Ok("fast answer")),
        ]);

        let mut rx = spawn_fan_out(gateway, &models(&["slow", "fast"]), vec![]);

        let (first_slot, first) = rx.recv().await.unwrap();
        assert_eq!(first_slot, 1);
        assert_eq!(first.model, "fast");

        let (second_slot, second) = rx.recv().await.unwrap();
        assert_eq!(second_slot, 0);
        assert_eq!(second.model, "slow");

        // All tasks reported, channel closes
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let gateway = FakeGateway::new(&[
            ("ok", 30, Ok("fine")),
            ("bad", 1, Err("boom")),
        ]);

        let mut rx = spawn_fan_out(gateway, &models(&["ok", "bad"]), vec![]);

        let (_, first) = rx.recv().await.unwrap();
        assert_eq!(first.model, "bad");
        assert!(!first.is_ok());

        let (_, second) = rx.recv().await.unwrap();
        assert_eq!(second.model, "ok");
        assert_eq!(second.response.as_deref(), Some("fine"));
    }

    #[test]
    fn test_event_frames() {
        let init = CompareEvent::Init {
            models: vec!["a".into(), "b".into()],
        };
        let frame = init.to_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"init\""));

        let result = CompareEvent::from_result(&ModelResult::failed("b", "down", 0.1), 1, 2);
        let frame = result.to_frame();
        assert!(frame.contains("\"error\":\"down\""));
        assert!(frame.contains("\"completed\":1"));
        assert!(!frame.contains("\"response\":"));
    }
}
