use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::AppState;
use crate::compare::{self, CompareEvent};
use crate::error::{AppError, Result};
use crate::gateway::ModelClient;
use crate::models::{ChatMessage, Conversation, ModelResult};

#[derive(Debug, Deserialize)]
pub struct NewConversationRequest {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    conversation_id: Option<String>,
    model: Option<String>,
    #[serde(default)]
    prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    conversation_id: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    prompt: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationIdRequest {
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    conversation_id: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    fmt: Option<String>,
}

fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::MissingInput(format!("{} required", name))),
    }
}

pub async fn new_conversation(
    State(state): State<AppState>,
    Json(req): Json<NewConversationRequest>,
) -> Result<Json<serde_json::Value>> {
    let session_id = require(&req.session_id, "session_id")?;

    let conv = Conversation::new(Conversation::generate_id());
    state.store.create_conversation_dir(&conv.id).await?;
    let start_time = conv.start_time.to_rfc3339();
    let conversation_id = conv.id.clone();
    state.registry.insert(session_id, conv);

    tracing::info!("New conversation {} for session {}", conversation_id, session_id);
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "start_time": start_time,
    })))
}

/// Context actually sent to the model: the windowed history plus the new
/// user prompt, with any uploaded file text prepended to the prompt.
fn build_call_messages(
    conv: &Conversation,
    window_size: usize,
    prompt: &str,
) -> Vec<ChatMessage> {
    let files_context = conv.files_context();
    let full_prompt = if files_context.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n{}", files_context, prompt)
    };

    let mut messages = conv.windowed_messages(window_size).to_vec();
    messages.push(ChatMessage::user(full_prompt));
    messages
}

pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<serde_json::Value>> {
    let conversation_id = require(&req.conversation_id, "conversation_id")?;
    let model = require(&req.model, "model")?;
    if req.prompt.is_empty() {
        return Err(AppError::MissingInput("missing prompt".to_string()));
    }

    let shared = state
        .registry
        .find_by_conversation_id(conversation_id)
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;

    // Held across the model call: concurrent requests against the same
    // conversation are serialized here.
    let mut conv = shared.lock().await;

    let messages = build_call_messages(&conv, state.config.context_window_size, &req.prompt);
    let start = Instant::now();
    let response = state.gateway.generate(model, &messages).await?;
    let response_time = start.elapsed().as_secs_f64();

    let turn_number = conv.next_turn_number();
    let paths = state
        .store
        .write_turn_artifacts(&conv.id, turn_number, model, &req.prompt, &response)
        .await?;

    // Store the original prompt, without the file context framing
    conv.add_turn(model, &req.prompt, &response, response_time, paths.clone(), 0, 0);
    if let Some(turn) = conv.turns.last() {
        state.store.log_turn(&conv.id, turn).await?;
    }

    Ok(Json(json!({
        "conversation_id": conv.id,
        "turn_number": turn_number,
        "model": model,
        "response": response,
        "response_time": response_time,
        "paths": paths,
        "conversation_info": conv.info(),
        "token_stats": conv.token_stats(),
    })))
}

fn validate_compare(req: &CompareRequest) -> Result<()> {
    if req.prompt.is_empty() {
        return Err(AppError::MissingInput("missing prompt".to_string()));
    }
    if req.models.len() < 2 {
        return Err(AppError::MissingInput(
            "at least two models required for comparison".to_string(),
        ));
    }
    Ok(())
}

pub async fn compare(
    State(state): State<AppState>,
    Json(req): Json<CompareRequest>,
) -> Result<Json<serde_json::Value>> {
    let conversation_id = require(&req.conversation_id, "conversation_id")?;
    validate_compare(&req)?;

    let shared = state
        .registry
        .find_by_conversation_id(conversation_id)
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;
    let mut conv = shared.lock().await;

    let messages = build_call_messages(&conv, state.config.context_window_size, &req.prompt);
    let gateway: Arc<dyn ModelClient> = state.gateway.clone();

    let start = Instant::now();
    let results = compare::run_blocking(gateway, &req.models, messages).await;
    let elapsed = start.elapsed().as_secs_f64();

    let turn_number = conv.next_turn_number();
    let paths = state
        .store
        .write_comparison_artifacts(&conv.id, turn_number, &req.prompt, &results)
        .await?;
    conv.add_comparison_turn(&req.prompt, results.clone(), elapsed, paths);
    if let Some(turn) = conv.turns.last() {
        state.store.log_turn(&conv.id, turn).await?;
    }

    Ok(Json(json!({
        "conversation_id": conv.id,
        "turn_number": turn_number,
        "results": results,
        "response_time": elapsed,
        "conversation_info": conv.info(),
        "token_stats": conv.token_stats(),
    })))
}

pub async fn compare_stream(
    State(state): State<AppState>,
    Json(req): Json<CompareRequest>,
) -> Result<Response> {
    let conversation_id = require(&req.conversation_id, "conversation_id")?.to_string();
    validate_compare(&req)?;

    let shared = state
        .registry
        .find_by_conversation_id(&conversation_id)
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;

    let (frame_tx, frame_rx) = mpsc::channel::<String>(16);
    let models = req.models.clone();
    let prompt = req.prompt.clone();
    let window_size = state.config.context_window_size;
    let store = state.store.clone();
    let gateway: Arc<dyn ModelClient> = state.gateway.clone();

    // Driver task: holds the conversation lock for the whole comparison so
    // the final persistence happens exactly once, after all workers join.
    // A dropped client stops delivery but never the workers or the turn log.
    tokio::spawn(async move {
        let mut conv = shared.lock_owned().await;
        let total = models.len();

        let _ = frame_tx
            .send(CompareEvent::Init { models: models.clone() }.to_frame())
            .await;

        let messages = build_call_messages(&conv, window_size, &prompt);
        let start = Instant::now();
        let mut rx = compare::spawn_fan_out(gateway, &models, messages);

        let mut slots: Vec<Option<ModelResult>> = models.iter().map(|_| None).collect();
        let mut completed = 0usize;
        while let Some((slot, result)) = rx.recv().await {
            completed += 1;
            let _ = frame_tx
                .send(CompareEvent::from_result(&result, completed, total).to_frame())
                .await;
            slots[slot] = Some(result);
        }
        let elapsed = start.elapsed().as_secs_f64();

        let results: Vec<ModelResult> = slots
            .into_iter()
            .enumerate()
            .map(|(slot, result)| {
                result.unwrap_or_else(|| {
                    ModelResult::failed(models[slot].clone(), "task failed", 0.0)
                })
            })
            .collect();

        let turn_number = conv.next_turn_number();
        let paths = match store
            .write_comparison_artifacts(&conv.id, turn_number, &prompt, &results)
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                tracing::error!("Failed to write comparison artifacts: {}", e);
                Default::default()
            }
        };
        conv.add_comparison_turn(&prompt, results.clone(), elapsed, paths);
        if let Some(turn) = conv.turns.last() {
            if let Err(e) = store.log_turn(&conv.id, turn).await {
                tracing::error!("Failed to log comparison turn: {}", e);
            }
        }

        let _ = frame_tx
            .send(
                CompareEvent::Complete {
                    results,
                    conversation_info: conv.info(),
                    token_stats: conv.token_stats(),
                }
                .to_frame(),
            )
            .await;
    });

    let stream = futures::stream::unfold(frame_rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, std::io::Error>(Bytes::from(frame)), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Backend(format!("failed to build stream response: {}", e)))
}

pub async fn clear_context(
    State(state): State<AppState>,
    Json(req): Json<ConversationIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let conversation_id = require(&req.conversation_id, "conversation_id")?;

    let shared = state
        .registry
        .find_by_conversation_id(conversation_id)
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;
    let mut conv = shared.lock().await;
    conv.clear_context();

    Ok(Json(json!({
        "conversation_id": conv.id,
        "message": "Context cleared successfully",
        "total_turns_logged": conv.turns.len(),
        "token_stats": conv.token_stats(),
    })))
}

pub async fn end_conversation(
    State(state): State<AppState>,
    Json(req): Json<ConversationIdRequest>,
) -> Result<Json<serde_json::Value>> {
    let conversation_id = require(&req.conversation_id, "conversation_id")?;

    let shared = state
        .registry
        .remove_by_conversation_id(conversation_id)
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;
    let mut conv = shared.lock().await;

    let duration_seconds = conv.end();
    state.store.finalize(&conv).await?;

    tracing::info!(
        "Conversation {} ended: {} turns in {:.2}s",
        conv.id,
        conv.turns.len(),
        duration_seconds
    );
    Ok(Json(json!({
        "conversation_id": conv.id,
        "total_turns": conv.turns.len(),
        "duration_seconds": duration_seconds,
        "conversation_dir": state.store.conversation_dir(&conv.id).to_string_lossy(),
    })))
}

pub async fn restore_conversation(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<serde_json::Value>> {
    let conversation_id = require(&req.conversation_id, "conversation_id")?;
    let session_id = require(&req.session_id, "session_id")?;

    let conv = state.store.restore(conversation_id).await?;
    let total_turns = conv.turns.len();
    state.registry.insert(session_id, conv);

    tracing::info!(
        "Conversation {} restored into session {} ({} turns)",
        conversation_id,
        session_id,
        total_turns
    );
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "message": "Conversation restored successfully",
        "total_turns": total_turns,
    })))
}

pub async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let conversations = state.store.list_saved().await?;
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn load_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let summary = state.store.load_summary(&conversation_id).await?;
    Ok(Json(serde_json::to_value(summary)?))
}

fn attachment(filename: &str, content_type: &str, body: Vec<u8>) -> Result<Response> {
    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from(body))
        .map_err(|e| AppError::Conversion(format!("failed to build download: {}", e)))
}

pub async fn export_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response> {
    let fmt = query.fmt.as_deref().unwrap_or("json").to_lowercase();

    match fmt.as_str() {
        "json" => {
            // The summary file is returned as-is; parse first so a missing
            // or corrupt conversation reports properly
            state.store.load_summary(&conversation_id).await?;
            let body = tokio::fs::read(state.store.summary_file(&conversation_id)).await?;
            attachment(
                &format!("{}.json", conversation_id),
                "application/json",
                body,
            )
        }
        "md" => {
            let path = state.store.export_markdown(&conversation_id).await?;
            let body = tokio::fs::read(path).await?;
            attachment(&format!("{}.md", conversation_id), "text/markdown", body)
        }
        "docx" => {
            let path = state.store.export_docx(&conversation_id).await?;
            let body = tokio::fs::read(path).await?;
            attachment(
                &format!("{}.docx", conversation_id),
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                body,
            )
        }
        _ => Err(AppError::MissingInput(
            "unsupported format; use json, md, or docx".to_string(),
        )),
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models = state.gateway.list_models().await;
    Json(json!({ "models": models }))
}

pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let mut filename: Option<String> = None;
    let mut content: Option<Bytes> = None;
    let mut conversation_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::MissingInput(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(|s| s.to_string());
                content = Some(field.bytes().await.map_err(|e| {
                    AppError::MissingInput(format!("failed to read file field: {}", e))
                })?);
            }
            Some("conversation_id") => {
                conversation_id = Some(field.text().await.map_err(|e| {
                    AppError::MissingInput(format!("failed to read conversation_id: {}", e))
                })?);
            }
            _ => {}
        }
    }

    let filename =
        filename.ok_or_else(|| AppError::MissingInput("no file provided".to_string()))?;
    let content =
        content.ok_or_else(|| AppError::MissingInput("no file provided".to_string()))?;
    let conversation_id = require(&conversation_id, "conversation_id")?;

    let shared = state
        .registry
        .find_by_conversation_id(conversation_id)
        .ok_or_else(|| AppError::NotFound("conversation not found".to_string()))?;

    let text = extract_text(&filename, &content)?;
    let size = content.len();

    let mut conv = shared.lock().await;
    conv.add_file(&filename, &text);
    tracing::info!(
        "File {} ({} bytes) added to conversation {}",
        filename,
        size,
        conv.id
    );

    Ok(Json(json!({
        "filename": filename,
        "size": size,
        "success": true,
    })))
}

/// Extract plain text from an uploaded file. Notebooks are flattened to a
/// markdown transcript; everything else is treated as UTF-8 text. Binary
/// document parsing (pdf/docx) is delegated to external tooling and not
/// supported here.
fn extract_text(filename: &str, content: &[u8]) -> Result<String> {
    let lower = filename.to_lowercase();

    if lower.ends_with(".pdf") || lower.ends_with(".docx") {
        return Err(AppError::Conversion(format!(
            "binary document extraction not supported for {}",
            filename
        )));
    }

    if lower.ends_with(".ipynb") {
        let notebook: serde_json::Value = serde_json::from_slice(content)
            .map_err(|_| AppError::Conversion("invalid Jupyter notebook format".to_string()))?;
        let text = notebook_to_text(filename, &notebook);
        if text.trim().is_empty() {
            return Err(AppError::Conversion("notebook appears to be empty".to_string()));
        }
        return Ok(text);
    }

    Ok(String::from_utf8_lossy(content).to_string())
}

/// Flatten a notebook's cells (and text outputs) into readable markdown.
fn notebook_to_text(filename: &str, notebook: &serde_json::Value) -> String {
    fn join_source(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Array(lines) => lines
                .iter()
                .filter_map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join(""),
            serde_json::Value::String(s) => s.clone(),
            _ => String::new(),
        }
    }

    let mut text = format!("# Jupyter Notebook: {}\n\n", filename);
    let cells = notebook
        .get("cells")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    for (i, cell) in cells.iter().enumerate() {
        let cell_type = cell.get("cell_type").and_then(|t| t.as_str()).unwrap_or("unknown");
        let source = cell.get("source").map(join_source).unwrap_or_default();

        match cell_type {
            "markdown" => {
                text.push_str(&format!("\n## Markdown Cell {}\n{}\n", i + 1, source));
            }
            "code" => {
                text.push_str(&format!("\n## Code Cell {}\n```python\n{}\n```\n", i + 1, source));
                let outputs = cell.get("outputs").and_then(|o| o.as_array());
                if let Some(outputs) = outputs.filter(|o| !o.is_empty()) {
                    text.push_str("\n### Output:\n");
                    for output in outputs {
                        let out_text = output
                            .get("text")
                            .map(join_source)
                            .filter(|t| !t.is_empty())
                            .or_else(|| {
                                output
                                    .get("data")
                                    .and_then(|d| d.get("text/plain"))
                                    .map(join_source)
                            });
                        if let Some(out_text) = out_text {
                            text.push_str(&format!("```\n{}\n```\n", out_text));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    text
}
