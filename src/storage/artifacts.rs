use chrono::Utc;
use pulldown_cmark::{html, Parser};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::Result;
use crate::models::{ArtifactPaths, ModelResult};

const SLUG_MAX_LEN: usize = 40;

/// Filesystem-safe slug of a prompt's first line, used in turn directory
/// names for human browsability.
pub fn slugify(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or("");
    let dashed = regex::Regex::new(r"\s+")
        .expect("static regex")
        .replace_all(first_line.trim(), "-")
        .to_string();
    let clean: String = dashed
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(SLUG_MAX_LEN)
        .collect();
    if clean.is_empty() {
        "prompt".to_string()
    } else {
        clean
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn render_markdown(md: &str) -> String {
    let mut out = String::new();
    html::push_html(&mut out, Parser::new(md));
    out
}

fn html_document(turn_number: usize, prompt: &str, body_html: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8" />
<title>Turn {turn}</title>
<style>body{{font-family:-apple-system,BlinkMacSystemFont,Segoe UI,Roboto,sans-serif;max-width:900px;margin:2rem auto;padding:0 1rem;line-height:1.6}}pre,code{{background:#f5f5f5;padding:.2rem .4rem;border-radius:4px}}pre{{overflow-x:auto;padding:1rem}}h1,h2,h3{{line-height:1.25}}</style>
</head>
<body>
<h1>Turn {turn}</h1>
<h2>Prompt</h2>
<pre>{prompt}</pre>
<hr/>
<h2>Response</h2>
{body}
</body>
</html>"#,
        turn = turn_number,
        prompt = escape_html(prompt),
        body = body_html,
    )
}

/// Convert markdown to docx through a pandoc subprocess. Conversion is
/// best-effort: a missing binary or failed run yields `None`.
async fn write_docx(markdown: &str, out_path: &Path) -> Option<String> {
    let mut child = match Command::new("pandoc")
        .args(["-f", "markdown", "-t", "docx", "-o"])
        .arg(out_path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!("pandoc unavailable, skipping docx: {}", e);
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(markdown.as_bytes()).await {
            tracing::warn!("Failed to feed pandoc: {}", e);
            return None;
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => Some(out_path.to_string_lossy().to_string()),
        Ok(status) => {
            tracing::warn!("pandoc exited with {}", status);
            None
        }
        Err(e) => {
            tracing::warn!("pandoc failed: {}", e);
            None
        }
    }
}

/// Markdown body shared between a comparison turn's artifacts: one section
/// per model in the caller's requested order.
fn comparison_markdown(results: &[ModelResult]) -> String {
    results
        .iter()
        .map(|r| {
            let body = match (&r.response, &r.error) {
                (Some(response), _) => response.clone(),
                (None, Some(error)) => format!("**Error:** {}", error),
                (None, None) => String::new(),
            };
            format!(
                "## {} ({:.2}s)\n\n{}\n",
                r.model, r.response_time, body
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n\n")
}

async fn make_turn_dir(conv_dir: &Path, turn_number: usize, prompt: &str) -> Result<PathBuf> {
    let turn_dir = conv_dir.join(format!("turn_{:03}_{}", turn_number, slugify(prompt)));
    tokio::fs::create_dir_all(&turn_dir).await?;
    Ok(turn_dir)
}

async fn write_common_artifacts(
    turn_dir: &Path,
    turn_number: usize,
    prompt: &str,
    response_md: &str,
    jsonl_record: &serde_json::Value,
) -> Result<ArtifactPaths> {
    let jsonl_path = turn_dir.join("turn.jsonl");
    let mut line = serde_json::to_string(jsonl_record)?;
    line.push('\n');
    tokio::fs::write(&jsonl_path, line).await?;

    let md_path = turn_dir.join("turn.md");
    let markdown = format!(
        "# Turn {}\n\n## Prompt\n\n{}\n\n---\n\n## Response\n\n{}\n",
        turn_number, prompt, response_md
    );
    tokio::fs::write(&md_path, &markdown).await?;

    let html_path = turn_dir.join("turn.html");
    let document = html_document(turn_number, prompt, &render_markdown(response_md));
    tokio::fs::write(&html_path, document).await?;

    let docx_md = format!(
        "# Turn {}\n\n## Prompt\n\n````\n{}\n````\n\n---\n\n## Response\n\n{}\n",
        turn_number, prompt, response_md
    );
    let docx_path = write_docx(&docx_md, &turn_dir.join("turn.docx"))
        .await
        .unwrap_or_default();

    Ok(ArtifactPaths {
        turn_dir: turn_dir.to_string_lossy().to_string(),
        jsonl_path: jsonl_path.to_string_lossy().to_string(),
        md_path: md_path.to_string_lossy().to_string(),
        html_path: html_path.to_string_lossy().to_string(),
        docx_path,
    })
}

/// Write the self-contained artifact set for a regular turn.
pub async fn write_turn_artifacts(
    conv_dir: &Path,
    conversation_id: &str,
    turn_number: usize,
    model: &str,
    prompt: &str,
    response_md: &str,
) -> Result<ArtifactPaths> {
    let turn_dir = make_turn_dir(conv_dir, turn_number, prompt).await?;

    let record = serde_json::json!({
        "conversation_id": conversation_id,
        "turn_number": turn_number,
        "timestamp": Utc::now().to_rfc3339(),
        "model": model,
        "prompt": prompt,
        "result_markdown": response_md,
    });

    write_common_artifacts(&turn_dir, turn_number, prompt, response_md, &record).await
}

/// Write the artifact set for a comparison turn: same file layout, with the
/// full per-model result list in the structured record.
pub async fn write_comparison_artifacts(
    conv_dir: &Path,
    conversation_id: &str,
    turn_number: usize,
    prompt: &str,
    results: &[ModelResult],
) -> Result<ArtifactPaths> {
    let turn_dir = make_turn_dir(conv_dir, turn_number, prompt).await?;

    let record = serde_json::json!({
        "conversation_id": conversation_id,
        "turn_number": turn_number,
        "timestamp": Utc::now().to_rfc3339(),
        "prompt": prompt,
        "results": results,
    });

    let body = comparison_markdown(results);
    write_common_artifacts(&turn_dir, turn_number, prompt, &body, &record).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello world, how are you?"), "Hello-world-how-are-you");
        assert_eq!(slugify("  spaces\teverywhere  "), "spaces-everywhere");
        assert_eq!(slugify("???!!!"), "prompt");
        assert_eq!(slugify(""), "prompt");
        // Only the first line matters
        assert_eq!(slugify("first line\nsecond line"), "first-line");
        assert!(slugify(&"x".repeat(200)).len() <= SLUG_MAX_LEN);
    }

    #[test]
    fn test_comparison_markdown_sections() {
        let results = vec![
            ModelResult::ok("a", "answer a", 1.0),
            ModelResult::failed("b", "timed out", 2.5),
        ];
        let md = comparison_markdown(&results);
        assert!(md.contains("## a (1.00s)"));
        assert!(md.contains("answer a"));
        assert!(md.contains("## b (2.50s)"));
        assert!(md.contains("**Error:** timed out"));
    }

    #[tokio::test]
    async fn test_write_turn_artifacts_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_turn_artifacts(dir.path(), "conv_x", 1, "llama3", "What is Rust?", "A language.")
            .await
            .unwrap();

        assert!(paths.turn_dir.ends_with("turn_001_What-is-Rust"));
        let jsonl = std::fs::read_to_string(&paths.jsonl_path).unwrap();
        let record: serde_json::Value = serde_json::from_str(jsonl.trim()).unwrap();
        assert_eq!(record["turn_number"], 1);
        assert_eq!(record["result_markdown"], "A language.");

        let html = std::fs::read_to_string(&paths.html_path).unwrap();
        assert!(html.contains("<h1>Turn 1</h1>"));
        assert!(std::fs::read_to_string(&paths.md_path)
            .unwrap()
            .contains("## Prompt"));
    }

    #[tokio::test]
    async fn test_comparison_artifacts_record_results() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![
            ModelResult::ok("a", "ra", 0.1),
            ModelResult::failed("b", "down", 0.2),
        ];
        let paths = write_comparison_artifacts(dir.path(), "conv_x", 2, "compare", &results)
            .await
            .unwrap();

        let jsonl = std::fs::read_to_string(&paths.jsonl_path).unwrap();
        let record: serde_json::Value = serde_json::from_str(jsonl.trim()).unwrap();
        assert_eq!(record["results"].as_array().unwrap().len(), 2);
        assert_eq!(record["results"][1]["error"], "down");
    }
}
