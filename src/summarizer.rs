//! Summariser interface and page-summary construction.

use crate::markers::{extract_important_lines, strip_ephemeral_lines};
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::warn;

#[async_trait]
pub trait Summariser: Send + Sync {
    async fn summarize(&self, prompt: &str, model: Option<&str>) -> crate::error::EngineResult<String>;
}

/// Durable queue record written by the synchronous path and drained by a
/// background worker (JSON-Lines queue file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub page_id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    pub queued_at: i64,
}

/// Append one entry to the on-disk JSONL queue (the synchronous path
/// may touch durable state but never suspends on I/O beyond this append).
pub fn enqueue(queue_path: &Path, entry: &QueueEntry) -> crate::error::EngineResult<()> {
    if let Some(parent) = queue_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(queue_path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Drain and truncate the queue, returning every entry ("a
/// background worker drains the queue").
pub fn drain(queue_path: &Path) -> crate::error::EngineResult<Vec<QueueEntry>> {
    if !queue_path.is_file() {
        return Ok(Vec::new());
    }
    let body = std::fs::read_to_string(queue_path)?;
    let entries: Vec<QueueEntry> = body
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    std::fs::write(queue_path, "")?;
    Ok(entries)
}

fn placeholder_summary(label: &str, count: usize, page_id: &str) -> String {
    format!("[Pending summary: {count} messages, {label}] <ref id=\"{page_id}\"/>")
}

fn fallback_summary(label: &str, count: usize, page_id: &str) -> String {
    format!("[Summary of {count} messages: {label}] <ref id=\"{page_id}\"/>")
}

fn ensure_ref_tag(mut text: String, page_id: &str) -> String {
    let tag = format!("<ref id=\"{page_id}\"/>");
    if !text.contains(&tag) {
        text.push(' ');
        text.push_str(&tag);
    }
    text
}

/// Build the transcript sent to a synchronous summariser driver: strip
/// `@@ephemeral@@` lines, collect `@@important@@` lines into a
/// preservation header, tag high-importance source messages, then append
/// a lane-specific focus instruction.
pub fn build_prompt(messages: &[Message], lane_focus: &str) -> String {
    let mut important_header = Vec::new();
    let mut body = String::new();

    for m in messages {
        let tagged = if m.importance.unwrap_or(0.0) >= 0.7 {
            format!("[IMPORTANT={}] {}", m.importance.unwrap_or(0.0), m.content)
        } else {
            m.content.clone()
        };
        let cleaned = strip_ephemeral_lines(&tagged);
        important_header.extend(extract_important_lines(&cleaned));
        body.push_str(&format!("[{}]: {}\n\n", m.role.as_str(), cleaned));
    }

    let mut prompt = String::new();
    if !important_header.is_empty() {
        prompt.push_str("Preserve verbatim:\n");
        for line in &important_header {
            prompt.push_str(line);
            prompt.push('\n');
        }
        prompt.push('\n');
    }
    prompt.push_str(&body);
    prompt.push_str(&format!("\n{lane_focus}\n"));
    prompt
}

/// The three summary-production cases, driven by which
/// collaborators are available.
pub enum SummaryMode<'a> {
    Batch { queue_path: &'a Path },
    Synchronous { driver: &'a dyn Summariser, model: Option<&'a str> },
    None,
}

/// Produce a page summary. Never fails the caller: summariser
/// and batch-submit failures degrade to a deterministic fallback, per
/// a deterministic fallback.
pub async fn summarize_page(
    mode: SummaryMode<'_>,
    page_id: &str,
    label: &str,
    messages: &[Message],
    lane_focus: &str,
) -> String {
    let count = messages.len();
    match mode {
        SummaryMode::Batch { queue_path } => {
            let entry = QueueEntry {
                page_id: page_id.to_string(),
                label: label.to_string(),
                lane: None,
                queued_at: 0,
            };
            if let Err(e) = enqueue(queue_path, &entry) {
                warn!(page_id, error = %e, "failed to enqueue summary job, falling back");
                return fallback_summary(label, count, page_id);
            }
            placeholder_summary(label, count, page_id)
        }
        SummaryMode::Synchronous { driver, model } => {
            let prompt = build_prompt(messages, lane_focus);
            match driver.summarize(&prompt, model).await {
                Ok(text) => ensure_ref_tag(text, page_id),
                Err(e) => {
                    warn!(page_id, error = %e, "summariser driver failed, falling back");
                    fallback_summary(label, count, page_id)
                }
            }
        }
        SummaryMode::None => fallback_summary(label, count, page_id),
    }
}
