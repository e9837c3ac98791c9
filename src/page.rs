//! Page records.
//!
//! Pages are immutable and content-addressed: the id is derived from the
//! raw content so identical summaries dedupe naturally and reloading a
//! page never needs a separate checksum field.

use crate::lane::Lane;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable, content-derived page identifier: `pg_` followed by the first
/// 12 hex characters of the sha256 digest of the raw page content.
pub fn page_id(raw_content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_content.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("pg_{}", &hex[..12])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneTag {
    Assistant,
    User,
    System,
    Tool,
    Other,
}

impl From<Lane> for LaneTag {
    fn from(lane: Lane) -> Self {
        match lane {
            Lane::Assistant => LaneTag::Assistant,
            Lane::User => LaneTag::User,
            Lane::System => LaneTag::System,
            Lane::Tool => LaneTag::Tool,
            Lane::Other => LaneTag::Other,
        }
    }
}

/// A page's persisted metadata. The full raw content lives on disk
/// separately (see [`crate::page_store`]); this struct is what the index
/// file and in-memory slot manager carry around. `label` is the short,
/// synchronously computed tag shown in a loaded-page header and in
/// placeholder/fallback summary text (e.g. `"4 assistant lane
/// messages"`); `summary` is the full narrative text a summariser driver
/// (or batch worker) produces, which may arrive later and is typically
/// much longer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub lane: LaneTag,
    pub label: String,
    pub summary: String,
    pub created_at: String,
    pub source_message_count: usize,
    pub max_importance: f32,
    pub token_estimate: usize,
}

impl Page {
    pub fn new(
        raw_content: &str,
        lane: Lane,
        label: impl Into<String>,
        summary: impl Into<String>,
        created_at: impl Into<String>,
        source_message_count: usize,
        max_importance: f32,
        token_estimate: usize,
    ) -> Self {
        Self {
            id: page_id(raw_content),
            lane: lane.into(),
            label: label.into(),
            summary: summary.into(),
            created_at: created_at.into(),
            source_message_count,
            max_importance,
            token_estimate,
        }
    }
}

/// A lightweight in-memory handle pointing at a page, used wherever the
/// full [`Page`] need not be loaded (e.g. the index or a pin set).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRef {
    pub id: String,
}

impl PageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_is_deterministic_and_prefixed() {
        let a = page_id("hello world");
        let b = page_id("hello world");
        assert_eq!(a, b);
        assert!(a.starts_with("pg_"));
        assert_eq!(a.len(), "pg_".len() + 12);
    }

    #[test]
    fn page_id_differs_for_different_content() {
        assert_ne!(page_id("a"), page_id("b"));
    }

    #[test]
    fn page_new_sets_id_from_raw_content() {
        let page = Page::new("raw text", Lane::User, "label", "summary", "2026-01-01T00:00:00Z", 3, 0.5, 42);
        assert_eq!(page.id, page_id("raw text"));
        assert_eq!(page.lane, LaneTag::User);
        assert_eq!(page.label, "label");
    }
}
