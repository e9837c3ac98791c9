//! On-disk page store.
//!
//! Each page is a standalone JSON file under the session directory; the
//! index aggregates metadata and is rewritten atomically via a
//! write-staging-then-rename pattern (same shape as a binary self-replace:
//! write to a `.tmp` sibling, then `rename` over the live file so readers
//! never observe a half-written index).

use crate::error::{EngineError, EngineResult};
use crate::page::Page;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// On-disk page index. `page_ref_count` is emitted
/// as a `Vec<(id, count)>` pair list to match the on-disk schema rather
/// than a map (stable key order, straightforward JSON shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageIndex {
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub active_page_ids: Vec<String>,
    #[serde(default)]
    pub load_order: Vec<String>,
    #[serde(default)]
    pub page_ref_count: Vec<(String, u64)>,
    #[serde(default)]
    pub pinned_page_ids: Vec<String>,
    #[serde(default)]
    pub saved_at: String,
}

pub struct PageStore {
    dir: PathBuf,
}

impl PageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn page_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    /// Persist a page's metadata record plus its raw content as one JSON
    /// file, UTF-8 with a trailing newline.
    pub fn save(&self, page: &Page, raw_content: &str) -> EngineResult<()> {
        fs::create_dir_all(&self.dir)?;
        let record = PageFile {
            id: page.id.clone(),
            label: page.label.clone(),
            content: raw_content.to_string(),
            created_at: page.created_at.clone(),
            message_count: page.source_message_count,
            tokens: page.token_estimate,
            max_importance: Some(page.max_importance),
            lane: Some(page.lane),
            summary: Some(page.summary.clone()),
        };
        let mut body = serde_json::to_string_pretty(&record)?;
        body.push('\n');
        let path = self.page_path(&page.id);
        let staging = self.dir.join(format!("{}.tmp", page.id));
        if let Err(e) = fs::write(&staging, &body) {
            warn!(page_id = %page.id, error = %e, "page write failed");
            return Err(EngineError::from(e));
        }
        if let Err(e) = fs::rename(&staging, &path) {
            warn!(page_id = %page.id, error = %e, "page rename failed");
            let _ = fs::remove_file(&staging);
            return Err(EngineError::from(e));
        }
        Ok(())
    }

    /// Load a page's raw content. A single page's I/O failure is
    /// logged and recovered locally: callers see `None`, not an error.
    pub fn load_content(&self, id: &str) -> Option<String> {
        let path = self.page_path(id);
        match fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str::<PageFile>(&body) {
                Ok(record) => Some(record.content),
                Err(e) => {
                    warn!(page_id = %id, error = %e, "page record corrupt");
                    None
                }
            },
            Err(e) => {
                warn!(page_id = %id, error = %e, "page load failed");
                None
            }
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.page_path(id).is_file()
    }

    /// Write a batch-produced summary back into an existing page record,
    /// leaving its content and id untouched. Used by the batch worker path
    /// (§4.7 "writes results back into page records"); callers re-enqueue
    /// the job on failure.
    pub fn update_summary(&self, id: &str, summary: &str) -> EngineResult<()> {
        let path = self.page_path(id);
        let body = fs::read_to_string(&path)?;
        let mut record: PageFile = serde_json::from_str(&body)?;
        record.summary = Some(summary.to_string());
        let mut new_body = serde_json::to_string_pretty(&record)?;
        new_body.push('\n');
        let staging = self.dir.join(format!("{id}.tmp"));
        fs::write(&staging, &new_body)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    /// Rewrite the index atomically. Always emits the full schema
    /// (`page_ref_count` and `pinned_page_ids` included) per the on-disk
    /// Questions — "writers MUST emit the full form".
    pub fn index_persist(&self, index: &PageIndex) -> EngineResult<()> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(index)?;
        let staging = self.dir.join("index.json.tmp");
        fs::write(&staging, &body)?;
        fs::rename(&staging, self.index_path())?;
        Ok(())
    }

    /// Load the index. A corrupt file is treated as absent
    /// "Corrupted index file: discarded, rebuilt") rather than propagated;
    /// both on-disk schema variants are accepted because every field here
    /// carries `#[serde(default)]`.
    pub fn index_load(&self) -> PageIndex {
        let path = self.index_path();
        match fs::read_to_string(&path) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_else(|e| {
                warn!(error = %e, "page index corrupt, rebuilding");
                PageIndex::default()
            }),
            Err(_) => PageIndex::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageFile {
    id: String,
    label: String,
    content: String,
    created_at: String,
    message_count: usize,
    tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_importance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lane: Option<crate::page::LaneTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
}

/// Builds a `page_ref_count` lookup from the index's pair list.
pub fn ref_count_map(index: &PageIndex) -> HashMap<String, u64> {
    index.page_ref_count.iter().cloned().collect()
}

pub fn session_dir_exists(dir: &Path) -> bool {
    dir.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::Lane;
    use crate::page::Page;

    #[test]
    fn save_then_load_content_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PageStore::new(tmp.path());
        let page = Page::new("raw content here", Lane::User, "a label", "a summary", "2026-01-01T00:00:00Z", 2, 0.1, 10);
        store.save(&page, "raw content here").unwrap();
        assert!(store.exists(&page.id));
        assert_eq!(store.load_content(&page.id).unwrap(), "raw content here");
    }

    #[test]
    fn update_summary_rewrites_summary_keeps_content_and_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PageStore::new(tmp.path());
        let page = Page::new("raw content", Lane::Tool, "a label", "", "2026-01-01T00:00:00Z", 1, 0.0, 5);
        store.save(&page, "raw content").unwrap();
        store.update_summary(&page.id, "batch-produced summary").unwrap();
        assert_eq!(store.load_content(&page.id).unwrap(), "raw content");
        let body = fs::read_to_string(tmp.path().join(format!("{}.json", page.id))).unwrap();
        let record: PageFile = serde_json::from_str(&body).unwrap();
        assert_eq!(record.summary.as_deref(), Some("batch-produced summary"));
        assert_eq!(record.label, "a label");
    }

    #[test]
    fn missing_page_load_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PageStore::new(tmp.path());
        assert!(store.load_content("pg_doesnotexist").is_none());
    }

    #[test]
    fn index_persist_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = PageStore::new(tmp.path());
        let mut index = PageIndex::default();
        index.active_page_ids.push("pg_abc".to_string());
        index.page_ref_count.push(("pg_abc".to_string(), 3));
        store.index_persist(&index).unwrap();
        let loaded = store.index_load();
        assert_eq!(loaded.active_page_ids, vec!["pg_abc".to_string()]);
        assert_eq!(ref_count_map(&loaded).get("pg_abc"), Some(&3));
    }

    #[test]
    fn corrupt_index_is_discarded_not_propagated() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("index.json"), "{not valid json").unwrap();
        let store = PageStore::new(tmp.path());
        let loaded = store.index_load();
        assert!(loaded.active_page_ids.is_empty());
    }

    #[test]
    fn index_without_ref_count_field_still_parses() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("index.json"),
            r#"{"pages":[],"active_page_ids":[],"load_order":[],"saved_at":"x"}"#,
        )
        .unwrap();
        let store = PageStore::new(tmp.path());
        let loaded = store.index_load();
        assert!(loaded.page_ref_count.is_empty());
    }
}
