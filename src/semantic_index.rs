//! Semantic page index.
//!
//! A flat cosine-similarity index over page summaries. Persisted as a
//! single JSON document; provider/model mismatch on load discards all
//! entries and triggers a backfill. The double-buffered rebuild writes a
//! shadow file plus a progress checkpoint so a long embedding pass can be
//! cancelled and resumed, then atomically swaps in.

use crate::page::Page;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

const INDEX_VERSION: u32 = 1;
const DEDUP_COSINE_THRESHOLD: f32 = 0.9;

/// External embedding collaborator.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> crate::error::EngineResult<Vec<Vec<f32>>>;
    fn provider_name(&self) -> &str;
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub embedding: Vec<f32>,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticIndexFile {
    pub version: u32,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub entries: HashMap<String, IndexEntry>,
    pub updated_at: String,
}

impl SemanticIndexFile {
    fn empty(provider: &str, model: &str, dimension: usize) -> Self {
        Self {
            version: INDEX_VERSION,
            provider: provider.to_string(),
            model: model.to_string(),
            dimension,
            entries: HashMap::new(),
            updated_at: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub page_id: String,
    pub score: f32,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebuildProgress {
    pub completed_page_ids: Vec<String>,
    pub failed_page_ids: Vec<String>,
}

pub struct SemanticIndex {
    dir: PathBuf,
    provider: String,
    model: String,
    dimension: usize,
    file: SemanticIndexFile,
}

impl SemanticIndex {
    pub fn new(dir: impl Into<PathBuf>, provider: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        let dir = dir.into();
        let provider = provider.into();
        let model = model.into();
        let file = Self::load_or_empty(&dir, &provider, &model, dimension);
        Self {
            dir,
            provider,
            model,
            dimension,
            file,
        }
    }

    fn index_path(dir: &PathBuf) -> PathBuf {
        dir.join("embeddings.json")
    }

    fn shadow_path(dir: &PathBuf) -> PathBuf {
        dir.join("embeddings.shadow.json")
    }

    fn progress_path(dir: &PathBuf) -> PathBuf {
        dir.join("batch-progress.json")
    }

    fn load_or_empty(dir: &PathBuf, provider: &str, model: &str, dimension: usize) -> SemanticIndexFile {
        // Orphan recovery: a shadow file with no progress checkpoint means a
        // prior rebuild completed but the swap never landed.
        if Self::shadow_path(dir).is_file() && !Self::progress_path(dir).is_file() {
            if let Err(e) = fs::rename(Self::shadow_path(dir), Self::index_path(dir)) {
                warn!(error = %e, "failed to recover orphaned shadow index");
            }
        }

        match fs::read_to_string(Self::index_path(dir)) {
            Ok(body) => match serde_json::from_str::<SemanticIndexFile>(&body) {
                Ok(parsed) if parsed.provider == provider && parsed.model == model => parsed,
                Ok(_) => SemanticIndexFile::empty(provider, model, dimension),
                Err(e) => {
                    warn!(error = %e, "semantic index corrupt, discarding");
                    SemanticIndexFile::empty(provider, model, dimension)
                }
            },
            Err(_) => SemanticIndexFile::empty(provider, model, dimension),
        }
    }

    pub fn len(&self) -> usize {
        self.file.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.entries.is_empty()
    }

    pub fn contains(&self, page_id: &str) -> bool {
        self.file.entries.contains_key(page_id)
    }

    pub fn insert(&mut self, page_id: impl Into<String>, embedding: Vec<f32>, label: impl Into<String>) {
        self.file.entries.insert(page_id.into(), IndexEntry { embedding, label: label.into() });
    }

    pub fn persist(&mut self, saved_at: impl Into<String>) -> std::io::Result<()> {
        self.file.updated_at = saved_at.into();
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_string_pretty(&self.file)?;
        let staging = self.dir.join("embeddings.json.tmp");
        fs::write(&staging, &body)?;
        fs::rename(&staging, Self::index_path(&self.dir))?;
        Ok(())
    }

    /// Cosine similarity search. Embed the query upstream and pass the
    /// resulting vector in; this type stays free of the embedding
    /// provider dependency. Drops below `threshold`, takes top `2k`,
    /// de-duplicates near-identical hits, truncates to `k`.
    pub fn search(&self, query_embedding: &[f32], k: usize, threshold: f32) -> Vec<SearchHit> {
        let mut scored: Vec<(String, f32, String, &[f32])> = self
            .file
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), cosine(query_embedding, &e.embedding), e.label.clone(), e.embedding.as_slice()))
            .filter(|(_, score, _, _)| *score >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k * 2);

        let mut kept: Vec<(String, f32, String, &[f32])> = Vec::new();
        for candidate in scored {
            let dup = kept
                .iter()
                .any(|(_, _, _, emb)| cosine(candidate.3, emb) > DEDUP_COSINE_THRESHOLD);
            if !dup {
                kept.push(candidate);
            }
        }
        kept.truncate(k);

        kept.into_iter()
            .map(|(id, score, label, _)| SearchHit { page_id: id, score, label })
            .collect()
    }

    /// Pages eligible for backfill: has a non-empty summary, missing from
    /// the index.
    pub fn pending_backfill<'a>(&self, pages: &'a [Page]) -> Vec<&'a Page> {
        pages
            .iter()
            .filter(|p| !p.summary.is_empty() && !self.contains(&p.id))
            .collect()
    }

    pub fn begin_rebuild(&self) -> RebuildProgress {
        match fs::read_to_string(Self::progress_path(&self.dir)) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_default(),
            Err(_) => RebuildProgress::default(),
        }
    }

    pub fn checkpoint_rebuild(&self, progress: &RebuildProgress) -> std::io::Result<()> {
        let body = serde_json::to_string_pretty(progress)?;
        fs::write(Self::progress_path(&self.dir), body)
    }

    /// Write the shadow index during a rebuild without touching the live
    /// file.
    pub fn persist_shadow(dir: &PathBuf, shadow: &SemanticIndexFile) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let body = serde_json::to_string_pretty(shadow)?;
        fs::write(Self::shadow_path(dir), body)
    }

    /// Complete a double-buffered rebuild: rename shadow over the live
    /// file, drop the progress checkpoint, swap the in-memory copy.
    pub fn complete_rebuild(&mut self) -> std::io::Result<()> {
        fs::rename(Self::shadow_path(&self.dir), Self::index_path(&self.dir))?;
        let _ = fs::remove_file(Self::progress_path(&self.dir));
        self.file = Self::load_or_empty(&self.dir, &self.provider, &self.model, self.dimension);
        Ok(())
    }

    /// Full double-buffered rebuild over every page with a non-empty
    /// summary: resumes from a prior checkpoint (carrying forward already-
    /// embedded entries from the live index rather than re-embedding),
    /// periodically persists shadow + progress so the pass is cancellable,
    /// then atomically swaps shadow over live on completion. Embedding
    /// failures are recorded in `failed_page_ids` and skipped rather than
    /// aborting the whole rebuild.
    #[tracing::instrument(skip(self, embedder, pages), fields(dir = %self.dir.display()))]
    pub async fn rebuild(
        &mut self,
        embedder: &dyn EmbeddingProvider,
        pages: &[Page],
        checkpoint_every: usize,
    ) -> RebuildProgress {
        let mut progress = self.begin_rebuild();
        let mut shadow = SemanticIndexFile::empty(&self.provider, &self.model, self.dimension);
        for id in &progress.completed_page_ids {
            if let Some(entry) = self.file.entries.get(id) {
                shadow.entries.insert(id.clone(), entry.clone());
            }
        }

        let mut since_checkpoint = 0usize;
        for page in pages {
            if page.summary.is_empty() || progress.completed_page_ids.contains(&page.id) {
                continue;
            }
            match embedder.embed(&[page.summary.clone()]).await {
                Ok(mut vecs) => {
                    if let Some(v) = vecs.pop() {
                        shadow.entries.insert(page.id.clone(), IndexEntry { embedding: v, label: page.summary.clone() });
                        progress.completed_page_ids.push(page.id.clone());
                    }
                }
                Err(e) => {
                    warn!(page_id = %page.id, error = %e, "embedding failure during index rebuild, skipping");
                    progress.failed_page_ids.push(page.id.clone());
                }
            }

            since_checkpoint += 1;
            if since_checkpoint >= checkpoint_every.max(1) {
                if let Err(e) = Self::persist_shadow(&self.dir, &shadow) {
                    warn!(error = %e, "failed to persist shadow index checkpoint");
                }
                if let Err(e) = self.checkpoint_rebuild(&progress) {
                    warn!(error = %e, "failed to persist rebuild progress checkpoint");
                }
                since_checkpoint = 0;
            }
        }

        if let Err(e) = Self::persist_shadow(&self.dir, &shadow) {
            warn!(error = %e, "failed to persist final shadow index");
        }
        if let Err(e) = self.complete_rebuild() {
            warn!(error = %e, "failed to complete shadow index rebuild swap");
        }
        progress
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
