//! `VirtualMemory`: wires every component —
//! lane/importance partitioning, the watermark controller, the
//! compactor, the tool-pair flattener, the page store and slot manager,
//! the fork store, the semantic index, and the concurrency gate — behind
//! one facade.

use crate::compactor::{self, LaneOutcome};
use crate::concurrency::CompactionGate;
use crate::config::MemoryConfig;
use crate::context_assembler;
use crate::error::EngineResult;
use crate::flattener;
use crate::fork_store::{Fork, ForkMeta, ForkReason, ForkStore};
use crate::lane::Lane;
use crate::markers;
use crate::message::{Envelope, Message, Role};
use crate::metrics::{MemoryStats, Metrics};
use crate::page::Page;
use crate::page_slot::PageSlot;
use crate::page_store::{PageIndex, PageStore};
use crate::semantic_index::{EmbeddingProvider, SearchHit, SemanticIndex};
use crate::summarizer::{self, SummaryMode, Summariser};
use crate::tokenizer::Tokenizer;
use crate::watermark;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct VirtualMemory {
    config: MemoryConfig,
    buffer: Vec<Envelope>,
    next_seq: u64,
    tokenizer: Tokenizer,

    page_store: PageStore,
    page_slot: PageSlot,
    pages: HashMap<String, Page>,

    fork_store: ForkStore,
    semantic_index: Option<SemanticIndex>,

    gate: CompactionGate,
    metrics: Metrics,

    pending_ref: Vec<String>,
    pending_unref: Vec<String>,

    summariser: Option<Arc<dyn Summariser>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl VirtualMemory {
    /// Construct a fresh engine. `system_prompt`, if given, is installed
    /// as the original system prompt: never paged, never removed, and
    /// always first in every `messages()` result.
    pub fn new(config: MemoryConfig, system_prompt: Option<Message>) -> Self {
        let page_store = PageStore::new(config.session_dir().join("pages"));
        let fork_store = ForkStore::new(config.session_dir().join("forks"));
        let index = page_store.index_load();

        let mut pages = HashMap::new();
        for p in index.pages {
            pages.insert(p.id.clone(), p);
        }
        let mut page_slot = PageSlot::new();
        for id in &index.load_order {
            if let Some(p) = pages.get(id) {
                page_slot.load(id, p.token_estimate);
            }
        }
        for id in &index.pinned_page_ids {
            page_slot.pin(id);
        }

        let mut buffer = Vec::new();
        let mut next_seq = 0;
        if let Some(mut sys) = system_prompt {
            sys.from = Some("System".to_string());
            buffer.push(Envelope { seq: next_seq, message: sys });
            next_seq += 1;
        }

        let tokenizer = Tokenizer::new(config.avg_chars_per_token);

        Self {
            config,
            buffer,
            next_seq,
            tokenizer,
            page_store,
            page_slot,
            pages,
            fork_store,
            semantic_index: None,
            gate: CompactionGate::new(),
            metrics: Metrics::new(),
            pending_ref: Vec::new(),
            pending_unref: Vec::new(),
            summariser: None,
            embedder: None,
        }
    }

    pub fn with_summariser(mut self, summariser: Arc<dyn Summariser>) -> Self {
        self.summariser = Some(summariser);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let dir = self.config.session_dir().join("index");
        self.semantic_index = Some(SemanticIndex::new(dir, embedder.provider_name(), embedder.model_name(), embedder.dimension()));
        self.embedder = Some(embedder);
        self
    }

    fn now_iso(&self) -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // ---- mutation ----------------------------------------------------

    /// Append a message, then check the watermark and run compaction if
    /// any lane is over budget.
    pub async fn add(&mut self, message: Message) -> EngineResult<()> {
        self.buffer.push(Envelope { seq: self.next_seq, message });
        self.next_seq += 1;
        self.maybe_compact(false).await
    }

    /// Append only if no existing message has identical content, role,
    /// and `tool_call_id` — used by callers replaying idempotent events.
    pub async fn add_if_not_exists(&mut self, message: Message) -> EngineResult<bool> {
        let exists = self.buffer.iter().any(|e| {
            e.message.role == message.role
                && e.message.content == message.content
                && e.message.tool_call_id == message.tool_call_id
        });
        if exists {
            return Ok(false);
        }
        self.add(message).await?;
        Ok(true)
    }

    async fn maybe_compact(&mut self, force: bool) -> EngineResult<()> {
        let (_, decisions, _, _) = compactor::run_partition_phase(&self.buffer, &self.config, &self.tokenizer, force);
        let should_run = force || self.config.enable_phantom_compaction || watermark::any_over_budget(&decisions);
        if !should_run {
            return Ok(());
        }
        if !self.gate.try_enter() {
            return Ok(());
        }
        loop {
            self.run_compaction_cycle(force).await?;
            if !self.gate.finish() {
                break;
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(buffer_len = self.buffer.len(), force))]
    async fn run_compaction_cycle(&mut self, force: bool) -> EngineResult<()> {
        let (partition, _decisions, outcomes, sys_head) =
            compactor::run_partition_phase(&self.buffer, &self.config, &self.tokenizer, force);

        let reason = if force { ForkReason::Manual } else { ForkReason::Watermark };
        compactor::take_fork_snapshot(&self.fork_store, &self.buffer, self.now_ms(), reason, &partition, &self.tokenizer)?;

        let mut summary_messages = Vec::new();
        for outcome in &outcomes {
            if outcome.older.len() < 2 {
                continue;
            }
            let page = self.create_page(outcome).await;
            summary_messages.push(compactor::summary_message(outcome.lane, &page.summary));
            self.metrics.record_retention(outcome.lane, outcome.older.len(), outcome.keep.len());
        }
        self.metrics.compaction_run();

        let rebuilt = compactor::rebuild_buffer(&self.buffer, sys_head.as_ref(), &outcomes, summary_messages);
        let flattened: Vec<Message> = flattener::flatten(&rebuilt.iter().map(|e| e.message.clone()).collect::<Vec<_>>());
        // The flattener may expand (synthesised pairs) or shrink (dropped
        // orphans) the buffer, so positions no longer line up with
        // `rebuilt`'s sequence numbers — re-sequence fresh rather than
        // reuse them. Only identity *within* this rebuild mattered; once
        // flattened, order alone is the contract callers rely on.
        self.buffer = flattened
            .into_iter()
            .map(|message| {
                let seq = self.next_seq;
                self.next_seq += 1;
                Envelope { seq, message }
            })
            .collect();

        Ok(())
    }

    async fn create_page(&mut self, outcome: &LaneOutcome) -> Page {
        let raw = compactor::build_raw_transcript(&outcome.older);
        let created_at = self.now_iso();
        let label = format!("{} lane messages", outcome.older.len());
        let mut page = compactor::make_page(&raw, outcome.lane, &label, &created_at, &outcome.older);

        let lane_focus = lane_focus_instruction(outcome.lane);
        let messages: Vec<Message> = outcome.older.iter().map(|e| e.message.clone()).collect();

        let queue_path_buf = self.config.queue_file_path();
        let mode = if self.config.enable_batch_summarisation {
            SummaryMode::Batch { queue_path: &queue_path_buf }
        } else if let Some(driver) = &self.summariser {
            SummaryMode::Synchronous { driver: driver.as_ref(), model: self.config.summariser_model.as_deref() }
        } else {
            SummaryMode::None
        };

        let summary = summarizer::summarize_page(mode, &page.id, &label, &messages, &lane_focus).await;
        page.summary = summary;

        if let Err(e) = self.page_store.save(&page, &raw) {
            warn!(page_id = %page.id, error = %e, "page save failed");
        } else {
            self.metrics.page_created(&page.id, outcome.lane, page.token_estimate);
        }
        self.pages.insert(page.id.clone(), page.clone());
        self.persist_index();

        if let Some(idx) = &mut self.semantic_index {
            if let Some(embedder) = &self.embedder {
                if !page.summary.is_empty() {
                    if let Ok(mut vecs) = embedder.embed(&[page.summary.clone()]).await {
                        if let Some(v) = vecs.pop() {
                            idx.insert(page.id.clone(), v, label.clone());
                        }
                    }
                }
            }
        }

        page
    }

    fn persist_index(&self) {
        let index = PageIndex {
            pages: self.pages.values().cloned().collect(),
            active_page_ids: self.page_slot.loaded_ids().to_vec(),
            load_order: self.page_slot.loaded_ids().to_vec(),
            page_ref_count: self
                .page_slot
                .loaded_ids()
                .iter()
                .map(|id| (id.clone(), self.page_slot.ref_count(id)))
                .collect(),
            pinned_page_ids: self.pages.keys().filter(|id| self.page_slot.is_pinned(id)).cloned().collect(),
            saved_at: self.now_iso(),
        };
        if let Err(e) = self.page_store.index_persist(&index) {
            warn!(error = %e, "page index persist failed");
        }
    }

    // ---- ref/unref/pin -------------------------------------------------

    pub fn ref_page(&mut self, id: &str) {
        self.pending_ref.push(id.to_string());
    }

    pub fn unref(&mut self, id: &str) {
        self.pending_unref.push(id.to_string());
    }

    pub fn pin(&mut self, id: &str) {
        self.page_slot.pin(id);
        if !self.page_slot.is_loaded(id) {
            self.ref_page(id);
        }
    }

    pub fn unpin(&mut self, id: &str) {
        self.page_slot.unpin(id);
    }

    fn resolve_ref_unref(&mut self) {
        for id in self.pending_unref.drain(..).collect::<Vec<_>>() {
            self.page_slot.unload(&id);
        }
        for id in self.pending_ref.drain(..).collect::<Vec<_>>() {
            let known = self.pages.contains_key(&id) || self.page_store.exists(&id);
            if known {
                let tokens = self.pages.get(&id).map(|p| p.token_estimate).unwrap_or(0);
                if self.page_slot.was_previously_loaded(&id) {
                    self.metrics.page_reloaded(&id);
                }
                self.page_slot.load(&id, tokens);
                self.metrics.ref_hit();
            } else {
                self.metrics.ref_miss();
            }
        }
    }

    // ---- read -----------------------------------------------------------

    /// Assemble `[system prompt] + [loaded page slot] + [sanitised recent
    /// window]`.
    pub fn messages(&mut self) -> Vec<Message> {
        self.resolve_ref_unref();

        match self.page_slot.evict_to_budget(self.config.page_slot_tokens) {
            Ok(evicted) => {
                for id in &evicted {
                    self.metrics.page_evicted(id);
                }
            }
            Err(e) => warn!(error = %e, "page slot eviction stopped early: all loaded pages pinned"),
        }

        let mut out = Vec::new();
        if let Some(first) = self.buffer.first() {
            if first.message.role == Role::System {
                out.push(first.message.clone());
            }
        }

        for id in self.page_slot.loaded_ids() {
            let content = self.page_store.load_content(id).unwrap_or_default();
            let label = self.pages.get(id).map(|p| p.label.clone()).unwrap_or_default();
            out.push(context_assembler::loaded_page_message(id, &label, &content));
        }

        let recent = context_assembler::sanitised_recent_window(&self.buffer, &self.config, &self.tokenizer);
        out.extend(recent);

        out
    }

    pub fn pages_list(&self) -> Vec<Page> {
        self.pages.values().cloned().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn has_page(&self, id: &str) -> bool {
        self.pages.contains_key(id)
    }

    // ---- compaction control ---------------------------------------------

    /// User-visible force-compact: returns a human-readable result
    /// string, never an error type directly.
    pub async fn force_compact(&mut self) -> String {
        if self.buffer.is_empty() {
            return "Nothing to compact — context is empty.".to_string();
        }
        let before_messages = self.buffer.len();
        let before_tokens = self.tokenizer.count_messages(&self.buffer.iter().map(|e| e.message.clone()).collect::<Vec<_>>());

        match self.maybe_compact(true).await {
            Ok(()) => {
                let after_messages = self.buffer.len();
                let after_tokens = self.tokenizer.count_messages(&self.buffer.iter().map(|e| e.message.clone()).collect::<Vec<_>>());
                info!(before_messages, after_messages, "force_compact complete");
                format!(
                    "Compacted: {before_messages}→{after_messages} messages, {before_tokens}→{after_tokens} tokens. Total pages: {}.",
                    self.page_count()
                )
            }
            Err(e) => format!("Error: {e}"),
        }
    }

    // ---- fork / recall ----------------------------------------------------

    pub fn fork_history(&self) -> Vec<ForkMeta> {
        self.fork_store.history()
    }

    /// Load a fork's non-system messages as a new page and schedule it
    /// for loading.
    pub async fn recall_fork(&mut self, id: Option<&str>) -> Option<String> {
        let fork: Fork = self.fork_store.load(id)?;
        let transcript = crate::fork_store::fork_non_system_transcript(&fork);
        let created_at = self.now_iso();
        let envelopes: Vec<Envelope> = fork
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .enumerate()
            .map(|(i, m)| Envelope { seq: i as u64, message: m.clone() })
            .collect();
        let label = format!("recalled fork {}", fork.meta.id);
        let page = compactor::make_page(&transcript, Lane::Other, &label, &created_at, &envelopes);
        let page = Page {
            summary: format!("[Recalled fork: {label}] <ref id=\"{}\"/>", page.id),
            ..page
        };

        if let Err(e) = self.page_store.save(&page, &transcript) {
            warn!(error = %e, "fork recall page save failed");
            return None;
        }
        self.pages.insert(page.id.clone(), page.clone());
        self.persist_index();
        self.ref_page(&page.id);
        Some(page.id)
    }

    // ---- search --------------------------------------------------------

    pub async fn search(&self, query: &str, k: usize, threshold: f32) -> Vec<SearchHit> {
        let (embedder, index) = match (&self.embedder, &self.semantic_index) {
            (Some(e), Some(i)) => (e, i),
            _ => return Vec::new(),
        };
        match embedder.embed(&[query.to_string()]).await {
            Ok(mut vecs) => {
                let q = vecs.pop().unwrap_or_default();
                index.search(&q, k, threshold)
            }
            Err(e) => {
                warn!(error = %e, "embedding failure during search");
                Vec::new()
            }
        }
    }

    /// Embed and index every page with a non-empty summary currently
    /// missing from the semantic index. A second call
    /// with no new pages is a no-op.
    /// Run a full double-buffered semantic index rebuild: re-embeds every
    /// page with a non-empty summary into a shadow file, checkpointing
    /// progress every `checkpoint_every` pages so the pass survives a
    /// restart, then atomically swaps the shadow in as the live index.
    pub async fn rebuild_semantic_index(&mut self, checkpoint_every: usize) {
        let (embedder, index) = match (&self.embedder, &mut self.semantic_index) {
            (Some(e), Some(i)) => (e, i),
            _ => return,
        };
        let pages: Vec<Page> = self.pages.values().cloned().collect();
        index.rebuild(embedder.as_ref(), &pages, checkpoint_every).await;
    }

    pub async fn backfill(&mut self) {
        let (embedder, index) = match (&self.embedder, &mut self.semantic_index) {
            (Some(e), Some(i)) => (e, i),
            _ => return,
        };
        let pending: Vec<(String, String)> = index
            .pending_backfill(&self.pages.values().cloned().collect::<Vec<_>>())
            .into_iter()
            .map(|p| (p.id.clone(), p.summary.clone()))
            .collect();
        for (id, summary) in pending {
            match embedder.embed(&[summary.clone()]).await {
                Ok(mut vecs) => {
                    if let Some(v) = vecs.pop() {
                        index.insert(id, v, summary);
                    }
                }
                Err(e) => warn!(page_id = %id, error = %e, "embedding failure during backfill"),
            }
        }
    }

    // ---- batch summariser write-back ------------------------------------

    /// Apply a batch worker's completed summary to an already-created page.
    /// The worker runs as a separate process draining the queue file and
    /// calls this once it has a result; on failure the worker re-enqueues
    /// the job itself rather than calling this at all.
    pub fn apply_batch_summary(&mut self, page_id: &str, summary: String) -> EngineResult<()> {
        self.page_store.update_summary(page_id, &summary)?;
        if let Some(page) = self.pages.get_mut(page_id) {
            page.summary = summary;
        }
        self.persist_index();
        Ok(())
    }

    pub fn get_stats(&self) -> MemoryStats {
        self.metrics.snapshot()
    }
}

fn lane_focus_instruction(lane: Lane) -> String {
    match lane {
        Lane::Assistant => "Focus on decisions the assistant made and why.".to_string(),
        Lane::User => "Focus on the user's intent and requirements.".to_string(),
        Lane::System => "Focus on standing instructions and constraints.".to_string(),
        Lane::Tool => "Focus on tool invocations and their outcomes.".to_string(),
        Lane::Other => "Summarise the content faithfully.".to_string(),
    }
}

/// Marker-driven operations a caller's outer parser invokes on pure
/// strings before they ever reach core state ("dynamic marker
/// handling").
pub fn prepare_marker_free_content(content: &str) -> (String, Vec<String>) {
    let important = markers::extract_important_lines(content);
    let cleaned = markers::strip_ephemeral_lines(content);
    (cleaned, important)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn test_config(dir: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            pages_dir: dir.to_path_buf(),
            working_memory_tokens: 200,
            high_ratio: 0.5,
            min_recent_per_lane: 2,
            assistant_weight: 1,
            user_weight: 1,
            system_weight: 1,
            tool_weight: 1,
            ..MemoryConfig::default()
        }
    }

    #[tokio::test]
    async fn system_prompt_always_first_and_never_paged() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = VirtualMemory::new(test_config(tmp.path()), Some(Message::system("System", "be helpful")));
        for i in 0..30 {
            vm.add(Message::new(Role::Assistant, format!("message {i} {}", "x".repeat(400)))).await.unwrap();
        }
        let msgs = vm.messages();
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, "be helpful");
    }

    #[tokio::test]
    async fn force_compact_on_empty_buffer_reports_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = VirtualMemory::new(test_config(tmp.path()), None);
        let out = vm.force_compact().await;
        assert_eq!(out, "Nothing to compact — context is empty.");
    }

    #[tokio::test]
    async fn basic_compaction_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = VirtualMemory::new(test_config(tmp.path()), Some(Message::system("System", "sys")));
        for i in 0..10 {
            vm.add(Message::new(Role::Assistant, format!("msg{i} {}", "y".repeat(400)))).await.unwrap();
        }
        let msgs = vm.messages();
        assert!(msgs.iter().any(|m| m.content.contains("ASSISTANT LANE SUMMARY")));
        assert!(vm.page_count() >= 1);
    }

    #[tokio::test]
    async fn importance_promotion_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = VirtualMemory::new(test_config(tmp.path()), Some(Message::system("System", "sys")));
        for i in 0..20 {
            let mut msg = Message::new(Role::User, format!("user message number {i}"));
            if i == 3 || i == 11 {
                msg = msg.with_importance(0.9);
                msg.content = format!("CRITICAL-{i}: must not be lost");
            }
            vm.add(msg).await.unwrap();
        }
        let _ = vm.force_compact().await;
        let msgs = vm.messages();
        let all_text: String = msgs.iter().map(|m| m.content.clone()).collect::<Vec<_>>().join(" ");
        let page_content: String = vm
            .pages_list()
            .iter()
            .filter_map(|p| vm.page_store.load_content(&p.id))
            .collect::<Vec<_>>()
            .join(" ");
        assert!(all_text.contains("CRITICAL-3") || page_content.contains("CRITICAL-3"));
        assert!(all_text.contains("CRITICAL-11") || page_content.contains("CRITICAL-11"));
    }

    #[tokio::test]
    async fn pin_then_evict_never_removes_pinned_page() {
        let tmp = tempfile::tempdir().unwrap();
        let config = MemoryConfig { page_slot_tokens: 10, ..test_config(tmp.path()) };
        let mut vm = VirtualMemory::new(config, None);
        let page = compactor::make_page("raw", Lane::User, "a page label", "2026-01-01T00:00:00Z", &[]);
        vm.page_store.save(&page, "raw").unwrap();
        vm.pages.insert(page.id.clone(), page.clone());
        vm.page_slot.load(&page.id, 5);
        vm.pin(&page.id);
        vm.page_slot.load(&page.id, 100);
        vm.messages();
        assert!(vm.page_slot.is_loaded(&page.id));
    }

    #[tokio::test]
    async fn ref_then_unref_unloads_on_next_messages_call() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = VirtualMemory::new(test_config(tmp.path()), None);
        let page = compactor::make_page("raw", Lane::User, "a page label", "2026-01-01T00:00:00Z", &[]);
        vm.page_store.save(&page, "raw").unwrap();
        vm.pages.insert(page.id.clone(), page.clone());
        vm.ref_page(&page.id);
        vm.messages();
        assert!(vm.page_slot.is_loaded(&page.id));
        vm.unref(&page.id);
        vm.messages();
        assert!(!vm.page_slot.is_loaded(&page.id));
    }

    #[tokio::test]
    async fn apply_batch_summary_updates_page_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = VirtualMemory::new(test_config(tmp.path()), None);
        let page = compactor::make_page("raw", Lane::User, "a page label", "2026-01-01T00:00:00Z", &[]);
        vm.page_store.save(&page, "raw").unwrap();
        vm.pages.insert(page.id.clone(), page.clone());
        vm.apply_batch_summary(&page.id, "a batch-produced summary".to_string()).unwrap();
        assert_eq!(vm.pages.get(&page.id).unwrap().summary, "a batch-produced summary");
    }
}
