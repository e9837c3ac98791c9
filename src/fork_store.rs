//! Fork/snapshot store.
//!
//! Every compaction entry snapshots the current buffer before mutating
//! it, so a pre-compaction state can always be recovered. Forks form a
//! singly-linked chain via `parent_id`; the chain is append-only during a
//! session, and pruning only ever drops trailing-oldest entries by age.

use crate::error::{EngineError, EngineResult};
use crate::message::{Envelope, Message};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkReason {
    Manual,
    Watermark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneCounts {
    pub assistant: usize,
    pub user: usize,
    pub system: usize,
    pub tool: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub timestamp: i64,
    pub tokens: usize,
    pub message_count: usize,
    pub reason: ForkReason,
    pub lanes: LaneCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fork {
    #[serde(flatten)]
    pub meta: ForkMeta,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ForkChainFile {
    forks: Vec<ForkMeta>,
    updated_at: String,
}

/// `fork_{unix_ms}_{sha256(first 500 chars of each message concatenated)[0..8]}`.
pub fn fork_id(timestamp_ms: i64, messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for m in messages {
        let prefix: String = m.content.chars().take(500).collect();
        hasher.update(prefix.as_bytes());
    }
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("fork_{timestamp_ms}_{}", &hex[..8])
}

pub struct ForkStore {
    dir: PathBuf,
}

impl ForkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn chain_path(&self) -> PathBuf {
        self.dir.join("forks.json")
    }

    /// Snapshot `buffer` as a new fork, append its payload and metadata,
    /// and link it as a child of the current chain tail.
    pub fn snapshot(
        &self,
        buffer: &[Envelope],
        timestamp_ms: i64,
        reason: ForkReason,
        lanes: LaneCounts,
        tokens: usize,
    ) -> EngineResult<ForkMeta> {
        fs::create_dir_all(&self.dir)?;
        let messages: Vec<Message> = buffer.iter().map(|e| e.message.clone()).collect();
        let id = fork_id(timestamp_ms, &messages);
        let mut chain = self.load_chain();
        let parent_id = chain.forks.last().map(|f| f.id.clone());

        let meta = ForkMeta {
            id: id.clone(),
            parent_id,
            timestamp: timestamp_ms,
            tokens,
            message_count: messages.len(),
            reason,
            lanes,
        };
        let fork = Fork {
            meta: meta.clone(),
            messages,
        };

        let body = serde_json::to_string_pretty(&fork)?;
        fs::write(self.payload_path(&id), body)?;

        chain.forks.push(meta.clone());
        self.persist_chain(&chain)?;

        Ok(meta)
    }

    fn load_chain(&self) -> ForkChainFile {
        match fs::read_to_string(self.chain_path()) {
            Ok(body) => serde_json::from_str(&body).unwrap_or_default(),
            Err(_) => ForkChainFile::default(),
        }
    }

    fn persist_chain(&self, chain: &ForkChainFile) -> EngineResult<()> {
        let body = serde_json::to_string_pretty(chain)?;
        let staging = self.dir.join("forks.json.tmp");
        fs::write(&staging, &body)?;
        fs::rename(&staging, self.chain_path())?;
        Ok(())
    }

    pub fn history(&self) -> Vec<ForkMeta> {
        self.load_chain().forks
    }

    /// Load a fork payload by id, or the latest fork if `id` is `None`.
    pub fn load(&self, id: Option<&str>) -> Option<Fork> {
        let target = match id {
            Some(id) => id.to_string(),
            None => self.load_chain().forks.last()?.id.clone(),
        };
        let body = fs::read_to_string(self.payload_path(&target)).ok()?;
        serde_json::from_str(&body).ok()
    }

    /// Drop fork entries (and payloads) older than `max_age_secs`, keeping
    /// the chain append-only otherwise. The new
    /// head's `parent_id` is rewritten to `None` — this loses genealogy
    /// for the pruned span by design, not a bug.
    pub fn prune_older_than(&self, now_ms: i64, max_age_secs: i64) -> EngineResult<()> {
        let mut chain = self.load_chain();
        let cutoff_ms = now_ms - max_age_secs * 1000;
        let keep_from = chain.forks.iter().position(|f| f.timestamp >= cutoff_ms);
        let keep_from = match keep_from {
            Some(i) => i,
            None => chain.forks.len(),
        };
        for pruned in &chain.forks[..keep_from] {
            let _ = fs::remove_file(self.payload_path(&pruned.id));
        }
        chain.forks.drain(..keep_from);
        if let Some(first) = chain.forks.first_mut() {
            first.parent_id = None;
        }
        self.persist_chain(&chain)
    }
}

/// Build a page-sized transcript from a fork's non-system messages, for
/// `recall_fork` to hand to the page-creation path.
pub fn fork_non_system_transcript(fork: &Fork) -> String {
    fork.messages
        .iter()
        .filter(|m| m.role != crate::message::Role::System)
        .map(|m| format!("[{} ({})]: {}", m.role.as_str(), m.from.as_deref().unwrap_or(""), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn not_found(id: &str) -> EngineError {
    EngineError::ForkNotFound(id.to_string())
}
