//! Engine configuration.
//!
//! Every tunable the paging engine exposes: token budgets, lane weights,
//! watermark ratios, and the optional batch-summarisation/phantom-
//! compaction toggles. The crate never touches `std::env` or reads a
//! config file path itself —
//! callers build a `MemoryConfig` (or load one from TOML with
//! [`MemoryConfig::from_toml`]) and hand it to [`crate::memory::VirtualMemory::new`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub pages_dir: PathBuf,

    #[serde(default = "default_page_slot_tokens")]
    pub page_slot_tokens: usize,

    #[serde(default = "default_working_memory_tokens")]
    pub working_memory_tokens: usize,

    #[serde(default = "default_assistant_weight")]
    pub assistant_weight: u32,
    #[serde(default = "default_user_weight")]
    pub user_weight: u32,
    #[serde(default = "default_system_weight")]
    pub system_weight: u32,
    #[serde(default = "default_tool_weight")]
    pub tool_weight: u32,

    #[serde(default = "default_avg_chars_per_token")]
    pub avg_chars_per_token: f32,

    #[serde(default = "default_min_recent_per_lane")]
    pub min_recent_per_lane: usize,

    #[serde(default = "default_high_ratio")]
    pub high_ratio: f32,
    #[serde(default = "default_low_ratio")]
    pub low_ratio: f32,

    #[serde(default)]
    pub summariser_model: Option<String>,

    #[serde(default)]
    pub enable_batch_summarisation: bool,

    #[serde(default)]
    pub enable_phantom_compaction: bool,

    #[serde(default)]
    pub queue_path: Option<PathBuf>,

    #[serde(default = "default_session_id")]
    pub session_id: String,

    /// Optional thinking-budget scalar fed into the watermark controller's
    /// `effective_high`/`working_memory_tokens` scaling. `None` means
    /// the unscaled defaults apply.
    #[serde(default)]
    pub thinking_budget: Option<f32>,

    /// Dedup threshold for semantic search.
    #[serde(default = "default_dedup_threshold")]
    pub search_dedup_threshold: f32,

    /// Hard-cap trim ceiling/target multipliers — kept configurable rather
    /// than hardcoded, since they are tuned constants rather than
    /// principled derivations.
    #[serde(default = "default_hard_cap_ceiling_multiplier")]
    pub hard_cap_ceiling_multiplier: usize,
    #[serde(default = "default_hard_cap_target_multiplier")]
    pub hard_cap_target_multiplier: usize,
}

fn default_page_slot_tokens() -> usize {
    6000
}
fn default_working_memory_tokens() -> usize {
    6000
}
fn default_assistant_weight() -> u32 {
    8
}
fn default_user_weight() -> u32 {
    4
}
fn default_system_weight() -> u32 {
    3
}
fn default_tool_weight() -> u32 {
    1
}
fn default_avg_chars_per_token() -> f32 {
    2.8
}
fn default_min_recent_per_lane() -> usize {
    4
}
fn default_high_ratio() -> f32 {
    0.75
}
fn default_low_ratio() -> f32 {
    0.50
}
fn default_session_id() -> String {
    "default".to_string()
}
fn default_dedup_threshold() -> f32 {
    0.9
}
fn default_hard_cap_ceiling_multiplier() -> usize {
    4
}
fn default_hard_cap_target_multiplier() -> usize {
    2
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pages_dir: PathBuf::from("./vmem-pages"),
            page_slot_tokens: default_page_slot_tokens(),
            working_memory_tokens: default_working_memory_tokens(),
            assistant_weight: default_assistant_weight(),
            user_weight: default_user_weight(),
            system_weight: default_system_weight(),
            tool_weight: default_tool_weight(),
            avg_chars_per_token: default_avg_chars_per_token(),
            min_recent_per_lane: default_min_recent_per_lane(),
            high_ratio: default_high_ratio(),
            low_ratio: default_low_ratio(),
            summariser_model: None,
            enable_batch_summarisation: false,
            enable_phantom_compaction: false,
            queue_path: None,
            session_id: default_session_id(),
            thinking_budget: None,
            search_dedup_threshold: default_dedup_threshold(),
            hard_cap_ceiling_multiplier: default_hard_cap_ceiling_multiplier(),
            hard_cap_target_multiplier: default_hard_cap_target_multiplier(),
        }
    }
}

impl MemoryConfig {
    /// Load a config from a TOML document. `pages_dir` has no default and
    /// must be present in the document.
    pub fn from_toml(raw: &str) -> Result<Self, crate::error::EngineError> {
        toml::from_str(raw).map_err(|e| crate::error::EngineError::Config(e.to_string()))
    }

    /// `effective_high = min(0.95, base_high * (0.75 + budget*0.5))`, scaled
    /// by the optional thinking-budget input.
    pub fn effective_high_ratio(&self) -> f32 {
        match self.thinking_budget {
            Some(budget) => (self.high_ratio * (0.75 + budget * 0.5)).min(0.95),
            None => self.high_ratio,
        }
    }

    /// `working_memory_tokens` scaled by `0.6 + budget`.
    pub fn effective_working_memory_tokens(&self) -> usize {
        match self.thinking_budget {
            Some(budget) => ((self.working_memory_tokens as f32) * (0.6 + budget)) as usize,
            None => self.working_memory_tokens,
        }
    }

    pub fn session_dir(&self) -> PathBuf {
        self.pages_dir.join(&self.session_id)
    }

    pub fn queue_file_path(&self) -> PathBuf {
        self.queue_path
            .clone()
            .unwrap_or_else(|| self.session_dir().join("summary_queue.jsonl"))
    }
}
