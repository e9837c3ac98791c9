//! Engine metrics.
//!
//! Live, in-process counters only — no durable JSONL sink. The exposed
//! surface is `get_stats() -> MemoryStats`, a point-in-time snapshot, not
//! a log of individual task records.

use crate::lane::Lane;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub pages_created: u64,
    pub pages_evicted: u64,
    pub pages_reloaded: u64,
    pub ref_hits: u64,
    pub ref_misses: u64,
    pub compactions_run: u64,
    pub messages_paged: u64,
    pub messages_retained: u64,
    pub per_lane_retained: HashMap<String, u64>,
}

impl MemoryStats {
    pub fn miss_rate(&self) -> f32 {
        let total = self.ref_hits + self.ref_misses;
        if total == 0 {
            0.0
        } else {
            self.ref_misses as f32 / total as f32
        }
    }

    /// Ratio of messages turned into pages vs. messages retained in the
    /// live buffer — a rough proxy for how much the engine has compressed
    /// the session so far.
    pub fn compression_ratio(&self) -> f32 {
        let total = self.messages_paged + self.messages_retained;
        if total == 0 {
            0.0
        } else {
            self.messages_paged as f32 / total as f32
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    stats: MemoryStats,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_created(&mut self, _id: &str, lane: Lane, _tokens: usize) {
        self.stats.pages_created += 1;
        *self.stats.per_lane_retained.entry(lane_key(lane)).or_insert(0) += 0;
    }

    pub fn page_evicted(&mut self, _id: &str) {
        self.stats.pages_evicted += 1;
    }

    pub fn page_reloaded(&mut self, _id: &str) {
        self.stats.pages_reloaded += 1;
    }

    pub fn ref_hit(&mut self) {
        self.stats.ref_hits += 1;
    }

    pub fn ref_miss(&mut self) {
        self.stats.ref_misses += 1;
    }

    pub fn compaction_run(&mut self) {
        self.stats.compactions_run += 1;
    }

    pub fn record_retention(&mut self, lane: Lane, paged: usize, retained: usize) {
        self.stats.messages_paged += paged as u64;
        self.stats.messages_retained += retained as u64;
        *self.stats.per_lane_retained.entry(lane_key(lane)).or_insert(0) += retained as u64;
    }

    pub fn snapshot(&self) -> MemoryStats {
        self.stats.clone()
    }
}

fn lane_key(lane: Lane) -> String {
    match lane {
        Lane::Assistant => "assistant",
        Lane::User => "user",
        Lane::System => "system",
        Lane::Tool => "tool",
        Lane::Other => "other",
    }
    .to_string()
}
