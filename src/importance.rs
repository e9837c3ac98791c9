//! Importance partitioner.
//!
//! Within a lane, splits into `older` (pageable) and `keep` (tail +
//! promoted-by-importance). Guarantees that a message with
//! `importance >= 0.7` is never silently dropped by paging — it either
//! stays in the buffer or ends up inside a written page.

use crate::message::Envelope;

pub const PROMOTION_THRESHOLD: f32 = 0.7;

pub struct ImportanceSplit {
    pub older: Vec<Envelope>,
    pub keep: Vec<Envelope>,
}

/// Partition a lane into `older` (candidates for paging) and `keep`.
///
/// If `should_page` is false, everything is kept. Otherwise the first
/// `|lane| - tail` entries are candidates; among those, anything with
/// `importance >= 0.7` is promoted back into `keep` rather than paged.
pub fn partition(lane: &[Envelope], tail: usize, should_page: bool) -> ImportanceSplit {
    if !should_page {
        return ImportanceSplit {
            older: Vec::new(),
            keep: lane.to_vec(),
        };
    }

    let cutoff = lane.len().saturating_sub(tail);
    let candidates = &lane[..cutoff];
    let tail_slice = &lane[cutoff..];

    let mut older = Vec::new();
    let mut promoted = Vec::new();
    for env in candidates {
        let importance = env.message.importance.unwrap_or(0.0);
        if importance < PROMOTION_THRESHOLD {
            older.push(env.clone());
        } else {
            promoted.push(env.clone());
        }
    }

    let mut keep = promoted;
    keep.extend(tail_slice.iter().cloned());

    ImportanceSplit { older, keep }
}
