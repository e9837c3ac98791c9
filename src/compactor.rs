//! Compactor: the coordination core. Snapshots a fork, partitions
//! by lane then by importance, pages the `older` side of each lane,
//! rebuilds the buffer preserving concurrently-added messages by
//! identity, then flattens broken tool pairs.

use crate::config::MemoryConfig;
use crate::fork_store::{ForkReason, ForkStore, LaneCounts};
use crate::importance::{self, ImportanceSplit};
use crate::lane::{self, Lane, LanePartition};
use crate::message::{Envelope, Message, Role};
use crate::page::Page;
use crate::tokenizer::Tokenizer;
use crate::watermark::{self, LaneDecision};
use std::collections::HashSet;

/// One lane's pageable slice plus the identity set of everything that
/// lane is keeping, built before any paging decision mutates state.
pub struct LaneOutcome {
    pub lane: Lane,
    pub older: Vec<Envelope>,
    pub keep: Vec<Envelope>,
}

/// Partition every should-page lane into older/keep. Lanes that are not
/// over budget keep everything. The original system prompt entry is
/// excluded from the system lane's pageable set — it must never be
/// paged — and is re-prepended by the caller as `sys_head`.
pub fn partition_lanes(
    partition: &LanePartition,
    decisions: &[LaneDecision],
    config: &MemoryConfig,
    force: bool,
) -> Vec<LaneOutcome> {
    let lanes = [Lane::Assistant, Lane::User, Lane::System, Lane::Tool, Lane::Other];
    let mut out = Vec::with_capacity(lanes.len());

    for l in lanes {
        let should_page = if force {
            partition.lane(l).len() > config.min_recent_per_lane
        } else {
            decisions.iter().find(|d| d.lane == l).map(|d| d.should_page).unwrap_or(false)
        };

        let slice = if l == Lane::System {
            protect_first_system(partition)
        } else {
            partition.lane(l).to_vec()
        };

        let ImportanceSplit { older, keep } = importance::partition(&slice, config.min_recent_per_lane, should_page);
        out.push(LaneOutcome { lane: l, older, keep });
    }

    out
}

fn protect_first_system(partition: &LanePartition) -> Vec<Envelope> {
    match partition.first_system_index {
        Some(idx) => partition
            .system
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, e)| e.clone())
            .collect(),
        None => partition.system.to_vec(),
    }
}

fn original_system_prompt(partition: &LanePartition) -> Option<Envelope> {
    partition.first_system_index.map(|idx| partition.system[idx].clone())
}

/// Build the raw transcript for page content: `[<role> (<from>)]:
/// <content[..8000]>` joined with blank lines.
pub fn build_raw_transcript(messages: &[Envelope]) -> String {
    messages
        .iter()
        .map(|e| {
            let content: String = e.message.content.chars().take(8000).collect();
            format!("[{} ({})]: {}", e.message.role.as_str(), e.message.from.as_deref().unwrap_or(""), content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn max_importance(messages: &[Envelope]) -> f32 {
    messages.iter().filter_map(|e| e.message.importance).fold(0.0, f32::max)
}

/// The lane-tagged summary message produced for a lane whose `older` set
/// was paged.
pub fn summary_message(lane: Lane, summary_text: &str) -> Message {
    let role = match lane {
        Lane::Assistant => Role::Assistant,
        Lane::User => Role::User,
        Lane::System | Lane::Tool | Lane::Other => Role::System,
    };
    let tag = match lane {
        Lane::Assistant => "ASSISTANT",
        Lane::User => "USER",
        Lane::System => "SYSTEM",
        Lane::Tool => "TOOL",
        Lane::Other => "OTHER",
    };
    Message {
        from: Some("VirtualMemory".to_string()),
        ..Message::new(role, format!("{tag} LANE SUMMARY:\n{summary_text}"))
    }
}

/// Rebuild the full buffer after per-lane paging decisions:
/// the kept set is identity-based (by sequence number) so any message
/// added concurrently during summarisation — absent from every lane
/// partition output — survives untouched. `sys_head`, when present, is
/// placed first unconditionally — ahead of the lane summaries — so the
/// original system prompt never loses its first-position invariant once
/// any lane summary exists.
pub fn rebuild_buffer(
    original: &[Envelope],
    sys_head: Option<&Envelope>,
    outcomes: &[LaneOutcome],
    summary_messages: Vec<Message>,
) -> Vec<Envelope> {
    let mut kept: HashSet<u64> = HashSet::new();
    if let Some(sys) = sys_head {
        kept.insert(sys.seq);
    }
    let mut partitioned_seqs: HashSet<u64> = HashSet::new();
    for outcome in outcomes {
        for e in &outcome.keep {
            kept.insert(e.seq);
        }
        for e in &outcome.older {
            partitioned_seqs.insert(e.seq);
        }
        for e in &outcome.keep {
            partitioned_seqs.insert(e.seq);
        }
    }
    if let Some(sys) = sys_head {
        partitioned_seqs.insert(sys.seq);
    }

    let rest: Vec<Envelope> = original
        .iter()
        .filter(|e| sys_head.map_or(true, |sys| e.seq != sys.seq))
        .filter(|e| kept.contains(&e.seq) || !partitioned_seqs.contains(&e.seq))
        .cloned()
        .collect();

    let mut out = Vec::with_capacity(1 + summary_messages.len() + rest.len());
    if let Some(sys) = sys_head {
        out.push(sys.clone());
    }
    out.extend(
        summary_messages
            .into_iter()
            .enumerate()
            .map(|(i, m)| Envelope { seq: u64::MAX - i as u64, message: m }),
    );
    out.extend(rest);
    out
}

pub fn snapshot_for_fork(partition: &LanePartition) -> LaneCounts {
    LaneCounts {
        assistant: partition.assistant.len(),
        user: partition.user.len(),
        system: partition.system.len(),
        tool: partition.tool.len(),
    }
}

/// Run fork snapshot, lane/importance partition, and page creation,
/// returning per-lane `older` sets still needing a summary plus the
/// rebuilt buffer skeleton (summaries are filled in by the caller, since
/// summarisation may be async and this function stays synchronous).
pub fn run_partition_phase(
    buffer: &[Envelope],
    config: &MemoryConfig,
    tok: &Tokenizer,
    force: bool,
) -> (LanePartition, Vec<LaneDecision>, Vec<LaneOutcome>, Option<Envelope>) {
    let partition = lane::partition(buffer);
    let decisions = watermark::evaluate(&partition, config, tok);
    let outcomes = partition_lanes(&partition, &decisions, config, force);
    let sys_head = original_system_prompt(&partition);
    (partition, decisions, outcomes, sys_head)
}

pub fn take_fork_snapshot(
    fork_store: &ForkStore,
    buffer: &[Envelope],
    timestamp_ms: i64,
    reason: ForkReason,
    partition: &LanePartition,
    tok: &Tokenizer,
) -> crate::error::EngineResult<()> {
    let messages: Vec<Message> = buffer.iter().map(|e| e.message.clone()).collect();
    let tokens = tok.count_messages(&messages);
    fork_store.snapshot(buffer, timestamp_ms, reason, snapshot_for_fork(partition), tokens)?;
    Ok(())
}

pub fn make_page(raw: &str, lane: Lane, label: &str, created_at: &str, source: &[Envelope]) -> Page {
    let messages: Vec<Message> = source.iter().map(|e| e.message.clone()).collect();
    let tokens = Tokenizer::default().count_messages(&messages);
    Page::new(raw, lane, label, "", created_at, source.len(), max_importance(source), tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, Message, Role};

    fn env(seq: u64, role: Role, content: &str) -> Envelope {
        Envelope { seq, message: Message::new(role, content) }
    }

    #[test]
    fn protect_first_system_excludes_original_prompt() {
        let mut p = LanePartition::default();
        p.system = vec![env(0, Role::System, "sys"), env(1, Role::System, "extra")];
        p.first_system_index = Some(0);
        let protected = protect_first_system(&p);
        assert_eq!(protected.len(), 1);
        assert_eq!(protected[0].seq, 1);
    }

    #[test]
    fn rebuild_preserves_concurrently_added_message() {
        let original = vec![env(0, Role::System, "sys"), env(1, Role::User, "a"), env(2, Role::User, "b (concurrent)")];
        let sys_head = Some(original[0].clone());
        let outcomes = vec![LaneOutcome {
            lane: Lane::User,
            older: vec![original[1].clone()],
            keep: vec![],
        }];
        // seq=2 never appears in any outcome's older/keep — simulating a
        // message added concurrently during summarisation.
        let rebuilt = rebuild_buffer(&original, sys_head.as_ref(), &outcomes, vec![]);
        assert!(rebuilt.iter().any(|e| e.seq == 2));
        assert!(!rebuilt.iter().any(|e| e.seq == 1));
        assert!(rebuilt.iter().any(|e| e.seq == 0));
    }

    #[test]
    fn summary_messages_prepended_in_stable_order() {
        let original = vec![env(0, Role::User, "a")];
        let outcomes: Vec<LaneOutcome> = vec![];
        let summaries = vec![
            summary_message(Lane::Assistant, "assistant summary"),
            summary_message(Lane::User, "user summary"),
        ];
        let rebuilt = rebuild_buffer(&original, None, &outcomes, summaries);
        assert_eq!(rebuilt[0].message.content, "ASSISTANT LANE SUMMARY:\nassistant summary");
        assert_eq!(rebuilt[1].message.content, "USER LANE SUMMARY:\nuser summary");
    }

    #[test]
    fn sys_head_stays_first_ahead_of_lane_summaries() {
        let original = vec![env(0, Role::System, "sys"), env(1, Role::User, "a")];
        let sys_head = Some(original[0].clone());
        let outcomes = vec![LaneOutcome {
            lane: Lane::User,
            older: vec![original[1].clone()],
            keep: vec![],
        }];
        let summaries = vec![summary_message(Lane::User, "user summary")];
        let rebuilt = rebuild_buffer(&original, sys_head.as_ref(), &outcomes, summaries);
        assert_eq!(rebuilt[0].message.role, Role::System);
        assert_eq!(rebuilt[0].message.content, "sys");
        assert!(rebuilt[1].message.content.starts_with("USER LANE SUMMARY"));
    }
}
