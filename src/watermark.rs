//! Watermark controller.
//!
//! Decides per-lane whether compaction should trigger, based on weighted
//! per-lane budgets derived from the total working-memory budget.

use crate::config::MemoryConfig;
use crate::lane::{Lane, LanePartition};
use crate::tokenizer::Tokenizer;

/// Per-lane decision: whether this lane is currently over its high
/// watermark and should page, plus the token budget it was measured
/// against.
#[derive(Debug, Clone, Copy)]
pub struct LaneDecision {
    pub lane: Lane,
    pub tokens: usize,
    pub budget: usize,
    pub should_page: bool,
}

/// Weighted share of `total_tokens` for a single lane:
/// `budget = total * weight / Σweights`.
fn lane_budget(total_tokens: usize, weight: u32, weight_sum: u32) -> usize {
    if weight_sum == 0 {
        return 0;
    }
    ((total_tokens as u64) * (weight as u64) / (weight_sum as u64)) as usize
}

/// Evaluate every lane against its weighted budget and the config's
/// effective high ratio. The tool lane never pages on its own — whenever
/// the assistant lane is over budget, the tool lane is forced to
/// over-budget too so paired tool output pages alongside its assistant
/// turn ("tool lane always compacts with assistant lane").
pub fn evaluate(partition: &LanePartition, config: &MemoryConfig, tok: &Tokenizer) -> Vec<LaneDecision> {
    let total = config.effective_working_memory_tokens();
    let weight_sum = config.assistant_weight + config.user_weight + config.system_weight + config.tool_weight;
    let high_ratio = config.effective_high_ratio();

    let lanes = [Lane::Assistant, Lane::User, Lane::System, Lane::Tool, Lane::Other];
    let mut decisions = Vec::with_capacity(lanes.len());

    let weight_of = |lane: Lane| -> u32 {
        match lane {
            Lane::Assistant => config.assistant_weight,
            Lane::User => config.user_weight,
            Lane::System => config.system_weight,
            Lane::Tool => config.tool_weight,
            Lane::Other => 0,
        }
    };

    for lane in lanes {
        let messages: Vec<_> = if lane == Lane::System {
            partition
                .system
                .iter()
                .enumerate()
                .filter(|(i, _)| Some(*i) != partition.first_system_index)
                .map(|(_, e)| e.message.clone())
                .collect()
        } else {
            partition.lane(lane).iter().map(|e| e.message.clone()).collect()
        };
        let tokens = tok.count_messages(&messages);
        let budget = lane_budget(total, weight_of(lane), weight_sum);
        let threshold = (budget as f32 * high_ratio) as usize;
        let should_page = tokens > threshold;
        decisions.push(LaneDecision {
            lane,
            tokens,
            budget,
            should_page,
        });
    }

    let assistant_over = decisions
        .iter()
        .find(|d| d.lane == Lane::Assistant)
        .map(|d| d.should_page)
        .unwrap_or(false);
    if assistant_over {
        if let Some(tool) = decisions.iter_mut().find(|d| d.lane == Lane::Tool) {
            tool.should_page = true;
        }
    }

    decisions
}

/// Fast-path check: true if no lane needs paging at all, letting callers
/// skip the rest of the compaction pipeline.
pub fn any_over_budget(decisions: &[LaneDecision]) -> bool {
    decisions.iter().any(|d| d.should_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Envelope, Message, Role};

    fn envs(n: usize, role: Role, content_len: usize) -> Vec<Envelope> {
        (0..n)
            .map(|i| Envelope {
                seq: i as u64,
                message: Message::new(role, "x".repeat(content_len)),
            })
            .collect()
    }

    #[test]
    fn under_budget_lane_does_not_page() {
        let cfg = MemoryConfig {
            pages_dir: "/tmp".into(),
            working_memory_tokens: 6000,
            ..MemoryConfig::default()
        };
        let tok = Tokenizer::default();
        let mut p = LanePartition::default();
        p.user = envs(2, Role::User, 10);
        let decisions = evaluate(&p, &cfg, &tok);
        let user = decisions.iter().find(|d| d.lane == Lane::User).unwrap();
        assert!(!user.should_page);
    }

    #[test]
    fn over_budget_lane_pages() {
        let cfg = MemoryConfig {
            pages_dir: "/tmp".into(),
            working_memory_tokens: 100,
            assistant_weight: 8,
            user_weight: 4,
            system_weight: 3,
            tool_weight: 1,
            ..MemoryConfig::default()
        };
        let tok = Tokenizer::default();
        let mut p = LanePartition::default();
        p.assistant = envs(50, Role::Assistant, 200);
        let decisions = evaluate(&p, &cfg, &tok);
        let assistant = decisions.iter().find(|d| d.lane == Lane::Assistant).unwrap();
        assert!(assistant.should_page);
    }

    #[test]
    fn tool_lane_forced_over_when_assistant_over() {
        let cfg = MemoryConfig {
            pages_dir: "/tmp".into(),
            working_memory_tokens: 100,
            ..MemoryConfig::default()
        };
        let tok = Tokenizer::default();
        let mut p = LanePartition::default();
        p.assistant = envs(50, Role::Assistant, 200);
        p.tool = envs(1, Role::Tool, 5);
        let decisions = evaluate(&p, &cfg, &tok);
        let tool = decisions.iter().find(|d| d.lane == Lane::Tool).unwrap();
        assert!(tool.should_page);
    }

    #[test]
    fn original_system_prompt_excluded_from_system_lane_tokens() {
        let cfg = MemoryConfig {
            pages_dir: "/tmp".into(),
            working_memory_tokens: 6000,
            ..MemoryConfig::default()
        };
        let tok = Tokenizer::default();
        let mut p = LanePartition::default();
        p.system = envs(1, Role::System, 10);
        p.first_system_index = Some(0);
        let decisions = evaluate(&p, &cfg, &tok);
        let system = decisions.iter().find(|d| d.lane == Lane::System).unwrap();
        assert_eq!(system.tokens, 0);
    }

    #[test]
    fn any_over_budget_false_when_all_clear() {
        let cfg = MemoryConfig {
            pages_dir: "/tmp".into(),
            working_memory_tokens: 6000,
            ..MemoryConfig::default()
        };
        let tok = Tokenizer::default();
        let p = LanePartition::default();
        let decisions = evaluate(&p, &cfg, &tok);
        assert!(!any_over_budget(&decisions));
    }
}
