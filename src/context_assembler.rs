//! Context assembler: resolves pending ref/unref, evicts pages,
//! then emits `[system prompt] + [loaded page slot] + [sanitised recent
//! window]`.

use crate::config::MemoryConfig;
use crate::message::{Envelope, Message, Role};
use crate::tokenizer::Tokenizer;

/// Build the recent window: walk non-system messages newest-to-oldest,
/// stop once the next message would exceed `working_memory_tokens` and
/// the window already holds at least `4 * min_recent_per_lane` items;
/// hard break at `2 * working_memory_tokens` regardless.
fn build_recent_window(buffer: &[Envelope], config: &MemoryConfig, tok: &Tokenizer) -> Vec<Message> {
    let budget = config.effective_working_memory_tokens();
    let hard_break = budget * 2;
    let min_items = 4 * config.min_recent_per_lane;

    let mut window: Vec<Message> = Vec::new();
    let mut tokens_so_far = 0usize;

    for env in buffer.iter().rev() {
        if env.message.role == Role::System {
            continue;
        }
        let cost = tok.count_message(&env.message);
        if tokens_so_far + cost > hard_break {
            break;
        }
        if tokens_so_far + cost > budget && window.len() >= min_items {
            break;
        }
        window.insert(0, env.message.clone());
        tokens_so_far += cost;
    }

    window
}

/// Front sanitise: drop leading `tool` messages and leading `assistant`
/// messages with tool_calls that lack a following `tool` reply.
fn front_sanitise(mut window: Vec<Message>) -> Vec<Message> {
    loop {
        match window.first() {
            Some(m) if m.role == Role::Tool => {
                window.remove(0);
            }
            Some(m) if m.has_tool_calls() => {
                let calls = m.tool_calls.as_ref().unwrap();
                let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
                let has_all_replies = ids.iter().all(|id| {
                    window
                        .iter()
                        .skip(1)
                        .any(|m2| m2.role == Role::Tool && m2.tool_call_id.as_deref() == Some(*id))
                });
                if has_all_replies {
                    break;
                }
                window.remove(0);
            }
            _ => break,
        }
    }
    window
}

/// Back sanitise: drop trailing `assistant` messages that still carry
/// `tool_calls` (their replies, if any, would be even later and already
/// excluded from the window).
fn back_sanitise(mut window: Vec<Message>) -> Vec<Message> {
    while window.last().is_some_and(|m| m.has_tool_calls()) {
        window.pop();
    }
    window
}

/// Hard-cap trim: if estimated tokens exceed `hard_cap_ceiling_multiplier
/// * working_memory_tokens`, remove oldest items — grouping an assistant
/// with its immediately-following tool replies — until under
/// `hard_cap_target_multiplier * working_memory_tokens`.
fn hard_cap_trim(mut window: Vec<Message>, config: &MemoryConfig, tok: &Tokenizer) -> Vec<Message> {
    let budget = config.effective_working_memory_tokens();
    let ceiling = budget * config.hard_cap_ceiling_multiplier;
    let target = budget * config.hard_cap_target_multiplier;

    let mut total = tok.count_messages(&window);
    if total <= ceiling {
        return window;
    }

    while total > target && !window.is_empty() {
        let mut group_len = 1;
        if window[0].has_tool_calls() {
            let ids: Vec<String> = window[0].tool_calls.as_ref().unwrap().iter().map(|c| c.id.clone()).collect();
            while group_len < window.len()
                && window[group_len].role == Role::Tool
                && window[group_len].tool_call_id.as_ref().is_some_and(|id| ids.contains(id))
            {
                group_len += 1;
            }
        }
        let removed: Vec<Message> = window.drain(..group_len).collect();
        total -= tok.count_messages(&removed);
    }

    window
}

/// Run the full recent-window pipeline: build, front-sanitise,
/// back-sanitise, hard-cap trim.
pub fn sanitised_recent_window(buffer: &[Envelope], config: &MemoryConfig, tok: &Tokenizer) -> Vec<Message> {
    let window = build_recent_window(buffer, config, tok);
    let window = front_sanitise(window);
    let window = back_sanitise(window);
    hard_cap_trim(window, config, tok)
}

/// One synthetic loaded-page message body.
pub fn loaded_page_message(id: &str, label: &str, content: &str) -> Message {
    Message::system(
        "VirtualMemory",
        format!("--- Loaded Page: {id} ({label}) ---\n{content}\n--- End Page: {id} ---"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FunctionCall, ToolCall};

    fn env(seq: u64, role: Role, content: &str) -> Envelope {
        Envelope { seq, message: Message::new(role, content) }
    }

    fn cfg() -> MemoryConfig {
        MemoryConfig { pages_dir: "/tmp".into(), working_memory_tokens: 1000, min_recent_per_lane: 2, ..MemoryConfig::default() }
    }

    #[test]
    fn recent_window_excludes_system_messages() {
        let buf = vec![env(0, Role::System, "sys"), env(1, Role::User, "hi")];
        let tok = Tokenizer::default();
        let window = build_recent_window(&buf, &cfg(), &tok);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].role, Role::User);
    }

    #[test]
    fn front_sanitise_drops_leading_orphan_tool() {
        let mut tool_msg = Message::new(Role::Tool, "result");
        tool_msg.tool_call_id = Some("c1".into());
        let window = vec![tool_msg, Message::new(Role::User, "hi")];
        let out = front_sanitise(window);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
    }

    #[test]
    fn front_sanitise_keeps_assistant_with_matching_reply() {
        let assistant = Message {
            tool_calls: Some(vec![ToolCall { id: "c1".into(), function: FunctionCall { name: "sh".into(), arguments: "{}".into() } }]),
            ..Message::new(Role::Assistant, "")
        };
        let mut tool_msg = Message::new(Role::Tool, "ok");
        tool_msg.tool_call_id = Some("c1".into());
        let window = vec![assistant, tool_msg];
        let out = front_sanitise(window);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn back_sanitise_drops_trailing_unfinished_tool_calls() {
        let assistant = Message {
            tool_calls: Some(vec![ToolCall { id: "c1".into(), function: FunctionCall { name: "sh".into(), arguments: "{}".into() } }]),
            ..Message::new(Role::Assistant, "")
        };
        let window = vec![Message::new(Role::User, "hi"), assistant];
        let out = back_sanitise(window);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
    }

    #[test]
    fn hard_cap_trim_noop_under_ceiling() {
        let window = vec![Message::new(Role::User, "short")];
        let tok = Tokenizer::default();
        let out = hard_cap_trim(window.clone(), &cfg(), &tok);
        assert_eq!(out.len(), window.len());
    }

    #[test]
    fn hard_cap_trim_removes_oldest_over_ceiling() {
        let tok = Tokenizer::default();
        let config = cfg();
        let big = "x".repeat(20_000);
        let window: Vec<Message> = (0..10).map(|_| Message::new(Role::User, big.clone())).collect();
        let out = hard_cap_trim(window, &config, &tok);
        assert!(tok.count_messages(&out) <= config.effective_working_memory_tokens() * config.hard_cap_target_multiplier || out.is_empty());
    }
}
