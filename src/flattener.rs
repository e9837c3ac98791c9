//! Tool-pair flattener.
//!
//! After compaction a surviving `assistant` message may reference
//! `tool_call` ids whose matching `tool` results no longer exist (or vice
//! versa) — some providers reject this. This rewrites broken pairs into
//! plain summary message pairs carrying no `tool_calls` field.

use crate::message::{Message, Role};
use std::collections::{HashMap, HashSet};

const ARGS_TRUNC: usize = 200;
const RESULT_TRUNC: usize = 200;

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect::<String>() + "…"
    }
}

/// Flatten broken tool-call/result pairs in `buffer`, preserving message
/// order. Properly-split pairs pass through unchanged; un-split assistant
/// messages are replaced by a synthesised assistant+tool summary pair per
/// call; dangling orphan tool results with no matching assistant anywhere
/// are dropped.
pub fn flatten(buffer: &[Message]) -> Vec<Message> {
    let tool_results_by_id = collect_tool_results(buffer);
    let all_call_ids = collect_call_ids(buffer);

    let mut out = Vec::with_capacity(buffer.len());
    let mut consumed_tool_indices: HashSet<usize> = HashSet::new();
    let mut synthesized_ids: HashSet<String> = HashSet::new();
    let mut i = 0;

    while i < buffer.len() {
        let msg = &buffer[i];

        if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            let expected_ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
            let following_ids = consecutive_tool_ids_after(buffer, i, &consumed_tool_indices);

            let properly_split = expected_ids
                .iter()
                .all(|id| following_ids.iter().any(|(fid, _)| fid == id));

            if properly_split {
                out.push(msg.clone());
                for id in &expected_ids {
                    if let Some((_, idx)) = following_ids.iter().find(|(fid, _)| fid == id) {
                        out.push(buffer[*idx].clone());
                        consumed_tool_indices.insert(*idx);
                    }
                }
                i += 1;
                continue;
            }

            // Un-split: synthesise a summary pair per call.
            for call in calls {
                let result = tool_results_by_id
                    .get(call.id.as_str())
                    .cloned()
                    .unwrap_or_else(|| "[result truncated during compaction]".to_string());
                let content = format!(
                    "I called {}({}) → returned {}",
                    call.function.name,
                    truncate(&call.function.arguments, ARGS_TRUNC),
                    truncate(&result, RESULT_TRUNC)
                );
                let mut synthesised = Message::new(Role::Assistant, content);
                synthesised.metadata = Some(serde_json::json!({
                    "summarized_tool_call": {
                        "id": call.id,
                        "function": call.function.name,
                        "args": call.function.arguments,
                        "result": result,
                    }
                }));
                out.push(synthesised);

                let mut tool_msg = Message::new(Role::Tool, truncate(&result, RESULT_TRUNC));
                tool_msg.tool_call_id = Some(call.id.clone());
                tool_msg.name = Some(call.function.name.clone());
                out.push(tool_msg);
                synthesized_ids.insert(call.id.clone());
            }
            i += 1;
            continue;
        }

        if msg.role == Role::Tool {
            if consumed_tool_indices.contains(&i) {
                i += 1;
                continue;
            }
            let id = msg.tool_call_id.as_deref().unwrap_or("");
            if synthesized_ids.contains(id) {
                // Already folded into a synthesised pair above — this is
                // the original result that supplied that pair's content.
                i += 1;
                continue;
            }
            if !all_call_ids.contains(id) {
                // Dangling orphan: drop (logged by caller via tracing).
                tracing::debug!(tool_call_id = id, "dropping orphan tool result");
                i += 1;
                continue;
            }
            out.push(msg.clone());
            i += 1;
            continue;
        }

        out.push(msg.clone());
        i += 1;
    }

    out
}

fn collect_tool_results(buffer: &[Message]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for m in buffer {
        if m.role == Role::Tool {
            if let Some(id) = &m.tool_call_id {
                map.insert(id.clone(), m.content.clone());
            }
        }
    }
    map
}

fn collect_call_ids(buffer: &[Message]) -> HashSet<String> {
    let mut set = HashSet::new();
    for m in buffer {
        if let Some(calls) = &m.tool_calls {
            for c in calls {
                set.insert(c.id.clone());
            }
        }
    }
    set
}

/// Ids of `tool` messages consecutively following index `i`, stopping at
/// the first non-tool message, paired with their buffer index.
fn consecutive_tool_ids_after<'a>(
    buffer: &'a [Message],
    i: usize,
    already_consumed: &HashSet<usize>,
) -> Vec<(&'a str, usize)> {
    let mut out = Vec::new();
    let mut j = i + 1;
    while j < buffer.len() && buffer[j].role == Role::Tool {
        if !already_consumed.contains(&j) {
            if let Some(id) = &buffer[j].tool_call_id {
                out.push((id.as_str(), j));
            }
        }
        j += 1;
    }
    out
}

pub fn is_orphan_tool(msg: &Message, all_call_ids: &HashSet<String>) -> bool {
    msg.role == Role::Tool && msg.tool_call_id.as_ref().is_some_and(|id| !all_call_ids.contains(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FunctionCall, Message, Role, ToolCall};

    fn assistant_with_call(id: &str) -> Message {
        Message {
            tool_calls: Some(vec![ToolCall {
                id: id.to_string(),
                function: FunctionCall { name: "sh".into(), arguments: "{}".into() },
            }]),
            ..Message::new(Role::Assistant, "")
        }
    }

    fn tool_result(id: &str, content: &str) -> Message {
        let mut m = Message::new(Role::Tool, content);
        m.tool_call_id = Some(id.to_string());
        m
    }

    #[test]
    fn properly_split_pair_passes_through_unchanged() {
        let buf = vec![assistant_with_call("c1"), tool_result("c1", "ok")];
        let out = flatten(&buf);
        assert_eq!(out.len(), 2);
        assert!(out[0].has_tool_calls());
        assert_eq!(out[1].role, Role::Tool);
    }

    #[test]
    fn unsplit_assistant_is_synthesised_with_no_tool_calls() {
        let buf = vec![assistant_with_call("c7")];
        let out = flatten(&buf);
        assert_eq!(out.len(), 2);
        assert!(!out[0].has_tool_calls());
        assert_eq!(out[1].role, Role::Tool);
        assert_eq!(out[1].tool_call_id.as_deref(), Some("c7"));
        assert!(out[1].content.contains("truncated"));
    }

    #[test]
    fn dangling_orphan_tool_is_dropped() {
        let buf = vec![tool_result("c_orphan", "stray")];
        let out = flatten(&buf);
        assert!(out.is_empty());
    }

    #[test]
    fn flattener_dedup_scenario() {
        // assistant with tool_calls=[c7] but no matching tool immediately,
        // plus an orphan tool{tool_call_id:"c7"} later.
        let buf = vec![
            assistant_with_call("c7"),
            Message::new(Role::User, "unrelated"),
            tool_result("c7", "late result"),
        ];
        let out = flatten(&buf);
        assert!(!out[0].has_tool_calls());
        let tool_msgs: Vec<_> = out.iter().filter(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some("c7")).collect();
        assert_eq!(tool_msgs.len(), 1);
    }
}
