//! Token estimator.
//!
//! `tokens(msgs) = ceil( Σ (len(content)+32 + Σ_toolcall (len(name)+len(args)+32)) / chars_per_token )`.
//! No per-message cap: truncating per-message character counts before
//! dividing would under-estimate large tool outputs badly (a 300 KB tool
//! result would price out at ≈8K tokens instead of the ≈107K it actually
//! costs), so every byte of content is counted here.

use crate::message::Message;

#[derive(Debug, Clone, Copy)]
pub struct Tokenizer {
    chars_per_token: f32,
}

impl Tokenizer {
    pub fn new(chars_per_token: f32) -> Self {
        Self { chars_per_token }
    }

    /// Character cost of a single message, including any attached tool
    /// calls — pre-division, so callers summing across many messages can
    /// apply `ceil` once over the total rather than once per message.
    fn message_chars(msg: &Message) -> usize {
        let mut chars = msg.content.chars().count() + 32;
        if let Some(tool_calls) = &msg.tool_calls {
            for call in tool_calls {
                chars += call.function.name.chars().count()
                    + call.function.arguments.chars().count()
                    + 32;
            }
        }
        chars
    }

    /// Estimate the token cost of a single message, including any attached
    /// tool calls.
    pub fn count_message(&self, msg: &Message) -> usize {
        self.chars_to_tokens(Self::message_chars(msg))
    }

    /// Estimate the total token cost of a slice of messages: sum the raw
    /// character cost across every message first, then apply `ceil`
    /// division once over the total — matching the reference formula
    /// literally rather than compounding per-message rounding.
    pub fn count_messages(&self, msgs: &[Message]) -> usize {
        let total_chars: usize = msgs.iter().map(Self::message_chars).sum();
        self.chars_to_tokens(total_chars)
    }

    fn chars_to_tokens(&self, chars: usize) -> usize {
        (chars as f32 / self.chars_per_token).ceil() as usize
    }

    pub fn count_text(&self, text: &str) -> usize {
        self.chars_to_tokens(text.chars().count() + 32)
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(2.8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FunctionCall, Role, ToolCall};

    #[test]
    fn counts_plain_content() {
        let tok = Tokenizer::new(2.8);
        let msg = Message::new(Role::User, "hello world");
        let chars = "hello world".chars().count() + 32;
        let expected = (chars as f32 / 2.8).ceil() as usize;
        assert_eq!(tok.count_message(&msg), expected);
    }

    #[test]
    fn counts_full_tool_output_no_cap() {
        // 300 KB tool output must not be truncated to a small per-message cap.
        let tok = Tokenizer::new(2.8);
        let big = "x".repeat(300_000);
        let msg = Message {
            tool_calls: Some(vec![ToolCall {
                id: "c1".into(),
                function: FunctionCall {
                    name: "read_file".into(),
                    arguments: big.clone(),
                },
            }]),
            ..Message::new(Role::Assistant, "")
        };
        let tokens = tok.count_message(&msg);
        // ~300000/2.8 ≈ 107142, must be in that ballpark, not ~8000.
        assert!(tokens > 100_000, "got {tokens}, expected >100000");
    }

    #[test]
    fn empty_message_has_overhead_only() {
        let tok = Tokenizer::new(2.8);
        let msg = Message::new(Role::System, "");
        assert_eq!(tok.count_message(&msg), (32f32 / 2.8).ceil() as usize);
    }
}
