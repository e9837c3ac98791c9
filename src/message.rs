//! The abstract message record the core operates on.
//!
//! This is intentionally provider-agnostic — no wire format lives here.
//! `content` is plain text, and `tool_calls[*].function.arguments` is a
//! JSON string rather than a parsed value, so the core never depends on
//! any one provider's tool-call schema.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, not a parsed value — see module docs.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            from: None,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            importance: None,
            metadata: None,
        }
    }

    pub fn system(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
            ..Self::new(Role::System, content)
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

/// A `Message` tagged with a monotonic sequence number at insertion time.
///
/// Used to partition and rebuild the buffer by identity without relying on
/// value equality — see "Identity-based sets during buffer rebuild" in the
/// spec's design notes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub seq: u64,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_tool_calls_false_when_empty() {
        let msg = Message::new(Role::Assistant, "hi");
        assert!(!msg.has_tool_calls());
        let msg = Message {
            tool_calls: Some(vec![]),
            ..Message::new(Role::Assistant, "hi")
        };
        assert!(!msg.has_tool_calls());
    }

    #[test]
    fn has_tool_calls_true() {
        let msg = Message {
            tool_calls: Some(vec![ToolCall {
                id: "c1".into(),
                function: FunctionCall {
                    name: "sh".into(),
                    arguments: "{}".into(),
                },
            }]),
            ..Message::new(Role::Assistant, "hi")
        };
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn serde_round_trip() {
        let msg = Message::system("System", "you are an agent").with_importance(0.9);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content, msg.content);
        assert_eq!(back.importance, Some(0.9));
    }
}
