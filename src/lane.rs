//! Lane partitioner.
//!
//! Single linear scan, stable within lane, O(n) in buffer length.

use crate::message::{Envelope, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Assistant,
    User,
    System,
    Tool,
    Other,
}

impl Lane {
    pub fn of(role: Role) -> Self {
        match role {
            Role::Assistant => Lane::Assistant,
            Role::User => Lane::User,
            Role::System => Lane::System,
            Role::Tool => Lane::Tool,
            Role::Other => Lane::Other,
        }
    }
}

/// The result of partitioning a buffer by lane. `first_system_index` is the
/// index (in the original buffer) of the original system prompt, if found
/// among the `system` lane's entries — the compactor uses it to protect
/// that entry from paging, since it must never be dropped or rewritten.
#[derive(Debug, Default)]
pub struct LanePartition {
    pub first_system_index: Option<usize>,
    pub assistant: Vec<Envelope>,
    pub user: Vec<Envelope>,
    pub system: Vec<Envelope>,
    pub tool: Vec<Envelope>,
    pub other: Vec<Envelope>,
}

impl LanePartition {
    pub fn lane(&self, lane: Lane) -> &[Envelope] {
        match lane {
            Lane::Assistant => &self.assistant,
            Lane::User => &self.user,
            Lane::System => &self.system,
            Lane::Tool => &self.tool,
            Lane::Other => &self.other,
        }
    }

    pub fn lane_mut(&mut self, lane: Lane) -> &mut Vec<Envelope> {
        match lane {
            Lane::Assistant => &mut self.assistant,
            Lane::User => &mut self.user,
            Lane::System => &mut self.system,
            Lane::Tool => &mut self.tool,
            Lane::Other => &mut self.other,
        }
    }
}

/// Partition a buffer into lanes, preserving order within each lane.
pub fn partition(buffer: &[Envelope]) -> LanePartition {
    let mut out = LanePartition::default();
    for env in buffer {
        match env.message.role {
            Role::Assistant => out.assistant.push(env.clone()),
            Role::User => out.user.push(env.clone()),
            Role::System => {
                if out.first_system_index.is_none() {
                    out.first_system_index = Some(out.system.len());
                }
                out.system.push(env.clone());
            }
            Role::Tool => out.tool.push(env.clone()),
            Role::Other => out.other.push(env.clone()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn env(seq: u64, role: Role) -> Envelope {
        Envelope {
            seq,
            message: Message::new(role, format!("msg-{seq}")),
        }
    }

    #[test]
    fn partitions_preserve_order() {
        let buf = vec![
            env(0, Role::System),
            env(1, Role::User),
            env(2, Role::Assistant),
            env(3, Role::Tool),
            env(4, Role::User),
        ];
        let p = partition(&buf);
        assert_eq!(p.user.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(p.assistant.len(), 1);
        assert_eq!(p.tool.len(), 1);
        assert_eq!(p.first_system_index, Some(0));
    }

    #[test]
    fn empty_buffer_yields_empty_lanes() {
        let p = partition(&[]);
        assert!(p.assistant.is_empty());
        assert!(p.first_system_index.is_none());
    }
}
