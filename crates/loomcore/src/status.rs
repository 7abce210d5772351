use serde::{Deserialize, Serialize};

/// Lifecycle of one node within a run. `Success`, `Error`, and `Skipped`
/// are terminal; a node reaches exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Error | NodeStatus::Skipped)
    }
}

/// Outcome of a whole run, computed once every node is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Completed,
    CompletedWithSkips,
    Failed,
}
