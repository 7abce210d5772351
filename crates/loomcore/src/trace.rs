use crate::NodeStatus;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Recorded timing/outcome/retry/cost data for one node execution.
/// Immutable once appended. Nodes inside a loop body append one trace per
/// iteration so provider usage in loops is fully accounted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTrace {
    pub node_id: String,
    pub spec_id: String,
    pub status: NodeStatus,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts beyond the first.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Ordered, append-only trace list shared between the top-level scheduler
/// and loop sub-executions.
#[derive(Clone, Default)]
pub struct TraceCollector {
    traces: Arc<Mutex<Vec<NodeTrace>>>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, trace: NodeTrace) {
        if let Ok(mut traces) = self.traces.lock() {
            traces.push(trace);
        }
    }

    /// Drain the collected traces in append order.
    pub fn take(&self) -> Vec<NodeTrace> {
        self.traces.lock().map(|mut t| std::mem::take(&mut *t)).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<NodeTrace> {
        self.traces.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

/// Current wall-clock in epoch milliseconds, the unit traces are stamped in.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
