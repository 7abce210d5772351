use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node ids are caller-supplied strings, unique within one graph.
pub type NodeId = String;

/// Default output port, used when an edge names no `sourceHandle`.
pub const PORT_OUTPUT: &str = "output";
/// Default input port, used when an edge names no `targetHandle`.
pub const PORT_INPUT: &str = "input";
/// Condition routing ports.
pub const PORT_TRUE: &str = "true";
pub const PORT_FALSE: &str = "false";
/// Ports a loop node exposes to its body scope.
pub const PORT_ITEM: &str = "item";
pub const PORT_INDEX: &str = "index";

/// Spec ids the engine itself gives meaning to: input/output nodes anchor
/// the run's boundary values and loop/loop-end delimit a repeated scope.
pub const SPEC_INPUT: &str = "input";
pub const SPEC_OUTPUT: &str = "output";
pub const SPEC_LOOP: &str = "loop";
pub const SPEC_LOOP_END: &str = "loop-end";

/// Reserved input-map key prefix for caller-injected credentials.
const CREDENTIAL_PREFIX: &str = "__credential__";

/// The reserved input-map key carrying the credential for one node.
pub fn credential_key(node_id: &str) -> String {
    format!("{CREDENTIAL_PREFIX}{node_id}")
}

/// Whether an input-map key is a reserved credential entry.
pub fn is_credential_key(key: &str) -> bool {
    key.starts_with(CREDENTIAL_PREFIX)
}

/// One automation graph as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<Edge>,
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.edges.push(Edge {
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        });
    }

    pub fn connect_ports(
        &mut self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) {
        self.edges.push(Edge {
            source: source.into(),
            target: target.into(),
            source_handle: Some(source_handle.into()),
            target_handle: Some(target_handle.into()),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// One node in a graph. Immutable once execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: NodeId,
    pub spec_id: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, spec_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            spec_id: spec_id.into(),
            config: HashMap::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 2.0,
        });
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// A directed data dependency. Declaration order is significant for
/// merge-type nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    pub fn target_port(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(PORT_INPUT)
    }
}

/// Per-node retry budget applied by the runtime's retry wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_keys_are_reserved() {
        let key = credential_key("ai1");
        assert!(is_credential_key(&key));
        assert!(!is_credential_key("prompt"));
    }

    #[test]
    fn edge_default_ports() {
        let edge = Edge {
            source: "a".into(),
            target: "b".into(),
            source_handle: None,
            target_handle: None,
        };
        assert_eq!(edge.target_port(), PORT_INPUT);
    }

    #[test]
    fn flow_deserializes_camel_case() {
        let json = r#"{
            "id": "wf1",
            "nodes": [{"id": "n1", "specId": "input", "config": {}}],
            "edges": [{"source": "n1", "target": "n2", "sourceHandle": "true"}]
        }"#;
        let flow: Flow = serde_json::from_str(json).unwrap();
        assert_eq!(flow.nodes[0].spec_id, "input");
        assert_eq!(flow.edges[0].source_handle.as_deref(), Some("true"));
    }
}
