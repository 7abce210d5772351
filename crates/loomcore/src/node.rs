use crate::{events::EventEmitter, NodeError, Value, PORT_OUTPUT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Spec id identifying the behavior (e.g. "http-request")
    fn spec_id(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Validate configuration at graph validation time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// How the scheduler decides a node is ready to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputPolicy {
    /// Run once every producer succeeded on the connected port; an errored
    /// producer skips this node, a skipped-away branch is tolerated.
    #[default]
    AllSuccess,
    /// Wait until every producer is terminal regardless of outcome and run
    /// with whatever values arrived (merge-type nodes).
    AllTerminal,
}

/// Runs a bounded loop-body scope once per array element. Owned by the
/// engine; the loop executor only drives it.
#[async_trait]
pub trait ScopeRunner: Send + Sync {
    async fn run_iteration(&self, item: Value, index: usize) -> Result<Value, NodeError>;
}

/// External judgment call for free-text, human-phrased conditions.
#[async_trait]
pub trait ConditionJudge: Send + Sync {
    async fn judge(&self, condition: &str, value: &Value) -> Result<bool, NodeError>;
}

/// One input value as delivered over an edge, in edge declaration order.
#[derive(Debug, Clone)]
pub struct PortValue {
    pub port: String,
    pub value: Value,
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    /// Node instance id within the graph
    pub node_id: String,

    /// Input values from connected edges, keyed by target port
    pub inputs: HashMap<String, Value>,

    /// The same inputs in edge declaration order (merge semantics)
    pub port_values: Vec<PortValue>,

    /// Static configuration for this node
    pub config: HashMap<String, Value>,

    /// The run's input map: workflow inputs plus reserved credential
    /// entries. Read-only after construction.
    pub flow_inputs: Arc<HashMap<String, Value>>,

    /// Event emitter for live progress and streamed tokens
    pub events: EventEmitter,

    /// Cancellation token; set when the caller abandons the run
    pub cancellation: tokio_util::sync::CancellationToken,

    /// Loop-body runner, present only on loop nodes
    pub scope: Option<Arc<dyn ScopeRunner>>,

    /// Free-text condition collaborator, when one is wired into the runtime
    pub judge: Option<Arc<dyn ConditionJudge>>,
}

impl NodeContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, NodeError> {
        self.inputs
            .get(name)
            .ok_or_else(|| NodeError::MissingInput(name.to_string()))
    }

    /// First input in edge declaration order, falling back to config.
    pub fn primary_input(&self) -> Option<&Value> {
        self.port_values.first().map(|pv| &pv.value)
    }

    /// Input on `name`, falling back to the node's own config when the
    /// port is unconnected.
    pub fn input_or_config(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).or_else(|| self.config.get(name))
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }

    /// Config string helper
    pub fn config_str(&self, name: &str) -> Option<String> {
        self.config.get(name).and_then(|v| v.as_str().map(str::to_string))
    }

    /// The credential the caller injected for this node, if any.
    pub fn credential(&self) -> Option<&str> {
        self.flow_inputs
            .get(&crate::credential_key(&self.node_id))
            .and_then(|v| v.as_str())
    }
}

/// Output from node execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Output port values
    pub outputs: HashMap<String, Value>,

    /// Execution metadata surfaced into the trace
    pub meta: ExecutionMeta,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            meta: ExecutionMeta::default(),
        }
    }

    /// Single value on the default port.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::new().with_output(PORT_OUTPUT, value)
    }

    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(port.into(), value.into());
        self
    }

    pub fn with_meta(mut self, meta: ExecutionMeta) -> Self {
        self.meta = meta;
        self
    }

    /// The value a port-less edge reads: the default port if present,
    /// otherwise the node's single published port.
    pub fn default_port_value(&self) -> Option<&Value> {
        self.outputs.get(PORT_OUTPUT).or_else(|| {
            if self.outputs.len() == 1 {
                self.outputs.values().next()
            } else {
                None
            }
        })
    }

    /// The node's externally-visible value for `outputsByNode`.
    pub fn primary_value(&self) -> Option<Value> {
        if let Some(v) = self.default_port_value() {
            return Some(v.clone());
        }
        if self.outputs.is_empty() {
            return None;
        }
        Some(Value::Object(self.outputs.clone()))
    }
}

impl Default for NodeOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}
