use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoomError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Graph-level failures detected before any node executes. Always fatal:
/// an invalid graph is rejected whole.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("Edge references unknown node: {0}")]
    UnknownEdgeNode(String),

    #[error("Unknown node type: {0}")]
    UnknownSpecId(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Loop node '{0}' has no matching loop-end")]
    UnpairedLoop(String),

    #[error("Loop node '{0}' has an empty body")]
    EmptyLoopBody(String),

    #[error("Node '{node}' inside loop '{loop_id}' is referenced from outside the loop body")]
    LoopBodyEscape { loop_id: String, node: String },

    #[error("Output node '{0}' must not have outgoing edges")]
    OutputNotTerminal(String),

    #[error("Invalid graph: {0}")]
    Invalid(String),
}

/// Failures of a single node's execution. Never fatal to the run: the
/// scheduler captures these into node status and traces, and skip
/// propagation contains them to the failing branch.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input for '{field}': expected {expected}")]
    InvalidInput { field: String, expected: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("blocked host: {host}")]
    BlockedHost { host: String },

    #[error("Cancelled")]
    Cancelled,
}

impl NodeError {
    /// Whether the retry wrapper may spend budget re-attempting this error.
    /// Transient provider failures and timeouts qualify; bad inputs, bad
    /// config, blocked hosts, and cancellation never will.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Timeout { .. } => true,
            NodeError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn provider(message: impl Into<String>, retryable: bool) -> Self {
        NodeError::Provider {
            message: message.into(),
            retryable,
        }
    }
}
