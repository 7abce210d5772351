//! Core abstractions for the workflow execution engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the dynamic value model, the graph wire format,
//! the node execution contract, statuses, traces, events, and redaction.
//! It contains no scheduling logic.

mod error;
mod events;
mod flow;
mod node;
mod redact;
mod status;
mod trace;
mod value;

pub use error::{LoomError, NodeError, ValidationError};
pub use events::{EventBus, EventEmitter, ExecutionEvent, ExecutionId};
pub use flow::{
    credential_key, is_credential_key, Edge, Flow, NodeId, NodeSpec, RetryPolicy, PORT_FALSE,
    PORT_INDEX, PORT_INPUT, PORT_ITEM, PORT_OUTPUT, PORT_TRUE, SPEC_INPUT, SPEC_LOOP,
    SPEC_LOOP_END, SPEC_OUTPUT,
};
pub use node::{
    ConditionJudge, ExecutionMeta, InputPolicy, Node, NodeContext, NodeOutput, PortValue,
    ScopeRunner,
};
pub use redact::{SecretRedactor, REDACTED};
pub use status::{FlowStatus, NodeStatus};
pub use trace::{now_ms, NodeTrace, TraceCollector};
pub use value::{deep_merge, Value};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, LoomError>;
