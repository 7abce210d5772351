use crate::graph::FlowPlan;
use crate::registry::NodeRegistry;
use crate::scheduler::{self, ExecEnv};
use loomcore::{
    ConditionJudge, EventBus, ExecutionEvent, ExecutionId, Flow, FlowStatus, LoomError,
    NodeSpec, NodeStatus, NodeTrace, SecretRedactor, TraceCollector, ValidationError, Value,
    Edge,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One invocation of the engine: the graph payload, input values (workflow
/// inputs plus reserved credential entries), and request metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRequest {
    pub workflow_id: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_kind: Option<String>,
}

/// The redacted result of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResult {
    pub execution_id: ExecutionId,
    pub workflow_status: FlowStatus,
    pub node_status: HashMap<String, NodeStatus>,
    pub outputs_by_node: HashMap<String, Value>,
    pub final_outputs: Vec<FinalOutput>,
    pub node_traces: Vec<NodeTrace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalOutput {
    pub node_id: String,
    pub value: Value,
}

/// One line of the streaming invocation mode: progress events as they
/// happen, then exactly one terminal event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Progress(ExecutionEvent),
    Terminal(TerminalEvent),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    Complete {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<FlowResult>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Handle on a streaming run. Dropping it (or cancelling) stops new node
/// dispatch; in-flight attempts run to their own timeout.
pub struct RunHandle {
    pub execution_id: ExecutionId,
    pub events: tokio::sync::mpsc::Receiver<StreamEvent>,
    pub cancel: CancellationToken,
}

/// Configuration for the runtime
#[derive(Clone)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    pub default_timeout_ms: u64,
    /// Collaborator for free-text conditions; absent means such conditions
    /// fail at the node level.
    pub judge: Option<Arc<dyn ConditionJudge>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 8,
            event_buffer_size: 1024,
            default_timeout_ms: 30_000,
            judge: None,
        }
    }
}

/// The engine facade: wires the registry, scheduler, event bus, and
/// redactor together behind the two invocation modes.
pub struct LoomRuntime {
    registry: Arc<NodeRegistry>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl LoomRuntime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::with_registry(Arc::new(NodeRegistry::new()), config)
    }

    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            registry,
            event_bus,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Subscribe to execution events across all runs.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Validate a graph without executing it.
    pub fn validate(&self, request: &FlowRequest) -> Result<(), ValidationError> {
        let flow = Flow {
            id: request.workflow_id.clone(),
            name: String::new(),
            nodes: request.nodes.clone(),
            edges: request.edges.clone(),
        };
        FlowPlan::build(flow, &self.registry).map(|_| ())
    }

    /// Synchronous invocation: run to completion, return one redacted
    /// result. `Err` only for an invalid graph; node failures come back as
    /// structured data inside the result.
    pub async fn run_flow(&self, request: FlowRequest) -> Result<FlowResult, LoomError> {
        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        self.run_inner(request, execution_id, cancel).await
    }

    /// Streaming invocation: progress events as execution proceeds, then a
    /// terminal complete event carrying the redacted result.
    pub fn run_flow_streaming(self: &Arc<Self>, request: FlowRequest) -> RunHandle {
        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(256);

        // Subscribe before the run starts so no transition is missed.
        let mut events = self.event_bus.subscribe();
        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event_execution_id(&event) != Some(execution_id) {
                    continue;
                }
                let done = matches!(event, ExecutionEvent::FlowCompleted { .. });
                if forward_tx.send(StreamEvent::Progress(event)).await.is_err() {
                    break;
                }
                if done {
                    break;
                }
            }
        });

        let runtime = self.clone();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            let result = runtime.run_inner(request, execution_id, run_cancel).await;
            let terminal = match result {
                Ok(result) => {
                    // Let buffered progress events drain before the
                    // terminal line; the forwarder exits on FlowCompleted.
                    let _ = forwarder.await;
                    TerminalEvent::Complete {
                        ok: true,
                        result: Some(result),
                        error: None,
                    }
                }
                Err(e) => {
                    // Validation failures emit no completion event.
                    forwarder.abort();
                    TerminalEvent::Complete {
                        ok: false,
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = tx.send(StreamEvent::Terminal(terminal)).await;
        });

        RunHandle {
            execution_id,
            events: rx,
            cancel,
        }
    }

    async fn run_inner(
        &self,
        request: FlowRequest,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Result<FlowResult, LoomError> {
        let flow = Flow {
            id: request.workflow_id.clone(),
            name: String::new(),
            nodes: request.nodes,
            edges: request.edges,
        };
        let plan = Arc::new(FlowPlan::build(flow, &self.registry)?);

        let redactor = SecretRedactor::from_inputs(&request.inputs);
        let traces = TraceCollector::new();
        let env = Arc::new(ExecEnv {
            registry: self.registry.clone(),
            bus: self.event_bus.clone(),
            execution_id,
            flow_inputs: Arc::new(request.inputs),
            traces: traces.clone(),
            cancellation: cancel,
            redactor: redactor.clone(),
            judge: self.config.judge.clone(),
            max_parallel: self.config.max_parallel_nodes,
            default_timeout_ms: self.config.default_timeout_ms,
        });

        tracing::info!(
            workflow = %request.workflow_id,
            execution = %execution_id,
            caller = ?request.metadata.caller_id,
            "starting flow execution"
        );
        self.event_bus.emit(ExecutionEvent::FlowStarted {
            execution_id,
            workflow_id: request.workflow_id.clone(),
            timestamp: Utc::now(),
        });
        let started = Instant::now();

        let outcome = scheduler::execute(plan, HashMap::new(), env).await;

        let workflow_status = compute_flow_status(&outcome.statuses, &outcome.final_outputs);
        let duration_ms = started.elapsed().as_millis() as u64;
        self.event_bus.emit(ExecutionEvent::FlowCompleted {
            execution_id,
            status: workflow_status,
            duration_ms,
            timestamp: Utc::now(),
        });
        tracing::info!(
            workflow = %request.workflow_id,
            execution = %execution_id,
            status = ?workflow_status,
            duration_ms,
            "flow execution finished"
        );

        // Redaction runs on every exit path, error paths included: traces
        // carry redacted error strings already, values are scrubbed here.
        let outputs_by_node = outcome
            .outputs
            .iter()
            .map(|(id, value)| (id.clone(), redactor.redact_value(value)))
            .collect();
        let final_outputs = outcome
            .final_outputs
            .into_iter()
            .map(|(node_id, value)| FinalOutput {
                value: redactor.redact_value(&value),
                node_id,
            })
            .collect();
        let node_traces = traces
            .take()
            .into_iter()
            .map(|mut trace| {
                trace.error = trace.error.map(|e| redactor.redact_str(&e));
                trace
            })
            .collect();

        Ok(FlowResult {
            execution_id,
            workflow_status,
            node_status: outcome.statuses,
            outputs_by_node,
            final_outputs,
            node_traces,
        })
    }
}

impl Default for LoomRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// A run fails only when nothing reached an output node and something
/// actually went wrong; branches skipped away by routing degrade the run
/// to completed-with-skips instead.
fn compute_flow_status(
    statuses: &HashMap<String, NodeStatus>,
    final_outputs: &[(String, Value)],
) -> FlowStatus {
    let any_error = statuses.values().any(|s| *s == NodeStatus::Error);
    let any_skip = statuses.values().any(|s| *s == NodeStatus::Skipped);

    if !final_outputs.is_empty() {
        if any_error || any_skip {
            FlowStatus::CompletedWithSkips
        } else {
            FlowStatus::Completed
        }
    } else if any_error {
        FlowStatus::Failed
    } else if any_skip {
        FlowStatus::CompletedWithSkips
    } else {
        FlowStatus::Failed
    }
}

fn event_execution_id(event: &ExecutionEvent) -> Option<ExecutionId> {
    match event {
        ExecutionEvent::FlowStarted { execution_id, .. }
        | ExecutionEvent::NodeStatus { execution_id, .. }
        | ExecutionEvent::NodeToken { execution_id, .. }
        | ExecutionEvent::NodeLog { execution_id, .. }
        | ExecutionEvent::FlowCompleted { execution_id, .. } => Some(*execution_id),
    }
}
