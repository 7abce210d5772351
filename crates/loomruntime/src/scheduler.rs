//! The scheduling core: drives one validated plan to completion.
//!
//! A single coordinating loop dispatches ready nodes as tokio tasks through
//! a [`FuturesUnordered`], bounded by the configured parallelism. Node
//! status propagates along edges: a terminal producer resolves each of its
//! outgoing edges as *satisfied* (a value arrived on the edge's port) or
//! *dead*, and dead edges cascade skips transitively without invoking
//! executors. Loop scopes re-execute their pre-planned body sub-flow once
//! per array element through a [`ScopeRunner`] owned by the engine.

use crate::graph::FlowPlan;
use crate::registry::NodeRegistry;
use crate::retry;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use loomcore::{
    now_ms, ConditionJudge, EventBus, ExecutionEvent, ExecutionId, InputPolicy, NodeContext,
    NodeError, NodeOutput, NodeStatus, NodeTrace, PortValue, ScopeRunner, SecretRedactor,
    TraceCollector, Value, PORT_INDEX, PORT_ITEM, PORT_OUTPUT, SPEC_LOOP,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything one execution (and its loop sub-executions) shares.
pub(crate) struct ExecEnv {
    pub registry: Arc<NodeRegistry>,
    pub bus: Arc<EventBus>,
    pub execution_id: ExecutionId,
    pub flow_inputs: Arc<HashMap<String, Value>>,
    pub traces: TraceCollector,
    pub cancellation: CancellationToken,
    pub redactor: SecretRedactor,
    pub judge: Option<Arc<dyn ConditionJudge>>,
    pub max_parallel: usize,
    pub default_timeout_ms: u64,
}

/// What one plan execution hands back to its caller.
pub(crate) struct ExecOutcome {
    pub statuses: HashMap<String, NodeStatus>,
    pub outputs: HashMap<String, Value>,
    pub final_outputs: Vec<(String, Value)>,
}

#[derive(Clone)]
enum EdgeState {
    Satisfied(Value),
    Dead { errored: bool },
}

struct Run {
    plan: Arc<FlowPlan>,
    env: Arc<ExecEnv>,
    status: Vec<NodeStatus>,
    edge_state: Vec<Option<EdgeState>>,
    full_outputs: HashMap<usize, NodeOutput>,
    primary_outputs: HashMap<String, Value>,
    loop_runners: HashMap<usize, Arc<LoopScopeRunner>>,
    eval_queue: VecDeque<usize>,
    ready: VecDeque<usize>,
    /// Guards against double-queueing a node whose producer resolved
    /// several of its incoming edges in one step.
    queued: Vec<bool>,
    remaining: usize,
}

/// Execute one plan. Seeds resolve edges whose source lives outside the
/// plan (the loop node feeding its body scope).
pub(crate) async fn execute(
    plan: Arc<FlowPlan>,
    seeds: HashMap<String, HashMap<String, Value>>,
    env: Arc<ExecEnv>,
) -> ExecOutcome {
    let mut run = Run::new(plan.clone(), env.clone(), &seeds);
    let mut running = FuturesUnordered::new();

    loop {
        run.evaluate_pending();

        while running.len() < env.max_parallel && !env.cancellation.is_cancelled() {
            let Some(idx) = run.ready.pop_front() else {
                break;
            };
            if run.status[idx] != NodeStatus::Pending {
                continue;
            }
            running.push(run.dispatch(idx));
        }

        if running.is_empty() {
            if run.remaining == 0 {
                break;
            }
            if env.cancellation.is_cancelled() {
                run.skip_remaining("cancelled");
                break;
            }
            // A validated acyclic plan always makes progress; reaching this
            // point means an internal invariant broke.
            tracing::error!(flow = %plan.flow.id, "scheduler stalled with unresolved nodes");
            run.skip_remaining("stalled");
            break;
        }

        if let Some(joined) = running.next().await {
            let (idx, outcome, start_ms) = match joined {
                Ok(completed) => completed,
                Err(join_err) => {
                    tracing::error!(error = %join_err, "node task aborted");
                    continue;
                }
            };
            match outcome.result {
                Ok(output) => run.record_success(idx, output, outcome.retries, start_ms),
                Err(err) => run.record_error(idx, err, outcome.retries, start_ms),
            }
        }
    }

    run.into_outcome()
}

impl Run {
    fn new(
        plan: Arc<FlowPlan>,
        env: Arc<ExecEnv>,
        seeds: &HashMap<String, HashMap<String, Value>>,
    ) -> Self {
        let node_count = plan.flow.nodes.len();
        let mut edge_state = vec![None; plan.flow.edges.len()];

        // Edges fed from outside the plan resolve immediately from seeds.
        for (ei, edge) in plan.flow.edges.iter().enumerate() {
            if plan.index_of.contains_key(&edge.source) {
                continue;
            }
            let port = edge.source_handle.as_deref().unwrap_or(PORT_OUTPUT);
            edge_state[ei] = Some(
                seeds
                    .get(&edge.source)
                    .and_then(|ports| ports.get(port))
                    .map(|v| EdgeState::Satisfied(v.clone()))
                    .unwrap_or(EdgeState::Dead { errored: false }),
            );
        }

        let remaining = (0..node_count).filter(|&i| plan.is_schedulable(i)).count();
        let eval_queue = (0..node_count).filter(|&i| plan.is_schedulable(i)).collect();

        Self {
            plan,
            env,
            status: vec![NodeStatus::Pending; node_count],
            edge_state,
            full_outputs: HashMap::new(),
            primary_outputs: HashMap::new(),
            loop_runners: HashMap::new(),
            eval_queue,
            ready: VecDeque::new(),
            queued: vec![false; node_count],
            remaining,
        }
    }

    /// Evaluate every queued node whose incoming edges are all resolved,
    /// cascading skips until the queue drains.
    fn evaluate_pending(&mut self) {
        while let Some(idx) = self.eval_queue.pop_front() {
            if self.status[idx] != NodeStatus::Pending || !self.plan.is_schedulable(idx) {
                continue;
            }
            let incoming = &self.plan.incoming[idx];
            if incoming.iter().any(|&ei| self.edge_state[ei].is_none()) {
                continue;
            }

            let has_satisfied = incoming.iter().any(|&ei| {
                matches!(self.edge_state[ei], Some(EdgeState::Satisfied(_)))
            });
            let has_errored_producer = incoming.iter().any(|&ei| {
                matches!(self.edge_state[ei], Some(EdgeState::Dead { errored: true }))
            });

            let runnable = match self.plan.policies[idx] {
                InputPolicy::AllTerminal => has_satisfied || incoming.is_empty(),
                InputPolicy::AllSuccess => {
                    !has_errored_producer && (incoming.is_empty() || has_satisfied)
                }
            };

            if runnable {
                if !self.queued[idx] {
                    self.queued[idx] = true;
                    self.ready.push_back(idx);
                }
            } else {
                self.mark_skipped(idx);
            }
        }
    }

    fn dispatch(
        &mut self,
        idx: usize,
    ) -> tokio::task::JoinHandle<(usize, retry::AttemptOutcome, i64)> {
        let spec = &self.plan.flow.nodes[idx];
        let node_id = spec.id.clone();
        let spec_id = spec.spec_id.clone();
        let config = spec.config.clone();
        let policy = spec.retry.clone().unwrap_or_default();
        let timeout = Duration::from_millis(
            spec.timeout_ms.unwrap_or(self.env.default_timeout_ms),
        );

        self.status[idx] = NodeStatus::Running;
        self.emit_status(idx, NodeStatus::Running, None);
        tracing::debug!(node = %node_id, spec_id = %spec_id, "dispatching node");

        let ctx = self.build_context(idx);
        let node = self
            .env
            .registry
            .create_node(&spec_id, &config)
            .map_err(|e| NodeError::Configuration(e.to_string()));

        tokio::spawn(async move {
            let start_ms = now_ms();
            let outcome = match node {
                Ok(node) => retry::run_with_policy(node.as_ref(), &ctx, &policy, timeout).await,
                Err(e) => retry::AttemptOutcome {
                    result: Err(e),
                    retries: 0,
                },
            };
            (idx, outcome, start_ms)
        })
    }

    fn build_context(&mut self, idx: usize) -> NodeContext {
        let spec = &self.plan.flow.nodes[idx];
        let mut inputs = HashMap::new();
        let mut port_values = Vec::new();
        for &ei in &self.plan.incoming[idx] {
            if let Some(EdgeState::Satisfied(value)) = &self.edge_state[ei] {
                let port = self.plan.flow.edges[ei].target_port().to_string();
                inputs.insert(port.clone(), value.clone());
                port_values.push(PortValue {
                    port,
                    value: value.clone(),
                });
            }
        }

        let mut scope: Option<Arc<dyn ScopeRunner>> = None;
        if spec.spec_id == SPEC_LOOP {
            if let Some(s) = self.plan.scopes.get(&idx) {
                let runner = Arc::new(LoopScopeRunner {
                    sub_plan: s.sub_plan.clone(),
                    loop_id: spec.id.clone(),
                    end_id: self.plan.flow.nodes[s.end_node].id.clone(),
                    env: self.env.clone(),
                    report: Mutex::new(HashMap::new()),
                });
                self.loop_runners.insert(idx, runner.clone());
                scope = Some(runner);
            }
        }

        NodeContext {
            node_id: spec.id.clone(),
            inputs,
            port_values,
            config: spec.config.clone(),
            flow_inputs: self.env.flow_inputs.clone(),
            events: self
                .env
                .bus
                .create_emitter(self.env.execution_id, spec.id.clone()),
            cancellation: self.env.cancellation.clone(),
            scope,
            judge: self.env.judge.clone(),
        }
    }

    fn record_success(&mut self, idx: usize, output: NodeOutput, retries: u32, start_ms: i64) {
        let spec = &self.plan.flow.nodes[idx];
        tracing::debug!(node = %spec.id, retries, "node succeeded");
        self.set_terminal(idx, NodeStatus::Success);
        self.emit_status(idx, NodeStatus::Success, None);
        self.append_trace(idx, NodeStatus::Success, start_ms, now_ms(), retries, None, &output);

        if let Some(value) = output.primary_value() {
            self.primary_outputs
                .insert(self.plan.flow.nodes[idx].id.clone(), value);
        }
        self.resolve_outgoing_satisfied(idx, &output);
        self.full_outputs.insert(idx, output);

        if self.plan.flow.nodes[idx].spec_id == SPEC_LOOP {
            self.finish_scope_success(idx);
        }
    }

    fn record_error(&mut self, idx: usize, err: NodeError, retries: u32, start_ms: i64) {
        let spec = &self.plan.flow.nodes[idx];
        let message = self.env.redactor.redact_str(&err.to_string());
        tracing::warn!(node = %spec.id, error = %message, retries, "node failed");
        self.set_terminal(idx, NodeStatus::Error);
        self.emit_status(idx, NodeStatus::Error, Some(message.clone()));
        self.append_trace(
            idx,
            NodeStatus::Error,
            start_ms,
            now_ms(),
            retries,
            Some(message),
            &NodeOutput::new(),
        );
        self.resolve_outgoing_dead(idx, true);

        if self.plan.flow.nodes[idx].spec_id == SPEC_LOOP {
            self.finish_scope_failure(idx, true);
        }
    }

    fn mark_skipped(&mut self, idx: usize) {
        let now = now_ms();
        self.set_terminal(idx, NodeStatus::Skipped);
        self.emit_status(idx, NodeStatus::Skipped, None);
        self.append_trace(idx, NodeStatus::Skipped, now, now, 0, None, &NodeOutput::new());
        self.resolve_outgoing_dead(idx, false);

        if self.plan.flow.nodes[idx].spec_id == SPEC_LOOP {
            self.finish_scope_failure(idx, false);
        }
    }

    fn set_terminal(&mut self, idx: usize, status: NodeStatus) {
        if !self.status[idx].is_terminal() && self.plan.is_schedulable(idx) {
            self.remaining -= 1;
        }
        self.status[idx] = status;
    }

    fn resolve_outgoing_satisfied(&mut self, idx: usize, output: &NodeOutput) {
        for ei in self.plan.outgoing[idx].clone() {
            let edge = &self.plan.flow.edges[ei];
            let value = match edge.source_handle.as_deref() {
                Some(port) => output.outputs.get(port),
                None => output.default_port_value(),
            };
            self.edge_state[ei] = Some(match value {
                Some(v) => EdgeState::Satisfied(v.clone()),
                None => EdgeState::Dead { errored: false },
            });
            self.eval_queue.push_back(self.plan.edge_target[ei]);
        }
    }

    fn resolve_outgoing_dead(&mut self, idx: usize, errored: bool) {
        for ei in self.plan.outgoing[idx].clone() {
            self.edge_state[ei] = Some(EdgeState::Dead { errored });
            self.eval_queue.push_back(self.plan.edge_target[ei]);
        }
    }

    /// After a loop node succeeds its aggregated array becomes the boundary
    /// node's published value; body node statuses surface from the last
    /// iteration's report.
    fn finish_scope_success(&mut self, idx: usize) {
        let Some(scope) = self.plan.scopes.get(&idx) else {
            return;
        };
        let (end_node, body) = (scope.end_node, scope.body.clone());
        let array = self
            .full_outputs
            .get(&idx)
            .and_then(|o| o.default_port_value().cloned())
            .unwrap_or(Value::Array(Vec::new()));

        let report = self
            .loop_runners
            .remove(&idx)
            .map(|runner| runner.take_report())
            .unwrap_or_default();

        for b in body {
            let id = self.plan.flow.nodes[b].id.clone();
            match report.get(&id) {
                Some((status, value)) => {
                    self.status[b] = *status;
                    if let Some(value) = value {
                        self.primary_outputs.insert(id, value.clone());
                    }
                }
                None => {
                    // Zero iterations: the body never ran.
                    self.status[b] = NodeStatus::Skipped;
                    self.emit_status(b, NodeStatus::Skipped, None);
                    let now = now_ms();
                    self.append_trace(
                        b,
                        NodeStatus::Skipped,
                        now,
                        now,
                        0,
                        None,
                        &NodeOutput::new(),
                    );
                }
            }
        }

        let end_id = self.plan.flow.nodes[end_node].id.clone();
        self.status[end_node] = NodeStatus::Success;
        self.emit_status(end_node, NodeStatus::Success, None);
        self.primary_outputs.insert(end_id, array.clone());
        let end_output = NodeOutput::value(array);
        if report.is_empty() {
            // No iteration traced the boundary.
            let now = now_ms();
            self.append_trace(end_node, NodeStatus::Success, now, now, 0, None, &end_output);
        }
        self.resolve_outgoing_satisfied(end_node, &end_output);
        self.full_outputs.insert(end_node, end_output);
    }

    /// A failed or skipped loop marks its scope: body statuses from the
    /// report where iterations ran, skipped otherwise, and the boundary's
    /// dependents go dead.
    fn finish_scope_failure(&mut self, idx: usize, errored: bool) {
        let Some(scope) = self.plan.scopes.get(&idx) else {
            return;
        };
        let (end_node, body) = (scope.end_node, scope.body.clone());
        let report = self
            .loop_runners
            .remove(&idx)
            .map(|runner| runner.take_report())
            .unwrap_or_default();

        for b in body {
            let id = self.plan.flow.nodes[b].id.clone();
            match report.get(&id) {
                Some((status, value)) => {
                    self.status[b] = *status;
                    if let Some(value) = value {
                        self.primary_outputs.insert(id, value.clone());
                    }
                }
                None => {
                    self.status[b] = NodeStatus::Skipped;
                    self.emit_status(b, NodeStatus::Skipped, None);
                    let now = now_ms();
                    self.append_trace(b, NodeStatus::Skipped, now, now, 0, None, &NodeOutput::new());
                }
            }
        }

        self.status[end_node] = NodeStatus::Skipped;
        self.emit_status(end_node, NodeStatus::Skipped, None);
        let now = now_ms();
        self.append_trace(end_node, NodeStatus::Skipped, now, now, 0, None, &NodeOutput::new());
        self.resolve_outgoing_dead(end_node, errored);
    }

    /// Cancellation or a stall: everything not yet terminal skips.
    fn skip_remaining(&mut self, reason: &str) {
        tracing::info!(reason, "skipping undispatched nodes");
        for idx in 0..self.plan.flow.nodes.len() {
            if self.plan.is_schedulable(idx) && !self.status[idx].is_terminal() {
                self.mark_skipped(idx);
            }
        }
        // Scope members of never-started loops.
        for idx in 0..self.plan.flow.nodes.len() {
            if !self.plan.is_schedulable(idx) && !self.status[idx].is_terminal() {
                self.status[idx] = NodeStatus::Skipped;
            }
        }
        self.remaining = 0;
    }

    fn emit_status(&self, idx: usize, status: NodeStatus, error: Option<String>) {
        let spec = &self.plan.flow.nodes[idx];
        self.env.bus.emit(ExecutionEvent::NodeStatus {
            execution_id: self.env.execution_id,
            node_id: spec.id.clone(),
            spec_id: spec.spec_id.clone(),
            status,
            error,
            timestamp: Utc::now(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn append_trace(
        &self,
        idx: usize,
        status: NodeStatus,
        start_ms: i64,
        end_ms: i64,
        retries: u32,
        error: Option<String>,
        output: &NodeOutput,
    ) {
        let spec = &self.plan.flow.nodes[idx];
        self.env.traces.append(NodeTrace {
            node_id: spec.id.clone(),
            spec_id: spec.spec_id.clone(),
            status,
            start_ms,
            end_ms,
            error,
            retries,
            tokens: output.meta.tokens,
            model: output.meta.model.clone(),
        });
    }

    fn into_outcome(self) -> ExecOutcome {
        let mut statuses = HashMap::new();
        for (idx, node) in self.plan.flow.nodes.iter().enumerate() {
            statuses.insert(node.id.clone(), self.status[idx]);
        }

        let mut final_outputs = Vec::new();
        for &idx in &self.plan.output_nodes {
            if self.status[idx] != NodeStatus::Success {
                continue;
            }
            let id = &self.plan.flow.nodes[idx].id;
            if let Some(value) = self.primary_outputs.get(id) {
                final_outputs.push((id.clone(), value.clone()));
            }
        }

        ExecOutcome {
            statuses,
            outputs: self.primary_outputs,
            final_outputs,
        }
    }
}

/// Engine-owned runner re-executing one loop body per array element.
/// Iterations run sequentially; each one is a full sub-execution of the
/// pre-planned body flow, sharing the run's event bus, trace collector,
/// and cancellation token.
struct LoopScopeRunner {
    sub_plan: Arc<FlowPlan>,
    loop_id: String,
    end_id: String,
    env: Arc<ExecEnv>,
    report: Mutex<HashMap<String, (NodeStatus, Option<Value>)>>,
}

impl LoopScopeRunner {
    fn take_report(&self) -> HashMap<String, (NodeStatus, Option<Value>)> {
        self.report
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ScopeRunner for LoopScopeRunner {
    async fn run_iteration(&self, item: Value, index: usize) -> Result<Value, NodeError> {
        if self.env.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        let mut ports = HashMap::new();
        ports.insert(PORT_ITEM.to_string(), item.clone());
        ports.insert(PORT_INDEX.to_string(), Value::Number(index as f64));
        ports.insert(PORT_OUTPUT.to_string(), item);
        let seeds = HashMap::from([(self.loop_id.clone(), ports)]);

        let outcome = execute(self.sub_plan.clone(), seeds, self.env.clone()).await;

        if let Ok(mut report) = self.report.lock() {
            for (id, status) in &outcome.statuses {
                report.insert(id.clone(), (*status, outcome.outputs.get(id).cloned()));
            }
        }

        let end_succeeded = outcome.statuses.get(&self.end_id) == Some(&NodeStatus::Success);
        match outcome.outputs.get(&self.end_id) {
            Some(value) if end_succeeded => Ok(value.clone()),
            _ => Err(NodeError::ExecutionFailed(format!(
                "loop iteration {index} produced no result"
            ))),
        }
    }
}
