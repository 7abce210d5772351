//! Scheduler behavior tests over stub node types: readiness, skip
//! propagation, failure isolation, retry accounting, concurrency bounds,
//! and cancellation.

use async_trait::async_trait;
use loomcore::{
    credential_key, Edge, InputPolicy, Node, NodeContext, NodeError, NodeOutput, NodeSpec,
    NodeStatus, FlowStatus, Value,
};
use loomruntime::{FlowRequest, LoomRuntime, NodeFactory, NodeRegistry, RuntimeConfig, StreamEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Emits its `value` config on the default port.
struct ConstNode;

#[async_trait]
impl Node for ConstNode {
    fn spec_id(&self) -> &str {
        "const"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx.require_config("value")?.clone();
        Ok(NodeOutput::value(value))
    }
}

struct ConstFactory;

impl NodeFactory for ConstFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ConstNode))
    }

    fn spec_id(&self) -> &str {
        "const"
    }
}

/// Passes its first input through; stands in for the output node type.
struct SinkNode;

#[async_trait]
impl Node for SinkNode {
    fn spec_id(&self) -> &str {
        "output"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .primary_input()
            .cloned()
            .ok_or_else(|| NodeError::MissingInput("input".into()))?;
        Ok(NodeOutput::value(value))
    }
}

struct SinkFactory;

impl NodeFactory for SinkFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(SinkNode))
    }

    fn spec_id(&self) -> &str {
        "output"
    }
}

/// Publishes its input on the single port named by `port` config,
/// mimicking condition-style routing.
struct RouteNode;

#[async_trait]
impl Node for RouteNode {
    fn spec_id(&self) -> &str {
        "route"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let port = ctx
            .config_str("port")
            .ok_or_else(|| NodeError::Configuration("route needs a port".into()))?;
        let value = ctx.primary_input().cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::new().with_output(port, value))
    }
}

struct RouteFactory;

impl NodeFactory for RouteFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(RouteNode))
    }

    fn spec_id(&self) -> &str {
        "route"
    }
}

/// Fails with a retryable provider error, carrying `message` config.
struct FailNode;

#[async_trait]
impl Node for FailNode {
    fn spec_id(&self) -> &str {
        "fail"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let message = ctx
            .config_str("message")
            .unwrap_or_else(|| "boom".to_string());
        Err(NodeError::provider(message, false))
    }
}

struct FailFactory;

impl NodeFactory for FailFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(FailNode))
    }

    fn spec_id(&self) -> &str {
        "fail"
    }
}

/// Fails `failures` times per node id, then succeeds.
struct FlakyNode {
    attempts: Arc<Mutex<HashMap<String, usize>>>,
}

#[async_trait]
impl Node for FlakyNode {
    fn spec_id(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let failures = ctx
            .config
            .get("failures")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as usize;
        let mut attempts = self.attempts.lock().unwrap();
        let seen = attempts.entry(ctx.node_id.clone()).or_insert(0);
        *seen += 1;
        if *seen <= failures {
            Err(NodeError::provider("transient failure", true))
        } else {
            Ok(NodeOutput::value(Value::String("recovered".into())))
        }
    }
}

struct FlakyFactory {
    attempts: Arc<Mutex<HashMap<String, usize>>>,
}

impl NodeFactory for FlakyFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(FlakyNode {
            attempts: self.attempts.clone(),
        }))
    }

    fn spec_id(&self) -> &str {
        "flaky"
    }
}

/// Sleeps, tracking how many instances run at once.
struct GaugeNode {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for GaugeNode {
    fn spec_id(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutput::value(Value::Bool(true)))
    }
}

struct GaugeFactory {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl NodeFactory for GaugeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(GaugeNode {
            active: self.active.clone(),
            peak: self.peak.clone(),
        }))
    }

    fn spec_id(&self) -> &str {
        "gauge"
    }
}

/// Collects every satisfied input in declaration order.
struct CollectNode;

#[async_trait]
impl Node for CollectNode {
    fn spec_id(&self) -> &str {
        "collect"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let values: Vec<Value> = ctx.port_values.iter().map(|pv| pv.value.clone()).collect();
        Ok(NodeOutput::value(Value::Array(values)))
    }
}

struct CollectFactory;

impl NodeFactory for CollectFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(CollectNode))
    }

    fn spec_id(&self) -> &str {
        "collect"
    }

    fn input_policy(&self) -> InputPolicy {
        InputPolicy::AllTerminal
    }
}

fn test_runtime(config: RuntimeConfig) -> Arc<LoomRuntime> {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(ConstFactory));
    registry.register(Arc::new(SinkFactory));
    registry.register(Arc::new(RouteFactory));
    registry.register(Arc::new(FailFactory));
    registry.register(Arc::new(FlakyFactory {
        attempts: Arc::new(Mutex::new(HashMap::new())),
    }));
    registry.register(Arc::new(GaugeFactory {
        active: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
    }));
    registry.register(Arc::new(CollectFactory));
    Arc::new(LoomRuntime::with_registry(Arc::new(registry), config))
}

fn node(id: &str, spec_id: &str) -> NodeSpec {
    NodeSpec::new(id, spec_id)
}

fn edge(source: &str, target: &str) -> Edge {
    Edge {
        source: source.into(),
        target: target.into(),
        source_handle: None,
        target_handle: None,
    }
}

fn edge_from_port(source: &str, port: &str, target: &str) -> Edge {
    Edge {
        source: source.into(),
        target: target.into(),
        source_handle: Some(port.into()),
        target_handle: None,
    }
}

fn request(nodes: Vec<NodeSpec>, edges: Vec<Edge>) -> FlowRequest {
    FlowRequest {
        workflow_id: "wf-test".into(),
        nodes,
        edges,
        inputs: HashMap::new(),
        metadata: Default::default(),
    }
}

#[tokio::test]
async fn linear_flow_completes() {
    let runtime = test_runtime(RuntimeConfig::default());
    let result = runtime
        .run_flow(request(
            vec![
                node("a", "const").with_config("value", "hello"),
                node("out", "output"),
            ],
            vec![edge("a", "out")],
        ))
        .await
        .unwrap();

    assert_eq!(result.workflow_status, FlowStatus::Completed);
    assert_eq!(result.final_outputs.len(), 1);
    assert_eq!(result.final_outputs[0].node_id, "out");
    assert_eq!(result.final_outputs[0].value, Value::String("hello".into()));
    assert_eq!(result.node_status["a"], NodeStatus::Success);
    assert_eq!(result.node_traces.len(), 2);
}

#[tokio::test]
async fn validation_rejects_unknown_spec_dangling_edge_and_cycle() {
    let runtime = test_runtime(RuntimeConfig::default());

    let unknown = runtime
        .run_flow(request(vec![node("a", "nope")], vec![]))
        .await;
    assert!(unknown.is_err());

    let dangling = runtime
        .run_flow(request(
            vec![node("a", "const").with_config("value", 1.0)],
            vec![edge("a", "ghost")],
        ))
        .await;
    assert!(dangling.is_err());

    let cyclic = runtime
        .run_flow(request(
            vec![
                node("a", "const").with_config("value", 1.0),
                node("b", "const").with_config("value", 2.0),
            ],
            vec![edge("a", "b"), edge("b", "a")],
        ))
        .await;
    assert!(cyclic.is_err());
}

#[tokio::test]
async fn untaken_route_port_skips_transitively() {
    let runtime = test_runtime(RuntimeConfig::default());
    // route publishes only on "t"; everything reachable only through "f"
    // must end skipped, two levels deep.
    let result = runtime
        .run_flow(request(
            vec![
                node("src", "const").with_config("value", "x"),
                node("r", "route").with_config("port", "t"),
                node("taken", "output"),
                node("untaken_mid", "const").with_config("value", "y"),
                node("untaken_out", "output"),
            ],
            vec![
                edge("src", "r"),
                edge_from_port("r", "t", "taken"),
                edge_from_port("r", "f", "untaken_mid"),
                edge("untaken_mid", "untaken_out"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(result.node_status["taken"], NodeStatus::Success);
    assert_eq!(result.node_status["untaken_mid"], NodeStatus::Skipped);
    assert_eq!(result.node_status["untaken_out"], NodeStatus::Skipped);
    assert_eq!(result.workflow_status, FlowStatus::CompletedWithSkips);
}

#[tokio::test]
async fn failure_is_contained_to_its_branch() {
    let runtime = test_runtime(RuntimeConfig::default());
    let result = runtime
        .run_flow(request(
            vec![
                node("bad", "fail"),
                node("bad_out", "output"),
                node("good", "const").with_config("value", "fine"),
                node("good_out", "output"),
            ],
            vec![edge("bad", "bad_out"), edge("good", "good_out")],
        ))
        .await
        .unwrap();

    assert_eq!(result.node_status["bad"], NodeStatus::Error);
    assert_eq!(result.node_status["bad_out"], NodeStatus::Skipped);
    assert_eq!(result.node_status["good_out"], NodeStatus::Success);
    assert_eq!(result.workflow_status, FlowStatus::CompletedWithSkips);

    let bad_trace = result
        .node_traces
        .iter()
        .find(|t| t.node_id == "bad")
        .unwrap();
    assert_eq!(bad_trace.status, NodeStatus::Error);
    assert!(bad_trace.error.is_some());
}

#[tokio::test]
async fn run_fails_when_no_output_produced() {
    let runtime = test_runtime(RuntimeConfig::default());
    let result = runtime
        .run_flow(request(
            vec![node("bad", "fail"), node("out", "output")],
            vec![edge("bad", "out")],
        ))
        .await
        .unwrap();

    assert_eq!(result.workflow_status, FlowStatus::Failed);
    assert!(result.final_outputs.is_empty());
}

#[tokio::test]
async fn retry_trace_counts_attempts_beyond_first() {
    let runtime = test_runtime(RuntimeConfig::default());
    let mut flaky = node("f", "flaky").with_config("failures", 2.0);
    flaky = flaky.with_retry(3, 1);
    let result = runtime
        .run_flow(request(
            vec![flaky, node("out", "output")],
            vec![edge("f", "out")],
        ))
        .await
        .unwrap();

    assert_eq!(result.workflow_status, FlowStatus::Completed);
    let trace = result.node_traces.iter().find(|t| t.node_id == "f").unwrap();
    assert_eq!(trace.status, NodeStatus::Success);
    assert_eq!(trace.retries, 2);
}

#[tokio::test]
async fn parallelism_is_bounded() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(GaugeFactory {
        active: active.clone(),
        peak: peak.clone(),
    }));
    registry.register(Arc::new(SinkFactory));
    let runtime = Arc::new(LoomRuntime::with_registry(
        Arc::new(registry),
        RuntimeConfig {
            max_parallel_nodes: 2,
            ..RuntimeConfig::default()
        },
    ));

    let nodes = (0..6).map(|i| node(&format!("g{i}"), "gauge")).collect();
    let result = runtime.run_flow(request(nodes, vec![])).await.unwrap();

    for i in 0..6 {
        assert_eq!(result.node_status[&format!("g{i}")], NodeStatus::Success);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2, "ran more than 2 at once");
}

#[tokio::test]
async fn independent_nodes_run_concurrently() {
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(GaugeFactory {
        active: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
    }));
    let runtime = Arc::new(LoomRuntime::with_registry(
        Arc::new(registry),
        RuntimeConfig::default(),
    ));

    let nodes = (0..4).map(|i| node(&format!("g{i}"), "gauge")).collect();
    runtime.run_flow(request(nodes, vec![])).await.unwrap();
    assert!(peak.load(Ordering::SeqCst) > 1, "independent nodes serialized");
}

#[tokio::test]
async fn all_terminal_policy_collects_in_declaration_order() {
    let runtime = test_runtime(RuntimeConfig::default());
    let result = runtime
        .run_flow(request(
            vec![
                node("a", "const").with_config("value", "first"),
                node("b", "fail"),
                node("c", "const").with_config("value", "third"),
                node("m", "collect"),
                node("out", "output"),
            ],
            vec![edge("a", "m"), edge("b", "m"), edge("c", "m"), edge("m", "out")],
        ))
        .await
        .unwrap();

    // The collector tolerates the failed producer and keeps edge order.
    assert_eq!(result.node_status["m"], NodeStatus::Success);
    assert_eq!(
        result.outputs_by_node["m"],
        Value::Array(vec![
            Value::String("first".into()),
            Value::String("third".into())
        ])
    );
    assert_eq!(result.workflow_status, FlowStatus::CompletedWithSkips);
}

#[tokio::test]
async fn multiple_edges_from_one_producer_dispatch_once() {
    let runtime = test_runtime(RuntimeConfig::default());
    let result = runtime
        .run_flow(request(
            vec![
                node("a", "const").with_config("value", "v"),
                node("m", "collect"),
                node("out", "output"),
            ],
            vec![edge("a", "m"), edge("a", "m"), edge("m", "out")],
        ))
        .await
        .unwrap();

    let m_traces = result
        .node_traces
        .iter()
        .filter(|t| t.node_id == "m")
        .count();
    assert_eq!(m_traces, 1, "node fed twice by one producer ran twice");
    assert_eq!(
        result.outputs_by_node["m"],
        Value::Array(vec![Value::String("v".into()), Value::String("v".into())])
    );
}

#[tokio::test]
async fn trace_errors_are_redacted() {
    let runtime = test_runtime(RuntimeConfig::default());
    let secret = "sk-super-secret-token";
    let mut req = request(
        vec![
            node("bad", "fail").with_config("message", format!("auth failed: {secret}").as_str()),
            node("out", "output"),
        ],
        vec![edge("bad", "out")],
    );
    req.inputs
        .insert(credential_key("bad"), Value::String(secret.into()));

    let result = runtime.run_flow(req).await.unwrap();
    let trace = result
        .node_traces
        .iter()
        .find(|t| t.node_id == "bad")
        .unwrap();
    let error = trace.error.as_deref().unwrap();
    assert!(!error.contains(secret), "trace leaked the credential");
    assert!(error.contains("[redacted]"));
}

#[tokio::test]
async fn cancellation_stops_dispatch_but_returns_a_result() {
    let runtime = test_runtime(RuntimeConfig {
        max_parallel_nodes: 1,
        ..RuntimeConfig::default()
    });

    // A chain of gauges (50ms each) behind max_parallel=1: cancelling
    // after the first starts leaves the rest undispatched.
    let nodes = vec![
        node("g0", "gauge"),
        node("g1", "gauge"),
        node("g2", "gauge"),
    ];
    let edges = vec![edge("g0", "g1"), edge("g1", "g2")];
    let mut handle = runtime.run_flow_streaming(request(nodes, edges));

    let mut saw_terminal = false;
    let mut cancelled = false;
    while let Some(event) = handle.events.recv().await {
        match event {
            StreamEvent::Progress(_) if !cancelled => {
                handle.cancel.cancel();
                cancelled = true;
            }
            StreamEvent::Terminal(_) => {
                saw_terminal = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_terminal, "stream must always end with a terminal event");
}
