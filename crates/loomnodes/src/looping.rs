use async_trait::async_trait;
use loomcore::{
    InputPolicy, Node, NodeContext, NodeError, NodeOutput, Value, SPEC_LOOP, SPEC_LOOP_END,
};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Consumes an array and re-executes its body scope once per element,
/// bounded by `maxIterations`. The engine owns the scope; this executor
/// only drives it and collects each iteration's result.
pub struct LoopNode;

#[async_trait]
impl Node for LoopNode {
    fn spec_id(&self) -> &str {
        SPEC_LOOP
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx
            .primary_input()
            .ok_or_else(|| NodeError::MissingInput("input".into()))?;
        let items = input.as_array_items().ok_or_else(|| NodeError::InvalidInput {
            field: "input".to_string(),
            expected: "array".to_string(),
        })?;

        let scope = ctx
            .scope
            .as_ref()
            .ok_or_else(|| NodeError::Configuration("loop node has no body scope".into()))?;

        let max_iterations = ctx
            .config
            .get("maxIterations")
            .and_then(|v| v.as_f64())
            .map(|n| n.max(0.0) as usize)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);

        let count = items.len().min(max_iterations);
        tracing::debug!(node = %ctx.node_id, count, total = items.len(), "looping over array");

        let mut results = Vec::with_capacity(count);
        for (index, item) in items.into_iter().take(count).enumerate() {
            if ctx.cancellation.is_cancelled() {
                return Err(NodeError::Cancelled);
            }
            let result = scope.run_iteration(item, index).await?;
            results.push(result);
        }

        Ok(NodeOutput::value(Value::Array(results)))
    }
}

pub struct LoopNodeFactory;

impl NodeFactory for LoopNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(LoopNode))
    }

    fn spec_id(&self) -> &str {
        SPEC_LOOP
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Run the loop body once per array element".to_string(),
            category: "routing".to_string(),
        }
    }
}

/// Boundary of a loop body. Inside an iteration it passes the arriving
/// value through; at the outer level the engine publishes the collected
/// array on it for downstream edges.
pub struct LoopEndNode;

#[async_trait]
impl Node for LoopEndNode {
    fn spec_id(&self) -> &str {
        SPEC_LOOP_END
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .primary_input()
            .cloned()
            .ok_or_else(|| NodeError::MissingInput("input".into()))?;
        Ok(NodeOutput::value(value))
    }
}

pub struct LoopEndNodeFactory;

impl NodeFactory for LoopEndNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(LoopEndNode))
    }

    fn spec_id(&self) -> &str {
        SPEC_LOOP_END
    }

    fn input_policy(&self) -> InputPolicy {
        InputPolicy::AllTerminal
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Close a loop body and collect iteration results".to_string(),
            category: "routing".to_string(),
        }
    }
}
