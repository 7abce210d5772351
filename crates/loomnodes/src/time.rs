use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

/// Suspends for a configured duration, then forwards its input unchanged.
/// Sibling branches with no dependency on it keep running.
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn spec_id(&self) -> &str {
        "delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let delay_ms = ctx
            .config
            .get("delayMs")
            .and_then(|v| v.as_f64())
            .unwrap_or(1000.0) as u64;

        tracing::debug!(node = %ctx.node_id, delay_ms, "delaying");

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        let value = ctx.primary_input().cloned().unwrap_or(Value::Null);
        Ok(NodeOutput::value(value))
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn spec_id(&self) -> &str {
        "delay"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Wait a fixed duration, then pass the input through".to_string(),
            category: "time".to_string(),
        }
    }
}
