use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Parse a JSON string into a structured value. Malformed input is a
/// node-level failure, never fatal to the run.
pub struct JsonParseNode;

#[async_trait]
impl Node for JsonParseNode {
    fn spec_id(&self) -> &str {
        "json-parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx
            .primary_input()
            .and_then(|v| v.as_str())
            .ok_or_else(|| NodeError::InvalidInput {
                field: "input".to_string(),
                expected: "string".to_string(),
            })?;

        let parsed: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;

        Ok(NodeOutput::value(Value::Json(parsed)))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonParseNode))
    }

    fn spec_id(&self) -> &str {
        "json-parse"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Parse a JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

/// Stringify a value to pretty-printed JSON.
pub struct JsonStringifyNode;

#[async_trait]
impl Node for JsonStringifyNode {
    fn spec_id(&self) -> &str {
        "json-stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .primary_input()
            .ok_or_else(|| NodeError::MissingInput("input".into()))?;

        let json_str = serde_json::to_string_pretty(&value.to_json())
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;

        Ok(NodeOutput::value(json_str))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(JsonStringifyNode))
    }

    fn spec_id(&self) -> &str {
        "json-stringify"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Convert a value to a JSON string".to_string(),
            category: "transform".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_with_ports;
    use serde_json::json;

    #[tokio::test]
    async fn parses_valid_json() {
        let ctx = context_with_ports(vec![("input", Value::String(r#"{"a": [1, 2]}"#.into()))]);
        let out = JsonParseNode.execute(ctx).await.unwrap();
        assert_eq!(out.default_port_value().unwrap().to_json(), json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn malformed_json_is_node_failure() {
        let ctx = context_with_ports(vec![("input", Value::String("{nope".into()))]);
        let err = JsonParseNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::ExecutionFailed(_)));
        assert!(!err.is_retryable());
    }
}
