use async_trait::async_trait;
use loomcore::{deep_merge, InputPolicy, Node, NodeContext, NodeError, NodeOutput, Value};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Waits for every connected input port and concatenates the values that
/// arrived, in edge declaration order.
pub struct MergeNode;

#[async_trait]
impl Node for MergeNode {
    fn spec_id(&self) -> &str {
        "merge"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let values: Vec<&Value> = ctx.port_values.iter().map(|pv| &pv.value).collect();
        if values.is_empty() {
            return Ok(NodeOutput::value(Value::Null));
        }

        let all_text = values
            .iter()
            .all(|v| matches!(v, Value::String(_)) || v.as_str().is_some());
        let combined = if all_text {
            Value::String(
                values
                    .iter()
                    .map(|v| v.to_text())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        } else {
            Value::Array(values.into_iter().cloned().collect())
        };
        Ok(NodeOutput::value(combined))
    }
}

pub struct MergeNodeFactory;

impl NodeFactory for MergeNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(MergeNode))
    }

    fn spec_id(&self) -> &str {
        "merge"
    }

    fn input_policy(&self) -> InputPolicy {
        InputPolicy::AllTerminal
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Concatenate all connected inputs".to_string(),
            category: "combine".to_string(),
        }
    }
}

/// Same waiting rule as merge, deep-merging the inputs as keyed
/// structures. Later-declared edges override earlier ones on collision.
pub struct MergeJsonNode;

#[async_trait]
impl Node for MergeJsonNode {
    fn spec_id(&self) -> &str {
        "merge-json"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut merged = serde_json::Value::Object(serde_json::Map::new());
        for pv in &ctx.port_values {
            let json = pv.value.to_json();
            if !json.is_object() {
                return Err(NodeError::InvalidInput {
                    field: pv.port.clone(),
                    expected: "object".to_string(),
                });
            }
            merged = deep_merge(merged, json);
        }
        Ok(NodeOutput::value(Value::Json(merged)))
    }
}

pub struct MergeJsonNodeFactory;

impl NodeFactory for MergeJsonNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(MergeJsonNode))
    }

    fn spec_id(&self) -> &str {
        "merge-json"
    }

    fn input_policy(&self) -> InputPolicy {
        InputPolicy::AllTerminal
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Deep-merge all connected inputs as JSON".to_string(),
            category: "combine".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_with_ports;
    use serde_json::json;

    #[tokio::test]
    async fn merge_concatenates_strings_in_declaration_order() {
        let ctx = context_with_ports(vec![
            ("input", Value::String("alpha".into())),
            ("input", Value::String("beta".into())),
        ]);
        let out = MergeNode.execute(ctx).await.unwrap();
        assert_eq!(
            out.default_port_value().unwrap(),
            &Value::String("alpha\nbeta".into())
        );
    }

    #[tokio::test]
    async fn merge_falls_back_to_array_for_mixed_values() {
        let ctx = context_with_ports(vec![
            ("input", Value::String("alpha".into())),
            ("input", Value::Number(3.0)),
        ]);
        let out = MergeNode.execute(ctx).await.unwrap();
        assert!(matches!(out.default_port_value(), Some(Value::Array(a)) if a.len() == 2));
    }

    #[tokio::test]
    async fn merge_json_later_edges_win() {
        let ctx = context_with_ports(vec![
            ("input", Value::Json(json!({"a": 1, "b": {"x": 1}}))),
            ("input", Value::Json(json!({"b": {"x": 2, "y": 3}}))),
        ]);
        let out = MergeJsonNode.execute(ctx).await.unwrap();
        let merged = out.default_port_value().unwrap().to_json();
        assert_eq!(merged, json!({"a": 1, "b": {"x": 2, "y": 3}}));
    }

    #[tokio::test]
    async fn merge_json_rejects_non_objects() {
        let ctx = context_with_ports(vec![("input", Value::String("not an object".into()))]);
        let err = MergeJsonNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidInput { .. }));
    }
}
