use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput, Value, PORT_FALSE, PORT_TRUE};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Routes its input onto exactly one of two ports. A free-text condition
/// is delegated to the configured judgment collaborator; otherwise a
/// structural operator compares the input against `compareValue`.
pub struct ConditionNode;

#[async_trait]
impl Node for ConditionNode {
    fn spec_id(&self) -> &str {
        "condition"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let input = ctx.primary_input().cloned().unwrap_or(Value::Null);

        let verdict = match ctx.config_str("condition").filter(|c| !c.trim().is_empty()) {
            Some(condition) => {
                let judge = ctx.judge.as_ref().ok_or_else(|| {
                    NodeError::Configuration(
                        "free-text condition given but no judge is configured".into(),
                    )
                })?;
                judge.judge(&condition, &input).await?
            }
            None => {
                let operator = ctx.config_str("operator").unwrap_or_else(|| "truthy".into());
                evaluate_operator(&operator, &input, ctx.config.get("compareValue"))?
            }
        };

        let port = if verdict { PORT_TRUE } else { PORT_FALSE };
        tracing::debug!(node = %ctx.node_id, port, "condition routed");
        Ok(NodeOutput::new().with_output(port, input))
    }
}

fn evaluate_operator(
    operator: &str,
    input: &Value,
    compare: Option<&Value>,
) -> Result<bool, NodeError> {
    match operator {
        "truthy" => Ok(input.is_truthy()),
        "falsy" => Ok(!input.is_truthy()),
        "equals" | "notEquals" => {
            let compare = compare.ok_or_else(|| {
                NodeError::Configuration(format!("operator {operator} requires a compareValue"))
            })?;
            let equal = values_equal(input, compare);
            Ok(if operator == "equals" { equal } else { !equal })
        }
        "gt" | "lt" => {
            let compare = compare.ok_or_else(|| {
                NodeError::Configuration(format!("operator {operator} requires a compareValue"))
            })?;
            let (a, b) = (as_number(input)?, as_number(compare)?);
            Ok(if operator == "gt" { a > b } else { a < b })
        }
        other => Err(NodeError::Configuration(format!(
            "unknown condition operator: {other}"
        ))),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => a == b,
        _ => a.to_json() == b.to_json(),
    }
}

fn as_number(value: &Value) -> Result<f64, NodeError> {
    if let Some(n) = value.as_f64() {
        return Ok(n);
    }
    value
        .as_str()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .ok_or_else(|| NodeError::InvalidInput {
            field: "compareValue".to_string(),
            expected: "number".to_string(),
        })
}

pub struct ConditionNodeFactory;

impl NodeFactory for ConditionNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ConditionNode))
    }

    fn spec_id(&self) -> &str {
        "condition"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Route the input onto a true or false port".to_string(),
            category: "routing".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_with_ports;

    fn routed_port(out: &NodeOutput) -> &str {
        if out.outputs.contains_key(PORT_TRUE) {
            PORT_TRUE
        } else {
            PORT_FALSE
        }
    }

    #[tokio::test]
    async fn equals_mismatch_routes_false() {
        let mut ctx = context_with_ports(vec![("input", Value::String("no".into()))]);
        ctx.config.insert("operator".into(), Value::String("equals".into()));
        ctx.config.insert("compareValue".into(), Value::String("yes".into()));
        let out = ConditionNode.execute(ctx).await.unwrap();
        assert_eq!(routed_port(&out), PORT_FALSE);
        assert_eq!(out.outputs.len(), 1);
    }

    #[tokio::test]
    async fn truthy_default_operator() {
        let ctx = context_with_ports(vec![("input", Value::String("anything".into()))]);
        let out = ConditionNode.execute(ctx).await.unwrap();
        assert_eq!(routed_port(&out), PORT_TRUE);
    }

    #[tokio::test]
    async fn gt_compares_numerically() {
        let mut ctx = context_with_ports(vec![("input", Value::Number(10.0))]);
        ctx.config.insert("operator".into(), Value::String("gt".into()));
        ctx.config.insert("compareValue".into(), Value::String("3".into()));
        let out = ConditionNode.execute(ctx).await.unwrap();
        assert_eq!(routed_port(&out), PORT_TRUE);
    }

    #[tokio::test]
    async fn free_text_without_judge_is_config_error() {
        let mut ctx = context_with_ports(vec![("input", Value::String("x".into()))]);
        ctx.config.insert(
            "condition".into(),
            Value::String("does the text sound friendly?".into()),
        );
        let err = ConditionNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[tokio::test]
    async fn unknown_operator_rejected() {
        let mut ctx = context_with_ports(vec![("input", Value::Number(1.0))]);
        ctx.config.insert("operator".into(), Value::String("matches".into()));
        let err = ConditionNode.execute(ctx).await.unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }
}
