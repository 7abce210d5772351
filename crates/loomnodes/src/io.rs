use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput, Value, SPEC_INPUT, SPEC_OUTPUT};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Reads a named value from the workflow's input map.
pub struct InputNode;

#[async_trait]
impl Node for InputNode {
    fn spec_id(&self) -> &str {
        SPEC_INPUT
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let name = ctx
            .config_str("name")
            .ok_or_else(|| NodeError::Configuration("input node requires a name".into()))?;
        let required = ctx
            .config
            .get("required")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        if let Some(value) = ctx.flow_inputs.get(&name) {
            return Ok(NodeOutput::value(value.clone()));
        }
        if let Some(default) = ctx.config.get("default") {
            return Ok(NodeOutput::value(default.clone()));
        }
        if required {
            Err(NodeError::MissingInput(name))
        } else {
            Ok(NodeOutput::value(Value::Null))
        }
    }
}

pub struct InputNodeFactory;

impl NodeFactory for InputNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(InputNode))
    }

    fn spec_id(&self) -> &str {
        SPEC_INPUT
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Read a workflow input value".to_string(),
            category: "io".to_string(),
        }
    }
}

/// Formats the single upstream value and registers it as a final output.
/// Terminal: validation rejects outgoing edges.
pub struct OutputNode;

#[async_trait]
impl Node for OutputNode {
    fn spec_id(&self) -> &str {
        SPEC_OUTPUT
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let value = ctx
            .primary_input()
            .cloned()
            .ok_or_else(|| NodeError::MissingInput("input".into()))?;

        let format = ctx.config_str("format").unwrap_or_else(|| "text".into());
        let formatted = match format.as_str() {
            "json" => Value::Json(value.to_json()),
            "text" => Value::String(value.to_text()),
            "markdown" => Value::String(value.to_text()),
            other => {
                return Err(NodeError::Configuration(format!(
                    "unknown output format: {other}"
                )))
            }
        };
        Ok(NodeOutput::value(formatted))
    }
}

pub struct OutputNodeFactory;

impl NodeFactory for OutputNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(OutputNode))
    }

    fn spec_id(&self) -> &str {
        SPEC_OUTPUT
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Format and expose a workflow result".to_string(),
            category: "io".to_string(),
        }
    }
}
