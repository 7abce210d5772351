use async_trait::async_trait;
use loomcore::{Node, NodeContext, NodeError, NodeOutput, Value};
use loomruntime::{NodeFactory, NodeTypeInfo};
use std::collections::HashMap;

/// Substitutes `{{name}}` tokens in a string template with values taken
/// from upstream inputs, falling back to config entries.
pub struct TemplateNode;

#[async_trait]
impl Node for TemplateNode {
    fn spec_id(&self) -> &str {
        "template"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let template = ctx
            .config_str("template")
            .ok_or_else(|| NodeError::Configuration("template node requires a template".into()))?;

        let rendered = render(&template, |name| {
            ctx.input_or_config(name).map(|v| v.to_text())
        })?;
        Ok(NodeOutput::value(rendered))
    }
}

fn render<F>(template: &str, lookup: F) -> Result<String, NodeError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated token: keep the raw text.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        let value = lookup(name).ok_or_else(|| {
            NodeError::ExecutionFailed(format!("unknown template token: {{{{{name}}}}}"))
        })?;
        out.push_str(&value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

pub struct TemplateNodeFactory;

impl NodeFactory for TemplateNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(TemplateNode))
    }

    fn spec_id(&self) -> &str {
        "template"
    }

    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            description: "Fill {{name}} tokens from inputs and config".to_string(),
            category: "transform".to_string(),
        }
    }
}
