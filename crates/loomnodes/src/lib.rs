//! Standard node library
//!
//! One executor per spec id, all registered through [`register_all`].

mod ai;
mod condition;
mod http;
mod io;
mod looping;
mod merge;
mod template;
mod time;
mod transform;

pub use ai::{AiChatNode, AiEmbeddingsNode, AiImageNode};
pub use condition::ConditionNode;
pub use http::HttpRequestNode;
pub use io::{InputNode, OutputNode};
pub use looping::{LoopEndNode, LoopNode};
pub use merge::{MergeJsonNode, MergeNode};
pub use template::TemplateNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};

use loomruntime::NodeRegistry;
use std::sync::Arc;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(io::InputNodeFactory));
    registry.register(Arc::new(io::OutputNodeFactory));
    registry.register(Arc::new(merge::MergeNodeFactory));
    registry.register(Arc::new(merge::MergeJsonNodeFactory));
    registry.register(Arc::new(condition::ConditionNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
    registry.register(Arc::new(looping::LoopNodeFactory));
    registry.register(Arc::new(looping::LoopEndNodeFactory));
    registry.register(Arc::new(template::TemplateNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(http::HttpRequestNodeFactory));
    registry.register(Arc::new(ai::AiChatNodeFactory));
    registry.register(Arc::new(ai::AiEmbeddingsNodeFactory));
    registry.register(Arc::new(ai::AiImageNodeFactory));
}

#[cfg(test)]
pub(crate) mod test_support {
    use loomcore::{EventBus, ExecutionId, NodeContext, PortValue, Value};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Build a node context from (port, value) pairs in declaration order.
    pub fn context_with_ports(ports: Vec<(&str, Value)>) -> NodeContext {
        let bus = EventBus::new(64);
        let node_id = "n1".to_string();
        let mut inputs = HashMap::new();
        let mut port_values = Vec::new();
        for (port, value) in ports {
            inputs.insert(port.to_string(), value.clone());
            port_values.push(PortValue {
                port: port.to_string(),
                value,
            });
        }
        NodeContext {
            node_id: node_id.clone(),
            inputs,
            port_values,
            config: HashMap::new(),
            flow_inputs: Arc::new(HashMap::new()),
            events: bus.create_emitter(ExecutionId::new_v4(), node_id),
            cancellation: tokio_util::sync::CancellationToken::new(),
            scope: None,
            judge: None,
        }
    }
}
