use loomcore::{InputPolicy, Node, NodeError, ValidationError, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Spec id this factory handles
    fn spec_id(&self) -> &str;

    /// Readiness rule the scheduler applies to nodes of this type.
    /// Merge-type nodes override this to tolerate partial input.
    fn input_policy(&self) -> InputPolicy {
        InputPolicy::AllSuccess
    }

    /// Optional: Get node type metadata (description, category)
    fn metadata(&self) -> NodeTypeInfo {
        NodeTypeInfo::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeTypeInfo {
    pub description: String,
    pub category: String,
}

impl Default for NodeTypeInfo {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of available node types. One dispatch point: adding a node
/// type never touches the scheduler.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory. A later registration for the same spec id
    /// replaces the earlier one, which is how tests substitute stubs for
    /// network-backed executors.
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let spec_id = factory.spec_id().to_string();
        tracing::debug!("Registering node type: {}", spec_id);
        self.factories.insert(spec_id, factory);
    }

    pub fn contains(&self, spec_id: &str) -> bool {
        self.factories.contains_key(spec_id)
    }

    /// Create a node instance from a spec id and config
    pub fn create_node(
        &self,
        spec_id: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, ValidationError> {
        let factory = self
            .factories
            .get(spec_id)
            .ok_or_else(|| ValidationError::UnknownSpecId(spec_id.to_string()))?;

        factory
            .create(config)
            .map_err(|e| ValidationError::Invalid(format!("Failed to create node: {}", e)))
    }

    pub fn input_policy(&self, spec_id: &str) -> Option<InputPolicy> {
        self.factories.get(spec_id).map(|f| f.input_policy())
    }

    /// Get all registered node types
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, spec_id: &str) -> Option<NodeTypeInfo> {
        self.factories.get(spec_id).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
