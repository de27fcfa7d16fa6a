use pipecore::{
    NodeError, NodeId, NodeKind, NodeSpec, NotFoundError, PipeError, Pipeline, PipelineDef, Task,
    TaskConfig,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating task instances
pub trait TaskFactory: Send + Sync {
    /// Create a fresh task instance with the given (already merged) configuration
    fn create(&self, config: &TaskConfig) -> Result<Box<dyn Task>, NodeError>;

    /// Get task type identifier
    fn task_type(&self) -> &str;

    /// Configuration every instance starts from before overrides
    fn default_config(&self) -> TaskConfig {
        TaskConfig::default()
    }

    /// Whether independent instances may run concurrently in a batch pool
    fn supports_pool(&self) -> bool {
        true
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata::default()
    }
}

/// Descriptive metadata about a task type
#[derive(Debug, Clone)]
pub struct TaskMetadata {
    pub description: String,
    pub category: String,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

/// Registry of task types and named composites.
///
/// Built explicitly at startup and passed to whoever needs it.
pub struct TaskRegistry {
    factories: HashMap<String, Arc<dyn TaskFactory>>,
    composites: HashMap<String, PipelineDef>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            composites: HashMap::new(),
        }
    }

    /// Register a task factory
    pub fn register(&mut self, factory: Arc<dyn TaskFactory>) {
        let task_type = factory.task_type().to_string();
        tracing::debug!("Registering task type: {}", task_type);
        self.factories.insert(task_type, factory);
    }

    /// Register a named composite definition
    pub fn register_composite(&mut self, def: PipelineDef) {
        tracing::debug!("Registering composite: {}", def.name);
        self.composites.insert(def.name.clone(), def);
    }

    pub fn factory(&self, task_type: &str) -> Result<Arc<dyn TaskFactory>, NotFoundError> {
        self.factories
            .get(task_type)
            .cloned()
            .ok_or_else(|| NotFoundError::TaskType(task_type.to_string()))
    }

    /// Factory defaults merged with `overrides`
    pub fn resolve_config(
        &self,
        task_type: &str,
        overrides: &TaskConfig,
    ) -> Result<TaskConfig, NotFoundError> {
        Ok(self.factory(task_type)?.default_config().merged(overrides))
    }

    /// Create a task instance from a task type and config overrides
    pub fn create_task(
        &self,
        task_type: &str,
        overrides: &TaskConfig,
    ) -> Result<(Box<dyn Task>, TaskConfig), PipeError> {
        let config = self.resolve_config(task_type, overrides)?;
        let task = self.factory(task_type)?.create(&config)?;
        Ok((task, config))
    }

    pub fn composite(&self, name: &str) -> Result<&PipelineDef, NotFoundError> {
        self.composites
            .get(name)
            .ok_or_else(|| NotFoundError::Composite(name.to_string()))
    }

    /// Build a registered composite by name
    pub fn build_named(&self, name: &str) -> Result<Pipeline, PipeError> {
        self.build(self.composite(name)?)
    }

    /// Instantiate every node of `def` and link them into a new pipeline
    pub fn build(&self, def: &PipelineDef) -> Result<Pipeline, PipeError> {
        let mut pipeline =
            Pipeline::new(def.name.clone()).with_duplicate_policy(def.settings.duplicate_policy);
        let root = self.build_node(&mut pipeline, &def.root)?;
        pipeline.set_root(root)?;
        tracing::debug!(pipeline = %def.name, nodes = pipeline.len(), "pipeline built");
        Ok(pipeline)
    }

    fn build_node(&self, pipeline: &mut Pipeline, spec: &NodeSpec) -> Result<NodeId, PipeError> {
        match spec {
            NodeSpec::Task {
                task_type, config, ..
            } => {
                let (task, config) = self.create_task(task_type, config)?;
                Ok(pipeline.add_task(&spec.name(), task, config)?)
            }
            NodeSpec::Sequential { name, children } | NodeSpec::Parallel { name, children } => {
                let kind = match spec {
                    NodeSpec::Sequential { .. } => NodeKind::Sequential,
                    _ => NodeKind::Parallel,
                };
                let id = pipeline.add_composite(name, kind, TaskConfig::default())?;
                let mut child_ids = Vec::with_capacity(children.len());
                for child in children {
                    child_ids.push(self.build_node(pipeline, child)?);
                }
                pipeline.link(id, &child_ids)?;
                Ok(id)
            }
        }
    }

    /// Get all registered task types, sorted
    pub fn list_task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get all registered composite names, sorted
    pub fn list_composites(&self) -> Vec<String> {
        let mut names: Vec<String> = self.composites.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get metadata for a task type
    pub fn get_metadata(&self, task_type: &str) -> Option<TaskMetadata> {
        self.factories.get(task_type).map(|f| f.metadata())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
