use crate::{DuplicatePolicy, TaskConfig};
use serde::{Deserialize, Serialize};

/// Serialized description of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: PipelineSettings,
    pub root: NodeSpec,
}

impl PipelineDef {
    pub fn new(name: impl Into<String>, root: NodeSpec) -> Self {
        Self {
            name: name.into(),
            description: None,
            settings: PipelineSettings::default(),
            root,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// One node of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeSpec {
    Task {
        /// Defaults to the task type with `.` replaced by `_`
        #[serde(default)]
        name: Option<String>,
        task_type: String,
        #[serde(default)]
        config: TaskConfig,
    },
    Sequential {
        name: String,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Parallel {
        name: String,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
}

impl NodeSpec {
    pub fn task(task_type: impl Into<String>) -> Self {
        NodeSpec::Task {
            name: None,
            task_type: task_type.into(),
            config: TaskConfig::default(),
        }
    }

    pub fn sequential(name: impl Into<String>, children: Vec<NodeSpec>) -> Self {
        NodeSpec::Sequential {
            name: name.into(),
            children,
        }
    }

    pub fn parallel(name: impl Into<String>, children: Vec<NodeSpec>) -> Self {
        NodeSpec::Parallel {
            name: name.into(),
            children,
        }
    }

    /// Set the node name. No effect on composites, whose name is mandatory.
    pub fn with_name(mut self, new_name: impl Into<String>) -> Self {
        if let NodeSpec::Task { name, .. } = &mut self {
            *name = Some(new_name.into());
        }
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let NodeSpec::Task { config, .. } = &mut self {
            *config = std::mem::take(config).with(key, value);
        }
        self
    }

    pub fn name(&self) -> String {
        match self {
            NodeSpec::Task {
                name: Some(name), ..
            } => name.clone(),
            NodeSpec::Task { task_type, .. } => task_type.replace('.', "_"),
            NodeSpec::Sequential { name, .. } | NodeSpec::Parallel { name, .. } => name.clone(),
        }
    }
}

/// Settings applied when a definition is built and run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_max_parallel")]
    pub max_parallel_nodes: usize,
    /// Definitions reject duplicate names unless told otherwise
    #[serde(default = "default_duplicate_policy")]
    pub duplicate_policy: DuplicatePolicy,
}

fn default_max_parallel() -> usize {
    10
}

fn default_duplicate_policy() -> DuplicatePolicy {
    DuplicatePolicy::Reject
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel(),
            duplicate_policy: default_duplicate_policy(),
        }
    }
}
