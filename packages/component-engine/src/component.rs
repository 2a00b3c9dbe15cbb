//! Component identity: what a component is and where it lives.

use std::fmt;

use crate::exec_scope::ModuleId;
use crate::scheduler::ProcessingType;

/// Where a component sits inside its routable pipeline.
///
/// Components that are not attached to a pipeline have no location, and
/// policy interception is skipped for them entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentLocation {
    root_container: String,
    path: String,
}

impl ComponentLocation {
    /// A location inside `root_container` (for example a flow name) at
    /// `path` (for example `processors/2`).
    pub fn new(root_container: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            root_container: root_container.into(),
            path: path.into(),
        }
    }

    pub fn root_container(&self) -> &str {
        &self.root_container
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The full location string, `root_container/path`.
    pub fn location(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ComponentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.root_container, self.path)
    }
}

/// Static description of a component.
#[derive(Debug, Clone)]
pub struct ComponentModel {
    name: String,
    module: ModuleId,
    processing_type: ProcessingType,
    requires_config: bool,
}

impl ComponentModel {
    /// A CPU-lite component of the given module that needs no configuration.
    pub fn new(name: impl Into<String>, module: impl Into<ModuleId>) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            processing_type: ProcessingType::CpuLite,
            requires_config: false,
        }
    }

    pub fn with_processing_type(mut self, processing_type: ProcessingType) -> Self {
        self.processing_type = processing_type;
        self
    }

    pub fn with_requires_config(mut self, requires_config: bool) -> Self {
        self.requires_config = requires_config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module the component's executor belongs to. It is the current
    /// module while the executor runs.
    pub fn module(&self) -> &ModuleId {
        &self.module
    }

    /// The processing type the component declares.
    pub fn processing_type(&self) -> ProcessingType {
        self.processing_type
    }

    pub fn requires_config(&self) -> bool {
        self.requires_config
    }
}
