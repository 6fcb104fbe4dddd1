//! Tool registry
//!
//! Holds every registered ToolDescriptor and answers type-compatibility
//! lookups for the planner. Registration happens at startup; afterwards the
//! registry is shared read-only (usually behind an `Arc`).

use std::collections::HashMap;

use thiserror::Error;

use crate::tool::ToolDescriptor;
use crate::types::SemanticType;

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

/// Tool registry for looking up tools by id or type compatibility
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
    /// Registration order, keeps lookups deterministic
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; ids must be unique
    pub fn register(&mut self, tool: ToolDescriptor) -> Result<(), RegistryError> {
        if self.tools.contains_key(&tool.id) {
            return Err(RegistryError::DuplicateTool(tool.id));
        }
        tracing::debug!(
            tool = %tool.id,
            inputs = ?tool.inputs,
            outputs = ?tool.outputs,
            "tool registered"
        );
        self.order.push(tool.id.clone());
        self.tools.insert(tool.id.clone(), tool);
        Ok(())
    }

    /// Get a tool by id
    pub fn get(&self, id: &str) -> Option<&ToolDescriptor> {
        self.tools.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    /// All tools in registration order
    pub fn tools(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.order.iter().filter_map(|id| self.tools.get(id))
    }

    /// Tool ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Tools with an output compatible with `target_type`
    pub fn find_producers(&self, target_type: &SemanticType) -> Vec<&ToolDescriptor> {
        self.tools().filter(|t| t.produces(target_type)).collect()
    }

    /// Tools with an input that accepts `source_type`
    pub fn find_consumers(&self, source_type: &SemanticType) -> Vec<&ToolDescriptor> {
        self.tools().filter(|t| t.consumes(source_type)).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}
