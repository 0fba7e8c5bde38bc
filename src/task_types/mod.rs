//! Task types available to the binary.

mod command;

pub use command::CommandTaskType;

use crate::config::TaskTypeSettings;
use crate::scheduler::TaskTypeRegistry;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Build the registry from configured task types, in configuration order.
pub fn build_registry(settings: &[TaskTypeSettings]) -> Result<TaskTypeRegistry> {
    let mut registry = TaskTypeRegistry::new();
    for entry in settings {
        registry.register(Arc::new(CommandTaskType::new(entry)))?;
        info!(
            "Registered task type {} ({}, threshold {})",
            entry.name, entry.command, entry.failure_threshold
        );
    }
    Ok(registry)
}
