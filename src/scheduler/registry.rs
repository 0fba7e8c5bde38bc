use super::task_type::TaskType;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Task type already registered: {0}")]
    Duplicate(String),
}

/// Registered task types, in registration order.
///
/// Built once at startup and shared read-only with the engine.
#[derive(Default)]
pub struct TaskTypeRegistry {
    types: Vec<Arc<dyn TaskType>>,
}

impl TaskTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: Arc<dyn TaskType>) -> Result<(), RegistryError> {
        let name = task_type.name().to_string();
        if self.get(&name).is_some() {
            return Err(RegistryError::Duplicate(name));
        }
        info!(
            "Registering task type: {} (failure threshold {})",
            name,
            task_type.failure_threshold()
        );
        self.types.push(task_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskType>> {
        self.types.iter().find(|t| t.name() == name).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.types.iter().map(|t| t.name().to_string()).collect()
    }

    /// Task types in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TaskType>> {
        self.types.iter()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor_store::TaskRecord;
    use crate::scheduler::{ExecutionContext, TaskError};
    use async_trait::async_trait;

    struct NamedType(&'static str);

    #[async_trait]
    impl TaskType for NamedType {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            _record: &TaskRecord,
        ) -> Result<serde_json::Value, TaskError> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_registration_order_is_preserved() {
        let mut registry = TaskTypeRegistry::new();
        registry.register(Arc::new(NamedType("insight_refresh"))).unwrap();
        registry.register(Arc::new(NamedType("audit"))).unwrap();
        registry.register(Arc::new(NamedType("credential_health"))).unwrap();

        assert_eq!(
            registry.registered_types(),
            vec!["insight_refresh", "audit", "credential_health"]
        );
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = TaskTypeRegistry::new();
        registry.register(Arc::new(NamedType("audit"))).unwrap();

        let err = registry.register(Arc::new(NamedType("audit"))).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "audit"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_type() {
        let registry = TaskTypeRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get("audit").is_none());
    }
}
