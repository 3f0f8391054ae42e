use std::collections::HashMap;
use std::sync::Arc;

use idstore::execution::{ExecutionCondition, ExecutionTarget, TargetQuerier};
use idstore::{EventstoreResult, InstanceId};
use parking_lot::RwLock;

/// Execution targets registered per instance and condition.
#[derive(Clone, Default)]
pub struct InMemoryTargetQuerier {
    targets: Arc<RwLock<HashMap<(InstanceId, String), Vec<ExecutionTarget>>>>,
}

impl InMemoryTargetQuerier {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the targets of `condition` within `instance`.
    pub fn set_targets(
        &self,
        instance: &InstanceId,
        condition: &ExecutionCondition,
        targets: Vec<ExecutionTarget>,
    ) {
        let key = (instance.clone(), condition.id());
        let mut registry = self.targets.write();
        if targets.is_empty() {
            registry.remove(&key);
        } else {
            registry.insert(key, targets);
        }
    }
}

impl TargetQuerier for InMemoryTargetQuerier {
    async fn targets_by_conditions(
        &self,
        instance: &InstanceId,
        condition_ids: &[String],
    ) -> EventstoreResult<HashMap<String, Vec<ExecutionTarget>>> {
        let registry = self.targets.read();
        Ok(condition_ids
            .iter()
            .filter_map(|id| {
                registry
                    .get(&(instance.clone(), id.clone()))
                    .map(|targets| (id.clone(), targets.clone()))
            })
            .collect())
    }
}
