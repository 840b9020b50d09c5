//! Saga instance storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use tokio::sync::RwLock;

use crate::instance::SagaInstance;

/// Port for persisting saga instances, keyed by instance ID.
///
/// All orchestrator mutations go through [`update`](Self::update),
/// which implementations must apply atomically per instance so that
/// concurrent step settlements serialize correctly.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Inserts a new instance. Returns false when the ID is taken.
    async fn insert(&self, instance: SagaInstance) -> bool;

    /// Fetches a copy of an instance.
    async fn get(&self, id: SagaId) -> Option<SagaInstance>;

    /// All stored instances, in unspecified order.
    async fn list(&self) -> Vec<SagaInstance>;

    /// Applies `mutate` to the stored instance and returns the updated
    /// copy, or None when no such instance exists.
    async fn update(
        &self,
        id: SagaId,
        mutate: Box<dyn for<'a> FnOnce(&'a mut SagaInstance) + Send>,
    ) -> Option<SagaInstance>;

    /// Removes an instance, returning it when present.
    async fn remove(&self, id: SagaId) -> Option<SagaInstance>;
}

/// In-memory instance store.
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.instances.read().await.len()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn insert(&self, instance: SagaInstance) -> bool {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return false;
        }
        instances.insert(instance.id, instance);
        true
    }

    async fn get(&self, id: SagaId) -> Option<SagaInstance> {
        self.instances.read().await.get(&id).cloned()
    }

    async fn list(&self) -> Vec<SagaInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    async fn update(
        &self,
        id: SagaId,
        mutate: Box<dyn for<'a> FnOnce(&'a mut SagaInstance) + Send>,
    ) -> Option<SagaInstance> {
        let mut instances = self.instances.write().await;
        let instance = instances.get_mut(&id)?;
        mutate(instance);
        Some(instance.clone())
    }

    async fn remove(&self, id: SagaId) -> Option<SagaInstance> {
        self.instances.write().await.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SagaStatus;
    use chrono::Utc;

    fn instance() -> SagaInstance {
        SagaInstance::new(SagaId::new(), "order-fulfillment", Utc::now())
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let store = InMemoryInstanceStore::new();
        let instance = instance();

        assert!(store.insert(instance.clone()).await);
        assert!(!store.insert(instance).await);
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test]
    async fn test_update_mutates_stored_instance() {
        let store = InMemoryInstanceStore::new();
        let instance = instance();
        let id = instance.id;
        store.insert(instance).await;

        let updated = store
            .update(
                id,
                Box::new(|instance| {
                    instance.status = SagaStatus::Running;
                    instance.mark_step_active("reserve");
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, SagaStatus::Running);
        assert!(updated.active_steps.contains("reserve"));

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.status, SagaStatus::Running);
    }

    #[tokio::test]
    async fn test_update_missing_instance_returns_none() {
        let store = InMemoryInstanceStore::new();
        let result = store
            .update(SagaId::new(), Box::new(|_| unreachable!()))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_remove_returns_instance() {
        let store = InMemoryInstanceStore::new();
        let instance = instance();
        let id = instance.id;
        store.insert(instance).await;

        assert!(store.remove(id).await.is_some());
        assert!(store.remove(id).await.is_none());
        assert!(store.get(id).await.is_none());
        assert_eq!(store.count().await, 0);
    }
}
