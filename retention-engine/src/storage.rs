use crate::classification::DataClassification;
use crate::error::{RetentionError, RetentionResult};
use crate::policy::StorageTier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A retained data item tracked by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataItem {
    pub id: String,
    pub data_type: String,
    pub classification: Option<DataClassification>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub current_tier: StorageTier,
    #[serde(default)]
    pub size_bytes: u64,
    /// Governing policy; resolved by applicability when absent
    pub policy_id: Option<Uuid>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl DataItem {
    pub fn new(
        id: impl Into<String>,
        data_type: impl Into<String>,
        created_at: DateTime<Utc>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            data_type: data_type.into(),
            classification: None,
            tenant_id: None,
            created_at,
            current_tier: StorageTier::Hot,
            size_bytes,
            policy_id: None,
            tags: HashMap::new(),
        }
    }

    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_policy(mut self, policy_id: Uuid) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    pub fn with_tier(mut self, tier: StorageTier) -> Self {
        self.current_tier = tier;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful backend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOutcome {
    pub bytes_affected: u64,
}

/// Tiered storage backend that physically moves and destroys bytes
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Move an item to another tier
    async fn transition(&self, data_id: &str, target: StorageTier) -> RetentionResult<StorageOutcome>;

    /// Permanently destroy an item
    async fn delete(&self, data_id: &str) -> RetentionResult<StorageOutcome>;

    /// Flag or unflag an item as held in backend metadata
    async fn set_held_flag(&self, data_id: &str, held: bool, hold_id: Uuid) -> RetentionResult<()>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    tier: StorageTier,
    size: u64,
    held_by: HashSet<Uuid>,
}

/// Backend operation names used for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    Transition,
    Delete,
    SetHeldFlag,
}

/// In-memory storage backend for development/testing
#[derive(Default)]
pub struct InMemoryStorageBackend {
    objects: DashMap<String, StoredObject>,
    injected_failures: DashMap<(String, BackendOperation), u32>,
    calls: DashMap<BackendOperation, u64>,
}

impl InMemoryStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object so that later operations can find it
    pub fn put(&self, data_id: impl Into<String>, size: u64, tier: StorageTier) {
        self.objects.insert(
            data_id.into(),
            StoredObject {
                tier,
                size,
                held_by: HashSet::new(),
            },
        );
    }

    pub fn tier_of(&self, data_id: &str) -> Option<StorageTier> {
        self.objects.get(data_id).map(|o| o.tier)
    }

    pub fn contains(&self, data_id: &str) -> bool {
        self.objects.contains_key(data_id)
    }

    pub fn is_flagged(&self, data_id: &str) -> bool {
        self.objects
            .get(data_id)
            .map(|o| !o.held_by.is_empty())
            .unwrap_or(false)
    }

    /// Make the next `count` calls of `operation` for `data_id` fail
    pub fn inject_failures(&self, data_id: impl Into<String>, operation: BackendOperation, count: u32) {
        self.injected_failures.insert((data_id.into(), operation), count);
    }

    /// Number of calls received for an operation (for testing/development)
    pub fn call_count(&self, operation: BackendOperation) -> u64 {
        self.calls.get(&operation).map(|c| *c).unwrap_or(0)
    }

    fn record_call(&self, data_id: &str, operation: BackendOperation) -> RetentionResult<()> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let key = (data_id.to_string(), operation);
        if let Some(mut remaining) = self.injected_failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RetentionError::Backend(format!(
                    "injected {:?} failure for {}",
                    operation, data_id
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for InMemoryStorageBackend {
    async fn transition(&self, data_id: &str, target: StorageTier) -> RetentionResult<StorageOutcome> {
        self.record_call(data_id, BackendOperation::Transition)?;

        let mut object = self
            .objects
            .get_mut(data_id)
            .ok_or_else(|| RetentionError::Backend(format!("object {} not found", data_id)))?;
        object.tier = target;

        Ok(StorageOutcome {
            bytes_affected: object.size,
        })
    }

    async fn delete(&self, data_id: &str) -> RetentionResult<StorageOutcome> {
        self.record_call(data_id, BackendOperation::Delete)?;

        if self.is_flagged(data_id) {
            return Err(RetentionError::InvariantViolation(format!(
                "object {} is under legal hold",
                data_id
            )));
        }

        let (_, object) = self
            .objects
            .remove(data_id)
            .ok_or_else(|| RetentionError::Backend(format!("object {} not found", data_id)))?;

        Ok(StorageOutcome {
            bytes_affected: object.size,
        })
    }

    async fn set_held_flag(&self, data_id: &str, held: bool, hold_id: Uuid) -> RetentionResult<()> {
        self.record_call(data_id, BackendOperation::SetHeldFlag)?;

        let mut object = self
            .objects
            .get_mut(data_id)
            .ok_or_else(|| RetentionError::Backend(format!("object {} not found", data_id)))?;

        if held {
            object.held_by.insert(hold_id);
        } else {
            object.held_by.remove(&hold_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transition_and_delete() {
        let backend = InMemoryStorageBackend::new();
        backend.put("a", 512, StorageTier::Hot);

        let outcome = backend.transition("a", StorageTier::Cold).await.unwrap();
        assert_eq!(outcome.bytes_affected, 512);
        assert_eq!(backend.tier_of("a"), Some(StorageTier::Cold));

        let outcome = backend.delete("a").await.unwrap();
        assert_eq!(outcome.bytes_affected, 512);
        assert!(!backend.contains("a"));
    }

    #[tokio::test]
    async fn test_held_object_cannot_be_deleted() {
        let backend = InMemoryStorageBackend::new();
        let hold_id = Uuid::new_v4();
        backend.put("protected", 10, StorageTier::Hot);
        backend.set_held_flag("protected", true, hold_id).await.unwrap();

        let result = backend.delete("protected").await;
        assert!(matches!(result, Err(RetentionError::InvariantViolation(_))));

        backend.set_held_flag("protected", false, hold_id).await.unwrap();
        assert!(backend.delete("protected").await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let backend = InMemoryStorageBackend::new();
        backend.put("flaky", 1, StorageTier::Hot);
        backend.inject_failures("flaky", BackendOperation::Transition, 2);

        assert!(backend.transition("flaky", StorageTier::Warm).await.is_err());
        assert!(backend.transition("flaky", StorageTier::Warm).await.is_err());
        assert!(backend.transition("flaky", StorageTier::Warm).await.is_ok());
        assert_eq!(backend.call_count(BackendOperation::Transition), 3);
    }

    #[tokio::test]
    async fn test_missing_object_is_backend_error() {
        let backend = InMemoryStorageBackend::new();
        let err = backend.transition("ghost", StorageTier::Warm).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
