use crate::config::EngineConfig;
use crate::error::{RetentionError, RetentionResult};
use crate::events::{spawn_notifier, EventBus, EventKind, LifecycleEvent, Notifier};
use crate::executor::{EntryError, ExecutionResult, RetentionExecutor};
use crate::hold::{Custodian, HoldApplication, HoldRelease, LegalHold, LegalHoldRegistry};
use crate::locks::DataLocks;
use crate::policy::RetentionPolicy;
use crate::report::{build_report, RetentionReport};
use crate::schedule::{EntryStatus, RetentionScheduleEntry, ScheduleGenerator};
use crate::storage::{DataItem, StorageBackend};
use crate::store::{EntryQuery, PolicyCache, RetentionStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Main retention engine integrating policies, schedules, holds and execution
pub struct RetentionEngine {
    store: Arc<dyn RetentionStore>,
    policies: PolicyCache,
    holds: Arc<LegalHoldRegistry>,
    executor: RetentionExecutor,
    locks: Arc<DataLocks>,
    events: Arc<EventBus>,
    config: EngineConfig,
}

impl RetentionEngine {
    /// Create an engine over existing state
    ///
    /// Rebuilds the hold index and returns entries interrupted mid-execution
    /// to `pending`.
    pub async fn new(
        store: Arc<dyn RetentionStore>,
        backend: Arc<dyn StorageBackend>,
        config: EngineConfig,
    ) -> RetentionResult<Self> {
        config.validate()?;

        let locks = Arc::new(DataLocks::new());
        let events = Arc::new(EventBus::new(config.event_channel_capacity));
        let holds = Arc::new(LegalHoldRegistry::new(
            store.clone(),
            backend.clone(),
            locks.clone(),
            events.clone(),
        ));
        let executor = RetentionExecutor::new(
            store.clone(),
            backend,
            holds.clone(),
            locks.clone(),
            events.clone(),
            config.clone(),
        );

        holds.rebuild_index().await?;
        executor.recover_in_flight(Utc::now()).await?;

        Ok(Self {
            policies: PolicyCache::new(store.clone(), config.policy_cache_capacity),
            store,
            holds,
            executor,
            locks,
            events,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receiver for one event kind; each kind can be subscribed once
    pub fn subscribe(&self, kind: EventKind) -> Option<mpsc::Receiver<LifecycleEvent>> {
        self.events.subscribe(kind)
    }

    /// Forward events of the given kinds to an external notifier
    pub fn spawn_notifier(&self, kinds: &[EventKind], notifier: Arc<dyn Notifier>) -> Vec<JoinHandle<()>> {
        spawn_notifier(&self.events, kinds, notifier)
    }

    pub fn is_held(&self, data_id: &str) -> bool {
        self.holds.is_held(data_id)
    }

    /// Create a retention policy at version 1
    pub async fn create_policy(&self, mut policy: RetentionPolicy) -> RetentionResult<RetentionPolicy> {
        policy.validate()?;

        if self.policies.get(policy.id).await?.is_some() {
            return Err(RetentionError::Validation(format!(
                "Policy {} already exists; use update_policy",
                policy.id
            )));
        }

        let now = Utc::now();
        policy.version = 1;
        policy.created_at = now;
        policy.updated_at = now;
        self.policies.put(policy.clone()).await?;

        info!(policy_id = %policy.id, name = %policy.name, "Created retention policy");
        self.events.publish(LifecycleEvent::PolicyCreated {
            policy_id: policy.id,
            version: policy.version,
            at: now,
        });
        Ok(policy)
    }

    /// Store a new version of a policy and regenerate the open schedule of
    /// every item it governs
    pub async fn update_policy(&self, mut policy: RetentionPolicy) -> RetentionResult<RetentionPolicy> {
        policy.validate()?;

        let current = self
            .policies
            .get(policy.id)
            .await?
            .ok_or_else(|| RetentionError::NotFound(format!("policy {}", policy.id)))?;

        let now = Utc::now();
        policy.version = current.version + 1;
        policy.created_at = current.created_at;
        policy.updated_at = now;
        self.policies.put(policy.clone()).await?;

        let mut regenerated = 0;
        for item in self.store.list_data_items().await? {
            if item.policy_id != Some(policy.id) {
                continue;
            }
            let _guard = self.locks.acquire(&item.id).await;
            match self.regenerate(&item, &policy, now).await {
                Ok(_) => regenerated += 1,
                Err(e @ RetentionError::Validation(_)) => {
                    warn!(data_id = %item.id, policy_id = %policy.id, error = %e, "Keeping previous schedule");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            policy_id = %policy.id,
            version = policy.version,
            regenerated,
            "Updated retention policy"
        );
        self.events.publish(LifecycleEvent::PolicyUpdated {
            policy_id: policy.id,
            version: policy.version,
            regenerated_items: regenerated,
            at: now,
        });
        Ok(policy)
    }

    pub async fn get_policy(&self, id: Uuid) -> RetentionResult<Option<RetentionPolicy>> {
        self.policies.get(id).await
    }

    pub async fn list_policies(&self) -> RetentionResult<Vec<RetentionPolicy>> {
        self.store.list_policies().await
    }

    /// Every stored version of a policy, oldest first
    pub async fn policy_history(&self, id: Uuid) -> RetentionResult<Vec<RetentionPolicy>> {
        self.store.policy_history(id).await
    }

    /// Register a data item and generate its schedule
    pub async fn register_data(&self, mut item: DataItem) -> RetentionResult<Vec<RetentionScheduleEntry>> {
        let policy = self.resolve_policy(&item).await?;
        item.policy_id = Some(policy.id);

        let _guard = self.locks.acquire(&item.id).await;
        if self.store.get_data_item(&item.id).await?.is_some() {
            return Err(RetentionError::Validation(format!(
                "Data item {} is already registered",
                item.id
            )));
        }

        self.store.put_data_item(item.clone()).await?;
        let entries = match self.regenerate(&item, &policy, Utc::now()).await {
            Ok(entries) => entries,
            Err(e) => {
                self.store.delete_data_item(&item.id).await?;
                return Err(e);
            }
        };

        info!(data_id = %item.id, policy_id = %policy.id, entries = entries.len(), "Registered data item");
        Ok(entries)
    }

    async fn resolve_policy(&self, item: &DataItem) -> RetentionResult<RetentionPolicy> {
        if let Some(policy_id) = item.policy_id {
            return self
                .policies
                .get(policy_id)
                .await?
                .ok_or_else(|| RetentionError::NotFound(format!("policy {}", policy_id)));
        }

        self.store
            .list_policies()
            .await?
            .into_iter()
            .find(|policy| policy.applies_to(item))
            .ok_or_else(|| {
                RetentionError::Validation(format!(
                    "No enabled policy applies to data item {} of type {}",
                    item.id, item.data_type
                ))
            })
    }

    /// Replace the open entries of an item with a fresh chain; caller holds
    /// the item lock
    async fn regenerate(
        &self,
        item: &DataItem,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> RetentionResult<Vec<RetentionScheduleEntry>> {
        let mut entries = ScheduleGenerator::generate(item, policy)?;

        for entry in self
            .store
            .query_entries(&EntryQuery::new().data(item.id.as_str()))
            .await?
        {
            if entry.is_open() {
                self.store.delete_entry(entry.id).await?;
            }
        }

        let held = self.holds.is_held(&item.id);
        for entry in &mut entries {
            if held {
                entry.status = EntryStatus::Paused;
            }
            self.store.put_entry(entry.clone()).await?;
        }

        self.events.publish(LifecycleEvent::ScheduleGenerated {
            data_id: item.id.clone(),
            policy_id: policy.id,
            policy_version: policy.version,
            entries: entries.len(),
            at: now,
        });
        Ok(entries)
    }

    /// Full schedule of one item in chain order
    pub async fn schedule_for(&self, data_id: &str) -> RetentionResult<Vec<RetentionScheduleEntry>> {
        self.store.query_entries(&EntryQuery::new().data(data_id)).await
    }

    pub async fn run_tick(&self, policy_id: Option<Uuid>) -> RetentionResult<Vec<ExecutionResult>> {
        self.run_tick_at(policy_id, Utc::now()).await
    }

    /// Expire lapsed holds, then execute due entries of one or every enabled
    /// policy
    ///
    /// A failing policy is reported in its result and never stops the others.
    pub async fn run_tick_at(
        &self,
        policy_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> RetentionResult<Vec<ExecutionResult>> {
        for release in self.holds.expire_holds(now).await? {
            self.reinstate(&release, now).await?;
        }

        let policies = match policy_id {
            Some(id) => vec![self
                .policies
                .get(id)
                .await?
                .ok_or_else(|| RetentionError::NotFound(format!("policy {}", id)))?],
            None => self.store.list_policies().await?,
        };

        let mut results = Vec::new();
        for policy in policies {
            if !policy.enabled {
                info!(policy_id = %policy.id, "Skipping disabled policy");
                continue;
            }

            match self.executor.execute_policy(&policy, now).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(policy_id = %policy.id, error = %e, "Policy execution failed");
                    let mut result = ExecutionResult::new(policy.id, policy.version, now);
                    result.errors.push(EntryError {
                        entry_id: None,
                        data_id: None,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    results.push(result);
                }
            }
        }

        self.locks.prune();
        self.prune_history(now).await?;
        Ok(results)
    }

    async fn prune_history(&self, now: DateTime<Utc>) -> RetentionResult<()> {
        let Some(cutoff) = now.checked_sub_signed(Duration::days(i64::from(self.config.execution_history_days)))
        else {
            return Ok(());
        };

        let pruned = self.store.prune_executions(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, %cutoff, "Pruned execution history");
        }
        Ok(())
    }

    pub async fn apply_legal_hold(&self, hold: LegalHold, data_ids: &[String]) -> RetentionResult<HoldApplication> {
        self.apply_legal_hold_at(hold, data_ids, Utc::now()).await
    }

    pub async fn apply_legal_hold_at(
        &self,
        hold: LegalHold,
        data_ids: &[String],
        now: DateTime<Utc>,
    ) -> RetentionResult<HoldApplication> {
        self.holds.apply_hold(hold, data_ids, now).await
    }

    /// Apply a hold to every registered item its scope matches
    pub async fn apply_legal_hold_by_scope(&self, hold: LegalHold) -> RetentionResult<HoldApplication> {
        if hold.scope.is_empty() {
            return Err(RetentionError::Validation(format!(
                "Legal hold for {} has no data scope",
                hold.matter.name
            )));
        }

        let data_ids: Vec<String> = self
            .store
            .list_data_items()
            .await?
            .into_iter()
            .filter(|item| hold.scope.matches(item))
            .map(|item| item.id)
            .collect();

        info!(hold_id = %hold.id, matched = data_ids.len(), "Resolved legal hold scope");
        self.holds.apply_hold(hold, &data_ids, Utc::now()).await
    }

    pub async fn release_legal_hold(
        &self,
        hold_id: Uuid,
        release_data: bool,
        released_by: &str,
        reason: &str,
    ) -> RetentionResult<HoldRelease> {
        self.release_legal_hold_at(hold_id, release_data, released_by, reason, Utc::now())
            .await
    }

    /// Release a hold; resumed entries that are already due run on the next
    /// tick
    pub async fn release_legal_hold_at(
        &self,
        hold_id: Uuid,
        release_data: bool,
        released_by: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RetentionResult<HoldRelease> {
        let release = self
            .holds
            .release_hold(hold_id, release_data, released_by, reason, now)
            .await?;
        self.reinstate(&release, now).await?;
        Ok(release)
    }

    /// Regenerate schedules of items whose original policy came back on release
    async fn reinstate(&self, release: &HoldRelease, now: DateTime<Utc>) -> RetentionResult<()> {
        for data_id in &release.reinstated {
            let _guard = self.locks.acquire(data_id).await;
            let Some(item) = self.store.get_data_item(data_id).await? else {
                continue;
            };
            let Some(policy_id) = item.policy_id else {
                continue;
            };
            match self.policies.get(policy_id).await? {
                Some(policy) => {
                    self.regenerate(&item, &policy, now).await?;
                }
                None => warn!(data_id = %data_id, policy_id = %policy_id, "Reinstated policy no longer exists"),
            }
        }
        Ok(())
    }

    pub async fn get_legal_hold(&self, hold_id: Uuid) -> RetentionResult<LegalHold> {
        self.holds.get_hold(hold_id).await
    }

    pub async fn add_custodian(&self, hold_id: Uuid, custodian: Custodian) -> RetentionResult<Custodian> {
        self.holds.add_custodian(hold_id, custodian, Utc::now()).await
    }

    pub async fn acknowledge_notice(&self, hold_id: Uuid, custodian_id: Uuid) -> RetentionResult<Custodian> {
        self.holds
            .acknowledge_notice(hold_id, custodian_id, Utc::now())
            .await
    }

    pub async fn confirm_preservation(&self, hold_id: Uuid, custodian_id: Uuid) -> RetentionResult<Custodian> {
        self.holds
            .confirm_preservation(hold_id, custodian_id, Utc::now())
            .await
    }

    /// Operator action: give a failed entry a fresh retry budget
    pub async fn resolve_failed_entry(&self, entry_id: Uuid) -> RetentionResult<RetentionScheduleEntry> {
        self.executor.resolve_failed_entry(entry_id, Utc::now()).await
    }

    pub async fn generate_retention_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RetentionResult<RetentionReport> {
        self.generate_retention_report_at(start, end, Utc::now()).await
    }

    pub async fn generate_retention_report_at(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RetentionResult<RetentionReport> {
        if end < start {
            return Err(RetentionError::Validation(
                "Report period ends before it starts".to_string(),
            ));
        }

        build_report(
            self.store.as_ref(),
            start,
            end,
            now,
            Duration::hours(self.config.overdue_grace_hours),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hold::Matter;
    use crate::policy::{StorageTier, TierSpec};
    use crate::schedule::ScheduledAction;
    use crate::storage::InMemoryStorageBackend;
    use crate::store::InMemoryRetentionStore;

    async fn engine() -> (RetentionEngine, Arc<InMemoryStorageBackend>) {
        let store = Arc::new(InMemoryRetentionStore::new());
        let backend = Arc::new(InMemoryStorageBackend::new());
        let engine = RetentionEngine::new(store, backend.clone(), EngineConfig::default())
            .await
            .unwrap();
        (engine, backend)
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy::new("Radiology", "dicom")
            .with_tiers(
                TierSpec::automatic(30),
                TierSpec::automatic(60),
                TierSpec::automatic(90),
            )
            .retain_for(180)
            .with_grace_period(30)
    }

    #[tokio::test]
    async fn test_create_policy_rejects_invalid() {
        let (engine, _) = engine().await;
        let result = engine.create_policy(policy().retain_for(100)).await;
        assert!(matches!(result, Err(RetentionError::Validation(_))));
        assert!(engine.list_policies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_data_resolves_policy() {
        let (engine, _) = engine().await;
        let policy = engine.create_policy(policy()).await.unwrap();

        let entries = engine
            .register_data(DataItem::new("ct-1", "dicom", Utc::now(), 2048))
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.policy_id == policy.id));

        let unknown = engine
            .register_data(DataItem::new("note-1", "note", Utc::now(), 1))
            .await;
        assert!(unknown.is_err());

        let duplicate = engine
            .register_data(DataItem::new("ct-1", "dicom", Utc::now(), 2048))
            .await;
        assert!(duplicate.is_err());
    }

    #[tokio::test]
    async fn test_update_policy_regenerates_open_entries_only() {
        let (engine, backend) = engine().await;
        let policy = engine.create_policy(policy()).await.unwrap();
        backend.put("ct-2", 10, StorageTier::Hot);
        engine
            .register_data(DataItem::new("ct-2", "dicom", Utc::now() - Duration::days(40), 10))
            .await
            .unwrap();

        engine.run_tick(Some(policy.id)).await.unwrap();

        let mut updated = policy.clone();
        updated.cold = TierSpec::automatic(275);
        updated.total_retention_days = 365;
        let updated = engine.update_policy(updated).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(engine.policy_history(policy.id).await.unwrap().len(), 2);

        let schedule = engine.schedule_for("ct-2").await.unwrap();
        let completed: Vec<_> = schedule.iter().filter(|e| e.status == EntryStatus::Completed).collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].policy_version, 1);

        let open: Vec<_> = schedule.iter().filter(|e| e.is_open()).collect();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|e| e.policy_version == 2));
        let deletion = open
            .iter()
            .find(|e| e.scheduled_action == ScheduledAction::Delete)
            .unwrap();
        assert!(deletion.scheduled_date > Utc::now() + Duration::days(300));
    }

    #[tokio::test]
    async fn test_data_registered_under_hold_starts_paused() {
        let (engine, backend) = engine().await;
        engine.create_policy(policy()).await.unwrap();
        backend.put("mri-1", 10, StorageTier::Hot);
        engine
            .register_data(DataItem::new("mri-1", "dicom", Utc::now(), 10))
            .await
            .unwrap();

        let hold = LegalHold::new(Matter::new("Audit 2025"))
            .with_custodian(Custodian::new("Ana Lima", "ana@example.com"));
        engine
            .apply_legal_hold(hold, &["mri-1".to_string()])
            .await
            .unwrap();
        assert!(engine.is_held("mri-1"));

        let mut policy = engine.list_policies().await.unwrap().remove(0);
        policy.grace_period_days = 60;
        engine.update_policy(policy).await.unwrap();

        let schedule = engine.schedule_for("mri-1").await.unwrap();
        assert!(schedule.iter().all(|e| e.status == EntryStatus::Paused));
    }

    #[tokio::test]
    async fn test_schedule_dates_out_of_range_are_rejected() {
        let (engine, _) = engine().await;

        let forever = RetentionPolicy::new("Forever", "dicom")
            .with_tiers(
                TierSpec::automatic(1),
                TierSpec::automatic(1),
                TierSpec::automatic(1),
            )
            .with_archive(TierSpec::automatic(100_000_000))
            .retain_for(100_000_003);
        assert!(matches!(
            engine.create_policy(forever).await,
            Err(RetentionError::Validation(_))
        ));

        engine.create_policy(policy()).await.unwrap();
        let far_future = DateTime::<Utc>::MAX_UTC - Duration::days(10);
        let result = engine
            .register_data(DataItem::new("capsule-1", "dicom", far_future, 10))
            .await;
        assert!(matches!(result, Err(RetentionError::Validation(_))));
        assert!(engine.schedule_for("capsule-1").await.unwrap().is_empty());
        assert!(engine.store.get_data_item("capsule-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_old_execution_results_are_pruned() {
        let (engine, _) = engine().await;
        let policy = engine.create_policy(policy()).await.unwrap();
        let now = Utc::now();

        engine.run_tick_at(Some(policy.id), now).await.unwrap();
        engine.run_tick_at(Some(policy.id), now + Duration::days(30)).await.unwrap();
        let (start, end) = (now - Duration::days(1000), now + Duration::days(1000));
        assert_eq!(engine.store.executions_between(start, end).await.unwrap().len(), 2);

        engine.run_tick_at(Some(policy.id), now + Duration::days(380)).await.unwrap();
        let kept = engine.store.executions_between(start, end).await.unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|r| r.started_at > now));
    }

    #[tokio::test]
    async fn test_report_period_must_be_ordered() {
        let (engine, _) = engine().await;
        let now = Utc::now();
        assert!(engine
            .generate_retention_report(now, now - Duration::days(1))
            .await
            .is_err());
        assert!(engine.generate_retention_report(now - Duration::days(1), now).await.is_ok());
    }
}
