use crate::config::EngineConfig;
use crate::error::{ErrorKind, RetentionError, RetentionResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::hold::LegalHoldRegistry;
use crate::locks::DataLocks;
use crate::policy::{RetentionPolicy, StorageTier};
use crate::rules::evaluate_rules;
use crate::schedule::{EntryStatus, RetentionScheduleEntry, ScheduledAction};
use crate::storage::StorageBackend;
use crate::store::{EntryQuery, RetentionStore};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Completed transitions, counted by destination tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCounts {
    pub hot_to_warm: usize,
    pub warm_to_cold: usize,
    pub cold_to_archive: usize,
}

impl TransitionCounts {
    fn record(&mut self, to: StorageTier) {
        match to {
            StorageTier::Warm => self.hot_to_warm += 1,
            StorageTier::Cold => self.warm_to_cold += 1,
            StorageTier::Archive => self.cold_to_archive += 1,
            StorageTier::Hot => {}
        }
    }

    pub fn total(&self) -> usize {
        self.hot_to_warm + self.warm_to_cold + self.cold_to_archive
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub entry_id: Option<Uuid>,
    pub data_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl EntryError {
    fn for_entry(entry: &RetentionScheduleEntry, error: &RetentionError) -> Self {
        Self {
            entry_id: Some(entry.id),
            data_id: Some(entry.data_id.clone()),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Outcome of one policy run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub policy_id: Uuid,
    pub policy_version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Entries claimed and worked on
    pub processed: usize,
    pub transitions: TransitionCounts,
    pub deleted: usize,
    pub reviewed: usize,
    pub paused: usize,
    pub deferred: usize,
    pub retried: usize,
    pub failed: usize,
    pub space_reclaimed_bytes: u64,
    pub errors: Vec<EntryError>,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    pub fn new(policy_id: Uuid, policy_version: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id,
            policy_version,
            started_at,
            finished_at: started_at,
            elapsed_ms: 0,
            processed: 0,
            transitions: TransitionCounts::default(),
            deleted: 0,
            reviewed: 0,
            paused: 0,
            deferred: 0,
            retried: 0,
            failed: 0,
            space_reclaimed_bytes: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.failed as f64 / self.processed as f64
    }

    fn absorb(&mut self, outcome: EntryOutcome) {
        if !matches!(outcome, EntryOutcome::Skipped) {
            self.processed += 1;
        }

        match outcome {
            EntryOutcome::Transitioned { to, bytes } => {
                self.transitions.record(to);
                if to.reclaims_space() {
                    self.space_reclaimed_bytes += bytes;
                }
            }
            EntryOutcome::Deleted { bytes } => {
                self.deleted += 1;
                self.space_reclaimed_bytes += bytes;
            }
            EntryOutcome::Reviewed => self.reviewed += 1,
            EntryOutcome::Paused { warning } => {
                self.paused += 1;
                self.warnings.extend(warning);
            }
            EntryOutcome::Deferred { warning } => {
                self.deferred += 1;
                self.warnings.extend(warning);
            }
            EntryOutcome::Retrying(error) => {
                self.retried += 1;
                self.errors.push(error);
            }
            EntryOutcome::Failed(error) => {
                self.failed += 1;
                self.errors.push(error);
            }
            EntryOutcome::Skipped => {}
        }
    }
}

#[derive(Debug)]
enum EntryOutcome {
    Transitioned { to: StorageTier, bytes: u64 },
    Deleted { bytes: u64 },
    Reviewed,
    Paused { warning: Option<String> },
    Deferred { warning: Option<String> },
    Retrying(EntryError),
    Failed(EntryError),
    /// Entry was claimed elsewhere; nothing done
    Skipped,
}

impl EntryOutcome {
    /// Whether the next entry in the item's chain may run in the same tick
    fn advances_chain(&self) -> bool {
        matches!(self, EntryOutcome::Transitioned { .. } | EntryOutcome::Reviewed)
    }
}

/// Removes the policy from the running set when dropped
struct RunGuard<'a> {
    running: &'a DashMap<Uuid, ()>,
    policy_id: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.policy_id);
    }
}

/// Runs due schedule entries against the storage backend
pub struct RetentionExecutor {
    store: Arc<dyn RetentionStore>,
    backend: Arc<dyn StorageBackend>,
    holds: Arc<LegalHoldRegistry>,
    locks: Arc<DataLocks>,
    events: Arc<EventBus>,
    config: EngineConfig,
    running: DashMap<Uuid, ()>,
}

impl RetentionExecutor {
    pub fn new(
        store: Arc<dyn RetentionStore>,
        backend: Arc<dyn StorageBackend>,
        holds: Arc<LegalHoldRegistry>,
        locks: Arc<DataLocks>,
        events: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            backend,
            holds,
            locks,
            events,
            config,
            running: DashMap::new(),
        }
    }

    fn try_start(&self, policy_id: Uuid) -> Option<RunGuard<'_>> {
        match self.running.entry(policy_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(RunGuard {
                    running: &self.running,
                    policy_id,
                })
            }
        }
    }

    /// Execute every due entry of one policy
    ///
    /// Each data item's due entries run in chain order under the item lock;
    /// items are processed concurrently up to `batch_concurrency`.
    pub async fn execute_policy(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> RetentionResult<ExecutionResult> {
        let started = Instant::now();
        let mut result = ExecutionResult::new(policy.id, policy.version, now);

        let Some(_guard) = self.try_start(policy.id) else {
            warn!(policy_id = %policy.id, "Execution already in progress, skipping");
            result
                .warnings
                .push(format!("execution of policy {} already in progress", policy.id));
            return Ok(result);
        };

        if let Err(e) = policy.validate() {
            warn!(policy_id = %policy.id, error = %e, "Skipping invalid policy");
            result.errors.push(EntryError {
                entry_id: None,
                data_id: None,
                kind: e.kind(),
                message: e.to_string(),
            });
            return self.finish(result, started).await;
        }

        let due = self
            .store
            .query_entries(
                &EntryQuery::new()
                    .policy(policy.id)
                    .status(EntryStatus::Pending)
                    .due_before(now),
            )
            .await?;

        let mut by_item: BTreeMap<String, Vec<RetentionScheduleEntry>> = BTreeMap::new();
        for entry in due {
            by_item.entry(entry.data_id.clone()).or_default().push(entry);
        }

        debug!(policy_id = %policy.id, items = by_item.len(), "Processing due entries");

        let outcomes: Vec<Vec<EntryOutcome>> = stream::iter(
            by_item
                .into_iter()
                .map(|(data_id, entries)| self.process_item(policy, data_id, entries, now)),
        )
        .buffer_unordered(self.config.batch_concurrency.max(1))
        .collect()
        .await;

        for outcome in outcomes.into_iter().flatten() {
            result.absorb(outcome);
        }

        let ratio = result.failure_ratio();
        if ratio > self.config.failure_warning_ratio {
            warn!(
                policy_id = %policy.id,
                ratio,
                threshold = self.config.failure_warning_ratio,
                "Failure ratio above threshold"
            );
            result.warnings.push(format!(
                "failure ratio {:.2} exceeds threshold {:.2}",
                ratio, self.config.failure_warning_ratio
            ));
            self.events.publish(LifecycleEvent::ThresholdWarning {
                policy_id: Some(policy.id),
                metric: "failure_ratio".to_string(),
                value: ratio,
                threshold: self.config.failure_warning_ratio,
                at: now,
            });
        }

        self.finish(result, started).await
    }

    async fn finish(&self, mut result: ExecutionResult, started: Instant) -> RetentionResult<ExecutionResult> {
        let elapsed = started.elapsed();
        result.elapsed_ms = elapsed.as_millis() as u64;
        result.finished_at = result.started_at + Duration::milliseconds(result.elapsed_ms as i64);

        info!(
            policy_id = %result.policy_id,
            processed = result.processed,
            transitioned = result.transitions.total(),
            deleted = result.deleted,
            paused = result.paused,
            failed = result.failed,
            elapsed_ms = result.elapsed_ms,
            "Policy execution finished"
        );

        self.store.record_execution(result.clone()).await?;
        Ok(result)
    }

    async fn process_item(
        &self,
        policy: &RetentionPolicy,
        data_id: String,
        entries: Vec<RetentionScheduleEntry>,
        now: DateTime<Utc>,
    ) -> Vec<EntryOutcome> {
        let _guard = self.locks.acquire(&data_id).await;
        let mut outcomes = Vec::with_capacity(entries.len());

        for entry in entries {
            let outcome = match self.process_entry(policy, &entry, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(entry_id = %entry.id, data_id = %data_id, error = %e, "Entry processing aborted");
                    EntryOutcome::Failed(EntryError::for_entry(&entry, &e))
                }
            };
            let advances = outcome.advances_chain();
            outcomes.push(outcome);
            if !advances {
                break;
            }
        }

        outcomes
    }

    async fn process_entry(
        &self,
        policy: &RetentionPolicy,
        candidate: &RetentionScheduleEntry,
        now: DateTime<Utc>,
    ) -> RetentionResult<EntryOutcome> {
        let Some(entry) = self.store.claim_entry(candidate.id, now).await? else {
            warn!(entry_id = %candidate.id, "Entry no longer pending, skipping");
            return Ok(EntryOutcome::Skipped);
        };

        let entry_id = entry.id;
        match self.run_claimed(policy, entry, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.release_claim(entry_id, e, now).await,
        }
    }

    async fn run_claimed(
        &self,
        policy: &RetentionPolicy,
        mut entry: RetentionScheduleEntry,
        now: DateTime<Utc>,
    ) -> RetentionResult<EntryOutcome> {
        if entry.scheduled_action == ScheduledAction::Review {
            return self.run_review(entry, now).await;
        }

        if let Some(blocker) = self.earlier_open_entry(&entry).await? {
            self.unclaim(&entry, now).await?;
            let warning = (blocker.status == EntryStatus::Failed).then(|| {
                format!(
                    "entry {} for {} is blocked by failed entry {}",
                    entry.id, entry.data_id, blocker.id
                )
            });
            debug!(entry_id = %entry.id, blocker = %blocker.id, "Deferred behind earlier entry");
            return Ok(EntryOutcome::Deferred { warning });
        }

        let Some(mut item) = self.store.get_data_item(&entry.data_id).await? else {
            let error = RetentionError::InvariantViolation(format!(
                "data item {} is not registered",
                entry.data_id
            ));
            return self.handle_failure(entry, error, now).await;
        };

        if entry.scheduled_action == ScheduledAction::Delete {
            let rules = evaluate_rules(&policy.custom_rules, &item);

            if rules.preserve {
                entry.scheduled_action = ScheduledAction::Review;
                entry.review_reason = Some("deletion converted to review by custom rule".to_string());
                return self.run_review(entry, now).await;
            }

            if rules.hold {
                if let Some(grace_end) = entry.grace_period_end {
                    if now < grace_end {
                        self.unclaim(&entry, now).await?;
                        debug!(entry_id = %entry.id, %grace_end, "Deletion held until end of grace period");
                        return Ok(EntryOutcome::Deferred { warning: None });
                    }
                }
            }
        }

        // Checked last, right before the backend call
        if self.holds.is_held(&entry.data_id) {
            return self.pause_held(policy, entry, now).await;
        }

        match entry.scheduled_action {
            ScheduledAction::Transition => {
                let Some(target) = entry.next_tier else {
                    let error = RetentionError::InvariantViolation(format!(
                        "transition entry {} has no target tier",
                        entry.id
                    ));
                    return self.handle_failure(entry, error, now).await;
                };

                match self.backend.transition(&entry.data_id, target).await {
                    Ok(outcome) => {
                        let from = entry.current_tier;
                        entry.status = EntryStatus::Completed;
                        entry.last_error = None;
                        entry.touch(now);
                        self.store.put_entry(entry.clone()).await?;

                        item.current_tier = target;
                        self.store.put_data_item(item).await?;

                        info!(entry_id = %entry.id, data_id = %entry.data_id, %from, to = %target, "Transitioned data");
                        self.events.publish(LifecycleEvent::EntryTransitioned {
                            entry_id: entry.id,
                            data_id: entry.data_id.clone(),
                            from,
                            to: target,
                            bytes: outcome.bytes_affected,
                            at: now,
                        });
                        Ok(EntryOutcome::Transitioned {
                            to: target,
                            bytes: outcome.bytes_affected,
                        })
                    }
                    Err(e) => self.handle_failure(entry, e, now).await,
                }
            }
            ScheduledAction::Delete => match self.backend.delete(&entry.data_id).await {
                Ok(outcome) => {
                    // The item is gone; its whole chain goes with it
                    let chain = self
                        .store
                        .query_entries(&EntryQuery::new().data(entry.data_id.as_str()))
                        .await?;
                    for stale in chain {
                        self.store.delete_entry(stale.id).await?;
                    }
                    self.store.delete_data_item(&entry.data_id).await?;

                    info!(entry_id = %entry.id, data_id = %entry.data_id, bytes = outcome.bytes_affected, "Deleted data");
                    self.events.publish(LifecycleEvent::EntryDeleted {
                        entry_id: entry.id,
                        data_id: entry.data_id.clone(),
                        bytes: outcome.bytes_affected,
                        at: now,
                    });
                    Ok(EntryOutcome::Deleted {
                        bytes: outcome.bytes_affected,
                    })
                }
                Err(e) => self.handle_failure(entry, e, now).await,
            },
            ScheduledAction::Review => self.run_review(entry, now).await,
        }
    }

    /// Record an error raised after the claim so the entry never stays in
    /// `processing`
    async fn release_claim(
        &self,
        entry_id: Uuid,
        error: RetentionError,
        now: DateTime<Utc>,
    ) -> RetentionResult<EntryOutcome> {
        let claimed = match self.store.get_entry(entry_id).await {
            Ok(Some(entry)) if entry.status == EntryStatus::Processing => entry,
            // Finished or removed before the error; nothing to release
            Ok(_) => return Err(error),
            Err(e) => {
                warn!(entry_id = %entry_id, error = %e, "Could not reload claimed entry");
                self.force_unclaim(entry_id, now).await;
                return Err(error);
            }
        };

        match self.handle_failure(claimed, error, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.force_unclaim(entry_id, now).await;
                Err(e)
            }
        }
    }

    async fn force_unclaim(&self, entry_id: Uuid, now: DateTime<Utc>) {
        if let Err(e) = self
            .store
            .compare_and_set_status(entry_id, EntryStatus::Processing, EntryStatus::Pending, now)
            .await
        {
            error!(
                entry_id = %entry_id,
                error = %e,
                "Entry left in processing; it is recovered on the next engine start"
            );
        }
    }

    /// Earliest non-completed, non-review entry ahead of `entry` in its chain
    async fn earlier_open_entry(
        &self,
        entry: &RetentionScheduleEntry,
    ) -> RetentionResult<Option<RetentionScheduleEntry>> {
        let chain = self
            .store
            .query_entries(&EntryQuery::new().data(entry.data_id.as_str()))
            .await?;

        Ok(chain.into_iter().find(|other| {
            other.id != entry.id
                && other.scheduled_action != ScheduledAction::Review
                && other.status != EntryStatus::Completed
                && other.chain_cmp(entry) == Ordering::Less
        }))
    }

    async fn unclaim(&self, entry: &RetentionScheduleEntry, now: DateTime<Utc>) -> RetentionResult<()> {
        self.store
            .compare_and_set_status(entry.id, EntryStatus::Processing, EntryStatus::Pending, now)
            .await?;
        Ok(())
    }

    async fn pause_held(
        &self,
        policy: &RetentionPolicy,
        mut entry: RetentionScheduleEntry,
        now: DateTime<Utc>,
    ) -> RetentionResult<EntryOutcome> {
        entry.status = EntryStatus::Paused;
        entry.touch(now);
        self.store.put_entry(entry.clone()).await?;

        if entry.scheduled_action != ScheduledAction::Delete || !policy.legal_hold_exempt {
            debug!(entry_id = %entry.id, data_id = %entry.data_id, "Entry paused by legal hold");
            return Ok(EntryOutcome::Paused { warning: None });
        }

        let conflict = RetentionError::ComplianceConflict(format!(
            "policy {} is legal-hold exempt but {} is under hold",
            policy.name, entry.data_id
        ));
        warn!(entry_id = %entry.id, error = %conflict, "Deletion blocked, flagging for review");
        self.schedule_review(&entry, conflict.to_string(), now).await?;

        Ok(EntryOutcome::Paused {
            warning: Some(conflict.to_string()),
        })
    }

    async fn run_review(
        &self,
        mut entry: RetentionScheduleEntry,
        now: DateTime<Utc>,
    ) -> RetentionResult<EntryOutcome> {
        let reason = entry
            .review_reason
            .clone()
            .unwrap_or_else(|| "scheduled review".to_string());

        entry.status = EntryStatus::Completed;
        entry.notifications_sent.push(now);
        entry.touch(now);
        self.store.put_entry(entry.clone()).await?;

        info!(entry_id = %entry.id, data_id = %entry.data_id, %reason, "Review required");
        self.events.publish(LifecycleEvent::ReviewRequired {
            entry_id: Some(entry.id),
            data_id: entry.data_id.clone(),
            reason,
            at: now,
        });
        Ok(EntryOutcome::Reviewed)
    }

    async fn handle_failure(
        &self,
        mut entry: RetentionScheduleEntry,
        error: RetentionError,
        now: DateTime<Utc>,
    ) -> RetentionResult<EntryOutcome> {
        entry.retry_count += 1;
        entry.last_error = Some(error.to_string());
        entry.touch(now);
        let report = EntryError::for_entry(&entry, &error);

        if error.is_recoverable() && entry.retry_count < self.config.max_retry_attempts {
            entry.status = EntryStatus::Pending;
            self.store.put_entry(entry.clone()).await?;
            warn!(
                entry_id = %entry.id,
                data_id = %entry.data_id,
                attempt = entry.retry_count,
                error = %error,
                "Entry failed, will retry next tick"
            );
            return Ok(EntryOutcome::Retrying(report));
        }

        entry.status = EntryStatus::Failed;
        self.store.put_entry(entry.clone()).await?;
        warn!(
            entry_id = %entry.id,
            data_id = %entry.data_id,
            attempts = entry.retry_count,
            error = %error,
            "Entry failed permanently"
        );

        self.events.publish(LifecycleEvent::EntryFailed {
            entry_id: entry.id,
            data_id: entry.data_id.clone(),
            error: error.to_string(),
            retry_count: entry.retry_count,
            at: now,
        });
        self.schedule_review(
            &entry,
            format!("entry {} failed after {} attempts: {}", entry.id, entry.retry_count, error),
            now,
        )
        .await?;

        Ok(EntryOutcome::Failed(report))
    }

    /// Queue a review entry for the next tick
    async fn schedule_review(
        &self,
        source: &RetentionScheduleEntry,
        reason: String,
        now: DateTime<Utc>,
    ) -> RetentionResult<()> {
        let chain = self
            .store
            .query_entries(&EntryQuery::new().data(source.data_id.as_str()))
            .await?;
        let sequence = chain.iter().map(|e| e.sequence).max().unwrap_or(0) + 1;

        let review = RetentionScheduleEntry::review(source, sequence, now, reason);
        debug!(entry_id = %review.id, data_id = %review.data_id, "Review entry scheduled");
        self.store.put_entry(review).await
    }

    /// Return entries left in `processing` by an interrupted run to `pending`
    pub async fn recover_in_flight(&self, now: DateTime<Utc>) -> RetentionResult<usize> {
        let stuck = self
            .store
            .query_entries(&EntryQuery::new().status(EntryStatus::Processing))
            .await?;

        let mut recovered = 0;
        for entry in stuck {
            if self
                .store
                .compare_and_set_status(entry.id, EntryStatus::Processing, EntryStatus::Pending, now)
                .await?
                .is_some()
            {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!(recovered, "Recovered entries interrupted mid-execution");
        }
        Ok(recovered)
    }

    /// Put a failed entry back in the schedule with a fresh retry budget
    pub async fn resolve_failed_entry(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> RetentionResult<RetentionScheduleEntry> {
        let entry = self
            .store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| RetentionError::NotFound(format!("schedule entry {}", entry_id)))?;
        let _guard = self.locks.acquire(&entry.data_id).await;

        let Some(mut entry) = self
            .store
            .compare_and_set_status(entry_id, EntryStatus::Failed, EntryStatus::Pending, now)
            .await?
        else {
            return Err(RetentionError::Validation(format!(
                "schedule entry {} is not in failed state",
                entry_id
            )));
        };

        entry.retry_count = 0;
        entry.last_error = None;
        if self.holds.is_held(&entry.data_id) {
            entry.status = EntryStatus::Paused;
        }
        self.store.put_entry(entry.clone()).await?;

        info!(entry_id = %entry_id, data_id = %entry.data_id, "Failed entry resolved");
        Ok(entry)
    }
}
