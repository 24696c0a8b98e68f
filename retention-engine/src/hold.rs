use crate::classification::DataClassification;
use crate::error::{RetentionError, RetentionResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::locks::DataLocks;
use crate::schedule::EntryStatus;
use crate::storage::{DataItem, StorageBackend};
use crate::store::{EntryQuery, RetentionStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    #[default]
    Active,
    Released,
    Expired,
    Suspended,
}

/// Litigation matter a hold belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matter {
    pub name: String,
    pub case_number: Option<String>,
    pub description: Option<String>,
    pub counsel: Option<String>,
}

impl Matter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            case_number: None,
            description: None,
            counsel: None,
        }
    }

    pub fn with_case_number(mut self, case_number: impl Into<String>) -> Self {
        self.case_number = Some(case_number.into());
        self
    }
}

/// Person accountable for preserving a hold's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Custodian {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub notified: bool,
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub preserved: bool,
    pub preserved_at: Option<DateTime<Utc>>,
}

impl Custodian {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            notified: false,
            notified_at: None,
            acknowledged: false,
            acknowledged_at: None,
            preserved: false,
            preserved_at: None,
        }
    }

    fn mark_notified(&mut self, at: DateTime<Utc>) {
        if !self.notified {
            self.notified = true;
            self.notified_at = Some(at);
        }
    }
}

/// Which data a hold covers; empty lists act as wildcards
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldScope {
    #[serde(default)]
    pub data_types: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classifications: Vec<DataClassification>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl HoldScope {
    pub fn is_empty(&self) -> bool {
        self.data_types.is_empty()
            && self.created_after.is_none()
            && self.created_before.is_none()
            && self.classifications.is_empty()
            && self.keywords.is_empty()
    }

    pub fn matches(&self, item: &DataItem) -> bool {
        if !self.data_types.is_empty() && !self.data_types.contains(&item.data_type) {
            return false;
        }

        if let Some(after) = self.created_after {
            if item.created_at < after {
                return false;
            }
        }

        if let Some(before) = self.created_before {
            if item.created_at > before {
                return false;
            }
        }

        if !self.classifications.is_empty() {
            match item.classification {
                Some(c) if self.classifications.contains(&c) => {}
                _ => return false,
            }
        }

        if !self.keywords.is_empty() {
            let haystack: Vec<String> = std::iter::once(&item.id)
                .chain(item.tags.values())
                .map(|s| s.to_lowercase())
                .collect();
            let hit = self.keywords.iter().any(|keyword| {
                let keyword = keyword.to_lowercase();
                haystack.iter().any(|s| s.contains(&keyword))
            });
            if !hit {
                return false;
            }
        }

        true
    }
}

/// Compliance flags recorded on a hold; any association suspends the item schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldFlags {
    pub prevent_deletion: bool,
    pub prevent_modification: bool,
    pub override_retention_policies: bool,
}

impl Default for HoldFlags {
    fn default() -> Self {
        Self {
            prevent_deletion: true,
            prevent_modification: false,
            override_retention_policies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub released_at: DateTime<Utc>,
    pub released_by: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalHold {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub matter: Matter,
    #[serde(default)]
    pub custodians: Vec<Custodian>,
    #[serde(default)]
    pub scope: HoldScope,
    #[serde(default)]
    pub status: HoldStatus,
    #[serde(default)]
    pub flags: HoldFlags,
    #[serde(default = "Utc::now")]
    pub effective_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub release: Option<ReleaseInfo>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl LegalHold {
    pub fn new(matter: Matter) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            matter,
            custodians: Vec::new(),
            scope: HoldScope::default(),
            status: HoldStatus::Active,
            flags: HoldFlags::default(),
            effective_date: now,
            expiration_date: None,
            release: None,
            created_at: now,
        }
    }

    pub fn with_custodian(mut self, custodian: Custodian) -> Self {
        self.custodians.push(custodian);
        self
    }

    pub fn with_scope(mut self, scope: HoldScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_flags(mut self, flags: HoldFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn effective_from(mut self, at: DateTime<Utc>) -> Self {
        self.effective_date = at;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }

    pub fn validate(&self) -> RetentionResult<()> {
        if self.matter.name.trim().is_empty() {
            return Err(RetentionError::Validation(
                "Legal hold matter name cannot be empty".to_string(),
            ));
        }

        if self.custodians.is_empty() && self.scope.is_empty() {
            return Err(RetentionError::Validation(format!(
                "Legal hold for {} needs at least one custodian or a data scope",
                self.matter.name
            )));
        }

        if let Some(expiration) = self.expiration_date {
            if expiration <= self.effective_date {
                return Err(RetentionError::Validation(format!(
                    "Legal hold for {} expires before it takes effect",
                    self.matter.name
                )));
            }
        }

        Ok(())
    }
}

/// Association of one data item with one hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUnderHold {
    pub hold_id: Uuid,
    pub data_id: String,
    /// Policy governing the item when the hold was applied
    pub original_retention_policy: Option<Uuid>,
    pub hold_applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldItemFailure {
    pub data_id: String,
    pub error: String,
}

/// Per-item outcome of `apply_hold`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoldApplication {
    pub hold_id: Uuid,
    pub applied: Vec<String>,
    pub already_held: Vec<String>,
    pub paused_entries: usize,
    /// Items whose policy is legal-hold exempt; flagged for review
    pub conflicts: Vec<String>,
    pub failures: Vec<HoldItemFailure>,
}

/// Per-item outcome of releasing a hold's data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HoldRelease {
    pub hold_id: Uuid,
    pub released: Vec<String>,
    /// Items still referenced by another hold
    pub still_held: Vec<String>,
    pub resumed_entries: usize,
    /// Resumed entries already past due; they run on the next tick
    pub catch_up_entries: usize,
    /// Items whose original policy was reinstated
    pub reinstated: Vec<String>,
    pub failures: Vec<HoldItemFailure>,
}

/// Registry of legal holds and the data they cover
pub struct LegalHoldRegistry {
    store: Arc<dyn RetentionStore>,
    backend: Arc<dyn StorageBackend>,
    locks: Arc<DataLocks>,
    events: Arc<EventBus>,
    /// data id -> holds still referencing it
    index: DashMap<String, HashSet<Uuid>>,
}

impl LegalHoldRegistry {
    pub fn new(
        store: Arc<dyn RetentionStore>,
        backend: Arc<dyn StorageBackend>,
        locks: Arc<DataLocks>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            backend,
            locks,
            events,
            index: DashMap::new(),
        }
    }

    /// Rebuild the membership index from persisted associations
    pub async fn rebuild_index(&self) -> RetentionResult<()> {
        self.index.clear();

        for link in self.store.hold_links(None, None).await? {
            self.index.entry(link.data_id).or_default().insert(link.hold_id);
        }

        debug!(held_items = self.index.len(), "Rebuilt legal hold index");
        Ok(())
    }

    /// O(1) membership check
    pub fn is_held(&self, data_id: &str) -> bool {
        self.index
            .get(data_id)
            .map(|holds| !holds.is_empty())
            .unwrap_or(false)
    }

    pub fn held_count(&self) -> usize {
        self.index.iter().filter(|holds| !holds.is_empty()).count()
    }

    pub async fn get_hold(&self, hold_id: Uuid) -> RetentionResult<LegalHold> {
        self.store
            .get_hold(hold_id)
            .await?
            .ok_or_else(|| RetentionError::NotFound(format!("legal hold {}", hold_id)))
    }

    /// Apply a hold to data items, pausing their pending entries
    ///
    /// Re-applying a hold to an item it already covers is a no-op. Failures
    /// are reported per item; the rest of the batch still applies.
    ///
    /// Applying makes the hold effective at once: an `effective_date` later
    /// than `now` is moved back to `now`.
    pub async fn apply_hold(
        &self,
        hold: LegalHold,
        data_ids: &[String],
        now: DateTime<Utc>,
    ) -> RetentionResult<HoldApplication> {
        hold.validate()?;

        let mut hold = match self.store.get_hold(hold.id).await? {
            Some(existing) if !existing.is_active() => {
                return Err(RetentionError::Validation(format!(
                    "Legal hold {} is {:?} and cannot be applied",
                    existing.id, existing.status
                )));
            }
            Some(existing) => existing,
            None => hold,
        };

        if hold.effective_date > now {
            debug!(hold_id = %hold.id, effective_date = %hold.effective_date, "Hold applied early, effective now");
            hold.effective_date = now;
        }

        for custodian in &mut hold.custodians {
            custodian.mark_notified(now);
        }
        self.store.put_hold(hold.clone()).await?;

        let mut result = HoldApplication {
            hold_id: hold.id,
            ..HoldApplication::default()
        };

        let mut seen = HashSet::new();
        for data_id in data_ids.iter().filter(|id| seen.insert(id.as_str())) {
            let _guard = self.locks.acquire(data_id).await;

            match self.apply_to_item(&hold, data_id, now).await {
                Ok(ItemApplication::AlreadyHeld) => result.already_held.push(data_id.clone()),
                Ok(ItemApplication::Applied { paused, conflict }) => {
                    result.paused_entries += paused;
                    if conflict {
                        result.conflicts.push(data_id.clone());
                    }
                    result.applied.push(data_id.clone());
                }
                Err(e) => {
                    warn!(hold_id = %hold.id, data_id = %data_id, error = %e, "Failed to apply legal hold");
                    result.failures.push(HoldItemFailure {
                        data_id: data_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            hold_id = %hold.id,
            matter = %hold.matter.name,
            applied = result.applied.len(),
            already_held = result.already_held.len(),
            failures = result.failures.len(),
            "Applied legal hold"
        );

        if !result.applied.is_empty() {
            self.events.publish(LifecycleEvent::LegalHoldApplied {
                hold_id: hold.id,
                matter: hold.matter.name.clone(),
                data_ids: result.applied.clone(),
                at: now,
            });
        }

        Ok(result)
    }

    async fn apply_to_item(
        &self,
        hold: &LegalHold,
        data_id: &str,
        now: DateTime<Utc>,
    ) -> RetentionResult<ItemApplication> {
        let item = self
            .store
            .get_data_item(data_id)
            .await?
            .ok_or_else(|| RetentionError::NotFound(format!("data item {}", data_id)))?;

        let link = DataUnderHold {
            hold_id: hold.id,
            data_id: data_id.to_string(),
            original_retention_policy: item.policy_id,
            hold_applied_at: now,
        };
        if !self.store.insert_hold_link(link).await? {
            return Ok(ItemApplication::AlreadyHeld);
        }
        self.index.entry(data_id.to_string()).or_default().insert(hold.id);

        if let Err(e) = self.backend.set_held_flag(data_id, true, hold.id).await {
            self.store.remove_hold_link(hold.id, data_id).await?;
            self.unindex(data_id, hold.id);
            return Err(e);
        }

        let paused = self.pause_pending(data_id, now).await?;

        let mut conflict = false;
        if let Some(policy_id) = item.policy_id {
            if let Some(policy) = self.store.get_policy(policy_id).await? {
                if policy.legal_hold_exempt {
                    conflict = true;
                    warn!(
                        hold_id = %hold.id,
                        data_id = %data_id,
                        policy_id = %policy_id,
                        "Legal hold conflicts with hold-exempt policy, flagging for review"
                    );
                    self.events.publish(LifecycleEvent::ReviewRequired {
                        entry_id: None,
                        data_id: data_id.to_string(),
                        reason: format!(
                            "legal hold {} applied to data governed by hold-exempt policy {}",
                            hold.id, policy.name
                        ),
                        at: now,
                    });
                }
            }
        }

        debug!(hold_id = %hold.id, data_id = %data_id, paused, "Data placed under hold");
        Ok(ItemApplication::Applied { paused, conflict })
    }

    /// Move every pending entry of an item to paused
    pub async fn pause_pending(&self, data_id: &str, now: DateTime<Utc>) -> RetentionResult<usize> {
        let pending = self
            .store
            .query_entries(&EntryQuery::new().data(data_id).status(EntryStatus::Pending))
            .await?;

        let mut paused = 0;
        for entry in pending {
            if self
                .store
                .compare_and_set_status(entry.id, EntryStatus::Pending, EntryStatus::Paused, now)
                .await?
                .is_some()
            {
                paused += 1;
            }
        }
        Ok(paused)
    }

    /// Release a hold; with `release_data` the covered items are unflagged
    /// and their schedules resume once no other hold references them
    pub async fn release_hold(
        &self,
        hold_id: Uuid,
        release_data: bool,
        released_by: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> RetentionResult<HoldRelease> {
        let mut hold = self.get_hold(hold_id).await?;

        if matches!(hold.status, HoldStatus::Active | HoldStatus::Suspended) {
            hold.status = HoldStatus::Released;
            hold.release = Some(ReleaseInfo {
                released_at: now,
                released_by: released_by.to_string(),
                reason: reason.to_string(),
            });
            self.store.put_hold(hold.clone()).await?;
            info!(hold_id = %hold_id, released_by, "Legal hold released");
        }

        if !release_data {
            return Ok(HoldRelease {
                hold_id,
                ..HoldRelease::default()
            });
        }

        self.release_links(&hold, now).await
    }

    /// Expire holds whose expiration date has passed and release their data
    pub async fn expire_holds(&self, now: DateTime<Utc>) -> RetentionResult<Vec<HoldRelease>> {
        let mut releases = Vec::new();

        for mut hold in self.store.list_holds().await? {
            let lapsed = hold.is_active() && hold.expiration_date.map_or(false, |at| at <= now);
            if lapsed {
                hold.status = HoldStatus::Expired;
                self.store.put_hold(hold.clone()).await?;
                info!(hold_id = %hold.id, matter = %hold.matter.name, "Legal hold expired");
            } else if hold.status != HoldStatus::Expired {
                continue;
            } else if self.store.hold_links(Some(hold.id), None).await?.is_empty() {
                continue;
            } else {
                // Links left behind by a release that failed on an earlier tick
                warn!(hold_id = %hold.id, "Retrying release of expired legal hold");
            }

            releases.push(self.release_links(&hold, now).await?);
        }

        Ok(releases)
    }

    async fn release_links(&self, hold: &LegalHold, now: DateTime<Utc>) -> RetentionResult<HoldRelease> {
        let mut result = HoldRelease {
            hold_id: hold.id,
            ..HoldRelease::default()
        };

        for link in self.store.hold_links(Some(hold.id), None).await? {
            let _guard = self.locks.acquire(&link.data_id).await;

            match self.release_item(hold.id, &link, now).await {
                Ok(ItemRelease::StillHeld) => result.still_held.push(link.data_id.clone()),
                Ok(ItemRelease::Released {
                    resumed,
                    catch_up,
                    reinstated,
                }) => {
                    result.resumed_entries += resumed;
                    result.catch_up_entries += catch_up;
                    if reinstated {
                        result.reinstated.push(link.data_id.clone());
                    }
                    result.released.push(link.data_id.clone());
                }
                Err(e) => {
                    warn!(hold_id = %hold.id, data_id = %link.data_id, error = %e, "Failed to release legal hold");
                    result.failures.push(HoldItemFailure {
                        data_id: link.data_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            hold_id = %hold.id,
            released = result.released.len(),
            still_held = result.still_held.len(),
            catch_up = result.catch_up_entries,
            "Released legal hold data"
        );

        if !result.released.is_empty() || !result.still_held.is_empty() {
            let mut data_ids = result.released.clone();
            data_ids.extend(result.still_held.iter().cloned());
            self.events.publish(LifecycleEvent::LegalHoldReleased {
                hold_id: hold.id,
                data_ids,
                at: now,
            });
        }

        Ok(result)
    }

    async fn release_item(
        &self,
        hold_id: Uuid,
        link: &DataUnderHold,
        now: DateTime<Utc>,
    ) -> RetentionResult<ItemRelease> {
        let data_id = link.data_id.as_str();

        self.store.remove_hold_link(hold_id, data_id).await?;
        self.unindex(data_id, hold_id);

        if let Err(e) = self.backend.set_held_flag(data_id, false, hold_id).await {
            self.store.insert_hold_link(link.clone()).await?;
            self.index.entry(data_id.to_string()).or_default().insert(hold_id);
            return Err(e);
        }

        if self.is_held(data_id) {
            return Ok(ItemRelease::StillHeld);
        }

        let paused = self
            .store
            .query_entries(&EntryQuery::new().data(data_id).status(EntryStatus::Paused))
            .await?;

        let mut resumed = 0;
        let mut catch_up = 0;
        for entry in paused {
            // Back to pending unchanged; past-due entries run on the next tick
            if self
                .store
                .compare_and_set_status(entry.id, EntryStatus::Paused, EntryStatus::Pending, now)
                .await?
                .is_some()
            {
                resumed += 1;
                if entry.scheduled_date <= now {
                    catch_up += 1;
                }
            }
        }

        let mut reinstated = false;
        if let Some(mut item) = self.store.get_data_item(data_id).await? {
            if link.original_retention_policy.is_some() && item.policy_id != link.original_retention_policy {
                item.policy_id = link.original_retention_policy;
                self.store.put_data_item(item).await?;
                reinstated = true;
            }
        }

        Ok(ItemRelease::Released {
            resumed,
            catch_up,
            reinstated,
        })
    }

    fn unindex(&self, data_id: &str, hold_id: Uuid) {
        let now_empty = match self.index.get_mut(data_id) {
            Some(mut holds) => {
                holds.remove(&hold_id);
                holds.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.index.remove_if(data_id, |_, holds| holds.is_empty());
        }
    }

    pub async fn add_custodian(
        &self,
        hold_id: Uuid,
        mut custodian: Custodian,
        now: DateTime<Utc>,
    ) -> RetentionResult<Custodian> {
        let mut hold = self.get_hold(hold_id).await?;

        if custodian.name.trim().is_empty() || custodian.email.trim().is_empty() {
            return Err(RetentionError::Validation(
                "Custodian requires a name and an email".to_string(),
            ));
        }
        if hold.custodians.iter().any(|c| c.email.eq_ignore_ascii_case(&custodian.email)) {
            return Err(RetentionError::Validation(format!(
                "Custodian {} is already on hold {}",
                custodian.email, hold_id
            )));
        }

        if hold.is_active() {
            custodian.mark_notified(now);
        }
        hold.custodians.push(custodian.clone());
        self.store.put_hold(hold).await?;

        info!(hold_id = %hold_id, custodian_id = %custodian.id, "Custodian added to legal hold");
        Ok(custodian)
    }

    pub async fn acknowledge_notice(
        &self,
        hold_id: Uuid,
        custodian_id: Uuid,
        now: DateTime<Utc>,
    ) -> RetentionResult<Custodian> {
        self.update_custodian(hold_id, custodian_id, |custodian| {
            if !custodian.acknowledged {
                custodian.acknowledged = true;
                custodian.acknowledged_at = Some(now);
            }
            Ok(())
        })
        .await
    }

    pub async fn confirm_preservation(
        &self,
        hold_id: Uuid,
        custodian_id: Uuid,
        now: DateTime<Utc>,
    ) -> RetentionResult<Custodian> {
        self.update_custodian(hold_id, custodian_id, |custodian| {
            if !custodian.acknowledged {
                return Err(RetentionError::Validation(format!(
                    "Custodian {} must acknowledge the hold notice before confirming preservation",
                    custodian.email
                )));
            }
            if !custodian.preserved {
                custodian.preserved = true;
                custodian.preserved_at = Some(now);
            }
            Ok(())
        })
        .await
    }

    async fn update_custodian<F>(
        &self,
        hold_id: Uuid,
        custodian_id: Uuid,
        update: F,
    ) -> RetentionResult<Custodian>
    where
        F: FnOnce(&mut Custodian) -> RetentionResult<()>,
    {
        let mut hold = self.get_hold(hold_id).await?;
        let custodian = hold
            .custodians
            .iter_mut()
            .find(|c| c.id == custodian_id)
            .ok_or_else(|| {
                RetentionError::NotFound(format!("custodian {} on hold {}", custodian_id, hold_id))
            })?;

        update(custodian)?;
        let updated = custodian.clone();
        self.store.put_hold(hold).await?;
        Ok(updated)
    }
}

enum ItemApplication {
    AlreadyHeld,
    Applied { paused: usize, conflict: bool },
}

enum ItemRelease {
    StillHeld,
    Released {
        resumed: usize,
        catch_up: usize,
        reinstated: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{RetentionPolicy, StorageTier, TierSpec};
    use crate::schedule::ScheduleGenerator;
    use crate::storage::{BackendOperation, InMemoryStorageBackend};
    use crate::store::InMemoryRetentionStore;
    use chrono::Duration;

    struct Fixture {
        store: Arc<InMemoryRetentionStore>,
        backend: Arc<InMemoryStorageBackend>,
        registry: LegalHoldRegistry,
    }

    async fn fixture(items: &[&str]) -> Fixture {
        let store = Arc::new(InMemoryRetentionStore::new());
        let backend = Arc::new(InMemoryStorageBackend::new());
        let policy = RetentionPolicy::new("Mail", "mail")
            .with_tiers(
                TierSpec::automatic(5),
                TierSpec::automatic(10),
                TierSpec::automatic(15),
            )
            .retain_for(30);
        store.put_policy(policy.clone()).await.unwrap();

        for id in items {
            let item = DataItem::new(*id, "mail", Utc::now(), 64).with_policy(policy.id);
            backend.put(*id, 64, StorageTier::Hot);
            for entry in ScheduleGenerator::generate(&item, &policy).unwrap() {
                store.put_entry(entry).await.unwrap();
            }
            store.put_data_item(item).await.unwrap();
        }

        let registry = LegalHoldRegistry::new(
            store.clone(),
            backend.clone(),
            Arc::new(DataLocks::new()),
            Arc::new(EventBus::new(16)),
        );
        Fixture {
            store,
            backend,
            registry,
        }
    }

    fn hold() -> LegalHold {
        LegalHold::new(Matter::new("Acme v. Example").with_case_number("24-cv-001"))
            .with_custodian(Custodian::new("Dana Reyes", "dana@example.com"))
    }

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn statuses(store: &InMemoryRetentionStore, data_id: &str) -> Vec<EntryStatus> {
        store
            .query_entries(&EntryQuery::new().data(data_id))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    #[tokio::test]
    async fn test_apply_pauses_and_is_idempotent() {
        let f = fixture(&["m1", "m2"]).await;
        let hold = hold();

        let first = f.registry.apply_hold(hold.clone(), &ids(&["m1", "m2"]), Utc::now()).await.unwrap();
        assert_eq!(first.applied.len(), 2);
        assert_eq!(first.paused_entries, 6);
        assert!(f.registry.is_held("m1"));
        assert!(f.backend.is_flagged("m1"));

        let second = f.registry.apply_hold(hold.clone(), &ids(&["m2", "m1", "m1"]), Utc::now()).await.unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.already_held.len(), 2);
        assert!(second.failures.is_empty());

        let links = f.store.hold_links(Some(hold.id), None).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(statuses(&f.store, "m1").await.iter().all(|s| *s == EntryStatus::Paused));

        let stored = f.registry.get_hold(hold.id).await.unwrap();
        assert!(stored.custodians.iter().all(|c| c.notified));
    }

    #[tokio::test]
    async fn test_backend_failure_rolls_back_single_item() {
        let f = fixture(&["ok", "broken"]).await;
        f.backend.inject_failures("broken", BackendOperation::SetHeldFlag, 1);

        let result = f.registry.apply_hold(hold(), &ids(&["ok", "broken", "missing"]), Utc::now()).await.unwrap();
        assert_eq!(result.applied, vec!["ok".to_string()]);
        assert_eq!(result.failures.len(), 2);

        assert!(!f.registry.is_held("broken"));
        assert!(f.store.hold_links(None, Some("broken")).await.unwrap().is_empty());
        assert!(statuses(&f.store, "broken").await.iter().all(|s| *s == EntryStatus::Pending));
    }

    #[tokio::test]
    async fn test_release_waits_for_last_hold() {
        let f = fixture(&["shared"]).await;
        let first = hold();
        let second = hold();
        let now = Utc::now();

        f.registry.apply_hold(first.clone(), &ids(&["shared"]), now).await.unwrap();
        f.registry.apply_hold(second.clone(), &ids(&["shared"]), now).await.unwrap();

        let release = f.registry.release_hold(first.id, true, "counsel", "settled", now).await.unwrap();
        assert_eq!(release.still_held, vec!["shared".to_string()]);
        assert!(f.registry.is_held("shared"));
        assert!(statuses(&f.store, "shared").await.iter().all(|s| *s == EntryStatus::Paused));

        let release = f.registry.release_hold(second.id, true, "counsel", "settled", now).await.unwrap();
        assert_eq!(release.released, vec!["shared".to_string()]);
        assert_eq!(release.resumed_entries, 3);
        assert_eq!(release.catch_up_entries, 0);
        assert!(!f.registry.is_held("shared"));
        assert!(!f.backend.is_flagged("shared"));
        assert!(statuses(&f.store, "shared").await.iter().all(|s| *s == EntryStatus::Pending));
    }

    #[tokio::test]
    async fn test_administrative_release_keeps_data_flagged() {
        let f = fixture(&["kept"]).await;
        let hold = hold();
        f.registry.apply_hold(hold.clone(), &ids(&["kept"]), Utc::now()).await.unwrap();

        let release = f.registry.release_hold(hold.id, false, "counsel", "superseded", Utc::now()).await.unwrap();
        assert!(release.released.is_empty());
        assert_eq!(f.registry.get_hold(hold.id).await.unwrap().status, HoldStatus::Released);
        assert!(f.registry.is_held("kept"));

        // A released hold cannot be re-applied
        assert!(f.registry.apply_hold(hold.clone(), &ids(&["kept"]), Utc::now()).await.is_err());

        // Data can still be released later
        let release = f.registry.release_hold(hold.id, true, "counsel", "cleanup", Utc::now()).await.unwrap();
        assert_eq!(release.released.len(), 1);
        assert!(!f.registry.is_held("kept"));
    }

    #[tokio::test]
    async fn test_expired_holds_release_data() {
        let f = fixture(&["old"]).await;
        let now = Utc::now();
        let hold = hold()
            .effective_from(now - Duration::days(10))
            .expires_at(now - Duration::days(1));
        f.registry.apply_hold(hold.clone(), &ids(&["old"]), now).await.unwrap();

        let releases = f.registry.expire_holds(now).await.unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(f.registry.get_hold(hold.id).await.unwrap().status, HoldStatus::Expired);
        assert!(!f.registry.is_held("old"));
    }

    #[tokio::test]
    async fn test_expired_hold_release_retried_after_failure() {
        let f = fixture(&["old", "new"]).await;
        let now = Utc::now();
        let hold = hold()
            .effective_from(now - Duration::days(10))
            .expires_at(now - Duration::days(1));
        f.registry.apply_hold(hold.clone(), &ids(&["old", "new"]), now).await.unwrap();
        f.backend.inject_failures("old", BackendOperation::SetHeldFlag, 1);

        let releases = f.registry.expire_holds(now).await.unwrap();
        assert_eq!(releases[0].released, ids(&["new"]));
        assert_eq!(releases[0].failures.len(), 1);
        assert_eq!(f.registry.get_hold(hold.id).await.unwrap().status, HoldStatus::Expired);
        assert!(f.registry.is_held("old"));

        let releases = f.registry.expire_holds(now).await.unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].released, ids(&["old"]));
        assert!(!f.registry.is_held("old"));
        assert!(!f.backend.is_flagged("old"));

        // Nothing left to retry
        assert!(f.registry.expire_holds(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_future_hold_is_effective_when_applied() {
        let f = fixture(&["memo"]).await;
        let now = Utc::now();
        let hold = hold().effective_from(now + Duration::days(30));
        f.registry.apply_hold(hold.clone(), &ids(&["memo"]), now).await.unwrap();

        assert!(f.registry.is_held("memo"));
        assert_eq!(f.registry.get_hold(hold.id).await.unwrap().effective_date, now);
    }

    #[tokio::test]
    async fn test_custodian_workflow() {
        let f = fixture(&[]).await;
        let hold = hold();
        f.registry.apply_hold(hold.clone(), &[], Utc::now()).await.unwrap();

        let custodian = f
            .registry
            .add_custodian(hold.id, Custodian::new("Lee Park", "lee@example.com"), Utc::now())
            .await
            .unwrap();
        assert!(custodian.notified);

        let duplicate = f
            .registry
            .add_custodian(hold.id, Custodian::new("Lee Park", "LEE@example.com"), Utc::now())
            .await;
        assert!(duplicate.is_err());

        assert!(f.registry.confirm_preservation(hold.id, custodian.id, Utc::now()).await.is_err());
        let acknowledged = f.registry.acknowledge_notice(hold.id, custodian.id, Utc::now()).await.unwrap();
        assert!(acknowledged.acknowledged);
        let preserved = f.registry.confirm_preservation(hold.id, custodian.id, Utc::now()).await.unwrap();
        assert!(preserved.preserved && preserved.preserved_at.is_some());
    }

    #[test]
    fn test_scope_matching() {
        let created = Utc::now() - Duration::days(5);
        let item = DataItem::new("invoice-2024-17", "invoice", created, 1)
            .with_classification(DataClassification::Financial)
            .with_tag("customer", "Globex");

        let scope = HoldScope {
            data_types: vec!["invoice".to_string()],
            created_after: Some(created - Duration::days(1)),
            created_before: None,
            classifications: vec![DataClassification::Financial],
            keywords: vec!["globex".to_string()],
        };
        assert!(scope.matches(&item));

        let narrower = HoldScope {
            keywords: vec!["initech".to_string()],
            ..scope.clone()
        };
        assert!(!narrower.matches(&item));
        assert!(HoldScope::default().is_empty());
    }

    #[test]
    fn test_hold_validation() {
        assert!(hold().validate().is_ok());
        assert!(LegalHold::new(Matter::new("No custodians")).validate().is_err());
        let now = Utc::now();
        assert!(hold().effective_from(now).expires_at(now - Duration::days(1)).validate().is_err());
    }
}
