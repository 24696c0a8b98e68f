use crate::error::{RetentionError, RetentionResult};
use crate::executor::ExecutionResult;
use crate::hold::{DataUnderHold, LegalHold};
use crate::policy::RetentionPolicy;
use crate::schedule::{EntryStatus, RetentionScheduleEntry};
use crate::storage::DataItem;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Filter for schedule entry queries; `None` fields act as wildcards
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub policy_id: Option<Uuid>,
    pub data_id: Option<String>,
    pub status: Option<EntryStatus>,
    pub due_before: Option<DateTime<Utc>>,
}

impl EntryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy_id: Uuid) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    pub fn data(mut self, data_id: impl Into<String>) -> Self {
        self.data_id = Some(data_id.into());
        self
    }

    pub fn status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn due_before(mut self, at: DateTime<Utc>) -> Self {
        self.due_before = Some(at);
        self
    }

    pub fn matches(&self, entry: &RetentionScheduleEntry) -> bool {
        if let Some(policy_id) = self.policy_id {
            if entry.policy_id != policy_id {
                return false;
            }
        }

        if let Some(ref data_id) = self.data_id {
            if &entry.data_id != data_id {
                return false;
            }
        }

        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }

        if let Some(at) = self.due_before {
            if entry.scheduled_date > at {
                return false;
            }
        }

        true
    }
}

/// Durable storage for policies, data items, schedule entries and holds
#[async_trait]
pub trait RetentionStore: Send + Sync {
    /// Store a policy version; earlier versions stay in the history
    async fn put_policy(&self, policy: RetentionPolicy) -> RetentionResult<()>;

    /// Latest version of a policy
    async fn get_policy(&self, id: Uuid) -> RetentionResult<Option<RetentionPolicy>>;

    /// Latest version of every policy
    async fn list_policies(&self) -> RetentionResult<Vec<RetentionPolicy>>;

    async fn policy_history(&self, id: Uuid) -> RetentionResult<Vec<RetentionPolicy>>;

    async fn put_data_item(&self, item: DataItem) -> RetentionResult<()>;

    async fn get_data_item(&self, data_id: &str) -> RetentionResult<Option<DataItem>>;

    async fn delete_data_item(&self, data_id: &str) -> RetentionResult<()>;

    async fn list_data_items(&self) -> RetentionResult<Vec<DataItem>>;

    async fn put_entry(&self, entry: RetentionScheduleEntry) -> RetentionResult<()>;

    async fn get_entry(&self, id: Uuid) -> RetentionResult<Option<RetentionScheduleEntry>>;

    async fn delete_entry(&self, id: Uuid) -> RetentionResult<()>;

    /// Entries matching the query, in chain order
    async fn query_entries(&self, query: &EntryQuery) -> RetentionResult<Vec<RetentionScheduleEntry>>;

    /// Conditional status update; returns the updated entry only if the
    /// entry was in `from`
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: EntryStatus,
        to: EntryStatus,
        now: DateTime<Utc>,
    ) -> RetentionResult<Option<RetentionScheduleEntry>>;

    async fn put_hold(&self, hold: LegalHold) -> RetentionResult<()>;

    async fn get_hold(&self, id: Uuid) -> RetentionResult<Option<LegalHold>>;

    async fn list_holds(&self) -> RetentionResult<Vec<LegalHold>>;

    /// Insert a hold association; returns false if it already exists
    async fn insert_hold_link(&self, link: DataUnderHold) -> RetentionResult<bool>;

    async fn remove_hold_link(&self, hold_id: Uuid, data_id: &str) -> RetentionResult<Option<DataUnderHold>>;

    /// Hold associations; `None` filters act as wildcards
    async fn hold_links(
        &self,
        hold_id: Option<Uuid>,
        data_id: Option<&str>,
    ) -> RetentionResult<Vec<DataUnderHold>>;

    async fn record_execution(&self, result: ExecutionResult) -> RetentionResult<()>;

    /// Execution results finished within `[start, end]`
    async fn executions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RetentionResult<Vec<ExecutionResult>>;

    /// Drop execution results that finished before `cutoff`; returns how
    /// many were removed
    async fn prune_executions(&self, cutoff: DateTime<Utc>) -> RetentionResult<usize>;

    /// Claim a pending entry for processing
    async fn claim_entry(&self, id: Uuid, now: DateTime<Utc>) -> RetentionResult<Option<RetentionScheduleEntry>> {
        self.compare_and_set_status(id, EntryStatus::Pending, EntryStatus::Processing, now)
            .await
    }
}

/// Serializable image of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub policies: Vec<RetentionPolicy>,
    #[serde(default)]
    pub data_items: Vec<DataItem>,
    #[serde(default)]
    pub entries: Vec<RetentionScheduleEntry>,
    #[serde(default)]
    pub holds: Vec<LegalHold>,
    #[serde(default)]
    pub hold_links: Vec<DataUnderHold>,
    #[serde(default)]
    pub executions: Vec<ExecutionResult>,
}

/// In-memory store for testing and single-process deployments
#[derive(Default)]
pub struct InMemoryRetentionStore {
    policies: DashMap<Uuid, Vec<RetentionPolicy>>,
    data_items: DashMap<String, DataItem>,
    entries: DashMap<Uuid, RetentionScheduleEntry>,
    holds: DashMap<Uuid, LegalHold>,
    hold_links: DashMap<(Uuid, String), DataUnderHold>,
    executions: Mutex<Vec<ExecutionResult>>,
}

impl InMemoryRetentionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();

        for policy in snapshot.policies {
            store.policies.entry(policy.id).or_default().push(policy);
        }
        for mut versions in store.policies.iter_mut() {
            versions.sort_by_key(|p| p.version);
        }
        for item in snapshot.data_items {
            store.data_items.insert(item.id.clone(), item);
        }
        for entry in snapshot.entries {
            store.entries.insert(entry.id, entry);
        }
        for hold in snapshot.holds {
            store.holds.insert(hold.id, hold);
        }
        for link in snapshot.hold_links {
            store.hold_links.insert((link.hold_id, link.data_id.clone()), link);
        }
        *store.executions.lock() = snapshot.executions;

        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut entries: Vec<RetentionScheduleEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.data_id.cmp(&b.data_id).then(a.chain_cmp(b)));

        StoreSnapshot {
            policies: self
                .policies
                .iter()
                .flat_map(|versions| versions.value().clone())
                .collect(),
            data_items: self.data_items.iter().map(|i| i.value().clone()).collect(),
            entries,
            holds: self.holds.iter().map(|h| h.value().clone()).collect(),
            hold_links: self.hold_links.iter().map(|l| l.value().clone()).collect(),
            executions: self.executions.lock().clone(),
        }
    }
}

#[async_trait]
impl RetentionStore for InMemoryRetentionStore {
    async fn put_policy(&self, policy: RetentionPolicy) -> RetentionResult<()> {
        let mut versions = self.policies.entry(policy.id).or_default();
        if let Some(latest) = versions.last() {
            if policy.version <= latest.version {
                return Err(RetentionError::Persistence(format!(
                    "Policy {} version {} is not newer than stored version {}",
                    policy.id, policy.version, latest.version
                )));
            }
        }
        versions.push(policy);
        Ok(())
    }

    async fn get_policy(&self, id: Uuid) -> RetentionResult<Option<RetentionPolicy>> {
        Ok(self
            .policies
            .get(&id)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn list_policies(&self) -> RetentionResult<Vec<RetentionPolicy>> {
        let mut policies: Vec<RetentionPolicy> = self
            .policies
            .iter()
            .filter_map(|versions| versions.value().last().cloned())
            .collect();
        policies.sort_by_key(|p| p.created_at);
        Ok(policies)
    }

    async fn policy_history(&self, id: Uuid) -> RetentionResult<Vec<RetentionPolicy>> {
        Ok(self
            .policies
            .get(&id)
            .map(|versions| versions.value().clone())
            .unwrap_or_default())
    }

    async fn put_data_item(&self, item: DataItem) -> RetentionResult<()> {
        self.data_items.insert(item.id.clone(), item);
        Ok(())
    }

    async fn get_data_item(&self, data_id: &str) -> RetentionResult<Option<DataItem>> {
        Ok(self.data_items.get(data_id).map(|i| i.value().clone()))
    }

    async fn delete_data_item(&self, data_id: &str) -> RetentionResult<()> {
        self.data_items.remove(data_id);
        Ok(())
    }

    async fn list_data_items(&self) -> RetentionResult<Vec<DataItem>> {
        let mut items: Vec<DataItem> = self.data_items.iter().map(|i| i.value().clone()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn put_entry(&self, entry: RetentionScheduleEntry) -> RetentionResult<()> {
        self.entries.insert(entry.id, entry);
        Ok(())
    }

    async fn get_entry(&self, id: Uuid) -> RetentionResult<Option<RetentionScheduleEntry>> {
        Ok(self.entries.get(&id).map(|e| e.value().clone()))
    }

    async fn delete_entry(&self, id: Uuid) -> RetentionResult<()> {
        self.entries.remove(&id);
        Ok(())
    }

    async fn query_entries(&self, query: &EntryQuery) -> RetentionResult<Vec<RetentionScheduleEntry>> {
        let mut entries: Vec<RetentionScheduleEntry> = self
            .entries
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.chain_cmp(b).then(a.data_id.cmp(&b.data_id)));
        Ok(entries)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        from: EntryStatus,
        to: EntryStatus,
        now: DateTime<Utc>,
    ) -> RetentionResult<Option<RetentionScheduleEntry>> {
        // get_mut holds the shard lock, making check-and-set atomic
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(None);
        };
        if entry.status != from {
            return Ok(None);
        }
        entry.status = to;
        entry.touch(now);
        Ok(Some(entry.value().clone()))
    }

    async fn put_hold(&self, hold: LegalHold) -> RetentionResult<()> {
        self.holds.insert(hold.id, hold);
        Ok(())
    }

    async fn get_hold(&self, id: Uuid) -> RetentionResult<Option<LegalHold>> {
        Ok(self.holds.get(&id).map(|h| h.value().clone()))
    }

    async fn list_holds(&self) -> RetentionResult<Vec<LegalHold>> {
        let mut holds: Vec<LegalHold> = self.holds.iter().map(|h| h.value().clone()).collect();
        holds.sort_by_key(|h| h.effective_date);
        Ok(holds)
    }

    async fn insert_hold_link(&self, link: DataUnderHold) -> RetentionResult<bool> {
        let key = (link.hold_id, link.data_id.clone());
        match self.hold_links.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(link);
                Ok(true)
            }
        }
    }

    async fn remove_hold_link(&self, hold_id: Uuid, data_id: &str) -> RetentionResult<Option<DataUnderHold>> {
        Ok(self
            .hold_links
            .remove(&(hold_id, data_id.to_string()))
            .map(|(_, link)| link))
    }

    async fn hold_links(
        &self,
        hold_id: Option<Uuid>,
        data_id: Option<&str>,
    ) -> RetentionResult<Vec<DataUnderHold>> {
        let mut links: Vec<DataUnderHold> = self
            .hold_links
            .iter()
            .filter(|link| {
                hold_id.map_or(true, |id| link.hold_id == id)
                    && data_id.map_or(true, |id| link.data_id == id)
            })
            .map(|link| link.value().clone())
            .collect();
        links.sort_by(|a, b| a.data_id.cmp(&b.data_id));
        Ok(links)
    }

    async fn record_execution(&self, result: ExecutionResult) -> RetentionResult<()> {
        self.executions.lock().push(result);
        Ok(())
    }

    async fn executions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RetentionResult<Vec<ExecutionResult>> {
        Ok(self
            .executions
            .lock()
            .iter()
            .filter(|r| r.finished_at >= start && r.finished_at <= end)
            .cloned()
            .collect())
    }

    async fn prune_executions(&self, cutoff: DateTime<Utc>) -> RetentionResult<usize> {
        let mut executions = self.executions.lock();
        let before = executions.len();
        executions.retain(|r| r.finished_at >= cutoff);
        Ok(before - executions.len())
    }
}

/// Bounded read-through cache of latest policy versions, invalidated on write
pub struct PolicyCache {
    store: Arc<dyn RetentionStore>,
    capacity: usize,
    inner: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    policies: HashMap<Uuid, RetentionPolicy>,
    order: VecDeque<Uuid>,
}

impl PolicyCache {
    pub fn new(store: Arc<dyn RetentionStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity,
            inner: Mutex::new(CacheState::default()),
        }
    }

    pub async fn get(&self, id: Uuid) -> RetentionResult<Option<RetentionPolicy>> {
        let cached = self.inner.lock().policies.get(&id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let policy = self.store.get_policy(id).await?;
        if let Some(ref policy) = policy {
            self.insert(policy.clone());
        }
        Ok(policy)
    }

    /// Persist a new version and refresh the cached copy
    ///
    /// The store is written first. Cached versions only move forward, so a
    /// read that fetched the previous version cannot overwrite this one.
    pub async fn put(&self, policy: RetentionPolicy) -> RetentionResult<()> {
        self.store.put_policy(policy.clone()).await?;
        self.invalidate(policy.id);
        self.insert(policy);
        Ok(())
    }

    pub fn invalidate(&self, id: Uuid) {
        let mut state = self.inner.lock();
        state.policies.remove(&id);
        state.order.retain(|cached| *cached != id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, policy: RetentionPolicy) {
        if self.capacity == 0 {
            return;
        }

        let mut state = self.inner.lock();
        match state.policies.get(&policy.id) {
            Some(cached) if cached.version > policy.version => return,
            Some(_) => {}
            None => state.order.push_back(policy.id),
        }
        state.policies.insert(policy.id, policy);
        while state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.policies.remove(&evicted);
            }
        }
    }
}
