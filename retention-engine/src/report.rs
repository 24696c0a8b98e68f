use crate::error::RetentionResult;
use crate::executor::{ExecutionResult, TransitionCounts};
use crate::hold::HoldStatus;
use crate::policy::StorageTier;
use crate::schedule::{EntryStatus, ScheduledAction};
use crate::store::{EntryQuery, RetentionStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Compliant,
    /// Entries past due beyond the overdue grace window
    AtRisk,
    /// Entries that failed permanently
    NonCompliant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkCompliance {
    pub framework: String,
    pub policies: Vec<Uuid>,
    pub failed_entries: usize,
    pub overdue_entries: usize,
    pub held_items: usize,
    pub status: ComplianceStatus,
}

/// Execution results finished within the report period, summed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub runs: usize,
    pub processed: usize,
    pub transitions: TransitionCounts,
    pub deleted: usize,
    pub reviewed: usize,
    pub failed: usize,
    pub space_reclaimed_bytes: u64,
    pub warnings: usize,
}

impl ExecutionSummary {
    fn add(&mut self, result: &ExecutionResult) {
        self.runs += 1;
        self.processed += result.processed;
        self.transitions.hot_to_warm += result.transitions.hot_to_warm;
        self.transitions.warm_to_cold += result.transitions.warm_to_cold;
        self.transitions.cold_to_archive += result.transitions.cold_to_archive;
        self.deleted += result.deleted;
        self.reviewed += result.reviewed;
        self.failed += result.failed;
        self.space_reclaimed_bytes += result.space_reclaimed_bytes;
        self.warnings += result.warnings.len();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcomingAction {
    pub entry_id: Uuid,
    pub data_id: String,
    pub action: ScheduledAction,
    pub next_tier: Option<StorageTier>,
    pub scheduled_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionReport {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub policies: usize,
    pub data_items: usize,
    pub tier_distribution: BTreeMap<StorageTier, usize>,
    pub entries_by_status: BTreeMap<EntryStatus, usize>,
    pub executions: ExecutionSummary,
    pub upcoming_actions: Vec<UpcomingAction>,
    pub active_holds: usize,
    pub data_under_hold: usize,
    pub compliance: Vec<FrameworkCompliance>,
}

/// Build a report over `[start, end]` as seen at `now`
pub async fn build_report(
    store: &dyn RetentionStore,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
    overdue_grace: Duration,
) -> RetentionResult<RetentionReport> {
    let policies = store.list_policies().await?;
    let items = store.list_data_items().await?;
    let entries = store.query_entries(&EntryQuery::new()).await?;
    let holds = store.list_holds().await?;
    let links = store.hold_links(None, None).await?;

    let mut tier_distribution = BTreeMap::new();
    for item in &items {
        *tier_distribution.entry(item.current_tier).or_insert(0) += 1;
    }

    let mut entries_by_status = BTreeMap::new();
    for entry in &entries {
        *entries_by_status.entry(entry.status).or_insert(0) += 1;
    }

    let mut executions = ExecutionSummary::default();
    for result in store.executions_between(start, end).await? {
        executions.add(&result);
    }

    let upcoming_actions = entries
        .iter()
        .filter(|e| e.status == EntryStatus::Pending)
        .filter(|e| e.scheduled_date >= start && e.scheduled_date <= end && e.scheduled_date > now)
        .map(|e| UpcomingAction {
            entry_id: e.id,
            data_id: e.data_id.clone(),
            action: e.scheduled_action,
            next_tier: e.next_tier,
            scheduled_date: e.scheduled_date,
        })
        .collect();

    let held: HashSet<&str> = links.iter().map(|l| l.data_id.as_str()).collect();
    let item_policy: HashMap<&str, Option<Uuid>> =
        items.iter().map(|i| (i.id.as_str(), i.policy_id)).collect();

    let mut frameworks: BTreeMap<&str, Vec<Uuid>> = BTreeMap::new();
    for policy in &policies {
        for framework in &policy.compliance_frameworks {
            frameworks.entry(framework.as_str()).or_default().push(policy.id);
        }
    }

    let overdue_before = now - overdue_grace;
    let compliance = frameworks
        .into_iter()
        .map(|(framework, policy_ids)| {
            let governed = |policy_id: &Uuid| policy_ids.contains(policy_id);
            let scoped: Vec<_> = entries.iter().filter(|e| governed(&e.policy_id)).collect();

            let failed_entries = scoped.iter().filter(|e| e.status == EntryStatus::Failed).count();
            let overdue_entries = scoped
                .iter()
                .filter(|e| e.status == EntryStatus::Pending && e.scheduled_date < overdue_before)
                .count();
            let held_items = held
                .iter()
                .filter(|id| {
                    item_policy
                        .get(*id)
                        .copied()
                        .flatten()
                        .map_or(false, |p| governed(&p))
                })
                .count();

            let status = if failed_entries > 0 {
                ComplianceStatus::NonCompliant
            } else if overdue_entries > 0 {
                ComplianceStatus::AtRisk
            } else {
                ComplianceStatus::Compliant
            };

            FrameworkCompliance {
                framework: framework.to_string(),
                policies: policy_ids.clone(),
                failed_entries,
                overdue_entries,
                held_items,
                status,
            }
        })
        .collect();

    Ok(RetentionReport {
        period_start: start,
        period_end: end,
        generated_at: now,
        policies: policies.len(),
        data_items: items.len(),
        tier_distribution,
        entries_by_status,
        executions,
        upcoming_actions,
        active_holds: holds.iter().filter(|h| h.status == HoldStatus::Active).count(),
        data_under_hold: held.len(),
        compliance,
    })
}
