use crate::error::{RetentionError, RetentionResult};
use crate::policy::{RetentionPolicy, StorageTier};
use crate::rules::evaluate_rules;
use crate::storage::DataItem;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledAction {
    Transition,
    Delete,
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Paused,
}

/// One planned lifecycle action for one data item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionScheduleEntry {
    pub id: Uuid,
    pub data_id: String,
    pub policy_id: Uuid,
    pub policy_version: u32,
    /// Position in the item's chain; breaks ties between equal dates
    pub sequence: u32,
    pub current_tier: StorageTier,
    pub next_tier: Option<StorageTier>,
    pub scheduled_action: ScheduledAction,
    pub scheduled_date: DateTime<Utc>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub review_reason: Option<String>,
    pub notifications_sent: Vec<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetentionScheduleEntry {
    fn new(
        item: &DataItem,
        policy: &RetentionPolicy,
        sequence: u32,
        action: ScheduledAction,
        scheduled_date: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            data_id: item.id.clone(),
            policy_id: policy.id,
            policy_version: policy.version,
            sequence,
            current_tier: item.current_tier,
            next_tier: None,
            scheduled_action: action,
            scheduled_date,
            grace_period_end: None,
            status: EntryStatus::Pending,
            retry_count: 0,
            last_error: None,
            review_reason: None,
            notifications_sent: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// One-shot review entry created by the executor
    pub fn review(
        source: &RetentionScheduleEntry,
        sequence: u32,
        at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            data_id: source.data_id.clone(),
            policy_id: source.policy_id,
            policy_version: source.policy_version,
            sequence,
            current_tier: source.current_tier,
            next_tier: None,
            scheduled_action: ScheduledAction::Review,
            scheduled_date: at,
            grace_period_end: None,
            status: EntryStatus::Pending,
            retry_count: 0,
            last_error: None,
            review_reason: Some(reason.into()),
            notifications_sent: Vec::new(),
            created_at: at,
            updated_at: at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EntryStatus::Pending && self.scheduled_date <= now
    }

    /// Whether this entry is still part of the future, not-yet-completed schedule
    pub fn is_open(&self) -> bool {
        matches!(self.status, EntryStatus::Pending | EntryStatus::Paused)
    }

    /// Chain order: date first, then sequence
    pub fn chain_cmp(&self, other: &Self) -> Ordering {
        self.scheduled_date
            .cmp(&other.scheduled_date)
            .then(self.sequence.cmp(&other.sequence))
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Derives the lifecycle chain for a data item from its policy
///
/// Generation is hold-agnostic; holds are applied to the generated entries by
/// the legal hold registry.
pub struct ScheduleGenerator;

impl ScheduleGenerator {
    pub fn generate(item: &DataItem, policy: &RetentionPolicy) -> RetentionResult<Vec<RetentionScheduleEntry>> {
        let mut entries = Vec::new();
        let mut occupied = item.current_tier;
        let mut cumulative_days: i64 = 0;
        let mut last_transition: Option<DateTime<Utc>> = None;
        let mut sequence: u32 = 0;

        let tiers = policy.tiers();
        for ((_, spec), (next, next_spec)) in tiers.iter().zip(tiers.iter().skip(1)) {
            cumulative_days += i64::from(spec.duration_days);

            if !next_spec.auto_transition || *next <= item.current_tier {
                continue;
            }

            let date = days_after(item.created_at, cumulative_days)?;
            let mut entry =
                RetentionScheduleEntry::new(item, policy, sequence, ScheduledAction::Transition, date);
            entry.current_tier = occupied;
            entry.next_tier = Some(*next);
            entries.push(entry);

            occupied = *next;
            last_transition = Some(date);
            sequence += 1;
        }

        let outcome = evaluate_rules(&policy.custom_rules, item);
        let mut deletion_date = days_after(
            item.created_at,
            i64::from(policy.total_retention_days) + outcome.deletion_shift_days,
        )?;
        if let Some(last) = last_transition {
            if deletion_date < last {
                deletion_date = last;
            }
        }

        let mut deletion =
            RetentionScheduleEntry::new(item, policy, sequence, ScheduledAction::Delete, deletion_date);
        deletion.current_tier = occupied;
        deletion.grace_period_end = Some(days_after(deletion_date, i64::from(policy.grace_period_days))?);
        entries.push(deletion);

        entries.sort_by(|a, b| a.chain_cmp(b));
        Ok(entries)
    }
}

fn days_after(base: DateTime<Utc>, days: i64) -> RetentionResult<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|offset| base.checked_add_signed(offset))
        .ok_or_else(|| {
            RetentionError::Validation(format!(
                "schedule date {} days after {} is out of range",
                days, base
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TierSpec;
    use crate::rules::{CustomRule, RuleAction, RuleCondition};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn created() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn policy() -> RetentionPolicy {
        RetentionPolicy::new("Standard", "blob")
            .with_tiers(
                TierSpec::automatic(30),
                TierSpec::automatic(60),
                TierSpec::automatic(90),
            )
            .retain_for(180)
            .with_grace_period(30)
    }

    #[test]
    fn test_generation_matches_tier_durations() {
        let item = DataItem::new("blob-1", "blob", created(), 100);
        let entries = ScheduleGenerator::generate(&item, &policy()).unwrap();

        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].scheduled_action, ScheduledAction::Transition);
        assert_eq!(entries[0].current_tier, StorageTier::Hot);
        assert_eq!(entries[0].next_tier, Some(StorageTier::Warm));
        assert_eq!(entries[0].scheduled_date, created() + Duration::days(30));

        assert_eq!(entries[1].next_tier, Some(StorageTier::Cold));
        assert_eq!(entries[1].current_tier, StorageTier::Warm);
        assert_eq!(entries[1].scheduled_date, created() + Duration::days(90));

        assert_eq!(entries[2].scheduled_action, ScheduledAction::Delete);
        assert_eq!(entries[2].scheduled_date, created() + Duration::days(180));
        assert_eq!(entries[2].grace_period_end, Some(created() + Duration::days(210)));
        assert!(entries.iter().all(|e| e.status == EntryStatus::Pending));
    }

    #[test]
    fn test_archive_entry_only_when_automatic() {
        let item = DataItem::new("blob-2", "blob", created(), 100);

        let manual = policy().with_archive(TierSpec::manual(0));
        let entries = ScheduleGenerator::generate(&item, &manual).unwrap();
        assert!(entries.iter().all(|e| e.next_tier != Some(StorageTier::Archive)));

        let automatic = RetentionPolicy::new("Archive", "blob")
            .with_tiers(
                TierSpec::automatic(30),
                TierSpec::automatic(60),
                TierSpec::automatic(90),
            )
            .with_archive(TierSpec::automatic(185))
            .retain_for(365);
        let entries = ScheduleGenerator::generate(&item, &automatic).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].next_tier, Some(StorageTier::Archive));
        assert_eq!(entries[2].scheduled_date, created() + Duration::days(180));
        assert_eq!(entries[3].current_tier, StorageTier::Archive);
    }

    #[test]
    fn test_manual_warm_tier_is_skipped() {
        let item = DataItem::new("blob-3", "blob", created(), 100);
        let policy = RetentionPolicy::new("Skip warm", "blob")
            .with_tiers(
                TierSpec::automatic(10),
                TierSpec::manual(20),
                TierSpec::automatic(30),
            )
            .retain_for(60);
        let entries = ScheduleGenerator::generate(&item, &policy).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].current_tier, StorageTier::Hot);
        assert_eq!(entries[0].next_tier, Some(StorageTier::Cold));
        assert_eq!(entries[0].scheduled_date, created() + Duration::days(30));
    }

    #[test]
    fn test_unrepresentable_dates_are_an_error() {
        let item = DataItem::new("blob-9", "blob", DateTime::<Utc>::MAX_UTC - Duration::days(100), 100);
        let result = ScheduleGenerator::generate(&item, &policy());
        assert!(matches!(result, Err(RetentionError::Validation(_))));

        // Grace end alone overflowing is caught too
        let item = DataItem::new("blob-10", "blob", DateTime::<Utc>::MAX_UTC - Duration::days(200), 100);
        assert!(ScheduleGenerator::generate(&item, &policy()).is_err());
        assert!(ScheduleGenerator::generate(&item, &policy().with_grace_period(0)).is_ok());
    }

    #[test]
    fn test_reached_tiers_are_not_regenerated() {
        let item = DataItem::new("blob-4", "blob", created(), 100).with_tier(StorageTier::Warm);
        let entries = ScheduleGenerator::generate(&item, &policy()).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].next_tier, Some(StorageTier::Cold));
        assert_eq!(entries[0].current_tier, StorageTier::Warm);
    }

    #[test]
    fn test_past_dated_deletion_is_still_generated() {
        let old = Utc::now() - Duration::days(400);
        let item = DataItem::new("blob-5", "blob", old, 100);
        let entries = ScheduleGenerator::generate(&item, &policy()).unwrap();

        let deletion = entries.last().unwrap();
        assert_eq!(deletion.scheduled_action, ScheduledAction::Delete);
        assert!(deletion.scheduled_date < Utc::now());
    }

    #[test]
    fn test_rules_shift_deletion_but_never_before_last_transition() {
        let item = DataItem::new("blob-6", "blob", created(), 100);

        let extended = policy().with_rule(CustomRule::new(
            "litigation-prone",
            RuleCondition::Always,
            RuleAction::Extend(45),
        ));
        let entries = ScheduleGenerator::generate(&item, &extended).unwrap();
        assert_eq!(entries.last().unwrap().scheduled_date, created() + Duration::days(225));
        assert_eq!(
            entries.last().unwrap().grace_period_end,
            Some(created() + Duration::days(255))
        );

        let accelerated = policy().with_rule(CustomRule::new(
            "purge-fast",
            RuleCondition::Always,
            RuleAction::Accelerate(150),
        ));
        let entries = ScheduleGenerator::generate(&item, &accelerated).unwrap();
        assert_eq!(entries.last().unwrap().scheduled_date, created() + Duration::days(90));
    }

    proptest! {
        #[test]
        fn prop_entries_are_ordered(
            hot in 0u32..400,
            warm in 0u32..400,
            cold in 0u32..400,
            archive in proptest::option::of(0u32..400),
            warm_auto in any::<bool>(),
            cold_auto in any::<bool>(),
        ) {
            let mut policy = RetentionPolicy::new("p", "blob").with_tiers(
                TierSpec::automatic(hot),
                TierSpec::new(warm, warm_auto),
                TierSpec::new(cold, cold_auto),
            );
            if let Some(days) = archive {
                policy = policy.with_archive(TierSpec::automatic(days));
            }
            policy = policy.retain_for(hot + warm + cold + archive.unwrap_or(0));

            let item = DataItem::new("x", "blob", created(), 1);
            let entries = ScheduleGenerator::generate(&item, &policy).unwrap();

            prop_assert_eq!(
                entries.iter().filter(|e| e.scheduled_action == ScheduledAction::Delete).count(),
                1
            );
            for pair in entries.windows(2) {
                prop_assert!(pair[0].scheduled_date <= pair[1].scheduled_date);
                prop_assert!(pair[0].sequence < pair[1].sequence);
            }
            let mut tier = StorageTier::Hot;
            for entry in entries.iter().filter(|e| e.scheduled_action == ScheduledAction::Transition) {
                prop_assert_eq!(entry.current_tier, tier);
                let next = entry.next_tier.unwrap();
                prop_assert!(next > tier);
                tier = next;
            }
        }
    }
}
