use crate::classification::DataClassification;
use crate::error::{RetentionError, RetentionResult};
use crate::rules::{CustomRule, RuleAction};
use crate::storage::DataItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Upper bound for any retention period, grace period or rule shift
///
/// Keeps every derived schedule date inside chrono's representable range.
pub const MAX_RETENTION_DAYS: u32 = 365_000;

/// Storage tier for object lifecycle management
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageTier {
    /// Hot storage - frequent access, low latency
    #[default]
    Hot,
    /// Warm storage - infrequent access, moderate latency
    Warm,
    /// Cold storage - rare access, high latency, lower cost
    Cold,
    /// Archive - long-term retention, very high latency
    Archive,
}

impl StorageTier {
    /// Moving into these tiers reclaims primary storage
    pub fn reclaims_space(&self) -> bool {
        matches!(self, StorageTier::Cold | StorageTier::Archive)
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageTier::Hot => "hot",
            StorageTier::Warm => "warm",
            StorageTier::Cold => "cold",
            StorageTier::Archive => "archive",
        };
        f.write_str(name)
    }
}

/// Residency descriptor for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub duration_days: u32,
    /// Whether data moves into this tier automatically
    pub auto_transition: bool,
}

impl TierSpec {
    pub fn new(duration_days: u32, auto_transition: bool) -> Self {
        Self {
            duration_days,
            auto_transition,
        }
    }

    pub fn automatic(duration_days: u32) -> Self {
        Self::new(duration_days, true)
    }

    pub fn manual(duration_days: u32) -> Self {
        Self::new(duration_days, false)
    }
}

/// Versioned retention policy driving tier transitions and final deletion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    pub data_types: Vec<String>,
    pub classification: Option<DataClassification>,
    pub tenant_id: Option<String>,
    pub hot: TierSpec,
    pub warm: TierSpec,
    pub cold: TierSpec,
    pub archive: Option<TierSpec>,
    pub total_retention_days: u32,
    #[serde(default)]
    pub grace_period_days: u32,
    #[serde(default)]
    pub legal_hold_exempt: bool,
    #[serde(default)]
    pub compliance_frameworks: Vec<String>,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl RetentionPolicy {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: name.into(),
            data_types: vec![data_type.into()],
            classification: None,
            tenant_id: None,
            hot: TierSpec::automatic(0),
            warm: TierSpec::automatic(0),
            cold: TierSpec::automatic(0),
            archive: None,
            total_retention_days: 0,
            grace_period_days: 0,
            legal_hold_exempt: false,
            compliance_frameworks: Vec::new(),
            custom_rules: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_types.push(data_type.into());
        self
    }

    pub fn for_classification(mut self, classification: DataClassification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_tiers(mut self, hot: TierSpec, warm: TierSpec, cold: TierSpec) -> Self {
        self.hot = hot;
        self.warm = warm;
        self.cold = cold;
        self
    }

    pub fn with_archive(mut self, archive: TierSpec) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn retain_for(mut self, total_retention_days: u32) -> Self {
        self.total_retention_days = total_retention_days;
        self
    }

    pub fn with_grace_period(mut self, days: u32) -> Self {
        self.grace_period_days = days;
        self
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.compliance_frameworks.push(framework.into());
        self
    }

    pub fn with_rule(mut self, rule: CustomRule) -> Self {
        self.custom_rules.push(rule);
        self
    }

    pub fn exempt_from_legal_hold(mut self) -> Self {
        self.legal_hold_exempt = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Defined tiers in lifecycle order
    pub fn tiers(&self) -> Vec<(StorageTier, TierSpec)> {
        let mut tiers = vec![
            (StorageTier::Hot, self.hot),
            (StorageTier::Warm, self.warm),
            (StorageTier::Cold, self.cold),
        ];
        if let Some(archive) = self.archive {
            tiers.push((StorageTier::Archive, archive));
        }
        tiers
    }

    /// Sum of all defined tier durations
    pub fn tier_duration_sum(&self) -> u64 {
        self.tiers()
            .iter()
            .map(|(_, spec)| u64::from(spec.duration_days))
            .sum()
    }

    /// Check if this policy governs the given data item
    pub fn applies_to(&self, item: &DataItem) -> bool {
        if !self.enabled {
            return false;
        }

        if !self.data_types.iter().any(|t| t == &item.data_type) {
            return false;
        }

        if self.total_retention_days > MAX_RETENTION_DAYS {
            return Err(RetentionError::Validation(format!(
                "Retention period {} days exceeds the supported maximum of {} days",
                self.total_retention_days, MAX_RETENTION_DAYS
            )));
        }

        if self.grace_period_days > MAX_RETENTION_DAYS {
            return Err(RetentionError::Validation(format!(
                "Grace period {} days exceeds the supported maximum of {} days",
                self.grace_period_days, MAX_RETENTION_DAYS
            )));
        }

        let extension: u64 = self
            .custom_rules
            .iter()
            .map(|rule| match rule.action {
                RuleAction::Extend(days) => u64::from(days),
                _ => 0,
            })
            .sum();
        if extension > u64::from(MAX_RETENTION_DAYS) {
            return Err(RetentionError::Validation(format!(
                "Custom rules of policy {} extend retention by {} days, more than the supported {} days",
                self.name, extension, MAX_RETENTION_DAYS
            )));
        }

        if let Some(classification) = self.classification {
            if item.classification != Some(classification) {
                return false;
            }
        }

        if let Some(ref tenant) = self.tenant_id {
            if item.tenant_id.as_ref() != Some(tenant) {
                return false;
            }
        }

        true
    }

    /// Validate the policy; violations are reported, never corrected
    pub fn validate(&self) -> RetentionResult<()> {
        if self.name.trim().is_empty() {
            return Err(RetentionError::Validation(
                "Policy name cannot be empty".to_string(),
            ));
        }

        if self.data_types.is_empty() || self.data_types.iter().any(|t| t.trim().is_empty()) {
            return Err(RetentionError::Validation(format!(
                "Policy {} must name at least one non-empty data type",
                self.name
            )));
        }

        let sum = self.tier_duration_sum();
        if sum != u64::from(self.total_retention_days) {
            return Err(RetentionError::Validation(format!(
                "Tier durations of policy {} sum to {} days but total retention is {} days",
                self.name, sum, self.total_retention_days
            )));
        }

        if let Some(classification) = self.classification {
            if let Some(min_days) = classification.minimum_retention_days() {
                if self.total_retention_days < min_days {
                    return Err(RetentionError::Validation(format!(
                        "Retention period {} days is less than minimum {} days for {:?}",
                        self.total_retention_days, min_days, classification
                    )));
                }
            }

            if let Some(max_days) = classification.maximum_retention_days() {
                if self.total_retention_days > max_days {
                    return Err(RetentionError::Validation(format!(
                        "Retention period {} days exceeds maximum {} days for {:?}",
                        self.total_retention_days, max_days, classification
                    )));
                }
            }
        }

        let mut names = HashSet::new();
        for rule in &self.custom_rules {
            rule.validate()?;
            if !names.insert(rule.name.as_str()) {
                return Err(RetentionError::Validation(format!(
                    "Duplicate custom rule name: {}",
                    rule.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleCondition;
    use proptest::prelude::*;

    fn standard_policy() -> RetentionPolicy {
        RetentionPolicy::new("Imaging", "dicom")
            .with_tiers(
                TierSpec::automatic(30),
                TierSpec::automatic(60),
                TierSpec::automatic(90),
            )
            .retain_for(180)
            .with_grace_period(30)
    }

    #[test]
    fn test_policy_validation() {
        assert!(standard_policy().validate().is_ok());

        let short = standard_policy().retain_for(170);
        let err = short.validate().unwrap_err();
        assert!(matches!(err, RetentionError::Validation(_)));

        let with_archive = standard_policy()
            .with_archive(TierSpec::automatic(20))
            .retain_for(200);
        assert!(with_archive.validate().is_ok());
    }

    #[test]
    fn test_classification_window_enforced() {
        let phi = standard_policy().for_classification(DataClassification::ProtectedHealthInformation);
        assert!(phi.validate().is_err());

        let pii = RetentionPolicy::new("Profiles", "profile")
            .for_classification(DataClassification::PersonallyIdentifiableInformation)
            .with_tiers(
                TierSpec::automatic(365),
                TierSpec::automatic(365),
                TierSpec::automatic(365),
            )
            .retain_for(1095);
        assert!(pii.validate().is_ok());
    }

    #[test]
    fn test_duplicate_rule_names_rejected() {
        let policy = standard_policy()
            .with_rule(CustomRule::new("keep", RuleCondition::Always, RuleAction::Preserve))
            .with_rule(CustomRule::new("keep", RuleCondition::Always, RuleAction::Hold));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_out_of_range_periods_rejected() {
        let huge = RetentionPolicy::new("Forever", "dicom")
            .with_tiers(
                TierSpec::automatic(1),
                TierSpec::automatic(1),
                TierSpec::automatic(1),
            )
            .with_archive(TierSpec::automatic(100_000_000))
            .retain_for(100_000_003);
        assert!(matches!(huge.validate(), Err(RetentionError::Validation(_))));

        let long_grace = standard_policy().with_grace_period(MAX_RETENTION_DAYS + 1);
        assert!(long_grace.validate().is_err());

        let extended = standard_policy()
            .with_rule(CustomRule::new("a", RuleCondition::Always, RuleAction::Extend(MAX_RETENTION_DAYS)))
            .with_rule(CustomRule::new("b", RuleCondition::Always, RuleAction::Extend(1)));
        assert!(extended.validate().is_err());

        assert!(standard_policy()
            .with_rule(CustomRule::new("a", RuleCondition::Always, RuleAction::Extend(3650)))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_applicability() {
        let policy = standard_policy().for_tenant("north");
        let item = DataItem::new("scan-1", "dicom", Utc::now(), 1024).with_tenant("north");
        assert!(policy.applies_to(&item));

        let other_tenant = DataItem::new("scan-2", "dicom", Utc::now(), 1024).with_tenant("south");
        assert!(!policy.applies_to(&other_tenant));

        let other_type = DataItem::new("note-1", "note", Utc::now(), 1024).with_tenant("north");
        assert!(!policy.applies_to(&other_type));

        assert!(!policy.clone().disabled().applies_to(&item));
    }

    proptest! {
        #[test]
        fn prop_tier_sum_must_equal_total(
            hot in 0u32..1000,
            warm in 0u32..1000,
            cold in 0u32..1000,
            archive in proptest::option::of(0u32..1000),
            drift in 1u32..50,
        ) {
            let mut policy = RetentionPolicy::new("generated", "blob").with_tiers(
                TierSpec::automatic(hot),
                TierSpec::automatic(warm),
                TierSpec::automatic(cold),
            );
            if let Some(days) = archive {
                policy = policy.with_archive(TierSpec::automatic(days));
            }
            let total = hot + warm + cold + archive.unwrap_or(0);

            prop_assert!(policy.clone().retain_for(total).validate().is_ok());
            prop_assert!(policy.clone().retain_for(total + drift).validate().is_err());
            if total >= drift {
                prop_assert!(policy.retain_for(total - drift).validate().is_err());
            }
        }
    }
}
