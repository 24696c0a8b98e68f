//! Custom retention rules: a closed predicate tree evaluated against data items.

use crate::classification::DataClassification;
use crate::error::{RetentionError, RetentionResult};
use crate::storage::DataItem;
use serde::{Deserialize, Serialize};

/// Predicate over a data item's static attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum RuleCondition {
    Always,
    DataType(String),
    Classification(DataClassification),
    Tenant(String),
    TagEquals { key: String, value: String },
    SizeAtLeast(u64),
    All(Vec<RuleCondition>),
    Any(Vec<RuleCondition>),
    Not(Box<RuleCondition>),
}

impl RuleCondition {
    pub fn evaluate(&self, item: &DataItem) -> bool {
        match self {
            RuleCondition::Always => true,
            RuleCondition::DataType(data_type) => &item.data_type == data_type,
            RuleCondition::Classification(classification) => {
                item.classification == Some(*classification)
            }
            RuleCondition::Tenant(tenant) => item.tenant_id.as_ref() == Some(tenant),
            RuleCondition::TagEquals { key, value } => item.tags.get(key) == Some(value),
            RuleCondition::SizeAtLeast(bytes) => item.size_bytes >= *bytes,
            RuleCondition::All(conditions) => conditions.iter().all(|c| c.evaluate(item)),
            RuleCondition::Any(conditions) => conditions.iter().any(|c| c.evaluate(item)),
            RuleCondition::Not(condition) => !condition.evaluate(item),
        }
    }
}

/// Disposition override produced by a matching rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "days")]
pub enum RuleAction {
    /// Push the deletion date later
    Extend(u32),
    /// Pull the deletion date earlier
    Accelerate(u32),
    /// Defer an overdue deletion until its grace period ends
    Hold,
    /// Never delete automatically; flag for review instead
    Preserve,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    pub condition: RuleCondition,
    pub action: RuleAction,
}

impl CustomRule {
    pub fn new(name: impl Into<String>, condition: RuleCondition, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            condition,
            action,
        }
    }

    pub fn validate(&self) -> RetentionResult<()> {
        if self.name.trim().is_empty() {
            return Err(RetentionError::Validation(
                "Custom rule name cannot be empty".to_string(),
            ));
        }

        match self.action {
            RuleAction::Extend(0) | RuleAction::Accelerate(0) => Err(RetentionError::Validation(
                format!("Custom rule {} must shift the deletion date by at least one day", self.name),
            )),
            _ => Ok(()),
        }
    }
}

/// Combined effect of every rule matching one item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    /// Net shift of the deletion date in days (positive = later)
    pub deletion_shift_days: i64,
    pub hold: bool,
    pub preserve: bool,
}

pub fn evaluate_rules(rules: &[CustomRule], item: &DataItem) -> RuleOutcome {
    let mut outcome = RuleOutcome::default();

    for rule in rules.iter().filter(|r| r.condition.evaluate(item)) {
        match rule.action {
            RuleAction::Extend(days) => outcome.deletion_shift_days += i64::from(days),
            RuleAction::Accelerate(days) => outcome.deletion_shift_days -= i64::from(days),
            RuleAction::Hold => outcome.hold = true,
            RuleAction::Preserve => outcome.preserve = true,
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item() -> DataItem {
        DataItem::new("doc-7", "contract", Utc::now(), 4096)
            .with_classification(DataClassification::Financial)
            .with_tag("region", "eu")
    }

    #[test]
    fn test_condition_tree() {
        let condition = RuleCondition::All(vec![
            RuleCondition::DataType("contract".to_string()),
            RuleCondition::Any(vec![
                RuleCondition::Tenant("acme".to_string()),
                RuleCondition::TagEquals {
                    key: "region".to_string(),
                    value: "eu".to_string(),
                },
            ]),
            RuleCondition::Not(Box::new(RuleCondition::SizeAtLeast(1 << 20))),
        ]);
        assert!(condition.evaluate(&item()));
        assert!(!RuleCondition::Classification(DataClassification::Public).evaluate(&item()));
    }

    #[test]
    fn test_rule_outcome_accumulates() {
        let rules = vec![
            CustomRule::new("eu-extend", RuleCondition::TagEquals {
                key: "region".to_string(),
                value: "eu".to_string(),
            }, RuleAction::Extend(30)),
            CustomRule::new("small-accelerate", RuleCondition::Always, RuleAction::Accelerate(10)),
            CustomRule::new("never", RuleCondition::DataType("other".to_string()), RuleAction::Preserve),
            CustomRule::new("hold-financial", RuleCondition::Classification(DataClassification::Financial), RuleAction::Hold),
        ];

        let outcome = evaluate_rules(&rules, &item());
        assert_eq!(outcome.deletion_shift_days, 20);
        assert!(outcome.hold);
        assert!(!outcome.preserve);
    }

    #[test]
    fn test_zero_day_shift_rejected() {
        let rule = CustomRule::new("noop", RuleCondition::Always, RuleAction::Extend(0));
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_rule_serde_shape() {
        let rule = CustomRule::new("x", RuleCondition::SizeAtLeast(10), RuleAction::Extend(5));
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["action"]["type"], "extend");
        assert_eq!(json["action"]["days"], 5);
        assert_eq!(json["condition"]["type"], "size_at_least");
    }
}
