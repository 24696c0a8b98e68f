use serde::{Deserialize, Serialize};

/// Data classification levels used for policy applicability and hold scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    /// Public data - no restrictions
    Public,
    /// Internal use only
    Internal,
    /// Confidential business data
    Confidential,
    /// Protected Health Information (PHI) - HIPAA regulated
    ProtectedHealthInformation,
    /// Personally Identifiable Information (PII) - GDPR/CCPA regulated
    PersonallyIdentifiableInformation,
    /// Financial data - SOX/PCI-DSS regulated
    Financial,
    /// Research data with special handling requirements
    Research,
}

impl DataClassification {
    /// Get minimum retention period in days
    pub fn minimum_retention_days(&self) -> Option<u32> {
        match self {
            DataClassification::ProtectedHealthInformation => Some(2555), // 7 years HIPAA
            DataClassification::Financial => Some(2555),                  // 7 years
            DataClassification::Research => Some(365 * 10),               // 10 years
            _ => None,
        }
    }

    /// Get maximum retention period in days (for privacy compliance)
    pub fn maximum_retention_days(&self) -> Option<u32> {
        match self {
            DataClassification::PersonallyIdentifiableInformation => Some(365 * 3), // 3 years GDPR
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_windows() {
        assert_eq!(
            DataClassification::ProtectedHealthInformation.minimum_retention_days(),
            Some(2555)
        );
        assert_eq!(
            DataClassification::PersonallyIdentifiableInformation.maximum_retention_days(),
            Some(365 * 3)
        );
        assert_eq!(DataClassification::Public.minimum_retention_days(), None);
        assert_eq!(DataClassification::Financial.maximum_retention_days(), None);
    }

    #[test]
    fn test_classification_serde_names() {
        let json = serde_json::to_string(&DataClassification::ProtectedHealthInformation).unwrap();
        assert_eq!(json, "\"protected_health_information\"");
    }
}
