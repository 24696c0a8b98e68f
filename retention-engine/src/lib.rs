//! Data lifecycle and legal-hold scheduling for the RustCare Engine
//!
//! Decides, for every retained data item, when it moves between storage
//! tiers and when it is destroyed, while legal holds suspend that lifecycle:
//!
//! - **Policies**: versioned tier durations, grace periods and custom rules
//! - **Schedules**: a deterministic chain of transition/delete entries per item
//! - **Legal holds**: pause schedules, block deletion, resume with catch-up
//! - **Execution**: tick-driven, single writer per item, bounded retries
//! - **Reporting**: tier distribution, upcoming actions, framework compliance
//!
//! # Example
//!
//! ```rust,no_run
//! use retention_engine::{
//!     DataItem, EngineConfig, InMemoryRetentionStore, InMemoryStorageBackend, RetentionEngine,
//!     RetentionPolicy, TierSpec,
//! };
//! use chrono::Utc;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryRetentionStore::new());
//!     let backend = Arc::new(InMemoryStorageBackend::new());
//!     let engine = RetentionEngine::new(store, backend, EngineConfig::default()).await?;
//!
//!     let policy = RetentionPolicy::new("Imaging", "dicom")
//!         .with_tiers(
//!             TierSpec::automatic(30),
//!             TierSpec::automatic(60),
//!             TierSpec::automatic(90),
//!         )
//!         .retain_for(180)
//!         .with_grace_period(30);
//!     engine.create_policy(policy).await?;
//!
//!     engine
//!         .register_data(DataItem::new("study-42", "dicom", Utc::now(), 1 << 20))
//!         .await?;
//!
//!     for result in engine.run_tick(None).await? {
//!         println!("{} entries processed", result.processed);
//!     }
//!     Ok(())
//! }
//! ```

// Core modules
pub mod error;
pub mod config;
pub mod classification;
pub mod policy;
pub mod rules;
pub mod schedule;
pub mod storage;
pub mod store;
pub mod locks;
pub mod events;
pub mod hold;
pub mod executor;
pub mod report;
pub mod engine;

// Re-exports
pub use error::{ErrorKind, RetentionError, RetentionResult};
pub use config::EngineConfig;
pub use classification::DataClassification;
pub use policy::{RetentionPolicy, StorageTier, TierSpec};
pub use rules::{CustomRule, RuleAction, RuleCondition};
pub use schedule::{EntryStatus, RetentionScheduleEntry, ScheduleGenerator, ScheduledAction};
pub use storage::{BackendOperation, DataItem, InMemoryStorageBackend, StorageBackend, StorageOutcome};
pub use store::{EntryQuery, InMemoryRetentionStore, PolicyCache, RetentionStore, StoreSnapshot};
pub use locks::DataLocks;
pub use events::{EventBus, EventKind, LifecycleEvent, Notifier, TracingNotifier};
pub use hold::{
    Custodian, DataUnderHold, HoldApplication, HoldFlags, HoldRelease, HoldScope, HoldStatus, LegalHold,
    LegalHoldRegistry, Matter,
};
pub use executor::{EntryError, ExecutionResult, RetentionExecutor, TransitionCounts};
pub use report::{ComplianceStatus, FrameworkCompliance, RetentionReport};
pub use engine::RetentionEngine;
