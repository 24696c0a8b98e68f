use crate::error::RetentionResult;
use crate::policy::StorageTier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PolicyCreated,
    PolicyUpdated,
    ScheduleGenerated,
    EntryTransitioned,
    EntryDeleted,
    EntryFailed,
    LegalHoldApplied,
    LegalHoldReleased,
    ReviewRequired,
    ThresholdWarning,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::PolicyCreated,
        EventKind::PolicyUpdated,
        EventKind::ScheduleGenerated,
        EventKind::EntryTransitioned,
        EventKind::EntryDeleted,
        EventKind::EntryFailed,
        EventKind::LegalHoldApplied,
        EventKind::LegalHoldReleased,
        EventKind::ReviewRequired,
        EventKind::ThresholdWarning,
    ];
}

/// Lifecycle events emitted to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    PolicyCreated {
        policy_id: Uuid,
        version: u32,
        at: DateTime<Utc>,
    },
    PolicyUpdated {
        policy_id: Uuid,
        version: u32,
        regenerated_items: usize,
        at: DateTime<Utc>,
    },
    ScheduleGenerated {
        data_id: String,
        policy_id: Uuid,
        policy_version: u32,
        entries: usize,
        at: DateTime<Utc>,
    },
    EntryTransitioned {
        entry_id: Uuid,
        data_id: String,
        from: StorageTier,
        to: StorageTier,
        bytes: u64,
        at: DateTime<Utc>,
    },
    EntryDeleted {
        entry_id: Uuid,
        data_id: String,
        bytes: u64,
        at: DateTime<Utc>,
    },
    EntryFailed {
        entry_id: Uuid,
        data_id: String,
        error: String,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    LegalHoldApplied {
        hold_id: Uuid,
        matter: String,
        data_ids: Vec<String>,
        at: DateTime<Utc>,
    },
    LegalHoldReleased {
        hold_id: Uuid,
        data_ids: Vec<String>,
        at: DateTime<Utc>,
    },
    ReviewRequired {
        entry_id: Option<Uuid>,
        data_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
    ThresholdWarning {
        policy_id: Option<Uuid>,
        metric: String,
        value: f64,
        threshold: f64,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::PolicyCreated { .. } => EventKind::PolicyCreated,
            LifecycleEvent::PolicyUpdated { .. } => EventKind::PolicyUpdated,
            LifecycleEvent::ScheduleGenerated { .. } => EventKind::ScheduleGenerated,
            LifecycleEvent::EntryTransitioned { .. } => EventKind::EntryTransitioned,
            LifecycleEvent::EntryDeleted { .. } => EventKind::EntryDeleted,
            LifecycleEvent::EntryFailed { .. } => EventKind::EntryFailed,
            LifecycleEvent::LegalHoldApplied { .. } => EventKind::LegalHoldApplied,
            LifecycleEvent::LegalHoldReleased { .. } => EventKind::LegalHoldReleased,
            LifecycleEvent::ReviewRequired { .. } => EventKind::ReviewRequired,
            LifecycleEvent::ThresholdWarning { .. } => EventKind::ThresholdWarning,
        }
    }
}

/// One bounded queue per event kind; publishing never blocks the engine
pub struct EventBus {
    senders: HashMap<EventKind, mpsc::Sender<LifecycleEvent>>,
    /// Receivers not yet handed to a subscriber
    unclaimed: Mutex<HashMap<EventKind, mpsc::Receiver<LifecycleEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let mut senders = HashMap::new();
        let mut unclaimed = HashMap::new();
        for kind in EventKind::ALL {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(kind, tx);
            unclaimed.insert(kind, rx);
        }

        Self {
            senders,
            unclaimed: Mutex::new(unclaimed),
        }
    }

    /// Take the receiver for a kind; each kind has a single subscriber
    pub fn subscribe(&self, kind: EventKind) -> Option<mpsc::Receiver<LifecycleEvent>> {
        self.unclaimed.lock().remove(&kind)
    }

    /// Queue an event; returns whether a subscriber will see it
    pub fn publish(&self, event: LifecycleEvent) -> bool {
        let kind = event.kind();
        if self.unclaimed.lock().contains_key(&kind) {
            debug!(?kind, "No subscriber for event kind, dropping");
            return false;
        }

        let Some(sender) = self.senders.get(&kind) else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(?kind, "Event queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(?kind, "Event subscriber gone, dropping event");
                false
            }
        }
    }
}

/// External notification channel (email, webhook, ...)
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &LifecycleEvent) -> RetentionResult<()>;
}

/// Notifier that writes events to the log
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> RetentionResult<()> {
        let payload = serde_json::to_string(event)?;
        info!(kind = ?event.kind(), %payload, "Lifecycle event");
        Ok(())
    }
}

/// Spawn one subscriber task per kind forwarding events to `notifier`
///
/// Delivery failures are logged and not retried.
pub fn spawn_notifier(
    bus: &EventBus,
    kinds: &[EventKind],
    notifier: Arc<dyn Notifier>,
) -> Vec<JoinHandle<()>> {
    kinds
        .iter()
        .filter_map(|kind| bus.subscribe(*kind).map(|rx| (*kind, rx)))
        .map(|(kind, mut rx)| {
            let notifier = notifier.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let Err(e) = notifier.notify(&event).await {
                        warn!(?kind, error = %e, "Notification delivery failed");
                    }
                }
            })
        })
        .collect()
}
