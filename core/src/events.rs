//! Typed change events and the collaborators that listen to them.
//!
//! Every successful mutation publishes a [`ChangeEvent`]. The refresh
//! notifier and analytics subscribe instead of being called from the write
//! path.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::calendar::WeekAnchor;
use crate::error::StoreError;
use crate::models::Entry;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    EntryCreated(Entry),
    EntryDeleted { id: Uuid },
    LedgerCleared { removed: usize },
    AnchorsChanged {
        week_start: WeekAnchor,
        digest_unlock: WeekAnchor,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Events published with no subscriber are dropped.
    pub fn publish(&self, event: ChangeEvent) {
        match self.sender.send(event) {
            Ok(receivers) => tracing::trace!(receivers, "change event published"),
            Err(_) => tracing::trace!("change event published with no subscribers"),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Told, without payload, that derived views should be redrawn.
pub trait RefreshNotifier: Send + Sync {
    fn refresh(&self) -> anyhow::Result<()>;
}

/// Analytics sink. Transport of the events is someone else's problem.
pub trait Analytics: Send + Sync {
    fn entry_created(&self, entry: &Entry);
    fn entry_deleted(&self, id: Uuid);
    fn store_failure(&self, error: &StoreError);
}

/// Analytics that only writes structured log lines.
pub struct TracingAnalytics;

impl Analytics for TracingAnalytics {
    fn entry_created(&self, entry: &Entry) {
        tracing::info!(
            id = %entry.id,
            origin = %entry.origin,
            target = %entry.target,
            "analytics: entry created"
        );
    }

    fn entry_deleted(&self, id: Uuid) {
        tracing::info!(%id, "analytics: entry deleted");
    }

    fn store_failure(&self, error: &StoreError) {
        tracing::error!(fatal = error.is_fatal(), "analytics: store failure: {error}");
    }
}

/// Call `notifier.refresh()` after every mutation. Errors from the notifier
/// are ignored.
pub fn spawn_refresh_listener(
    bus: &EventBus,
    notifier: Arc<dyn RefreshNotifier>,
) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                // A lagged receiver still knows something changed.
                Ok(_) | Err(RecvError::Lagged(_)) => {
                    if let Err(err) = notifier.refresh() {
                        tracing::debug!("refresh notifier failed (ignored): {err:#}");
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

pub fn spawn_analytics_listener(bus: &EventBus, analytics: Arc<dyn Analytics>) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(ChangeEvent::EntryCreated(entry)) => analytics.entry_created(&entry),
                Ok(ChangeEvent::EntryDeleted { id }) => analytics.entry_deleted(id),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "analytics listener lagged behind change events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::{Origin, Target};

    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl RefreshNotifier for CountingNotifier {
        fn refresh(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("widget host is gone");
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingAnalytics {
        created: Mutex<Vec<Uuid>>,
        deleted: Mutex<Vec<Uuid>>,
    }

    impl Analytics for RecordingAnalytics {
        fn entry_created(&self, entry: &Entry) {
            self.created.lock().unwrap().push(entry.id);
        }
        fn entry_deleted(&self, id: Uuid) {
            self.deleted.lock().unwrap().push(id);
        }
        fn store_failure(&self, _error: &StoreError) {}
    }

    fn sample_entry() -> Entry {
        Entry {
            id: Uuid::new_v4(),
            name: "Apple".to_string(),
            timestamp: chrono::Utc::now(),
            target: Target::Companion,
            origin: Origin::WatchApp,
        }
    }

    #[tokio::test]
    async fn refresh_called_per_event_and_errors_ignored() {
        let bus = EventBus::default();
        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let handle = spawn_refresh_listener(&bus, notifier.clone());

        bus.publish(ChangeEvent::EntryCreated(sample_entry()));
        bus.publish(ChangeEvent::LedgerCleared { removed: 1 });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn analytics_sees_creations_and_deletions() {
        let bus = EventBus::default();
        let analytics = Arc::new(RecordingAnalytics::default());
        let handle = spawn_analytics_listener(&bus, analytics.clone());

        let entry = sample_entry();
        bus.publish(ChangeEvent::EntryCreated(entry.clone()));
        bus.publish(ChangeEvent::EntryDeleted { id: entry.id });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(*analytics.created.lock().unwrap(), vec![entry.id]);
        assert_eq!(*analytics.deleted.lock().unwrap(), vec![entry.id]);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(ChangeEvent::LedgerCleared { removed: 0 });
    }
}
