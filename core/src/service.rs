use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::calendar::{Calendar, WeekAnchor};
use crate::db::EntryStore;
use crate::error::StoreError;
use crate::events::{Analytics, ChangeEvent, EventBus};
use crate::models::{
    Entry, EntryFilter, InsertOutcome, LedgerStats, NewEntry, SortOrder, WeeklyDigest,
};
use crate::stats::StatsAggregator;
use crate::sync::SyncBridgeHandle;

pub const WEEK_START_SETTING: &str = "week_start_anchor";
pub const DIGEST_UNLOCK_SETTING: &str = "digest_unlock_anchor";

/// Open the shared store. A failure here is fatal for the hosting process:
/// it is reported to analytics and handed back for the caller to stop on.
pub fn open_store(path: &Path, analytics: &dyn Analytics) -> Result<EntryStore, StoreError> {
    EntryStore::open(path).inspect_err(|err| {
        tracing::error!(path = %path.display(), "cannot open entry store: {err}");
        analytics.store_failure(err);
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Created {
    /// The stored entry. For a duplicate this is the row already present.
    pub entry: Entry,
    pub outcome: InsertOutcome,
}

/// The creation entry point and read side of one device's ledger.
pub struct Ledger<Tz: TimeZone = Local> {
    store: Arc<EntryStore>,
    events: EventBus,
    calendar: RwLock<Calendar<Tz>>,
    bridge: Option<SyncBridgeHandle>,
}

impl<Tz: TimeZone> Ledger<Tz> {
    /// Anchors persisted in the store win over the ones in `calendar`.
    pub fn new(
        store: Arc<EntryStore>,
        events: EventBus,
        mut calendar: Calendar<Tz>,
    ) -> Result<Self> {
        let week_start = load_anchor(&store, WEEK_START_SETTING)?;
        let digest_unlock = load_anchor(&store, DIGEST_UNLOCK_SETTING)?;
        if week_start.is_some() || digest_unlock.is_some() {
            calendar.set_anchors(
                week_start.unwrap_or(calendar.week_start_anchor()),
                digest_unlock.unwrap_or(calendar.digest_unlock_anchor()),
            );
        }
        Ok(Self {
            store,
            events,
            calendar: RwLock::new(calendar),
            bridge: None,
        })
    }

    /// Forward newly created local entries through `bridge`.
    #[must_use]
    pub fn with_bridge(mut self, bridge: SyncBridgeHandle) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn bridge(&self) -> Option<&SyncBridgeHandle> {
        self.bridge.as_ref()
    }

    /// Snapshot of the current calendar configuration.
    pub fn calendar(&self) -> Calendar<Tz> {
        self.read_calendar().clone()
    }

    fn read_calendar(&self) -> RwLockReadGuard<'_, Calendar<Tz>> {
        self.calendar.read().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Mutations ---

    /// Insert the entry and, when it was new, announce it and hand it to the
    /// sync bridge. A duplicate id is reported, not treated as an error, and
    /// triggers nothing.
    pub fn create(&self, new: NewEntry) -> Result<Created> {
        let entry = new.into_entry()?;
        let outcome = self
            .store
            .insert(&entry)
            .with_context(|| format!("Failed to store entry {}", entry.id))?;

        match outcome {
            InsertOutcome::Created => {
                tracing::debug!(id = %entry.id, origin = %entry.origin, "entry created");
                self.events.publish(ChangeEvent::EntryCreated(entry.clone()));
                if let Some(bridge) = &self.bridge {
                    bridge.forward_detached(entry.clone());
                }
                Ok(Created { entry, outcome })
            }
            InsertOutcome::AlreadyExisted => {
                tracing::debug!(id = %entry.id, "entry already existed");
                let stored = self.store.get(entry.id)?.unwrap_or(entry);
                Ok(Created {
                    entry: stored,
                    outcome,
                })
            }
        }
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let removed = self.store.delete(id)?;
        if removed {
            self.events.publish(ChangeEvent::EntryDeleted { id });
        }
        Ok(removed)
    }

    pub fn delete_all(&self) -> Result<usize> {
        let removed = self.store.delete_all()?;
        tracing::info!(removed, "ledger cleared");
        self.events.publish(ChangeEvent::LedgerCleared { removed });
        Ok(removed)
    }

    /// Persist new anchors and apply them to every later computation.
    pub fn set_anchors(&self, week_start: WeekAnchor, digest_unlock: WeekAnchor) -> Result<()> {
        self.store
            .set_setting(WEEK_START_SETTING, &week_start.to_string())?;
        self.store
            .set_setting(DIGEST_UNLOCK_SETTING, &digest_unlock.to_string())?;
        self.calendar
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_anchors(week_start, digest_unlock);
        tracing::info!(%week_start, %digest_unlock, "calendar anchors changed");
        self.events.publish(ChangeEvent::AnchorsChanged {
            week_start,
            digest_unlock,
        });
        Ok(())
    }

    // --- Reads ---

    pub fn entries(&self, filter: &EntryFilter, order: SortOrder) -> Result<Vec<Entry>> {
        Ok(self.store.fetch_where(filter, order)?)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<LedgerStats> {
        let entries = self.store.fetch_all(SortOrder::NewestFirst)?;
        let calendar = self.read_calendar();
        Ok(StatsAggregator::new(&calendar).compute(&entries, now))
    }

    pub fn weekly_digest(
        &self,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WeeklyDigest> {
        let calendar = self.read_calendar();
        let window = EntryFilter::between(
            calendar.start_of_week(reference).with_timezone(&Utc),
            calendar.end_of_week(reference).with_timezone(&Utc),
        );
        let entries = self.store.fetch_where(&window, SortOrder::NewestFirst)?;
        Ok(StatsAggregator::new(&calendar).weekly_digest(&entries, reference, now))
    }

    pub fn today(&self, now: DateTime<Utc>) -> Result<Vec<Entry>> {
        let calendar = self.read_calendar();
        let from = calendar.start_of_day(now).with_timezone(&Utc);
        let filter = EntryFilter {
            from: Some(from),
            ..EntryFilter::default()
        };
        let entries = self.store.fetch_where(&filter, SortOrder::NewestFirst)?;
        Ok(StatsAggregator::new(&calendar).today_entries(&entries, now))
    }
}

fn load_anchor(store: &EntryStore, key: &str) -> Result<Option<WeekAnchor>> {
    store
        .get_setting(key)?
        .map(|value| {
            value
                .parse()
                .with_context(|| format!("Invalid stored anchor for '{key}'"))
        })
        .transpose()
}
