use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{Entry, EntryFilter, InsertOutcome, SortOrder, Target, validate_entry_name};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENTRY_COLUMNS: &str = "id, name, timestamp_ms, target, origin";

/// The shared entry ledger.
///
/// Every statement runs under one connection lock, so the idempotency check
/// and the insert happen in a single critical section. Reads return owned
/// snapshots. Processes sharing the same file rely on SQLite for atomicity of
/// individual statements.
#[derive(Debug)]
pub struct EntryStore {
    conn: Mutex<Connection>,
}

impl EntryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let init = |source| StoreError::Initialization {
            path: path.display().to_string(),
            source,
        };
        let conn = Connection::open(path).map_err(init)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(init)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(init)?;
        Self::migrate(&conn).map_err(init)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let init = |source| StoreError::Initialization {
            path: ":memory:".to_string(),
            source,
        };
        let conn = Connection::open_in_memory().map_err(init)?;
        Self::migrate(&conn).map_err(init)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn migrate(conn: &Connection) -> rusqlite::Result<()> {
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS entries (
                    id TEXT PRIMARY KEY NOT NULL,
                    name TEXT NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    target TEXT NOT NULL CHECK (target IN ('self', 'companion')),
                    origin TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON entries(timestamp_ms);

                CREATE TABLE IF NOT EXISTS user_settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Row mapping ---

    // Expects columns in ENTRY_COLUMNS order.
    fn entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
        let id: String = row.get(0)?;
        let timestamp_ms: i64 = row.get(2)?;
        let target: String = row.get(3)?;
        let origin: String = row.get(4)?;
        Ok(Entry {
            id: Uuid::parse_str(&id).map_err(|e| conversion_failure(0, e))?,
            name: row.get(1)?,
            timestamp: DateTime::from_timestamp_millis(timestamp_ms)
                .ok_or_else(|| {
                    conversion_failure(2, format!("timestamp {timestamp_ms} out of range"))
                })?,
            target: target.parse().map_err(|e| conversion_failure(3, e))?,
            origin: origin.parse().map_err(|e| conversion_failure(4, e))?,
        })
    }

    // --- Entries ---

    /// Insert unless an entry with the same id exists. A duplicate leaves the
    /// stored row untouched and reports [`InsertOutcome::AlreadyExisted`].
    pub fn insert(&self, entry: &Entry) -> Result<InsertOutcome> {
        validate_entry_name(&entry.name).map_err(|e| StoreError::InvalidEntry(e.to_string()))?;
        let rows = self
            .conn()
            .execute(
                "INSERT INTO entries (id, name, timestamp_ms, target, origin)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    entry.id.to_string(),
                    entry.name,
                    entry.timestamp.timestamp_millis(),
                    entry.target.as_str(),
                    entry.origin.as_str(),
                ],
            )
            .map_err(StoreError::Write)?;
        if rows == 0 {
            Ok(InsertOutcome::AlreadyExisted)
        } else {
            Ok(InsertOutcome::Created)
        }
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Entry>> {
        self.conn()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                params![id.to_string()],
                Self::entry_from_row,
            )
            .optional()
            .map_err(StoreError::from_read)
    }

    pub fn contains(&self, id: Uuid) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM entries WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Read)?;
        Ok(found.is_some())
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM entries WHERE id = ?1", params![id.to_string()])
            .map_err(StoreError::Write)?;
        Ok(rows > 0)
    }

    /// Returns the number of rows removed.
    pub fn delete_all(&self) -> Result<usize> {
        self.conn()
            .execute("DELETE FROM entries", [])
            .map_err(StoreError::Write)
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))
            .map_err(StoreError::Read)?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn fetch_all(&self, order: SortOrder) -> Result<Vec<Entry>> {
        self.fetch_where(&EntryFilter::default(), order)
    }

    pub fn fetch_where(&self, filter: &EntryFilter, order: SortOrder) -> Result<Vec<Entry>> {
        let direction = match order {
            SortOrder::NewestFirst => "DESC",
            SortOrder::OldestFirst => "ASC",
        };
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE (?1 IS NULL OR timestamp_ms >= ?1)
               AND (?2 IS NULL OR timestamp_ms < ?2)
               AND (?3 IS NULL OR target = ?3)
             ORDER BY timestamp_ms {direction}, id {direction}"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(StoreError::Read)?;
        let entries = stmt
            .query_map(
                params![
                    filter.from.map(|t| t.timestamp_millis()),
                    filter.until.map(|t| t.timestamp_millis()),
                    filter.target.map(Target::as_str),
                ],
                Self::entry_from_row,
            )
            .map_err(StoreError::Read)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from_read)?;
        Ok(entries)
    }

    // --- User Settings ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO user_settings (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )
            .map_err(StoreError::Write)?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT value FROM user_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::Read)
    }
}

fn conversion_failure<E>(column: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Origin, Target};
    use chrono::{TimeZone, Utc};

    fn sample_entry(name: &str, hour: u32, target: Target) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            name: name.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap(),
            target,
            origin: Origin::PhoneApp,
        }
    }

    #[test]
    fn test_insert_and_get_entry() {
        let store = EntryStore::open_in_memory().unwrap();
        let entry = sample_entry("Pancakes", 8, Target::User);

        assert_eq!(store.insert(&entry).unwrap(), InsertOutcome::Created);

        let fetched = store.get(entry.id).unwrap().unwrap();
        assert_eq!(fetched, entry);
        assert!(store.contains(entry.id).unwrap());
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_insert_same_id_twice_keeps_one_row() {
        let store = EntryStore::open_in_memory().unwrap();
        let entry = sample_entry("Pancakes", 8, Target::User);

        assert_eq!(store.insert(&entry).unwrap(), InsertOutcome::Created);

        // Same id, different payload: the original row must survive untouched
        let mut duplicate = entry.clone();
        duplicate.name = "Waffles".to_string();
        duplicate.origin = Origin::PhoneFromWatch;
        assert_eq!(
            store.insert(&duplicate).unwrap(),
            InsertOutcome::AlreadyExisted
        );

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.get(entry.id).unwrap().unwrap().name, "Pancakes");
    }

    #[test]
    fn test_insert_rejects_blank_name() {
        let store = EntryStore::open_in_memory().unwrap();
        let entry = sample_entry("  ", 8, Target::User);
        let err = store.insert(&entry).unwrap_err();
        assert!(matches!(err, StoreError::InvalidEntry(_)));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_fetch_all_orders_explicitly() {
        let store = EntryStore::open_in_memory().unwrap();
        let breakfast = sample_entry("Oats", 8, Target::User);
        let lunch = sample_entry("Soup", 12, Target::Companion);
        let dinner = sample_entry("Pasta", 19, Target::User);
        for e in [&lunch, &dinner, &breakfast] {
            store.insert(e).unwrap();
        }

        let newest: Vec<String> = store
            .fetch_all(SortOrder::NewestFirst)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(newest, vec!["Pasta", "Soup", "Oats"]);

        let oldest: Vec<String> = store
            .fetch_all(SortOrder::OldestFirst)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(oldest, vec!["Oats", "Soup", "Pasta"]);
    }

    #[test]
    fn test_fetch_where_range_and_target() {
        let store = EntryStore::open_in_memory().unwrap();
        let breakfast = sample_entry("Oats", 8, Target::User);
        let lunch = sample_entry("Soup", 12, Target::Companion);
        let dinner = sample_entry("Pasta", 19, Target::User);
        for e in [&breakfast, &lunch, &dinner] {
            store.insert(e).unwrap();
        }

        let from = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        let until = Utc.with_ymd_and_hms(2024, 3, 10, 19, 0, 0).unwrap();

        // Upper bound is exclusive
        let window = store
            .fetch_where(&EntryFilter::between(from, until), SortOrder::OldestFirst)
            .unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].name, "Oats");
        assert_eq!(window[1].name, "Soup");

        let companion = store
            .fetch_where(
                &EntryFilter::default().for_target(Target::Companion),
                SortOrder::NewestFirst,
            )
            .unwrap();
        assert_eq!(companion.len(), 1);
        assert_eq!(companion[0].id, lunch.id);

        let user_in_window = store
            .fetch_where(
                &EntryFilter::between(from, until).for_target(Target::User),
                SortOrder::NewestFirst,
            )
            .unwrap();
        assert_eq!(user_in_window.len(), 1);
        assert_eq!(user_in_window[0].id, breakfast.id);
    }

    #[test]
    fn test_delete_entry() {
        let store = EntryStore::open_in_memory().unwrap();
        let entry = sample_entry("Soup", 12, Target::User);
        store.insert(&entry).unwrap();

        assert!(store.delete(entry.id).unwrap());
        assert!(!store.delete(entry.id).unwrap());
        assert_eq!(store.count().unwrap(), 0);

        // A deleted id can be logged again
        assert_eq!(store.insert(&entry).unwrap(), InsertOutcome::Created);
    }

    #[test]
    fn test_delete_all() {
        let store = EntryStore::open_in_memory().unwrap();
        for hour in [8, 12, 19] {
            store
                .insert(&sample_entry("Snack", hour, Target::User))
                .unwrap();
        }
        assert_eq!(store.delete_all().unwrap(), 3);
        assert_eq!(store.delete_all().unwrap(), 0);
        assert!(store.fetch_all(SortOrder::NewestFirst).unwrap().is_empty());
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = EntryStore::open_in_memory().unwrap();
        assert!(store.get_setting("week_start_anchor").unwrap().is_none());
        store.set_setting("week_start_anchor", "mon 12:15").unwrap();
        store.set_setting("week_start_anchor", "tue 08:00").unwrap();
        assert_eq!(
            store.get_setting("week_start_anchor").unwrap().as_deref(),
            Some("tue 08:00")
        );
    }

    #[test]
    fn test_open_on_disk_shared_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        let app = EntryStore::open(&path).unwrap();
        let widget = EntryStore::open(&path).unwrap();

        let entry = sample_entry("Apple", 10, Target::Companion);
        assert_eq!(app.insert(&entry).unwrap(), InsertOutcome::Created);
        assert_eq!(
            widget.insert(&entry).unwrap(),
            InsertOutcome::AlreadyExisted
        );
        assert_eq!(widget.fetch_all(SortOrder::NewestFirst).unwrap(), vec![entry]);
    }

    #[test]
    fn test_open_reopen_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let entry = sample_entry("Apple", 10, Target::User);
        {
            let store = EntryStore::open(&path).unwrap();
            store.insert(&entry).unwrap();
        }
        let store = EntryStore::open(&path).unwrap();
        assert_eq!(store.get(entry.id).unwrap(), Some(entry));
    }

    #[test]
    fn test_open_unwritable_location_is_initialization_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("ledger.db");

        let err = EntryStore::open(&path).err().unwrap();
        assert!(matches!(err, StoreError::Initialization { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let store = EntryStore::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO entries (id, name, timestamp_ms, target, origin)
                 VALUES ('not-a-uuid', 'Soup', 0, 'self', 'phoneApp')",
                [],
            )
            .unwrap();
        let err = store.fetch_all(SortOrder::NewestFirst).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
