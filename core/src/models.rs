use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, FixedOffset, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Entry ---

/// Who an entry was logged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    #[serde(rename = "self")]
    User,
    #[serde(rename = "companion")]
    Companion,
}

impl Target {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "self",
            Self::Companion => "companion",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "self" | "me" | "user" => Ok(Self::User),
            "companion" => Ok(Self::Companion),
            _ => bail!("Invalid target '{s}'. Must be one of: self, companion"),
        }
    }
}

/// One of the two paired device processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Phone,
    Watch,
}

impl Device {
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Phone => Self::Watch,
            Self::Watch => Self::Phone,
        }
    }

    /// Origin tag for entries created in this device's main app.
    #[must_use]
    pub fn app_origin(self) -> Origin {
        match self {
            Self::Phone => Origin::PhoneApp,
            Self::Watch => Origin::WatchApp,
        }
    }

    /// Origin tag for entries this device received from its peer.
    #[must_use]
    pub fn received_origin(self) -> Origin {
        match self {
            Self::Phone => Origin::PhoneFromWatch,
            Self::Watch => Origin::WatchFromPhone,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Watch => "watch",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "phone" => Ok(Self::Phone),
            "watch" => Ok(Self::Watch),
            _ => bail!("Invalid device '{s}'. Must be one of: phone, watch"),
        }
    }
}

/// Provenance of an entry. Drives analytics and replication loop-prevention,
/// never statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    PhoneApp,
    PhoneWidget,
    PhoneIntent,
    PhoneFromWatch,
    WatchApp,
    WatchFromPhone,
}

impl Origin {
    pub const ALL: [Origin; 6] = [
        Self::PhoneApp,
        Self::PhoneWidget,
        Self::PhoneIntent,
        Self::PhoneFromWatch,
        Self::WatchApp,
        Self::WatchFromPhone,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhoneApp => "phoneApp",
            Self::PhoneWidget => "phoneWidget",
            Self::PhoneIntent => "phoneIntent",
            Self::PhoneFromWatch => "phoneFromWatch",
            Self::WatchApp => "watchApp",
            Self::WatchFromPhone => "watchFromPhone",
        }
    }

    /// The device whose store the entry was written to under this tag.
    #[must_use]
    pub fn device(self) -> Device {
        match self {
            Self::PhoneApp | Self::PhoneWidget | Self::PhoneIntent | Self::PhoneFromWatch => {
                Device::Phone
            }
            Self::WatchApp | Self::WatchFromPhone => Device::Watch,
        }
    }

    #[must_use]
    pub fn is_peer_received(self) -> bool {
        matches!(self, Self::PhoneFromWatch | Self::WatchFromPhone)
    }

    /// True when `device` originally created the entry, which is the only
    /// case in which it may be forwarded.
    #[must_use]
    pub fn is_local_to(self, device: Device) -> bool {
        self.device() == device && !self.is_peer_received()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        Self::ALL
            .into_iter()
            .find(|origin| origin.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|o| o.as_str()).collect();
                anyhow::anyhow!(
                    "Invalid origin '{s}'. Must be one of: {}",
                    valid.join(", ")
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub target: Target,
    pub origin: Origin,
}

/// A creation request. `id` is pre-assigned when the caller and the
/// replication path must agree on one identity.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub id: Option<Uuid>,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub target: Target,
    pub origin: Origin,
}

impl NewEntry {
    /// Validate and assign an id. Timestamps are stored at millisecond precision.
    pub fn into_entry(self) -> Result<Entry> {
        let name = validate_entry_name(&self.name)?;
        Ok(Entry {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name,
            timestamp: self.timestamp.trunc_subsecs(3),
            target: self.target,
            origin: self.origin,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Created,
    AlreadyExisted,
}

impl InsertOutcome {
    #[must_use]
    pub fn is_created(self) -> bool {
        self == Self::Created
    }
}

// --- Queries ---

/// Predicate for [`crate::db::EntryStore::fetch_where`]. The timestamp range
/// is half-open: `from <= timestamp < until`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub target: Option<Target>,
}

impl EntryFilter {
    #[must_use]
    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
            target: None,
        }
    }

    #[must_use]
    pub fn for_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        self.from.is_none_or(|from| entry.timestamp >= from)
            && self.until.is_none_or(|until| entry.timestamp < until)
            && self.target.is_none_or(|target| entry.target == target)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

// --- Derived views ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total_entries: usize,
    pub total_for_self: usize,
    pub total_for_companion: usize,
    pub average_companion_percentage_per_day: u32,
    pub current_streak: u32,
    pub longest_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameCount {
    pub name: String,
    pub count: usize,
}

/// Summary of one digest week, `[week_start, week_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeeklyDigest {
    pub week_start: DateTime<FixedOffset>,
    pub week_end: DateTime<FixedOffset>,
    pub unlocks_at: DateTime<FixedOffset>,
    pub available: bool,
    pub total_entries: usize,
    pub total_for_self: usize,
    pub total_for_companion: usize,
    pub active_days: usize,
    pub companion_percentage: u32,
    pub top_names: Vec<NameCount>,
}

pub fn validate_entry_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        bail!("Entry name must not be empty");
    }
    Ok(trimmed.to_string())
}
