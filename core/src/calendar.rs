//! Day and digest-week boundaries.
//!
//! A digest week starts at a configurable weekday and time of day rather than
//! at midnight Monday. A second anchor with the same shape decides when the
//! digest for a finished week unlocks.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{
    DateTime, Datelike, Days, Local, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
    Utc, Weekday,
};
use serde::{Deserialize, Serialize};

/// Longest DST gap we step across when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 3 * 60;

/// A weekday plus an hour:minute of that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WeekAnchor {
    weekday: Weekday,
    hour: u32,
    minute: u32,
}

impl WeekAnchor {
    /// Monday 00:00.
    pub const DEFAULT_WEEK_START: Self = Self {
        weekday: Weekday::Mon,
        hour: 0,
        minute: 0,
    };

    /// Sunday 18:00.
    pub const DEFAULT_DIGEST_UNLOCK: Self = Self {
        weekday: Weekday::Sun,
        hour: 18,
        minute: 0,
    };

    pub fn new(weekday: Weekday, hour: u32, minute: u32) -> Result<Self> {
        if hour > 23 {
            bail!("Anchor hour must be 0-23, got {hour}");
        }
        if minute > 59 {
            bail!("Anchor minute must be 0-59, got {minute}");
        }
        Ok(Self {
            weekday,
            hour,
            minute,
        })
    }

    /// Build from a weekday number where 1 = Sunday and 7 = Saturday.
    pub fn from_weekday_number(number: u8, hour: u32, minute: u32) -> Result<Self> {
        let weekday = match number {
            1 => Weekday::Sun,
            2 => Weekday::Mon,
            3 => Weekday::Tue,
            4 => Weekday::Wed,
            5 => Weekday::Thu,
            6 => Weekday::Fri,
            7 => Weekday::Sat,
            _ => bail!("Weekday number must be 1-7 (1 = Sunday), got {number}"),
        };
        Self::new(weekday, hour, minute)
    }

    #[must_use]
    pub fn weekday(self) -> Weekday {
        self.weekday
    }

    /// 1 = Sunday ... 7 = Saturday.
    #[must_use]
    pub fn weekday_number(self) -> u8 {
        self.weekday.number_from_sunday() as u8
    }

    #[must_use]
    pub fn hour(self) -> u32 {
        self.hour
    }

    #[must_use]
    pub fn minute(self) -> u32 {
        self.minute
    }

    fn time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for WeekAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = self.weekday.to_string().to_lowercase();
        write!(f, "{day} {:02}:{:02}", self.hour, self.minute)
    }
}

/// Accepts `"mon 12:15"`, `"Monday 12:15"` or `"2 12:15"` (1 = Sunday).
impl FromStr for WeekAnchor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(day), Some(time), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!("Invalid anchor '{s}'. Use '<weekday> HH:MM', e.g. 'mon 12:15'");
        };
        let (hour, minute) = time
            .split_once(':')
            .with_context(|| format!("Invalid anchor time '{time}'. Use HH:MM"))?;
        let hour: u32 = hour
            .parse()
            .with_context(|| format!("Invalid anchor hour in '{time}'"))?;
        let minute: u32 = minute
            .parse()
            .with_context(|| format!("Invalid anchor minute in '{time}'"))?;

        if let Ok(number) = day.parse::<u8>() {
            return Self::from_weekday_number(number, hour, minute);
        }
        let weekday: Weekday = day
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid anchor weekday '{day}'"))?;
        Self::new(weekday, hour, minute)
    }
}

impl TryFrom<String> for WeekAnchor {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<WeekAnchor> for String {
    fn from(anchor: WeekAnchor) -> Self {
        anchor.to_string()
    }
}

/// Boundary arithmetic in one time zone under a week-start and a
/// digest-unlock anchor.
#[derive(Debug, Clone)]
pub struct Calendar<Tz: TimeZone = Local> {
    tz: Tz,
    week_start: WeekAnchor,
    digest_unlock: WeekAnchor,
}

impl Calendar<Local> {
    #[must_use]
    pub fn local(week_start: WeekAnchor, digest_unlock: WeekAnchor) -> Self {
        Self::new(Local, week_start, digest_unlock)
    }
}

impl<Tz: TimeZone> Calendar<Tz> {
    pub fn new(tz: Tz, week_start: WeekAnchor, digest_unlock: WeekAnchor) -> Self {
        Self {
            tz,
            week_start,
            digest_unlock,
        }
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    pub fn week_start_anchor(&self) -> WeekAnchor {
        self.week_start
    }

    pub fn digest_unlock_anchor(&self) -> WeekAnchor {
        self.digest_unlock
    }

    pub fn set_anchors(&mut self, week_start: WeekAnchor, digest_unlock: WeekAnchor) {
        self.week_start = week_start;
        self.digest_unlock = digest_unlock;
    }

    /// Local midnight of the day containing `instant`.
    pub fn start_of_day(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        self.resolve(self.day_of(instant).and_time(NaiveTime::MIN))
    }

    /// The local calendar day containing `instant`.
    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    /// Start of the digest week containing `instant`. An instant that falls
    /// on the anchor weekday but before the anchor time belongs to the
    /// previous week.
    pub fn start_of_week(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        self.anchored_start(self.week_start, instant)
    }

    /// Exclusive end of the digest week containing `instant`.
    pub fn end_of_week(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        let start = self.start_of_week(instant);
        self.resolve((start.date_naive() + Days::new(7)).and_time(self.week_start.time()))
    }

    /// The most recent digest-unlock instant at or before `instant`.
    pub fn last_unlock(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        self.anchored_start(self.digest_unlock, instant)
    }

    /// When the digest of the week starting at `week_start` unlocks: the last
    /// unlock instant that falls inside `(week_start, week_end]`, or the first
    /// one after `week_end` when the week contains none.
    pub fn digest_unlock_for(&self, week_start: &DateTime<Tz>) -> DateTime<Tz> {
        let week_end = self.end_of_week(week_start.with_timezone(&Utc));
        let unlock = self.last_unlock(week_end.with_timezone(&Utc));
        if unlock > *week_start {
            unlock
        } else {
            self.resolve(
                (unlock.date_naive() + Days::new(7)).and_time(self.digest_unlock.time()),
            )
        }
    }

    pub fn is_digest_available(&self, week_start: &DateTime<Tz>, now: DateTime<Utc>) -> bool {
        self.digest_unlock_for(week_start) <= now
    }

    fn anchored_start(&self, anchor: WeekAnchor, instant: DateTime<Utc>) -> DateTime<Tz> {
        let date = self.day_of(instant);
        let offset = (7 + date.weekday().num_days_from_sunday()
            - anchor.weekday.num_days_from_sunday())
            % 7;
        let first_day = date - Days::new(u64::from(offset));
        let candidate = self.resolve(first_day.and_time(anchor.time()));
        if candidate > instant {
            // This week's anchor has not happened yet relative to `instant`.
            self.resolve((first_day - Days::new(7)).and_time(anchor.time()))
        } else {
            candidate
        }
    }

    /// Map a local wall-clock time to an instant. Ambiguous times take the
    /// earliest instant; times inside a DST gap take the first valid minute
    /// after the gap.
    fn resolve(&self, naive: NaiveDateTime) -> DateTime<Tz> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t,
            LocalResult::None => (1..=MAX_GAP_MINUTES)
                .find_map(|m| {
                    self.tz
                        .from_local_datetime(&(naive + chrono::Duration::minutes(m)))
                        .earliest()
                })
                .unwrap_or_else(|| self.tz.from_utc_datetime(&naive)),
        }
    }
}
