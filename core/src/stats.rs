use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, NaiveDate, Offset, TimeZone, Utc};

use crate::calendar::Calendar;
use crate::models::{Entry, LedgerStats, NameCount, Target, WeeklyDigest};

const TOP_NAMES: usize = 5;

/// Derived numbers over a ledger snapshot. Holds no state; everything is
/// recomputed from the entries passed in.
pub struct StatsAggregator<'a, Tz: TimeZone> {
    calendar: &'a Calendar<Tz>,
}

impl<'a, Tz: TimeZone> StatsAggregator<'a, Tz> {
    pub fn new(calendar: &'a Calendar<Tz>) -> Self {
        Self { calendar }
    }

    pub fn compute(&self, entries: &[Entry], now: DateTime<Utc>) -> LedgerStats {
        let total_for_companion = count_target(entries, Target::Companion);
        let days = self.active_days(entries);
        LedgerStats {
            total_entries: entries.len(),
            total_for_self: entries.len() - total_for_companion,
            total_for_companion,
            average_companion_percentage_per_day: self
                .average_companion_percentage_per_day(entries),
            current_streak: current_streak(&days, self.calendar.day_of(now)),
            longest_streak: longest_streak(&days),
        }
    }

    /// Mean of each day's companion share, every day weighted equally
    /// regardless of how many entries it holds. Rounded to a whole percent.
    #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn average_companion_percentage_per_day(&self, entries: &[Entry]) -> u32 {
        let mut per_day: BTreeMap<NaiveDate, (usize, usize)> = BTreeMap::new();
        for entry in entries {
            let (total, companion) = per_day
                .entry(self.calendar.day_of(entry.timestamp))
                .or_default();
            *total += 1;
            if entry.target == Target::Companion {
                *companion += 1;
            }
        }
        if per_day.is_empty() {
            return 0;
        }
        let sum: f64 = per_day
            .values()
            .map(|&(total, companion)| companion as f64 / total as f64)
            .sum();
        (sum / per_day.len() as f64 * 100.0).round() as u32
    }

    /// Distinct local days holding at least one entry, most recent first.
    pub fn active_days(&self, entries: &[Entry]) -> Vec<NaiveDate> {
        let days: BTreeSet<NaiveDate> = entries
            .iter()
            .map(|e| self.calendar.day_of(e.timestamp))
            .collect();
        days.into_iter().rev().collect()
    }

    /// Entries logged on the local day containing `now`, newest first.
    pub fn today_entries(&self, entries: &[Entry], now: DateTime<Utc>) -> Vec<Entry> {
        let today = self.calendar.day_of(now);
        let mut todays: Vec<Entry> = entries
            .iter()
            .filter(|e| self.calendar.day_of(e.timestamp) == today)
            .cloned()
            .collect();
        todays.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        todays
    }

    /// Digest for the week containing `reference`.
    pub fn weekly_digest(
        &self,
        entries: &[Entry],
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WeeklyDigest {
        let week_start = self.calendar.start_of_week(reference);
        let week_end = self.calendar.end_of_week(reference);
        let unlocks_at = self.calendar.digest_unlock_for(&week_start);

        let in_week: Vec<Entry> = entries
            .iter()
            .filter(|e| week_start <= e.timestamp && week_end > e.timestamp)
            .cloned()
            .collect();
        let total_for_companion = count_target(&in_week, Target::Companion);

        WeeklyDigest {
            week_start: week_start.with_timezone(&week_start.offset().fix()),
            week_end: week_end.with_timezone(&week_end.offset().fix()),
            unlocks_at: unlocks_at.with_timezone(&unlocks_at.offset().fix()),
            available: unlocks_at <= now,
            total_entries: in_week.len(),
            total_for_self: in_week.len() - total_for_companion,
            total_for_companion,
            active_days: self.active_days(&in_week).len(),
            companion_percentage: self.average_companion_percentage_per_day(&in_week),
            top_names: top_names(&in_week, TOP_NAMES),
        }
    }
}

fn count_target(entries: &[Entry], target: Target) -> usize {
    entries.iter().filter(|e| e.target == target).count()
}

/// Longest run of consecutive days in `days` (sorted, most recent first).
pub fn longest_streak(days: &[NaiveDate]) -> u32 {
    let mut longest = 0;
    let mut run = 0;
    let mut previous: Option<NaiveDate> = None;
    for &day in days {
        run = match previous {
            Some(prev) if day.succ_opt() == Some(prev) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        previous = Some(day);
    }
    longest
}

/// Run of consecutive days ending today. Zero unless the most recent day in
/// `days` (sorted, most recent first) is `today`, even if yesterday closes a
/// long run.
pub fn current_streak(days: &[NaiveDate], today: NaiveDate) -> u32 {
    if days.first() != Some(&today) {
        return 0;
    }
    let mut streak = 1;
    for pair in days.windows(2) {
        if pair[1].succ_opt() == Some(pair[0]) {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}

/// Most frequent names, compared case-insensitively. Ties go alphabetical.
fn top_names(entries: &[Entry], limit: usize) -> Vec<NameCount> {
    let mut counts: HashMap<String, (String, usize)> = HashMap::new();
    for entry in entries {
        let key = entry.name.to_lowercase();
        counts
            .entry(key)
            .or_insert_with(|| (entry.name.clone(), 0))
            .1 += 1;
    }
    let mut ranked: Vec<(String, String, usize)> = counts
        .into_iter()
        .map(|(key, (name, count))| (key, name, count))
        .collect();
    ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(_, name, count)| NameCount { name, count })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Origin;
    use chrono::{Duration, FixedOffset};
    use uuid::Uuid;

    fn calendar() -> Calendar<Utc> {
        Calendar::new(
            Utc,
            "mon 00:00".parse().unwrap(),
            "sun 18:00".parse().unwrap(),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 20, 0, 0).unwrap()
    }

    fn entry_at(timestamp: DateTime<Utc>, target: Target, name: &str) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            name: name.to_string(),
            timestamp,
            target,
            origin: Origin::PhoneApp,
        }
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        now() - Duration::days(days) - Duration::hours(2)
    }

    #[test]
    fn empty_ledger_is_all_zero() {
        let cal = calendar();
        let stats = StatsAggregator::new(&cal).compute(&[], now());
        assert_eq!(
            stats,
            LedgerStats {
                total_entries: 0,
                total_for_self: 0,
                total_for_companion: 0,
                average_companion_percentage_per_day: 0,
                current_streak: 0,
                longest_streak: 0,
            }
        );
    }

    #[test]
    fn totals_split_by_target() {
        let cal = calendar();
        let entries = vec![
            entry_at(days_ago(0), Target::User, "Toast"),
            entry_at(days_ago(0), Target::Companion, "Carrot"),
            entry_at(days_ago(1), Target::Companion, "Carrot"),
        ];
        let stats = StatsAggregator::new(&cal).compute(&entries, now());
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.total_for_self, 1);
        assert_eq!(stats.total_for_companion, 2);
    }

    #[test]
    fn streak_broken_run() {
        let cal = calendar();
        let entries = vec![
            entry_at(days_ago(0), Target::User, "Toast"),
            entry_at(days_ago(1), Target::User, "Toast"),
            entry_at(days_ago(3), Target::User, "Toast"),
        ];
        let stats = StatsAggregator::new(&cal).compute(&entries, now());
        assert_eq!(stats.longest_streak, 2);
        assert_eq!(stats.current_streak, 2);
    }

    #[test]
    fn streak_stale_when_nothing_today() {
        let cal = calendar();
        let entries = vec![
            entry_at(days_ago(1), Target::User, "Toast"),
            entry_at(days_ago(2), Target::User, "Toast"),
        ];
        let stats = StatsAggregator::new(&cal).compute(&entries, now());
        assert_eq!(stats.current_streak, 0);
        assert_eq!(stats.longest_streak, 2);
    }

    #[test]
    fn streak_counts_days_not_entries() {
        let cal = calendar();
        let entries = vec![
            entry_at(days_ago(0), Target::User, "Toast"),
            entry_at(days_ago(0), Target::User, "Jam"),
            entry_at(days_ago(0), Target::Companion, "Carrot"),
        ];
        let stats = StatsAggregator::new(&cal).compute(&entries, now());
        assert_eq!(stats.current_streak, 1);
        assert_eq!(stats.longest_streak, 1);
    }

    #[test]
    fn longest_streak_finds_older_run() {
        let days: Vec<NaiveDate> = [20, 12, 11, 10, 9, 3, 2]
            .into_iter()
            .map(|d| NaiveDate::from_ymd_opt(2024, 5, d).unwrap())
            .collect();
        assert_eq!(longest_streak(&days), 4);
        assert_eq!(
            current_streak(&days, NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()),
            1
        );
        assert_eq!(longest_streak(&[]), 0);
        assert_eq!(
            current_streak(&[], NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()),
            0
        );
    }

    #[test]
    fn streak_crosses_month_boundary() {
        let days = vec![
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 28).unwrap(),
        ];
        assert_eq!(longest_streak(&days), 3);
        assert_eq!(current_streak(&days, days[0]), 3);
    }

    #[test]
    fn average_weights_each_day_equally() {
        let cal = calendar();
        let entries = vec![
            // Day A: 3 entries, 1 for the companion -> 33%
            entry_at(days_ago(1), Target::Companion, "Carrot"),
            entry_at(days_ago(1), Target::User, "Toast"),
            entry_at(days_ago(1), Target::User, "Eggs"),
            // Day B: 1 entry for the companion -> 100%
            entry_at(days_ago(0), Target::Companion, "Apple"),
        ];
        let aggregator = StatsAggregator::new(&cal);
        assert_eq!(aggregator.average_companion_percentage_per_day(&entries), 67);
    }

    #[test]
    fn average_rounds_to_whole_percent() {
        let cal = calendar();
        let entries = vec![
            entry_at(days_ago(0), Target::Companion, "Carrot"),
            entry_at(days_ago(0), Target::User, "Toast"),
            entry_at(days_ago(0), Target::User, "Eggs"),
        ];
        assert_eq!(
            StatsAggregator::new(&cal).average_companion_percentage_per_day(&entries),
            33
        );
    }

    #[test]
    fn day_buckets_follow_calendar_timezone() {
        // 23:30 UTC on the 14th is already the 15th in UTC+2
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let cal = Calendar::new(
            plus_two,
            "mon 00:00".parse().unwrap(),
            "sun 18:00".parse().unwrap(),
        );
        let late = Utc.with_ymd_and_hms(2024, 5, 14, 23, 30, 0).unwrap();
        let entries = vec![entry_at(late, Target::User, "Toast")];
        let stats = StatsAggregator::new(&cal).compute(&entries, now());
        assert_eq!(stats.current_streak, 1);
    }

    #[test]
    fn today_entries_newest_first() {
        let cal = calendar();
        let morning = entry_at(now() - Duration::hours(12), Target::User, "Oats");
        let evening = entry_at(now() - Duration::hours(1), Target::Companion, "Carrot");
        let yesterday = entry_at(days_ago(1), Target::User, "Soup");
        let entries = vec![morning.clone(), yesterday, evening.clone()];
        let today = StatsAggregator::new(&cal).today_entries(&entries, now());
        assert_eq!(today, vec![evening, morning]);
    }

    #[test]
    fn weekly_digest_covers_anchored_window() {
        let cal = calendar();
        // 2024-05-15 is a Wednesday; the week runs Mon 13th 00:00 to Mon 20th 00:00
        let monday = Utc.with_ymd_and_hms(2024, 5, 13, 0, 0, 0).unwrap();
        let entries = vec![
            entry_at(monday, Target::User, "Toast"),
            entry_at(monday + Duration::hours(5), Target::Companion, "carrot"),
            entry_at(monday + Duration::days(2), Target::Companion, "Carrot"),
            entry_at(monday + Duration::days(2), Target::User, "Soup"),
            entry_at(monday - Duration::minutes(1), Target::User, "Late snack"),
            entry_at(monday + Duration::days(7), Target::User, "Next week"),
        ];
        let digest = StatsAggregator::new(&cal).weekly_digest(&entries, now(), now());

        assert_eq!(digest.week_start, monday);
        assert_eq!(digest.week_end, monday + Duration::days(7));
        assert_eq!(digest.total_entries, 4);
        assert_eq!(digest.total_for_self, 2);
        assert_eq!(digest.total_for_companion, 2);
        assert_eq!(digest.active_days, 2);
        // Monday 50%, Wednesday 50%
        assert_eq!(digest.companion_percentage, 50);
        assert_eq!(
            digest.top_names[0],
            NameCount {
                name: "carrot".to_string(),
                count: 2
            }
        );
        assert_eq!(digest.top_names.len(), 3);
        assert_eq!(digest.top_names[1].name, "Soup");
        assert_eq!(
            digest.unlocks_at,
            Utc.with_ymd_and_hms(2024, 5, 19, 18, 0, 0).unwrap()
        );
        assert!(!digest.available);
    }

    #[test]
    fn weekly_digest_available_after_unlock() {
        let cal = calendar();
        let reference = Utc.with_ymd_and_hms(2024, 5, 15, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 5, 19, 18, 30, 0).unwrap();
        let digest = StatsAggregator::new(&cal).weekly_digest(&[], reference, later);
        assert!(digest.available);
        assert_eq!(digest.total_entries, 0);
        assert_eq!(digest.companion_percentage, 0);
        assert!(digest.top_names.is_empty());
    }
}
