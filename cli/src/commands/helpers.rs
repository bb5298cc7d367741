use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use nibble_core::models::Entry;

/// Parse an instant. Accepts RFC 3339, `YYYY-MM-DD` (local noon), and the
/// keywords today/yesterday/now. `None` means now.
pub(crate) fn parse_instant(s: Option<&str>) -> Result<DateTime<Utc>> {
    let Some(s) = s else {
        return Ok(Utc::now());
    };
    let today = Local::now().date_naive();
    let date = match s {
        "now" => return Ok(Utc::now()),
        "today" => today,
        "yesterday" => today - chrono::Duration::days(1),
        _ => {
            if let Ok(instant) = DateTime::parse_from_rfc3339(s) {
                return Ok(instant.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD, an RFC 3339 timestamp, or today/yesterday")
            })?
        }
    };
    local_noon(date)
}

/// Noon sidesteps DST transitions, which never happen at midday.
fn local_noon(date: NaiveDate) -> Result<DateTime<Utc>> {
    let noon = date.and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN));
    Local
        .from_local_datetime(&noon)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("{date} has no local noon"))
}

pub(crate) fn print_entry_table(entries: &[Entry]) {
    #[derive(Tabled)]
    struct EntryRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "When")]
        when: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "For")]
        target: String,
        #[tabled(rename = "Origin")]
        origin: String,
    }

    let rows: Vec<EntryRow> = entries
        .iter()
        .map(|e| EntryRow {
            id: e.id.to_string(),
            when: e
                .timestamp
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string(),
            name: truncate(&e.name, 35),
            target: e.target.to_string(),
            origin: e.origin.to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..2)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
