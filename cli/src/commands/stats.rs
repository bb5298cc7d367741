use anyhow::Result;
use chrono::{Local, Utc};
use tabled::{Table, Tabled, settings::Style};

use nibble_core::calendar::WeekAnchor;
use nibble_core::service::Ledger;

use super::helpers::{parse_instant, truncate};

pub(crate) fn cmd_stats(ledger: &Ledger, json: bool) -> Result<()> {
    let stats = ledger.stats(Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Entries:          {}", stats.total_entries);
    println!("  for self:       {}", stats.total_for_self);
    println!("  for companion:  {}", stats.total_for_companion);
    println!(
        "Companion share:  {}% per day",
        stats.average_companion_percentage_per_day
    );
    println!("Current streak:   {} days", stats.current_streak);
    println!("Longest streak:   {} days", stats.longest_streak);
    Ok(())
}

pub(crate) fn cmd_digest(ledger: &Ledger, at: Option<&str>, json: bool) -> Result<()> {
    let reference = parse_instant(at)?;
    let digest = ledger.weekly_digest(reference, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&digest)?);
        return Ok(());
    }

    let fmt = "%a %Y-%m-%d %H:%M";
    println!(
        "Week of {} to {}",
        digest.week_start.with_timezone(&Local).format(fmt),
        digest.week_end.with_timezone(&Local).format(fmt),
    );
    if !digest.available {
        println!(
            "Digest unlocks {}",
            digest.unlocks_at.with_timezone(&Local).format(fmt)
        );
        return Ok(());
    }
    println!(
        "{} entries on {} days ({} for self, {} for companion, {}% companion)",
        digest.total_entries,
        digest.active_days,
        digest.total_for_self,
        digest.total_for_companion,
        digest.companion_percentage,
    );

    if !digest.top_names.is_empty() {
        #[derive(Tabled)]
        struct NameRow {
            #[tabled(rename = "Name")]
            name: String,
            #[tabled(rename = "Count")]
            count: usize,
        }
        let rows: Vec<NameRow> = digest
            .top_names
            .iter()
            .map(|n| NameRow {
                name: truncate(&n.name, 35),
                count: n.count,
            })
            .collect();
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }
    Ok(())
}

/// Show the anchors, or persist new ones when either is given.
pub(crate) fn cmd_anchors(
    ledger: &Ledger,
    week_start: Option<WeekAnchor>,
    digest_unlock: Option<WeekAnchor>,
    json: bool,
) -> Result<()> {
    let calendar = ledger.calendar();
    let mut current = (calendar.week_start_anchor(), calendar.digest_unlock_anchor());
    if week_start.is_some() || digest_unlock.is_some() {
        current = (
            week_start.unwrap_or(current.0),
            digest_unlock.unwrap_or(current.1),
        );
        ledger.set_anchors(current.0, current.1)?;
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "week_start": current.0, "digest_unlock": current.1 })
        );
    } else {
        println!("Week starts:     {}", current.0);
        println!("Digest unlocks:  {}", current.1);
    }
    Ok(())
}
