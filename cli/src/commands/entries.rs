use anyhow::{Result, bail};
use std::process;
use uuid::Uuid;

use nibble_core::models::{
    Device, EntryFilter, InsertOutcome, NewEntry, Origin, SortOrder, Target,
};
use nibble_core::service::Ledger;

use super::helpers::{json_error, parse_instant, print_entry_table};

pub(crate) struct LogArgs {
    pub name: String,
    pub companion: bool,
    pub origin: Option<Origin>,
    pub id: Option<Uuid>,
    pub at: Option<String>,
}

pub(crate) fn cmd_log(ledger: &Ledger, device: Device, args: LogArgs, json: bool) -> Result<()> {
    let origin = args.origin.unwrap_or_else(|| device.app_origin());
    if origin.is_peer_received() {
        bail!("Origin '{origin}' is reserved for entries received from the paired device");
    }
    if origin.device() != device {
        bail!("Origin '{origin}' does not belong to this {device}");
    }

    let created = ledger.create(NewEntry {
        id: args.id,
        name: args.name,
        timestamp: parse_instant(args.at.as_deref())?,
        target: if args.companion {
            Target::Companion
        } else {
            Target::User
        },
        origin,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&created)?);
        return Ok(());
    }
    let entry = &created.entry;
    match created.outcome {
        InsertOutcome::Created => println!(
            "Logged {} for {} ({})",
            entry.name, entry.target, entry.id
        ),
        InsertOutcome::AlreadyExisted => {
            println!("Entry {} already exists; nothing changed", entry.id);
        }
    }
    Ok(())
}

pub(crate) fn cmd_list(
    ledger: &Ledger,
    today: bool,
    target: Option<Target>,
    json: bool,
) -> Result<()> {
    let mut entries = if today {
        ledger.today(chrono::Utc::now())?
    } else {
        ledger.entries(&EntryFilter::default(), SortOrder::NewestFirst)?
    };
    if let Some(target) = target {
        entries.retain(|e| e.target == target);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No entries.");
    } else {
        print_entry_table(&entries);
    }
    Ok(())
}

pub(crate) fn cmd_delete(ledger: &Ledger, id: Option<Uuid>, all: bool, json: bool) -> Result<()> {
    match (id, all) {
        (None, true) => {
            let removed = ledger.delete_all()?;
            if json {
                println!("{}", serde_json::json!({ "deleted": removed }));
            } else {
                println!("Deleted {removed} entries");
            }
            Ok(())
        }
        (Some(id), false) => {
            if ledger.delete(id)? {
                if json {
                    println!("{}", serde_json::json!({ "deleted": id }));
                } else {
                    println!("Deleted entry {id}");
                }
                Ok(())
            } else {
                if json {
                    println!("{}", json_error(&format!("Entry {id} not found")));
                } else {
                    eprintln!("Entry {id} not found");
                }
                process::exit(2);
            }
        }
        _ => bail!("Provide either an entry ID or --all"),
    }
}
