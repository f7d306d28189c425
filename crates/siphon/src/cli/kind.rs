//! `siphon kind`: operator toggles.

use crate::cli::context::Context;
use crate::cli::output::{print_json, print_table_colored};
use anyhow::Result;
use comfy_table::Color;
use serde::Serialize;
use siphon_sync::{clear_kind_override, keys, set_kind_enabled};

#[derive(Debug, Serialize)]
struct KindRow {
    kind: String,
    enabled: bool,
    /// Where the flag comes from: override, config or default
    source: &'static str,
    /// Flag the last sync acted on, if any
    applied: Option<bool>,
    ledger_rows: u64,
    pending_jobs: u64,
}

pub async fn run_list(ctx: &Context, json: bool) -> Result<()> {
    let engine = ctx.engine();
    let stats = ctx.db.queue_stats().await?;

    let mut rows = Vec::new();
    for kind in engine.known_kinds().await? {
        let overridden = ctx.db.kind_override(&kind).await?;
        let source = match (overridden, ctx.config.sync.kinds.contains_key(&kind)) {
            (Some(_), _) => "override",
            (None, true) => "config",
            (None, false) => "default",
        };
        let applied = ctx
            .db
            .get_state(&keys::kind_enabled(&kind))
            .await?
            .map(|flag| flag.trim() == "1");
        let pending_jobs = stats
            .by_kind
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, counts)| counts.pending)
            .unwrap_or(0);

        rows.push(KindRow {
            enabled: engine.is_kind_enabled(&kind).await?,
            source,
            applied,
            ledger_rows: ctx.db.count_seen(Some(&kind)).await?,
            pending_jobs,
            kind,
        });
    }

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No kinds known. Configure [sync.kinds] or pass --manifest.");
        return Ok(());
    }

    let table = rows
        .into_iter()
        .map(|row| {
            let (flag, color) = if row.enabled {
                ("enabled", Color::Green)
            } else {
                ("disabled", Color::DarkGrey)
            };
            let applied = match row.applied {
                Some(a) if a == row.enabled => "yes".to_string(),
                Some(_) => "pending".to_string(),
                None => "-".to_string(),
            };
            vec![
                (row.kind, None),
                (flag.to_string(), Some(color)),
                (row.source.to_string(), None),
                (applied, None),
                (row.ledger_rows.to_string(), None),
                (row.pending_jobs.to_string(), None),
            ]
        })
        .collect();
    print_table_colored(&["KIND", "STATE", "SOURCE", "APPLIED", "LEDGER", "PENDING"], table);
    Ok(())
}

pub async fn run_set(ctx: &Context, kind: &str, enabled: bool) -> Result<()> {
    let kind = kind.trim();
    anyhow::ensure!(!kind.is_empty(), "kind must not be empty");

    set_kind_enabled(&ctx.db, kind, enabled).await?;
    let verb = if enabled { "enabled" } else { "disabled" };
    println!("Kind '{}' {}. The next sync applies it.", kind, verb);
    Ok(())
}

pub async fn run_clear(ctx: &Context, kind: &str) -> Result<()> {
    if clear_kind_override(&ctx.db, kind.trim()).await? {
        println!("Override for '{}' removed; the configured default applies.", kind.trim());
    } else {
        println!("Kind '{}' has no override.", kind.trim());
    }
    Ok(())
}
