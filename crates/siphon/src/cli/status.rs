//! `siphon status`: queue counts, last run, provider cursors.

use crate::cli::context::Context;
use crate::cli::output::{print_json, print_table};
use anyhow::Result;
use serde::Serialize;
use siphon_db::{QueueStats, StateCounts};
use siphon_sync::keys;
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
struct StatusOutput {
    last_run_at: Option<String>,
    ledger_rows: u64,
    queue: QueueStats,
    cursors: BTreeMap<String, String>,
}

fn counts_row(label: &str, counts: &StateCounts) -> Vec<String> {
    vec![
        label.to_string(),
        counts.pending.to_string(),
        counts.running.to_string(),
        counts.done.to_string(),
        counts.error.to_string(),
        counts.superseded.to_string(),
        counts.total().to_string(),
    ]
}

pub async fn run(ctx: &Context, json: bool) -> Result<()> {
    let status = StatusOutput {
        last_run_at: ctx.db.get_state(keys::LAST_RUN_AT).await?,
        ledger_rows: ctx.db.count_seen(None).await?,
        queue: ctx.db.queue_stats().await?,
        cursors: ctx
            .db
            .list_state(keys::PROVIDER_CURSOR_PREFIX)
            .await?
            .into_iter()
            .map(|(key, value)| {
                let name = key
                    .strip_prefix(keys::PROVIDER_CURSOR_PREFIX)
                    .and_then(|rest| rest.strip_suffix(".cursor"))
                    .unwrap_or(&key)
                    .to_string();
                (name, value)
            })
            .collect(),
    };

    if json {
        return print_json(&status);
    }

    println!(
        "Last run: {}",
        status.last_run_at.as_deref().unwrap_or("never")
    );
    println!("Ledger rows: {}", status.ledger_rows);
    println!();

    let mut rows: Vec<Vec<String>> = status
        .queue
        .by_kind
        .iter()
        .map(|(kind, counts)| counts_row(kind, counts))
        .collect();
    rows.push(counts_row("TOTAL", &status.queue.counts));
    print_table(
        &["KIND", "PENDING", "RUNNING", "DONE", "ERROR", "SUPERSEDED", "TOTAL"],
        rows,
    );

    if !status.cursors.is_empty() {
        println!();
        print_table(
            &["PROVIDER", "CURSOR"],
            status
                .cursors
                .into_iter()
                .map(|(name, cursor)| vec![name, cursor])
                .collect(),
        );
    }
    Ok(())
}
