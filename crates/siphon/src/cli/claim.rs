//! Claim-side commands: `claim`, `drain`, `ack`, `fail`.

use crate::cli::context::Context;
use crate::cli::error::HelpfulError;
use crate::cli::sink::JsonlSink;
use anyhow::{Context as _, Result};
use siphon_ids::JobId;
use std::path::PathBuf;

fn limit_or_default(ctx: &Context, limit: Option<i64>) -> i64 {
    limit.filter(|n| *n > 0).unwrap_or(ctx.config.claim.claim_limit)
}

/// Lease jobs and print their items; the jobs stay running until acked.
pub async fn run_claim(ctx: &Context, limit: Option<i64>) -> Result<()> {
    let claimer = ctx.claimer()?;
    let items = claimer.extract(limit_or_default(ctx, limit)).await?;
    for item in &items {
        println!("{}", serde_json::to_string(item)?);
    }
    eprintln!("claimed {} job(s)", items.len());
    Ok(())
}

pub async fn run_drain(ctx: &Context, limit: Option<i64>, out: Option<PathBuf>) -> Result<()> {
    let claimer = ctx.claimer()?;
    let sink = JsonlSink::open(out.as_deref())
        .await
        .context("Failed to open output for work items")?;

    let report = claimer.drain(&sink, limit_or_default(ctx, limit)).await?;
    if out.is_some() {
        println!("{}", report);
    } else {
        // stdout carries the items
        eprintln!("{}", report);
    }
    Ok(())
}

async fn ensure_job(ctx: &Context, job_id: JobId) -> Result<()> {
    if ctx.db.get_job(job_id).await?.is_none() {
        return Err(HelpfulError::job_not_found(job_id).into());
    }
    Ok(())
}

pub async fn run_ack(ctx: &Context, job_id: JobId) -> Result<()> {
    ensure_job(ctx, job_id).await?;
    if ctx.bare_claimer().ack(job_id).await? {
        println!("Job {} done", job_id);
    } else {
        println!("Job {} was already finished; ack ignored", job_id);
    }
    Ok(())
}

pub async fn run_fail(ctx: &Context, job_id: JobId, message: &str, retryable: bool) -> Result<()> {
    ensure_job(ctx, job_id).await?;
    match ctx.bare_claimer().fail(job_id, message, retryable).await? {
        Some(state) => println!("Job {} -> {}", job_id, state),
        None => println!("Job {} is not running; failure ignored", job_id),
    }
    Ok(())
}
