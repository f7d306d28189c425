//! `siphon jobs`: list the job table.

use crate::cli::context::Context;
use crate::cli::output::{format_timestamp, print_json, print_table_colored, state_color, truncate_display};
use anyhow::Result;
use siphon_db::{JobFilter, JobState};

#[derive(Debug)]
pub struct JobsArgs {
    pub state: Option<JobState>,
    pub kind: Option<String>,
    pub limit: i64,
    pub json: bool,
}

pub async fn run(ctx: &Context, args: JobsArgs) -> Result<()> {
    let filter = JobFilter {
        state: args.state,
        kind: args.kind,
        limit: Some(args.limit.max(1)),
    };
    let jobs = ctx.db.list_jobs(&filter).await?;

    if args.json {
        return print_json(&jobs);
    }
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    let rows = jobs
        .iter()
        .map(|job| {
            vec![
                (job.job_id.to_string(), None),
                (job.source_kind.clone(), None),
                (job.job_type.to_string(), None),
                (job.state.to_string(), Some(state_color(job.state))),
                (job.source_version.clone(), None),
                (job.attempts.to_string(), None),
                (format_timestamp(job.locked_until), None),
                (
                    truncate_display(job.error_message.as_deref().unwrap_or("-"), 40),
                    None,
                ),
            ]
        })
        .collect();
    print_table_colored(
        &["ID", "KIND", "TYPE", "STATE", "VERSION", "ATTEMPTS", "LEASED UNTIL", "ERROR"],
        rows,
    );
    Ok(())
}
