//! `siphon sync`: one engine run.

use crate::cli::context::Context;
use crate::cli::output::print_json;
use anyhow::Result;
use tracing::warn;

pub async fn run(ctx: &Context, force: bool, json: bool) -> Result<()> {
    if !ctx.has_manifest() {
        warn!("No manifest configured; only kind transitions will run");
    }

    let report = ctx.engine().run(force).await?;
    if json {
        print_json(&report)?;
    } else {
        println!("{}", report);
    }
    Ok(())
}
