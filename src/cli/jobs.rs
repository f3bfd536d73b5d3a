use anyhow::{bail, Result};

use crate::cli::args::JobsCliArgs;
use crate::db::{JobFilter, JobStore, SqliteJobStore};
use crate::engine::JobState;

pub async fn handle_jobs_command(args: JobsCliArgs) -> Result<()> {
    let state = match &args.state {
        Some(s) => match JobState::parse(s) {
            Some(state) => Some(state),
            None => bail!("unknown state '{}'", s),
        },
        None => None,
    };
    let filter = JobFilter {
        search: args.query,
        state,
        limit: args.limit,
    };

    let store = SqliteJobStore::open()?;
    let jobs = store.list(&filter)?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!("Found {} job(s):", jobs.len());
    println!();
    for job in &jobs {
        let view = job.view();
        println!("{}  [{}]", view.id, view.state);
        println!("  url: {}", view.url);
        println!("  requested: {}", view.requested_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(secs) = view.duration_seconds() {
            println!("  duration: {}s", secs);
        }
        if let Some(path) = &view.output_path {
            println!("  output: {}", path.display());
        }
        if let Some(reason) = &view.failure_reason {
            println!("  failure: {}", reason);
        }
        if view.degraded {
            println!("  degraded: capture was force-stopped");
        }
        println!();
    }

    Ok(())
}
