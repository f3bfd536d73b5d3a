use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cli::args::RecordCliArgs;
use crate::config::Config;
use crate::db::SqliteJobStore;
use crate::drivers::{FfmpegCapture, PlaywrightDriver};
use crate::engine::{JobState, MeetingAddress, Orchestrator};

pub async fn handle_record_command(args: RecordCliArgs) -> Result<()> {
    let config = Config::load()?;
    let engine_config = config.engine_config()?;

    let store = Arc::new(SqliteJobStore::open()?);
    let browser = Arc::new(PlaywrightDriver::new(
        config.browser.runner_command.clone(),
        config.browser.runner_args.clone(),
        config.browser.display_name.clone(),
    ));
    let capture = match &config.capture.ffmpeg_path {
        Some(path) => Arc::new(FfmpegCapture::with_binary(
            path.into(),
            config.capture_settings(),
        )),
        None => Arc::new(FfmpegCapture::new(config.capture_settings()).context(
            "ffmpeg not found on PATH; set capture.ffmpeg_path in the config",
        )?),
    };

    let orchestrator = Orchestrator::new(engine_config, store, browser, capture)?;

    let address = MeetingAddress::new(args.url)
        .with_password(args.password)
        .with_display_name(args.display_name);
    let id = orchestrator.submit(address).await?;
    println!("Job {} submitted", id);

    let mut last_state: Option<JobState> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                orchestrator.cancel(id).await?;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        let view = orchestrator.status(id).await?;
        if last_state != Some(view.state) {
            info!("job {} is {}", id, view.state);
            println!("  {}", view.state);
            last_state = Some(view.state);
        }

        if view.state.is_terminal() {
            match view.state {
                JobState::Completed => {
                    if let Some(path) = &view.output_path {
                        println!("Recording saved to {}", path.display());
                    }
                    if view.degraded {
                        println!("Warning: capture was force-stopped; the file may be truncated");
                    }
                    if let Some(secs) = view.duration_seconds() {
                        println!("Recorded {}s", secs);
                    }
                }
                JobState::Failed => {
                    let reason = view
                        .failure_reason
                        .unwrap_or_else(|| "unknown".to_string());
                    anyhow::bail!("recording failed: {}", reason);
                }
                JobState::Cancelled => {
                    println!("Recording cancelled");
                }
                _ => {}
            }
            return Ok(());
        }
    }
}
