use anyhow::Result;
use clap::Parser;
use meetrec::cli::{handle_jobs_command, handle_record_command, Cli, CliCommand};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        CliCommand::Record(args) => handle_record_command(args).await,
        CliCommand::Jobs(args) => handle_jobs_command(args).await,
        CliCommand::Version => {
            println!("meetrec {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
