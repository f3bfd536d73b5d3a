use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "meetrec")]
#[command(about = "Unattended meeting recorder", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Join a meeting and record it until it ends
    Record(RecordCliArgs),
    /// Search and inspect recording jobs
    Jobs(JobsCliArgs),
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct RecordCliArgs {
    /// Meeting URL or join link
    pub url: String,
    /// Name shown to other participants
    #[arg(short = 'n', long)]
    pub display_name: Option<String>,
    /// Meeting password, if the join link does not embed one
    #[arg(short, long)]
    pub password: Option<String>,
}

#[derive(ClapArgs, Debug)]
pub struct JobsCliArgs {
    /// Filter by meeting URL substring
    #[arg(short, long)]
    pub query: Option<String>,
    /// Filter by state (queued, joining, recording, stopping, completed,
    /// failed, cancelled)
    #[arg(short, long)]
    pub state: Option<String>,
    /// Maximum number of results to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}
