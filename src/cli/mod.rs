pub mod args;
pub mod jobs;
pub mod record;

pub use args::{Cli, CliCommand};
pub use jobs::handle_jobs_command;
pub use record::handle_record_command;
