use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "cloudstash-daemon",
    version,
    about = "Scheduled backups of local folders to object storage"
)]
pub struct Args {
    /// Path to the config file (defaults to ~/.cloudstash/config.json)
    #[arg(short, long, global = true, env = "CLOUDSTASH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Run one backup of a stored job in the foreground
    Backup {
        /// Id of the job to back up
        job_id: String,

        /// Ask the transfer tool to only report what it would copy
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the next trigger time of every scheduled job
    Schedule,

    /// List stored jobs as JSON
    Jobs,
}
