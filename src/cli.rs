use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clusterforge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply idempotent cluster installs", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Cluster file (default: $CLUSTERFORGE_CONFIG or ./cluster.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the operations apply would run, in dependency order
    Plan(PlanArgs),

    /// Bring every host to the state the cluster file describes
    Apply(ApplyArgs),

    /// List downloadable components known to the registry
    Components,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply
// ============================================================================

#[derive(Parser)]
pub struct PlanArgs {
    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct ApplyArgs {
    /// Only run prechecks and report what would change
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Number of operations run concurrently
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}
