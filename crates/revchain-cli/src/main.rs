//! revchain Command-Line Client
//!
//! Plans, applies and inspects schema revisions against an embedded database.

mod commands;
mod formatter;

use clap::{Parser, Subcommand};
use formatter::OutputFormat;
use revchain_core::migration::Target;
use revchain_core::revision::Direction;
use revchain_core::ProjectConfig;
use std::path::PathBuf;

/// revchain Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "revchain")]
#[command(version, about = "Staged, reversible schema migrations")]
pub struct Args {
    /// Project configuration file
    #[arg(short, long, default_value = revchain_core::CONFIG_FILE)]
    pub config: PathBuf,

    /// Database path (overrides the project file)
    #[arg(short, long)]
    pub data_path: Option<PathBuf>,

    /// Revisions directory (overrides the project file)
    #[arg(short, long)]
    pub revisions: Option<PathBuf>,

    /// Run destructive upgrade sets
    #[arg(long)]
    pub allow_destructive: bool,

    /// Fail instead of warning on one-way downgrades
    #[arg(long)]
    pub strict_irreversible: bool,

    /// Resolve and validate without executing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip checksum verification of applied revisions
    #[arg(long)]
    pub no_verify: bool,

    /// Rows per batch for row copies
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Output format
    #[arg(long, default_value = "table", value_enum)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upgrade to a target (head, heads or a revision id)
    Upgrade {
        #[arg(default_value = "head")]
        target: Target,
    },
    /// Downgrade to a target (base or a revision id)
    Downgrade { target: Target },
    /// Show the revisions a run would apply
    Plan {
        /// up or down
        direction: Direction,
        #[arg(default_value = "head")]
        target: Target,
        /// Render PostgreSQL statements instead of a summary
        #[arg(long)]
        sql: bool,
    },
    /// Show current pointers, pending revisions and lock state
    Status,
    /// Show applied and reverted revisions
    History,
    /// List head revisions
    Heads,
    /// Validate the revision graph
    Check,
    /// Scaffold a revision parented on the current heads
    New {
        /// Short description, used in the file name
        message: String,
    },
    /// Resume an interrupted run and report dangling references
    Repair,
    /// Force-release the migration lock
    Unlock,
}

impl Args {
    /// Merge command-line flags over the project file.
    pub fn into_config(&self) -> Result<ProjectConfig, revchain_core::ConfigError> {
        let mut config = ProjectConfig::load_or_default(&self.config)?;
        if let Some(path) = &self.data_path {
            config.data_path = path.clone();
        }
        if let Some(dir) = &self.revisions {
            config.revisions_dir = dir.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.migration.batch_size = batch_size;
        }
        if self.allow_destructive {
            config.migration.allow_destructive = true;
        }
        if self.strict_irreversible {
            config.migration.strict_irreversible = true;
        }
        if self.dry_run {
            config.migration.dry_run = true;
        }
        if self.no_verify {
            config.migration.verify_checksums = false;
        }
        Ok(config)
    }
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("revchain=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config()?;
    let formatter = formatter::create_formatter(args.format);
    let output = commands::execute(&config, args.command, &*formatter)?;
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "revchain",
            "--config",
            "/nonexistent/revchain.toml",
            "--batch-size",
            "50",
            "--allow-destructive",
            "upgrade",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.migration.batch_size, 50);
        assert!(config.migration.allow_destructive);
        assert!(matches!(args.command, Command::Upgrade { target: Target::Head }));
    }

    #[test]
    fn test_plan_arguments() {
        let args = Args::parse_from(["revchain", "plan", "down", "base", "--sql"]);
        match args.command {
            Command::Plan { direction, target, sql } => {
                assert_eq!(direction, Direction::Down);
                assert_eq!(target, Target::Base);
                assert!(sql);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
