//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--verbose`) and one of the
//! [`Command`] subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// datafactory: staged dataset pipeline worker.
#[derive(Debug, Parser)]
#[command(name = "datafactory", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file. Defaults to `datafactory.toml` in the working directory.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging and per-event progress lines.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the built-in five-stage pipeline on synthetic sources.
    Demo {
        /// Number of source items to ingest.
        #[arg(long, default_value_t = 12)]
        items: usize,

        /// Make every k-th source fail permanently.
        #[arg(long)]
        fail_every: Option<u64>,

        /// Directory the export stage writes the dataset to.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Summarises the ledger of a job, stage by stage.
    Ledger {
        /// Job id (UUID).
        #[arg(long)]
        job: String,

        /// Limit the report to one stage and list its failed items.
        #[arg(long)]
        stage: Option<String>,
    },

    /// Prints the effective configuration.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_demo_defaults() {
        let cli = Cli::parse_from(["datafactory", "demo"]);
        match cli.command {
            Command::Demo {
                items,
                fail_every,
                out,
            } => {
                assert_eq!(items, 12);
                assert!(fail_every.is_none());
                assert!(out.is_none());
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "datafactory",
            "--config",
            "custom.toml",
            "--verbose",
            "demo",
            "--items",
            "40",
            "--fail-every",
            "5",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(
            cli.command,
            Command::Demo { items: 40, fail_every: Some(5), .. }
        ));
    }

    #[test]
    fn cli_parses_ledger_subcommand() {
        let cli = Cli::parse_from([
            "datafactory",
            "ledger",
            "--job",
            "6f1c1f3e-7a53-4bb4-9a57-3f0d7cdd2a10",
            "--stage",
            "ingest",
        ]);
        match cli.command {
            Command::Ledger { job, stage } => {
                assert_eq!(job, "6f1c1f3e-7a53-4bb4-9a57-3f0d7cdd2a10");
                assert_eq!(stage.as_deref(), Some("ingest"));
            }
            _ => panic!("expected Ledger command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
