//! CLI command definitions using clap.
//!
//! The binary is the external trigger surface for the pipeline engine:
//! - run: execute one stage for a run date
//! - audit: read-only reconciliation of a run date
//! - status: ledger summary for a run date
//! - ack: complete a pending paid delivery
//! - cancel: cancel an in-flight stage
//! - paid: manage the paid-report queue

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Millrun - pipeline state & consistency engine
#[derive(Parser, Debug)]
#[command(name = "millrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one pipeline stage for a run date
    Run {
        /// Stage name: ingest, select, generate, or audit
        stage: String,

        /// Run date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Re-run even if the stage already succeeded
        #[arg(short, long)]
        force: bool,

        /// Theme override for ingest
        #[arg(long)]
        theme: Option<String>,

        /// Topic override for generate
        #[arg(long)]
        topic: Option<String>,

        /// Analysis mode for select: lite or full
        #[arg(short, long)]
        mode: Option<String>,

        /// Produce the paid report variant (held for human review)
        #[arg(long)]
        paid: bool,
    },

    /// Reconcile a run date and print the findings
    Audit {
        /// Run date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// Show ledger state for a run date
    Status {
        /// Run date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// Acknowledge a pending paid delivery
    Ack {
        /// Run date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Acknowledgment reference (e.g. a review sign-off id)
        #[arg(short, long)]
        reference: String,
    },

    /// Cancel an in-flight stage
    Cancel {
        /// Stage name: ingest, select, generate, or audit
        stage: String,

        /// Run date (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },

    /// Paid-report queue management
    Paid {
        #[command(subcommand)]
        command: PaidCommands,
    },
}

/// Paid-queue subcommands
#[derive(Subcommand, Debug)]
pub enum PaidCommands {
    /// Queue a topic for the next paid generate
    Enqueue {
        /// Report topic
        topic: String,

        /// Queue priority
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_run_command_minimal() {
        let cli = Cli::try_parse_from(["millrun", "run", "ingest"]).unwrap();
        match cli.command {
            Commands::Run {
                stage,
                date,
                force,
                paid,
                ..
            } => {
                assert_eq!(stage, "ingest");
                assert!(date.is_none());
                assert!(!force);
                assert!(!paid);
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "millrun", "run", "generate", "--date", "2026-08-07", "--force", "--topic", "AI agents", "--paid",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                stage,
                date,
                force,
                topic,
                paid,
                ..
            } => {
                assert_eq!(stage, "generate");
                assert_eq!(date, Some("2026-08-07".parse().unwrap()));
                assert!(force);
                assert_eq!(topic, Some("AI agents".to_string()));
                assert!(paid);
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_run_command_mode() {
        let cli = Cli::try_parse_from(["millrun", "run", "select", "-m", "full"]).unwrap();
        match cli.command {
            Commands::Run { mode, .. } => assert_eq!(mode, Some("full".to_string())),
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_run_rejects_bad_date() {
        let result = Cli::try_parse_from(["millrun", "run", "ingest", "--date", "not-a-date"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_audit_command() {
        let cli = Cli::try_parse_from(["millrun", "audit", "-d", "2026-08-07"]).unwrap();
        match cli.command {
            Commands::Audit { date } => assert_eq!(date, Some("2026-08-07".parse().unwrap())),
            _ => panic!("Expected audit command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["millrun", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { date: None }));
    }

    #[test]
    fn test_ack_command() {
        let cli = Cli::try_parse_from(["millrun", "ack", "-d", "2026-08-07", "-r", "review-42"]).unwrap();
        match cli.command {
            Commands::Ack { date, reference } => {
                assert_eq!(date, Some("2026-08-07".parse().unwrap()));
                assert_eq!(reference, "review-42");
            }
            _ => panic!("Expected ack command"),
        }
    }

    #[test]
    fn test_cancel_command() {
        let cli = Cli::try_parse_from(["millrun", "cancel", "generate"]).unwrap();
        match cli.command {
            Commands::Cancel { stage, date } => {
                assert_eq!(stage, "generate");
                assert!(date.is_none());
            }
            _ => panic!("Expected cancel command"),
        }
    }

    #[test]
    fn test_paid_enqueue_command() {
        let cli = Cli::try_parse_from(["millrun", "paid", "enqueue", "AI in logistics", "-p", "high"]).unwrap();
        match cli.command {
            Commands::Paid {
                command: PaidCommands::Enqueue { topic, priority },
            } => {
                assert_eq!(topic, "AI in logistics");
                assert_eq!(priority, "high");
            }
            _ => panic!("Expected paid enqueue command"),
        }
    }

    #[test]
    fn test_verbose_and_config_flags() {
        let cli = Cli::try_parse_from(["millrun", "-v", "-c", "/etc/millrun.yml", "status"]).unwrap();
        assert!(cli.is_verbose());
        assert_eq!(cli.config, Some(PathBuf::from("/etc/millrun.yml")));
    }

    #[test]
    fn test_help_works() {
        // Verify the command definition is internally consistent
        Cli::command().debug_assert();
    }
}
