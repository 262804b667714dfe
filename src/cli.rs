//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Mirror a cloud-drive folder tree onto local disk, resumably.
#[derive(Debug, Parser)]
#[command(name = "cloudpull", version, about)]
pub struct Cli {
    /// Path to the state database.
    #[arg(long, global = true, default_value = "cloudpull.db")]
    pub db: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (overrides RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a new sync session.
    Start {
        /// Remote folder ID to mirror ("root" for the drive root).
        root_id: String,
        /// Local destination directory.
        destination: PathBuf,
    },
    /// Resume an interrupted session.
    Resume {
        /// Session ID to resume.
        session_id: i64,
    },
    /// Show the status of a session (or all sessions).
    Status {
        /// Session ID; omit to list every session.
        session_id: Option<i64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses_start() {
        let cli = Cli::parse_from(["cloudpull", "start", "root", "/mnt/mirror"]);
        match cli.command {
            Command::Start {
                root_id,
                destination,
            } => {
                assert_eq!(root_id, "root");
                assert_eq!(destination, PathBuf::from("/mnt/mirror"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_resume_with_global_db() {
        let cli = Cli::parse_from(["cloudpull", "--db", "/tmp/x.db", "resume", "7"]);
        assert_eq!(cli.db, PathBuf::from("/tmp/x.db"));
        match cli.command {
            Command::Resume { session_id } => assert_eq!(session_id, 7),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_verify_structure() {
        Cli::command().debug_assert();
    }
}
