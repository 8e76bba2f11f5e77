use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::model::TaskStatus;

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "boardsync",
    version,
    about = "Task/board sync client for a remote data service"
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    #[arg(
        long = "set",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub overrides: Vec<KeyVal>,

    /// Run against an in-process store instead of the remote service.
    #[arg(long)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(subcommand)]
    Tasks(TaskCommand),
    #[command(subcommand)]
    Board(BoardCommand),
    #[command(subcommand)]
    Plan(PlanCommand),
    /// Resolve and fetch an avatar from object storage.
    Avatar { path: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommand {
    List {
        #[arg(long)]
        board: Option<Uuid>,
    },
    Add {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        board: Option<Uuid>,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: Uuid,
    },
    Share {
        id: Uuid,
        user: Uuid,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum BoardCommand {
    /// Show (creating if needed) the default board.
    Default,
}

#[derive(Subcommand, Debug, Clone)]
pub enum PlanCommand {
    Status,
    /// Print a billing-portal URL.
    Portal {
        #[arg(long)]
        return_url: Option<String>,
    },
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_update_with_status() {
        let cli = GlobalCli::try_parse_from([
            "boardsync",
            "--set",
            "loader.max_retries=1",
            "tasks",
            "update",
            "6d5c5c44-7a43-4a41-9d0a-6b9f0d1c3a11",
            "--status",
            "inProgress",
        ])
        .expect("parse");

        assert_eq!(cli.overrides.len(), 1);
        assert_eq!(cli.overrides[0].key, "loader.max_retries");
        match cli.command {
            Command::Tasks(TaskCommand::Update { status, title, .. }) => {
                assert_eq!(status, Some(TaskStatus::InProgress));
                assert!(title.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn keyval_requires_equals() {
        assert!("remote.url".parse::<KeyVal>().is_err());
    }
}
