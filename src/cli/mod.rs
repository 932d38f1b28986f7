pub mod projects;
pub mod track;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use projects::{process_project_command, ProjectCommand};
use track::{process_track_command, TrackCommand};
use tracing::level_filters::LevelFilter;

use crate::utils::{
    dir::{create_application_default_path, ensure_dir},
    logging::enable_logging,
};

#[derive(Parser, Debug)]
#[command(name = "trackwhat", version, long_about = None)]
#[command(about = "Tracks time spent on your projects by classifying screenshots")]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default $XDG_STATE_HOME/trackwhat or $HOME/.local/state/trackwhat"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Print logs to the console")]
    log: bool,
    #[arg(long = "log-filter", global = true, help = "Log level, overrides RUST_LOG")]
    log_filter: Option<LevelFilter>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Run a tracking session in the foreground. Type scan, lock <id>, unlock, interval <secs> or stop to control it"
    )]
    Track {
        #[command(flatten)]
        command: TrackCommand,
    },
    #[command(flatten)]
    Projects(ProjectCommand),
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = match args.dir {
        Some(dir) => ensure_dir(dir)?,
        None => create_application_default_path()?,
    };

    let logging_level = args
        .log_filter
        .or_else(|| args.log.then_some(LevelFilter::DEBUG));
    enable_logging(&dir, logging_level, args.log)?;

    match args.commands {
        Commands::Track { command } => process_track_command(&dir, command).await,
        Commands::Projects(command) => process_project_command(&dir, command).await,
    }
}
