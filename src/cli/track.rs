use std::{
    io::BufRead,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    capture::{command::CommandCapture, file::StaticImageCapture, CaptureSource},
    classify::{build_provider, ProviderKind},
    tracker::{
        commands::TrackerCommand,
        rate_limit::RateLimiter,
        scheduler::ScanScheduler,
        session::{Tracker, TrackerHandle},
        shutdown::detect_shutdown,
        storage::project_storage::{JsonProjectStorage, ProjectStorage},
    },
    utils::{clock::DefaultClock, config::Settings, time::format_total_time},
};

#[derive(Debug, clap::Args)]
pub struct TrackCommand {
    #[arg(long, short, help = "Base scan interval in seconds, between 5 and 86400")]
    interval: Option<u64>,
    #[arg(long, help = "Stop tracking after this many minutes")]
    auto_stop: Option<u64>,
    #[arg(long, help = "Classification back end")]
    provider: Option<ProviderKind>,
    #[arg(long, help = "Model name passed to the provider")]
    model: Option<String>,
    #[arg(long, help = "Environment variable holding the API key")]
    api_key_env: Option<String>,
    #[arg(long, help = "Project id every scan is credited to, skipping classification")]
    lock: Option<String>,
    #[arg(long, help = "Classify this image instead of capturing the screen")]
    image: Option<PathBuf>,
}

impl TrackCommand {
    /// Command line values win over `settings.toml`.
    fn apply(&self, settings: &mut Settings) -> Result<()> {
        if let Some(interval) = self.interval {
            settings.interval = interval;
        }
        if let Some(auto_stop) = self.auto_stop {
            settings.auto_stop_minutes = Some(auto_stop);
        }
        if let Some(provider) = self.provider {
            if provider != settings.provider {
                // Model and key names of the file belong to the other provider.
                settings.model = None;
                settings.api_key_env = None;
            }
            settings.provider = provider;
        }
        if let Some(model) = &self.model {
            settings.model = Some(model.clone());
        }
        if let Some(env) = &self.api_key_env {
            settings.api_key_env = Some(env.clone());
        }
        settings.validate()
    }
}

pub async fn process_track_command(dir: &Path, command: TrackCommand) -> Result<()> {
    let mut settings = Settings::load(dir)?;
    command.apply(&mut settings)?;
    debug!("Tracking with {settings:?}");

    let provider = build_provider(&settings)?;
    let capture: Arc<dyn CaptureSource> = match command.image {
        Some(path) => Arc::new(StaticImageCapture::from_path(path)),
        None => Arc::new(CommandCapture::new(settings.capture_command())?),
    };

    let storage = JsonProjectStorage::new(dir)?;
    // Held until the session's final save, other processes only get to read meanwhile.
    let _session_lock = storage.lock_session().await?;
    let collection = storage.load().await;
    let scheduler = ScanScheduler::new(
        settings.interval,
        RateLimiter::new(settings.per_minute, settings.per_hour),
    );

    let shutdown = CancellationToken::new();
    let (mut tracker, handle) = Tracker::new(
        scheduler,
        collection,
        storage,
        capture,
        provider,
        Box::new(DefaultClock),
        shutdown.clone(),
    );
    let TrackerHandle {
        commands,
        mut events,
    } = handle;

    if let Some(id) = command.lock {
        commands.send(TrackerCommand::Lock(id)).await?;
    }
    read_control_lines(commands);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{event}");
        }
    });
    let signals = tokio::spawn(detect_shutdown(shutdown.clone()));

    let result = tracker.run_session(settings.auto_stop_seconds()).await;

    shutdown.cancel();
    let collection = tracker.into_collection();
    if let Err(e) = signals.await {
        error!("Shutdown watcher failed {e:?}");
    }
    if let Err(e) = printer.await {
        error!("Event printer failed {e:?}");
    }

    result?;
    println!(
        "Total focus time: {}",
        format_total_time(collection.total_focus_time())
    );
    Ok(())
}

/// Forwards stdin lines as commands. Runs on a plain thread, a pending tokio stdin read would keep
/// the runtime from shutting down.
fn read_control_lines(commands: mpsc::Sender<TrackerCommand>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match TrackerCommand::parse(&line) {
                Ok(command) => {
                    if commands.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => eprintln!("{e}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        command: TrackCommand,
    }

    fn parse(args: &[&str]) -> TrackCommand {
        Wrapper::parse_from(std::iter::once("track").chain(args.iter().copied())).command
    }

    #[test]
    fn test_flags_override_settings() {
        let mut settings = Settings {
            model: Some("gemini-custom".into()),
            ..Default::default()
        };
        parse(&["--interval", "12", "--auto-stop", "30"])
            .apply(&mut settings)
            .unwrap();
        assert_eq!(settings.interval, 12);
        assert_eq!(settings.auto_stop_seconds(), Some(1800));
        assert_eq!(settings.model(), "gemini-custom");
    }

    #[test]
    fn test_switching_provider_drops_file_model() {
        let mut settings = Settings {
            model: Some("gemini-custom".into()),
            ..Default::default()
        };
        parse(&["--provider", "openai"]).apply(&mut settings).unwrap();
        assert_eq!(settings.provider, ProviderKind::OpenAi);
        assert_eq!(settings.model(), crate::classify::openai::DEFAULT_MODEL);
    }

    #[test]
    fn test_interval_below_minimum_is_rejected() {
        let mut settings = Settings::default();
        assert!(parse(&["--interval", "4"]).apply(&mut settings).is_err());
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let mut settings = Settings::default();
        assert!(parse(&["--interval", "9223372036854775807"])
            .apply(&mut settings)
            .is_err());
        let mut settings = Settings::default();
        assert!(parse(&["--auto-stop", "9223372036854775807"])
            .apply(&mut settings)
            .is_err());
    }
}
