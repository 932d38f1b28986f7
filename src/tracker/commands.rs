use std::fmt::Display;

use anyhow::{bail, Context, Result};

use super::scheduler::{ScanOutcome, SessionId};

/// Control messages accepted by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    ScanNow,
    Lock(String),
    Unlock,
    SetInterval(u64),
    Stop,
}

impl TrackerCommand {
    /// Parses one control line as typed on stdin: `scan`, `lock <id>`, `unlock`,
    /// `interval <secs>`, `stop`.
    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next()) {
            (Some("scan"), None) => Self::ScanNow,
            (Some("lock"), Some(id)) => Self::Lock(id.to_string()),
            (Some("unlock"), None) => Self::Unlock,
            (Some("interval"), Some(seconds)) => Self::SetInterval(
                seconds
                    .parse()
                    .with_context(|| format!("Invalid interval {seconds:?}"))?,
            ),
            (Some("stop" | "quit"), None) => Self::Stop,
            _ => bail!("Unknown command {line:?}. Expected scan, lock <id>, unlock, interval <secs> or stop"),
        };
        if words.next().is_some() {
            bail!("Unexpected trailing input in {line:?}");
        }
        Ok(command)
    }
}

/// Why a session went back to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    AutoStop,
    Shutdown,
}

/// Notifications emitted by a session for whoever renders its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Started {
        session: SessionId,
    },
    ScanCompleted {
        scan_count: u64,
        status: String,
        reason: String,
        credited: String,
        duration: u64,
        next_scan_in: u64,
    },
    /// A command couldn't be applied. The session keeps running.
    Rejected(String),
    CaptureFailed(String),
    Stopped(StopReason),
}

impl Display for TrackerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerEvent::Started { session } => write!(f, "Tracking started (session {session})"),
            TrackerEvent::ScanCompleted {
                scan_count,
                status,
                reason,
                credited,
                duration,
                next_scan_in,
            } => write!(
                f,
                "#{scan_count} {status}: {reason} [{credited} +{duration}s] next scan in {next_scan_in}s"
            ),
            TrackerEvent::Rejected(message) => write!(f, "Rejected: {message}"),
            TrackerEvent::CaptureFailed(message) => write!(f, "Screen capture failed: {message}"),
            TrackerEvent::Stopped(StopReason::Requested) => write!(f, "Tracking stopped"),
            TrackerEvent::Stopped(StopReason::AutoStop) => {
                write!(f, "Auto-stop timer reached. Tracking stopped.")
            }
            TrackerEvent::Stopped(StopReason::Shutdown) => write!(f, "Tracking interrupted"),
        }
    }
}

/// Short label describing the last scan.
pub fn status_label(outcome: &ScanOutcome, credited_name: &str) -> String {
    match outcome {
        ScanOutcome::Locked => format!("Locked: {credited_name}"),
        ScanOutcome::RateLimited => "Rate limit reached".to_string(),
        ScanOutcome::Failed => "Analysis failed (backoff)".to_string(),
        ScanOutcome::Idle => "Match: Idle".to_string(),
        ScanOutcome::Classified { match_id: None } => "No match".to_string(),
        ScanOutcome::Classified { match_id: Some(_) } => "Match: Tracked".to_string(),
    }
}
