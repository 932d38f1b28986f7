use anyhow::{bail, Result};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{
    interval::{AdaptiveInterval, ErrorBackoff},
    rate_limit::RateLimiter,
};

/// Countdown value a fresh session starts with, so the first scan happens on the first tick.
const INITIAL_COUNTDOWN: u64 = 1;

/// Identifies one Idle -> Running -> Idle cycle. Results of scans started in a previous session
/// are discarded.
pub type SessionId = u64;

/// How a triggered scan has to be carried out. Decided at trigger time from the state at that
/// moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanKind {
    /// Credit the locked project directly without classification.
    Locked(String),
    /// Rate limiter refused the attempt. Recorded without calling the provider.
    RateLimited,
    /// Capture a frame and classify it.
    Classify,
}

/// Snapshot taken when a scan is triggered. Everything the scan needs is copied out of the
/// scheduler so nothing has to be re-read after the classification round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTicket {
    pub session: SessionId,
    pub scan_number: u64,
    /// Seconds credited to the attributed project.
    pub duration: u64,
    pub kind: ScanKind,
}

/// Result of a scan as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Locked,
    RateLimited,
    Failed,
    /// The provider put the screen into the Unknown / Idle bucket.
    Idle,
    Classified { match_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// Counting down to the next scan.
    Waiting { countdown: u64 },
    /// Error backoff is active. No scan may start.
    CoolingDown { cooldown: u64 },
    /// A scan is still running. The countdown is held.
    ScanInFlight,
    ScanDue(ScanTicket),
    /// The auto-stop timer ran out and the session is now idle.
    AutoStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCompletion {
    pub scan_count: u64,
    /// Seconds until the next scan attempt.
    pub next_scan_in: u64,
}

#[derive(Debug)]
struct RunningSession {
    id: SessionId,
    countdown: u64,
    auto_stop: Option<u64>,
    scan_count: u64,
    in_flight: Option<u64>,
}

/// The timer-driven part of a tracking session. It owns no I/O: the caller ticks it once per
/// second, executes the tickets it hands out and reports their outcomes back.
#[derive(Debug)]
pub struct ScanScheduler {
    interval: AdaptiveInterval,
    backoff: ErrorBackoff,
    rate_limiter: RateLimiter,
    locked: Option<String>,
    session: Option<RunningSession>,
    last_session_id: SessionId,
}

impl ScanScheduler {
    pub fn new(base_interval: u64, rate_limiter: RateLimiter) -> Self {
        Self {
            interval: AdaptiveInterval::new(base_interval),
            backoff: ErrorBackoff::default(),
            rate_limiter,
            locked: None,
            session: None,
            last_session_id: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn is_scan_in_flight(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.in_flight.is_some())
    }

    pub fn countdown(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.countdown)
    }

    pub fn auto_stop_remaining(&self) -> Option<u64> {
        self.session.as_ref().and_then(|s| s.auto_stop)
    }

    pub fn scan_count(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.scan_count)
    }

    pub fn interval(&self) -> &AdaptiveInterval {
        &self.interval
    }

    pub fn backoff(&self) -> &ErrorBackoff {
        &self.backoff
    }

    pub fn locked(&self) -> Option<&str> {
        self.locked.as_deref()
    }

    /// Idle -> Running. `auto_stop` is the number of seconds after which the session ends by
    /// itself.
    pub fn start(&mut self, auto_stop: Option<u64>) -> Result<SessionId> {
        if self.session.is_some() {
            bail!("A tracking session is already running");
        }
        self.last_session_id += 1;
        self.interval.reset();
        self.backoff.reset();
        self.session = Some(RunningSession {
            id: self.last_session_id,
            countdown: INITIAL_COUNTDOWN,
            auto_stop: auto_stop.filter(|v| *v > 0),
            scan_count: 0,
            in_flight: None,
        });
        info!("Session {} started", self.last_session_id);
        Ok(self.last_session_id)
    }

    /// Running -> Idle. Returns `false` if nothing was running.
    pub fn stop(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        self.interval.reset();
        self.backoff.reset();
        info!(
            "Session {} stopped after {} scans",
            session.id, session.scan_count
        );
        true
    }

    pub fn set_base_interval(&mut self, base: u64) {
        self.interval.set_base(base);
        if let Some(session) = self.session.as_mut() {
            if session.in_flight.is_none() {
                session.countdown = session.countdown.min(base);
            }
        }
    }

    /// Routes every scan to `project_id` until [ScanScheduler::unlock].
    pub fn lock(&mut self, project_id: String) {
        self.interval.reset();
        self.locked = Some(project_id);
    }

    pub fn unlock(&mut self) {
        self.locked = None;
    }

    /// Advances the session by one second.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let Some(session) = self.session.as_mut() else {
            return TickOutcome::Idle;
        };

        if let Some(remaining) = session.auto_stop.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.stop();
                return TickOutcome::AutoStopped;
            }
        }

        if self.backoff.is_cooling_down() {
            self.backoff.tick();
            session.countdown = session.countdown.saturating_sub(1);
            return TickOutcome::CoolingDown {
                cooldown: self.backoff.cooldown(),
            };
        }

        if session.in_flight.is_some() {
            return TickOutcome::ScanInFlight;
        }

        if session.countdown <= 1 {
            return match self.begin_scan(now) {
                Some(ticket) => TickOutcome::ScanDue(ticket),
                None => TickOutcome::ScanInFlight,
            };
        }

        session.countdown -= 1;
        TickOutcome::Waiting {
            countdown: session.countdown,
        }
    }

    /// User requested an immediate scan. Refused while idle or while a scan is in flight.
    pub fn trigger_manual(&mut self, now: Instant) -> Option<ScanTicket> {
        if self.session.as_ref()?.in_flight.is_some() {
            return None;
        }
        self.begin_scan(now)
    }

    fn begin_scan(&mut self, now: Instant) -> Option<ScanTicket> {
        let session = self.session.as_mut()?;
        if session.in_flight.is_some() {
            return None;
        }

        let kind = match &self.locked {
            Some(project) => ScanKind::Locked(project.clone()),
            None if self.rate_limiter.is_rate_limited(now) => ScanKind::RateLimited,
            None => ScanKind::Classify,
        };
        let scan_number = session.scan_count + 1;
        session.in_flight = Some(scan_number);
        session.countdown = 1;

        let ticket = ScanTicket {
            session: session.id,
            scan_number,
            duration: self.interval.effective(),
            kind,
        };
        debug!("Scan triggered {ticket:?}");
        Some(ticket)
    }

    /// Applies the outcome of a scan. Returns `None` when the ticket belongs to a session that
    /// is no longer running, in which case nothing changes.
    pub fn complete(&mut self, ticket: &ScanTicket, outcome: &ScanOutcome) -> Option<ScanCompletion> {
        let session = self.session.as_mut()?;
        if session.id != ticket.session || session.in_flight != Some(ticket.scan_number) {
            debug!("Dropping stale scan result {ticket:?}");
            return None;
        }
        session.in_flight = None;
        session.scan_count += 1;

        let next_scan_in = match outcome {
            ScanOutcome::Locked => {
                self.interval.reset();
                self.interval.base()
            }
            ScanOutcome::RateLimited => {
                self.backoff.reset();
                self.interval.effective()
            }
            ScanOutcome::Failed => self.backoff.apply(self.interval.base()),
            ScanOutcome::Idle => {
                self.backoff.reset();
                self.interval.update(None)
            }
            ScanOutcome::Classified { match_id } => {
                self.backoff.reset();
                self.interval.update(match_id.as_deref())
            }
        };
        session.countdown = next_scan_in;

        Some(ScanCompletion {
            scan_count: session.scan_count,
            next_scan_in,
        })
    }
}
