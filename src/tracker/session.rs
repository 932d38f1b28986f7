use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    capture::{CaptureSource, FrameSource},
    classify::{
        analyze_frame, AnalysisResult, AnalysisStatus, ClassificationProvider, ProjectSnapshot,
        RATE_LIMIT_REACHED,
    },
    utils::{
        clock::Clock,
        config::{MAX_INTERVAL_SECONDS, MIN_INTERVAL_SECONDS},
    },
};

use super::{
    commands::{status_label, StopReason, TrackerCommand, TrackerEvent},
    scheduler::{ScanKind, ScanOutcome, ScanScheduler, ScanTicket, TickOutcome},
    storage::{
        collection::{EntryFields, ProjectCollection},
        entities::ConfidenceHint,
        project_storage::ProjectStorage,
    },
};

const TICK: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 32;

/// Classification result travelling back from a spawned scan.
struct ScanResult {
    ticket: ScanTicket,
    result: AnalysisResult,
}

/// The caller's side of a [Tracker].
pub struct TrackerHandle {
    pub commands: mpsc::Sender<TrackerCommand>,
    pub events: mpsc::Receiver<TrackerEvent>,
}

/// Session context. Owns the project collection, which is only ever changed from the session
/// loop, and everything needed to run scans.
pub struct Tracker<S: ProjectStorage> {
    scheduler: ScanScheduler,
    collection: ProjectCollection,
    storage: S,
    capture: Arc<dyn CaptureSource>,
    provider: Arc<dyn ClassificationProvider>,
    clock: Box<dyn Clock>,
    shutdown: CancellationToken,
    commands: mpsc::Receiver<TrackerCommand>,
    events: mpsc::Sender<TrackerEvent>,
    results_sender: mpsc::Sender<ScanResult>,
    results: mpsc::Receiver<ScanResult>,
}

impl<S: ProjectStorage> Tracker<S> {
    pub fn new(
        scheduler: ScanScheduler,
        collection: ProjectCollection,
        storage: S,
        capture: Arc<dyn CaptureSource>,
        provider: Arc<dyn ClassificationProvider>,
        clock: Box<dyn Clock>,
        shutdown: CancellationToken,
    ) -> (Self, TrackerHandle) {
        let (command_sender, commands) = mpsc::channel(CHANNEL_CAPACITY);
        let (events, event_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let (results_sender, results) = mpsc::channel(CHANNEL_CAPACITY);
        let tracker = Self {
            scheduler,
            collection,
            storage,
            capture,
            provider,
            clock,
            shutdown,
            commands,
            events,
            results_sender,
            results,
        };
        let handle = TrackerHandle {
            commands: command_sender,
            events: event_receiver,
        };
        (tracker, handle)
    }

    pub fn collection(&self) -> &ProjectCollection {
        &self.collection
    }

    pub fn into_collection(self) -> ProjectCollection {
        self.collection
    }

    pub fn scheduler(&self) -> &ScanScheduler {
        &self.scheduler
    }

    /// Runs one session until it is stopped. Fails without starting when the capture source
    /// can't be acquired.
    pub async fn run_session(&mut self, auto_stop: Option<u64>) -> Result<StopReason> {
        let frames: Arc<dyn FrameSource> = match self.capture.acquire().await {
            Ok(frames) => frames.into(),
            Err(e) => {
                error!("Failed to acquire screen capture {e:?}");
                self.emit(TrackerEvent::CaptureFailed(format!("{e:#}"))).await;
                return Err(e.context("Screen capture is unavailable"));
            }
        };

        let session = self.scheduler.start(auto_stop)?;
        self.emit(TrackerEvent::Started { session }).await;

        let mut in_flight: Option<JoinHandle<()>> = None;
        let mut next_tick = self.clock.instant() + TICK;
        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break StopReason::Shutdown,
                Some(command) = self.commands.recv() => {
                    if let Some(reason) = self.handle_command(command, &frames, &mut in_flight).await {
                        break reason;
                    }
                }
                Some(ScanResult { ticket, result }) = self.results.recv() => {
                    self.apply_classification(ticket, result).await;
                }
                _ = self.clock.sleep_until(next_tick) => {
                    next_tick += TICK;
                    match self.scheduler.tick(self.clock.instant()) {
                        TickOutcome::ScanDue(ticket) => self.execute(ticket, &frames, &mut in_flight).await,
                        TickOutcome::AutoStopped => break StopReason::AutoStop,
                        TickOutcome::Idle => break StopReason::Requested,
                        TickOutcome::CoolingDown { cooldown } => debug!("Cooling down, {cooldown}s left"),
                        TickOutcome::Waiting { .. } | TickOutcome::ScanInFlight => (),
                    }
                }
            }
        };

        // A result that is already queued is rejected by the next session's freshness check.
        if let Some(scan) = in_flight.take() {
            scan.abort();
        }
        self.scheduler.stop();
        frames.release().await;
        self.persist().await;
        info!("Session {session} ended: {reason:?}");
        self.emit(TrackerEvent::Stopped(reason)).await;
        Ok(reason)
    }

    async fn handle_command(
        &mut self,
        command: TrackerCommand,
        frames: &Arc<dyn FrameSource>,
        in_flight: &mut Option<JoinHandle<()>>,
    ) -> Option<StopReason> {
        debug!("Received command {command:?}");
        match command {
            TrackerCommand::ScanNow => match self.scheduler.trigger_manual(self.clock.instant()) {
                Some(ticket) => self.execute(ticket, frames, in_flight).await,
                None => {
                    self.emit(TrackerEvent::Rejected("A scan is already in progress".into()))
                        .await
                }
            },
            TrackerCommand::Lock(id) => match self.collection.get(&id) {
                Some(project) if !project.is_unknown => {
                    info!("Locked to {}", project.name);
                    self.scheduler.lock(id);
                }
                _ => {
                    self.emit(TrackerEvent::Rejected(format!("No project with id {id}")))
                        .await
                }
            },
            TrackerCommand::Unlock => {
                info!("Unlocked");
                self.scheduler.unlock();
            }
            TrackerCommand::SetInterval(seconds)
                if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&seconds) =>
            {
                self.emit(TrackerEvent::Rejected(format!(
                    "Interval must be between {MIN_INTERVAL_SECONDS} and {MAX_INTERVAL_SECONDS} seconds"
                )))
                .await
            }
            TrackerCommand::SetInterval(seconds) => {
                info!("Base interval set to {seconds}s");
                self.scheduler.set_base_interval(seconds);
            }
            TrackerCommand::Stop => return Some(StopReason::Requested),
        }
        None
    }

    /// Locked and rate limited scans are settled right away. Classification runs in its own task
    /// and reports back through the results channel.
    async fn execute(
        &mut self,
        ticket: ScanTicket,
        frames: &Arc<dyn FrameSource>,
        in_flight: &mut Option<JoinHandle<()>>,
    ) {
        match ticket.kind.clone() {
            ScanKind::Locked(project_id) => {
                let name = self
                    .collection
                    .get(&project_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default();
                let fields = EntryFields {
                    reason: format!("Locked: {name}"),
                    confidence_hint: Some(ConfidenceHint::Locked),
                    ..Default::default()
                };
                self.settle(ticket, ScanOutcome::Locked, Some(project_id), fields)
                    .await;
            }
            ScanKind::RateLimited => {
                info!("Rate limit reached, skipping classification");
                let fields = EntryFields {
                    reason: RATE_LIMIT_REACHED.to_string(),
                    ..Default::default()
                };
                self.settle(ticket, ScanOutcome::RateLimited, None, fields)
                    .await;
            }
            ScanKind::Classify => {
                let snapshot = ProjectSnapshot::new(&self.collection);
                let provider = self.provider.clone();
                let frames = frames.clone();
                let results = self.results_sender.clone();
                let span = info_span!("scan", session = ticket.session, number = ticket.scan_number);
                let scan = async move {
                    let result = match frames.current_frame().await {
                        Ok(frame) => analyze_frame(provider, snapshot.into_request(frame)).await,
                        Err(e) => {
                            warn!("Failed to grab a frame {e:?}");
                            AnalysisResult::failed()
                        }
                    };
                    if results.send(ScanResult { ticket, result }).await.is_err() {
                        debug!("Tracker is gone, dropping scan result");
                    }
                };
                *in_flight = Some(tokio::spawn(scan.instrument(span)));
            }
        }
    }

    async fn apply_classification(&mut self, ticket: ScanTicket, result: AnalysisResult) {
        let outcome = match result.status {
            AnalysisStatus::Failed => ScanOutcome::Failed,
            AnalysisStatus::Idle => ScanOutcome::Idle,
            AnalysisStatus::Answered => ScanOutcome::Classified {
                match_id: result.match_id.clone(),
            },
        };
        let target = result.match_id.clone();
        self.settle(ticket, outcome, target, result.into()).await;
    }

    /// Reports the outcome to the scheduler and, if the scan is still current, merges it into
    /// the collection.
    async fn settle(
        &mut self,
        ticket: ScanTicket,
        outcome: ScanOutcome,
        target: Option<String>,
        fields: EntryFields,
    ) {
        let Some(completion) = self.scheduler.complete(&ticket, &outcome) else {
            return;
        };

        let reason = fields.reason.clone();
        let credited = self.collection.credit_attribution(
            target.as_deref(),
            ticket.duration,
            fields,
            self.clock.time(),
        );
        let name = self
            .collection
            .get(&credited)
            .map(|p| p.name.as_str())
            .unwrap_or_default();
        let status = status_label(&outcome, name);
        info!("Scan {} {status}: {reason}", completion.scan_count);

        let event = TrackerEvent::ScanCompleted {
            scan_count: completion.scan_count,
            status,
            reason,
            credited: name.to_string(),
            duration: ticket.duration,
            next_scan_in: completion.next_scan_in,
        };
        self.persist().await;
        self.emit(event).await;
    }

    async fn persist(&self) {
        if let Err(e) = self.storage.save(&self.collection).await {
            error!("Failed to save projects {e:?}");
        }
    }

    async fn emit(&self, event: TrackerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Nobody listens to tracker events");
        }
    }
}
