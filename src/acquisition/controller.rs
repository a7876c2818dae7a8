//! Acquisition state machine.
//!
//! ```text
//!            start                      configured
//!   Idle ─────────────> Configuring ─────────────> Acquiring
//!    ^                       │                         │ stop / reader fault
//!    │   validation or       │                         v
//!    └── transport error ────┘       Idle <──────── Stopping
//! ```
//!
//! The controller is the single owner of the transport, the sample buffer and the latest
//! derived channels. While acquiring, the transport is on loan to the reader thread and
//! samples flow back through an unbounded FIFO; [`AcquisitionController::drain`] and
//! [`AcquisitionController::refresh`] are meant to be called periodically from one
//! scheduling context (see [`crate::acquisition::service`]).
//!
//! Observers never receive a reference into controller-owned data. They subscribe to
//! `watch` channels publishing the state and immutable [`DerivedSnapshot`]s.

use crate::acquisition::producer::{
    spawn_producer, JoinOutcome, ProducerContext, ProducerHandle,
};
use crate::command::{validate_interval, SamplingCommand};
use crate::config::{AcquisitionConfig, BusConfig, Settings};
use crate::data::filter_engine::{DerivedChannels, FilterEngine, MIN_REFRESH_SAMPLES};
use crate::data::sample_buffer::SampleBuffer;
use crate::data::storage::export_csv;
use crate::error::{AppResult, DaqError};
use crate::frame::{RawFrame, Sample};
use crate::hardware::{build_transport, Transport};
use crate::validation::is_writable_target;
use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AcquisitionState {
    /// No session; transport may be open or closed.
    #[default]
    Idle,
    /// Opening the transport and configuring the sensor.
    Configuring,
    /// Reader thread running, samples accumulating.
    Acquiring,
    /// Reader shutting down; final drain and export in progress.
    Stopping,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcquisitionState::Idle => "idle",
            AcquisitionState::Configuring => "configuring",
            AcquisitionState::Acquiring => "acquiring",
            AcquisitionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Parameters of one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRequest {
    /// Sampling interval sent to the sensor, in milliseconds (1..=2000).
    pub interval_ms: u32,
    /// CSV file written when the session stops, if any.
    pub csv_target: Option<PathBuf>,
}

impl AcquisitionRequest {
    /// A request without export.
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            csv_target: None,
        }
    }

    /// Adds a CSV export target.
    pub fn with_csv(mut self, path: impl Into<PathBuf>) -> Self {
        self.csv_target = Some(path.into());
        self
    }
}

/// The running session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Interval sent to the sensor.
    pub interval_ms: u32,
    /// Sampling frequency the filters are designed for.
    pub sampling_frequency_hz: f64,
    /// Export target.
    pub csv_target: Option<PathBuf>,
    /// When the reader was started.
    pub started_at: DateTime<Local>,
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// A new session is acquiring.
    Started(SessionInfo),
    /// A session was already acquiring; nothing changed.
    AlreadyAcquiring,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    /// Samples in the frozen buffer.
    pub sample_count: usize,
    /// Whether derived channels were computed for the export.
    pub derived_computed: bool,
    /// Where the export was written, if it succeeded.
    pub exported_to: Option<PathBuf>,
    /// Why the export failed, if it was requested and failed.
    pub export_error: Option<String>,
    /// The reader error that ended the session, for forced stops.
    pub fault: Option<String>,
    /// The reader did not exit in time and was abandoned along with the transport.
    pub reader_detached: bool,
}

impl StopReport {
    /// True when the session ended because of a reader fault.
    pub fn is_forced(&self) -> bool {
        self.fault.is_some()
    }
}

/// Derived channels published to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSnapshot {
    /// Samples the channels were computed from.
    pub sample_count: usize,
    /// Sampling frequency used for the filter design.
    pub sampling_frequency_hz: f64,
    /// The channels themselves.
    pub channels: DerivedChannels,
}

/// What a drain tick did.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Samples moved from the FIFO into the buffer.
    pub moved: usize,
    /// Set when the reader had died and the session was force-stopped.
    pub forced_stop: Option<StopReport>,
}

type TransportFactory = Box<dyn Fn(&BusConfig) -> AppResult<Box<dyn Transport>> + Send>;

/// Owner of one sensor session at a time.
pub struct AcquisitionController {
    bus: BusConfig,
    timing: AcquisitionConfig,
    engine: FilterEngine,
    factory: Option<TransportFactory>,
    transport: Option<Box<dyn Transport>>,
    buffer: SampleBuffer,
    queue: Option<mpsc::UnboundedReceiver<Sample>>,
    producer: Option<ProducerHandle>,
    session: Option<SessionInfo>,
    latest: Option<Arc<DerivedSnapshot>>,
    state_tx: watch::Sender<AcquisitionState>,
    derived_tx: watch::Sender<Option<Arc<DerivedSnapshot>>>,
}

impl AcquisitionController {
    /// Controller whose transport is built from `settings.bus` on first use.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut controller = Self::bare(settings);
        controller.factory = Some(Box::new(build_transport));
        controller
    }

    /// Controller over an already built transport.
    ///
    /// If the transport is lost to a reader that had to be detached, later starts fail
    /// with a transport error.
    pub fn with_transport(settings: &Settings, transport: Box<dyn Transport>) -> Self {
        let mut controller = Self::bare(settings);
        controller.transport = Some(transport);
        controller
    }

    fn bare(settings: &Settings) -> Self {
        let (state_tx, _) = watch::channel(AcquisitionState::Idle);
        let (derived_tx, _) = watch::channel(None);
        Self {
            bus: settings.bus.clone(),
            timing: settings.acquisition.clone(),
            engine: FilterEngine::new(
                settings.filter.lowpass_cutoff_hz,
                settings.filter.highpass_cutoff_hz,
            ),
            factory: None,
            transport: None,
            buffer: SampleBuffer::new(),
            queue: None,
            producer: None,
            session: None,
            latest: None,
            state_tx,
            derived_tx,
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        *self.state_tx.borrow()
    }

    /// The running session, if any.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    /// Buffered samples. After a stop this is the frozen buffer of the last session.
    pub fn samples(&self) -> &[Sample] {
        self.buffer.as_slice()
    }

    /// Most recent derived channels.
    pub fn latest_derived(&self) -> Option<Arc<DerivedSnapshot>> {
        self.latest.clone()
    }

    /// The filter pair used for derived channels.
    pub fn engine(&self) -> &FilterEngine {
        &self.engine
    }

    /// Observes state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state_tx.subscribe()
    }

    /// Observes derived-channel refreshes. `None` means "cleared".
    pub fn subscribe_derived(&self) -> watch::Receiver<Option<Arc<DerivedSnapshot>>> {
        self.derived_tx.subscribe()
    }

    /// Starts a session.
    ///
    /// Starting while acquiring is a no-op. An invalid interval is rejected before any
    /// state change; any failure while configuring returns the controller to `Idle` with
    /// the previous buffer untouched.
    pub fn start(&mut self, request: AcquisitionRequest) -> AppResult<StartOutcome> {
        match self.state() {
            AcquisitionState::Acquiring => {
                warn!("acquisition already running, start ignored");
                return Ok(StartOutcome::AlreadyAcquiring);
            }
            AcquisitionState::Idle => {}
            other => {
                return Err(DaqError::Validation(format!(
                    "cannot start while {other}"
                )))
            }
        }
        validate_interval(request.interval_ms)?;

        self.set_state(AcquisitionState::Configuring);
        let command = match self.configure(&request) {
            Ok(command) => command,
            Err(e) => {
                error!(error = %e, class = e.class(), "configuring failed");
                self.set_state(AcquisitionState::Idle);
                return Err(e);
            }
        };

        self.buffer.clear();
        self.publish_derived(None);

        let Some(transport) = self.transport.take() else {
            self.set_state(AcquisitionState::Idle);
            return Err(DaqError::Transport("transport unavailable".into()));
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = match spawn_producer(ProducerContext {
            transport,
            stop: Arc::new(AtomicBool::new(false)),
            queue: tx,
            poll_timeout: self.bus.poll_timeout(),
        }) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "could not start reader thread");
                self.set_state(AcquisitionState::Idle);
                return Err(e);
            }
        };

        let session = SessionInfo {
            interval_ms: command.interval_ms,
            sampling_frequency_hz: command.sampling_frequency_hz(),
            csv_target: request.csv_target,
            started_at: Local::now(),
        };
        info!(
            interval_ms = session.interval_ms,
            sampling_hz = session.sampling_frequency_hz,
            csv = ?session.csv_target,
            "acquisition started"
        );
        self.queue = Some(rx);
        self.producer = Some(handle);
        self.session = Some(session.clone());
        self.set_state(AcquisitionState::Acquiring);
        Ok(StartOutcome::Started(session))
    }

    fn configure(&mut self, request: &AcquisitionRequest) -> AppResult<SamplingCommand> {
        let command = SamplingCommand::new(request.interval_ms)?;
        let frame = command.to_frame()?;
        let transport = self.ensure_transport()?;
        transport.send(&frame)?;
        debug!(frame = %frame, "sampling command sent");

        if let Some(target) = &request.csv_target {
            if let Err(reason) = is_writable_target(target) {
                return Err(DaqError::Validation(format!(
                    "cannot export to {}: {reason}",
                    target.display()
                )));
            }
        }
        Ok(command)
    }

    fn ensure_transport(&mut self) -> AppResult<&mut Box<dyn Transport>> {
        if self.transport.is_none() {
            let factory = self
                .factory
                .as_ref()
                .ok_or_else(|| DaqError::Transport("transport was lost".into()))?;
            self.transport = Some(factory(&self.bus)?);
        }
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| DaqError::Transport("transport unavailable".into()))?;
        if !transport.is_open() {
            transport.open(&self.bus)?;
        }
        Ok(transport)
    }

    /// Moves queued samples into the buffer.
    ///
    /// If the reader has exited on its own, the session is force-stopped here and the
    /// stop report returned.
    pub fn drain(&mut self) -> DrainOutcome {
        if self.state() != AcquisitionState::Acquiring {
            return DrainOutcome::default();
        }
        let moved = match self.queue.as_mut() {
            Some(queue) => self.buffer.drain_from(queue),
            None => 0,
        };
        let reader_died = self
            .producer
            .as_ref()
            .is_some_and(|p| p.is_finished() && !p.stop_requested());
        let forced_stop = reader_died.then(|| {
            warn!("reader exited unexpectedly, stopping acquisition");
            self.finish()
        });
        DrainOutcome { moved, forced_stop }
    }

    /// Recomputes derived channels over the whole buffer.
    ///
    /// Skipped unless acquiring with at least two samples.
    pub fn refresh(&mut self) -> Option<Arc<DerivedSnapshot>> {
        if self.state() != AcquisitionState::Acquiring
            || self.buffer.len() < MIN_REFRESH_SAMPLES
        {
            return None;
        }
        let fs = self.session.as_ref()?.sampling_frequency_hz;
        Some(self.recompute(fs))
    }

    fn recompute(&mut self, fs: f64) -> Arc<DerivedSnapshot> {
        let snapshot = Arc::new(DerivedSnapshot {
            sample_count: self.buffer.len(),
            sampling_frequency_hz: fs,
            channels: self.engine.compute(self.buffer.as_slice(), fs),
        });
        self.publish_derived(Some(Arc::clone(&snapshot)));
        snapshot
    }

    /// Stops the running session. Returns `None` when nothing was acquiring.
    pub fn stop(&mut self) -> Option<StopReport> {
        if self.state() != AcquisitionState::Acquiring {
            debug!(state = %self.state(), "stop ignored, no acquisition running");
            return None;
        }
        Some(self.finish())
    }

    fn finish(&mut self) -> StopReport {
        self.set_state(AcquisitionState::Stopping);
        let mut fault = None;
        let mut reader_detached = false;

        if let Some(producer) = self.producer.take() {
            producer.request_stop();
            match producer.join_timeout(self.timing.join_timeout()) {
                JoinOutcome::Exited(exit) => {
                    self.transport = Some(exit.transport);
                    match exit.outcome {
                        Ok(stats) => debug!(
                            frames = stats.frames,
                            samples = stats.samples,
                            skipped = stats.skipped,
                            "reader joined"
                        ),
                        Err(e) => fault = Some(e.to_string()),
                    }
                }
                JoinOutcome::Panicked => {
                    error!("reader thread panicked, transport lost");
                    fault = Some("reader thread panicked".to_string());
                }
                JoinOutcome::TimedOut => {
                    warn!(
                        timeout_ms = self.timing.join_timeout_ms,
                        "reader did not exit in time, detaching it; it closes the transport on exit"
                    );
                    reader_detached = true;
                }
            }
        }

        if let Some(mut queue) = self.queue.take() {
            self.buffer.drain_from(&mut queue);
        }

        let session = self.session.take();
        let derived = match &session {
            Some(s) if self.buffer.len() >= MIN_REFRESH_SAMPLES => {
                Some(self.recompute(s.sampling_frequency_hz))
            }
            _ => {
                self.publish_derived(None);
                None
            }
        };

        let mut report = StopReport {
            sample_count: self.buffer.len(),
            derived_computed: derived.is_some(),
            exported_to: None,
            export_error: None,
            fault,
            reader_detached,
        };
        if let Some(target) = session.and_then(|s| s.csv_target) {
            let channels = derived.as_ref().map(|d| &d.channels);
            match export_csv(&target, self.buffer.as_slice(), channels) {
                Ok(_) => report.exported_to = Some(target),
                Err(e) => {
                    error!(error = %e, path = %target.display(), "export failed");
                    report.export_error = Some(e.to_string());
                }
            }
        }

        self.set_state(AcquisitionState::Idle);
        info!(
            samples = report.sample_count,
            forced = report.is_forced(),
            exported = ?report.exported_to,
            "acquisition stopped"
        );
        report
    }

    /// Sends one frame on the bus. Refused while acquiring.
    pub fn send_frame(&mut self, frame: &RawFrame) -> AppResult<()> {
        if self.state() != AcquisitionState::Idle {
            return Err(DaqError::Validation(format!(
                "cannot send frames while {}",
                self.state()
            )));
        }
        self.ensure_transport()?.send(frame)?;
        info!(frame = %frame, "frame sent");
        Ok(())
    }

    /// Stops any session and closes the transport.
    pub fn shutdown(&mut self) -> Option<StopReport> {
        let report = self.stop();
        if let Some(transport) = self.transport.as_mut() {
            transport.close();
        }
        report
    }

    fn set_state(&self, state: AcquisitionState) {
        self.state_tx.send_replace(state);
    }

    fn publish_derived(&mut self, snapshot: Option<Arc<DerivedSnapshot>>) {
        self.latest = snapshot.clone();
        self.derived_tx.send_replace(snapshot);
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.detach();
        }
    }
}
