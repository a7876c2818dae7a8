//! Actor driving an [`AcquisitionController`].
//!
//! The service task is the single scheduling context of the consumer side. It owns the
//! controller and multiplexes three sources in one `tokio::select!` loop:
//!
//! - commands from [`AcquisitionHandle`]s, answered over oneshot channels
//! - the drain tick, moving queued samples into the buffer (100 ms by default)
//! - the refresh tick, recomputing derived channels (500 ms by default)
//!
//! Because everything runs on that one task, buffer mutation is never concurrent with
//! filtering or export. Stopping joins the reader thread with a bound and writes the
//! export; that work runs under `block_in_place`, so the service needs the multi-threaded
//! runtime.
//!
//! ```no_run
//! use tilt_daq::acquisition::{AcquisitionController, AcquisitionRequest, AcquisitionService};
//! use tilt_daq::config::Settings;
//!
//! # async fn example() -> tilt_daq::error::AppResult<()> {
//! let settings = Settings::default();
//! let controller = AcquisitionController::from_settings(&settings);
//! let (handle, task) = AcquisitionService::new(controller, &settings.acquisition).spawn();
//!
//! handle.start(AcquisitionRequest::new(100).with_csv("run.csv")).await?;
//! tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//! let report = handle.stop().await?;
//! handle.shutdown().await?;
//! let _controller = task.await;
//! # Ok(())
//! # }
//! ```

use super::controller::{
    AcquisitionController, AcquisitionRequest, AcquisitionState, DerivedSnapshot, SessionInfo,
    StartOutcome, StopReport,
};
use crate::config::AcquisitionConfig;
use crate::error::{AppResult, DaqError};
use crate::frame::RawFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{block_in_place, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Requests handled by the service task.
#[derive(Debug)]
pub enum AcquisitionCommand {
    /// Start a session.
    Start {
        /// Session parameters
        request: AcquisitionRequest,
        /// Start result
        response: oneshot::Sender<AppResult<StartOutcome>>,
    },
    /// Stop the running session, if any.
    Stop {
        /// Stop report, `None` when idle
        response: oneshot::Sender<Option<StopReport>>,
    },
    /// Send a manual frame on the bus (idle only).
    SendFrame {
        /// Frame to write
        frame: RawFrame,
        /// Send result
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Number of buffered samples.
    GetSampleCount {
        /// Current count
        response: oneshot::Sender<usize>,
    },
    /// Stop any session, close the transport and end the task.
    Shutdown {
        /// Report of the session stopped by the shutdown, if any
        response: oneshot::Sender<Option<StopReport>>,
    },
}

impl AcquisitionCommand {
    /// Helper to create a Start command
    pub fn start(request: AcquisitionRequest) -> (Self, oneshot::Receiver<AppResult<StartOutcome>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Start { request, response: tx }, rx)
    }

    /// Helper to create a Stop command
    pub fn stop() -> (Self, oneshot::Receiver<Option<StopReport>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Stop { response: tx }, rx)
    }

    /// Helper to create a SendFrame command
    pub fn send_frame(frame: RawFrame) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SendFrame { frame, response: tx }, rx)
    }

    /// Helper to create a GetSampleCount command
    pub fn get_sample_count() -> (Self, oneshot::Receiver<usize>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetSampleCount { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<Option<StopReport>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Notifications broadcast to observers.
#[derive(Debug, Clone)]
pub enum AcquisitionEvent {
    /// A session started.
    Started(SessionInfo),
    /// Derived channels were recomputed.
    Refreshed {
        /// Samples covered by the refresh
        sample_count: usize,
    },
    /// A session ended, on request or because the reader failed.
    Stopped(StopReport),
}

/// The service before it is spawned.
pub struct AcquisitionService {
    controller: AcquisitionController,
    drain_period: Duration,
    refresh_period: Duration,
    events: broadcast::Sender<AcquisitionEvent>,
}

impl AcquisitionService {
    /// Wraps a controller with the cadences from `timing`.
    pub fn new(controller: AcquisitionController, timing: &AcquisitionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            controller,
            drain_period: timing.drain_interval(),
            refresh_period: timing.refresh_interval(),
            events,
        }
    }

    /// Spawns the service task. The task hands the controller back when it ends.
    pub fn spawn(self) -> (AcquisitionHandle, JoinHandle<AcquisitionController>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = AcquisitionHandle {
            command_tx,
            events: self.events.clone(),
            state: self.controller.subscribe_state(),
            derived: self.controller.subscribe_derived(),
        };
        let task = tokio::spawn(self.run(command_rx));
        (handle, task)
    }

    /// Runs the event loop until shutdown or until every handle is dropped.
    pub async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<AcquisitionCommand>,
    ) -> AcquisitionController {
        info!(
            drain_ms = self.drain_period.as_millis() as u64,
            refresh_ms = self.refresh_period.as_millis() as u64,
            "acquisition service started"
        );
        let mut drain = tokio::time::interval(self.drain_period);
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.refresh_period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("all handles dropped");
                        self.finish_session();
                        break;
                    };
                    if self.handle_command(command) {
                        break;
                    }
                }
                _ = drain.tick() => {
                    let outcome = self.controller.drain();
                    if let Some(report) = outcome.forced_stop {
                        warn!(fault = ?report.fault, "acquisition force-stopped");
                        self.emit(AcquisitionEvent::Stopped(report));
                    }
                }
                _ = refresh.tick() => {
                    if let Some(snapshot) = self.controller.refresh() {
                        self.emit(AcquisitionEvent::Refreshed {
                            sample_count: snapshot.sample_count,
                        });
                    }
                }
            }
        }

        info!("acquisition service stopped");
        self.controller
    }

    /// Returns true when the service should exit.
    fn handle_command(&mut self, command: AcquisitionCommand) -> bool {
        match command {
            AcquisitionCommand::Start { request, response } => {
                let result = self.controller.start(request);
                if let Ok(StartOutcome::Started(session)) = &result {
                    self.emit(AcquisitionEvent::Started(session.clone()));
                }
                let _ = response.send(result);
                false
            }
            AcquisitionCommand::Stop { response } => {
                let report = block_in_place(|| self.controller.stop());
                if let Some(report) = &report {
                    self.emit(AcquisitionEvent::Stopped(report.clone()));
                }
                let _ = response.send(report);
                false
            }
            AcquisitionCommand::SendFrame { frame, response } => {
                let _ = response.send(self.controller.send_frame(&frame));
                false
            }
            AcquisitionCommand::GetSampleCount { response } => {
                let _ = response.send(self.controller.samples().len());
                false
            }
            AcquisitionCommand::Shutdown { response } => {
                let _ = response.send(self.finish_session());
                true
            }
        }
    }

    fn finish_session(&mut self) -> Option<StopReport> {
        let report = block_in_place(|| self.controller.shutdown());
        if let Some(report) = &report {
            self.emit(AcquisitionEvent::Stopped(report.clone()));
        }
        report
    }

    fn emit(&self, event: AcquisitionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Cloneable client of a running [`AcquisitionService`].
#[derive(Clone)]
pub struct AcquisitionHandle {
    command_tx: mpsc::Sender<AcquisitionCommand>,
    events: broadcast::Sender<AcquisitionEvent>,
    state: watch::Receiver<AcquisitionState>,
    derived: watch::Receiver<Option<Arc<DerivedSnapshot>>>,
}

impl AcquisitionHandle {
    async fn request<T>(
        &self,
        (command, rx): (AcquisitionCommand, oneshot::Receiver<T>),
    ) -> AppResult<T> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DaqError::ServiceStopped)?;
        rx.await.map_err(|_| DaqError::ServiceStopped)
    }

    /// Starts a session.
    pub async fn start(&self, request: AcquisitionRequest) -> AppResult<StartOutcome> {
        self.request(AcquisitionCommand::start(request)).await?
    }

    /// Stops the running session.
    pub async fn stop(&self) -> AppResult<Option<StopReport>> {
        self.request(AcquisitionCommand::stop()).await
    }

    /// Sends a manual frame.
    pub async fn send_frame(&self, frame: RawFrame) -> AppResult<()> {
        self.request(AcquisitionCommand::send_frame(frame)).await?
    }

    /// Number of buffered samples.
    pub async fn sample_count(&self) -> AppResult<usize> {
        self.request(AcquisitionCommand::get_sample_count()).await
    }

    /// Ends the service.
    pub async fn shutdown(&self) -> AppResult<Option<StopReport>> {
        self.request(AcquisitionCommand::shutdown()).await
    }

    /// Current controller state.
    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// Watches controller state.
    pub fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state.clone()
    }

    /// Watches derived-channel snapshots.
    pub fn watch_derived(&self) -> watch::Receiver<Option<Arc<DerivedSnapshot>>> {
        self.derived.clone()
    }

    /// Subscribes to service events.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::config::BusConfig;
    use crate::hardware::{Transport, VirtualBus, SIMULATED_SENSOR_ID};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.bus.poll_timeout_ms = 10;
        settings.acquisition.drain_interval_ms = 10;
        settings.acquisition.refresh_interval_ms = 30;
        settings.acquisition.join_timeout_ms = 1000;
        settings
    }

    fn spawn(bus: &VirtualBus) -> (AcquisitionHandle, JoinHandle<AcquisitionController>) {
        let settings = settings();
        let controller =
            AcquisitionController::with_transport(&settings, Box::new(bus.transport()));
        AcquisitionService::new(controller, &settings.acquisition).spawn()
    }

    async fn next_stop(events: &mut broadcast::Receiver<AcquisitionEvent>) -> StopReport {
        loop {
            match events.recv().await {
                Ok(AcquisitionEvent::Stopped(report)) => return report,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn acquires_refreshes_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let bus = VirtualBus::with_simulated_sensor(SIMULATED_SENSOR_ID);
        let (handle, task) = spawn(&bus);
        let mut events = handle.subscribe();
        let mut derived = handle.watch_derived();

        let outcome = handle
            .start(AcquisitionRequest::new(5).with_csv(&path))
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::Started(_)));
        assert_eq!(handle.state(), AcquisitionState::Acquiring);

        // wait for a refresh covering several samples
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                derived.changed().await.unwrap();
                let latest = derived.borrow().clone();
                if latest.is_some_and(|s| s.sample_count >= 5) {
                    break;
                }
            }
        })
        .await
        .unwrap();

        let report = handle.stop().await.unwrap().unwrap();
        assert!(report.sample_count >= 5);
        assert!(report.derived_computed);
        assert_eq!(report.exported_to.as_deref(), Some(path.as_path()));
        assert_eq!(next_stop(&mut events).await, report);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), report.sample_count + 1);
        assert!(text.lines().next().unwrap().starts_with("Timestamp,CAN ID,"));

        handle.shutdown().await.unwrap();
        let controller = task.await.unwrap();
        assert_eq!(controller.state(), AcquisitionState::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reader_fault_is_broadcast() {
        let bus = VirtualBus::new();
        let (handle, _task) = spawn(&bus);
        let mut events = handle.subscribe();
        handle.start(AcquisitionRequest::new(100)).await.unwrap();
        bus.inject_failure("adapter unplugged");

        let report = tokio::time::timeout(Duration::from_secs(5), next_stop(&mut events))
            .await
            .unwrap();
        assert!(report.is_forced());
        assert_eq!(handle.state(), AcquisitionState::Idle);
        assert!(handle.stop().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn manual_frames_only_when_idle() {
        let bus = VirtualBus::new();
        let (handle, _task) = spawn(&bus);
        let frame = RawFrame::new(0x61D, &[0x2B, 0x00, 0x18, 0x05]).unwrap();
        handle.send_frame(frame.clone()).await.unwrap();

        handle.start(AcquisitionRequest::new(100)).await.unwrap();
        let err = handle.send_frame(frame.clone()).await.unwrap_err();
        assert!(err.is_validation());
        handle.stop().await.unwrap();

        assert_eq!(bus.sent_frames()[0], frame);
        assert_eq!(handle.sample_count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn requests_after_shutdown_fail() {
        let bus = VirtualBus::new();
        let (handle, task) = spawn(&bus);
        assert!(handle.shutdown().await.unwrap().is_none());
        task.await.unwrap();
        assert!(matches!(
            handle.stop().await,
            Err(DaqError::ServiceStopped)
        ));
    }

    /// Transport whose polls take far longer than the drain tick.
    struct SlowTransport;

    impl Transport for SlowTransport {
        fn open(&mut self, _config: &BusConfig) -> AppResult<()> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }

        fn poll(&mut self, _timeout: Duration) -> AppResult<Option<RawFrame>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(None)
        }

        fn send(&mut self, _frame: &RawFrame) -> AppResult<()> {
            Ok(())
        }

        fn close(&mut self) {}

        fn describe(&self) -> String {
            "slow".into()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_stop_does_not_stall_the_runtime() {
        let settings = settings();
        let controller = AcquisitionController::with_transport(&settings, Box::new(SlowTransport));
        let (handle, task) = AcquisitionService::new(controller, &settings.acquisition).spawn();
        handle.start(AcquisitionRequest::new(100)).await.unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = ticks.load(Ordering::Relaxed);

        let report = handle.stop().await.unwrap().unwrap();
        assert!(!report.reader_detached);
        // the reader needs up to one 300 ms poll to see the stop flag
        assert!(ticks.load(Ordering::Relaxed) >= before + 5);

        counter.abort();
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
