//! In-process CAN bus
//!
//! Provides a simulated bus for running and testing acquisitions without hardware.
//!
//! - `VirtualBus` - shared handle used to inject frames or failures and to inspect
//!   what was sent
//! - `VirtualTransport` - the [`Transport`] end handed to the acquisition controller
//!
//! A bus can also host a simulated accelerometer node. It stays silent until it receives
//! the sampling command on `0x61D`, then emits one frame on `0x19D` per configured interval
//! carrying a slowly rocking tilt.

use crate::config::BusConfig;
use crate::error::{AppResult, DaqError};
use crate::frame::RawFrame;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::transport::Transport;

/// Identifier on which the simulated node publishes samples.
pub const SIMULATED_SENSOR_ID: u32 = 0x19D;

/// Leading payload bytes of the sampling command.
const SAMPLING_COMMAND_HEAD: [u8; 4] = [0x2B, 0x00, 0x18, 0x05];

#[derive(Debug)]
struct SimulatedSensor {
    source_id: u32,
    interval: Option<Duration>,
    next_due: Instant,
    emitted: u64,
}

impl SimulatedSensor {
    fn configure(&mut self, frame: &RawFrame) {
        let data = frame.data();
        if frame.id() != crate::command::COMMAND_TARGET_ID
            || data.len() < 6
            || data[..4] != SAMPLING_COMMAND_HEAD
        {
            return;
        }
        let interval_ms = u16::from_le_bytes([data[4], data[5]]);
        if interval_ms == 0 {
            return;
        }
        self.interval = Some(Duration::from_millis(u64::from(interval_ms)));
        self.next_due = Instant::now();
        tracing::debug!(interval_ms, "simulated sensor configured");
    }

    fn due_frame(&mut self, now: Instant) -> Option<RawFrame> {
        let interval = self.interval?;
        if now < self.next_due {
            return None;
        }
        self.next_due += interval;
        let t = self.emitted as f64 * interval.as_secs_f64();
        self.emitted += 1;

        // 10 degree rocking at 0.1 Hz about y, plus a little 5 Hz vibration on z
        let angle = (10.0 * (2.0 * PI * 0.1 * t).sin()).to_radians();
        let x = angle.sin();
        let y = 0.02 * (2.0 * PI * 0.05 * t).cos();
        let z = angle.cos() + 0.01 * (2.0 * PI * 5.0 * t).sin();

        let mut payload = Vec::with_capacity(8);
        for g in [x, y, z] {
            let counts = (g * 1000.0).round().clamp(f64::from(i16::MIN), f64::from(i16::MAX));
            payload.extend_from_slice(&(counts as i16).to_le_bytes());
        }
        payload.extend_from_slice(&[0, 0]);
        RawFrame::new(self.source_id, &payload).ok()
    }

    fn wake_time(&self) -> Option<Instant> {
        self.interval.map(|_| self.next_due)
    }
}

#[derive(Debug, Default)]
struct BusState {
    inbound: VecDeque<Result<RawFrame, String>>,
    sent: Vec<RawFrame>,
    sensor: Option<SimulatedSensor>,
    fail_open: Option<String>,
    fail_send: Option<String>,
    poll_delay: Option<Duration>,
    open_count: usize,
    open_ends: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BusState>,
    ready: Condvar,
}

/// Handle on an in-process bus. Cloning yields another handle on the same bus.
#[derive(Debug, Clone, Default)]
pub struct VirtualBus {
    shared: Arc<Shared>,
}

impl VirtualBus {
    /// Creates an empty, silent bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bus hosting a simulated accelerometer publishing on `source_id`.
    pub fn with_simulated_sensor(source_id: u32) -> Self {
        let bus = Self::new();
        bus.shared.state.lock().sensor = Some(SimulatedSensor {
            source_id,
            interval: None,
            next_due: Instant::now(),
            emitted: 0,
        });
        bus
    }

    /// A transport end attached to this bus.
    pub fn transport(&self) -> VirtualTransport {
        VirtualTransport {
            bus: self.clone(),
            open: false,
        }
    }

    /// Queues a frame for the next poll.
    pub fn inject(&self, frame: RawFrame) {
        self.shared.state.lock().inbound.push_back(Ok(frame));
        self.shared.ready.notify_all();
    }

    /// Makes a future poll fail with a transport error, after the frames already queued.
    pub fn inject_failure(&self, message: impl Into<String>) {
        self.shared
            .state
            .lock()
            .inbound
            .push_back(Err(message.into()));
        self.shared.ready.notify_all();
    }

    /// Makes the next `open` fail.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        self.shared.state.lock().fail_open = Some(message.into());
    }

    /// Makes the next `send` fail.
    pub fn fail_next_send(&self, message: impl Into<String>) {
        self.shared.state.lock().fail_send = Some(message.into());
    }

    /// Makes every poll sleep for `delay` before looking at the bus, like an adapter
    /// whose reads block.
    pub fn set_poll_delay(&self, delay: Duration) {
        self.shared.state.lock().poll_delay = Some(delay);
    }

    /// Whether any transport on this bus is currently open.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open_ends > 0
    }

    /// Frames written to the bus so far.
    pub fn sent_frames(&self) -> Vec<RawFrame> {
        self.shared.state.lock().sent.clone()
    }

    /// How many times a transport on this bus has been opened.
    pub fn open_count(&self) -> usize {
        self.shared.state.lock().open_count
    }

    /// Frames injected but not yet polled.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().inbound.len()
    }
}

/// The [`Transport`] end of a [`VirtualBus`].
#[derive(Debug)]
pub struct VirtualTransport {
    bus: VirtualBus,
    open: bool,
}

impl VirtualTransport {
    fn ensure_open(&self) -> AppResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DaqError::Transport("virtual bus is not open".into()))
        }
    }
}

impl Transport for VirtualTransport {
    fn open(&mut self, config: &BusConfig) -> AppResult<()> {
        if self.open {
            return Ok(());
        }
        let mut state = self.bus.shared.state.lock();
        if let Some(message) = state.fail_open.take() {
            return Err(DaqError::Transport(message));
        }
        state.open_count += 1;
        state.open_ends += 1;
        self.open = true;
        tracing::info!(channel = %config.channel, "virtual bus opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn poll(&mut self, timeout: Duration) -> AppResult<Option<RawFrame>> {
        self.ensure_open()?;
        let delay = self.bus.shared.state.lock().poll_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let deadline = Instant::now() + timeout;
        let shared = &self.bus.shared;
        let mut state = shared.state.lock();
        loop {
            if let Some(item) = state.inbound.pop_front() {
                return item.map(Some).map_err(DaqError::Transport);
            }
            let now = Instant::now();
            if let Some(frame) = state.sensor.as_mut().and_then(|s| s.due_frame(now)) {
                return Ok(Some(frame));
            }
            if now >= deadline {
                return Ok(None);
            }
            let wake = state
                .sensor
                .as_ref()
                .and_then(SimulatedSensor::wake_time)
                .map_or(deadline, |due| due.min(deadline));
            shared.ready.wait_until(&mut state, wake);
        }
    }

    fn send(&mut self, frame: &RawFrame) -> AppResult<()> {
        self.ensure_open()?;
        let mut state = self.bus.shared.state.lock();
        if let Some(message) = state.fail_send.take() {
            return Err(DaqError::Transport(message));
        }
        if let Some(sensor) = state.sensor.as_mut() {
            sensor.configure(frame);
        }
        state.sent.push(frame.clone());
        drop(state);
        self.bus.shared.ready.notify_all();
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.bus.shared.state.lock().open_ends -= 1;
            tracing::info!("virtual bus closed");
        }
    }

    fn describe(&self) -> String {
        "virtual bus".to_string()
    }
}
