//! The bus reader thread.
//!
//! The reader owns the transport for the length of a session. Its only interaction with
//! shared state is pushing decoded samples onto the FIFO and reading the stop flag, which
//! it checks once per poll. When it exits it hands the transport back through its join
//! handle, together with the reason it stopped. A reader that is detached instead of
//! joined closes the transport itself when it finally exits.

use crate::error::{AppResult, DaqError};
use crate::frame::{decode_frame, Sample};
use crate::hardware::Transport;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Granularity of the bounded join.
const JOIN_POLL: Duration = Duration::from_millis(5);

// Ownership of the transport once the reader loop ends. The reader moves RUNNING to
// EXITED; a detach moves RUNNING to DETACHED. Whoever loses closes the transport.
const RUNNING: u8 = 0;
const EXITED: u8 = 1;
const DETACHED: u8 = 2;

/// Everything the reader thread needs, passed explicitly.
pub struct ProducerContext {
    /// Transport on loan for the session.
    pub transport: Box<dyn Transport>,
    /// Cooperative stop flag.
    pub stop: Arc<AtomicBool>,
    /// FIFO towards the consumer side.
    pub queue: UnboundedSender<Sample>,
    /// Longest single poll.
    pub poll_timeout: Duration,
}

/// Frame accounting for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Frames received from the transport.
    pub frames: u64,
    /// Samples decoded and queued.
    pub samples: u64,
    /// Frames that did not decode (reserved ids, short payloads).
    pub skipped: u64,
}

/// What the reader thread returns.
pub struct ProducerExit {
    /// The transport, returned to the controller.
    pub transport: Box<dyn Transport>,
    /// Counters, or the transport error that ended the session.
    pub outcome: AppResult<ProducerStats>,
}

/// Result of a bounded join.
pub enum JoinOutcome {
    /// The reader exited in time.
    Exited(ProducerExit),
    /// The reader panicked; its transport is gone.
    Panicked,
    /// The reader did not exit in time and was detached; its transport is gone.
    TimedOut,
}

/// Handle on a running reader thread.
pub struct ProducerHandle {
    handle: JoinHandle<Option<ProducerExit>>,
    stop: Arc<AtomicBool>,
    handoff: Arc<AtomicU8>,
}

impl ProducerHandle {
    /// Asks the reader to exit after its current poll.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Whether the reader thread has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits at most `timeout` for the reader to exit.
    ///
    /// On timeout the reader is detached: it keeps the transport and closes it when its
    /// current poll returns.
    pub fn join_timeout(self, timeout: Duration) -> JoinOutcome {
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline && self.mark_detached() {
                return JoinOutcome::TimedOut;
            }
            std::thread::sleep(JOIN_POLL);
        }
        self.join()
    }

    /// Stops the reader without waiting for it. Its transport is closed either here, if
    /// the reader already exited, or by the reader on exit.
    pub fn detach(self) {
        self.request_stop();
        if self.mark_detached() {
            return;
        }
        if let JoinOutcome::Exited(mut exit) = self.join() {
            exit.transport.close();
        }
    }

    /// Claims the transport for the reader. False once the reader has exited.
    fn mark_detached(&self) -> bool {
        self.handoff
            .compare_exchange(RUNNING, DETACHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn join(self) -> JoinOutcome {
        match self.handle.join() {
            Ok(Some(exit)) => JoinOutcome::Exited(exit),
            Ok(None) => JoinOutcome::TimedOut,
            Err(_) => JoinOutcome::Panicked,
        }
    }
}

/// Starts the reader thread.
pub fn spawn_producer(ctx: ProducerContext) -> AppResult<ProducerHandle> {
    let stop = Arc::clone(&ctx.stop);
    let handoff = Arc::new(AtomicU8::new(RUNNING));
    let reader_handoff = Arc::clone(&handoff);
    let handle = std::thread::Builder::new()
        .name("can-reader".into())
        .spawn(move || hand_back(run(ctx), &reader_handoff))
        .map_err(DaqError::Io)?;
    Ok(ProducerHandle {
        handle,
        stop,
        handoff,
    })
}

/// Returns the exit to the joiner, or closes the transport when nobody will join.
fn hand_back(mut exit: ProducerExit, handoff: &AtomicU8) -> Option<ProducerExit> {
    match handoff.compare_exchange(RUNNING, EXITED, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Some(exit),
        Err(_) => {
            exit.transport.close();
            tracing::info!(
                transport = %exit.transport.describe(),
                "detached reader closed its transport"
            );
            None
        }
    }
}

fn run(ctx: ProducerContext) -> ProducerExit {
    let ProducerContext {
        mut transport,
        stop,
        queue,
        poll_timeout,
    } = ctx;
    let mut stats = ProducerStats::default();
    tracing::debug!(transport = %transport.describe(), "reader started");

    while !stop.load(Ordering::Acquire) {
        let frame = match transport.poll(poll_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(error = %e, frames = stats.frames, "bus read failed");
                return ProducerExit {
                    transport,
                    outcome: Err(e),
                };
            }
        };
        stats.frames += 1;
        match decode_frame(&frame) {
            Some(sample) => {
                if queue.send(sample).is_err() {
                    tracing::debug!("sample queue closed, reader exiting");
                    break;
                }
                stats.samples += 1;
            }
            None => {
                stats.skipped += 1;
                tracing::trace!(frame = %frame, "frame not decoded");
            }
        }
    }

    tracing::debug!(
        frames = stats.frames,
        samples = stats.samples,
        skipped = stats.skipped,
        "reader stopped"
    );
    ProducerExit {
        transport,
        outcome: Ok(stats),
    }
}
