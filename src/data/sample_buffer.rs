//! Ordered sample history of one acquisition session.
use crate::frame::Sample;
use tokio::sync::mpsc::UnboundedReceiver;

/// Append-only, insertion-ordered sample store.
///
/// Owned by the acquisition controller and only written from its context: samples reach
/// it through [`SampleBuffer::drain_from`], never directly from the reader thread.
#[derive(Debug, Default, Clone)]
pub struct SampleBuffer {
    samples: Vec<Sample>,
}

impl SampleBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one sample.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Moves every sample currently queued on `queue` into the buffer, in queue order.
    ///
    /// Returns how many samples were moved. Does not wait for new samples.
    pub fn drain_from(&mut self, queue: &mut UnboundedReceiver<Sample>) -> usize {
        let before = self.samples.len();
        while let Ok(sample) = queue.try_recv() {
            self.samples.push(sample);
        }
        self.samples.len() - before
    }

    /// Empties the buffer for a new session.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Number of buffered samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when nothing has been buffered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Read-only view in arrival order.
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }
}
