//! Offline acquisition from a `candump` log.
//!
//! Logged frames go through the same decoder as live ones. The log's own timestamps are
//! not used: samples are stamped `start + n * interval`, as if the sensor had been
//! sampled at the configured interval.

use crate::command::{sampling_frequency_hz, validate_interval};
use crate::data::filter_engine::{DerivedChannels, FilterEngine, MIN_REFRESH_SAMPLES};
use crate::error::AppResult;
use crate::frame::{decode_at, parse_candump_line, Sample};
use chrono::{DateTime, Duration, Local};
use std::io::BufRead;

/// Samples recovered from a log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Decoded samples in log order.
    pub samples: Vec<Sample>,
    /// Lines that were not candump frames.
    pub unparsed_lines: usize,
    /// Frames that did not decode (reserved ids, short payloads).
    pub skipped_frames: usize,
}

impl Replay {
    /// Derived channels for the replayed samples, if there are at least two.
    pub fn derive(&self, engine: &FilterEngine, interval_ms: u32) -> Option<DerivedChannels> {
        (self.samples.len() >= MIN_REFRESH_SAMPLES)
            .then(|| engine.compute(&self.samples, sampling_frequency_hz(interval_ms)))
    }
}

/// Reads a candump log, decoding every frame line.
pub fn replay_candump<R: BufRead>(
    reader: R,
    interval_ms: u32,
    start: DateTime<Local>,
) -> AppResult<Replay> {
    validate_interval(interval_ms)?;
    let step = i64::from(interval_ms);
    let mut replay = Replay::default();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame = match parse_candump_line(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(line = number + 1, error = %e, "skipping log line");
                replay.unparsed_lines += 1;
                continue;
            }
        };
        let Some(timestamp) = sample_timestamp(start, step, replay.samples.len()) else {
            tracing::warn!(line = number + 1, "replay timestamp out of range");
            replay.skipped_frames += 1;
            continue;
        };
        match decode_at(&frame, timestamp) {
            Some(sample) => replay.samples.push(sample),
            None => replay.skipped_frames += 1,
        }
    }

    tracing::info!(
        samples = replay.samples.len(),
        unparsed = replay.unparsed_lines,
        skipped = replay.skipped_frames,
        "candump log replayed"
    );
    Ok(replay)
}

/// `start + index * step_ms`, or `None` when it leaves chrono's range.
fn sample_timestamp(
    start: DateTime<Local>,
    step_ms: i64,
    index: usize,
) -> Option<DateTime<Local>> {
    let offset = i64::try_from(index).ok()?.checked_mul(step_ms)?;
    start.checked_add_signed(Duration::try_milliseconds(offset)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LOG: &str = "\
(1700000000.000100) can0 19D [8] C3 FF 4B 01 55 FC 00 00
(1700000000.010100) can0 71D [8] 00 00 00 00 00 00 00 00
garbage line
(1700000000.020100) can0 19D [2] 01 02

(1700000000.030100) can0 19D [6] 00 00 00 00 E8 03
";

    #[test]
    fn decodes_frames_and_counts_the_rest() {
        let start = Local.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let replay = replay_candump(LOG.as_bytes(), 10, start).unwrap();
        assert_eq!(replay.samples.len(), 2);
        assert_eq!(replay.unparsed_lines, 1);
        assert_eq!(replay.skipped_frames, 2);

        let first = &replay.samples[0];
        assert_eq!((first.x, first.y, first.z), (-0.061, 0.331, -0.939));
        assert_eq!(first.timestamp, start);
        assert_eq!(replay.samples[1].timestamp, start + Duration::milliseconds(10));
        assert_eq!(replay.samples[1].z, 1.0);
    }

    #[test]
    fn derives_only_with_two_samples() {
        let start = Local::now();
        let one = replay_candump("can0 19D [6] 00 00 00 00 E8 03\n".as_bytes(), 10, start)
            .unwrap();
        assert!(one.derive(&FilterEngine::default(), 10).is_none());

        let two = replay_candump(LOG.as_bytes(), 10, start).unwrap();
        let derived = two.derive(&FilterEngine::default(), 10).unwrap();
        assert_eq!(derived.len(), 2);
    }

    #[test]
    fn timestamps_out_of_range_are_skipped() {
        let start = Local::now();
        assert_eq!(sample_timestamp(start, 10, 3), Some(start + Duration::milliseconds(30)));
        assert_eq!(sample_timestamp(start, 2000, usize::MAX), None);
        assert_eq!(sample_timestamp(start, 2000, 1 << 50), None);

        let far = DateTime::<chrono::Utc>::MAX_UTC.with_timezone(&Local) - Duration::days(1);
        let replay = replay_candump(LOG.as_bytes(), 10, far).unwrap();
        assert_eq!(replay.samples.len(), 2);
        assert!(replay.samples[1].timestamp > far);

        let edge = DateTime::<chrono::Utc>::MAX_UTC.with_timezone(&Local)
            - Duration::milliseconds(5);
        let replay = replay_candump(LOG.as_bytes(), 10, edge).unwrap();
        assert_eq!(replay.samples.len(), 1);
        assert_eq!(replay.skipped_frames, 3);
    }

    #[test]
    fn rejects_bad_interval() {
        assert!(replay_candump("".as_bytes(), 0, Local::now())
            .unwrap_err()
            .is_validation());
    }
}
