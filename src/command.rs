//! Device commands: the sampling-interval configuration frame and operator-typed frames.
//!
//! The sensor is configured with a single 8-byte frame sent to `0x61D`:
//!
//! ```text
//! 2B 00 18 05 | MSB LSB | 00 00
//! ```
//!
//! where the interval (milliseconds, `1..=2000`) is written as four uppercase hex digits,
//! the first two being taken as the "lsb" field and the last two as the "msb" field. The
//! frame therefore carries the interval as a little-endian word: 1000 ms (`03E8`) becomes
//! `2B001805E8030000`.

use crate::error::{AppResult, DaqError};
use crate::frame::{RawFrame, MAX_PAYLOAD, MAX_STANDARD_ID};
use crate::validation::{is_hex_field, is_in_range};
use std::ops::RangeInclusive;

/// Identifier of the device that accepts the configuration command.
pub const COMMAND_TARGET_ID: u32 = 0x61D;

/// Accepted sampling intervals in milliseconds.
pub const SAMPLING_INTERVAL_MS: RangeInclusive<u32> = 1..=2000;

const COMMAND_PREFIX: &str = "2B001805";
const COMMAND_SUFFIX: &str = "0000";

/// An encoded configuration command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingCommand {
    /// Interval the command configures, in milliseconds.
    pub interval_ms: u32,
    /// Hex text of the 8-byte payload.
    pub payload_hex: String,
}

impl SamplingCommand {
    /// Builds the command for `interval_ms`.
    pub fn new(interval_ms: u32) -> AppResult<Self> {
        Ok(Self {
            interval_ms,
            payload_hex: encode_sampling_command(interval_ms)?,
        })
    }

    /// The frame to send to the device.
    pub fn to_frame(&self) -> AppResult<RawFrame> {
        RawFrame::new(COMMAND_TARGET_ID, &hex_bytes(&self.payload_hex)?)
    }

    /// Sampling rate implied by the interval, in Hz.
    pub fn sampling_frequency_hz(&self) -> f64 {
        sampling_frequency_hz(self.interval_ms)
    }
}

/// Returns the hex payload configuring the device for `interval_ms`.
pub fn encode_sampling_command(interval_ms: u32) -> AppResult<String> {
    validate_interval(interval_ms)?;
    let hex = format!("{interval_ms:04X}");
    let (lsb, msb) = hex.split_at(2);
    Ok(format!("{COMMAND_PREFIX}{msb}{lsb}{COMMAND_SUFFIX}"))
}

/// Rejects intervals outside `1..=2000` ms.
pub fn validate_interval(interval_ms: u32) -> AppResult<()> {
    is_in_range(interval_ms, SAMPLING_INTERVAL_MS).map_err(|_| {
        DaqError::Validation(format!(
            "sampling interval {interval_ms} ms outside {}..={} ms",
            SAMPLING_INTERVAL_MS.start(),
            SAMPLING_INTERVAL_MS.end()
        ))
    })
}

/// Sampling rate in Hz for an interval in milliseconds.
pub fn sampling_frequency_hz(interval_ms: u32) -> f64 {
    1000.0 / f64::from(interval_ms)
}

fn hex_bytes(text: &str) -> AppResult<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(DaqError::Validation(format!("odd-length hex payload {text:?}")));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|e| DaqError::Validation(format!("bad hex payload {text:?}: {e}")))
        })
        .collect()
}

/// Builds a standard frame from operator-entered text fields.
///
/// * `address` - one to three hex digits, `000..=7FF`.
/// * `dlc` - payload length; clamped to `0..=8`, and taken as 8 when it is not a number.
/// * `bytes` - one text field per payload byte. Only the first `dlc` fields are used; a
///   missing or empty field stands for `00`, a single digit is left-padded.
pub fn parse_manual_frame(address: &str, dlc: &str, bytes: &[&str]) -> AppResult<RawFrame> {
    let address = address.trim();
    if address.is_empty() {
        return Err(DaqError::Validation("address is missing".into()));
    }
    is_hex_field(address, 3)
        .map_err(|e| DaqError::Validation(format!("address {address:?}: {e}")))?;
    let id = u32::from_str_radix(address, 16)
        .map_err(|e| DaqError::Validation(format!("address {address:?}: {e}")))?;
    if id > MAX_STANDARD_ID {
        return Err(DaqError::Validation(format!(
            "address {id:03X} outside 000..=7FF"
        )));
    }

    let len = dlc
        .trim()
        .parse::<i64>()
        .map(|n| n.clamp(0, MAX_PAYLOAD as i64) as usize)
        .unwrap_or(MAX_PAYLOAD);

    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        let field = bytes.get(i).map(|b| b.trim()).unwrap_or("");
        is_hex_field(field, 2)
            .map_err(|e| DaqError::Validation(format!("byte {} {field:?}: {e}", i + 1)))?;
        let value = if field.is_empty() {
            0
        } else {
            u8::from_str_radix(field, 16)
                .map_err(|e| DaqError::Validation(format!("byte {} {field:?}: {e}", i + 1)))?
        };
        data.push(value);
    }
    RawFrame::new(id, &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reference_interval() {
        assert_eq!(encode_sampling_command(1000).unwrap(), "2B001805E8030000");
    }

    #[test]
    fn interval_bounds() {
        assert_eq!(encode_sampling_command(1).unwrap(), "2B00180501000000");
        assert_eq!(encode_sampling_command(2000).unwrap(), "2B001805D0070000");
        for bad in [0, 2001, u32::MAX] {
            assert!(matches!(
                encode_sampling_command(bad),
                Err(DaqError::Validation(_))
            ));
        }
    }

    #[test]
    fn command_frame_targets_device() {
        let cmd = SamplingCommand::new(10).unwrap();
        let frame = cmd.to_frame().unwrap();
        assert_eq!(frame.id(), COMMAND_TARGET_ID);
        assert!(!frame.is_extended());
        assert_eq!(frame.data(), &[0x2B, 0x00, 0x18, 0x05, 0x0A, 0x00, 0x00, 0x00]);
        assert_eq!(cmd.sampling_frequency_hz(), 100.0);
    }

    #[test]
    fn frequency_from_interval() {
        assert_eq!(sampling_frequency_hz(1000), 1.0);
        assert_eq!(sampling_frequency_hz(4), 250.0);
    }

    #[test]
    fn manual_frame_fills_and_pads() {
        let f = parse_manual_frame("61d", "4", &["2b", "", "5"]).unwrap();
        assert_eq!(f.id(), 0x61D);
        assert_eq!(f.data(), &[0x2B, 0x00, 0x05, 0x00]);
    }

    #[test]
    fn manual_frame_dlc_is_clamped() {
        assert_eq!(parse_manual_frame("1", "12", &[]).unwrap().data().len(), 8);
        assert_eq!(parse_manual_frame("1", "-3", &["FF"]).unwrap().data().len(), 0);
        assert_eq!(parse_manual_frame("1", "x", &[]).unwrap().data().len(), 8);
    }

    #[test]
    fn manual_frame_rejects_bad_fields() {
        for (addr, dlc, bytes) in [
            ("", "1", vec!["00"]),
            ("800", "1", vec!["00"]),
            ("G1", "1", vec!["00"]),
            ("1FFF", "1", vec!["00"]),
            ("61D", "2", vec!["00", "100"]),
            ("61D", "1", vec!["ZZ"]),
        ] {
            let err = parse_manual_frame(addr, dlc, &bytes).unwrap_err();
            assert!(err.is_validation(), "{addr:?} {bytes:?}: {err}");
        }
    }

    #[test]
    fn unused_byte_fields_are_ignored() {
        let f = parse_manual_frame("100", "1", &["01", "not-hex"]).unwrap();
        assert_eq!(f.data(), &[0x01]);
    }
}
