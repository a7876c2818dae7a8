//! Bus frames and accelerometer sample decoding.
//!
//! The sensor streams one frame per sampling period. The first six payload bytes carry
//! the x, y and z accelerations as little-endian signed 16-bit words in milli-g:
//!
//! ```text
//! byte   0    1    2    3    4    5    6    7
//!       [x lo x hi y lo y hi z lo z hi  -    - ]
//! ```
//!
//! Two identifiers on the same bus carry unrelated traffic (`0x29D`, `0x71D`) and are never
//! decoded. Frames that are too short are skipped silently; the decoder never raises an
//! error to its caller.
//!
//! Samples are timestamped with the wall clock at decode time. The frame carries no time
//! of its own, so timestamps inherit the precision of the host clock and are not
//! guaranteed monotonic if the clock is adjusted during a session.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Identifiers that share the bus with the accelerometer and must not be decoded.
pub const RESERVED_IDS: [u32; 2] = [0x29D, 0x71D];

/// Largest payload of a classic CAN frame.
pub const MAX_PAYLOAD: usize = 8;

/// Largest 29-bit extended identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Largest 11-bit standard identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Scale from raw milli-g counts to g.
const COUNTS_PER_G: f64 = 1000.0;

/// One frame as read from or written to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    id: u32,
    extended: bool,
    data: Vec<u8>,
}

impl RawFrame {
    /// Builds a frame, choosing the extended format when `id` does not fit 11 bits.
    pub fn new(id: u32, data: &[u8]) -> AppResult<Self> {
        if id > MAX_EXTENDED_ID {
            return Err(DaqError::Validation(format!(
                "identifier {id:X} exceeds 29 bits"
            )));
        }
        if data.len() > MAX_PAYLOAD {
            return Err(DaqError::Validation(format!(
                "payload of {} bytes exceeds {MAX_PAYLOAD}",
                data.len()
            )));
        }
        Ok(Self {
            id,
            extended: id > MAX_STANDARD_ID,
            data: data.to_vec(),
        })
    }

    /// Builds a frame in the extended (29-bit) format regardless of the identifier value.
    pub fn new_extended(id: u32, data: &[u8]) -> AppResult<Self> {
        let mut frame = Self::new(id, data)?;
        frame.extended = true;
        Ok(frame)
    }

    /// Arbitration identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the frame uses a 29-bit identifier.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload as contiguous uppercase hex, e.g. `2B001805E8030000`.
    pub fn data_hex(&self) -> String {
        self.data.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for RawFrame {
    /// Formats in the `cansend` notation `61D#2B001805E8030000`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}#{}", self.id, self.data_hex())
        } else {
            write!(f, "{:03X}#{}", self.id, self.data_hex())
        }
    }
}

/// One tri-axial acceleration reading in g.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Host wall-clock time at decode.
    pub timestamp: DateTime<Local>,
    /// Identifier of the frame the sample came from.
    pub source_id: u32,
    /// Acceleration along x, in g.
    pub x: f64,
    /// Acceleration along y, in g.
    pub y: f64,
    /// Acceleration along z, in g.
    pub z: f64,
}

/// Returns true when `id` belongs to traffic the decoder must ignore.
pub fn is_reserved(id: u32) -> bool {
    RESERVED_IDS.contains(&id)
}

/// Decodes a frame, timestamping the sample with the current wall clock.
pub fn decode_frame(frame: &RawFrame) -> Option<Sample> {
    decode_at(frame, Local::now())
}

/// Decodes a frame with an explicit timestamp.
///
/// Returns `None` for reserved identifiers and payloads shorter than six bytes.
pub fn decode_at(frame: &RawFrame, timestamp: DateTime<Local>) -> Option<Sample> {
    if is_reserved(frame.id()) {
        return None;
    }
    let data = frame.data();
    if data.len() < 6 {
        return None;
    }
    Some(Sample {
        timestamp,
        source_id: frame.id(),
        x: axis_value(data[0], data[1]),
        y: axis_value(data[2], data[3]),
        z: axis_value(data[4], data[5]),
    })
}

/// Combines a byte-swapped pair into a signed milli-g count and scales it to g.
fn axis_value(lo: u8, hi: u8) -> f64 {
    f64::from(i16::from_le_bytes([lo, hi])) / COUNTS_PER_G
}

static CANDUMP_LINE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(
        r"^\s*(?:\(\S+\)\s+)?(?P<iface>\S+)\s+(?P<id>[0-9A-Fa-f]{1,8})\s+\[(?P<len>\d)\]\s*(?P<data>(?:[0-9A-Fa-f]{2}\s*)*)$",
    )
    .unwrap()
});

/// Parses one line of `candump` output, e.g. `can0 61D [8] C3 FF 4B 01 55 FC 00 00`.
///
/// An optional leading `(timestamp)` column is accepted. The bracketed length is
/// informational; the listed bytes are authoritative.
pub fn parse_candump_line(line: &str) -> AppResult<RawFrame> {
    let caps = CANDUMP_LINE
        .captures(line)
        .ok_or_else(|| DaqError::Parse(format!("not a candump line: {line:?}")))?;
    let id_text = &caps["id"];
    let id = u32::from_str_radix(id_text, 16)
        .map_err(|e| DaqError::Parse(format!("bad identifier {id_text:?}: {e}")))?;
    let data = caps["data"]
        .split_whitespace()
        .map(|b| {
            u8::from_str_radix(b, 16).map_err(|e| DaqError::Parse(format!("bad byte {b:?}: {e}")))
        })
        .collect::<AppResult<Vec<u8>>>()?;
    let frame = if id_text.len() > 3 {
        RawFrame::new_extended(id, &data)
    } else {
        RawFrame::new(id, &data)
    };
    frame.map_err(|e| DaqError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: &[u8]) -> RawFrame {
        RawFrame::new(id, data).unwrap()
    }

    #[test]
    fn decodes_reference_payload() {
        let f = frame(0x1A5, &[0xC3, 0xFF, 0x4B, 0x01, 0x55, 0xFC, 0x00, 0x00]);
        let s = decode_frame(&f).unwrap();
        assert_eq!(s.source_id, 0x1A5);
        assert_eq!(s.x, -0.061);
        assert_eq!(s.y, 0.331);
        assert_eq!(s.z, -0.939);
    }

    #[test]
    fn reserved_ids_never_decode() {
        let payload = [0xC3, 0xFF, 0x4B, 0x01, 0x55, 0xFC, 0x00, 0x00];
        for id in RESERVED_IDS {
            assert!(decode_frame(&frame(id, &payload)).is_none());
        }
        assert!(decode_frame(&frame(0x29E, &payload)).is_some());
    }

    #[test]
    fn short_payload_is_skipped() {
        assert!(decode_frame(&frame(0x100, &[0x01, 0x02, 0x03, 0x04, 0x05])).is_none());
        assert!(decode_frame(&frame(0x100, &[])).is_none());
        let six = decode_frame(&frame(0x100, &[0xE8, 0x03, 0x00, 0x00, 0x18, 0xFC])).unwrap();
        assert_eq!((six.x, six.y, six.z), (1.0, 0.0, -1.0));
    }

    #[test]
    fn sign_boundaries() {
        let s = decode_frame(&frame(0x100, &[0xFF, 0x7F, 0x00, 0x80, 0xFF, 0xFF])).unwrap();
        assert_eq!(s.x, 32.767);
        assert_eq!(s.y, -32.768);
        assert_eq!(s.z, -0.001);
    }

    #[test]
    fn decode_at_keeps_given_timestamp() {
        let ts = Local::now() - chrono::Duration::seconds(30);
        let s = decode_at(&frame(0x100, &[0; 6]), ts).unwrap();
        assert_eq!(s.timestamp, ts);
    }

    #[test]
    fn rejects_oversized_frames() {
        assert!(RawFrame::new(0x100, &[0; 9]).is_err());
        assert!(RawFrame::new(0x2000_0000, &[]).is_err());
        assert!(RawFrame::new(0x800, &[]).unwrap().is_extended());
        assert!(!RawFrame::new(0x7FF, &[]).unwrap().is_extended());
    }

    #[test]
    fn display_uses_cansend_notation() {
        let f = frame(0x61D, &[0x2B, 0x00, 0x18, 0x05, 0xE8, 0x03, 0x00, 0x00]);
        assert_eq!(f.to_string(), "61D#2B001805E8030000");
        let e = RawFrame::new_extended(0x61D, &[0xAB]).unwrap();
        assert_eq!(e.to_string(), "0000061D#AB");
    }

    #[test]
    fn parses_candump_lines() {
        let f = parse_candump_line("can0 1A5 [8] C3 FF 4B 01 55 FC 00 00").unwrap();
        assert_eq!(f.id(), 0x1A5);
        assert_eq!(f.data(), &[0xC3, 0xFF, 0x4B, 0x01, 0x55, 0xFC, 0x00, 0x00]);

        let f = parse_candump_line("(1697040000.123456)  vcan0  12345678   [2]  01 02").unwrap();
        assert_eq!(f.id(), 0x1234_5678);
        assert!(f.is_extended());

        let f = parse_candump_line("  can1  29D   [0]").unwrap();
        assert!(f.data().is_empty());
    }

    #[test]
    fn malformed_candump_lines_are_parse_errors() {
        for line in ["", "garbage", "can0 61D 8 01 02", "can0 XYZ [1] 01", "can0 61D [1] 0"] {
            match parse_candump_line(line) {
                Err(DaqError::Parse(_)) => {}
                other => panic!("expected parse error for {line:?}, got {other:?}"),
            }
        }
    }
}
