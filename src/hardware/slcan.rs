//! SLCAN (Lawicel ASCII) adapters on a serial port.
//!
//! Frames travel as carriage-return terminated ASCII lines:
//!
//! - `tIIILDD..` standard frame: 3 hex id digits, 1 length digit, 2 hex digits per byte
//! - `TIIIIIIIILDD..` extended frame: 8 hex id digits
//! - `z` / `Z` acknowledge a transmitted frame, a bare `\r` acknowledges a command
//! - `\x07` (BEL) reports an error
//!
//! The line codec is pure and always compiled; the port-backed [`SlcanTransport`] needs the
//! `instrument_serial` feature.

use crate::error::{AppResult, DaqError};
use crate::frame::{RawFrame, MAX_PAYLOAD};

/// Hex digits of the timestamp some adapters append to received frames.
const TIMESTAMP_DIGITS: usize = 4;

/// SLCAN `S` command digit for a bus bitrate, if the adapter supports it.
pub fn slcan_bitrate_code(bitrate: u32) -> Option<char> {
    let code = match bitrate {
        10_000 => '0',
        20_000 => '1',
        50_000 => '2',
        100_000 => '3',
        125_000 => '4',
        250_000 => '5',
        500_000 => '6',
        800_000 => '7',
        1_000_000 => '8',
        _ => return None,
    };
    Some(code)
}

/// Encodes a frame as an SLCAN transmit line, including the trailing `\r`.
pub fn encode_slcan_frame(frame: &RawFrame) -> String {
    let head = if frame.is_extended() {
        format!("T{:08X}", frame.id())
    } else {
        format!("t{:03X}", frame.id())
    };
    format!("{head}{}{}\r", frame.data().len(), frame.data_hex())
}

/// Parses one SLCAN line (without its `\r`).
///
/// Returns `Ok(None)` for acknowledgements, remote frames and empty lines, and a
/// `Parse` error for anything malformed.
pub fn parse_slcan_line(line: &str) -> AppResult<Option<RawFrame>> {
    let line = line.trim_matches(|c| c == '\r' || c == '\n');
    let Some(kind) = line.chars().next() else {
        return Ok(None);
    };
    let id_digits = match kind {
        't' => 3,
        'T' => 8,
        'z' | 'Z' | 'r' | 'R' => return Ok(None),
        other => {
            return Err(DaqError::Parse(format!(
                "unexpected SLCAN line kind {other:?} in {line:?}"
            )))
        }
    };
    if !line.is_ascii() || line.len() < 1 + id_digits + 1 {
        return Err(DaqError::Parse(format!("truncated SLCAN frame {line:?}")));
    }
    let id_text = &line[1..1 + id_digits];
    let id = u32::from_str_radix(id_text, 16)
        .map_err(|e| DaqError::Parse(format!("bad SLCAN identifier {id_text:?}: {e}")))?;
    let len_pos = 1 + id_digits;
    let len = line[len_pos..len_pos + 1]
        .parse::<usize>()
        .map_err(|e| DaqError::Parse(format!("bad SLCAN length in {line:?}: {e}")))?;
    if len > MAX_PAYLOAD {
        return Err(DaqError::Parse(format!("SLCAN length {len} exceeds 8")));
    }
    let payload = &line[len_pos + 1..];
    match payload.len().checked_sub(len * 2) {
        Some(0) => {}
        // optional 4-digit adapter timestamp
        Some(TIMESTAMP_DIGITS)
            if payload[len * 2..].bytes().all(|b| b.is_ascii_hexdigit()) => {}
        Some(_) => {
            return Err(DaqError::Parse(format!(
                "trailing characters after SLCAN payload in {line:?}"
            )))
        }
        None => return Err(DaqError::Parse(format!("short SLCAN payload in {line:?}"))),
    }
    let data = (0..len)
        .map(|i| {
            u8::from_str_radix(&payload[2 * i..2 * i + 2], 16)
                .map_err(|e| DaqError::Parse(format!("bad SLCAN byte in {line:?}: {e}")))
        })
        .collect::<AppResult<Vec<u8>>>()?;
    let frame = if kind == 'T' {
        RawFrame::new_extended(id, &data)
    } else {
        RawFrame::new(id, &data)
    };
    frame.map(Some).map_err(|e| DaqError::Parse(e.to_string()))
}

/// Splits complete `\r`-terminated lines off the front of `pending`.
///
/// BEL bytes are removed and counted; incomplete trailing data stays in `pending`.
pub fn take_lines(pending: &mut Vec<u8>) -> (Vec<String>, usize) {
    let errors = pending.iter().filter(|&&b| b == 0x07).count();
    pending.retain(|&b| b != 0x07);
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string());
    }
    (lines, errors)
}

#[cfg(feature = "instrument_serial")]
pub use port::{list_ports, SlcanTransport};

#[cfg(feature = "instrument_serial")]
mod port {
    use super::*;
    use crate::config::BusConfig;
    use crate::hardware::transport::Transport;
    use serialport::SerialPort;
    use std::collections::VecDeque;
    use std::io::{ErrorKind, Read, Write};
    use std::time::{Duration, Instant};

    /// Lists serial ports that could host an SLCAN adapter.
    pub fn list_ports() -> AppResult<Vec<String>> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .map_err(|e| DaqError::Transport(format!("unable to list serial ports: {e}")))
    }

    /// [`Transport`] over an SLCAN adapter.
    pub struct SlcanTransport {
        port: Option<Box<dyn SerialPort>>,
        channel: String,
        pending: Vec<u8>,
        frames: VecDeque<RawFrame>,
    }

    impl Default for SlcanTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SlcanTransport {
        /// A closed transport; the port is chosen by `open`.
        pub fn new() -> Self {
            Self {
                port: None,
                channel: String::new(),
                pending: Vec::with_capacity(256),
                frames: VecDeque::new(),
            }
        }

        fn port(&mut self) -> AppResult<&mut Box<dyn SerialPort>> {
            self.port
                .as_mut()
                .ok_or_else(|| DaqError::Transport("SLCAN port not open".into()))
        }

        fn write_line(&mut self, line: &str) -> AppResult<()> {
            let channel = self.channel.clone();
            self.port()?
                .write_all(line.as_bytes())
                .map_err(|e| DaqError::Transport(format!("write to {channel} failed: {e}")))
        }

        fn absorb_pending(&mut self) {
            let (lines, errors) = take_lines(&mut self.pending);
            if errors > 0 {
                tracing::warn!(channel = %self.channel, errors, "SLCAN adapter reported errors");
            }
            for line in lines {
                match parse_slcan_line(&line) {
                    Ok(Some(frame)) => self.frames.push_back(frame),
                    Ok(None) => {}
                    Err(e) => tracing::trace!(error = %e, "ignoring SLCAN line"),
                }
            }
        }
    }

    impl Transport for SlcanTransport {
        fn open(&mut self, config: &BusConfig) -> AppResult<()> {
            if self.port.is_some() {
                return Ok(());
            }
            let code = slcan_bitrate_code(config.bitrate).ok_or_else(|| {
                DaqError::Validation(format!("unsupported SLCAN bitrate {}", config.bitrate))
            })?;
            let port = serialport::new(&config.channel, config.serial_baud)
                .timeout(Duration::from_millis(50))
                .open()
                .map_err(|e| {
                    DaqError::Transport(format!("cannot open {}: {e}", config.channel))
                })?;
            self.port = Some(port);
            self.channel = config.channel.clone();
            self.pending.clear();
            self.frames.clear();

            let setup = ["C\r".to_string(), format!("S{code}\r"), "O\r".to_string()];
            for line in &setup {
                if let Err(e) = self.write_line(line) {
                    self.port = None;
                    return Err(e);
                }
            }
            tracing::info!(channel = %config.channel, bitrate = config.bitrate, "SLCAN channel opened");
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.port.is_some()
        }

        fn poll(&mut self, timeout: Duration) -> AppResult<Option<RawFrame>> {
            let deadline = Instant::now() + timeout;
            let mut chunk = [0u8; 256];
            loop {
                if let Some(frame) = self.frames.pop_front() {
                    return Ok(Some(frame));
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                let channel = self.channel.clone();
                let port = self.port()?;
                port.set_timeout(remaining)
                    .map_err(|e| DaqError::Transport(format!("{channel}: {e}")))?;
                match port.read(&mut chunk) {
                    Ok(0) => {
                        return Err(DaqError::Transport(format!("{channel}: adapter disconnected")))
                    }
                    Ok(n) => {
                        self.pending.extend_from_slice(&chunk[..n]);
                        self.absorb_pending();
                    }
                    Err(e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(DaqError::Transport(format!("read from {channel} failed: {e}")))
                    }
                }
            }
        }

        fn send(&mut self, frame: &RawFrame) -> AppResult<()> {
            let line = encode_slcan_frame(frame);
            self.write_line(&line)?;
            tracing::debug!(frame = %frame, "SLCAN frame sent");
            Ok(())
        }

        fn close(&mut self) {
            if self.port.is_some() {
                if let Err(e) = self.write_line("C\r") {
                    tracing::warn!(error = %e, "failed to close SLCAN channel cleanly");
                }
                self.port = None;
                tracing::info!(channel = %self.channel, "SLCAN channel closed");
            }
        }

        fn describe(&self) -> String {
            format!("slcan on {}", self.channel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_codes() {
        assert_eq!(slcan_bitrate_code(1_000_000), Some('8'));
        assert_eq!(slcan_bitrate_code(125_000), Some('4'));
        assert_eq!(slcan_bitrate_code(10_000), Some('0'));
        assert_eq!(slcan_bitrate_code(33_333), None);
    }

    #[test]
    fn encodes_standard_and_extended() {
        let f = RawFrame::new(0x61D, &[0x2B, 0x00, 0x18, 0x05, 0xE8, 0x03, 0x00, 0x00]).unwrap();
        assert_eq!(encode_slcan_frame(&f), "t61D82B001805E8030000\r");
        let e = RawFrame::new_extended(0x19D, &[0xAB]).unwrap();
        assert_eq!(encode_slcan_frame(&e), "T0000019D1AB\r");
        let empty = RawFrame::new(0x7, &[]).unwrap();
        assert_eq!(encode_slcan_frame(&empty), "t0070\r");
    }

    #[test]
    fn parses_received_frames() {
        let f = parse_slcan_line("t19D8C3FF4B0155FC0000").unwrap().unwrap();
        assert_eq!(f.id(), 0x19D);
        assert_eq!(f.data(), &[0xC3, 0xFF, 0x4B, 0x01, 0x55, 0xFC, 0x00, 0x00]);

        let e = parse_slcan_line("T123456782ABCD").unwrap().unwrap();
        assert!(e.is_extended());
        assert_eq!(e.id(), 0x1234_5678);
        assert_eq!(e.data(), &[0xAB, 0xCD]);
    }

    #[test]
    fn accepts_adapter_timestamp() {
        let f = parse_slcan_line("t1232AABB1F40").unwrap().unwrap();
        assert_eq!(f.id(), 0x123);
        assert_eq!(f.data(), &[0xAA, 0xBB]);
    }

    #[test]
    fn acknowledgements_are_not_frames() {
        for line in ["", "z", "Z", "r1230"] {
            assert!(parse_slcan_line(line).unwrap().is_none());
        }
    }

    #[test]
    fn malformed_lines() {
        for line in [
            "x", "t1", "t12G1AA", "t1239", "t1232AA", "t123XAA",
            "T1234567802ABCD", "t1231AAB", "t1231AA12", "t1231AA12GZ",
        ] {
            assert!(
                matches!(parse_slcan_line(line), Err(DaqError::Parse(_))),
                "{line:?}"
            );
        }
    }

    #[test]
    fn splits_stream_into_lines() {
        let mut pending = b"t1231AA\r\x07z\rt45".to_vec();
        let (lines, errors) = take_lines(&mut pending);
        assert_eq!(lines, vec!["t1231AA".to_string(), "z".to_string()]);
        assert_eq!(errors, 1);
        assert_eq!(pending, b"t45".to_vec());
    }
}
