//! Configuration system using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/tilt_daq.toml` by default)
//! 2. environment variables prefixed with `TILT_DAQ_`, using `__` between nesting levels
//!    (e.g. `TILT_DAQ_BUS__CHANNEL=/dev/ttyACM1`)
//!
//! Every field has a default, so a missing file or an empty one yields a usable setup
//! with the virtual bus.
//!
//! # Example
//! ```no_run
//! use tilt_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Bus backend: {:?}", settings.bus.backend);
//! # Ok::<(), tilt_daq::error::DaqError>(())
//! ```

use crate::command::validate_interval;
use crate::error::{AppResult, DaqError};
use crate::hardware::slcan_bitrate_code;
use crate::hardware::TransportKind;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/tilt_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Bus transport settings
    #[serde(default)]
    pub bus: BusConfig,
    /// Acquisition cadences and defaults
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Derived-channel filter settings
    #[serde(default)]
    pub filter: FilterConfig,
    /// Export settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Bus transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend, selected once when the transport is built
    #[serde(default)]
    pub backend: TransportKind,
    /// Backend channel: serial port for SLCAN, bus name for the virtual bus
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Bus bitrate in bit/s
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Serial line speed of the SLCAN adapter
    #[serde(default = "default_serial_baud")]
    pub serial_baud: u32,
    /// Longest time a single poll waits for a frame, in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Sampling interval used when none is given on the command line, in milliseconds
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_ms: u32,
    /// Period of the task moving queued samples into the buffer, in milliseconds
    #[serde(default = "default_drain_interval")]
    pub drain_interval_ms: u64,
    /// Period of the task recomputing derived channels, in milliseconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Longest wait for the reader thread to exit on stop, in milliseconds
    #[serde(default = "default_join_timeout")]
    pub join_timeout_ms: u64,
}

/// Filter configuration. The order is fixed at 5.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Low-pass (inclination) cutoff in Hz
    #[serde(default = "default_cutoff")]
    pub lowpass_cutoff_hz: f64,
    /// High-pass (dynamic acceleration) cutoff in Hz
    #[serde(default = "default_cutoff")]
    pub highpass_cutoff_hz: f64,
}

/// Export configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// CSV file written when an acquisition stops; no export when unset
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
}

// Default value functions
fn default_name() -> String {
    "tilt-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel() -> String {
    "vcan0".to_string()
}

fn default_bitrate() -> u32 {
    1_000_000
}

fn default_serial_baud() -> u32 {
    115_200
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_sampling_interval() -> u32 {
    1000
}

fn default_drain_interval() -> u64 {
    100
}

fn default_refresh_interval() -> u64 {
    500
}

fn default_join_timeout() -> u64 {
    2000
}

fn default_cutoff() -> f64 {
    1.0
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: TransportKind::default(),
            channel: default_channel(),
            bitrate: default_bitrate(),
            serial_baud: default_serial_baud(),
            poll_timeout_ms: default_poll_timeout(),
        }
    }
}

impl BusConfig {
    /// Poll timeout as a `Duration`.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: default_sampling_interval(),
            drain_interval_ms: default_drain_interval(),
            refresh_interval_ms: default_refresh_interval(),
            join_timeout_ms: default_join_timeout(),
        }
    }
}

impl AcquisitionConfig {
    /// Drain period as a `Duration`.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    /// Refresh period as a `Duration`.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Reader join bound as a `Duration`.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            lowpass_cutoff_hz: default_cutoff(),
            highpass_cutoff_hz: default_cutoff(),
        }
    }
}

impl Settings {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path; a missing file falls back to defaults
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(DaqError::from)
    }

    /// The provider stack: defaults, then the TOML file, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TILT_DAQ_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.bus.backend == TransportKind::Slcan {
            if self.bus.channel.trim().is_empty() {
                return Err(DaqError::Config("SLCAN backend needs a serial channel".into()));
            }
            if slcan_bitrate_code(self.bus.bitrate).is_none() {
                return Err(DaqError::Config(format!(
                    "Bitrate {} is not supported by SLCAN adapters",
                    self.bus.bitrate
                )));
            }
        }

        if self.bus.poll_timeout_ms == 0 {
            return Err(DaqError::Config("poll_timeout_ms must be positive".into()));
        }

        let acq = &self.acquisition;
        validate_interval(acq.sampling_interval_ms)
            .map_err(|e| DaqError::Config(e.to_string()))?;
        if acq.drain_interval_ms == 0 || acq.refresh_interval_ms == 0 {
            return Err(DaqError::Config(
                "drain and refresh intervals must be positive".into(),
            ));
        }
        if acq.drain_interval_ms > acq.refresh_interval_ms {
            return Err(DaqError::Config(format!(
                "drain interval ({} ms) must not exceed refresh interval ({} ms)",
                acq.drain_interval_ms, acq.refresh_interval_ms
            )));
        }
        if acq.join_timeout_ms < self.bus.poll_timeout_ms {
            return Err(DaqError::Config(format!(
                "join_timeout_ms ({}) must be at least poll_timeout_ms ({})",
                acq.join_timeout_ms, self.bus.poll_timeout_ms
            )));
        }

        for (name, cutoff) in [
            ("lowpass_cutoff_hz", self.filter.lowpass_cutoff_hz),
            ("highpass_cutoff_hz", self.filter.highpass_cutoff_hz),
        ] {
            if !(cutoff.is_finite() && cutoff > 0.0) {
                return Err(DaqError::Config(format!(
                    "{name} must be a positive frequency, got {cutoff}"
                )));
            }
        }

        Ok(())
    }
}
