//! Derivation of inclination, dynamic acceleration and tilt angles from raw samples.
//!
//! Each refresh recomputes every channel over the *whole* sample history: the filters are
//! re-run from zero state on the full sequence instead of being advanced incrementally.
//! Refresh cost therefore grows linearly with session length. The benefit is that the
//! output is a pure function of the buffer contents and the sampling rate, so two
//! refreshes over the same buffer are bit-identical and the export can simply reuse the
//! last result.
//!
//! There is no minimum length: a causal zero-state filter is defined for any number of
//! samples, and a sequence shorter than the filter transient carries just that leading
//! transient. Filtering a prefix yields exactly the prefix of filtering the longer
//! sequence.

use super::iir_filter::ButterworthSpec;
use crate::frame::Sample;

/// Fewest buffered samples for which a live refresh is worth running.
pub const MIN_REFRESH_SAMPLES: usize = 2;

/// Channels derived from a sample sequence, one value per sample.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedChannels {
    /// Low-pass x (static / gravity component), in g.
    pub x_incl: Vec<f64>,
    /// Low-pass y, in g.
    pub y_incl: Vec<f64>,
    /// Low-pass z, in g.
    pub z_incl: Vec<f64>,
    /// High-pass x (dynamic component), in g.
    pub x_acc: Vec<f64>,
    /// High-pass y, in g.
    pub y_acc: Vec<f64>,
    /// High-pass z, in g.
    pub z_acc: Vec<f64>,
    /// Tilt in the xz plane, degrees.
    pub tetha_xz: Vec<f64>,
    /// Tilt in the yz plane, degrees.
    pub tetha_yz: Vec<f64>,
}

impl DerivedChannels {
    /// Number of samples the channels were derived from.
    pub fn len(&self) -> usize {
        self.x_incl.len()
    }

    /// True when derived from an empty sequence.
    pub fn is_empty(&self) -> bool {
        self.x_incl.is_empty()
    }

    /// The eight derived values for sample `index`, in export column order.
    pub fn row(&self, index: usize) -> Option<[f64; 8]> {
        Some([
            *self.x_incl.get(index)?,
            *self.y_incl.get(index)?,
            *self.z_incl.get(index)?,
            *self.x_acc.get(index)?,
            *self.y_acc.get(index)?,
            *self.z_acc.get(index)?,
            *self.tetha_xz.get(index)?,
            *self.tetha_yz.get(index)?,
        ])
    }
}

/// Batch filter engine applying one low-pass and one high-pass spec to every axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterEngine {
    lowpass: ButterworthSpec,
    highpass: ButterworthSpec,
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl FilterEngine {
    /// Engine with order-5 Butterworth filters at the given cutoffs (Hz).
    pub fn new(lowpass_cutoff_hz: f64, highpass_cutoff_hz: f64) -> Self {
        Self {
            lowpass: ButterworthSpec::lowpass(lowpass_cutoff_hz),
            highpass: ButterworthSpec::highpass(highpass_cutoff_hz),
        }
    }

    /// The low-pass specification.
    pub fn lowpass(&self) -> &ButterworthSpec {
        &self.lowpass
    }

    /// The high-pass specification.
    pub fn highpass(&self) -> &ButterworthSpec {
        &self.highpass
    }

    /// Derives all channels from `samples` recorded at `sampling_frequency` Hz.
    pub fn compute(&self, samples: &[Sample], sampling_frequency: f64) -> DerivedChannels {
        let x: Vec<f64> = samples.iter().map(|s| s.x).collect();
        let y: Vec<f64> = samples.iter().map(|s| s.y).collect();
        let z: Vec<f64> = samples.iter().map(|s| s.z).collect();

        let x_incl = self.lowpass.apply(&x, sampling_frequency);
        let y_incl = self.lowpass.apply(&y, sampling_frequency);
        let z_incl = self.lowpass.apply(&z, sampling_frequency);

        let tetha_xz = tilt_degrees(&x_incl, &z_incl);
        let tetha_yz = tilt_degrees(&y_incl, &z_incl);

        DerivedChannels {
            x_acc: self.highpass.apply(&x, sampling_frequency),
            y_acc: self.highpass.apply(&y, sampling_frequency),
            z_acc: self.highpass.apply(&z, sampling_frequency),
            x_incl,
            y_incl,
            z_incl,
            tetha_xz,
            tetha_yz,
        }
    }
}

/// Elementwise `atan2(a, z)` in degrees.
fn tilt_degrees(a: &[f64], z: &[f64]) -> Vec<f64> {
    a.iter()
        .zip(z)
        .map(|(a, z)| a.atan2(*z).to_degrees())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn samples(values: &[(f64, f64, f64)]) -> Vec<Sample> {
        let now = Local::now();
        values
            .iter()
            .map(|&(x, y, z)| Sample {
                timestamp: now,
                source_id: 0x1A5,
                x,
                y,
                z,
            })
            .collect()
    }

    fn wobble(len: usize) -> Vec<Sample> {
        let values: Vec<(f64, f64, f64)> = (0..len)
            .map(|i| {
                let t = i as f64 * 0.01;
                (
                    0.1 + 0.05 * (t * 37.0).sin(),
                    -0.2 + 0.03 * (t * 11.0).cos(),
                    -0.97 + 0.01 * (t * 53.0).sin(),
                )
            })
            .collect();
        samples(&values)
    }

    #[test]
    fn passthrough_for_non_positive_rate() {
        let input = wobble(50);
        for fs in [0.0, -1.0] {
            let out = FilterEngine::default().compute(&input, fs);
            let x: Vec<f64> = input.iter().map(|s| s.x).collect();
            let y: Vec<f64> = input.iter().map(|s| s.y).collect();
            let z: Vec<f64> = input.iter().map(|s| s.z).collect();
            assert_eq!(out.x_incl, x);
            assert_eq!(out.y_incl, y);
            assert_eq!(out.z_incl, z);
            assert_eq!(out.x_acc, x);
            assert_eq!(out.y_acc, y);
            assert_eq!(out.z_acc, z);
        }
    }

    #[test]
    fn recompute_is_bit_identical() {
        let input = wobble(500);
        let engine = FilterEngine::default();
        let first = engine.compute(&input, 100.0);
        let second = engine.compute(&input, 100.0);
        assert_eq!(first, second);
        for (a, b) in first.tetha_xz.iter().zip(&second.tetha_xz) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn prefix_of_longer_sequence_matches_short_run() {
        let input = wobble(400);
        let engine = FilterEngine::default();
        let long = engine.compute(&input, 100.0);
        for n in [1, 3, 10] {
            let short = engine.compute(&input[..n], 100.0);
            assert_eq!(short.len(), n);
            assert_eq!(short.x_incl[..], long.x_incl[..n]);
            assert_eq!(short.z_acc[..], long.z_acc[..n]);
        }
    }

    #[test]
    fn angles_follow_lowpass_channels() {
        let out = FilterEngine::default().compute(&wobble(200), 100.0);
        for i in 0..out.len() {
            let expected = out.x_incl[i].atan2(out.z_incl[i]).to_degrees();
            assert_eq!(out.tetha_xz[i], expected);
        }
    }

    #[test]
    fn static_tilt_converges_to_geometry() {
        // 30 degrees in the xz plane, level in yz
        let (s, c) = 30f64.to_radians().sin_cos();
        let input = samples(&vec![(s, 0.0, c); 3000]);
        let out = FilterEngine::default().compute(&input, 100.0);
        let last = out.row(2999).unwrap();
        assert!((last[6] - 30.0).abs() < 1e-6);
        assert!(last[7].abs() < 1e-6);
        assert!(last[3].abs() < 1e-9);
    }

    #[test]
    fn empty_sequence() {
        let out = FilterEngine::default().compute(&[], 100.0);
        assert!(out.is_empty());
        assert!(out.row(0).is_none());
    }
}
