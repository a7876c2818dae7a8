//! Fixed-order Butterworth IIR filters.
//!
//! The design is the classic digital Butterworth: analog prototype poles on the unit
//! circle, cutoff pre-warped with `tan`, and mapped to the z-plane with the bilinear
//! transform. All zeros land on `z = -1` (low-pass) or `z = +1` (high-pass).
//!
//! The resulting transfer function is run as a cascade of `biquad` sections (two
//! second-order sections and one first-order section for order 5). This is the same
//! transfer function as the expanded polynomial form, but it stays well conditioned at
//! the very low normalised cutoffs used here (1 Hz at up to 1 kHz sampling).
//!
//! Every call to [`ButterworthSpec::apply`] starts from zero state and runs over the whole
//! input, so the output is a pure function of `(input, sampling rate)`.

use biquad::{Biquad, Coefficients, DirectForm2Transposed};
use num_complex::Complex64;
use serde::Deserialize;
use std::f64::consts::PI;

/// Filter order used for every derived channel.
pub const BUTTERWORTH_ORDER: usize = 5;

/// Poles with an imaginary part below this are treated as real.
const REAL_POLE_EPS: f64 = 1e-12;

/// The type of IIR filter to apply.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    /// Keeps frequencies below the cutoff (gravity / inclination component).
    Lowpass,
    /// Keeps frequencies above the cutoff (dynamic acceleration component).
    Highpass,
}

/// A Butterworth filter specification; coefficients are derived per sampling rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ButterworthSpec {
    /// Low- or high-pass.
    pub filter_type: FilterType,
    /// Cutoff frequency in Hz.
    pub cutoff_hz: f64,
    /// Number of poles.
    pub order: usize,
}

impl ButterworthSpec {
    /// Order-5 low-pass with the given cutoff.
    pub fn lowpass(cutoff_hz: f64) -> Self {
        Self {
            filter_type: FilterType::Lowpass,
            cutoff_hz,
            order: BUTTERWORTH_ORDER,
        }
    }

    /// Order-5 high-pass with the given cutoff.
    pub fn highpass(cutoff_hz: f64) -> Self {
        Self {
            filter_type: FilterType::Highpass,
            cutoff_hz,
            order: BUTTERWORTH_ORDER,
        }
    }

    /// True when the filter cannot be realised at `fs` and must pass data through.
    ///
    /// That is the case for a non-positive or non-finite sampling rate, a zero Nyquist
    /// frequency, or a cutoff at or above Nyquist.
    pub fn is_passthrough(&self, fs: f64) -> bool {
        if !fs.is_finite() || fs <= 0.0 {
            return true;
        }
        let nyquist = 0.5 * fs;
        nyquist == 0.0 || self.cutoff_hz >= nyquist || self.order == 0
    }

    /// Second-order sections realising the filter at `fs`, or `None` for passthrough.
    pub fn sections(&self, fs: f64) -> Option<Vec<Coefficients<f64>>> {
        if self.is_passthrough(fs) {
            return None;
        }
        let fs2 = 2.0 * fs;
        let warped = fs2 * (PI * self.cutoff_hz / fs).tan();
        let n = self.order as f64;

        let mut sections = Vec::with_capacity(self.order.div_ceil(2));
        for k in 0..self.order {
            let m = 2.0 * k as f64 - (n - 1.0);
            let prototype = -Complex64::from_polar(1.0, PI * m / (2.0 * n));
            let analog = match self.filter_type {
                FilterType::Lowpass => prototype * warped,
                FilterType::Highpass => Complex64::new(warped, 0.0) / prototype,
            };
            let pole = (fs2 + analog) / (fs2 - analog);

            if pole.im.abs() <= REAL_POLE_EPS {
                sections.push(first_order_section(self.filter_type, pole.re));
            } else if pole.im > 0.0 {
                sections.push(second_order_section(self.filter_type, pole));
            }
        }
        Some(sections)
    }

    /// Filters `input` sampled at `fs`, from zero initial state.
    ///
    /// Returns a copy of the input when the filter is in passthrough.
    pub fn apply(&self, input: &[f64], fs: f64) -> Vec<f64> {
        let Some(sections) = self.sections(fs) else {
            return input.to_vec();
        };
        let mut stages: Vec<DirectForm2Transposed<f64>> = sections
            .into_iter()
            .map(DirectForm2Transposed::<f64>::new)
            .collect();
        input
            .iter()
            .map(|&x| stages.iter_mut().fold(x, |acc, stage| stage.run(acc)))
            .collect()
    }
}

/// Section for a conjugate pole pair `p, p*` with a double zero at `z = -1` (low-pass) or
/// `z = +1` (high-pass), scaled to unit gain in the passband.
fn second_order_section(filter_type: FilterType, pole: Complex64) -> Coefficients<f64> {
    let a1 = -2.0 * pole.re;
    let a2 = pole.norm_sqr();
    let (gain, b1_sign) = match filter_type {
        FilterType::Lowpass => ((1.0 + a1 + a2) / 4.0, 2.0),
        FilterType::Highpass => ((1.0 - a1 + a2) / 4.0, -2.0),
    };
    Coefficients {
        a1,
        a2,
        b0: gain,
        b1: b1_sign * gain,
        b2: gain,
    }
}

/// Section for a single real pole, zero at `z = -1` (low-pass) or `z = +1` (high-pass).
fn first_order_section(filter_type: FilterType, pole: f64) -> Coefficients<f64> {
    let a1 = -pole;
    let (gain, b1_sign) = match filter_type {
        FilterType::Lowpass => ((1.0 + a1) / 2.0, 1.0),
        FilterType::Highpass => ((1.0 - a1) / 2.0, -1.0),
    };
    Coefficients {
        a1,
        a2: 0.0,
        b0: gain,
        b1: b1_sign * gain,
        b2: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(len: usize) -> Vec<f64> {
        let mut v = vec![0.0; len];
        v[0] = 1.0;
        v
    }

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() <= tol, "index {i}: {a} vs {e}");
        }
    }

    #[test]
    fn order_five_has_three_sections() {
        let sections = ButterworthSpec::lowpass(1.0).sections(100.0).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections.iter().filter(|c| c.a2 == 0.0).count(), 1);
    }

    #[test]
    fn lowpass_impulse_matches_reference_design() {
        // butter(5, 0.2) followed by a zero-state direct-form run
        let expected = [
            0.001282581078960685,
            0.010229125494684521,
            0.03838025012383253,
            0.09135551177814707,
            0.15706377783427664,
            0.20974801169866414,
        ];
        let out = ButterworthSpec::lowpass(1.0).apply(&impulse(6), 10.0);
        assert_close(&out, &expected, 1e-12);
    }

    #[test]
    fn highpass_impulse_matches_reference_design() {
        let expected = [
            0.35416418109342984,
            -0.7170329705617842,
            0.06021076645227108,
            0.26798851070877516,
            0.20194164067821374,
            0.05620228897078583,
        ];
        let out = ButterworthSpec::highpass(1.0).apply(&impulse(6), 10.0);
        assert_close(&out, &expected, 1e-12);
    }

    #[test]
    fn lowpass_settles_to_dc_level() {
        let input = vec![0.75; 2000];
        let out = ButterworthSpec::lowpass(1.0).apply(&input, 100.0);
        assert!((out[1999] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn highpass_rejects_dc() {
        let input = vec![-0.939; 2000];
        let out = ButterworthSpec::highpass(1.0).apply(&input, 100.0);
        assert!(out[1999].abs() < 1e-9);
    }

    #[test]
    fn low_cutoff_at_high_rate_is_stable() {
        // 1 Hz at 1 kHz: normalised cutoff 0.002
        let input = vec![1.0; 20_000];
        let out = ButterworthSpec::lowpass(1.0).apply(&input, 1000.0);
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[19_999] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn passthrough_conditions() {
        let spec = ButterworthSpec::lowpass(1.0);
        assert!(spec.is_passthrough(0.0));
        assert!(spec.is_passthrough(-10.0));
        assert!(spec.is_passthrough(f64::NAN));
        assert!(spec.is_passthrough(2.0)); // cutoff == nyquist
        assert!(spec.is_passthrough(1.5));
        assert!(!spec.is_passthrough(2.5));

        let data = [0.1, -0.2, 0.3];
        assert_eq!(spec.apply(&data, 1.0), data.to_vec());
        assert_eq!(ButterworthSpec::highpass(1.0).apply(&data, 0.0), data.to_vec());
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(ButterworthSpec::lowpass(1.0).apply(&[], 100.0).is_empty());
    }
}
