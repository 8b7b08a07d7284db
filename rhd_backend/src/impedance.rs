//! Electrode impedance from the response to an on-chip sinusoidal test current.
//!
//! ## Overview
//!
//! During an impedance test the chip's impedance-check DAC drives a sine of known amplitude through one of
//! three series capacitors onto the selected electrode. The electrode voltage is recorded for an integer
//! number of stimulus periods and its complex amplitude at the test frequency is extracted by direct
//! correlation against a reference cosine and sine ([`amplitude_of_freq_component`]). This is O(window
//! length) per channel and needs no transform buffer.
//!
//! The device-facing half of the test (register sequencing, finite runs, cancellation) lives in the
//! streaming crate. This module holds the math:
//!
//! - [`update_impedance_frequency`] snaps a requested frequency to one with an integer period at the
//!   current sample rate, and reports whether a test may run at all.
//! - [`ImpedancePlan`] derives the number of periods and data blocks a measurement needs.
//! - [`ImpedanceSweep`] accumulates per-(stream, channel, capacitor) magnitude and phase tensors and turns
//!   them into calibrated [`ImpedanceMeasurement`]s: best capacitor selection, current normalisation,
//!   SPI pipeline phase correction, then [`factor_out_parallel_capacitance`] and finally
//!   [`empirical_resistance_correction`]. The order of the last two matters.
//!
//! ## Example
//!
//! ```
//! use rhd_backend::impedance::*;
//!
//! let f = update_impedance_frequency(1000.0, 30000.0);
//! assert!(f.valid);
//! let plan = ImpedancePlan::new(1000.0, 30000.0).unwrap();
//! assert_eq!((plan.period, plan.num_periods, plan.num_blocks), (30, 20, 11));
//! ```

use std::f64::consts::PI;

use ndarray::{Array3, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::datablock::SAMPLES_PER_DATA_BLOCK;
use crate::error::{Result, RhdError};
use crate::registers::ZcheckScale;

/// Fixed parallel capacitance of the test fixture, factored out of every measurement.
pub const PARASITIC_CAPACITANCE: f64 = 14.0e-12;
/// Peak voltage of the impedance-check DAC at amplitude code 128.
pub const ZCHECK_DAC_VOLTS: f64 = 128.0 * (1.225 / 256.0);
/// Response amplitude the capacitor range selection aims for.
pub const TARGET_RESPONSE_UV: f64 = 1250.0;
/// Commands between the DAC update and the conversion that sees it.
pub const SPI_PIPELINE_DELAY: f64 = 3.0;

const MIN_PERIOD: usize = 2;
const MAX_PERIOD: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImpedanceFrequency {
    pub actual: f64,
    pub valid: bool,
}

/// Snaps `desired` to the nearest frequency with an integer sample period at `sample_rate`.
///
/// The result is invalid (and no stimulus may be generated) at or above Nyquist, for non-positive requests,
/// and when the period falls outside what the impedance-check waveform can hold.
pub fn update_impedance_frequency(desired: f64, sample_rate: f64) -> ImpedanceFrequency {
    if !(desired > 0.0) || desired >= sample_rate / 2.0 {
        return ImpedanceFrequency {
            actual: desired.max(0.0),
            valid: false,
        };
    }
    let period = (sample_rate / desired).round() as usize;
    ImpedanceFrequency {
        actual: sample_rate / period as f64,
        valid: (MIN_PERIOD..=MAX_PERIOD).contains(&period),
    }
}

/// Logs a warning when the test frequency sits close to the amplifier pass-band edges. The measurement is
/// still allowed.
pub fn check_bandwidth(frequency: f64, lower_bandwidth: f64, upper_bandwidth: f64) -> bool {
    let inside = frequency >= 1.5 * lower_bandwidth && frequency <= upper_bandwidth / 1.5;
    if !inside {
        log::warn!(
            "Impedance test frequency {:.1} Hz is close to the amplifier band edges ({:.1} Hz .. {:.1} Hz), results may be inaccurate",
            frequency,
            lower_bandwidth,
            upper_bandwidth
        );
    }
    inside
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpedancePlan {
    pub frequency: f64,
    pub sample_rate: f64,
    pub period: usize,
    pub num_periods: usize,
    pub num_blocks: usize,
}

impl ImpedancePlan {
    pub fn new(desired: f64, sample_rate: f64) -> Result<Self> {
        let f = update_impedance_frequency(desired, sample_rate);
        if !f.valid {
            return Err(RhdError::InvalidFrequency(desired));
        }
        let period = (sample_rate / f.actual).round() as usize;
        // About 20 ms of signal, never fewer than 5 periods
        let num_periods = ((0.020 * f.actual).round() as usize).max(5);
        let num_blocks = (((num_periods + 2) * period) as f64 / SAMPLES_PER_DATA_BLOCK as f64).ceil() as usize;
        Ok(Self {
            frequency: f.actual,
            sample_rate,
            period,
            num_periods,
            num_blocks: num_blocks.max(2),
        })
    }

    pub fn num_samples(&self) -> usize {
        self.num_blocks * SAMPLES_PER_DATA_BLOCK
    }
}

/// Real and imaginary amplitude of the `frequency` component of `data[start..=end]`.
pub fn amplitude_of_freq_component(
    data: ArrayView1<f64>,
    start: usize,
    end: usize,
    sample_rate: f64,
    frequency: f64,
) -> (f64, f64) {
    let k = 2.0 * PI * frequency / sample_rate;
    let (i, q) = (start..=end).fold((0.0, 0.0), |(i, q), t| {
        let phase = k * t as f64;
        (i + data[t] * phase.cos(), q + data[t] * phase.sin())
    });
    let length = (end - start + 1) as f64;
    (i * 2.0 / length, -q * 2.0 / length)
}

/// Magnitude (µV) and phase (degrees) of the response in `data`, measured over `num_periods` whole periods
/// at the end of the record to skip the start-up transient.
pub fn measure_complex_amplitude(data: ArrayView1<f64>, plan: &ImpedancePlan) -> (f64, f64) {
    let period = plan.period;
    let len = data.len();
    let window = plan.num_periods * period;
    if len < window || window == 0 {
        return (0.0, 0.0);
    }
    let mut start = 0;
    let mut end = window - 1;
    while end + period < len {
        start += period;
        end += period;
    }
    let (re, im) = amplitude_of_freq_component(data, start, end, plan.sample_rate, plan.frequency);
    (re.hypot(im), im.atan2(re).to_degrees())
}

/// Removes a capacitance `parasitic` in parallel with the electrode from a measured impedance.
pub fn factor_out_parallel_capacitance(magnitude: f64, phase: f64, frequency: f64, parasitic: f64) -> (f64, f64) {
    let measured_r = magnitude * phase.to_radians().cos();
    let measured_x = magnitude * phase.to_radians().sin();

    let cap_term = 2.0 * PI * frequency * parasitic;
    let x_term = cap_term * (measured_r * measured_r + measured_x * measured_x);
    let denominator = cap_term * x_term + 2.0 * cap_term * measured_x + 1.0;
    let true_r = measured_r / denominator;
    let true_x = (measured_x + x_term) / denominator;

    (true_r.hypot(true_x), true_x.atan2(true_r).to_degrees())
}

/// Bench-calibrated resistance correction, significant only below roughly 15 kS/s.
pub fn empirical_resistance_correction(magnitude: f64, phase: f64, sample_rate: f64) -> (f64, f64) {
    let mut r = magnitude * phase.to_radians().cos();
    let x = magnitude * phase.to_radians().sin();
    r /= 10.0 * (-sample_rate / 2500.0).exp() * (2.0 * PI * sample_rate / 15000.0).cos() + 1.0;
    (r.hypot(x), x.atan2(r).to_degrees())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceMeasurement {
    pub stream: usize,
    pub channel: usize,
    /// Ohms
    pub magnitude: f64,
    /// Degrees
    pub phase: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceReport {
    pub frequency: f64,
    pub measurements: Vec<ImpedanceMeasurement>,
    /// False when the run was cancelled before every channel was measured
    pub completed: bool,
}

impl ImpedanceReport {
    pub fn get(&self, stream: usize, channel: usize) -> Option<&ImpedanceMeasurement> {
        self.measurements
            .iter()
            .find(|m| m.stream == stream && m.channel == channel)
    }
}

/// Raw responses of one test run, indexed `[stream, channel, capacitor]`.
pub struct ImpedanceSweep {
    plan: ImpedancePlan,
    magnitude: Array3<f64>,
    phase: Array3<f64>,
}

impl ImpedanceSweep {
    pub fn new(plan: ImpedancePlan, num_streams: usize, num_channels: usize) -> Self {
        let shape = (num_streams, num_channels, ZcheckScale::ALL.len());
        Self {
            plan,
            magnitude: Array3::zeros(shape),
            phase: Array3::zeros(shape),
        }
    }

    pub fn plan(&self) -> &ImpedancePlan {
        &self.plan
    }

    /// Records the response of `channel` on every stream of `data` (`[stream, channel, sample]`, µV) with
    /// series capacitor `scale` selected.
    pub fn record(&mut self, data: &Array3<f64>, channel: usize, scale: ZcheckScale) {
        let num_streams = self.magnitude.shape()[0].min(data.shape()[0]);
        for stream in 0..num_streams {
            self.record_stream(data, stream, channel, scale);
        }
    }

    /// Records the response of a single stream-local `channel`.
    pub fn record_stream(&mut self, data: &Array3<f64>, stream: usize, channel: usize, scale: ZcheckScale) {
        let (m, p) = measure_complex_amplitude(data.slice(ndarray::s![stream, channel, ..]), &self.plan);
        self.magnitude[[stream, channel, scale.index()]] = m;
        self.phase[[stream, channel, scale.index()]] = p;
    }

    pub fn raw(&self, stream: usize, channel: usize, scale: ZcheckScale) -> (f64, f64) {
        (
            self.magnitude[[stream, channel, scale.index()]],
            self.phase[[stream, channel, scale.index()]],
        )
    }

    /// Capacitor range whose response is closest to [`TARGET_RESPONSE_UV`] on a log scale.
    pub fn best_scale(&self, stream: usize, channel: usize) -> ZcheckScale {
        let distance = |s: &ZcheckScale| {
            let m = self.magnitude[[stream, channel, s.index()]].max(f64::MIN_POSITIVE);
            (m.ln() - TARGET_RESPONSE_UV.ln()).abs()
        };
        ZcheckScale::ALL
            .iter()
            .copied()
            .min_by(|a, b| distance(a).total_cmp(&distance(b)))
            .unwrap_or(ZcheckScale::Cs1pF)
    }

    /// Calibrated impedance of one electrode.
    pub fn impedance(&self, stream: usize, channel: usize) -> ImpedanceMeasurement {
        let plan = &self.plan;
        let scale = self.best_scale(stream, channel);
        let (voltage, measured_phase) = self.raw(stream, channel, scale);

        let relative_freq = plan.frequency / plan.sample_rate;
        let current = 2.0 * PI * plan.frequency * ZCHECK_DAC_VOLTS * scale.capacitance();
        let magnitude = 1.0e-6 * (voltage / current) * (18.0 * relative_freq * relative_freq + 1.0);
        let phase = measured_phase + 360.0 * (SPI_PIPELINE_DELAY / plan.period as f64);

        let (magnitude, phase) = factor_out_parallel_capacitance(magnitude, phase, plan.frequency, PARASITIC_CAPACITANCE);
        let (magnitude, phase) = empirical_resistance_correction(magnitude, phase, plan.sample_rate);
        ImpedanceMeasurement {
            stream,
            channel,
            magnitude,
            phase,
        }
    }
}

/// Electrode voltage (µV amplitude, degrees) an impedance `z_ohms` (resistive) produces at the amplifier
/// input with series capacitor `scale`. Inverse of [`ImpedanceSweep::impedance`] before the parasitic and
/// empirical corrections.
pub fn expected_response(z_ohms: f64, plan: &ImpedancePlan, scale: ZcheckScale) -> (f64, f64) {
    let relative_freq = plan.frequency / plan.sample_rate;
    let current = 2.0 * PI * plan.frequency * ZCHECK_DAC_VOLTS * scale.capacitance();
    let amplitude = 1.0e6 * z_ohms * current / (18.0 * relative_freq * relative_freq + 1.0);
    (amplitude, -360.0 * SPI_PIPELINE_DELAY / plan.period as f64)
}
