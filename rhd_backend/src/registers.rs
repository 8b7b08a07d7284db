//! Register model of the RHD2000 amplifier chips and the quantization rules of the evaluation board.
//!
//! ## Overview
//!
//! The amplifier chips expose their analog front-end through a small bank of 8-bit registers. Continuous
//! quantities requested by an operator (amplifier bandwidth, DSP high-pass cutoff) are realised on-chip by
//! resistor DACs with discrete steps, so every request is quantized. This module keeps the register image
//! of a chip ([`ChipRegisters`]) and performs that quantization.
//!
//! ## Quantization
//!
//! - **Upper bandwidth**: set by the RH1/RH2 resistor DACs. The achievable bandwidths form a finite grid,
//!   built once from the RH1 DAC settings with RH2 matched to the same target. A request resolves to the grid
//!   point nearest to it in log distance.
//! - **Lower bandwidth**: set by the RL resistor DAC triple, same grid approach.
//! - **DSP cutoff**: one of 15 codes whose cutoff frequency scales with the sample rate.
//!
//! Because each request snaps to a grid point and a grid point is its own nearest neighbour, applying the
//! returned actual value again returns the same value.
//!
//! ## Board-level encodings
//!
//! Helper functions convert cable lengths to MISO sampling delays ([`cable_delay`]), DAC high-pass cutoffs to
//! filter coefficients ([`dac_hpf_coefficient`]) and DAC thresholds to board words ([`dac_threshold_word`]).
//!
//! ## Example
//!
//! ```
//! use rhd_backend::registers::ChipRegisters;
//!
//! let mut regs = ChipRegisters::new(30000.0);
//! let actual = regs.set_upper_bandwidth(7500.0);
//! assert_eq!(regs.set_upper_bandwidth(actual), actual);
//! ```

use std::f64::consts::PI;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RhdError};

/// Amplifier sample rates (S/s) selectable on the board, indexed by sample-rate index.
pub const SAMPLE_RATES: [f64; 17] = [
    1000.0,
    1250.0,
    1500.0,
    2000.0,
    2500.0,
    3000.0,
    10000.0 / 3.0,
    4000.0,
    5000.0,
    6250.0,
    8000.0,
    10000.0,
    12500.0,
    15000.0,
    20000.0,
    25000.0,
    30000.0,
];
pub const DEFAULT_SAMPLE_RATE_INDEX: usize = 16;

pub const MAX_UPPER_BANDWIDTH: f64 = 30000.0;
pub const MAX_LOWER_BANDWIDTH: f64 = 1500.0;
pub const MAX_NOISE_SLICER_LEVEL: i32 = 127;
pub const MAX_CABLE_DELAY: u8 = 15;
pub const NUM_CHIP_REGISTERS: u8 = 18;

pub fn sample_rate_from_index(index: usize) -> Result<f64> {
    SAMPLE_RATES.get(index).copied().ok_or_else(|| {
        RhdError::InvalidParameter(format!(
            "sample rate index {} out of range 0..{}",
            index,
            SAMPLE_RATES.len()
        ))
    })
}

// On-chip resistor DACs (ohms per step)
const RH1_BASE: f64 = 2200.0;
const RH1_DAC1_UNIT: f64 = 600.0;
const RH1_DAC2_UNIT: f64 = 29400.0;
const RH1_DAC1_STEPS: usize = 63;
const RH1_DAC2_STEPS: usize = 31;
// One RH1 coarse step is exactly 49 fine steps
const RH1_DAC_RATIO: usize = 49;

const RH2_BASE: f64 = 8700.0;
const RH2_DAC1_UNIT: f64 = 763.0;
const RH2_DAC2_UNIT: f64 = 38400.0;
const RH2_DAC1_STEPS: usize = 63;
const RH2_DAC2_STEPS: usize = 31;

const RL_BASE: f64 = 3500.0;
const RL_DAC1_UNIT: f64 = 175.0;
const RL_DAC2_UNIT: f64 = 12700.0;
const RL_DAC3_UNIT: f64 = 3000000.0;
const RL_DAC1_STEPS: usize = 127;
const RL_DAC2_STEPS: usize = 63;

fn rh2_from_upper_bandwidth(upper: f64) -> f64 {
    let l = upper.log10();
    1.0191 * 10f64.powf(8.1009 - 1.0821 * l + 0.03383 * l * l)
}

fn rl_from_lower_bandwidth(lower: f64) -> f64 {
    let l = lower.log10();
    if lower < 4.0 {
        1.0061 * 10f64.powf(4.9391 - 1.2088 * l + 0.5698 * l * l + 0.1442 * l * l * l)
    } else {
        1.0061 * 10f64.powf(4.7351 - 0.5916 * l + 0.08482 * l * l)
    }
}

// Inverse of the quadratic fit 10^(c0 + b*l + a*l^2) = r / scale
fn solve_log_quadratic(r: f64, scale: f64, a: f64, b: f64, c0: f64) -> f64 {
    let c = c0 - (r / scale).log10();
    let disc = (b * b - 4.0 * a * c).max(0.0);
    10f64.powf((-b - disc.sqrt()) / (2.0 * a))
}

fn upper_bandwidth_from_rh1(rh1: f64) -> f64 {
    solve_log_quadratic(rh1, 0.9730, 0.04767, -1.1892, 8.0968)
}

fn upper_bandwidth_from_rh2(rh2: f64) -> f64 {
    solve_log_quadratic(rh2, 1.0191, 0.03383, -1.0821, 8.1009)
}

// The RL fit is piecewise with a cubic branch, so it is inverted numerically.
// rl_from_lower_bandwidth decreases monotonically in both branches.
fn lower_bandwidth_from_rl(rl: f64) -> f64 {
    let (mut lo, mut hi) = (-2.0_f64, 3000f64.log10());
    if rl_from_lower_bandwidth(10f64.powf(lo)) <= rl {
        return 10f64.powf(lo);
    }
    if rl_from_lower_bandwidth(10f64.powf(hi)) >= rl {
        return 10f64.powf(hi);
    }
    for _ in 0..60 {
        let mid = 0.5 * (lo + hi);
        if rl_from_lower_bandwidth(10f64.powf(mid)) > rl {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    10f64.powf(0.5 * (lo + hi))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct UpperCodes {
    rh1_dac1: u8,
    rh1_dac2: u8,
    rh2_dac1: u8,
    rh2_dac2: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LowerCodes {
    rl_dac1: u8,
    rl_dac2: u8,
    rl_dac3: u8,
}

// Coarse steps first, then fine steps, each only while still half a step short of the target
fn rh2_codes(target: f64) -> (u8, u8, f64) {
    let mut actual = RH2_BASE;
    let (mut dac1, mut dac2) = (0u8, 0u8);
    for _ in 0..RH2_DAC2_STEPS {
        if actual < target - (RH2_DAC2_UNIT - RH2_DAC1_UNIT / 2.0) {
            actual += RH2_DAC2_UNIT;
            dac2 += 1;
        }
    }
    for _ in 0..RH2_DAC1_STEPS {
        if actual < target - RH2_DAC1_UNIT / 2.0 {
            actual += RH2_DAC1_UNIT;
            dac1 += 1;
        }
    }
    (dac1, dac2, actual)
}

fn upper_grid() -> &'static [(f64, UpperCodes)] {
    static GRID: OnceLock<Vec<(f64, UpperCodes)>> = OnceLock::new();
    GRID.get_or_init(|| {
        let max_steps = RH1_DAC1_STEPS + RH1_DAC_RATIO * RH1_DAC2_STEPS;
        let mut grid: Vec<(f64, UpperCodes)> = (0..=max_steps)
            .map(|m| {
                let rh1_dac2 = (m / RH1_DAC_RATIO).min(RH1_DAC2_STEPS);
                let rh1_dac1 = m - RH1_DAC_RATIO * rh1_dac2;
                let rh1 = RH1_BASE + rh1_dac1 as f64 * RH1_DAC1_UNIT + rh1_dac2 as f64 * RH1_DAC2_UNIT;
                let bw1 = upper_bandwidth_from_rh1(rh1);
                let (rh2_dac1, rh2_dac2, rh2) = rh2_codes(rh2_from_upper_bandwidth(bw1));
                let bw2 = upper_bandwidth_from_rh2(rh2);
                let codes = UpperCodes {
                    rh1_dac1: rh1_dac1 as u8,
                    rh1_dac2: rh1_dac2 as u8,
                    rh2_dac1,
                    rh2_dac2,
                };
                ((bw1 * bw2).sqrt(), codes)
            })
            .filter(|(bw, _)| bw.is_finite() && *bw > 0.0)
            .collect();
        grid.sort_by(|a, b| a.0.total_cmp(&b.0));
        grid.dedup_by(|a, b| a.0 == b.0);
        grid
    })
}

fn lower_grid() -> &'static [(f64, LowerCodes)] {
    static GRID: OnceLock<Vec<(f64, LowerCodes)>> = OnceLock::new();
    GRID.get_or_init(|| {
        let mut grid = Vec::with_capacity(2 * (RL_DAC2_STEPS + 1) * (RL_DAC1_STEPS + 1));
        for rl_dac3 in 0..=1u8 {
            for rl_dac2 in 0..=RL_DAC2_STEPS as u8 {
                for rl_dac1 in 0..=RL_DAC1_STEPS as u8 {
                    let rl = RL_BASE
                        + rl_dac1 as f64 * RL_DAC1_UNIT
                        + rl_dac2 as f64 * RL_DAC2_UNIT
                        + rl_dac3 as f64 * RL_DAC3_UNIT;
                    let codes = LowerCodes {
                        rl_dac1,
                        rl_dac2,
                        rl_dac3,
                    };
                    grid.push((lower_bandwidth_from_rl(rl), codes));
                }
            }
        }
        grid.sort_by(|a, b| a.0.total_cmp(&b.0));
        grid.dedup_by(|a, b| a.0 == b.0);
        grid
    })
}

// Grid must be sorted and non-empty. Ties resolve to the lower grid index.
fn nearest_in_log<T: Copy>(grid: &[(f64, T)], requested: f64) -> (f64, T) {
    if !(requested > 0.0) {
        return grid[0];
    }
    let idx = grid.partition_point(|(v, _)| *v < requested);
    if idx == 0 {
        return grid[0];
    }
    if idx == grid.len() {
        return grid[grid.len() - 1];
    }
    let target = requested.ln();
    let below = (target - grid[idx - 1].0.ln()).abs();
    let above = (grid[idx].0.ln() - target).abs();
    if above <= below {
        grid[idx]
    } else {
        grid[idx - 1]
    }
}

/// DSP high-pass cutoff (Hz) of code `1..=15` at the given sample rate.
pub fn dsp_cutoff_for_code(code: u8, sample_rate: f64) -> f64 {
    let x = 2f64.powi(code as i32);
    sample_rate * (x / (x - 1.0)).ln() / (2.0 * PI)
}

fn nearest_dsp_code(requested: f64, sample_rate: f64) -> u8 {
    if !(requested > 0.0) {
        return 15;
    }
    let target = requested.log10();
    (1..=15u8)
        .min_by(|a, b| {
            let da = (target - dsp_cutoff_for_code(*a, sample_rate).log10()).abs();
            let db = (target - dsp_cutoff_for_code(*b, sample_rate).log10()).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(15)
}

/// Series capacitor used by the on-chip impedance-check DAC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZcheckScale {
    Cs100fF,
    Cs1pF,
    Cs10pF,
}

impl ZcheckScale {
    pub const ALL: [ZcheckScale; 3] = [ZcheckScale::Cs100fF, ZcheckScale::Cs1pF, ZcheckScale::Cs10pF];

    pub fn capacitance(&self) -> f64 {
        match self {
            ZcheckScale::Cs100fF => 0.1e-12,
            ZcheckScale::Cs1pF => 1.0e-12,
            ZcheckScale::Cs10pF => 10.0e-12,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ZcheckScale::Cs100fF => 0,
            ZcheckScale::Cs1pF => 1,
            ZcheckScale::Cs10pF => 2,
        }
    }

    /// Two-bit field of register 5.
    pub fn register_bits(&self) -> u8 {
        match self {
            ZcheckScale::Cs100fF => 0,
            ZcheckScale::Cs1pF => 1,
            ZcheckScale::Cs10pF => 3,
        }
    }

    pub fn from_register_bits(bits: u8) -> Option<ZcheckScale> {
        match bits & 0x3 {
            0 => Some(ZcheckScale::Cs100fF),
            1 => Some(ZcheckScale::Cs1pF),
            3 => Some(ZcheckScale::Cs10pF),
            _ => None,
        }
    }
}

/// Register image of one RHD2000 chip.
///
/// All chips on the board are programmed with the same image. Setters return the quantized actual value;
/// use [`ChipRegisters::diff`] against the previously programmed image to find the registers that need to
/// be rewritten.
#[derive(Clone, Debug, PartialEq)]
pub struct ChipRegisters {
    sample_rate: f64,
    dsp_enabled: bool,
    dsp_cutoff_code: u8,
    upper: (f64, UpperCodes),
    lower: (f64, LowerCodes),
    zcheck_enabled: bool,
    zcheck_scale: ZcheckScale,
    zcheck_select: u8,
    zcheck_dac: u8,
    aux_inputs_enabled: bool,
}

impl ChipRegisters {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            dsp_enabled: true,
            dsp_cutoff_code: nearest_dsp_code(1.0, sample_rate),
            upper: nearest_in_log(upper_grid(), 7500.0),
            lower: nearest_in_log(lower_grid(), 1.0),
            zcheck_enabled: false,
            zcheck_scale: ZcheckScale::Cs100fF,
            zcheck_select: 0,
            zcheck_dac: 128,
            aux_inputs_enabled: true,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Updates the rate-dependent bias registers. The DSP code is kept, so the DSP cutoff in Hz moves
    /// with the rate; re-apply the desired cutoff afterwards.
    pub fn define_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
    }

    pub fn set_upper_bandwidth(&mut self, requested: f64) -> f64 {
        self.upper = nearest_in_log(upper_grid(), requested.min(MAX_UPPER_BANDWIDTH));
        self.upper.0
    }

    pub fn upper_bandwidth(&self) -> f64 {
        self.upper.0
    }

    pub fn set_lower_bandwidth(&mut self, requested: f64) -> f64 {
        self.lower = nearest_in_log(lower_grid(), requested.min(MAX_LOWER_BANDWIDTH));
        self.lower.0
    }

    pub fn lower_bandwidth(&self) -> f64 {
        self.lower.0
    }

    pub fn set_dsp_cutoff_freq(&mut self, requested: f64) -> f64 {
        self.dsp_cutoff_code = nearest_dsp_code(requested, self.sample_rate);
        self.dsp_cutoff_freq()
    }

    pub fn dsp_cutoff_freq(&self) -> f64 {
        dsp_cutoff_for_code(self.dsp_cutoff_code, self.sample_rate)
    }

    pub fn set_dsp_enabled(&mut self, enabled: bool) {
        self.dsp_enabled = enabled;
    }

    pub fn dsp_enabled(&self) -> bool {
        self.dsp_enabled
    }

    pub fn enable_zcheck(&mut self, enabled: bool) {
        self.zcheck_enabled = enabled;
    }

    pub fn zcheck_enabled(&self) -> bool {
        self.zcheck_enabled
    }

    pub fn set_zcheck_scale(&mut self, scale: ZcheckScale) {
        self.zcheck_scale = scale;
    }

    pub fn set_zcheck_channel(&mut self, channel: usize) -> Result<()> {
        if channel > 63 {
            return Err(RhdError::InvalidParameter(format!(
                "impedance-check channel {} out of range 0..64",
                channel
            )));
        }
        self.zcheck_select = channel as u8;
        Ok(())
    }

    pub fn set_zcheck_dac_amplitude(&mut self, amplitude: u8) {
        self.zcheck_dac = amplitude;
    }

    pub fn set_aux_inputs_enabled(&mut self, enabled: bool) {
        self.aux_inputs_enabled = enabled;
    }

    // (mux bias, ADC buffer bias) required by the amplifier sample rate
    fn bias_values(&self) -> (u8, u8) {
        match self.sample_rate {
            r if r < 3334.0 => (40, 32),
            r if r < 4001.0 => (40, 16),
            r if r < 5001.0 => (40, 8),
            r if r < 6251.0 => (32, 8),
            r if r < 8001.0 => (26, 8),
            r if r < 10001.0 => (18, 4),
            r if r < 12501.0 => (16, 3),
            r if r < 15001.0 => (7, 3),
            _ => (4, 2),
        }
    }

    pub fn register_value(&self, reg: u8) -> u8 {
        let (mux_bias, adc_buffer_bias) = self.bias_values();
        let aux = (self.aux_inputs_enabled as u8) << 7;
        match reg {
            // ADC reference bandwidth, comparator bias and select, amplifier Vref enabled
            0 => 0xDE,
            1 => (1 << 6) | adc_buffer_bias,
            2 => mux_bias,
            3 => 0,
            4 => (1 << 7) | ((self.dsp_enabled as u8) << 4) | self.dsp_cutoff_code,
            5 => {
                (1 << 6) | (self.zcheck_scale.register_bits() << 3) | (self.zcheck_enabled as u8)
            }
            6 => self.zcheck_dac,
            7 => self.zcheck_select,
            8 => self.upper.1.rh1_dac1,
            9 => aux | self.upper.1.rh1_dac2,
            10 => self.upper.1.rh2_dac1,
            11 => aux | self.upper.1.rh2_dac2,
            12 => self.lower.1.rl_dac1,
            13 => aux | (self.lower.1.rl_dac3 << 6) | self.lower.1.rl_dac2,
            14..=17 => 0xFF,
            _ => 0,
        }
    }

    /// Full `(register, value)` list for programming a freshly powered chip.
    pub fn register_list(&self) -> Vec<(u8, u8)> {
        (0..NUM_CHIP_REGISTERS)
            .map(|reg| (reg, self.register_value(reg)))
            .collect()
    }

    /// Registers whose value in `self` differs from `programmed`.
    pub fn diff(&self, programmed: &ChipRegisters) -> Vec<(u8, u8)> {
        (0..NUM_CHIP_REGISTERS)
            .filter(|reg| self.register_value(*reg) != programmed.register_value(*reg))
            .map(|reg| (reg, self.register_value(reg)))
            .collect()
    }
}

/// MISO sampling delay (in 1/2800 sample-period steps) compensating the round trip over a cable.
pub fn cable_delay(length_feet: f64, sample_rate: f64) -> u8 {
    const SPEED_OF_LIGHT: f64 = 299792458.0;
    const LVDS_OUTPUT_DELAY: f64 = 1.9e-9;
    const LVDS_INPUT_DELAY: f64 = 1.4e-9;
    const CHIP_DELAY: f64 = 9.0e-9;
    const MISO_SETTLE_TIME: f64 = 6.7e-9;

    let length_meters = 0.3048 * length_feet.max(0.0);
    let t_step = 1.0 / (2800.0 * sample_rate);
    let cable_velocity = 0.555 * SPEED_OF_LIGHT;
    let time_delay = 2.0 * length_meters / cable_velocity
        + LVDS_OUTPUT_DELAY
        + CHIP_DELAY
        + LVDS_INPUT_DELAY
        + MISO_SETTLE_TIME;
    let delay = ((time_delay / t_step) + 1.0 + 0.5).floor();
    delay.clamp(1.0, MAX_CABLE_DELAY as f64) as u8
}

/// 16-bit coefficient of the first-order DAC high-pass filter.
pub fn dac_hpf_coefficient(cutoff: f64, sample_rate: f64) -> u16 {
    let b = 1.0 - (-2.0 * PI * cutoff / sample_rate).exp();
    (65536.0 * b + 0.5).floor().clamp(1.0, 65535.0) as u16
}

/// Board threshold word and trigger polarity (`true` = rising) for a DAC threshold in microvolts.
pub fn dac_threshold_word(threshold_uv: f32) -> (u16, bool) {
    let word = ((threshold_uv / 0.195) + 32768.0).abs().round().min(65535.0);
    (word as u16, threshold_uv >= 0.0)
}

pub fn clamp_noise_slicer_level(level: i32) -> i32 {
    level.clamp(0, MAX_NOISE_SLICER_LEVEL)
}

#[cfg(test)]
mod test {
    mod bandwidth {
        use crate::registers::*;

        #[test]
        fn upper_bandwidth_is_idempotent() {
            let mut regs = ChipRegisters::new(30000.0);
            for requested in [100.0, 487.0, 500.0, 3000.0, 7500.0, 12345.0, 20000.0] {
                let actual = regs.set_upper_bandwidth(requested);
                assert_eq!(regs.set_upper_bandwidth(actual), actual, "requested {}", requested);
            }
        }

        #[test]
        fn lower_bandwidth_is_idempotent() {
            let mut regs = ChipRegisters::new(30000.0);
            for requested in [0.1, 0.5, 1.0, 3.9, 4.1, 10.0, 300.0] {
                let actual = regs.set_lower_bandwidth(requested);
                assert_eq!(regs.set_lower_bandwidth(actual), actual, "requested {}", requested);
            }
        }

        #[test]
        fn requested_value_is_quantized() {
            let mut regs = ChipRegisters::new(30000.0);
            let actual = regs.set_upper_bandwidth(500.0);
            assert_ne!(actual, 500.0);
            assert!((actual - 500.0).abs() / 500.0 < 0.02, "actual {}", actual);
        }

        #[test]
        fn upper_bandwidth_is_capped() {
            let mut regs = ChipRegisters::new(30000.0);
            let actual = regs.set_upper_bandwidth(1e6);
            assert!(actual < 1.2 * MAX_UPPER_BANDWIDTH);
            let lower = regs.set_lower_bandwidth(1e5);
            assert!(lower < 2.0 * MAX_LOWER_BANDWIDTH);
        }

        #[test]
        fn dsp_cutoff_is_idempotent_and_rate_dependent() {
            let mut regs = ChipRegisters::new(30000.0);
            let actual = regs.set_dsp_cutoff_freq(1.0);
            assert_eq!(regs.set_dsp_cutoff_freq(actual), actual);

            // Same code at a lower rate gives a lower cutoff
            regs.define_sample_rate(1000.0);
            assert!(regs.dsp_cutoff_freq() < actual);
        }

        #[test]
        fn upper_grid_is_strictly_increasing() {
            let grid = upper_grid();
            assert!(grid.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(grid[0].0 < 200.0);
            assert!(grid[grid.len() - 1].0 > 15000.0);
        }

        #[test]
        fn non_positive_requests_snap_to_grid() {
            let mut regs = ChipRegisters::new(30000.0);
            assert!(regs.set_lower_bandwidth(0.0) > 0.0);
            assert!(regs.set_dsp_cutoff_freq(-3.0) > 0.0);
        }
    }

    mod image {
        use crate::registers::*;

        #[test]
        fn diff_is_empty_for_unchanged_image() {
            let mut regs = ChipRegisters::new(30000.0);
            let programmed = regs.clone();
            let actual = regs.upper_bandwidth();
            regs.set_upper_bandwidth(actual);
            assert!(regs.diff(&programmed).is_empty());
        }

        #[test]
        fn bandwidth_change_touches_only_bandwidth_registers() {
            let mut regs = ChipRegisters::new(30000.0);
            let programmed = regs.clone();
            regs.set_upper_bandwidth(1000.0);
            let changed: Vec<u8> = regs.diff(&programmed).iter().map(|(r, _)| *r).collect();
            assert!(!changed.is_empty());
            assert!(changed.iter().all(|r| (8..=11).contains(r)), "{:?}", changed);
        }

        #[test]
        fn dsp_and_zcheck_fields() {
            let mut regs = ChipRegisters::new(30000.0);
            regs.set_dsp_enabled(false);
            assert_eq!(regs.register_value(4) & 0x10, 0);
            regs.enable_zcheck(true);
            regs.set_zcheck_scale(ZcheckScale::Cs10pF);
            regs.set_zcheck_channel(17).unwrap();
            assert_eq!(regs.register_value(5) & 0x1, 1);
            assert_eq!(
                ZcheckScale::from_register_bits(regs.register_value(5) >> 3),
                Some(ZcheckScale::Cs10pF)
            );
            assert_eq!(regs.register_value(7), 17);
            assert!(regs.set_zcheck_channel(64).is_err());
        }

        #[test]
        fn bias_follows_sample_rate() {
            let mut regs = ChipRegisters::new(1000.0);
            assert_eq!(regs.register_value(2), 40);
            regs.define_sample_rate(30000.0);
            assert_eq!(regs.register_value(2), 4);
        }
    }

    mod encodings {
        use crate::registers::*;

        #[test]
        fn sample_rate_table() {
            assert_eq!(sample_rate_from_index(DEFAULT_SAMPLE_RATE_INDEX).unwrap(), 30000.0);
            assert!(sample_rate_from_index(17).is_err());
        }

        #[test]
        fn cable_delay_values() {
            assert_eq!(cable_delay(3.0, 30000.0), 4);
            assert!(cable_delay(0.0, 1000.0) >= 1);
            assert_eq!(cable_delay(1000.0, 30000.0), MAX_CABLE_DELAY);
            assert!(cable_delay(10.0, 30000.0) >= cable_delay(3.0, 30000.0));
        }

        #[test]
        fn dac_words() {
            assert_eq!(dac_threshold_word(0.0), (32768, true));
            let (word, rising) = dac_threshold_word(-195.0);
            assert_eq!(word, 31768);
            assert!(!rising);
            assert_eq!(dac_hpf_coefficient(0.0, 30000.0), 1);
            assert!(dac_hpf_coefficient(300.0, 30000.0) > dac_hpf_coefficient(100.0, 30000.0));
            assert_eq!(clamp_noise_slicer_level(500), MAX_NOISE_SLICER_LEVEL);
            assert_eq!(clamp_noise_slicer_level(-2), 0);
        }
    }
}
