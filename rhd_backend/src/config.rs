//! Desired device configuration, persisted as JSON.
//!
//! [`BoardConfig`] carries what the operator asked for. The board controller quantizes each value to what
//! the hardware can do and reports the actual value back; the configuration itself is never rewritten with
//! actual values.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::channel_map::NamingScheme;
use crate::dac::{DacHighPass, TtlSettings};
use crate::error::{Result, RhdError};
use crate::registers::{DEFAULT_SAMPLE_RATE_INDEX, SAMPLE_RATES};

pub const NUM_PORTS: usize = 4;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpedanceSettings {
    /// Hz
    pub frequency: f64,
    /// Sample rate index applied for the duration of a test; `None` keeps the acquisition rate.
    pub test_sample_rate_index: Option<usize>,
}

impl Default for ImpedanceSettings {
    fn default() -> Self {
        Self {
            frequency: 1000.0,
            test_sample_rate_index: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub library_path: PathBuf,
    pub bitfile_path: PathBuf,
    pub sample_rate_index: usize,
    pub upper_bandwidth: f64,
    pub lower_bandwidth: f64,
    pub dsp_enabled: bool,
    pub dsp_cutoff: f64,
    pub noise_slicer_level: i32,
    pub cable_lengths_ft: [f64; NUM_PORTS],
    pub naming_scheme: NamingScheme,
    pub acquire_aux: bool,
    pub acquire_adc: bool,
    pub ttl: TtlSettings,
    pub dac_hpf: DacHighPass,
    /// Acquisition timer period
    pub timer_period_ms: u64,
    /// Upper bound on a single FIFO read inside a timer tick
    pub fifo_timeout_ms: u64,
    /// Decoded blocks kept for the host before the oldest are dropped
    pub buffer_capacity: usize,
    pub impedance: ImpedanceSettings,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from("okFrontPanel.so"),
            bitfile_path: PathBuf::from("rhd2000.bit"),
            sample_rate_index: DEFAULT_SAMPLE_RATE_INDEX,
            upper_bandwidth: 7500.0,
            lower_bandwidth: 1.0,
            dsp_enabled: true,
            dsp_cutoff: 0.5,
            noise_slicer_level: 0,
            cable_lengths_ft: [3.0; NUM_PORTS],
            naming_scheme: NamingScheme::Global,
            acquire_aux: false,
            acquire_adc: false,
            ttl: TtlSettings::default(),
            dac_hpf: DacHighPass::default(),
            timer_period_ms: 20,
            fifo_timeout_ms: 5,
            buffer_capacity: 1000,
            impedance: ImpedanceSettings::default(),
        }
    }
}

impl BoardConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: BoardConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        log::info!("Loaded board configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate_index >= SAMPLE_RATES.len() {
            return Err(RhdError::InvalidParameter(format!(
                "sample rate index {} out of range",
                self.sample_rate_index
            )));
        }
        if let Some(idx) = self.impedance.test_sample_rate_index {
            if idx >= SAMPLE_RATES.len() {
                return Err(RhdError::InvalidParameter(format!(
                    "impedance test sample rate index {} out of range",
                    idx
                )));
            }
        }
        if self.timer_period_ms == 0 {
            return Err(RhdError::InvalidParameter("timer period must be positive".to_string()));
        }
        if self.buffer_capacity == 0 {
            return Err(RhdError::InvalidParameter("buffer capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::config::*;

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.json");
        let mut config = BoardConfig::default();
        config.sample_rate_index = 11;
        config.naming_scheme = NamingScheme::PerStream;
        config.cable_lengths_ft[2] = 12.0;
        config.impedance.test_sample_rate_index = Some(14);
        config.to_json_file(&path).unwrap();
        assert_eq!(BoardConfig::from_json_file(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "acquire_adc": true, "impedance": { "frequency": 500.0 } }"#).unwrap();
        let config = BoardConfig::from_json_file(&path).unwrap();
        assert!(config.acquire_adc);
        assert_eq!(config.impedance.frequency, 500.0);
        assert_eq!(config.sample_rate_index, DEFAULT_SAMPLE_RATE_INDEX);
        assert_eq!(config.timer_period_ms, 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "sample_rate_index": 40 }"#).unwrap();
        assert!(matches!(BoardConfig::from_json_file(&path), Err(RhdError::InvalidParameter(_))));
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(BoardConfig::from_json_file(&path), Err(RhdError::ConfigError(_))));
        assert!(matches!(
            BoardConfig::from_json_file(dir.path().join("missing.json")),
            Err(RhdError::IoError(_))
        ));
    }
}
