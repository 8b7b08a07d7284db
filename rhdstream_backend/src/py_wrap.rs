//! Python bindings, enabled with the `python` feature.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use numpy::{IntoPyArray, PyArray1, PyArray2};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use crate::okfrontpanel::OkFrontPanel;
use crate::simulated::{SimConfig, SimHeadstage, SimulatedBoard};
use crate::source::{RhdSource, SampleSource};
use crate::transport::Transport;
use rhd_backend::{BoardConfig, ChipId, RhdError};

fn to_py_err(e: RhdError) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

#[pyclass(name = "RhdSource")]
pub struct PyRhdSource {
    inner: RhdSource,
}

#[pymethods]
impl PyRhdSource {
    /// Connects to a board. With `simulated=True` an in-process board with two 32-channel headstages is
    /// used instead of the FrontPanel library.
    #[new]
    #[pyo3(signature = (config_path=None, simulated=false))]
    fn new(config_path: Option<PathBuf>, simulated: bool) -> PyResult<Self> {
        let config = match config_path {
            Some(path) => BoardConfig::from_json_file(path).map_err(to_py_err)?,
            None => BoardConfig::default(),
        };
        let transport: Box<dyn Transport> = if simulated {
            Box::new(SimulatedBoard::new(
                SimConfig::default()
                    .with_headstage(0, SimHeadstage::new(ChipId::Rhd2132))
                    .with_headstage(2, SimHeadstage::new(ChipId::Rhd2132)),
            ))
        } else {
            Box::new(OkFrontPanel::new())
        };
        let inner = RhdSource::new(transport, config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    fn start_acquisition(&self) -> PyResult<()> {
        self.inner.start_acquisition().map_err(to_py_err)
    }

    fn stop_acquisition(&self) -> PyResult<()> {
        self.inner.stop_acquisition().map_err(to_py_err)
    }

    fn update_buffer(&self) -> bool {
        self.inner.update_buffer()
    }

    fn is_acquisition_active(&self) -> bool {
        self.inner.is_acquisition_active()
    }

    fn num_channels(&self) -> usize {
        self.inner.num_channels()
    }

    fn sample_rate(&self) -> f64 {
        self.inner.sample_rate()
    }

    fn bit_volts(&self, chan: usize) -> f32 {
        self.inner.bit_volts(chan)
    }

    fn channel_names(&self) -> Vec<String> {
        self.inner.channels_info().into_iter().map(|c| c.name).collect()
    }

    fn event_channel_names(&self) -> Vec<String> {
        self.inner.event_channel_names()
    }

    /// Channel table as JSON.
    fn channels_json(&self) -> PyResult<String> {
        serde_json::to_string(&self.inner.channels_info()).map_err(|e| to_py_err(e.into()))
    }

    fn scan_ports(&self) -> PyResult<String> {
        let report = self.inner.scan_ports().map_err(to_py_err)?;
        serde_json::to_string(&report).map_err(|e| to_py_err(e.into()))
    }

    fn set_upper_bandwidth(&self, requested: f64) -> f64 {
        self.inner.board().set_upper_bandwidth(requested)
    }

    fn set_lower_bandwidth(&self, requested: f64) -> f64 {
        self.inner.board().set_lower_bandwidth(requested)
    }

    fn set_sample_rate(&self, index: usize) -> PyResult<f64> {
        self.inner.board().set_sample_rate(index, false).map_err(to_py_err)
    }

    fn set_dac_channel(&self, slot: usize, stream: usize, channel: usize) -> PyResult<()> {
        self.inner.board().set_dac_channel(slot, stream, channel).map_err(to_py_err)
    }

    fn save_config(&self, path: PathBuf) -> PyResult<()> {
        self.inner.save_config(path).map_err(to_py_err)
    }

    /// Decoded samples pulled from the buffer: `(samples[channel, sample], timestamps, ttl_in)`.
    fn pull_samples<'py>(
        &self,
        py: Python<'py>,
        max_blocks: usize,
    ) -> PyResult<(&'py PyArray2<f32>, &'py PyArray1<u32>, &'py PyArray1<u16>)> {
        let blocks = self.inner.pull_blocks(max_blocks);
        let samples = if blocks.is_empty() {
            Array2::zeros((self.inner.num_channels(), 0))
        } else {
            let views: Vec<ArrayView2<f32>> = blocks.iter().map(|b| b.samples.view()).collect();
            concatenate(Axis(1), &views).map_err(|e| PyRuntimeError::new_err(e.to_string()))?
        };
        let timestamps: Vec<u32> = blocks.iter().flat_map(|b| b.timestamps.iter().copied()).collect();
        let events: Vec<u16> = blocks.iter().flat_map(|b| b.event_codes.iter().copied()).collect();
        Ok((
            samples.into_pyarray(py),
            timestamps.into_pyarray(py),
            events.into_pyarray(py),
        ))
    }

    /// Impedance of every channel: `(stream, channel, magnitude_ohms, phase_degrees)` arrays.
    fn run_impedance_test<'py>(
        &self,
        py: Python<'py>,
    ) -> PyResult<(&'py PyArray1<usize>, &'py PyArray1<usize>, &'py PyArray1<f64>, &'py PyArray1<f64>)> {
        let cancel = AtomicBool::new(false);
        let report = py
            .allow_threads(|| self.inner.run_impedance_test(&cancel))
            .map_err(to_py_err)?;
        let m = &report.measurements;
        Ok((
            m.iter().map(|x| x.stream).collect::<Vec<_>>().into_pyarray(py),
            m.iter().map(|x| x.channel).collect::<Vec<_>>().into_pyarray(py),
            m.iter().map(|x| x.magnitude).collect::<Vec<_>>().into_pyarray(py),
            m.iter().map(|x| x.phase).collect::<Vec<_>>().into_pyarray(py),
        ))
    }
}
