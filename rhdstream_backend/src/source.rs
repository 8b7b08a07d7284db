//! Host-facing acquisition source.
//!
//! [`SampleSource`] is the contract a hosting pipeline consumes: channel and sample-rate queries,
//! per-channel scaling, start/stop and the `update_buffer` pull. Most of it is provided by default methods
//! over [`SampleSource::board`]; an implementor supplies run control.
//!
//! [`RhdSource`] wires a [`BoardController`], an [`AcquisitionLoop`] and a [`TimerTask`] together. The
//! timer calls the acquisition loop at the configured period while acquisition runs.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::acquisition::AcquisitionLoop;
use crate::board::{BoardController, ScanReport};
use crate::impedance_test::run_impedance_test;
use crate::scheduler::TimerTask;
use crate::transport::Transport;
use rhd_backend::channel_map::ChannelInfo;
use rhd_backend::config::BoardConfig;
use rhd_backend::decode::DecodedBlock;
use rhd_backend::error::Result;
use rhd_backend::impedance::ImpedanceReport;

pub trait SampleSource: Send + Sync {
    fn board(&self) -> &BoardController;

    fn start_acquisition(&self) -> Result<()>;
    /// Safe to call at any time. On return no tick is running and no data is queued.
    fn stop_acquisition(&self) -> Result<()>;
    /// Returns false only when the device became unreachable.
    fn update_buffer(&self) -> bool;

    fn found_input_source(&self) -> bool {
        self.board().found_input_source()
    }
    fn is_acquisition_active(&self) -> bool {
        self.board().is_acquisition_active()
    }
    fn num_channels(&self) -> usize {
        self.board().num_channels()
    }
    fn sample_rate(&self) -> f64 {
        self.board().sample_rate()
    }
    fn bit_volts(&self, chan: usize) -> f32 {
        self.board().bit_volts(chan)
    }
    fn num_event_channels(&self) -> usize {
        self.board().num_event_channels()
    }
    fn event_channel_names(&self) -> Vec<String> {
        self.board().event_channel_names()
    }
    fn channels_info(&self) -> Vec<ChannelInfo> {
        self.board().channels_info()
    }
}

pub struct RhdSource {
    board: Arc<BoardController>,
    acquisition: Arc<AcquisitionLoop>,
    timer: TimerTask,
}

impl RhdSource {
    /// Connects to the board behind `transport`, programs `config` and scans the ports.
    ///
    /// `DeviceNotFound` and `UploadFailed` are returned to the caller; the connection is never retried.
    pub fn new(transport: Box<dyn Transport>, config: BoardConfig) -> Result<Self> {
        config.validate()?;
        let period = Duration::from_millis(config.timer_period_ms.max(1));
        let capacity = config.buffer_capacity;
        let board = Arc::new(BoardController::new(transport, config));
        board.connect()?;
        let acquisition = Arc::new(AcquisitionLoop::new(board.clone(), capacity));
        let timer = TimerTask::new(acquisition.clone(), period)?;
        Ok(Self {
            board,
            acquisition,
            timer,
        })
    }

    pub fn from_config_file<P: AsRef<Path>>(transport: Box<dyn Transport>, path: P) -> Result<Self> {
        Self::new(transport, BoardConfig::from_json_file(path)?)
    }

    /// Stores the current desired settings.
    pub fn save_config<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.board.config().to_json_file(path)
    }

    pub fn acquisition(&self) -> &AcquisitionLoop {
        &self.acquisition
    }

    pub fn is_timer_active(&self) -> bool {
        self.timer.is_active()
    }

    pub fn pull_blocks(&self, max_blocks: usize) -> Vec<DecodedBlock> {
        self.acquisition.pull_blocks(max_blocks)
    }

    pub fn scan_ports(&self) -> Result<ScanReport> {
        self.board.scan_ports()
    }

    /// Runs an impedance test with the configured settings. Normal decode is suspended for the duration
    /// and resumed afterwards if acquisition was running.
    pub fn run_impedance_test(&self, cancel: &AtomicBool) -> Result<ImpedanceReport> {
        let resume = self.timer.is_active();
        self.timer.stop()?;
        let settings = self.board.config().impedance;
        let result = run_impedance_test(&self.board, &settings, cancel);
        self.acquisition.clear();
        if resume && self.board.is_acquisition_active() {
            self.timer.start()?;
        }
        result
    }
}

impl SampleSource for RhdSource {
    fn board(&self) -> &BoardController {
        &self.board
    }

    fn start_acquisition(&self) -> Result<()> {
        self.acquisition.clear();
        self.board.start_acquisition()?;
        if let Err(e) = self.timer.start() {
            self.board.stop_acquisition()?;
            return Err(e);
        }
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<()> {
        let timer = self.timer.stop();
        let board = self.board.stop_acquisition();
        self.acquisition.clear();
        timer.and(board)
    }

    fn update_buffer(&self) -> bool {
        self.acquisition.update_buffer()
    }
}

impl Drop for RhdSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop_acquisition() {
            log::warn!("Stopping acquisition on shutdown failed: {}", e);
        }
        self.board.close();
    }
}

#[cfg(test)]
mod test {
    use crate::simulated::*;
    use crate::source::*;
    use rhd_backend::ChipId;

    fn source() -> (RhdSource, SimHandle) {
        let sim = SimulatedBoard::new(SimConfig::default().with_headstage(0, SimHeadstage::new(ChipId::Rhd2132)));
        let handle = sim.handle();
        let config = BoardConfig {
            timer_period_ms: 2,
            ..Default::default()
        };
        (RhdSource::new(Box::new(sim), config).unwrap(), handle)
    }

    #[test]
    fn timer_fills_buffer() {
        let (source, _) = source();
        source.start_acquisition().unwrap();
        assert!(source.is_timer_active());
        std::thread::sleep(Duration::from_millis(50));
        source.stop_acquisition().unwrap();
        assert!(!source.is_timer_active());
        assert!(!source.is_acquisition_active());
        assert!(source.pull_blocks(usize::MAX).is_empty());
    }

    #[test]
    fn default_queries_delegate_to_board() {
        let (source, _) = source();
        assert!(source.found_input_source());
        assert_eq!(source.num_channels(), 32);
        assert_eq!(source.sample_rate(), 30000.0);
        assert_eq!(source.num_event_channels(), 16);
        assert_eq!(source.channels_info().len(), 32);
    }

    #[test]
    fn config_round_trip() {
        let (source, _) = source();
        let actual = source.board().set_upper_bandwidth(3000.0);
        let file = tempfile::NamedTempFile::new().unwrap();
        source.save_config(file.path()).unwrap();
        let loaded = BoardConfig::from_json_file(file.path()).unwrap();
        assert_eq!(loaded.upper_bandwidth, 3000.0);
        assert_ne!(actual, 0.0);
    }
}
