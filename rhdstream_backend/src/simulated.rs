//! Deterministic in-process acquisition board.
//!
//! [`SimulatedBoard`] implements [`Transport`] against the same endpoint map as the real board, so the
//! whole controller stack (scan, register programming, continuous and finite runs, impedance testing) runs
//! without hardware. Headstages are placed per stream slot with [`SimConfig`]; each answers its ROM
//! readback only when its port's MISO delay lies inside its good-delay window, and drives a sinusoidal
//! response of the configured electrode impedance when the impedance-check waveform is enabled on one of
//! its channels.
//!
//! A [`SimHandle`] shares the board state with tests: it can unplug the board, starve the FIFO and count
//! register traffic. Finite runs normally land in the FIFO at once; a paced board only reports the words
//! its sample clock would have produced since the run was triggered, and a board can be told to drop
//! blocks from finite runs.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::transport::{endpoint, Transport};
use rhd_backend::channel_map::StreamSlot;
use rhd_backend::datablock::{
    block_size_in_words, ChipId, DataBlock, CHANNELS_PER_STREAM, MAX_NUM_DATA_STREAMS, NUM_BOARD_ADCS, REGISTER_59_MISO_A,
    REGISTER_59_MISO_B, SAMPLES_PER_DATA_BLOCK,
};
use rhd_backend::error::{Result, RhdError};
use rhd_backend::impedance::{SPI_PIPELINE_DELAY, ZCHECK_DAC_VOLTS};
use rhd_backend::registers::{ZcheckScale, SAMPLE_RATES};

const BOARD_ID: u32 = 500;

#[derive(Clone, Debug, PartialEq)]
pub struct SimHeadstage {
    pub chip: ChipId,
    /// MISO delays at which SPI readback succeeds
    pub good_delays: RangeInclusive<u8>,
    /// Resistive electrode impedance seen by every channel, ohms
    pub impedance_ohms: f64,
}

impl SimHeadstage {
    pub fn new(chip: ChipId) -> Self {
        Self {
            chip,
            good_delays: 1..=3,
            impedance_ohms: 1.0e6,
        }
    }

    pub fn with_impedance(mut self, ohms: f64) -> Self {
        self.impedance_ohms = ohms;
        self
    }

    pub fn with_good_delays(mut self, delays: RangeInclusive<u8>) -> Self {
        self.good_delays = delays;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimConfig {
    pub board_present: bool,
    pub reject_bitstream: bool,
    /// Indexed by stream slot (port × 2 + MISO line)
    pub headstages: [Option<SimHeadstage>; MAX_NUM_DATA_STREAMS],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            board_present: true,
            reject_bitstream: false,
            headstages: Default::default(),
        }
    }
}

impl SimConfig {
    pub fn with_headstage(mut self, slot: usize, headstage: SimHeadstage) -> Self {
        if let Some(h) = self.headstages.get_mut(slot) {
            *h = Some(headstage);
        }
        self
    }

    pub fn without_board(mut self) -> Self {
        self.board_present = false;
        self
    }
}

struct SimState {
    config: SimConfig,
    open: bool,
    configured: bool,
    unplugged: bool,
    starved: bool,
    fail_writes: bool,
    wires: [u32; 32],
    chip_registers: [u8; 64],
    running: bool,
    timestamp: u32,
    run_start: u32,
    fifo: VecDeque<u8>,
    paced: bool,
    // Trigger time, FIFO words before the run and words per block of the current finite run
    run_clock: Option<(Instant, usize, usize)>,
    withheld_blocks: usize,
    withheld_runs: usize,
    blocks_per_poll: usize,
    register_writes: usize,
    chip_register_writes: usize,
    stimulus_writes: usize,
}

impl SimState {
    fn check_reachable(&self, what: &str) -> Result<()> {
        if !self.open {
            return Err(RhdError::DeviceUnreachable(format!("{}: device is not open", what)));
        }
        if self.unplugged {
            return Err(RhdError::DeviceUnreachable(format!("{}: USB connection lost", what)));
        }
        Ok(())
    }

    fn continuous(&self) -> bool {
        self.wires[endpoint::RESET_RUN as usize] & 0x2 != 0
    }

    fn sample_rate(&self) -> f64 {
        SAMPLE_RATES
            .get(self.wires[endpoint::SAMPLE_RATE as usize] as usize)
            .copied()
            .unwrap_or(30000.0)
    }

    // Streams in block order, as selected by the stream-enable mask
    fn streams(&self) -> Vec<StreamSlot> {
        let mask = self.wires[endpoint::STREAM_ENABLE as usize];
        (0..MAX_NUM_DATA_STREAMS)
            .flat_map(|slot| [StreamSlot::new(slot, false), StreamSlot::new(slot, true)])
            .filter(|s| mask & s.enable_bit() != 0)
            .take(MAX_NUM_DATA_STREAMS)
            .collect()
    }

    fn write_wire(&mut self, addr: u8, value: u32) {
        self.wires[addr as usize] = value;
        match addr {
            endpoint::RESET_RUN if value & 0x1 != 0 => {
                self.running = false;
                self.timestamp = 0;
                self.fifo.clear();
                self.run_clock = None;
            }
            endpoint::RESET_RUN if value & 0x2 == 0 => self.running = false,
            endpoint::ZCHECK_PERIOD if value != 0 => self.stimulus_writes += 1,
            _ => {}
        }
    }

    fn trigger(&mut self, addr: u8) {
        match addr {
            endpoint::TRIGGER_RUN => {
                self.run_start = self.timestamp;
                if self.continuous() {
                    self.running = true;
                    self.run_clock = None;
                } else {
                    let words_before = self.fifo.len() / 2;
                    let samples = self.wires[endpoint::MAX_TIME_STEP as usize] as usize;
                    let blocks = samples.div_ceil(SAMPLES_PER_DATA_BLOCK);
                    let dropped = if self.withheld_runs > 0 {
                        self.withheld_runs -= 1;
                        self.withheld_blocks.min(blocks)
                    } else {
                        0
                    };
                    for _ in 0..blocks - dropped {
                        self.generate_block();
                    }
                    self.running = false;
                    let block_words = block_size_in_words(self.streams().len());
                    self.run_clock = Some((Instant::now(), words_before, block_words));
                }
            }
            endpoint::FIFO_RESET => {
                self.fifo.clear();
                self.run_clock = None;
            }
            endpoint::CHIP_REGISTER_LATCH => {
                let v = self.wires[endpoint::CHIP_REGISTER as usize];
                let reg = ((v >> 8) & 0x3F) as usize;
                self.chip_registers[reg] = v as u8;
                self.chip_register_writes += 1;
                if reg == 5 && v & 0x1 != 0 {
                    self.stimulus_writes += 1;
                }
            }
            _ => {}
        }
    }

    // Words a paced board lets the host see
    fn visible_words(&self) -> usize {
        let words = self.fifo.len() / 2;
        match self.run_clock {
            Some((start, before, block_words)) if self.paced => {
                let samples = start.elapsed().as_secs_f64() * self.sample_rate();
                let produced = (samples / SAMPLES_PER_DATA_BLOCK as f64) as usize;
                words.min(before + produced * block_words)
            }
            _ => words,
        }
    }

    fn generate_block(&mut self) {
        let streams = self.streams();
        let mut block = DataBlock::new(streams.len());
        let fs = self.sample_rate();
        let delays = self.wires[endpoint::MISO_DELAY as usize];
        let z_period = self.wires[endpoint::ZCHECK_PERIOD as usize];
        let z_enabled = self.chip_registers[5] & 0x1 != 0 && z_period > 0;
        let z_scale = ZcheckScale::from_register_bits(self.chip_registers[5] >> 3).unwrap_or(ZcheckScale::Cs100fF);
        let z_channel = self.chip_registers[7] as usize;
        let z_volts = ZCHECK_DAC_VOLTS * self.chip_registers[6] as f64 / 128.0;

        for t in 0..SAMPLES_PER_DATA_BLOCK {
            let ts = self.timestamp.wrapping_add(t as u32);
            block.timestamps[t] = ts;
            for adc in 0..NUM_BOARD_ADCS {
                block.board_adc[[adc, t]] = 32768 + 1000 * adc as u16;
            }
            block.ttl_in[t] = ((ts / 3000) % 2) as u16;
        }

        for (s, slot) in streams.iter().enumerate() {
            block.amplifier.slice_mut(ndarray::s![s, .., ..]).fill(0);
            let Some(hs) = self.config.headstages.get(slot.slot).and_then(|h| h.as_ref()) else {
                continue;
            };
            if slot.ddr && hs.chip != ChipId::Rhd2164 {
                continue;
            }
            let delay = ((delays >> (4 * slot.port())) & 0xF) as u8;
            if !hs.good_delays.contains(&delay) {
                continue;
            }
            let register_59 = if slot.ddr { REGISTER_59_MISO_B } else { REGISTER_59_MISO_A };
            block.set_rom_readback(s, hs.chip, register_59);

            for t in 0..SAMPLES_PER_DATA_BLOCK {
                let ts = self.timestamp.wrapping_add(t as u32);
                for k in 0..3 {
                    if t % 4 == k + 1 {
                        block.aux[[s, 1, t]] = 10000 + 100 * k as u16 + ((ts / 4) % 100) as u16;
                    }
                }
            }

            let offset = if slot.ddr { CHANNELS_PER_STREAM } else { 0 };
            for ch in 0..CHANNELS_PER_STREAM {
                let chip_channel = ch + offset;
                if chip_channel >= hs.chip.num_channels() {
                    continue;
                }
                let stimulus = (z_enabled && chip_channel == z_channel).then(|| {
                    let period = z_period as f64;
                    let f = fs / period;
                    let relative = f / fs;
                    let current = 2.0 * PI * f * z_volts * z_scale.capacitance();
                    let amplitude_uv = 1.0e6 * hs.impedance_ohms * current / (18.0 * relative * relative + 1.0);
                    (amplitude_uv, period)
                });
                for t in 0..SAMPLES_PER_DATA_BLOCK {
                    let ts = self.timestamp.wrapping_add(t as u32);
                    let mut v = 32768.0 + ((ch * 7 + ts as usize) % 11) as f64 - 5.0;
                    if let Some((amplitude_uv, period)) = stimulus {
                        let n = ts.wrapping_sub(self.run_start) as f64;
                        let arg = 2.0 * PI * (n - SPI_PIPELINE_DELAY) / period;
                        v += amplitude_uv * arg.cos() / 0.195;
                    }
                    block.amplifier[[s, ch, t]] = v.round().clamp(0.0, 65535.0) as u16;
                }
            }
        }

        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_DATA_BLOCK as u32);
        let mut bytes = Vec::new();
        block.write_bytes(&mut bytes);
        self.fifo.extend(bytes);
    }
}

pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedBoard`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    pub fn new(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                open: false,
                configured: false,
                unplugged: false,
                starved: false,
                fail_writes: false,
                wires: [0; 32],
                chip_registers: [0; 64],
                running: false,
                timestamp: 0,
                run_start: 0,
                fifo: VecDeque::new(),
                paced: false,
                run_clock: None,
                withheld_blocks: 0,
                withheld_runs: 0,
                blocks_per_poll: 1,
                register_writes: 0,
                chip_register_writes: 0,
                stimulus_writes: 0,
            })),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: self.state.clone(),
        }
    }
}

impl SimHandle {
    /// Simulates a lost USB connection: every later call fails with `DeviceUnreachable`.
    pub fn unplug(&self) {
        self.state.lock().unplugged = true;
    }

    /// While starved, a continuous run produces no data.
    pub fn set_starved(&self, starved: bool) {
        self.state.lock().starved = starved;
    }

    /// A paced board reveals finite-run data at the pace of its sample clock.
    pub fn set_paced(&self, paced: bool) {
        self.state.lock().paced = paced;
    }

    /// Drops `blocks` blocks from each of the next `runs` finite runs.
    pub fn withhold_blocks(&self, blocks: usize, runs: usize) {
        let mut st = self.state.lock();
        st.withheld_blocks = blocks;
        st.withheld_runs = runs;
    }

    pub fn set_blocks_per_poll(&self, blocks: usize) {
        self.state.lock().blocks_per_poll = blocks;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn register_writes(&self) -> usize {
        self.state.lock().register_writes
    }

    pub fn chip_register_writes(&self) -> usize {
        self.state.lock().chip_register_writes
    }

    /// Writes that enabled the impedance-check waveform or DAC.
    pub fn stimulus_writes(&self) -> usize {
        self.state.lock().stimulus_writes
    }

    pub fn chip_register(&self, reg: u8) -> u8 {
        self.state.lock().chip_registers[reg as usize & 0x3F]
    }

    pub fn wire(&self, addr: u8) -> u32 {
        self.state.lock().wires[addr as usize & 0x1F]
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_configured(&self) -> bool {
        self.state.lock().configured
    }

    pub fn fifo_bytes(&self) -> usize {
        self.state.lock().fifo.len()
    }
}

impl Transport for SimulatedBoard {
    fn open(&mut self, library_path: &Path) -> Result<()> {
        let mut st = self.state.lock();
        if !st.config.board_present {
            return Err(RhdError::DeviceNotFound(format!(
                "no simulated board behind {}",
                library_path.display()
            )));
        }
        st.open = true;
        st.unplugged = false;
        log::info!("Opened simulated board");
        Ok(())
    }

    fn upload_bitstream(&mut self, path: &Path) -> Result<()> {
        let mut st = self.state.lock();
        st.check_reachable("upload_bitstream")?;
        if st.config.reject_bitstream {
            return Err(RhdError::UploadFailed(format!("{} rejected by simulated board", path.display())));
        }
        st.configured = true;
        Ok(())
    }

    fn write_register(&mut self, addr: u8, value: u32) -> Result<()> {
        let mut st = self.state.lock();
        st.check_reachable("write_register")?;
        if st.fail_writes {
            return Err(RhdError::RegisterWriteFailed {
                addr,
                msg: "simulated write failure".to_string(),
            });
        }
        st.register_writes += 1;
        if endpoint::is_wire_in(addr) {
            st.write_wire(addr, value);
        } else if endpoint::is_trigger(addr) {
            st.trigger(addr);
        } else {
            return Err(RhdError::RegisterWriteFailed {
                addr,
                msg: "not a writable endpoint".to_string(),
            });
        }
        Ok(())
    }

    fn read_register(&mut self, addr: u8) -> Result<u32> {
        let mut st = self.state.lock();
        st.check_reachable("read_register")?;
        match addr {
            endpoint::WORDS_IN_FIFO => {
                if st.running && !st.starved {
                    for _ in 0..st.blocks_per_poll {
                        st.generate_block();
                    }
                }
                Ok(st.visible_words() as u32)
            }
            endpoint::SPI_RUNNING => Ok(st.running as u32),
            endpoint::TTL_IN => Ok(((st.timestamp / 3000) % 2) as u32),
            endpoint::BOARD_ID => Ok(BOARD_ID),
            _ => Err(RhdError::InvalidParameter(format!("endpoint {:#04x} is not a wire-out", addr))),
        }
    }

    fn read_fifo(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut st = self.state.lock();
        st.check_reachable("read_fifo")?;
        let n = buf.len().min(st.fifo.len());
        for (dst, src) in buf.iter_mut().zip(st.fifo.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) {
        let mut st = self.state.lock();
        st.open = false;
        st.running = false;
    }

    fn is_open(&self) -> bool {
        let st = self.state.lock();
        st.open && !st.unplugged
    }
}
