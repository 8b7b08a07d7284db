//! Abstract device transport and the evaluation-board protocol layered on it.
//!
//! [`Transport`] is the minimal surface a board connection must provide: open, bitstream upload, 32-bit
//! register access and bulk FIFO reads. Register addresses follow the FrontPanel endpoint map: wire-ins at
//! `0x00..=0x1f`, wire-outs at `0x20..=0x3f`, trigger-ins at `0x40..=0x5f` (the written value selects the
//! trigger bit).
//!
//! [`RhythmExt`] is implemented for every transport and turns the raw register map into board operations
//! (run control, stream enables, MISO delays, DAC routing, chip register programming, block reads).

use std::path::Path;
use std::time::Duration;

use rhd_backend::datablock::{block_size_in_bytes, DataBlock, MAX_NUM_DATA_STREAMS};
use rhd_backend::error::{Result, RhdError};

/// Endpoint map of the acquisition board.
pub mod endpoint {
    // Wire-ins
    /// bit 0: reset, bit 1: continuous run mode
    pub const RESET_RUN: u8 = 0x00;
    pub const MAX_TIME_STEP: u8 = 0x01;
    pub const SAMPLE_RATE: u8 = 0x02;
    /// 4 bits per port, port A in the low nibble
    pub const MISO_DELAY: u8 = 0x03;
    /// bits 0..8: MISO A stream slots, bits 8..16: DDR (MISO B) stream slots
    pub const STREAM_ENABLE: u8 = 0x04;
    pub const TTL_OUT_MODE: u8 = 0x05;
    /// bits 0..16: filter coefficient, bit 16: enable
    pub const DAC_HPF: u8 = 0x06;
    pub const NOISE_SUPPRESS: u8 = 0x07;
    /// Impedance-check waveform period in samples, 0 disables the waveform
    pub const ZCHECK_PERIOD: u8 = 0x08;
    /// bit 0: manual fast settle, bit 1: TTL-triggered fast settle, bits 4..8: TTL channel
    pub const FAST_SETTLE: u8 = 0x09;
    /// `(register << 8) | value`, latched by [`CHIP_REGISTER_LATCH`]
    pub const CHIP_REGISTER: u8 = 0x0a;
    /// One per DAC: bit 10 enable, bits 5..10 stream, bits 0..5 channel
    pub const DAC_SOURCE_BASE: u8 = 0x10;
    /// One per DAC: bits 0..16 threshold word, bit 16 rising polarity
    pub const DAC_THRESHOLD_BASE: u8 = 0x18;

    // Wire-outs
    pub const WORDS_IN_FIFO: u8 = 0x20;
    pub const SPI_RUNNING: u8 = 0x22;
    pub const TTL_IN: u8 = 0x23;
    pub const BOARD_ID: u8 = 0x3e;

    // Trigger-ins
    pub const TRIGGER_RUN: u8 = 0x41;
    pub const FIFO_RESET: u8 = 0x42;
    pub const CHIP_REGISTER_LATCH: u8 = 0x43;

    pub fn is_wire_in(addr: u8) -> bool {
        addr < 0x20
    }
    pub fn is_wire_out(addr: u8) -> bool {
        (0x20..0x40).contains(&addr)
    }
    pub fn is_trigger(addr: u8) -> bool {
        (0x40..0x60).contains(&addr)
    }
}

pub trait Transport: Send {
    fn open(&mut self, library_path: &Path) -> Result<()>;
    fn upload_bitstream(&mut self, path: &Path) -> Result<()>;
    fn write_register(&mut self, addr: u8, value: u32) -> Result<()>;
    fn read_register(&mut self, addr: u8) -> Result<u32>;
    /// Reads up to `buf.len()` bytes from the sample FIFO, waiting at most `timeout`. Returns bytes read.
    fn read_fifo(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

pub trait RhythmExt: Transport {
    fn reset_board(&mut self) -> Result<()> {
        self.write_register(endpoint::RESET_RUN, 0x1)?;
        self.write_register(endpoint::RESET_RUN, 0x0)
    }

    fn set_continuous_run_mode(&mut self, continuous: bool) -> Result<()> {
        self.write_register(endpoint::RESET_RUN, (continuous as u32) << 1)
    }

    fn set_max_time_step(&mut self, samples: u32) -> Result<()> {
        self.write_register(endpoint::MAX_TIME_STEP, samples)
    }

    fn set_sample_rate_index(&mut self, index: usize) -> Result<()> {
        self.write_register(endpoint::SAMPLE_RATE, index as u32)
    }

    fn set_cable_delays(&mut self, delays: &[u8; 4]) -> Result<()> {
        let packed = delays
            .iter()
            .enumerate()
            .fold(0u32, |acc, (port, d)| acc | ((*d as u32 & 0xF) << (4 * port)));
        self.write_register(endpoint::MISO_DELAY, packed)
    }

    fn set_stream_mask(&mut self, mask: u32) -> Result<()> {
        self.write_register(endpoint::STREAM_ENABLE, mask & 0xFFFF)
    }

    fn set_ttl_out_mode(&mut self, threshold_driven: bool) -> Result<()> {
        self.write_register(endpoint::TTL_OUT_MODE, threshold_driven as u32)
    }

    fn set_dac_high_pass(&mut self, coefficient: u16, enabled: bool) -> Result<()> {
        self.write_register(endpoint::DAC_HPF, coefficient as u32 | (enabled as u32) << 16)
    }

    fn set_noise_suppress(&mut self, level: i32) -> Result<()> {
        self.write_register(endpoint::NOISE_SUPPRESS, level.max(0) as u32)
    }

    fn set_zcheck_period(&mut self, period: u32) -> Result<()> {
        self.write_register(endpoint::ZCHECK_PERIOD, period)
    }

    fn set_fast_settle(&mut self, manual: bool, ttl_triggered: bool, ttl_channel: usize) -> Result<()> {
        let value = manual as u32 | (ttl_triggered as u32) << 1 | ((ttl_channel as u32) & 0xF) << 4;
        self.write_register(endpoint::FAST_SETTLE, value)
    }

    /// Routes DAC `slot` to `(stream, channel)`, or disables it.
    fn set_dac_source(&mut self, slot: usize, source: Option<(usize, usize)>) -> Result<()> {
        let value = match source {
            Some((stream, channel)) => 1 << 10 | ((stream as u32) & 0x1F) << 5 | (channel as u32) & 0x1F,
            None => 0,
        };
        self.write_register(endpoint::DAC_SOURCE_BASE + slot as u8, value)
    }

    fn set_dac_threshold_word(&mut self, slot: usize, word: u16, rising: bool) -> Result<()> {
        self.write_register(
            endpoint::DAC_THRESHOLD_BASE + slot as u8,
            word as u32 | (rising as u32) << 16,
        )
    }

    /// Programs one register on every connected chip.
    fn write_chip_register(&mut self, register: u8, value: u8) -> Result<()> {
        self.write_register(endpoint::CHIP_REGISTER, (register as u32) << 8 | value as u32)?;
        self.write_register(endpoint::CHIP_REGISTER_LATCH, 0)
    }

    fn run(&mut self) -> Result<()> {
        self.write_register(endpoint::TRIGGER_RUN, 0)
    }

    fn flush(&mut self) -> Result<()> {
        self.write_register(endpoint::FIFO_RESET, 0)
    }

    fn is_running(&mut self) -> Result<bool> {
        Ok(self.read_register(endpoint::SPI_RUNNING)? != 0)
    }

    fn num_words_in_fifo(&mut self) -> Result<u32> {
        self.read_register(endpoint::WORDS_IN_FIFO)
    }

    fn board_id(&mut self) -> Result<u32> {
        self.read_register(endpoint::BOARD_ID)
    }

    /// Reads every complete block currently in the FIFO, at most `max_blocks`. Fewer blocks (possibly
    /// none) is an underrun, not an error.
    fn read_data_blocks(&mut self, num_streams: usize, max_blocks: usize, timeout: Duration) -> Result<Vec<DataBlock>> {
        let num_streams = num_streams.min(MAX_NUM_DATA_STREAMS);
        let block_bytes = block_size_in_bytes(num_streams);
        let available = 2 * self.num_words_in_fifo()? as usize / block_bytes;
        let n = available.min(max_blocks);
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; n * block_bytes];
        let got = self.read_fifo(&mut buf, timeout)?;
        if got % block_bytes != 0 {
            log::warn!("FIFO read returned a partial block ({} of {} bytes)", got % block_bytes, block_bytes);
        }
        buf.chunks_exact(block_bytes)
            .take(got / block_bytes)
            .map(|chunk| DataBlock::parse(chunk, num_streams))
            .collect()
    }
}

impl<T: Transport + ?Sized> RhythmExt for T {}

pub(crate) fn not_open(what: &str) -> RhdError {
    RhdError::DeviceUnreachable(format!("{}: device is not open", what))
}
