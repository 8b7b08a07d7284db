//! Wire format of one FIFO read: a block of 60 multiplexed samples spanning all enabled data streams.
//!
//! Every sample is a run of 16-bit little-endian words:
//!
//! | words              | content                                        |
//! |--------------------|------------------------------------------------|
//! | 4                  | header magic `0xC691199927021942`              |
//! | 2                  | sample timestamp (low word first)              |
//! | 3 × streams        | auxiliary command results, slot-major          |
//! | 32 × streams       | amplifier channels, channel-major              |
//! | 1 × streams        | filler                                         |
//! | 8                  | board ADC inputs                               |
//! | 1                  | TTL inputs                                     |
//! | 1                  | TTL outputs                                    |
//!
//! Auxiliary slot 2 carries the ROM register readback used by [`DataBlock::device_id`] to identify the chip
//! on each stream.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RhdError};

pub const SAMPLES_PER_DATA_BLOCK: usize = 60;
pub const HEADER_MAGIC: u64 = 0xC691_1999_2702_1942;
pub const MAX_NUM_DATA_STREAMS: usize = 8;
pub const CHANNELS_PER_STREAM: usize = 32;
pub const AUX_SLOTS: usize = 3;
pub const NUM_BOARD_ADCS: usize = 8;

pub const REGISTER_59_MISO_A: u8 = 53;
pub const REGISTER_59_MISO_B: u8 = 58;

// Sample offsets of the ROM readback in auxiliary slot 2
const ROM_CHIP_ID: usize = 19;
const ROM_REGISTER_59: usize = 23;
const ROM_COMPANY: usize = 24;
const ROM_INTAN: usize = 32;

pub fn words_per_sample(num_streams: usize) -> usize {
    4 + 2 + num_streams * (AUX_SLOTS + CHANNELS_PER_STREAM + 1) + NUM_BOARD_ADCS + 2
}

pub fn block_size_in_words(num_streams: usize) -> usize {
    SAMPLES_PER_DATA_BLOCK * words_per_sample(num_streams)
}

pub fn block_size_in_bytes(num_streams: usize) -> usize {
    2 * block_size_in_words(num_streams)
}

/// Amplifier chip families that can sit behind a headstage port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChipId {
    Rhd2132,
    Rhd2216,
    Rhd2164,
}

impl ChipId {
    pub fn from_rom(id: u16) -> Option<ChipId> {
        match id {
            1 => Some(ChipId::Rhd2132),
            2 => Some(ChipId::Rhd2216),
            4 => Some(ChipId::Rhd2164),
            _ => None,
        }
    }

    pub fn rom_id(&self) -> u16 {
        match self {
            ChipId::Rhd2132 => 1,
            ChipId::Rhd2216 => 2,
            ChipId::Rhd2164 => 4,
        }
    }

    /// Amplifier channels on the chip. An RHD2164 delivers them as two 32-channel streams.
    pub fn num_channels(&self) -> usize {
        match self {
            ChipId::Rhd2132 => 32,
            ChipId::Rhd2216 => 16,
            ChipId::Rhd2164 => 64,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataBlock {
    num_streams: usize,
    pub timestamps: Vec<u32>,
    /// `[stream, slot, sample]`
    pub aux: Array3<u16>,
    /// `[stream, channel, sample]`
    pub amplifier: Array3<u16>,
    /// `[adc, sample]`
    pub board_adc: Array2<u16>,
    pub ttl_in: Vec<u16>,
    pub ttl_out: Vec<u16>,
}

impl DataBlock {
    pub fn new(num_streams: usize) -> Self {
        Self {
            num_streams,
            timestamps: vec![0; SAMPLES_PER_DATA_BLOCK],
            aux: Array3::zeros((num_streams, AUX_SLOTS, SAMPLES_PER_DATA_BLOCK)),
            amplifier: Array3::from_elem(
                (num_streams, CHANNELS_PER_STREAM, SAMPLES_PER_DATA_BLOCK),
                32768,
            ),
            board_adc: Array2::zeros((NUM_BOARD_ADCS, SAMPLES_PER_DATA_BLOCK)),
            ttl_in: vec![0; SAMPLES_PER_DATA_BLOCK],
            ttl_out: vec![0; SAMPLES_PER_DATA_BLOCK],
        }
    }

    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    /// Parses one block from `bytes`, which must hold at least [`block_size_in_bytes`] bytes.
    pub fn parse(bytes: &[u8], num_streams: usize) -> Result<Self> {
        let needed = block_size_in_bytes(num_streams);
        if bytes.len() < needed {
            return Err(RhdError::CorruptBlock(format!(
                "expected {} bytes for {} streams, got {}",
                needed,
                num_streams,
                bytes.len()
            )));
        }
        let word = |i: usize| u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);

        let mut block = DataBlock::new(num_streams);
        let mut idx = 0;
        for t in 0..SAMPLES_PER_DATA_BLOCK {
            let header = (0..4).fold(0u64, |acc, k| acc | (word(idx + k) as u64) << (16 * k));
            if header != HEADER_MAGIC {
                return Err(RhdError::CorruptBlock(format!(
                    "bad header {:#018x} at sample {}",
                    header, t
                )));
            }
            idx += 4;
            block.timestamps[t] = word(idx) as u32 | (word(idx + 1) as u32) << 16;
            idx += 2;
            for slot in 0..AUX_SLOTS {
                for stream in 0..num_streams {
                    block.aux[[stream, slot, t]] = word(idx);
                    idx += 1;
                }
            }
            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..num_streams {
                    block.amplifier[[stream, channel, t]] = word(idx);
                    idx += 1;
                }
            }
            // Filler
            idx += num_streams;
            for adc in 0..NUM_BOARD_ADCS {
                block.board_adc[[adc, t]] = word(idx);
                idx += 1;
            }
            block.ttl_in[t] = word(idx);
            block.ttl_out[t] = word(idx + 1);
            idx += 2;
        }
        Ok(block)
    }

    /// Serializes the block in wire order, appending to `out`.
    pub fn write_bytes(&self, out: &mut Vec<u8>) {
        out.reserve(block_size_in_bytes(self.num_streams));
        let mut push = |w: u16| out.extend_from_slice(&w.to_le_bytes());
        for t in 0..SAMPLES_PER_DATA_BLOCK {
            for k in 0..4 {
                push((HEADER_MAGIC >> (16 * k)) as u16);
            }
            push(self.timestamps[t] as u16);
            push((self.timestamps[t] >> 16) as u16);
            for slot in 0..AUX_SLOTS {
                for stream in 0..self.num_streams {
                    push(self.aux[[stream, slot, t]]);
                }
            }
            for channel in 0..CHANNELS_PER_STREAM {
                for stream in 0..self.num_streams {
                    push(self.amplifier[[stream, channel, t]]);
                }
            }
            for _ in 0..self.num_streams {
                push(0);
            }
            for adc in 0..NUM_BOARD_ADCS {
                push(self.board_adc[[adc, t]]);
            }
            push(self.ttl_in[t]);
            push(self.ttl_out[t]);
        }
    }

    /// Reads the chip identity from the ROM readback on `stream`.
    ///
    /// Returns the chip family and the value of register 59 (which tells the two halves of an RHD2164
    /// apart), or `None` when the readback does not carry the Intan signature, i.e. when SPI
    /// communication on this stream failed at the current MISO delay.
    pub fn device_id(&self, stream: usize) -> Option<(ChipId, u8)> {
        if stream >= self.num_streams {
            return None;
        }
        let rom = |t: usize| self.aux[[stream, 2, t]];
        let signature_ok = b"RHD"
            .iter()
            .enumerate()
            .all(|(k, c)| rom(ROM_COMPANY + k) == *c as u16)
            && b"INTAN"
                .iter()
                .enumerate()
                .all(|(k, c)| rom(ROM_INTAN + k) == *c as u16);
        if !signature_ok {
            return None;
        }
        let chip = ChipId::from_rom(rom(ROM_CHIP_ID))?;
        Some((chip, rom(ROM_REGISTER_59) as u8))
    }

    /// Writes the ROM readback a chip of type `chip` would return on `stream`.
    pub fn set_rom_readback(&mut self, stream: usize, chip: ChipId, register_59: u8) {
        self.aux[[stream, 2, ROM_CHIP_ID]] = chip.rom_id();
        self.aux[[stream, 2, ROM_REGISTER_59]] = register_59 as u16;
        for (k, c) in b"RHD".iter().enumerate() {
            self.aux[[stream, 2, ROM_COMPANY + k]] = *c as u16;
        }
        for (k, c) in b"INTAN".iter().enumerate() {
            self.aux[[stream, 2, ROM_INTAN + k]] = *c as u16;
        }
    }
}
