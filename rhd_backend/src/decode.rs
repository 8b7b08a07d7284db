//! Conversion of raw [`DataBlock`]s into scaled per-channel samples.
//!
//! The [`Decoder`] walks a block sample by sample and emits values in channel-table order (see
//! [`crate::channel_map`]): amplifier channels in microvolts, auxiliary inputs in volts and board ADCs in
//! volts. Auxiliary inputs are only sampled on every 4th sample; the decoder holds the last value of each
//! auxiliary input and repeats it so that auxiliary channels stream at the full rate like every other channel.

use std::collections::VecDeque;

use ndarray::{Array2, Array3};

use crate::channel_map::{DecodeLayout, ADC_BIT_VOLTS, AMPLIFIER_BIT_VOLTS, AUX_BIT_VOLTS, AUX_INPUTS_PER_STREAM};
use crate::datablock::{DataBlock, CHANNELS_PER_STREAM, NUM_BOARD_ADCS, SAMPLES_PER_DATA_BLOCK};

const ADC_OFFSET_VOLTS: f32 = 5.0 + 0.4096;

pub fn amplifier_microvolts(word: u16) -> f32 {
    AMPLIFIER_BIT_VOLTS * (word as f32 - 32768.0)
}

pub fn aux_volts(word: u16) -> f32 {
    AUX_BIT_VOLTS * word as f32
}

pub fn adc_volts(word: u16) -> f32 {
    ADC_BIT_VOLTS * word as f32 - ADC_OFFSET_VOLTS
}

/// One decoded block, ready for the host.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedBlock {
    /// `[channel, sample]`, in channel-table order
    pub samples: Array2<f32>,
    pub timestamps: Vec<u32>,
    /// TTL input word per sample
    pub event_codes: Vec<u16>,
}

impl DecodedBlock {
    pub fn num_samples(&self) -> usize {
        self.timestamps.len()
    }

    pub fn num_channels(&self) -> usize {
        self.samples.nrows()
    }
}

pub struct Decoder {
    layout: DecodeLayout,
    aux_buffer: Vec<f32>,
}

impl Decoder {
    pub fn new(layout: DecodeLayout) -> Self {
        let aux_buffer = vec![0.0; AUX_INPUTS_PER_STREAM * layout.num_streams()];
        Self { layout, aux_buffer }
    }

    pub fn layout(&self) -> &DecodeLayout {
        &self.layout
    }

    /// Replaces the layout after a topology or acquisition-flag change. Held auxiliary values are dropped.
    pub fn set_layout(&mut self, layout: DecodeLayout) {
        if layout != self.layout {
            self.aux_buffer = vec![0.0; AUX_INPUTS_PER_STREAM * layout.num_streams()];
            self.layout = layout;
        }
    }

    pub fn decode(&mut self, block: &DataBlock) -> DecodedBlock {
        let num_streams = self.layout.num_streams().min(block.num_streams());
        let mut samples = Array2::<f32>::zeros((self.layout.num_channels(), SAMPLES_PER_DATA_BLOCK));

        for t in 0..SAMPLES_PER_DATA_BLOCK {
            let mut chan = 0;
            for (stream, &n) in self.layout.stream_channels.iter().enumerate().take(num_streams) {
                for k in 0..n.min(CHANNELS_PER_STREAM) {
                    samples[[chan, t]] = amplifier_microvolts(block.amplifier[[stream, k, t]]);
                    chan += 1;
                }
            }
            if self.layout.acquire_aux {
                for stream in 0..num_streams {
                    // Auxiliary results for inputs 1..3 arrive on samples 1, 2, 3 of every group of 4
                    if t % 4 == 1 {
                        for k in 0..AUX_INPUTS_PER_STREAM {
                            let word = block.aux[[stream, 1, (t + k).min(SAMPLES_PER_DATA_BLOCK - 1)]];
                            self.aux_buffer[stream * AUX_INPUTS_PER_STREAM + k] = aux_volts(word);
                        }
                    }
                    for k in 0..AUX_INPUTS_PER_STREAM {
                        samples[[chan, t]] = self.aux_buffer[stream * AUX_INPUTS_PER_STREAM + k];
                        chan += 1;
                    }
                }
            }
            if self.layout.acquire_adc {
                for adc in 0..NUM_BOARD_ADCS {
                    samples[[chan, t]] = adc_volts(block.board_adc[[adc, t]]);
                    chan += 1;
                }
            }
        }

        DecodedBlock {
            samples,
            timestamps: block.timestamps.clone(),
            event_codes: block.ttl_in.clone(),
        }
    }
}

/// Drains up to `num_blocks` blocks from `queue` into a `[stream, channel, sample]` tensor of amplifier
/// voltages in microvolts. Returns the tensor and the number of blocks actually consumed; on underrun the
/// remaining samples stay at zero.
pub fn load_amplifier_data(
    queue: &mut VecDeque<DataBlock>,
    num_blocks: usize,
    num_streams: usize,
) -> (Array3<f64>, usize) {
    let mut data = Array3::<f64>::zeros((num_streams, CHANNELS_PER_STREAM, num_blocks * SAMPLES_PER_DATA_BLOCK));
    let mut loaded = 0;
    while loaded < num_blocks {
        let Some(block) = queue.pop_front() else {
            break;
        };
        let offset = loaded * SAMPLES_PER_DATA_BLOCK;
        for stream in 0..num_streams.min(block.num_streams()) {
            for channel in 0..CHANNELS_PER_STREAM {
                for t in 0..SAMPLES_PER_DATA_BLOCK {
                    data[[stream, channel, offset + t]] =
                        amplifier_microvolts(block.amplifier[[stream, channel, t]]) as f64;
                }
            }
        }
        loaded += 1;
    }
    if loaded < num_blocks {
        log::warn!("Amplifier data underrun: {} of {} blocks available", loaded, num_blocks);
    }
    (data, loaded)
}

#[cfg(test)]
mod test {
    use crate::decode::*;

    fn layout(aux: bool, adc: bool) -> DecodeLayout {
        DecodeLayout {
            stream_channels: vec![32, 16],
            acquire_aux: aux,
            acquire_adc: adc,
        }
    }

    mod scaling {
        use super::*;

        #[test]
        fn amplifier_midscale_is_zero() {
            assert_eq!(amplifier_microvolts(32768), 0.0);
            assert!((amplifier_microvolts(32769) - 0.195).abs() < 1e-6);
        }

        #[test]
        fn adc_range() {
            assert!((adc_volts(0) + 5.4096).abs() < 1e-4);
            assert!((adc_volts(65535) - 4.5903).abs() < 1e-3);
        }
    }

    mod blocks {
        use super::*;

        #[test]
        fn channel_order_follows_layout() {
            let mut block = DataBlock::new(2);
            block.amplifier[[1, 15, 0]] = 32768 + 100;
            block.board_adc[[3, 0]] = 32768;
            let mut decoder = Decoder::new(layout(true, true));
            let out = decoder.decode(&block);
            assert_eq!(out.num_channels(), 32 + 16 + 6 + 8);
            assert_eq!(out.num_samples(), SAMPLES_PER_DATA_BLOCK);
            assert!((out.samples[[47, 0]] - 19.5).abs() < 1e-3);
            assert!((out.samples[[54 + 3, 0]] + 0.4096).abs() < 1e-3);
        }

        #[test]
        fn aux_is_held_between_updates() {
            let mut block = DataBlock::new(2);
            for t in 0..SAMPLES_PER_DATA_BLOCK {
                block.aux[[0, 1, t]] = t as u16 * 10;
            }
            let mut decoder = Decoder::new(layout(true, false));
            let out = decoder.decode(&block);
            let aux1 = 48;
            assert_eq!(out.samples[[aux1, 0]], 0.0);
            assert_eq!(out.samples[[aux1, 1]], aux_volts(10));
            assert_eq!(out.samples[[aux1 + 2, 1]], aux_volts(30));
            assert_eq!(out.samples[[aux1, 4]], aux_volts(10));
            assert_eq!(out.samples[[aux1, 5]], aux_volts(50));
            // Held into the next block until sample 1
            let out = decoder.decode(&DataBlock::new(2));
            assert_eq!(out.samples[[aux1, 0]], aux_volts(570));
            assert_eq!(out.samples[[aux1, 1]], 0.0);
        }

        #[test]
        fn underrun_reports_loaded_blocks() {
            let mut queue: VecDeque<DataBlock> = (0..3).map(|_| DataBlock::new(1)).collect();
            let (data, loaded) = load_amplifier_data(&mut queue, 5, 1);
            assert_eq!(loaded, 3);
            assert_eq!(data.shape(), &[1, 32, 300]);
            assert!(queue.is_empty());
        }
    }
}
