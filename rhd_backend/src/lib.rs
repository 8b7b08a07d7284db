//! Hardware-independent core of an Intan RHD2000 acquisition engine.
//!
//! Everything here is pure logic and can be exercised without a board:
//!
//! - [`registers`]: the on-chip register image, sample rates and the quantization of bandwidth, DSP cutoff,
//!   cable delay and DAC settings to what the hardware can realise.
//! - [`datablock`]: the FIFO wire format and chip identification from ROM readback.
//! - [`channel_map`]: the logical channel table, naming schemes and operator edits that survive topology
//!   changes.
//! - [`decode`]: raw blocks to scaled per-channel samples.
//! - [`impedance`]: complex-amplitude extraction and impedance calibration.
//! - [`dac`]: the analog output slot table.
//! - [`config`]: desired device settings persisted as JSON.
//!
//! The device-facing layer (transport, board control, timer-driven acquisition) lives in `rhdstream_backend`.

pub mod channel_map;
pub mod config;
pub mod dac;
pub mod datablock;
pub mod decode;
pub mod error;
pub mod impedance;
pub mod registers;
pub mod utils;

pub use channel_map::*;
pub use config::*;
pub use dac::*;
pub use datablock::*;
pub use decode::*;
pub use error::*;
pub use impedance::*;
pub use registers::*;
pub use utils::*;
