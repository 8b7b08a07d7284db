//! Routing of amplifier channels to the board's analog outputs.
//!
//! The board has 8 DAC outputs. Each slot is either unassigned or bound to one `(stream, channel)` pair of
//! the channel table, and carries a threshold used by the board's digital comparators and by downstream
//! event detection. Slots 0 and 1 double as the left/right audio monitor ([`DacRouter::assign_audio_out`]).
//!
//! Binding an already-bound slot replaces the previous binding. Changes mark the slot dirty so the board
//! controller only rewrites the outputs that changed ([`DacRouter::take_dirty`]).

use serde::{Deserialize, Serialize};

use crate::channel_map::ChannelMap;
use crate::error::{Result, RhdError};

pub const NUM_DAC_SLOTS: usize = 8;
pub const AUDIO_LEFT: usize = 0;
pub const AUDIO_RIGHT: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DacBinding {
    pub stream: usize,
    pub channel: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DacSlot {
    pub binding: Option<DacBinding>,
    /// Microvolts
    pub threshold: f32,
}

/// First-order high-pass applied to every DAC output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DacHighPass {
    pub cutoff: f64,
    pub enabled: bool,
}

impl Default for DacHighPass {
    fn default() -> Self {
        Self {
            cutoff: 250.0,
            enabled: false,
        }
    }
}

/// Digital-output behaviour: TTL-triggered amplifier fast settle and the TTL output source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlSettings {
    pub fast_settle: bool,
    pub fast_settle_channel: usize,
    /// When set, TTL outputs follow the DAC threshold comparators
    pub output_mode: bool,
}

#[derive(Clone, Debug, Default)]
pub struct DacRouter {
    slots: [DacSlot; NUM_DAC_SLOTS],
    dirty: [bool; NUM_DAC_SLOTS],
    hpf: DacHighPass,
}

fn check_slot(slot: usize) -> Result<()> {
    if slot >= NUM_DAC_SLOTS {
        return Err(RhdError::InvalidParameter(format!(
            "DAC slot {} out of range 0..{}",
            slot, NUM_DAC_SLOTS
        )));
    }
    Ok(())
}

impl DacRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `slot` to `(stream, channel)`, replacing any previous binding.
    pub fn set_dac_channel(&mut self, slot: usize, stream: usize, channel: usize) -> Result<()> {
        check_slot(slot)?;
        let binding = Some(DacBinding { stream, channel });
        if self.slots[slot].binding != binding {
            self.slots[slot].binding = binding;
            self.dirty[slot] = true;
        }
        Ok(())
    }

    pub fn clear_dac_channel(&mut self, slot: usize) -> Result<()> {
        check_slot(slot)?;
        if self.slots[slot].binding.take().is_some() {
            self.dirty[slot] = true;
        }
        Ok(())
    }

    pub fn set_dac_threshold(&mut self, slot: usize, threshold: f32) -> Result<()> {
        check_slot(slot)?;
        if self.slots[slot].threshold != threshold {
            self.slots[slot].threshold = threshold;
            self.dirty[slot] = true;
        }
        Ok(())
    }

    /// Binds audio output `side` ([`AUDIO_LEFT`] or [`AUDIO_RIGHT`]) to the `data_channel`-th amplifier
    /// channel of the table.
    pub fn assign_audio_out(&mut self, side: usize, data_channel: usize, map: &ChannelMap) -> Result<DacBinding> {
        if side > AUDIO_RIGHT {
            return Err(RhdError::InvalidParameter(format!("audio output {} is not left or right", side)));
        }
        let (stream, channel) = map
            .amplifier_channel(data_channel)
            .ok_or_else(|| RhdError::ChannelNotFound(format!("amplifier channel {}", data_channel)))?;
        self.set_dac_channel(side, stream, channel)?;
        Ok(DacBinding { stream, channel })
    }

    pub fn slot(&self, slot: usize) -> Option<&DacSlot> {
        self.slots.get(slot)
    }

    pub fn dac_channels(&self) -> [Option<DacBinding>; NUM_DAC_SLOTS] {
        self.slots.map(|s| s.binding)
    }

    pub fn thresholds(&self) -> [f32; NUM_DAC_SLOTS] {
        self.slots.map(|s| s.threshold)
    }

    /// Unbinds slots whose channel no longer exists in `map`. Returns the cleared slots.
    pub fn retain_valid(&mut self, map: &ChannelMap) -> Vec<usize> {
        let mut cleared = Vec::new();
        for (k, slot) in self.slots.iter_mut().enumerate() {
            if let Some(b) = slot.binding {
                if !map.is_valid_amplifier(b.stream, b.channel) {
                    log::info!("DAC {} unbound: stream {} channel {} no longer present", k, b.stream, b.channel);
                    slot.binding = None;
                    self.dirty[k] = true;
                    cleared.push(k);
                }
            }
        }
        cleared
    }

    /// Slots changed since the last call, with their current state.
    pub fn take_dirty(&mut self) -> Vec<(usize, DacSlot)> {
        let out = (0..NUM_DAC_SLOTS)
            .filter(|k| self.dirty[*k])
            .map(|k| (k, self.slots[k]))
            .collect();
        self.dirty = [false; NUM_DAC_SLOTS];
        out
    }

    /// Forces every slot to be rewritten, e.g. after the board was reinitialised.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = [true; NUM_DAC_SLOTS];
    }

    pub fn hpf(&self) -> DacHighPass {
        self.hpf
    }

    /// Returns false when the filter already had these settings.
    pub fn set_hpf(&mut self, cutoff: f64, enabled: bool) -> bool {
        let hpf = DacHighPass { cutoff, enabled };
        if hpf == self.hpf {
            return false;
        }
        self.hpf = hpf;
        true
    }
}

#[cfg(test)]
mod test {
    use crate::channel_map::{DataStream, NamingScheme, StreamSlot};
    use crate::dac::*;
    use crate::datablock::ChipId;

    fn map() -> ChannelMap {
        let mut map = ChannelMap::new(NamingScheme::Global);
        map.set_streams(vec![
            DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132),
            DataStream::new(StreamSlot::new(1, false), ChipId::Rhd2132),
            DataStream::new(StreamSlot::new(2, false), ChipId::Rhd2216),
        ]);
        map
    }

    #[test]
    fn last_write_wins() {
        let mut dac = DacRouter::new();
        dac.set_dac_channel(0, 1, 3).unwrap();
        dac.set_dac_channel(0, 2, 1).unwrap();
        assert_eq!(dac.dac_channels()[0], Some(DacBinding { stream: 2, channel: 1 }));
        assert!(dac.dac_channels()[1..].iter().all(|b| b.is_none()));
    }

    #[test]
    fn dirty_tracking() {
        let mut dac = DacRouter::new();
        dac.set_dac_channel(3, 0, 0).unwrap();
        dac.set_dac_threshold(5, -50.0).unwrap();
        let dirty: Vec<usize> = dac.take_dirty().into_iter().map(|(k, _)| k).collect();
        assert_eq!(dirty, vec![3, 5]);
        dac.set_dac_channel(3, 0, 0).unwrap();
        assert!(dac.take_dirty().is_empty());
        dac.clear_dac_channel(3).unwrap();
        assert_eq!(dac.take_dirty()[0].1.binding, None);
    }

    #[test]
    fn slot_range() {
        let mut dac = DacRouter::new();
        assert!(dac.set_dac_channel(NUM_DAC_SLOTS, 0, 0).is_err());
        assert!(dac.set_dac_threshold(9, 1.0).is_err());
    }

    #[test]
    fn audio_out_resolves_channel_table() {
        let mut dac = DacRouter::new();
        let map = map();
        let b = dac.assign_audio_out(AUDIO_RIGHT, 70, &map).unwrap();
        assert_eq!(b, DacBinding { stream: 2, channel: 6 });
        assert!(dac.assign_audio_out(AUDIO_LEFT, 80, &map).is_err());
        assert!(dac.assign_audio_out(2, 0, &map).is_err());
    }

    #[test]
    fn topology_change_unbinds_missing_channels() {
        let mut dac = DacRouter::new();
        let mut map = map();
        dac.set_dac_channel(0, 2, 10).unwrap();
        dac.set_dac_channel(1, 0, 10).unwrap();
        map.set_streams(vec![DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132)]);
        assert_eq!(dac.retain_valid(&map), vec![0]);
        assert_eq!(dac.dac_channels()[1], Some(DacBinding { stream: 0, channel: 10 }));
    }

    #[test]
    fn hpf_change_detection() {
        let mut dac = DacRouter::new();
        assert!(!dac.set_hpf(250.0, false));
        assert!(dac.set_hpf(300.0, true));
        assert_eq!(dac.hpf(), DacHighPass { cutoff: 300.0, enabled: true });
    }
}
