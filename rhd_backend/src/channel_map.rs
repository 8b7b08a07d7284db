//! Logical channel table derived from the headstage topology.
//!
//! ## Overview
//!
//! A port scan reports which headstages answered on which of the 8 stream slots (4 ports × 2 MISO lines).
//! [`ChannelMap`] turns that topology into the table of logical channels the host sees: every amplifier
//! channel of every enabled stream, then the auxiliary inputs of every enabled stream (when auxiliary
//! acquisition is on), then the 8 board ADCs (when ADC acquisition is on). Amplifier and auxiliary blocks
//! are stream-major; consumers rely on this order matching the physical layout.
//!
//! ## Naming and operator edits
//!
//! Names and gains follow the active [`NamingScheme`] until an operator edits a channel with
//! [`ChannelMap::modify_channel_name`] or [`ChannelMap::modify_channel_gain`]. Edited channels are flagged
//! modified and survive every regeneration of the table ([`ChannelMap::set_default_channel_names_and_type`]).
//!
//! Identity across regenerations is physical: channel type, stream slot (port, MISO line, DDR half) and
//! channel index within the stream. Every [`Channel`] keeps the snapshot it had before the last regeneration,
//! which [`ChannelMap::channel_modified`] exposes so a caller reconciling a topology change can decide whether
//! to keep or reset an edit. Edits on channels whose headstage disappeared are retained and come back when the
//! same physical identity reappears.
//!
//! ## Example
//!
//! ```
//! use rhd_backend::channel_map::*;
//! use rhd_backend::datablock::ChipId;
//!
//! let mut map = ChannelMap::new(NamingScheme::Global);
//! map.set_streams(vec![
//!     DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132),
//!     DataStream::new(StreamSlot::new(2, false), ChipId::Rhd2132),
//! ]);
//! assert_eq!(map.num_channels(), 64);
//! map.modify_channel_name(ChannelType::Amplifier, 0, 5, "ref").unwrap();
//! map.set_default_channel_names_and_type();
//! assert_eq!(map.channel_name(ChannelType::Amplifier, 0, 5).as_deref(), Some("ref"));
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::datablock::{ChipId, CHANNELS_PER_STREAM, MAX_NUM_DATA_STREAMS, NUM_BOARD_ADCS};
use crate::error::{Result, RhdError};

pub const AMPLIFIER_BIT_VOLTS: f32 = 0.195;
pub const AUX_BIT_VOLTS: f32 = 0.0000374;
pub const ADC_BIT_VOLTS: f32 = 0.00015258789;
pub const AUX_INPUTS_PER_STREAM: usize = 3;
pub const NUM_EVENT_CHANNELS: usize = 16;

const PORT_LETTERS: [char; 4] = ['A', 'B', 'C', 'D'];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Amplifier,
    Aux,
    Adc,
    Event,
}

impl ChannelType {
    pub fn default_gain(&self) -> f32 {
        match self {
            ChannelType::Amplifier => AMPLIFIER_BIT_VOLTS,
            ChannelType::Aux => AUX_BIT_VOLTS,
            ChannelType::Adc => ADC_BIT_VOLTS,
            ChannelType::Event => 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingScheme {
    /// "CH1", "AUX1", "ADC1", numbered across all streams
    #[default]
    Global,
    /// "A1-00", "A1-AUX1", numbered by chip channel within each stream
    PerStream,
}

/// Physical position of a data stream: stream slot `0..8` (port = slot / 2) and, for the second half
/// of an RHD2164, the DDR flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamSlot {
    pub slot: usize,
    pub ddr: bool,
}

impl StreamSlot {
    pub fn new(slot: usize, ddr: bool) -> Self {
        Self { slot, ddr }
    }

    pub fn port(&self) -> usize {
        self.slot / 2
    }

    pub fn label(&self) -> String {
        format!(
            "{}{}{}",
            PORT_LETTERS[self.port() % 4],
            self.slot % 2 + 1,
            if self.ddr { "B" } else { "" }
        )
    }

    /// Bit of this stream in the board's stream-enable mask.
    pub fn enable_bit(&self) -> u32 {
        1 << (self.slot + if self.ddr { MAX_NUM_DATA_STREAMS } else { 0 })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataStream {
    pub slot: StreamSlot,
    pub chip: ChipId,
    pub num_channels: usize,
    pub enabled: bool,
}

impl DataStream {
    pub fn new(slot: StreamSlot, chip: ChipId) -> Self {
        Self {
            slot,
            chip,
            num_channels: chip.num_channels().min(CHANNELS_PER_STREAM),
            enabled: true,
        }
    }

    // Chip channel number of the first channel in this stream
    fn chip_offset(&self) -> usize {
        if self.slot.ddr {
            CHANNELS_PER_STREAM
        } else {
            0
        }
    }
}

/// One entry of the channel table as it stood at some point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub name: String,
    pub ty: ChannelType,
    /// Index among enabled streams; `None` for board ADCs
    pub stream: Option<usize>,
    pub source: Option<StreamSlot>,
    /// Channel index within its stream (or ADC number)
    pub original_index: usize,
    pub gain: f32,
    pub modified: bool,
    pub position: usize,
}

impl ChannelState {
    fn same_identity(&self, other: &ChannelState) -> bool {
        self.ty == other.ty && self.source == other.source && self.original_index == other.original_index
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    current: ChannelState,
    previous: Option<ChannelState>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.current.name
    }
    pub fn ty(&self) -> ChannelType {
        self.current.ty
    }
    pub fn stream(&self) -> Option<usize> {
        self.current.stream
    }
    pub fn source(&self) -> Option<StreamSlot> {
        self.current.source
    }
    pub fn original_index(&self) -> usize {
        self.current.original_index
    }
    pub fn gain(&self) -> f32 {
        self.current.gain
    }
    pub fn is_modified(&self) -> bool {
        self.current.modified
    }
    pub fn current(&self) -> &ChannelState {
        &self.current
    }
    /// Snapshot taken before the last regeneration, if this physical channel existed then.
    pub fn previous(&self) -> Option<&ChannelState> {
        self.previous.as_ref()
    }

    fn matches(&self, ty: ChannelType, stream: usize, index: usize) -> bool {
        self.current.ty == ty
            && self.current.original_index == index
            && (ty == ChannelType::Adc || self.current.stream == Some(stream))
    }
}

/// Row of the enumerable channel table handed to consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub ty: ChannelType,
    pub stream: Option<usize>,
    pub original_index: usize,
    pub gain: f32,
}

/// Result of [`ChannelMap::channel_modified`].
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelModification {
    pub is_modified: bool,
    pub old_name: String,
    pub old_gain: f32,
    pub position: usize,
}

/// Per-stream shape used by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeLayout {
    pub stream_channels: Vec<usize>,
    pub acquire_aux: bool,
    pub acquire_adc: bool,
}

impl DecodeLayout {
    pub fn num_streams(&self) -> usize {
        self.stream_channels.len()
    }

    pub fn num_channels(&self) -> usize {
        self.stream_channels.iter().sum::<usize>()
            + if self.acquire_aux { AUX_INPUTS_PER_STREAM * self.num_streams() } else { 0 }
            + if self.acquire_adc { NUM_BOARD_ADCS } else { 0 }
    }
}

pub struct ChannelMap {
    streams: IndexMap<StreamSlot, DataStream>,
    scheme: NamingScheme,
    acquire_aux: bool,
    acquire_adc: bool,
    channels: Vec<Channel>,
    retired: Vec<ChannelState>,
}

impl ChannelMap {
    pub fn new(scheme: NamingScheme) -> Self {
        Self {
            streams: IndexMap::new(),
            scheme,
            acquire_aux: false,
            acquire_adc: false,
            channels: Vec::new(),
            retired: Vec::new(),
        }
    }

    /// Replaces the topology with the streams found by a port scan and regenerates the table.
    /// Streams are kept in slot order; anything beyond [`MAX_NUM_DATA_STREAMS`] enabled streams is disabled.
    pub fn set_streams(&mut self, mut streams: Vec<DataStream>) {
        streams.sort_by_key(|s| s.slot);
        let mut n_enabled = 0;
        self.streams = streams
            .into_iter()
            .map(|mut s| {
                if s.enabled {
                    n_enabled += 1;
                    if n_enabled > MAX_NUM_DATA_STREAMS {
                        log::warn!("Stream {} exceeds the {} stream limit, disabled", s.slot.label(), MAX_NUM_DATA_STREAMS);
                        s.enabled = false;
                    }
                }
                (s.slot, s)
            })
            .collect();
        self.set_default_channel_names_and_type();
    }

    pub fn streams(&self) -> impl Iterator<Item = &DataStream> {
        self.streams.values()
    }

    pub fn enabled_streams(&self) -> impl Iterator<Item = &DataStream> {
        self.streams.values().filter(|s| s.enabled)
    }

    pub fn stream_by_slot(&self, slot: usize) -> impl Iterator<Item = &DataStream> {
        self.streams.values().filter(move |s| s.slot.slot == slot)
    }

    pub fn num_enabled_streams(&self) -> usize {
        self.enabled_streams().count()
    }

    /// Board stream-enable mask for the enabled streams.
    pub fn stream_mask(&self) -> u32 {
        self.enabled_streams().fold(0, |mask, s| mask | s.slot.enable_bit())
    }

    /// Enables or disables every stream on stream slot `slot`. Returns false when nothing was detected there
    /// or enabling would exceed the stream limit.
    pub fn set_slot_enabled(&mut self, slot: usize, enabled: bool) -> bool {
        let present = self.streams.values().filter(|s| s.slot.slot == slot).count();
        if present == 0 {
            return false;
        }
        let others = self.enabled_streams().filter(|s| s.slot.slot != slot).count();
        if enabled && others + present > MAX_NUM_DATA_STREAMS {
            return false;
        }
        self.streams
            .values_mut()
            .filter(|s| s.slot.slot == slot)
            .for_each(|s| s.enabled = enabled);
        self.set_default_channel_names_and_type();
        true
    }

    pub fn is_slot_enabled(&self, slot: usize) -> bool {
        self.stream_by_slot(slot).any(|s| s.enabled)
    }

    /// Restricts the streams on `slot` to their first `num_channels` channels.
    pub fn set_slot_channels(&mut self, slot: usize, num_channels: usize) -> Result<()> {
        if num_channels == 0 || num_channels > CHANNELS_PER_STREAM {
            return Err(RhdError::InvalidParameter(format!(
                "channel count {} out of range 1..={}",
                num_channels, CHANNELS_PER_STREAM
            )));
        }
        let mut found = false;
        for s in self.streams.values_mut().filter(|s| s.slot.slot == slot) {
            s.num_channels = num_channels.min(s.chip.num_channels());
            found = true;
        }
        if !found {
            return Err(RhdError::InvalidParameter(format!("no headstage on stream slot {}", slot)));
        }
        self.set_default_channel_names_and_type();
        Ok(())
    }

    pub fn naming_scheme(&self) -> NamingScheme {
        self.scheme
    }

    pub fn set_default_naming_scheme(&mut self, scheme: NamingScheme) {
        self.scheme = scheme;
        self.set_default_channel_names_and_type();
    }

    pub fn acquire_aux(&self) -> bool {
        self.acquire_aux
    }

    pub fn set_acquire_aux(&mut self, acquire: bool) {
        self.acquire_aux = acquire;
        self.update_channel_names();
    }

    pub fn acquire_adc(&self) -> bool {
        self.acquire_adc
    }

    pub fn set_acquire_adc(&mut self, acquire: bool) {
        self.acquire_adc = acquire;
        self.update_channel_names();
    }

    // Default table for the current topology and naming scheme
    fn default_layout(&self) -> Vec<ChannelState> {
        let enabled: Vec<&DataStream> = self.enabled_streams().collect();
        let mut out: Vec<ChannelState> = Vec::new();
        let push = |out: &mut Vec<ChannelState>, name: String, ty, stream, source, original_index| {
            let position = out.len();
            out.push(ChannelState {
                name,
                ty,
                stream,
                source,
                original_index,
                gain: ChannelType::default_gain(&ty),
                modified: false,
                position,
            });
        };

        let mut n = 0;
        for (si, s) in enabled.iter().enumerate() {
            for k in 0..s.num_channels {
                n += 1;
                let name = match self.scheme {
                    NamingScheme::Global => format!("CH{}", n),
                    NamingScheme::PerStream => format!("{}-{:02}", s.slot.label(), s.chip_offset() + k),
                };
                push(&mut out, name, ChannelType::Amplifier, Some(si), Some(s.slot), k);
            }
        }
        if self.acquire_aux {
            let mut n = 0;
            for (si, s) in enabled.iter().enumerate() {
                for k in 0..AUX_INPUTS_PER_STREAM {
                    n += 1;
                    let name = match self.scheme {
                        NamingScheme::Global => format!("AUX{}", n),
                        NamingScheme::PerStream => format!("{}-AUX{}", s.slot.label(), k + 1),
                    };
                    push(&mut out, name, ChannelType::Aux, Some(si), Some(s.slot), k);
                }
            }
        }
        if self.acquire_adc {
            for k in 0..NUM_BOARD_ADCS {
                push(&mut out, format!("ADC{}", k + 1), ChannelType::Adc, None, None, k);
            }
        }
        out
    }

    /// Regenerates names and types of every channel under the current naming scheme.
    ///
    /// Operator-modified channels keep their name and gain; their stream, type and position bookkeeping is
    /// refreshed. Each channel records the state it had before this call.
    pub fn set_default_channel_names_and_type(&mut self) {
        let mut old: Vec<ChannelState> = self.channels.drain(..).map(|c| c.current).collect();
        old.append(&mut self.retired);

        let channels: Vec<Channel> = self
            .default_layout()
            .into_iter()
            .map(|mut state| {
                let previous = old.iter().find(|o| o.same_identity(&state)).cloned();
                if let Some(prev) = previous.as_ref().filter(|p| p.modified) {
                    state.name = prev.name.clone();
                    state.gain = prev.gain;
                    state.modified = true;
                }
                Channel {
                    current: state,
                    previous,
                }
            })
            .collect();

        self.retired = old
            .into_iter()
            .filter(|o| o.modified && !channels.iter().any(|c| c.current.same_identity(o)))
            .collect();
        if !self.retired.is_empty() {
            log::debug!("{} edited channels not present in the current topology", self.retired.len());
        }
        self.channels = channels;
    }

    /// Regenerates the table after acquisition flags changed. Same semantics as
    /// [`ChannelMap::set_default_channel_names_and_type`].
    pub fn update_channel_names(&mut self) {
        self.set_default_channel_names_and_type();
    }

    fn position_of(&self, ty: ChannelType, stream: usize, index: usize) -> Option<usize> {
        self.channels.iter().position(|c| c.matches(ty, stream, index))
    }

    fn position_or_err(&self, ty: ChannelType, stream: usize, index: usize) -> Result<usize> {
        self.position_of(ty, stream, index).ok_or_else(|| {
            RhdError::ChannelNotFound(format!("{:?} channel {} on stream {}", ty, index, stream))
        })
    }

    /// Reconciliation query: whether the channel at this position carried an operator edit in its last
    /// snapshot, together with that snapshot's name and gain. `None` when no such channel exists now.
    pub fn channel_modified(&self, ty: ChannelType, stream: usize, index: usize) -> Option<ChannelModification> {
        let position = self.position_of(ty, stream, index)?;
        let channel = &self.channels[position];
        Some(match &channel.previous {
            Some(prev) => ChannelModification {
                is_modified: prev.modified,
                old_name: prev.name.clone(),
                old_gain: prev.gain,
                position,
            },
            None => ChannelModification {
                is_modified: false,
                old_name: channel.current.name.clone(),
                old_gain: channel.current.gain,
                position,
            },
        })
    }

    pub fn modify_channel_gain(&mut self, ty: ChannelType, stream: usize, index: usize, gain: f32) -> Result<usize> {
        let position = self.position_or_err(ty, stream, index)?;
        let state = &mut self.channels[position].current;
        state.gain = gain;
        state.modified = true;
        Ok(position)
    }

    pub fn modify_channel_name(&mut self, ty: ChannelType, stream: usize, index: usize, name: &str) -> Result<usize> {
        let position = self.position_or_err(ty, stream, index)?;
        let state = &mut self.channels[position].current;
        state.name = name.to_string();
        state.modified = true;
        Ok(position)
    }

    /// Drops an operator edit, restoring the default name and gain.
    pub fn reset_channel(&mut self, ty: ChannelType, stream: usize, index: usize) -> Result<usize> {
        let position = self.position_or_err(ty, stream, index)?;
        let default = self.default_layout().swap_remove(position);
        let state = &mut self.channels[position].current;
        state.name = default.name;
        state.gain = default.gain;
        state.modified = false;
        Ok(position)
    }

    pub fn channel_name(&self, ty: ChannelType, stream: usize, index: usize) -> Option<String> {
        if ty == ChannelType::Event {
            return (index < NUM_EVENT_CHANNELS).then(|| format!("TTL{}", index + 1));
        }
        self.position_of(ty, stream, index)
            .map(|p| self.channels[p].current.name.clone())
    }

    pub fn event_channel_names(&self) -> Vec<String> {
        (1..=NUM_EVENT_CHANNELS).map(|k| format!("TTL{}", k)).collect()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Full table in stream-major order: amplifiers, then auxiliary inputs, then board ADCs.
    pub fn channels_info(&self) -> Vec<ChannelInfo> {
        self.channels
            .iter()
            .map(|c| ChannelInfo {
                name: c.current.name.clone(),
                ty: c.current.ty,
                stream: c.current.stream,
                original_index: c.current.original_index,
                gain: c.current.gain,
            })
            .collect()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_amplifier_channels(&self) -> usize {
        self.enabled_streams().map(|s| s.num_channels).sum()
    }

    pub fn num_aux_channels(&self) -> usize {
        if self.acquire_aux {
            AUX_INPUTS_PER_STREAM * self.num_enabled_streams()
        } else {
            0
        }
    }

    pub fn num_adc_channels(&self) -> usize {
        if self.acquire_adc {
            NUM_BOARD_ADCS
        } else {
            0
        }
    }

    /// Gain (bit-to-volts scale) of the channel at table position `chan`.
    pub fn bit_volts(&self, chan: usize) -> Option<f32> {
        self.channels.get(chan).map(|c| c.current.gain)
    }

    /// `(stream, channel)` of the `index`-th amplifier channel of the table.
    pub fn amplifier_channel(&self, index: usize) -> Option<(usize, usize)> {
        self.channels
            .iter()
            .filter(|c| c.current.ty == ChannelType::Amplifier)
            .nth(index)
            .and_then(|c| c.current.stream.map(|s| (s, c.current.original_index)))
    }

    pub fn is_valid_amplifier(&self, stream: usize, channel: usize) -> bool {
        self.position_of(ChannelType::Amplifier, stream, channel).is_some()
    }

    pub fn decode_layout(&self) -> DecodeLayout {
        DecodeLayout {
            stream_channels: self.enabled_streams().map(|s| s.num_channels).collect(),
            acquire_aux: self.acquire_aux,
            acquire_adc: self.acquire_adc,
        }
    }
}

#[cfg(test)]
mod test {
    use crate::channel_map::*;

    fn two_headstages() -> ChannelMap {
        let mut map = ChannelMap::new(NamingScheme::Global);
        map.set_streams(vec![
            DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132),
            DataStream::new(StreamSlot::new(2, false), ChipId::Rhd2132),
        ]);
        map
    }

    mod topology {
        use super::*;

        #[test]
        fn channel_count_matches_streams() {
            let map = two_headstages();
            assert_eq!(map.num_enabled_streams(), 2);
            assert_eq!(map.num_channels(), 64);
            assert_eq!(map.num_amplifier_channels(), map.num_channels());
            assert_eq!(map.decode_layout().num_channels(), 64);
        }

        #[test]
        fn rhd2164_yields_two_streams() {
            let mut map = ChannelMap::new(NamingScheme::PerStream);
            map.set_streams(vec![
                DataStream::new(StreamSlot::new(4, false), ChipId::Rhd2164),
                DataStream::new(StreamSlot::new(4, true), ChipId::Rhd2164),
                DataStream::new(StreamSlot::new(1, false), ChipId::Rhd2216),
            ]);
            assert_eq!(map.num_channels(), 16 + 32 + 32);
            let names: Vec<String> = map.channels_info().into_iter().map(|c| c.name).collect();
            assert_eq!(names[0], "A2-00");
            assert_eq!(names[16], "C1-00");
            assert_eq!(names[48], "C1B-32");
            assert_eq!(map.stream_mask(), (1 << 1) | (1 << 4) | (1 << 12));
        }

        #[test]
        fn stream_limit_is_enforced() {
            let mut map = ChannelMap::new(NamingScheme::Global);
            let streams = (0..8)
                .flat_map(|slot| {
                    vec![
                        DataStream::new(StreamSlot::new(slot, false), ChipId::Rhd2164),
                        DataStream::new(StreamSlot::new(slot, true), ChipId::Rhd2164),
                    ]
                })
                .take(10)
                .collect();
            map.set_streams(streams);
            assert_eq!(map.num_enabled_streams(), MAX_NUM_DATA_STREAMS);
        }

        #[test]
        fn aux_and_adc_follow_amplifiers() {
            let mut map = two_headstages();
            map.set_acquire_aux(true);
            map.set_acquire_adc(true);
            assert_eq!(map.num_channels(), 64 + 6 + 8);
            let info = map.channels_info();
            assert_eq!(info[64].ty, ChannelType::Aux);
            assert_eq!(info[64].name, "AUX1");
            assert_eq!(info[70].ty, ChannelType::Adc);
            assert_eq!(info[70].stream, None);
            assert_eq!(map.bit_volts(70), Some(ADC_BIT_VOLTS));
        }

        #[test]
        fn disabling_a_slot_shrinks_the_table() {
            let mut map = two_headstages();
            assert!(map.set_slot_enabled(2, false));
            assert_eq!(map.num_channels(), 32);
            assert!(!map.is_slot_enabled(2));
            assert!(!map.set_slot_enabled(7, true));
            map.set_slot_channels(0, 16).unwrap();
            assert_eq!(map.num_channels(), 16);
        }
    }

    mod edits {
        use super::*;

        #[test]
        fn rename_survives_identical_rescan() {
            let mut map = two_headstages();
            map.modify_channel_name(ChannelType::Amplifier, 0, 5, "ref").unwrap();
            map.set_streams(vec![
                DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132),
                DataStream::new(StreamSlot::new(2, false), ChipId::Rhd2132),
            ]);
            let ch = &map.channels()[5];
            assert_eq!(ch.name(), "ref");
            assert!(ch.is_modified());
        }

        #[test]
        fn edit_survives_unrelated_topology_change() {
            let mut map = two_headstages();
            map.modify_channel_gain(ChannelType::Amplifier, 1, 3, 0.5).unwrap();
            map.modify_channel_name(ChannelType::Amplifier, 1, 3, "hippocampus").unwrap();
            // A headstage appears in front of the edited one, shifting its stream index
            map.set_streams(vec![
                DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132),
                DataStream::new(StreamSlot::new(1, false), ChipId::Rhd2216),
                DataStream::new(StreamSlot::new(2, false), ChipId::Rhd2132),
            ]);
            assert_eq!(map.channel_name(ChannelType::Amplifier, 2, 3).as_deref(), Some("hippocampus"));
            let m = map.channel_modified(ChannelType::Amplifier, 2, 3).unwrap();
            assert!(m.is_modified);
            assert_eq!(m.old_gain, 0.5);
            assert_eq!(m.position, 32 + 16 + 3);
            // Its neighbours were regenerated
            assert_eq!(map.channel_name(ChannelType::Amplifier, 2, 4).as_deref(), Some("CH53"));
        }

        #[test]
        fn edit_returns_when_headstage_is_replugged() {
            let mut map = two_headstages();
            map.modify_channel_name(ChannelType::Amplifier, 1, 0, "emg").unwrap();
            map.set_streams(vec![DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132)]);
            assert_eq!(map.num_channels(), 32);
            map.set_streams(vec![
                DataStream::new(StreamSlot::new(0, false), ChipId::Rhd2132),
                DataStream::new(StreamSlot::new(2, false), ChipId::Rhd2132),
            ]);
            assert_eq!(map.channel_name(ChannelType::Amplifier, 1, 0).as_deref(), Some("emg"));
        }

        #[test]
        fn scheme_switch_keeps_edits() {
            let mut map = two_headstages();
            map.modify_channel_name(ChannelType::Amplifier, 0, 1, "keep").unwrap();
            map.set_default_naming_scheme(NamingScheme::PerStream);
            assert_eq!(map.channel_name(ChannelType::Amplifier, 0, 1).as_deref(), Some("keep"));
            assert_eq!(map.channel_name(ChannelType::Amplifier, 1, 7).as_deref(), Some("B1-07"));
            let m = map.channel_modified(ChannelType::Amplifier, 1, 7).unwrap();
            assert!(!m.is_modified);
            assert_eq!(m.old_name, "CH40");
        }

        #[test]
        fn reset_restores_default() {
            let mut map = two_headstages();
            map.modify_channel_name(ChannelType::Amplifier, 0, 2, "x").unwrap();
            map.reset_channel(ChannelType::Amplifier, 0, 2).unwrap();
            assert_eq!(map.channel_name(ChannelType::Amplifier, 0, 2).as_deref(), Some("CH3"));
            assert!(!map.channels()[2].is_modified());
        }

        #[test]
        fn unknown_channel_is_an_error() {
            let mut map = two_headstages();
            assert!(map.modify_channel_name(ChannelType::Amplifier, 5, 0, "x").is_err());
            assert!(map.channel_modified(ChannelType::Adc, 0, 0).is_none());
            assert_eq!(map.channel_name(ChannelType::Event, 0, 15).as_deref(), Some("TTL16"));
            assert_eq!(map.event_channel_names().len(), NUM_EVENT_CHANNELS);
        }

        #[test]
        fn amplifier_lookup() {
            let map = two_headstages();
            assert_eq!(map.amplifier_channel(33), Some((1, 1)));
            assert_eq!(map.amplifier_channel(64), None);
            assert!(map.is_valid_amplifier(1, 31));
            assert!(!map.is_valid_amplifier(2, 0));
        }
    }
}
