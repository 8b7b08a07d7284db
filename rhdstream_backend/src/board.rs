//! Device configuration and control of an RHD2000 acquisition board.
//!
//! ## Overview
//!
//! [`BoardController`] exclusively owns the board connection (a boxed [`Transport`]) and is the only writer
//! of device registers. It keeps three pieces of shared state, each behind its own lock:
//!
//! - the device state: current sample rate, the chip register image, MISO delays, TTL and noise-slicer
//!   settings, and the desired [`BoardConfig`],
//! - the [`ChannelMap`] derived from the last port scan,
//! - the [`DacRouter`] slot table.
//!
//! None of these locks is ever held across a device I/O call. Setters compute the new register values under
//! the state lock, release it, perform the write on the transport, and only then commit the new actual
//! values. The acquisition timer therefore never waits on a register write for longer than the transport
//! itself is busy. Control-path operations are serialized among themselves by a separate control lock that
//! the timer never takes.
//!
//! ## Setter semantics
//!
//! - Continuous requests (bandwidths, DSP cutoff, cable length) are quantized to what the hardware can
//!   realise. Setters return the actual value; callers must use it rather than the request.
//! - A request whose quantized value equals the current actual value performs no device I/O.
//! - While no board is open, setters store the request and return the predicted actual value; the stored
//!   state is programmed by [`BoardController::initialize`].
//! - A failed write is not fatal: the setter logs a warning and returns the unchanged actual value.
//! - Every applied change bumps [`BoardController::config_epoch`], which invalidates an impedance test in
//!   flight.
//!
//! ## Example
//!
//! ```
//! use rhdstream_backend::board::BoardController;
//! use rhdstream_backend::simulated::*;
//! use rhd_backend::{BoardConfig, ChipId};
//!
//! let sim = SimulatedBoard::new(SimConfig::default().with_headstage(0, SimHeadstage::new(ChipId::Rhd2132)));
//! let board = BoardController::new(Box::new(sim), BoardConfig::default());
//! board.connect().unwrap();
//! assert_eq!(board.num_channels(), 32);
//! let actual = board.set_upper_bandwidth(5000.0);
//! assert_eq!(board.set_upper_bandwidth(actual), actual);
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::transport::{RhythmExt, Transport};
use rhd_backend::channel_map::*;
use rhd_backend::config::{BoardConfig, NUM_PORTS};
use rhd_backend::dac::*;
use rhd_backend::datablock::{ChipId, DataBlock, MAX_NUM_DATA_STREAMS, REGISTER_59_MISO_A, SAMPLES_PER_DATA_BLOCK};
use rhd_backend::error::{Result, RhdError};
use rhd_backend::registers::*;

const MISO_DELAY_STEPS: u8 = 16;
const ALL_MISO_A_STREAMS: u32 = 0xFF;
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(1);
// Ports are scanned at 30 kS/s whatever the acquisition rate
const SCAN_SAMPLE_RATE_INDEX: usize = DEFAULT_SAMPLE_RATE_INDEX;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadstageInfo {
    pub label: String,
    pub slot: StreamSlot,
    pub chip: ChipId,
    pub num_channels: usize,
}

/// Result of [`BoardController::scan_ports`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub ports_present: [bool; NUM_PORTS],
    pub cable_delays: [u8; NUM_PORTS],
    /// One entry per data stream; an RHD2164 contributes two
    pub headstages: Vec<HeadstageInfo>,
}

struct DeviceState {
    config: BoardConfig,
    sample_rate_index: usize,
    registers: ChipRegisters,
    cable_delays: [u8; NUM_PORTS],
    noise_slicer_level: i32,
    ttl: TtlSettings,
    chips: Vec<(StreamSlot, ChipId)>,
}

enum WriteOutcome {
    Applied,
    Deferred,
    Failed,
}

fn write_chip_registers(io: &mut dyn Transport, writes: &[(u8, u8)]) -> Result<()> {
    for (reg, value) in writes {
        log::debug!("Chip register R{} <- {:#04x}", reg, value);
        io.write_chip_register(*reg, *value)?;
    }
    Ok(())
}

/// Waits until `num_blocks` blocks of a finite run are in the FIFO (or `timeout` passes) and reads them.
pub(crate) fn read_run_blocks(
    io: &mut dyn Transport,
    num_streams: usize,
    num_blocks: usize,
    timeout: Duration,
) -> Result<Vec<DataBlock>> {
    let needed = (num_blocks * rhd_backend::datablock::block_size_in_words(num_streams)) as u32;
    let deadline = Instant::now() + timeout;
    while io.num_words_in_fifo()? < needed && Instant::now() < deadline {
        std::thread::sleep(RUN_POLL_INTERVAL);
    }
    io.read_data_blocks(num_streams, num_blocks, timeout)
}

/// Time the sample clock at `fs` needs to fill `num_blocks` data blocks.
pub(crate) fn block_duration(fs: f64, num_blocks: usize) -> Duration {
    Duration::from_secs_f64((num_blocks * SAMPLES_PER_DATA_BLOCK) as f64 / fs)
}

// Middle of the working window: the second good delay when there are several
fn optimum_delay(good: &[bool]) -> Option<u8> {
    let goods: Vec<u8> = (0..good.len() as u8).filter(|d| good[*d as usize]).collect();
    match goods.len() {
        0 => None,
        1 => Some(goods[0]),
        _ => Some(goods[1]),
    }
}

pub struct BoardController {
    io: Mutex<Box<dyn Transport>>,
    control: Mutex<()>,
    state: Mutex<DeviceState>,
    channels: Mutex<ChannelMap>,
    dac: Mutex<DacRouter>,
    connected: AtomicBool,
    active: AtomicBool,
    unreachable: AtomicBool,
    impedance_active: AtomicBool,
    epoch: AtomicU64,
}

impl BoardController {
    pub fn new(transport: Box<dyn Transport>, config: BoardConfig) -> Self {
        let index = config.sample_rate_index.min(SAMPLE_RATES.len() - 1);
        let fs = SAMPLE_RATES[index];
        let mut registers = ChipRegisters::new(fs);
        registers.set_upper_bandwidth(config.upper_bandwidth);
        registers.set_lower_bandwidth(config.lower_bandwidth);
        registers.set_dsp_enabled(config.dsp_enabled);
        registers.set_dsp_cutoff_freq(config.dsp_cutoff);
        registers.set_aux_inputs_enabled(config.acquire_aux);

        let mut channels = ChannelMap::new(config.naming_scheme);
        channels.set_acquire_aux(config.acquire_aux);
        channels.set_acquire_adc(config.acquire_adc);
        let mut dac = DacRouter::new();
        dac.set_hpf(config.dac_hpf.cutoff, config.dac_hpf.enabled);

        Self {
            io: Mutex::new(transport),
            control: Mutex::new(()),
            state: Mutex::new(DeviceState {
                sample_rate_index: index,
                registers,
                cable_delays: config.cable_lengths_ft.map(|l| cable_delay(l, fs)),
                noise_slicer_level: clamp_noise_slicer_level(config.noise_slicer_level),
                ttl: config.ttl,
                chips: Vec::new(),
                config,
            }),
            channels: Mutex::new(channels),
            dac: Mutex::new(dac),
            connected: AtomicBool::new(false),
            active: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            impedance_active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    // ---------- connection ----------

    pub fn open(&self, library_path: &Path) -> Result<()> {
        let _control = self.control.lock();
        self.io.lock().open(library_path)?;
        self.connected.store(true, Ordering::SeqCst);
        self.unreachable.store(false, Ordering::SeqCst);
        log::info!("Acquisition board opened");
        Ok(())
    }

    pub fn upload_bitstream(&self, path: &Path) -> Result<()> {
        let _control = self.control.lock();
        self.io.lock().upload_bitstream(path)
    }

    /// Opens the board, uploads the bitstream, programs every stored setting and scans the ports.
    pub fn connect(&self) -> Result<ScanReport> {
        let (library, bitfile) = {
            let st = self.state.lock();
            (st.config.library_path.clone(), st.config.bitfile_path.clone())
        };
        self.open(&library)?;
        self.upload_bitstream(&bitfile)?;
        self.initialize()?;
        self.scan_ports()
    }

    /// Programs the complete desired state into a freshly configured board.
    pub fn initialize(&self) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("initialize")?;
        self.require_connected("initialize")?;
        let (index, fs, registers, delays, noise, ttl) = {
            let st = self.state.lock();
            (
                st.sample_rate_index,
                st.registers.sample_rate(),
                st.registers.register_list(),
                st.cable_delays,
                st.noise_slicer_level,
                st.ttl,
            )
        };
        let mask = self.channels.lock().stream_mask();
        let (slots, hpf) = {
            let mut dac = self.dac.lock();
            dac.mark_all_dirty();
            (dac.take_dirty(), dac.hpf())
        };

        let result = {
            let mut io = self.io.lock();
            let io = io.as_mut();
            io.reset_board()
                .and_then(|_| io.set_sample_rate_index(index))
                .and_then(|_| io.set_continuous_run_mode(false))
                .and_then(|_| io.set_max_time_step(0))
                .and_then(|_| io.set_cable_delays(&delays))
                .and_then(|_| io.set_stream_mask(mask))
                .and_then(|_| io.set_ttl_out_mode(ttl.output_mode))
                .and_then(|_| io.set_fast_settle(false, ttl.fast_settle, ttl.fast_settle_channel))
                .and_then(|_| io.set_noise_suppress(noise))
                .and_then(|_| io.set_dac_high_pass(dac_hpf_coefficient(hpf.cutoff, fs), hpf.enabled))
                .and_then(|_| write_dac_slots(io, &slots))
                .and_then(|_| io.set_zcheck_period(0))
                .and_then(|_| write_chip_registers(io, &registers))
                .and_then(|_| io.flush())
        };
        if let Err(e) = result {
            self.note_error(&e);
            return Err(e);
        }
        self.bump_epoch();
        log::info!("Board initialized at {} S/s", fs);
        Ok(())
    }

    pub fn close(&self) {
        if let Err(e) = self.stop_acquisition() {
            log::warn!("Stopping acquisition on close failed: {}", e);
        }
        let _control = self.control.lock();
        self.io.lock().close();
        self.connected.store(false, Ordering::SeqCst);
        log::info!("Acquisition board closed");
    }

    pub fn found_input_source(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_unreachable()
    }

    pub fn is_unreachable(&self) -> bool {
        self.unreachable.load(Ordering::SeqCst)
    }

    pub fn is_acquisition_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Monotonic counter of applied configuration changes.
    pub fn config_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn note_error(&self, e: &RhdError) {
        if matches!(e, RhdError::DeviceUnreachable(_)) {
            if !self.unreachable.swap(true, Ordering::SeqCst) {
                log::error!("Acquisition board unreachable: {}", e);
            }
        }
    }

    fn require_connected(&self, what: &str) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RhdError::NotReady(format!("{}: no board open", what)));
        }
        if self.is_unreachable() {
            return Err(RhdError::DeviceUnreachable(format!("{}: board lost", what)));
        }
        Ok(())
    }

    // Control-path changes are held off while an impedance test owns the board
    fn impedance_busy(&self, what: &str) -> bool {
        let busy = self.impedance_active.load(Ordering::SeqCst);
        if busy {
            log::warn!("{} refused: impedance test in progress", what);
        }
        busy
    }

    fn require_idle(&self, what: &str) -> Result<()> {
        if self.impedance_busy(what) {
            return Err(RhdError::NotReady(format!("{}: impedance test in progress", what)));
        }
        Ok(())
    }

    pub fn is_impedance_test_running(&self) -> bool {
        self.impedance_active.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_impedance_test(&self) -> Result<()> {
        let _control = self.control.lock();
        if self.impedance_active.swap(true, Ordering::SeqCst) {
            return Err(RhdError::NotReady("an impedance test is already running".to_string()));
        }
        Ok(())
    }

    pub(crate) fn end_impedance_test(&self) {
        let _control = self.control.lock();
        self.impedance_active.store(false, Ordering::SeqCst);
    }

    fn device_write<F>(&self, what: &str, write: F) -> WriteOutcome
    where
        F: FnOnce(&mut dyn Transport) -> Result<()>,
    {
        if !self.connected.load(Ordering::SeqCst) {
            return WriteOutcome::Deferred;
        }
        let result = {
            let mut io = self.io.lock();
            write(io.as_mut())
        };
        match result {
            Ok(()) => WriteOutcome::Applied,
            Err(e) => {
                self.note_error(&e);
                log::warn!("{} not applied: {}", what, e);
                WriteOutcome::Failed
            }
        }
    }

    /// Generic setter over device state: no-op when `next == current`, commit only after the write.
    ///
    /// `desire` records the request in the stored configuration; it is skipped when the write fails.
    fn apply_setting<T, D, C, W, S>(&self, what: &str, desire: D, compute: C, write: W, commit: S) -> T
    where
        T: Copy + PartialEq,
        D: FnOnce(&mut BoardConfig),
        C: FnOnce(&DeviceState) -> (T, T),
        W: FnOnce(&mut dyn Transport, T) -> Result<()>,
        S: FnOnce(&mut DeviceState, T),
    {
        let _control = self.control.lock();
        let (current, next) = compute(&*self.state.lock());
        if self.impedance_busy(what) {
            return current;
        }
        if current == next {
            desire(&mut self.state.lock().config);
            return current;
        }
        match self.device_write(what, |io| write(io, next)) {
            WriteOutcome::Failed => current,
            WriteOutcome::Applied | WriteOutcome::Deferred => {
                {
                    let mut st = self.state.lock();
                    desire(&mut st.config);
                    commit(&mut *st, next);
                }
                self.bump_epoch();
                next
            }
        }
    }

    /// Setter over the chip register image; only registers whose value changes are written.
    fn apply_registers<T, D, M, R>(&self, what: &str, desire: D, mutate: M, read: R) -> T
    where
        D: FnOnce(&mut BoardConfig),
        M: FnOnce(&mut ChipRegisters) -> T,
        R: FnOnce(&ChipRegisters) -> T,
    {
        let _control = self.control.lock();
        self.apply_registers_locked(what, desire, mutate, read)
    }

    fn apply_registers_locked<T, D, M, R>(&self, what: &str, desire: D, mutate: M, read: R) -> T
    where
        D: FnOnce(&mut BoardConfig),
        M: FnOnce(&mut ChipRegisters) -> T,
        R: FnOnce(&ChipRegisters) -> T,
    {
        let (candidate, value, previous, writes) = {
            let st = self.state.lock();
            let mut candidate = st.registers.clone();
            let value = mutate(&mut candidate);
            let writes = candidate.diff(&st.registers);
            (candidate, value, read(&st.registers), writes)
        };
        if self.impedance_busy(what) {
            return previous;
        }
        if writes.is_empty() {
            desire(&mut self.state.lock().config);
            return value;
        }
        match self.device_write(what, |io| write_chip_registers(io, &writes)) {
            WriteOutcome::Failed => previous,
            WriteOutcome::Applied | WriteOutcome::Deferred => {
                {
                    let mut st = self.state.lock();
                    desire(&mut st.config);
                    st.registers = candidate;
                }
                self.bump_epoch();
                value
            }
        }
    }

    /// Writes the full chip register image.
    pub fn update_registers(&self) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("update_registers")?;
        self.require_connected("update_registers")?;
        let registers = self.state.lock().registers.register_list();
        let result = write_chip_registers(self.io.lock().as_mut(), &registers);
        if let Err(e) = &result {
            self.note_error(e);
        }
        result
    }

    // ---------- topology ----------

    /// Samples every stream slot at each MISO delay and rebuilds the channel table from the chips found.
    ///
    /// The scan runs at 30 kS/s; the board returns to its current sample rate afterwards. Refused with
    /// `NotReady` while acquisition is running.
    pub fn scan_ports(&self) -> Result<ScanReport> {
        let _control = self.control.lock();
        self.require_idle("scan_ports")?;
        self.require_connected("scan_ports")?;
        if self.is_acquisition_active() {
            return Err(RhdError::NotReady("cannot scan ports while acquiring".to_string()));
        }
        let (index, scan_writes, restore_writes) = {
            let st = self.state.lock();
            let mut scan_registers = st.registers.clone();
            scan_registers.define_sample_rate(SAMPLE_RATES[SCAN_SAMPLE_RATE_INDEX]);
            (
                st.sample_rate_index,
                scan_registers.diff(&st.registers),
                st.registers.diff(&scan_registers),
            )
        };
        let timeout = self.fifo_timeout().max(block_duration(SAMPLE_RATES[SCAN_SAMPLE_RATE_INDEX], 2));
        let mut good = [[false; MISO_DELAY_STEPS as usize]; MAX_NUM_DATA_STREAMS];
        let mut ids: [Option<(ChipId, u8)>; MAX_NUM_DATA_STREAMS] = [None; MAX_NUM_DATA_STREAMS];

        let sweep = {
            let mut io = self.io.lock();
            let io = io.as_mut();
            (|| -> Result<()> {
                io.set_sample_rate_index(SCAN_SAMPLE_RATE_INDEX)?;
                write_chip_registers(io, &scan_writes)?;
                io.set_stream_mask(ALL_MISO_A_STREAMS)?;
                io.set_continuous_run_mode(false)?;
                io.set_max_time_step(SAMPLES_PER_DATA_BLOCK as u32)?;
                for delay in 0..MISO_DELAY_STEPS {
                    io.set_cable_delays(&[delay; NUM_PORTS])?;
                    io.flush()?;
                    io.run()?;
                    let blocks = read_run_blocks(io, MAX_NUM_DATA_STREAMS, 1, timeout)?;
                    let Some(block) = blocks.first() else {
                        log::warn!("No data block at MISO delay {}", delay);
                        continue;
                    };
                    for (slot, found) in ids.iter_mut().enumerate() {
                        if let Some(id) = block.device_id(slot) {
                            good[slot][delay as usize] = true;
                            *found = Some(id);
                        }
                    }
                }
                Ok(())
            })()
        };
        if let Err(e) = sweep {
            self.note_error(&e);
            let restore = {
                let mut io = self.io.lock();
                let io = io.as_mut();
                io.set_sample_rate_index(index)
                    .and_then(|_| write_chip_registers(io, &restore_writes))
            };
            if let Err(r) = restore {
                log::warn!("Sample rate not restored after failed port scan: {}", r);
            }
            return Err(e);
        }

        let mut streams = Vec::new();
        let mut port_delay: [Option<u8>; NUM_PORTS] = [None; NUM_PORTS];
        for (slot, id) in ids.iter().enumerate() {
            let Some((chip, register_59)) = *id else { continue };
            if chip == ChipId::Rhd2164 && register_59 != REGISTER_59_MISO_A {
                log::warn!("Unexpected register 59 value {} on stream slot {}", register_59, slot);
            }
            if let Some(d) = optimum_delay(&good[slot]) {
                let port = slot / 2;
                port_delay[port] = Some(port_delay[port].map_or(d, |p| p.max(d)));
            }
            streams.push(DataStream::new(StreamSlot::new(slot, false), chip));
            if chip == ChipId::Rhd2164 {
                streams.push(DataStream::new(StreamSlot::new(slot, true), chip));
            }
        }

        let (delays, chips) = {
            let st = self.state.lock();
            let fs = st.registers.sample_rate();
            let mut delays = [0u8; NUM_PORTS];
            for port in 0..NUM_PORTS {
                delays[port] = port_delay[port].unwrap_or_else(|| cable_delay(st.config.cable_lengths_ft[port], fs));
            }
            let chips: Vec<(StreamSlot, ChipId)> = streams.iter().map(|s| (s.slot, s.chip)).collect();
            (delays, chips)
        };

        let (mask, headstages) = {
            let mut channels = self.channels.lock();
            channels.set_streams(streams);
            let headstages = channels
                .enabled_streams()
                .map(|s| HeadstageInfo {
                    label: s.slot.label(),
                    slot: s.slot,
                    chip: s.chip,
                    num_channels: s.num_channels,
                })
                .collect::<Vec<_>>();
            let mask = channels.stream_mask();
            self.dac.lock().retain_valid(&channels);
            (mask, headstages)
        };

        let finish = {
            let mut io = self.io.lock();
            let io = io.as_mut();
            io.set_sample_rate_index(index)
                .and_then(|_| write_chip_registers(io, &restore_writes))
                .and_then(|_| io.set_cable_delays(&delays))
                .and_then(|_| io.set_stream_mask(mask))
                .and_then(|_| io.set_max_time_step(0))
                .and_then(|_| io.flush())
        };
        if let Err(e) = finish {
            self.note_error(&e);
            return Err(e);
        }
        {
            let mut st = self.state.lock();
            st.cable_delays = delays;
            st.chips = chips;
        }
        self.flush_dac_locked();
        self.bump_epoch();

        let mut ports_present = [false; NUM_PORTS];
        for h in &headstages {
            ports_present[h.slot.port()] = true;
        }
        log::info!(
            "Port scan found {} data streams ({} channels), MISO delays {:?}",
            headstages.len(),
            headstages.iter().map(|h| h.num_channels).sum::<usize>(),
            delays
        );
        Ok(ScanReport {
            ports_present,
            cable_delays: delays,
            headstages,
        })
    }

    /// Enables or disables the headstage on stream `slot`. Returns false when refused (acquiring, nothing
    /// detected there, stream limit) or when the write failed.
    pub fn enable_headstage(&self, slot: usize, enabled: bool) -> bool {
        let _control = self.control.lock();
        if self.impedance_busy("headstage enable") {
            return false;
        }
        if self.is_acquisition_active() {
            log::warn!("Cannot change headstages while acquiring");
            return false;
        }
        let mask = {
            let mut channels = self.channels.lock();
            if channels.is_slot_enabled(slot) == enabled {
                return true;
            }
            if !channels.set_slot_enabled(slot, enabled) {
                return false;
            }
            self.dac.lock().retain_valid(&channels);
            channels.stream_mask()
        };
        match self.device_write("stream enable", |io| io.set_stream_mask(mask)) {
            WriteOutcome::Failed => {
                self.channels.lock().set_slot_enabled(slot, !enabled);
                false
            }
            _ => {
                self.flush_dac_locked();
                self.bump_epoch();
                true
            }
        }
    }

    pub fn is_headstage_enabled(&self, slot: usize) -> bool {
        self.channels.lock().is_slot_enabled(slot)
    }

    pub fn set_num_channels(&self, slot: usize, num_channels: usize) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("set_num_channels")?;
        if self.is_acquisition_active() {
            return Err(RhdError::NotReady("cannot change channel counts while acquiring".to_string()));
        }
        let mut channels = self.channels.lock();
        channels.set_slot_channels(slot, num_channels)?;
        self.dac.lock().retain_valid(&channels);
        Ok(())
    }

    pub fn chip_ids(&self) -> Vec<(StreamSlot, ChipId)> {
        self.state.lock().chips.clone()
    }

    /// Chip family and register 59 of `stream` from the ROM readback in `block`.
    pub fn device_id(block: &DataBlock, stream: usize) -> Option<(ChipId, u8)> {
        block.device_id(stream)
    }

    // ---------- sample rate and amplifier settings ----------

    /// Switches the board sample rate. With `temporary` set the previous rate stays the stored default.
    ///
    /// Bandwidths, DSP cutoff and cable delays are requantized for the new rate.
    pub fn set_sample_rate(&self, index: usize, temporary: bool) -> Result<f64> {
        let _control = self.control.lock();
        self.require_idle("set_sample_rate")?;
        self.set_sample_rate_locked(index, temporary)
    }

    /// Temporary rate change on behalf of a running impedance test.
    pub(crate) fn set_test_sample_rate(&self, index: usize) -> Result<f64> {
        let _control = self.control.lock();
        self.set_sample_rate_locked(index, true)
    }

    fn set_sample_rate_locked(&self, index: usize, temporary: bool) -> Result<f64> {
        let fs = sample_rate_from_index(index)?;
        if self.is_acquisition_active() {
            return Err(RhdError::NotReady("cannot change the sample rate while acquiring".to_string()));
        }
        let (candidate, delays, writes, unchanged, current_fs) = {
            let st = self.state.lock();
            let mut candidate = st.registers.clone();
            candidate.define_sample_rate(fs);
            candidate.set_upper_bandwidth(st.config.upper_bandwidth);
            candidate.set_lower_bandwidth(st.config.lower_bandwidth);
            candidate.set_dsp_cutoff_freq(st.config.dsp_cutoff);
            let delays = st.config.cable_lengths_ft.map(|l| cable_delay(l, fs));
            let writes = candidate.diff(&st.registers);
            let unchanged = st.sample_rate_index == index && writes.is_empty() && delays == st.cable_delays;
            (candidate, delays, writes, unchanged, st.registers.sample_rate())
        };
        if unchanged {
            if !temporary {
                self.state.lock().config.sample_rate_index = index;
            }
            return Ok(fs);
        }
        let outcome = self.device_write("sample rate", |io| {
            io.set_sample_rate_index(index)?;
            io.set_cable_delays(&delays)?;
            write_chip_registers(io, &writes)
        });
        match outcome {
            WriteOutcome::Failed => Ok(current_fs),
            WriteOutcome::Applied | WriteOutcome::Deferred => {
                {
                    let mut st = self.state.lock();
                    st.sample_rate_index = index;
                    if !temporary {
                        st.config.sample_rate_index = index;
                    }
                    st.registers = candidate;
                    st.cable_delays = delays;
                }
                self.bump_epoch();
                log::info!("Sample rate set to {} S/s{}", fs, if temporary { " (temporary)" } else { "" });
                Ok(fs)
            }
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.state.lock().registers.sample_rate()
    }

    pub fn sample_rate_index(&self) -> usize {
        self.state.lock().sample_rate_index
    }

    /// Sample rate index the board returns to after a temporary change.
    pub fn default_sample_rate_index(&self) -> usize {
        self.state.lock().config.sample_rate_index
    }

    pub fn set_upper_bandwidth(&self, requested: f64) -> f64 {
        self.apply_registers(
            "upper bandwidth",
            |c| c.upper_bandwidth = requested,
            |r| r.set_upper_bandwidth(requested), |r| r.upper_bandwidth())
    }

    pub fn upper_bandwidth(&self) -> f64 {
        self.state.lock().registers.upper_bandwidth()
    }

    pub fn set_lower_bandwidth(&self, requested: f64) -> f64 {
        self.apply_registers(
            "lower bandwidth",
            |c| c.lower_bandwidth = requested,
            |r| r.set_lower_bandwidth(requested), |r| r.lower_bandwidth())
    }

    pub fn lower_bandwidth(&self) -> f64 {
        self.state.lock().registers.lower_bandwidth()
    }

    pub fn set_dsp_cutoff_freq(&self, requested: f64) -> f64 {
        self.apply_registers(
            "DSP cutoff",
            |c| c.dsp_cutoff = requested,
            |r| r.set_dsp_cutoff_freq(requested), |r| r.dsp_cutoff_freq())
    }

    pub fn dsp_cutoff_freq(&self) -> f64 {
        self.state.lock().registers.dsp_cutoff_freq()
    }

    /// Enables the on-chip DSP offset removal filter.
    pub fn set_dsp_offset(&self, enabled: bool) -> bool {
        self.apply_registers(
            "DSP offset removal",
            |c| c.dsp_enabled = enabled,
            |r| {
                r.set_dsp_enabled(enabled);
                enabled
            },
            |r| r.dsp_enabled(),
        )
    }

    pub fn dsp_enabled(&self) -> bool {
        self.state.lock().registers.dsp_enabled()
    }

    /// Sets the MISO delay of `port` for a cable of `length_ft` feet. Returns the delay in effect.
    pub fn set_cable_length(&self, port: usize, length_ft: f64) -> Result<u8> {
        if port >= NUM_PORTS {
            return Err(RhdError::InvalidParameter(format!("port {} out of range", port)));
        }
        let delays = self.apply_setting(
            "cable delay",
            |c| c.cable_lengths_ft[port] = length_ft,
            |st| {
                let mut next = st.cable_delays;
                next[port] = cable_delay(length_ft, st.registers.sample_rate());
                (st.cable_delays, next)
            },
            |io, d| io.set_cable_delays(&d),
            |st, d| st.cable_delays = d,
        );
        Ok(delays[port])
    }

    pub fn cable_delays(&self) -> [u8; NUM_PORTS] {
        self.state.lock().cable_delays
    }

    pub fn set_noise_slicer_level(&self, level: i32) -> i32 {
        let level = clamp_noise_slicer_level(level);
        self.apply_setting(
            "noise slicer",
            |c| c.noise_slicer_level = level,
            |st| (st.noise_slicer_level, level),
            |io, l| io.set_noise_suppress(l),
            |st, l| st.noise_slicer_level = l,
        )
    }

    pub fn noise_slicer_level(&self) -> i32 {
        self.state.lock().noise_slicer_level
    }

    pub fn set_fast_ttl_settle(&self, enabled: bool, channel: usize) -> TtlSettings {
        self.apply_setting(
            "fast TTL settle",
            |_| (),
            |st| {
                let next = TtlSettings {
                    fast_settle: enabled,
                    fast_settle_channel: channel,
                    ..st.ttl
                };
                (st.ttl, next)
            },
            |io, t| io.set_fast_settle(false, t.fast_settle, t.fast_settle_channel),
            |st, t| {
                st.ttl = t;
                st.config.ttl = t;
            },
        )
    }

    pub fn set_ttl_output_mode(&self, threshold_driven: bool) -> bool {
        self.apply_setting(
            "TTL output mode",
            |_| (),
            |st| {
                let next = TtlSettings {
                    output_mode: threshold_driven,
                    ..st.ttl
                };
                (st.ttl, next)
            },
            |io, t| io.set_ttl_out_mode(t.output_mode),
            |st, t| {
                st.ttl = t;
                st.config.ttl = t;
            },
        )
        .output_mode
    }

    pub fn ttl_settings(&self) -> TtlSettings {
        self.state.lock().ttl
    }

    pub fn set_dac_hpf(&self, cutoff: f64, enabled: bool) -> DacHighPass {
        let _control = self.control.lock();
        let current = self.dac.lock().hpf();
        let next = DacHighPass { cutoff, enabled };
        if current == next || self.impedance_busy("DAC high-pass") {
            return current;
        }
        let fs = self.sample_rate();
        let coefficient = dac_hpf_coefficient(cutoff, fs);
        match self.device_write("DAC high-pass", |io| io.set_dac_high_pass(coefficient, enabled)) {
            WriteOutcome::Failed => current,
            _ => {
                self.dac.lock().set_hpf(cutoff, enabled);
                self.state.lock().config.dac_hpf = next;
                self.bump_epoch();
                next
            }
        }
    }

    /// Turns board ADC acquisition on or off; the channel table is regenerated.
    pub fn enable_adcs(&self, enabled: bool) {
        let _control = self.control.lock();
        if self.impedance_busy("ADC acquisition") {
            return;
        }
        self.state.lock().config.acquire_adc = enabled;
        self.channels.lock().set_acquire_adc(enabled);
    }

    /// Turns auxiliary input acquisition on or off, including the chip's auxiliary amplifiers.
    pub fn enable_aux(&self, enabled: bool) {
        let _control = self.control.lock();
        if self.impedance_busy("auxiliary inputs") {
            return;
        }
        self.channels.lock().set_acquire_aux(enabled);
        self.apply_registers_locked(
            "auxiliary inputs",
            |c| c.acquire_aux = enabled,
            |r| r.set_aux_inputs_enabled(enabled),
            |_| (),
        );
    }

    pub fn config(&self) -> BoardConfig {
        self.state.lock().config.clone()
    }

    fn fifo_timeout(&self) -> Duration {
        Duration::from_millis(self.state.lock().config.fifo_timeout_ms)
    }

    // ---------- acquisition ----------

    pub fn start_acquisition(&self) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("start_acquisition")?;
        self.require_connected("start_acquisition")?;
        if self.is_acquisition_active() {
            return Ok(());
        }
        let result = {
            let mut io = self.io.lock();
            let io = io.as_mut();
            io.flush()
                .and_then(|_| io.set_max_time_step(0))
                .and_then(|_| io.set_continuous_run_mode(true))
                .and_then(|_| io.run())
        };
        if let Err(e) = result {
            self.note_error(&e);
            return Err(e);
        }
        self.active.store(true, Ordering::SeqCst);
        log::info!("Acquisition started ({} channels)", self.num_channels());
        Ok(())
    }

    /// Stops a continuous run and empties the board FIFO. Safe to call at any time.
    pub fn stop_acquisition(&self) -> Result<()> {
        let _control = self.control.lock();
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if self.connected.load(Ordering::SeqCst) {
            let result = {
                let mut io = self.io.lock();
                let io = io.as_mut();
                io.set_continuous_run_mode(false)
                    .and_then(|_| io.set_max_time_step(0))
                    .and_then(|_| io.flush())
            };
            if let Err(e) = result {
                self.note_error(&e);
                log::warn!("Board did not acknowledge stop: {}", e);
            }
        }
        log::info!("Acquisition stopped");
        Ok(())
    }

    /// Reads up to `max_blocks` complete blocks from the FIFO, waiting at most the configured FIFO timeout.
    pub fn read_blocks(&self, max_blocks: usize) -> Result<Vec<DataBlock>> {
        let num_streams = self.channels.lock().num_enabled_streams();
        let timeout = self.fifo_timeout();
        let result = self.io.lock().read_data_blocks(num_streams, max_blocks, timeout);
        if let Err(e) = &result {
            self.note_error(e);
        }
        result
    }

    // ---------- channel table ----------

    pub fn with_channels<R>(&self, f: impl FnOnce(&ChannelMap) -> R) -> R {
        f(&*self.channels.lock())
    }

    fn channels_mut(&self) -> MutexGuard<'_, ChannelMap> {
        self.channels.lock()
    }

    pub fn num_channels(&self) -> usize {
        self.channels.lock().num_channels()
    }

    pub fn num_adc_channels(&self) -> usize {
        self.channels.lock().num_adc_channels()
    }

    pub fn num_event_channels(&self) -> usize {
        NUM_EVENT_CHANNELS
    }

    pub fn bit_volts(&self, chan: usize) -> f32 {
        match self.channels.lock().bit_volts(chan) {
            Some(v) => v,
            None => {
                log::debug!("bit_volts requested for channel {} outside the channel table", chan);
                0.0
            }
        }
    }

    /// Scale of the `chan`-th non-amplifier channel: auxiliary inputs first, then board ADCs.
    pub fn adc_bit_volts(&self, chan: usize) -> f32 {
        if chan < self.channels.lock().num_aux_channels() {
            AUX_BIT_VOLTS
        } else {
            ADC_BIT_VOLTS
        }
    }

    pub fn channels_info(&self) -> Vec<ChannelInfo> {
        self.channels.lock().channels_info()
    }

    pub fn decode_layout(&self) -> DecodeLayout {
        self.channels.lock().decode_layout()
    }

    pub fn modify_channel_name(&self, ty: ChannelType, stream: usize, index: usize, name: &str) -> Result<usize> {
        self.channels_mut().modify_channel_name(ty, stream, index, name)
    }

    pub fn modify_channel_gain(&self, ty: ChannelType, stream: usize, index: usize, gain: f32) -> Result<usize> {
        self.channels_mut().modify_channel_gain(ty, stream, index, gain)
    }

    pub fn channel_name(&self, ty: ChannelType, stream: usize, index: usize) -> Option<String> {
        self.channels.lock().channel_name(ty, stream, index)
    }

    pub fn channel_modified(&self, ty: ChannelType, stream: usize, index: usize) -> Option<ChannelModification> {
        self.channels.lock().channel_modified(ty, stream, index)
    }

    pub fn event_channel_names(&self) -> Vec<String> {
        self.channels.lock().event_channel_names()
    }

    pub fn set_default_naming_scheme(&self, scheme: NamingScheme) {
        self.state.lock().config.naming_scheme = scheme;
        self.channels_mut().set_default_naming_scheme(scheme);
    }

    pub fn update_channel_names(&self) {
        self.channels_mut().update_channel_names();
    }

    // ---------- DAC routing ----------

    pub fn set_dac_channel(&self, slot: usize, stream: usize, channel: usize) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("set_dac_channel")?;
        {
            let channels = self.channels.lock();
            if !channels.is_valid_amplifier(stream, channel) {
                return Err(RhdError::ChannelNotFound(format!(
                    "amplifier channel {} on stream {}",
                    channel, stream
                )));
            }
            self.dac.lock().set_dac_channel(slot, stream, channel)?;
        }
        self.flush_dac_locked();
        Ok(())
    }

    pub fn clear_dac_channel(&self, slot: usize) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("clear_dac_channel")?;
        self.dac.lock().clear_dac_channel(slot)?;
        self.flush_dac_locked();
        Ok(())
    }

    pub fn set_dac_threshold(&self, slot: usize, threshold: f32) -> Result<()> {
        let _control = self.control.lock();
        self.require_idle("set_dac_threshold")?;
        self.dac.lock().set_dac_threshold(slot, threshold)?;
        self.flush_dac_locked();
        Ok(())
    }

    /// Routes the `data_channel`-th amplifier channel to the left (0) or right (1) audio output.
    pub fn assign_audio_out(&self, side: usize, data_channel: usize) -> Result<DacBinding> {
        let _control = self.control.lock();
        self.require_idle("assign_audio_out")?;
        let binding = {
            let channels = self.channels.lock();
            self.dac.lock().assign_audio_out(side, data_channel, &channels)?
        };
        self.flush_dac_locked();
        Ok(binding)
    }

    pub fn dac_channels(&self) -> [Option<DacBinding>; NUM_DAC_SLOTS] {
        self.dac.lock().dac_channels()
    }

    pub fn dac_thresholds(&self) -> [f32; NUM_DAC_SLOTS] {
        self.dac.lock().thresholds()
    }

    // Writes changed DAC slots; the caller holds the control lock
    fn flush_dac_locked(&self) {
        let slots = self.dac.lock().take_dirty();
        if slots.is_empty() {
            return;
        }
        match self.device_write("DAC routing", |io| write_dac_slots(io, &slots)) {
            WriteOutcome::Applied => self.bump_epoch(),
            WriteOutcome::Deferred => self.dac.lock().mark_all_dirty(),
            WriteOutcome::Failed => self.dac.lock().mark_all_dirty(),
        }
    }

    // ---------- impedance test support ----------

    // Chip register change used by the impedance test; not counted as a configuration change
    fn write_registers_quiet<M>(&self, mutate: M) -> Result<()>
    where
        M: FnOnce(&mut ChipRegisters) -> Result<()>,
    {
        let (candidate, writes) = {
            let st = self.state.lock();
            let mut candidate = st.registers.clone();
            mutate(&mut candidate)?;
            let writes = candidate.diff(&st.registers);
            (candidate, writes)
        };
        if !writes.is_empty() {
            let result = write_chip_registers(self.io.lock().as_mut(), &writes);
            if let Err(e) = result {
                self.note_error(&e);
                return Err(e);
            }
            self.state.lock().registers = candidate;
        }
        Ok(())
    }

    pub(crate) fn zcheck_setup(&self, period: usize) -> Result<()> {
        self.require_connected("impedance test")?;
        self.write_registers_quiet(|r| {
            r.set_zcheck_dac_amplitude(128);
            r.enable_zcheck(true);
            Ok(())
        })?;
        self.io.lock().set_zcheck_period(period as u32)
    }

    pub(crate) fn zcheck_select(&self, chip_channel: usize, scale: ZcheckScale) -> Result<()> {
        self.write_registers_quiet(|r| {
            r.set_zcheck_scale(scale);
            r.set_zcheck_channel(chip_channel)
        })
    }

    pub(crate) fn zcheck_teardown(&self) -> Result<()> {
        let registers = self.write_registers_quiet(|r| {
            r.enable_zcheck(false);
            Ok(())
        });
        let period = self.io.lock().set_zcheck_period(0);
        registers.and(period)
    }

    /// Runs the board for exactly `num_blocks` blocks and returns them.
    pub(crate) fn run_finite(&self, num_blocks: usize) -> Result<Vec<DataBlock>> {
        let num_streams = self.channels.lock().num_enabled_streams();
        let timeout = self.fifo_timeout().max(Duration::from_millis(100)) * num_blocks.max(1) as u32
            + block_duration(self.sample_rate(), num_blocks);
        let result = {
            let mut io = self.io.lock();
            let io = io.as_mut();
            io.set_continuous_run_mode(false)
                .and_then(|_| io.set_max_time_step((num_blocks * SAMPLES_PER_DATA_BLOCK) as u32))
                .and_then(|_| io.flush())
                .and_then(|_| io.run())
                .and_then(|_| read_run_blocks(io, num_streams, num_blocks, timeout))
        };
        if let Err(e) = &result {
            self.note_error(e);
        }
        result
    }

    pub(crate) fn flush_fifo(&self) -> Result<()> {
        self.io.lock().flush()
    }
}

fn write_dac_slots(io: &mut dyn Transport, slots: &[(usize, DacSlot)]) -> Result<()> {
    for (k, slot) in slots {
        io.set_dac_source(*k, slot.binding.map(|b| (b.stream, b.channel)))?;
        let (word, rising) = dac_threshold_word(slot.threshold);
        io.set_dac_threshold_word(*k, word, rising)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use crate::board::*;
    use crate::simulated::*;

    fn connected(config: SimConfig) -> (BoardController, SimHandle) {
        let sim = SimulatedBoard::new(config);
        let handle = sim.handle();
        let board = BoardController::new(Box::new(sim), BoardConfig::default());
        board.connect().unwrap();
        (board, handle)
    }

    fn two_headstages() -> SimConfig {
        SimConfig::default()
            .with_headstage(0, SimHeadstage::new(ChipId::Rhd2132))
            .with_headstage(2, SimHeadstage::new(ChipId::Rhd2132))
    }

    mod scan {
        use super::*;

        #[test]
        fn finds_headstages_and_delays() {
            let config = two_headstages().with_headstage(5, SimHeadstage::new(ChipId::Rhd2164).with_good_delays(4..=9));
            let (board, handle) = connected(config);
            assert_eq!(board.num_channels(), 32 + 32 + 64);
            assert_eq!(board.chip_ids().len(), 4);
            let delays = board.cable_delays();
            assert_eq!(delays[0], 2);
            assert_eq!(delays[2], 5);
            assert_eq!(handle.wire(crate::transport::endpoint::STREAM_ENABLE), 0b10_0101 | 1 << 13);
        }

        #[test]
        fn optimum_delay_choice() {
            assert_eq!(optimum_delay(&[false; 16]), None);
            let mut good = [false; 16];
            good[7] = true;
            assert_eq!(optimum_delay(&good), Some(7));
            good[8] = true;
            good[9] = true;
            assert_eq!(optimum_delay(&good), Some(8));
        }

        #[test]
        fn low_sample_rate_scan_runs_at_full_rate() {
            let sim = SimulatedBoard::new(SimConfig::default().with_headstage(0, SimHeadstage::new(ChipId::Rhd2216)));
            let handle = sim.handle();
            handle.set_paced(true);
            let config = BoardConfig {
                sample_rate_index: 0,
                ..Default::default()
            };
            let board = BoardController::new(Box::new(sim), config);
            let report = board.connect().unwrap();
            assert_eq!(report.headstages.len(), 1);
            assert_eq!(board.num_channels(), 16);
            assert_eq!(board.sample_rate(), SAMPLE_RATES[0]);
            assert_eq!(handle.wire(crate::transport::endpoint::SAMPLE_RATE), 0);
        }

        #[test]
        fn refused_while_acquiring() {
            let (board, _) = connected(two_headstages());
            board.start_acquisition().unwrap();
            assert!(matches!(board.scan_ports(), Err(RhdError::NotReady(_))));
            board.stop_acquisition().unwrap();
            assert!(board.scan_ports().is_ok());
        }
    }

    mod setters {
        use super::*;

        #[test]
        fn unchanged_request_writes_nothing() {
            let (board, handle) = connected(two_headstages());
            let actual = board.set_upper_bandwidth(3000.0);
            let writes = handle.register_writes();
            let epoch = board.config_epoch();
            assert_eq!(board.set_upper_bandwidth(actual), actual);
            assert_eq!(board.set_noise_slicer_level(board.noise_slicer_level()), 0);
            assert_eq!(handle.register_writes(), writes);
            assert_eq!(board.config_epoch(), epoch);
        }

        #[test]
        fn change_bumps_epoch() {
            let (board, handle) = connected(two_headstages());
            let epoch = board.config_epoch();
            let actual = board.set_lower_bandwidth(10.0);
            assert!(board.config_epoch() > epoch);
            assert!(actual > 5.0 && actual < 20.0);
            assert!(handle.chip_register_writes() > 0);
        }

        #[test]
        fn failed_write_keeps_actual() {
            let (board, handle) = connected(two_headstages());
            let before = board.upper_bandwidth();
            handle.set_fail_writes(true);
            assert_eq!(board.set_upper_bandwidth(1000.0), before);
            assert_eq!(board.upper_bandwidth(), before);
            assert_eq!(board.config().upper_bandwidth, 7500.0);
            assert_eq!(board.set_noise_slicer_level(20), 0);
        }

        #[test]
        fn failed_rate_change_keeps_stored_rate() {
            let (board, handle) = connected(two_headstages());
            handle.set_fail_writes(true);
            assert_eq!(board.set_sample_rate(11, false).unwrap(), 30000.0);
            assert_eq!(board.default_sample_rate_index(), DEFAULT_SAMPLE_RATE_INDEX);
            assert_eq!(board.config().sample_rate_index, DEFAULT_SAMPLE_RATE_INDEX);
            handle.set_fail_writes(false);
            assert_eq!(board.set_sample_rate(11, false).unwrap(), 10000.0);
            assert_eq!(board.default_sample_rate_index(), 11);
        }

        #[test]
        fn disconnected_setter_stores_prediction() {
            let board = BoardController::new(Box::new(SimulatedBoard::new(SimConfig::default())), BoardConfig::default());
            let actual = board.set_upper_bandwidth(2000.0);
            assert_ne!(actual, 2000.0);
            assert_eq!(board.upper_bandwidth(), actual);
            assert_eq!(board.config().upper_bandwidth, 2000.0);
        }

        #[test]
        fn sample_rate_change() {
            let (board, _) = connected(two_headstages());
            assert!(board.set_sample_rate(40, false).is_err());
            assert_eq!(board.set_sample_rate(11, true).unwrap(), 10000.0);
            assert_eq!(board.sample_rate(), 10000.0);
            assert_eq!(board.default_sample_rate_index(), DEFAULT_SAMPLE_RATE_INDEX);
            board.start_acquisition().unwrap();
            assert!(matches!(board.set_sample_rate(16, false), Err(RhdError::NotReady(_))));
        }

        #[test]
        fn headstage_enable() {
            let (board, _) = connected(two_headstages());
            assert!(board.enable_headstage(2, false));
            assert_eq!(board.num_channels(), 32);
            assert!(!board.is_headstage_enabled(2));
            assert!(!board.enable_headstage(6, true));
        }

        #[test]
        fn dac_routing_validates_channels() {
            let (board, handle) = connected(two_headstages());
            board.set_dac_channel(0, 1, 3).unwrap();
            board.set_dac_channel(0, 0, 1).unwrap();
            assert_eq!(board.dac_channels()[0], Some(DacBinding { stream: 0, channel: 1 }));
            assert_eq!(handle.wire(crate::transport::endpoint::DAC_SOURCE_BASE), 1 << 10 | 1);
            assert!(board.set_dac_channel(1, 4, 0).is_err());
            assert_eq!(board.assign_audio_out(1, 40).unwrap(), DacBinding { stream: 1, channel: 8 });
        }
    }

    mod acquisition {
        use super::*;

        #[test]
        fn start_requires_open_board() {
            let board = BoardController::new(Box::new(SimulatedBoard::new(SimConfig::default())), BoardConfig::default());
            assert!(matches!(board.start_acquisition(), Err(RhdError::NotReady(_))));
            assert!(board.stop_acquisition().is_ok());
        }

        #[test]
        fn bit_volts_outside_table_is_zero() {
            let (board, _) = connected(two_headstages());
            assert_eq!(board.bit_volts(0), AMPLIFIER_BIT_VOLTS);
            assert_eq!(board.bit_volts(64), 0.0);
        }

        #[test]
        fn read_blocks_follows_fifo() {
            let (board, handle) = connected(two_headstages());
            handle.set_blocks_per_poll(2);
            board.start_acquisition().unwrap();
            let blocks = board.read_blocks(10).unwrap();
            assert_eq!(blocks.len(), 2);
            assert_eq!(blocks[0].num_streams(), 2);
            board.stop_acquisition().unwrap();
            assert_eq!(handle.fifo_bytes(), 0);
            assert!(!handle.is_running());
        }

        #[test]
        fn unplug_marks_unreachable() {
            let (board, handle) = connected(two_headstages());
            board.start_acquisition().unwrap();
            handle.unplug();
            assert!(matches!(board.read_blocks(1), Err(RhdError::DeviceUnreachable(_))));
            assert!(board.is_unreachable());
            assert!(!board.found_input_source());
        }
    }
}
