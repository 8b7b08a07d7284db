//! Timer-driven FIFO draining and decode.
//!
//! On every tick [`AcquisitionLoop::update_buffer`] moves all complete blocks currently in the board FIFO
//! into a raw queue, decodes the queue with the current channel layout and appends the result to a bounded
//! [`DataBuffer`] the host pulls from. A tick that finds no data is not an error.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::board::BoardController;
use crate::scheduler::ScheduledCallback;
use rhd_backend::datablock::DataBlock;
use rhd_backend::decode::{DecodedBlock, Decoder};
use rhd_backend::utils::TickTimer;

/// Upper bound on blocks drained in a single tick
pub const MAX_BLOCKS_PER_TICK: usize = 256;

/// Decoded blocks waiting for the host. Drops the oldest block when full.
pub struct DataBuffer {
    blocks: VecDeque<DecodedBlock>,
    capacity: usize,
    dropped: usize,
}

impl DataBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, block: DecodedBlock) {
        if self.blocks.len() == self.capacity {
            self.blocks.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % 100 == 0 {
                log::warn!("Host is not keeping up: {} data blocks dropped", self.dropped);
            }
        }
        self.blocks.push_back(block);
    }

    pub fn pop(&mut self) -> Option<DecodedBlock> {
        self.blocks.pop_front()
    }

    pub fn drain(&mut self, max_blocks: usize) -> Vec<DecodedBlock> {
        let n = max_blocks.min(self.blocks.len());
        self.blocks.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.blocks.iter().map(|b| b.num_samples()).sum()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

pub struct AcquisitionLoop {
    board: Arc<BoardController>,
    queue: Mutex<VecDeque<DataBlock>>,
    decoder: Mutex<Decoder>,
    buffer: Mutex<DataBuffer>,
    tick_timer: Mutex<TickTimer>,
}

impl AcquisitionLoop {
    pub fn new(board: Arc<BoardController>, buffer_capacity: usize) -> Self {
        let decoder = Decoder::new(board.decode_layout());
        Self {
            board,
            queue: Mutex::new(VecDeque::new()),
            decoder: Mutex::new(decoder),
            buffer: Mutex::new(DataBuffer::new(buffer_capacity)),
            tick_timer: Mutex::new(TickTimer::new()),
        }
    }

    /// Drains the FIFO and decodes what arrived. Returns false only once the board is unreachable.
    pub fn update_buffer(&self) -> bool {
        if self.board.is_unreachable() {
            return false;
        }
        if !self.board.is_acquisition_active() {
            return true;
        }
        // Held for the whole tick so concurrent pulls deliver blocks in FIFO order
        let mut decoder = self.decoder.lock();
        match self.board.read_blocks(MAX_BLOCKS_PER_TICK) {
            Ok(blocks) => self.queue.lock().extend(blocks),
            Err(e) if e.is_fatal() => {
                log::error!("Acquisition stopped delivering data: {}", e);
                return false;
            }
            Err(e) => log::warn!("Skipping FIFO read this tick: {}", e),
        }
        self.decode_queue(&mut decoder);
        true
    }

    fn decode_queue(&self, decoder: &mut Decoder) {
        let blocks: Vec<DataBlock> = self.queue.lock().drain(..).collect();
        if blocks.is_empty() {
            return;
        }
        let layout = self.board.decode_layout();
        if *decoder.layout() != layout {
            decoder.set_layout(layout);
        }
        let num_streams = decoder.layout().num_streams();
        let decoded: Vec<DecodedBlock> = blocks
            .iter()
            .filter(|b| b.num_streams() == num_streams)
            .map(|b| decoder.decode(b))
            .collect();
        if decoded.len() < blocks.len() {
            log::warn!("Discarded {} blocks read under a previous stream layout", blocks.len() - decoded.len());
        }
        let mut buffer = self.buffer.lock();
        for block in decoded {
            buffer.push(block);
        }
    }

    pub fn pull_blocks(&self, max_blocks: usize) -> Vec<DecodedBlock> {
        self.buffer.lock().drain(max_blocks)
    }

    pub fn num_buffered_samples(&self) -> usize {
        self.buffer.lock().num_samples()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn dropped_blocks(&self) -> usize {
        self.buffer.lock().dropped()
    }

    /// Empties the raw queue and the host buffer.
    pub fn clear(&self) {
        self.queue.lock().clear();
        self.buffer.lock().clear();
    }

    pub fn is_acquisition_active(&self) -> bool {
        self.board.is_acquisition_active()
    }
}

impl ScheduledCallback for AcquisitionLoop {
    fn on_tick(&self) {
        if !self.update_buffer() {
            log::error!("Acquisition board unreachable; stop acquisition and reconnect");
        }
        self.tick_timer.lock().tick_log("acquisition tick");
    }
}

#[cfg(test)]
mod test {
    use crate::acquisition::*;
    use crate::simulated::*;
    use rhd_backend::{BoardConfig, ChipId};

    fn running(blocks_per_poll: usize) -> (AcquisitionLoop, SimHandle) {
        let sim = SimulatedBoard::new(SimConfig::default().with_headstage(1, SimHeadstage::new(ChipId::Rhd2132)));
        let handle = sim.handle();
        handle.set_blocks_per_poll(blocks_per_poll);
        let board = Arc::new(BoardController::new(Box::new(sim), BoardConfig::default()));
        board.connect().unwrap();
        board.start_acquisition().unwrap();
        (AcquisitionLoop::new(board, 4), handle)
    }

    mod buffer {
        use super::*;
        use ndarray::Array2;

        fn block(ts: u32) -> DecodedBlock {
            DecodedBlock {
                samples: Array2::zeros((1, 1)),
                timestamps: vec![ts],
                event_codes: vec![0],
            }
        }

        #[test]
        fn drops_oldest_when_full() {
            let mut buffer = DataBuffer::new(2);
            buffer.push(block(0));
            buffer.push(block(1));
            buffer.push(block(2));
            assert_eq!(buffer.dropped(), 1);
            assert_eq!(buffer.pop().unwrap().timestamps, vec![1]);
            assert_eq!(buffer.drain(10).len(), 1);
            assert!(buffer.is_empty());
        }
    }

    mod update {
        use super::*;

        #[test]
        fn decodes_available_blocks() {
            let (acq, _) = running(2);
            assert!(acq.update_buffer());
            let blocks = acq.pull_blocks(10);
            assert_eq!(blocks.len(), 2);
            assert_eq!(blocks[0].num_channels(), 32);
            assert_eq!(blocks[1].timestamps[0], blocks[0].timestamps[59] + 1);
        }

        #[test]
        fn starved_tick_is_not_an_error() {
            let (acq, handle) = running(1);
            handle.set_starved(true);
            assert!(acq.update_buffer());
            assert_eq!(acq.num_buffered_samples(), 0);
        }

        #[test]
        fn unreachable_board_fails() {
            let (acq, handle) = running(1);
            handle.unplug();
            assert!(!acq.update_buffer());
            assert!(!acq.update_buffer());
        }

        #[test]
        fn buffer_is_bounded() {
            let (acq, _) = running(3);
            for _ in 0..3 {
                acq.on_tick();
            }
            assert_eq!(acq.pull_blocks(100).len(), 4);
            assert_eq!(acq.dropped_blocks(), 5);
        }
    }
}
