//! Fixed-period timer thread driving the acquisition callback.
//!
//! [`TimerTask`] owns one thread that invokes a [`ScheduledCallback`] every `period` while started. Control
//! commands reach the thread through a [`CmdChan`]: a single-slot mailbox with a message counter, so the
//! receiver can tell a fresh command from one it has already handled.
//!
//! `start` and `stop` return only after the timer thread has acknowledged the command. Once `stop` returns,
//! no tick is in progress and none will begin until the next `start`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use rhd_backend::error::{Result, RhdError};

const ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCmd {
    Start,
    Stop,
    Close,
}

/// Work performed on every timer tick.
pub trait ScheduledCallback: Send + Sync {
    fn on_tick(&self);
}

pub struct CmdChan {
    cmd: Arc<Mutex<(usize, TimerCmd)>>, // (msg_num, cmd)
    condvar: Arc<Condvar>,
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, TimerCmd::Stop))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // The first message a new receiver reacts to is `msg_num + 1`
        let (msg_num, _cmd) = *self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: msg_num,
        }
    }

    pub fn send(&self, cmd: TimerCmd) {
        let mut guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, TimerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    pub fn recv(&mut self) -> std::result::Result<TimerCmd, String> {
        let mut guard = self.cmd.lock();
        while guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut guard);
        }
        let (msg_num, cmd) = *guard;
        drop(guard);
        self.accept(msg_num, cmd)
    }

    /// Waits at most `timeout` for a new command. `Ok(None)` on timeout.
    pub fn recv_timeout(&mut self, timeout: Duration) -> std::result::Result<Option<TimerCmd>, String> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.cmd.lock();
        while guard.0 == self.viewed_msg_num {
            if self.condvar.wait_until(&mut guard, deadline).timed_out() && guard.0 == self.viewed_msg_num {
                return Ok(None);
            }
        }
        let (msg_num, cmd) = *guard;
        drop(guard);
        self.accept(msg_num, cmd).map(Some)
    }

    fn accept(&mut self, msg_num: usize, cmd: TimerCmd) -> std::result::Result<TimerCmd, String> {
        if msg_num != self.viewed_msg_num + 1 {
            return Err(format!(
                "Viewed msg count {} diverged from the published command number {}",
                self.viewed_msg_num, msg_num
            ));
        }
        self.viewed_msg_num = msg_num;
        Ok(cmd)
    }
}

fn timer_loop(callback: Arc<dyn ScheduledCallback>, mut recvr: CmdRecvr, ack: Sender<TimerCmd>, period: Duration) {
    let mut next_tick: Option<Instant> = None;
    loop {
        let cmd = match next_tick {
            None => recvr.recv().map(Some),
            Some(at) => recvr.recv_timeout(at.saturating_duration_since(Instant::now())),
        };
        match cmd {
            Ok(Some(TimerCmd::Start)) => {
                next_tick = Some(Instant::now() + period);
                let _ = ack.send(TimerCmd::Start);
            }
            Ok(Some(TimerCmd::Stop)) => {
                next_tick = None;
                let _ = ack.send(TimerCmd::Stop);
            }
            Ok(Some(TimerCmd::Close)) => {
                let _ = ack.send(TimerCmd::Close);
                break;
            }
            Ok(None) => {
                callback.on_tick();
                // Missed ticks are skipped, not replayed
                let now = Instant::now();
                let mut at = next_tick.unwrap_or(now) + period;
                if at < now {
                    log::debug!("Acquisition tick overran its period");
                    at = now;
                }
                next_tick = Some(at);
            }
            Err(msg) => {
                log::error!("Timer command channel failed: {}", msg);
                break;
            }
        }
    }
}

pub struct TimerTask {
    cmd_chan: CmdChan,
    ack: Mutex<Receiver<TimerCmd>>,
    active: AtomicBool,
    period: Duration,
    handle: Option<JoinHandle<()>>,
}

impl TimerTask {
    pub fn new(callback: Arc<dyn ScheduledCallback>, period: Duration) -> Result<Self> {
        let cmd_chan = CmdChan::new();
        let recvr = cmd_chan.new_recvr();
        let (ack_sender, ack_recvr) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("rhd-acquisition-timer".to_string())
            .spawn(move || timer_loop(callback, recvr, ack_sender, period))?;
        Ok(Self {
            cmd_chan,
            ack: Mutex::new(ack_recvr),
            active: AtomicBool::new(false),
            period,
            handle: Some(handle),
        })
    }

    fn command(&self, cmd: TimerCmd) -> Result<()> {
        let ack = self.ack.lock();
        self.cmd_chan.send(cmd);
        match ack.recv_timeout(ACK_TIMEOUT) {
            Ok(got) if got == cmd => Ok(()),
            Ok(got) => Err(RhdError::NotReady(format!("timer acknowledged {:?} instead of {:?}", got, cmd))),
            Err(_) => Err(RhdError::NotReady(format!("timer thread did not acknowledge {:?}", cmd))),
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.command(TimerCmd::Start)?;
        self.active.store(true, Ordering::SeqCst);
        log::debug!("Acquisition timer started ({:?} period)", self.period);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.command(TimerCmd::Stop)?;
        self.active.store(false, Ordering::SeqCst);
        log::debug!("Acquisition timer stopped");
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        if let Err(e) = self.command(TimerCmd::Close) {
            log::warn!("{}", e);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Acquisition timer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::scheduler::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter(AtomicUsize);

    impl ScheduledCallback for Counter {
        fn on_tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    mod cmd_chan {
        use super::*;

        #[test]
        fn receiver_sees_only_new_commands() {
            let chan = CmdChan::new();
            chan.send(TimerCmd::Start);
            let mut recvr = chan.new_recvr();
            assert_eq!(recvr.recv_timeout(Duration::from_millis(10)), Ok(None));
            chan.send(TimerCmd::Stop);
            assert_eq!(recvr.recv_timeout(Duration::from_millis(10)), Ok(Some(TimerCmd::Stop)));
        }

        #[test]
        fn skipped_message_is_an_error() {
            let chan = CmdChan::new();
            let mut recvr = chan.new_recvr();
            chan.send(TimerCmd::Start);
            chan.send(TimerCmd::Stop);
            assert!(recvr.recv().is_err());
        }
    }

    mod timer {
        use super::*;

        #[test]
        fn ticks_only_while_started() {
            let counter = Arc::new(Counter(AtomicUsize::new(0)));
            let timer = TimerTask::new(counter.clone(), Duration::from_millis(2)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(counter.0.load(Ordering::SeqCst), 0);

            timer.start().unwrap();
            assert!(timer.is_active());
            std::thread::sleep(Duration::from_millis(50));
            timer.stop().unwrap();
            let ticks = counter.0.load(Ordering::SeqCst);
            assert!(ticks > 0);

            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(counter.0.load(Ordering::SeqCst), ticks);
            assert!(!timer.is_active());
        }

        #[test]
        fn restart_after_stop() {
            let counter = Arc::new(Counter(AtomicUsize::new(0)));
            let timer = TimerTask::new(counter.clone(), Duration::from_millis(1)).unwrap();
            timer.start().unwrap();
            timer.stop().unwrap();
            let before = counter.0.load(Ordering::SeqCst);
            timer.start().unwrap();
            std::thread::sleep(Duration::from_millis(30));
            assert!(counter.0.load(Ordering::SeqCst) > before);
        }
    }
}
