use std::time::Instant;

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self { last: Instant::now() }
    }

    /// Milliseconds since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

#[cfg(test)]
mod test {
    use crate::utils::*;

    #[test]
    fn tick_is_monotonic() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.tick() >= 2.0);
        assert!(timer.tick_log("second") >= 0.0);
    }
}
