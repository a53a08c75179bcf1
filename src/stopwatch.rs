use std::time::Instant;

/// Brackets a measured interval. `stop` returns milliseconds since `start`.
pub trait Stopwatch {
    fn start(&mut self);
    fn stop(&mut self) -> f64;
}

/// Monotonic host clock.
#[derive(Debug, Clone, Copy)]
pub struct InstantStopwatch {
    start_time: Instant,
}

impl InstantStopwatch {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for InstantStopwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Stopwatch for InstantStopwatch {
    fn start(&mut self) {
        self.start_time = Instant::now();
    }

    fn stop(&mut self) -> f64 {
        self.start_time.elapsed().as_nanos() as f64 / 1_000_000.0
    }
}
