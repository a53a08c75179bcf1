/// Wait/signal values for one gated submission.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimelinePair {
    /// Host signals this to release the queue.
    pub wait_value: u64,
    /// Queue signals this when the copy is done.
    pub signal_value: u64,
}

/// Host-side view of a timeline semaphore's counter.
///
/// Each call to [`TimelineCounter::advance`] moves two steps ahead, so every
/// wait value is above the previous signal value and no value is reused.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimelineCounter {
    value: u64,
}

impl TimelineCounter {
    pub fn new(initial_value: u64) -> Self {
        TimelineCounter { value: initial_value }
    }

    /// Last wait value handed out, or the initial value before the first.
    pub fn current(&self) -> u64 {
        self.value
    }

    pub fn advance(&mut self) -> TimelinePair {
        self.value += 2;
        TimelinePair {
            wait_value: self.value,
            signal_value: self.value + 1,
        }
    }
}
