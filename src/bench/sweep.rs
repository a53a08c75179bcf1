//! Transfer size sweep.

/// Smallest transfer in every sweep.
pub const SWEEP_START_BYTES: u64 = 4;
/// Default upper bound: 2 GiB, inclusive.
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Yields 4, 8, 16, ... doubling while the size stays within `max_bytes`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeSweep {
    next: Option<u64>,
    max_bytes: u64,
}

impl SizeSweep {
    pub fn new(max_bytes: u64) -> Self {
        SizeSweep {
            next: if SWEEP_START_BYTES <= max_bytes { Some(SWEEP_START_BYTES) } else { None },
            max_bytes,
        }
    }

    /// Like [`SizeSweep::new`], but never past `limit` when there is one.
    pub fn clamped(max_bytes: u64, limit: Option<u64>) -> Self {
        match limit {
            Some(limit) => Self::new(max_bytes.min(limit)),
            None => Self::new(max_bytes),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    fn remaining(&self) -> usize {
        let mut count = 0;
        let mut size = self.next;
        while let Some(s) = size {
            count += 1;
            size = s.checked_mul(2).filter(|n| *n <= self.max_bytes);
        }
        count
    }
}

impl Default for SizeSweep {
    fn default() -> Self {
        SizeSweep::new(DEFAULT_MAX_TRANSFER_BYTES)
    }
}

impl Iterator for SizeSweep {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let size = self.next?;
        self.next = size.checked_mul(2).filter(|n| *n <= self.max_bytes);
        Some(size)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for SizeSweep {}
impl std::iter::FusedIterator for SizeSweep {}
