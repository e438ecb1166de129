//! Sequence number allocation.

use mtc_core::config::defaults::MAX_SEQUENCE;
use tracing::warn;

/// Issues strictly increasing sequence numbers, wrapping to 0 after the
/// configured maximum.
///
/// Not synchronized: the owning store serializes access.
#[derive(Debug, Clone)]
pub struct SequenceAllocator {
    last: Option<u64>,
    max: u64,
}

impl SequenceAllocator {
    /// Allocator whose first value is 1.
    pub fn new() -> Self {
        Self::with_max(MAX_SEQUENCE)
    }

    /// Allocator with a custom wrap point.
    pub fn with_max(max: u64) -> Self {
        Self { last: None, max }
    }

    /// Allocator that continues after `last`, used to exercise the wrap.
    pub fn starting_after(last: u64, max: u64) -> Self {
        Self {
            last: Some(last.min(max)),
            max,
        }
    }

    /// Next sequence number.
    pub fn next(&mut self) -> u64 {
        let next = match self.last {
            None => 1,
            Some(last) if last >= self.max => {
                warn!(category = "storage", max = self.max, "Sequence number wrapped to 0");
                0
            }
            Some(last) => last + 1,
        };
        self.last = Some(next);
        next
    }

    /// Most recently issued sequence number.
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
