//! Fixed-capacity ordered observation buffer.

use std::collections::VecDeque;

use mtc_core::Observation;

use crate::error::{Error, Result};

/// Ring store of committed observations, oldest evicted first.
#[derive(Debug, Clone)]
pub struct ObservationBuffer {
    entries: VecDeque<Observation>,
    capacity: usize,
}

impl ObservationBuffer {
    /// Create a buffer holding at most `capacity` observations.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidInput("buffer capacity must be greater than 0".to_string()));
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append an observation, evicting the oldest one when full.
    ///
    /// Returns the evicted observation, if any.
    pub fn append(&mut self, observation: Observation) -> Option<Observation> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(observation);
        evicted
    }

    /// Up to `count` observations with sequence >= `from`, in sequence order.
    ///
    /// A `from` newer than the newest retained observation is an invalid
    /// range. A `from` older than the oldest retained observation starts at
    /// the oldest one.
    pub fn range(&self, from: u64, count: usize) -> Result<Vec<Observation>> {
        let Some(last) = self.last_sequence() else {
            return Ok(Vec::new());
        };
        let start = self
            .entries
            .iter()
            .position(|o| o.sequence >= from)
            .ok_or(Error::SequenceOutOfRange {
                requested: from,
                last,
            })?;
        Ok(self.entries.iter().skip(start).take(count).cloned().collect())
    }

    /// Full contents in sequence order.
    pub fn to_snapshot(&self) -> Vec<Observation> {
        self.entries.iter().cloned().collect()
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.front().map(|o| o.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.back().map(|o| o.sequence)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
