//! Observation store.
//!
//! Groups the sequence allocator, the ring buffer and the current value
//! cache behind one mutex so every commit updates all three as one unit, in
//! sequence order.

use parking_lot::Mutex;
use serde::Serialize;

use mtc_core::{Category, Observation, ObservationDraft};

use crate::buffer::ObservationBuffer;
use crate::current::CurrentValueCache;
use crate::error::Result;
use crate::sequence::SequenceAllocator;

/// State guarded by the store mutex.
#[derive(Debug)]
pub struct StoreState {
    sequence: SequenceAllocator,
    buffer: ObservationBuffer,
    current: CurrentValueCache,
}

impl StoreState {
    /// Allocate a sequence number, append to the buffer and update the cache.
    pub fn commit(&mut self, draft: ObservationDraft) -> Observation {
        let sequence = self.sequence.next();
        let observation = draft.into_observation(sequence);

        self.buffer.append(observation.clone());
        if observation.category == Category::Condition {
            self.current.record_condition(&observation);
        }
        self.current
            .set(&observation.data_item_id, observation.clone());
        observation
    }

    pub fn current(&self) -> &CurrentValueCache {
        &self.current
    }

    pub fn buffer(&self) -> &ObservationBuffer {
        &self.buffer
    }
}

/// Buffer statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub capacity: usize,
    pub len: usize,
    pub first_sequence: Option<u64>,
    pub last_sequence: Option<u64>,
    pub items: usize,
}

/// Thread-safe observation store.
#[derive(Debug)]
pub struct ObservationStore {
    state: Mutex<StoreState>,
}

impl ObservationStore {
    /// Create a store with the given buffer capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_allocator(capacity, SequenceAllocator::new())
    }

    /// Create a store with a custom allocator.
    pub fn with_allocator(capacity: usize, sequence: SequenceAllocator) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(StoreState {
                sequence,
                buffer: ObservationBuffer::new(capacity)?,
                current: CurrentValueCache::new(),
            }),
        })
    }

    /// Run `f` as one critical section over the store state.
    ///
    /// Checks against the current value and the resulting commit happen
    /// without another writer interleaving.
    pub fn transact<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Commit a single draft.
    pub fn commit(&self, draft: ObservationDraft) -> Observation {
        self.transact(|state| state.commit(draft))
    }

    /// Current observation for a data item.
    pub fn current(&self, id: &str) -> Option<Observation> {
        self.state.lock().current.get(id).cloned()
    }

    /// All current observations, ordered by sequence.
    pub fn current_snapshot(&self) -> Vec<Observation> {
        self.state.lock().current.snapshot()
    }

    /// Active conditions for a condition data item.
    pub fn active_conditions(&self, id: &str) -> Vec<Observation> {
        self.state.lock().current.active_conditions(id)
    }

    /// Up to `count` observations starting at sequence `from`.
    pub fn range(&self, from: u64, count: usize) -> Result<Vec<Observation>> {
        self.state.lock().buffer.range(from, count)
    }

    /// Full buffer contents.
    pub fn snapshot(&self) -> Vec<Observation> {
        self.state.lock().buffer.to_snapshot()
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().buffer.capacity()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            capacity: state.buffer.capacity(),
            len: state.buffer.len(),
            first_sequence: state.buffer.first_sequence(),
            last_sequence: state.buffer.last_sequence(),
            items: state.current.len(),
        }
    }
}
