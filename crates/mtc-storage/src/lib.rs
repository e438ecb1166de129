//! In-memory observation storage for the MTC agent.
//!
//! - **SequenceAllocator**: process-wide strictly increasing sequence numbers
//! - **ObservationBuffer**: fixed-capacity ring of committed observations
//! - **CurrentValueCache**: latest observation and active conditions per item
//! - **ObservationStore**: the three above behind a single lock

pub mod buffer;
pub mod current;
pub mod error;
pub mod sequence;
pub mod store;

pub use buffer::ObservationBuffer;
pub use current::CurrentValueCache;
pub use error::{Error, Result};
pub use sequence::SequenceAllocator;
pub use store::{ObservationStore, StoreState, StoreStats};
