//! Core types for the MTC agent.
//!
//! This crate defines the error type, configuration and observation values
//! shared by the storage and device crates.

pub mod config;
pub mod error;
pub mod observation;

pub use config::{AgentConfig, DeviceSettings};
pub use error::{Error, Result};
pub use observation::{
    AVAILABLE, Category, NORMAL, Observation, ObservationDraft, ObservationValue, UNAVAILABLE,
};

