//! Device schemas and observation ingestion for the MTC agent.
//!
//! ## Modules
//!
//! - **schema**: device schema documents and their tree of components
//! - **identity**: stable identifier derivation for schema elements
//! - **descriptor**: flattened data item descriptors with unit conversion
//! - **registry**: versioned schemas and per-device lookup tables
//! - **shdr**: adapter line protocol parsing
//! - **pipeline**: validation, filtering and commit of candidate values
//! - **assets**: asset documents and their lifecycle events
//! - **agent**: the facade tying the pieces together
//!
//! ## Example
//!
//! ```rust,no_run
//! use mtc_core::AgentConfig;
//! use mtc_devices::Agent;
//!
//! # fn main() -> mtc_devices::Result<()> {
//! let agent = Agent::new(AgentConfig::default())?;
//! let schema = std::fs::read_to_string("devices.json").unwrap_or_default();
//! agent.ingest_schema(&schema)?;
//! let outcome = agent.process_line("000", "2014-08-11T08:32:54.028533Z|avail|AVAILABLE")?;
//! println!("{} observations", outcome.observations.len());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod assets;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod path;
pub mod pipeline;
pub mod probe;
pub mod registry;
pub mod schema;
pub mod shdr;
pub mod time;

pub use agent::{Agent, LineOutcome};
pub use assets::{AssetCommand, AssetEventSink, AssetRecord, AssetStore, AssetUpdate};
pub use descriptor::{Conversion, DataItemDescriptor};
pub use error::{DeviceError, Result};
pub use path::PathQuery;
pub use pipeline::{Candidate, IngestionPipeline};
pub use probe::{ProbeDevice, ProbeDocument, ProbeHeader};
pub use registry::{DeviceSchema, DeviceTable, IngestOutcome, SchemaRegistry};
pub use schema::{DataItemNode, DeviceNode, SchemaDocument};
pub use shdr::{parse_line, MultilineAssembler, ProtocolCommand, ShdrLine};
pub use time::TimeResolver;
