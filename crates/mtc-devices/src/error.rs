//! Errors raised while ingesting schemas, observations and assets.
//!
//! Every variant is recoverable: callers log the offending item and keep
//! processing the rest of the line or session.

pub use mtc_core::error::Error as CoreError;

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No data item matches the adapter's key.
    #[error("Unknown data item {key} for device {device}")]
    UnknownDataItem { device: String, key: String },

    /// The data item exists in the schema but has no current value yet.
    #[error("Uninitialized data item: {0}")]
    UninitializedDataItem(String),

    /// Value equals the current value and duplicates are filtered.
    #[error("Duplicate value for data item: {0}")]
    DuplicateValue(String),

    /// Value suppressed by a constraint filter.
    #[error("Value filtered for data item: {0}")]
    Filtered(String),

    /// No schema has been ingested for the device.
    #[error("Schema not found for device: {0}")]
    SchemaNotFound(String),

    /// A device rename targeted a uuid that is already registered.
    #[error("Device uuid already registered: {0}")]
    UuidInUse(String),

    #[error("Asset already exists: {0}")]
    AssetAlreadyExists(String),

    #[error("Asset not present: {0}")]
    AssetNotFound(String),

    /// Asset directive or body failed to decode.
    #[error("Malformed asset directive: {0}")]
    MalformedDirective(String),

    /// Schema text could not be decoded.
    #[error("Malformed schema: {0}")]
    MalformedSchema(String),

    #[error("Storage error: {0}")]
    Storage(#[from] mtc_storage::Error),
}

impl DeviceError {
    /// True for values dropped by filtering rather than by a fault.
    pub fn is_filtered(&self) -> bool {
        matches!(self, Self::DuplicateValue(_) | Self::Filtered(_))
    }
}

impl From<DeviceError> for CoreError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::SchemaNotFound(uuid) => CoreError::NotFound(format!("schema {}", uuid)),
            DeviceError::AssetNotFound(id) => CoreError::NotFound(format!("asset {}", id)),
            DeviceError::MalformedSchema(msg) => CoreError::Serialization(msg),
            DeviceError::Storage(e) => e.into(),
            other => CoreError::Device(other.to_string()),
        }
    }
}
