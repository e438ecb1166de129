//! Observation types shared by storage and ingestion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Value reported for items with no data.
pub const UNAVAILABLE: &str = "UNAVAILABLE";
/// Availability value for a connected device.
pub const AVAILABLE: &str = "AVAILABLE";
/// Condition level that clears active faults.
pub const NORMAL: &str = "NORMAL";

/// Data item category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    Sample,
    #[default]
    Event,
    Condition,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sample => "SAMPLE",
            Self::Event => "EVENT",
            Self::Condition => "CONDITION",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SAMPLE" => Ok(Self::Sample),
            "EVENT" => Ok(Self::Event),
            "CONDITION" => Ok(Self::Condition),
            other => Err(Error::Validation(format!("unknown category: {}", other))),
        }
    }
}

/// Observed value: a single token, or the token list of a condition,
/// message, alarm or time series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObservationValue {
    Scalar(String),
    List(Vec<String>),
}

impl ObservationValue {
    pub fn unavailable() -> Self {
        Self::Scalar(UNAVAILABLE.to_string())
    }

    pub fn scalar(value: impl Into<String>) -> Self {
        Self::Scalar(value.into())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::List(_) => None,
        }
    }

    /// First token of the value; for conditions this is the level.
    pub fn leading(&self) -> Option<&str> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::List(items) => items.first().map(String::as_str),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.leading() == Some(UNAVAILABLE)
    }
}

impl From<&str> for ObservationValue {
    fn from(v: &str) -> Self {
        Self::Scalar(v.to_string())
    }
}

impl From<String> for ObservationValue {
    fn from(v: String) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<String>> for ObservationValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Everything about an observation except its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub data_item_id: String,
    pub data_item_name: Option<String>,
    pub device_uuid: String,
    pub timestamp: String,
    pub category: Category,
    pub data_item_type: String,
    pub path: String,
    pub value: ObservationValue,
    pub duration: Option<String>,
    pub sample_rate: Option<f64>,
    pub sample_count: Option<u64>,
    pub statistic: Option<String>,
    pub asset_type: Option<String>,
}

impl ObservationDraft {
    pub fn new(
        data_item_id: impl Into<String>,
        device_uuid: impl Into<String>,
        timestamp: impl Into<String>,
        value: impl Into<ObservationValue>,
    ) -> Self {
        Self {
            data_item_id: data_item_id.into(),
            data_item_name: None,
            device_uuid: device_uuid.into(),
            timestamp: timestamp.into(),
            category: Category::Event,
            data_item_type: String::new(),
            path: String::new(),
            value: value.into(),
            duration: None,
            sample_rate: None,
            sample_count: None,
            statistic: None,
            asset_type: None,
        }
    }

    /// Freeze the draft with its allocated sequence number.
    pub fn into_observation(self, sequence: u64) -> Observation {
        Observation {
            sequence,
            data_item_id: self.data_item_id,
            data_item_name: self.data_item_name,
            device_uuid: self.device_uuid,
            timestamp: self.timestamp,
            category: self.category,
            data_item_type: self.data_item_type,
            path: self.path,
            value: self.value,
            duration: self.duration,
            sample_rate: self.sample_rate,
            sample_count: self.sample_count,
            statistic: self.statistic,
            asset_type: self.asset_type,
        }
    }
}

/// A committed data point. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub sequence: u64,
    pub data_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_item_name: Option<String>,
    pub device_uuid: String,
    pub timestamp: String,
    pub category: Category,
    #[serde(rename = "type")]
    pub data_item_type: String,
    pub path: String,
    pub value: ObservationValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_type: Option<String>,
}
