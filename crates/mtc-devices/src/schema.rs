//! Device schema tree.
//!
//! A schema document describes one or more devices, each a tree of
//! components carrying data items. Documents arrive as JSON that has already
//! been translated from the agent's XML device files; every optional piece of
//! the tree is an explicit optional field here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use mtc_core::Category;

use crate::error::{DeviceError, Result};

/// Data item types the agent manages on behalf of every device.
pub mod lifecycle {
    pub const AVAILABILITY: &str = "AVAILABILITY";
    pub const ASSET_CHANGED: &str = "ASSET_CHANGED";
    pub const ASSET_REMOVED: &str = "ASSET_REMOVED";
}

/// A parsed schema document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    pub header: SchemaHeader,
    #[serde(default)]
    pub namespaces: BTreeMap<String, String>,
    pub devices: Vec<DeviceNode>,
}

impl SchemaDocument {
    /// Decode schema text.
    pub fn parse(text: &str) -> Result<Self> {
        let document: SchemaDocument =
            serde_json::from_str(text).map_err(|e| DeviceError::MalformedSchema(e.to_string()))?;
        if document.devices.is_empty() {
            return Err(DeviceError::MalformedSchema("document declares no devices".to_string()));
        }
        for device in &document.devices {
            if device.uuid.trim().is_empty() {
                return Err(DeviceError::MalformedSchema(format!(
                    "device {} has no uuid",
                    device.name
                )));
            }
        }
        Ok(document)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaHeader {
    pub creation_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Free-text description of a device or component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Description {
    /// Set a field by its protocol name. Returns false for unknown fields.
    pub fn set_field(&mut self, field: &str, value: &str) -> bool {
        let slot = match field {
            "manufacturer" => &mut self.manufacturer,
            "serialNumber" => &mut self.serial_number,
            "station" => &mut self.station,
            "text" => &mut self.text,
            _ => return false,
        };
        *slot = Some(value.to_string());
        true
    }
}

/// Root of a device tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,
    #[serde(default)]
    pub data_items: Vec<DataItemNode>,
    #[serde(default)]
    pub components: Vec<ComponentNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

impl DeviceNode {
    /// Visit every data item in document order: the device's own items
    /// first, then each component subtree depth first.
    pub fn walk_data_items<'a>(&'a self, visit: &mut impl FnMut(&'a DataItemNode)) {
        for item in &self.data_items {
            visit(item);
        }
        for component in &self.components {
            component.walk_data_items(visit);
        }
    }

    fn has_data_item_type(&self, data_item_type: &str) -> bool {
        let mut found = false;
        self.walk_data_items(&mut |item| {
            if item.data_item_type == data_item_type {
                found = true;
            }
        });
        found
    }

    /// Add the availability and asset event items when the device does not
    /// declare them. Must run after identifiers are assigned so the
    /// synthesized ids are already final.
    pub fn ensure_lifecycle_events(&mut self) -> LifecycleEvents {
        let device_id = self.id.clone().unwrap_or_else(|| self.uuid.clone());
        let mut added = LifecycleEvents::default();

        for (data_item_type, suffix, flag) in [
            (lifecycle::AVAILABILITY, "avail", &mut added.availability),
            (lifecycle::ASSET_CHANGED, "asset_chg", &mut added.asset_changed),
            (lifecycle::ASSET_REMOVED, "asset_rem", &mut added.asset_removed),
        ] {
            if self.has_data_item_type(data_item_type) {
                continue;
            }
            self.data_items.push(DataItemNode::event(
                format!("{}_{}", device_id, suffix),
                data_item_type,
            ));
            *flag = true;
        }
        added
    }
}

/// Which lifecycle items were synthesized for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleEvents {
    pub availability: bool,
    pub asset_changed: bool,
    pub asset_removed: bool,
}

/// A component (Axes, Controller, Path...) nested under a device or
/// another component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentNode {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<Description>,
    #[serde(default)]
    pub data_items: Vec<DataItemNode>,
    #[serde(default)]
    pub components: Vec<ComponentNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

impl ComponentNode {
    fn walk_data_items<'a>(&'a self, visit: &mut impl FnMut(&'a DataItemNode)) {
        for item in &self.data_items {
            visit(item);
        }
        for component in &self.components {
            component.walk_data_items(visit);
        }
    }
}

/// How a data item's value is represented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Representation {
    #[default]
    Value,
    Discrete,
    TimeSeries,
    #[serde(other)]
    Other,
}

/// Filter rule declared in a data item's constraints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueFilter {
    /// Drop values within this distance of the previous value.
    MinimumDelta(f64),
    /// Drop values arriving within this many seconds of the previous one.
    Period(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ValueFilter>,
}

impl Constraints {
    /// The fixed value, when exactly one value is allowed.
    pub fn fixed_value(&self) -> Option<&str> {
        match self.values.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }
}

/// A data item as declared in the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItemNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub data_item_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    pub category: Category,
    #[serde(default)]
    pub representation: Representation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
}

impl DataItemNode {
    /// A bare EVENT item.
    pub fn event(id: impl Into<String>, data_item_type: &str) -> Self {
        Self {
            id: Some(id.into()),
            name: None,
            data_item_type: data_item_type.to_string(),
            sub_type: None,
            category: Category::Event,
            representation: Representation::Value,
            statistic: None,
            units: None,
            native_units: None,
            source: None,
            constraints: None,
        }
    }
}

/// Reference from a component to a data item elsewhere in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub data_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
