//! Probe summary: header plus a device's identity and data item tree.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::registry::DeviceTable;
use crate::schema::{ComponentNode, DataItemNode, Description};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeHeader {
    pub creation_time: String,
    pub sender: String,
    pub instance_id: i64,
    pub version: String,
    pub buffer_size: usize,
    pub asset_count: usize,
    pub asset_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDevice {
    pub id: String,
    pub name: String,
    pub uuid: String,
    pub description: Description,
    pub data_items: Vec<DataItemNode>,
    pub components: Vec<ComponentNode>,
}

impl ProbeDevice {
    /// Device section from a table; the description overlay wins over the
    /// schema's own description.
    pub fn from_table(table: &DeviceTable) -> Self {
        let device = &table.schema.device;
        Self {
            id: table.device_id.clone(),
            name: table.name.clone(),
            uuid: table.uuid.clone(),
            description: table.description.clone(),
            data_items: device.data_items.clone(),
            components: device.components.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDocument {
    pub namespaces: BTreeMap<String, String>,
    pub header: ProbeHeader,
    pub devices: Vec<ProbeDevice>,
}

impl ProbeDocument {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
