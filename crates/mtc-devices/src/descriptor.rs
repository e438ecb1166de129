//! Flattened data item descriptors.
//!
//! The schema tree is walked once per ingest and every data item becomes a
//! [`DataItemDescriptor`] carrying its structural path. Downstream code only
//! ever sees descriptors, never the raw tree.

use serde::Serialize;

use mtc_core::Category;

use crate::schema::{ComponentNode, Constraints, DataItemNode, DeviceNode, Representation};

/// Linear conversion applied as `(value + offset) * factor`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Conversion {
    pub factor: f64,
    pub offset: f64,
}

impl Conversion {
    pub const fn new(factor: f64, offset: f64) -> Self {
        Self { factor, offset }
    }

    pub fn apply(&self, value: f64) -> f64 {
        (value + self.offset) * self.factor
    }

    /// Conversion from an item's native units to its reported units.
    pub fn for_units(native: &str, units: &str) -> Option<Self> {
        if native == units {
            return None;
        }
        let conversion = match (native, units) {
            ("INCH", "MILLIMETER") => Self::new(25.4, 0.0),
            ("FOOT", "MILLIMETER") => Self::new(304.8, 0.0),
            ("CENTIMETER", "MILLIMETER") => Self::new(10.0, 0.0),
            ("DECIMETER", "MILLIMETER") => Self::new(100.0, 0.0),
            ("METER", "MILLIMETER") => Self::new(1000.0, 0.0),
            ("INCH/MINUTE", "MILLIMETER/SECOND") => Self::new(25.4 / 60.0, 0.0),
            ("FOOT/MINUTE", "MILLIMETER/SECOND") => Self::new(304.8 / 60.0, 0.0),
            ("FAHRENHEIT", "CELSIUS") => Self::new(5.0 / 9.0, -32.0),
            ("POUND", "GRAM") => Self::new(453.592_37, 0.0),
            ("KILOGRAM", "GRAM") => Self::new(1000.0, 0.0),
            ("RADIAN", "DEGREE") => Self::new(180.0 / std::f64::consts::PI, 0.0),
            ("RADIAN/SECOND", "DEGREE/SECOND") => Self::new(180.0 / std::f64::consts::PI, 0.0),
            ("MINUTE", "SECOND") => Self::new(60.0, 0.0),
            ("HOUR", "SECOND") => Self::new(3600.0, 0.0),
            ("KILOWATT", "WATT") => Self::new(1000.0, 0.0),
            ("REVOLUTION/SECOND", "REVOLUTION/MINUTE") => Self::new(60.0, 0.0),
            ("PERCENT", "RATIO") => Self::new(0.01, 0.0),
            _ => return None,
        };
        Some(conversion)
    }

    /// Convert every numeric whitespace-separated token of `raw`, leaving
    /// other tokens untouched.
    pub fn convert_text(&self, raw: &str) -> String {
        raw.split_whitespace()
            .map(|token| match token.parse::<f64>() {
                Ok(v) => format_number(self.apply(v)),
                Err(_) => token.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Render a converted number without floating point noise.
pub fn format_number(value: f64) -> String {
    let rounded = (value * 1e9).round() / 1e9;
    if rounded == 0.0 {
        return "0".to_string();
    }
    rounded.to_string()
}

/// A data item projected out of the schema tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataItemDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub data_item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    pub category: Category,
    pub representation: Representation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_units: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub constraints: Constraints,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion: Option<Conversion>,
    pub path: String,
}

impl DataItemDescriptor {
    fn from_node(node: &DataItemNode, path: String) -> Self {
        let conversion = match (&node.native_units, &node.units) {
            (Some(native), Some(units)) => Conversion::for_units(native, units),
            _ => None,
        };
        Self {
            id: node.id.clone().unwrap_or_default(),
            name: node.name.clone(),
            data_item_type: node.data_item_type.clone(),
            sub_type: node.sub_type.clone(),
            category: node.category,
            representation: node.representation,
            statistic: node.statistic.clone(),
            units: node.units.clone(),
            native_units: node.native_units.clone(),
            source: node.source.clone(),
            constraints: node.constraints.clone().unwrap_or_default(),
            conversion,
            path,
        }
    }

    pub fn is_time_series(&self) -> bool {
        self.representation == Representation::TimeSeries
    }

    pub fn is_discrete(&self) -> bool {
        self.representation == Representation::Discrete
    }

    /// Whether every token after the key belongs to this one item.
    pub fn takes_all_tokens(&self) -> bool {
        self.category == Category::Condition
            || self.data_item_type == "MESSAGE"
            || self.data_item_type == "ALARM"
            || self.is_time_series()
    }
}

/// Path segment for a device.
pub fn device_path(name: &str, uuid: &str) -> String {
    format!("//Devices//Device[@name=\"{}\" and @uuid=\"{}\"]", name, uuid)
}

fn component_path(parent: &str, component: &ComponentNode) -> String {
    match &component.name {
        Some(name) => format!("{}//{}[@name=\"{}\"]", parent, component.tag, name),
        None => format!("{}//{}", parent, component.tag),
    }
}

fn data_item_path(parent: &str, item: &DataItemNode) -> String {
    let mut predicate = format!(
        "@category=\"{}\" and @type=\"{}\"",
        item.category, item.data_item_type
    );
    if let Some(sub_type) = &item.sub_type {
        predicate.push_str(&format!(" and @subType=\"{}\"", sub_type));
    }
    if let Some(name) = &item.name {
        predicate.push_str(&format!(" and @name=\"{}\"", name));
    }
    format!("{}//DataItem[{}]", parent, predicate)
}

/// Flatten a device tree into descriptors in document order.
pub fn flatten(device: &DeviceNode, uuid: &str) -> Vec<DataItemDescriptor> {
    let root = device_path(&device.name, uuid);
    let mut out = Vec::new();
    for item in &device.data_items {
        out.push(DataItemDescriptor::from_node(item, data_item_path(&root, item)));
    }
    for component in &device.components {
        flatten_component(component, &root, &mut out);
    }
    out
}

fn flatten_component(component: &ComponentNode, parent: &str, out: &mut Vec<DataItemDescriptor>) {
    let path = component_path(parent, component);
    for item in &component.data_items {
        out.push(DataItemDescriptor::from_node(item, data_item_path(&path, item)));
    }
    for child in &component.components {
        flatten_component(child, &path, out);
    }
}
