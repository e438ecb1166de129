//! Asset store.
//!
//! Assets (cutting tools, programs...) live outside the observation buffer.
//! Each create, update or removal is reported through an
//! [`AssetEventSink`] as ASSET_CHANGED / ASSET_REMOVED observations. The
//! store lock is held while emitting, so event order matches store order.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use mtc_core::Observation;

use crate::error::{DeviceError, Result};
use crate::shdr::{AssetDirective, DirectiveKind};

/// Receives asset lifecycle events for one device.
pub trait AssetEventSink {
    fn asset_changed(&self, asset_id: &str, asset_type: &str, timestamp: &str) -> Result<Vec<Observation>>;
    fn asset_removed(&self, asset_id: &str, asset_type: &str, timestamp: &str) -> Result<Vec<Observation>>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub asset_id: String,
    pub asset_type: String,
    pub device_uuid: String,
    pub timestamp: String,
    pub value: Value,
    pub removed: bool,
}

/// Change applied by an update.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetUpdate {
    /// Named fields replaced wherever they occur in the asset.
    Fields(Vec<(String, String)>),
    /// Partial document merged key by key.
    Document(Value),
}

/// A decoded asset directive.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetCommand {
    Upsert {
        asset_id: String,
        asset_type: String,
        body: Value,
    },
    Update {
        asset_id: String,
        update: AssetUpdate,
    },
    Remove {
        asset_id: String,
    },
    RemoveAll {
        asset_type: String,
    },
}

impl AssetCommand {
    pub fn decode(directive: &AssetDirective) -> Result<Self> {
        let tokens = &directive.tokens;
        let first = tokens
            .first()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                DeviceError::MalformedDirective(format!("{} without arguments", directive.kind.token()))
            })?
            .to_string();

        match directive.kind {
            DirectiveKind::Asset => {
                let asset_type = tokens
                    .get(1)
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| DeviceError::MalformedDirective(format!("asset {} has no type", first)))?;
                if tokens.len() < 3 {
                    return Err(DeviceError::MalformedDirective(format!("asset {} has no body", first)));
                }
                Ok(Self::Upsert {
                    asset_id: first,
                    asset_type: asset_type.to_string(),
                    body: decode_asset_body(&tokens[2..].join("|"))?,
                })
            }
            DirectiveKind::UpdateAsset => {
                let update = match &tokens[1..] {
                    [] => {
                        return Err(DeviceError::MalformedDirective(format!(
                            "update of {} has no fields",
                            first
                        )))
                    }
                    [document] => AssetUpdate::Document(decode_asset_body(document)?),
                    fields => {
                        if fields.len() % 2 != 0 {
                            warn!(category = "assets", asset = %first, "Dangling update field ignored");
                        }
                        AssetUpdate::Fields(
                            fields
                                .chunks_exact(2)
                                .map(|pair| (pair[0].clone(), pair[1].clone()))
                                .collect(),
                        )
                    }
                };
                Ok(Self::Update {
                    asset_id: first,
                    update,
                })
            }
            DirectiveKind::RemoveAsset => Ok(Self::Remove { asset_id: first }),
            DirectiveKind::RemoveAllAssets => Ok(Self::RemoveAll { asset_type: first }),
        }
    }
}

/// Decode an asset body. Bodies are JSON objects.
pub fn decode_asset_body(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| DeviceError::MalformedDirective(format!("asset body: {}", e)))?;
    if !value.is_object() {
        return Err(DeviceError::MalformedDirective("asset body is not an object".to_string()));
    }
    Ok(value)
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Whether a body marks its asset as removed, either at the top level or
/// on its single root element.
pub fn is_marked_removed(body: &Value) -> bool {
    if is_truthy(body.get("removed")) {
        return true;
    }
    match body.as_object() {
        Some(map) if map.len() == 1 => map
            .values()
            .next()
            .is_some_and(|root| is_truthy(root.get("removed"))),
        _ => false,
    }
}

/// The element fields live in: the single root element when the body
/// wraps one, otherwise the body itself.
fn root_object_mut(value: &mut Value) -> Option<&mut Map<String, Value>> {
    let map = value.as_object_mut()?;
    if map.len() == 1 && map.values().next().is_some_and(Value::is_object) {
        return map.values_mut().next().and_then(Value::as_object_mut);
    }
    Some(map)
}

/// The object that directly holds `key`, searching depth first.
fn find_parent_mut<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    match value {
        Value::Object(map) => {
            if map.contains_key(key) {
                return Some(map);
            }
            map.values_mut().find_map(|child| find_parent_mut(child, key))
        }
        Value::Array(items) => items.iter_mut().find_map(|child| find_parent_mut(child, key)),
        _ => None,
    }
}

fn set_field(value: &mut Value, name: &str, new: Value) {
    match find_parent_mut(value, name) {
        Some(parent) => {
            if let Some(slot) = parent.get_mut(name) {
                match slot {
                    // Elements with attributes keep them; only the text changes.
                    Value::Object(element) if new.is_string() && name != "Status" => {
                        element.insert("value".to_string(), new);
                    }
                    other => *other = new,
                }
            }
        }
        None => {
            if let Some(root) = root_object_mut(value) {
                root.insert(name.to_string(), new);
            }
        }
    }
}

/// Field update rule for cutting tools: `CutterStatus` writes `Status`,
/// and a comma list becomes an array.
fn normalize_field(name: &str, raw: &str) -> (String, Value) {
    if name == "CutterStatus" {
        let value = if raw.contains(',') {
            Value::Array(raw.split(',').map(|s| Value::String(s.trim().to_string())).collect())
        } else {
            Value::String(raw.to_string())
        };
        return ("Status".to_string(), value);
    }
    (name.to_string(), Value::String(raw.to_string()))
}

fn apply_update(value: &mut Value, update: &AssetUpdate) -> Result<()> {
    match update {
        AssetUpdate::Fields(fields) => {
            for (name, raw) in fields {
                let (name, new) = normalize_field(name, raw);
                set_field(value, &name, new);
            }
        }
        AssetUpdate::Document(document) => {
            let Some(entries) = document.as_object() else {
                return Err(DeviceError::MalformedDirective("update document is not an object".to_string()));
            };
            // A document wrapped in the asset's own root element merges
            // into that element.
            let same_root = entries.len() == 1
                && value
                    .as_object()
                    .is_some_and(|current| entries.keys().all(|k| current.contains_key(k)));
            let entries = match (same_root, entries.values().next()) {
                (true, Some(Value::Object(inner))) => inner,
                _ => entries,
            };
            for (key, new) in entries {
                set_field(value, key, new.clone());
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct AssetState {
    records: HashMap<String, AssetRecord>,
    order: Vec<String>,
}

impl AssetState {
    fn active(&self, asset_id: &str) -> Option<&AssetRecord> {
        self.records.get(asset_id).filter(|r| !r.removed)
    }

    fn insert(&mut self, record: AssetRecord) {
        if !self.records.contains_key(&record.asset_id) {
            self.order.push(record.asset_id.clone());
        }
        self.records.insert(record.asset_id.clone(), record);
    }

    fn mark_removed(&mut self, asset_id: &str, timestamp: &str) -> Result<AssetRecord> {
        let record = self
            .records
            .get_mut(asset_id)
            .filter(|r| !r.removed)
            .ok_or_else(|| DeviceError::AssetNotFound(asset_id.to_string()))?;
        record.removed = true;
        record.timestamp = timestamp.to_string();
        Ok(record.clone())
    }

    fn create(
        &mut self,
        device_uuid: &str,
        asset_id: &str,
        asset_type: &str,
        value: Value,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Result<AssetRecord> {
        if self.active(asset_id).is_some() {
            return Err(DeviceError::AssetAlreadyExists(asset_id.to_string()));
        }
        let record = AssetRecord {
            asset_id: asset_id.to_string(),
            asset_type: asset_type.to_string(),
            device_uuid: device_uuid.to_string(),
            timestamp: timestamp.to_string(),
            value,
            removed: false,
        };
        self.insert(record.clone());
        debug!(category = "assets", asset = %asset_id, asset_type = %asset_type, "Asset created");
        emit(asset_id, sink.asset_changed(asset_id, asset_type, timestamp));
        Ok(record)
    }

    fn update(
        &mut self,
        asset_id: &str,
        update: &AssetUpdate,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Result<AssetRecord> {
        let record = self
            .records
            .get_mut(asset_id)
            .filter(|r| !r.removed)
            .ok_or_else(|| DeviceError::AssetNotFound(asset_id.to_string()))?;

        let mut value = record.value.clone();
        apply_update(&mut value, update)?;
        record.value = value;
        record.timestamp = timestamp.to_string();
        let record = record.clone();

        debug!(category = "assets", asset = %asset_id, "Asset updated");
        emit(asset_id, sink.asset_changed(asset_id, &record.asset_type, timestamp));
        Ok(record)
    }

    fn remove(&mut self, asset_id: &str, timestamp: &str, sink: &dyn AssetEventSink) -> Result<AssetRecord> {
        let record = self.mark_removed(asset_id, timestamp)?;
        debug!(category = "assets", asset = %asset_id, "Asset removed");
        emit(asset_id, sink.asset_removed(asset_id, &record.asset_type, timestamp));
        Ok(record)
    }
}

fn emit(asset_id: &str, events: Result<Vec<Observation>>) {
    if let Err(e) = events {
        warn!(category = "assets", asset = %asset_id, "Asset event not recorded: {}", e);
    }
}

/// Thread-safe asset collection. Every operation, including its event
/// emission, runs under one lock.
#[derive(Debug, Default)]
pub struct AssetStore {
    state: Mutex<AssetState>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new asset. Fails if an active asset already has the id.
    pub fn create(
        &self,
        device_uuid: &str,
        asset_id: &str,
        asset_type: &str,
        value: Value,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Result<AssetRecord> {
        self.state
            .lock()
            .create(device_uuid, asset_id, asset_type, value, timestamp, sink)
    }

    /// Modify an active asset in place.
    pub fn update(
        &self,
        asset_id: &str,
        update: &AssetUpdate,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Result<AssetRecord> {
        self.state.lock().update(asset_id, update, timestamp, sink)
    }

    /// Mark an asset removed. The record is kept.
    pub fn remove(&self, asset_id: &str, timestamp: &str, sink: &dyn AssetEventSink) -> Result<AssetRecord> {
        self.state.lock().remove(asset_id, timestamp, sink)
    }

    /// Remove every active asset of a type that belongs to the device.
    pub fn remove_all(
        &self,
        device_uuid: &str,
        asset_type: &str,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Vec<AssetRecord> {
        let mut state = self.state.lock();
        let targets: Vec<String> = state
            .order
            .iter()
            .filter(|id| {
                state.active(id).is_some_and(|r| {
                    r.asset_type == asset_type && r.device_uuid == device_uuid
                })
            })
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(targets.len());
        for asset_id in targets {
            if let Ok(record) = state.mark_removed(&asset_id, timestamp) {
                emit(&asset_id, sink.asset_removed(&asset_id, asset_type, timestamp));
                removed.push(record);
            }
        }
        debug!(
            category = "assets",
            asset_type = %asset_type,
            count = removed.len(),
            "Assets removed"
        );
        removed
    }

    /// Apply an `@ASSET@` body: remove when it says so, update an active
    /// asset, or create.
    pub fn create_or_update_via_directive(
        &self,
        device_uuid: &str,
        asset_id: &str,
        asset_type: &str,
        body: Value,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Result<AssetRecord> {
        let mut state = self.state.lock();
        let exists = state.active(asset_id).is_some();
        match (is_marked_removed(&body), exists) {
            (true, true) => state.remove(asset_id, timestamp, sink),
            (true, false) => Err(DeviceError::AssetNotFound(asset_id.to_string())),
            (false, true) => state.update(asset_id, &AssetUpdate::Document(body), timestamp, sink),
            (false, false) => state.create(device_uuid, asset_id, asset_type, body, timestamp, sink),
        }
    }

    /// Execute a decoded directive.
    pub fn apply(
        &self,
        device_uuid: &str,
        command: AssetCommand,
        timestamp: &str,
        sink: &dyn AssetEventSink,
    ) -> Result<Vec<AssetRecord>> {
        match command {
            AssetCommand::Upsert {
                asset_id,
                asset_type,
                body,
            } => self
                .create_or_update_via_directive(device_uuid, &asset_id, &asset_type, body, timestamp, sink)
                .map(|r| vec![r]),
            AssetCommand::Update { asset_id, update } => {
                self.update(&asset_id, &update, timestamp, sink).map(|r| vec![r])
            }
            AssetCommand::Remove { asset_id } => self.remove(&asset_id, timestamp, sink).map(|r| vec![r]),
            AssetCommand::RemoveAll { asset_type } => {
                Ok(self.remove_all(device_uuid, &asset_type, timestamp, sink))
            }
        }
    }

    pub fn get(&self, asset_id: &str) -> Option<AssetRecord> {
        self.state.lock().records.get(asset_id).cloned()
    }

    /// Assets in creation order, optionally of one type.
    pub fn list(&self, asset_type: Option<&str>, include_removed: bool) -> Vec<AssetRecord> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|r| include_removed || !r.removed)
            .filter(|r| asset_type.is_none_or(|t| r.asset_type == t))
            .cloned()
            .collect()
    }

    /// Active asset count per type.
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for record in state.records.values().filter(|r| !r.removed) {
            *counts.entry(record.asset_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
