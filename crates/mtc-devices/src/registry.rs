//! Schema registry.
//!
//! Keeps every ingested version of each device schema and, per device, the
//! flattened [`DeviceTable`] the ingestion path resolves data items against.
//! Tables are immutable and swapped as a whole, so a reader holding an
//! `Arc<DeviceTable>` never sees a half-applied change.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use mtc_core::{AgentConfig, DeviceSettings};

use crate::descriptor::{flatten, Conversion, DataItemDescriptor};
use crate::error::{DeviceError, Result};
use crate::identity::assign_identifiers;
use crate::path::{parse_multi, PathQuery};
use crate::schema::{lifecycle, Description, DeviceNode, LifecycleEvents, SchemaDocument};
use crate::shdr::{CalibrationEntry, DataItemLookup};

/// One immutable version of a device's schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSchema {
    pub uuid: String,
    pub name: String,
    pub device_id: String,
    pub version: u32,
    /// SHA-256 of the raw schema text, hex encoded.
    pub fingerprint: String,
    pub creation_time: String,
    pub namespaces: BTreeMap<String, String>,
    pub ingested_at: DateTime<Utc>,
    /// Lifecycle items the registry added to the tree.
    pub lifecycle: LifecycleEvents,
    /// Tree with identifiers assigned and lifecycle items added.
    pub device: DeviceNode,
}

/// Hex SHA-256 of schema text.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Flattened view of a device's latest schema with its ingestion settings.
#[derive(Debug, Clone)]
pub struct DeviceTable {
    pub uuid: String,
    pub name: String,
    pub device_id: String,
    pub settings: DeviceSettings,
    pub description: Description,
    pub schema: Arc<DeviceSchema>,
    descriptors: Vec<DataItemDescriptor>,
    calibrations: HashMap<String, Conversion>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    by_source: HashMap<String, usize>,
}

impl DeviceTable {
    fn build(
        schema: Arc<DeviceSchema>,
        uuid: String,
        settings: DeviceSettings,
        description: Description,
        calibrations: HashMap<String, Conversion>,
    ) -> Self {
        let mut descriptors = flatten(&schema.device, &uuid);
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let mut by_source = HashMap::new();

        for (index, descriptor) in descriptors.iter_mut().enumerate() {
            if let Some(conversion) = calibrations.get(&descriptor.id) {
                descriptor.conversion = Some(*conversion);
            }
            if by_id.insert(descriptor.id.clone(), index).is_some() {
                warn!(
                    category = "schema",
                    device = %schema.name,
                    "Duplicate data item id: {}", descriptor.id
                );
            }
            if let Some(name) = &descriptor.name {
                by_name.entry(name.clone()).or_insert(index);
            }
            if let Some(source) = &descriptor.source {
                by_source.entry(source.clone()).or_insert(index);
            }
        }

        Self {
            name: schema.name.clone(),
            device_id: schema.device_id.clone(),
            uuid,
            settings,
            description,
            schema,
            descriptors,
            calibrations,
            by_id,
            by_name,
            by_source,
        }
    }

    pub fn descriptors(&self) -> &[DataItemDescriptor] {
        &self.descriptors
    }

    pub fn version(&self) -> u32 {
        self.schema.version
    }

    /// Descriptor by exact id.
    pub fn get(&self, id: &str) -> Option<&DataItemDescriptor> {
        self.by_id.get(id).map(|&i| &self.descriptors[i])
    }

    /// Resolve an adapter key: exact id, then name, then device-prefixed
    /// id, then source alias.
    pub fn resolve(&self, key: &str) -> Option<&DataItemDescriptor> {
        self.by_id
            .get(key)
            .or_else(|| self.by_name.get(key))
            .or_else(|| self.by_id.get(&format!("{}_{}", self.device_id, key)))
            .or_else(|| self.by_source.get(key))
            .map(|&i| &self.descriptors[i])
    }

    /// First descriptor of the given type.
    pub fn first_of_type(&self, data_item_type: &str) -> Option<&DataItemDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.data_item_type == data_item_type)
    }

    pub fn availability(&self) -> Option<&DataItemDescriptor> {
        self.first_of_type(lifecycle::AVAILABILITY)
    }

    fn rebuilt(
        &self,
        uuid: String,
        description: Description,
        calibrations: HashMap<String, Conversion>,
    ) -> Self {
        Self::build(
            self.schema.clone(),
            uuid,
            self.settings.clone(),
            description,
            calibrations,
        )
    }
}

impl DataItemLookup for DeviceTable {
    fn lookup(&self, key: &str) -> Option<&DataItemDescriptor> {
        self.resolve(key)
    }
}

/// Result of ingesting one device from a schema document.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub uuid: String,
    pub name: String,
    /// First version for this uuid.
    pub is_new: bool,
    /// Text was identical to the latest version; nothing was stored.
    pub is_duplicate: bool,
    pub version: u32,
    pub table: Arc<DeviceTable>,
}

#[derive(Debug, Default)]
struct RegistryState {
    versions: HashMap<String, Vec<Arc<DeviceSchema>>>,
    tables: HashMap<String, Arc<DeviceTable>>,
    order: Vec<String>,
}

/// Versioned store of device schemas.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    state: RwLock<RegistryState>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest schema text, producing one outcome per device it declares.
    ///
    /// Ingestion holds the write lock for the whole document, so two
    /// ingests for the same device never interleave.
    pub fn ingest(&self, text: &str, config: &AgentConfig) -> Result<Vec<IngestOutcome>> {
        let document = SchemaDocument::parse(text)?;
        let fingerprint = fingerprint(text);
        let ingested_at = Utc::now();

        let mut state = self.state.write();
        let mut outcomes = Vec::with_capacity(document.devices.len());

        for mut device in document.devices {
            let uuid = device.uuid.clone();
            let latest = state.versions.get(&uuid).and_then(|v| v.last()).cloned();

            if let Some(latest) = &latest {
                if latest.fingerprint == fingerprint {
                    if let Some(table) = state.tables.get(&uuid).cloned() {
                        debug!(
                            category = "schema",
                            uuid = %uuid,
                            version = latest.version,
                            "Schema unchanged"
                        );
                        outcomes.push(IngestOutcome {
                            uuid,
                            name: device.name,
                            is_new: false,
                            is_duplicate: true,
                            version: latest.version,
                            table,
                        });
                        continue;
                    }
                }
            }

            let device_id = assign_identifiers(&mut device);
            let lifecycle = device.ensure_lifecycle_events();

            let mut settings = config.settings_for(&device.name);
            if lifecycle.availability {
                settings.auto_available = true;
            }

            let version = latest.as_ref().map(|l| l.version + 1).unwrap_or(1);
            let description = device.description.clone().unwrap_or_default();
            let schema = Arc::new(DeviceSchema {
                uuid: uuid.clone(),
                name: device.name.clone(),
                device_id,
                version,
                fingerprint: fingerprint.clone(),
                creation_time: document.header.creation_time.clone(),
                namespaces: document.namespaces.clone(),
                ingested_at,
                lifecycle,
                device,
            });
            let table = Arc::new(DeviceTable::build(
                schema.clone(),
                uuid.clone(),
                settings,
                description,
                HashMap::new(),
            ));

            info!(
                category = "schema",
                uuid = %uuid,
                device = %schema.name,
                version,
                data_items = table.descriptors().len(),
                "Schema version stored"
            );

            state.versions.entry(uuid.clone()).or_default().push(schema.clone());
            if !state.order.contains(&uuid) {
                state.order.push(uuid.clone());
            }
            state.tables.insert(uuid.clone(), table.clone());

            outcomes.push(IngestOutcome {
                uuid,
                name: schema.name.clone(),
                is_new: latest.is_none(),
                is_duplicate: false,
                version,
                table,
            });
        }
        Ok(outcomes)
    }

    /// Latest schema version for a device.
    pub fn latest(&self, uuid: &str) -> Result<Arc<DeviceSchema>> {
        self.state
            .read()
            .versions
            .get(uuid)
            .and_then(|v| v.last().cloned())
            .ok_or_else(|| DeviceError::SchemaNotFound(uuid.to_string()))
    }

    /// Every retained version for a device, oldest first.
    pub fn versions(&self, uuid: &str) -> Vec<Arc<DeviceSchema>> {
        self.state
            .read()
            .versions
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Current table for a device.
    pub fn table(&self, uuid: &str) -> Result<Arc<DeviceTable>> {
        self.state
            .read()
            .tables
            .get(uuid)
            .cloned()
            .ok_or_else(|| DeviceError::SchemaNotFound(uuid.to_string()))
    }

    /// Flattened descriptors of a device's latest schema.
    pub fn flatten(&self, uuid: &str) -> Result<Vec<DataItemDescriptor>> {
        Ok(self.table(uuid)?.descriptors().to_vec())
    }

    /// Known device uuids in registration order.
    pub fn device_uuids(&self) -> Vec<String> {
        self.state.read().order.clone()
    }

    pub fn uuid_by_name(&self, name: &str) -> Option<String> {
        let state = self.state.read();
        state
            .order
            .iter()
            .find(|uuid| state.tables.get(*uuid).is_some_and(|t| t.name == name))
            .cloned()
    }

    /// Whether any known data item path matches the expression. Several
    /// paths may be given separated by `|`; one match is enough.
    pub fn path_exists(&self, expr: &str) -> bool {
        let Some(queries) = parse_multi(expr) else {
            debug!(category = "schema", "Unparseable path expression: {}", expr);
            return false;
        };

        let state = self.state.read();
        let targets: Vec<_> = state
            .tables
            .values()
            .flat_map(|t| t.descriptors().iter())
            .filter_map(|d| PathQuery::parse(&d.path))
            .collect();

        queries
            .iter()
            .any(|q| targets.iter().any(|target| q.matches(target)))
    }

    /// Apply calibration entries. Returns how many entries resolved.
    pub fn calibrate(&self, uuid: &str, entries: &[CalibrationEntry]) -> Result<usize> {
        self.swap_table(uuid, |table| {
            let mut calibrations = table.calibrations.clone();
            let mut applied = 0;
            for entry in entries {
                match table.resolve(&entry.key) {
                    Some(descriptor) => {
                        calibrations.insert(
                            descriptor.id.clone(),
                            Conversion::new(entry.factor, entry.offset),
                        );
                        applied += 1;
                    }
                    None => warn!(
                        category = "schema",
                        uuid = %uuid,
                        "Calibration for unknown data item: {}", entry.key
                    ),
                }
            }
            Ok((
                table.rebuilt(table.uuid.clone(), table.description.clone(), calibrations),
                applied,
            ))
        })
    }

    /// Overwrite one description field. Unknown fields are ignored.
    pub fn set_description_field(&self, uuid: &str, field: &str, value: &str) -> Result<bool> {
        self.swap_table(uuid, |table| {
            let mut description = table.description.clone();
            if !description.set_field(field, value) {
                warn!(category = "schema", "Unknown description field: {}", field);
                return Ok((table.clone(), false));
            }
            Ok((
                table.rebuilt(table.uuid.clone(), description, table.calibrations.clone()),
                true,
            ))
        })
    }

    /// Re-key a device under a new uuid. Retained versions move with it.
    pub fn rename_uuid(&self, old: &str, new: &str) -> Result<Arc<DeviceTable>> {
        let mut state = self.state.write();
        let table = state
            .tables
            .get(old)
            .cloned()
            .ok_or_else(|| DeviceError::SchemaNotFound(old.to_string()))?;
        if old == new {
            return Ok(table);
        }
        if state.tables.contains_key(new) {
            return Err(DeviceError::UuidInUse(new.to_string()));
        }

        let renamed = Arc::new(table.rebuilt(
            new.to_string(),
            table.description.clone(),
            table.calibrations.clone(),
        ));
        state.tables.remove(old);
        state.tables.insert(new.to_string(), renamed.clone());
        if let Some(versions) = state.versions.remove(old) {
            state.versions.insert(new.to_string(), versions);
        }
        for uuid in state.order.iter_mut() {
            if uuid.as_str() == old {
                *uuid = new.to_string();
            }
        }

        info!(category = "schema", old = %old, new = %new, "Device uuid changed");
        Ok(renamed)
    }

    fn swap_table<R>(
        &self,
        uuid: &str,
        derive: impl FnOnce(&DeviceTable) -> Result<(DeviceTable, R)>,
    ) -> Result<R> {
        let mut state = self.state.write();
        let current = state
            .tables
            .get(uuid)
            .cloned()
            .ok_or_else(|| DeviceError::SchemaNotFound(uuid.to_string()))?;
        let (next, result) = derive(&current)?;
        state.tables.insert(uuid.to_string(), Arc::new(next));
        Ok(result)
    }
}
