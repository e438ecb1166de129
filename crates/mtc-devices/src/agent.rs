//! Agent facade.
//!
//! One [`Agent`] owns the schema registry, the observation store, the asset
//! store and per-device clocks. Independent agents share nothing, so tests
//! can run many side by side.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use mtc_core::config::defaults;
use mtc_core::{AgentConfig, Observation};
use mtc_storage::ObservationStore;

use crate::assets::{AssetCommand, AssetRecord, AssetStore, AssetUpdate};
use crate::descriptor::DataItemDescriptor;
use crate::error::{DeviceError, Result};
use crate::pipeline::{Candidate, IngestionPipeline};
use crate::probe::{ProbeDevice, ProbeDocument, ProbeHeader};
use crate::registry::{DeviceSchema, DeviceTable, IngestOutcome, SchemaRegistry};
use crate::shdr::{parse_line, ProtocolCommand, ShdrEntry, ShdrLine};
use crate::time::{format_timestamp, TimeResolver};

/// What one adapter line produced.
#[derive(Debug, Default)]
pub struct LineOutcome {
    pub observations: Vec<Observation>,
    pub assets: Vec<AssetRecord>,
    /// Keys that were dropped, with the reason.
    pub rejected: Vec<(String, DeviceError)>,
    pub command: Option<ProtocolCommand>,
}

pub struct Agent {
    config: AgentConfig,
    registry: SchemaRegistry,
    pipeline: IngestionPipeline,
    assets: AssetStore,
    clocks: Mutex<HashMap<String, TimeResolver>>,
    instance_id: i64,
}

impl Agent {
    /// Create an agent with a buffer sized from the configuration.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let store = ObservationStore::new(config.buffer_size)?;
        Ok(Self::with_store(config, store))
    }

    /// Create an agent over an existing store.
    pub fn with_store(config: AgentConfig, store: ObservationStore) -> Self {
        Self {
            config,
            registry: SchemaRegistry::new(),
            pipeline: IngestionPipeline::new(Arc::new(store)),
            assets: AssetStore::new(),
            clocks: Mutex::new(HashMap::new()),
            instance_id: Utc::now().timestamp(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<ObservationStore> {
        self.pipeline.store()
    }

    fn now() -> String {
        format_timestamp(Utc::now())
    }

    /// Ingest schema text and initialize the items of new versions.
    pub fn ingest_schema(&self, text: &str) -> Result<Vec<IngestOutcome>> {
        let outcomes = self.registry.ingest(text, &self.config)?;
        let now = Self::now();
        for outcome in &outcomes {
            if outcome.is_duplicate {
                self.pipeline.refresh_availability(&outcome.table, &now);
            } else {
                let initialized = self.pipeline.initialize(&outcome.table, &now);
                info!(
                    category = "agent",
                    uuid = %outcome.uuid,
                    version = outcome.version,
                    initialized = initialized.len(),
                    "Device ready"
                );
            }
        }
        Ok(outcomes)
    }

    /// Process one adapter line for a device. Bad entries are logged and
    /// skipped; the rest of the line still commits.
    pub fn process_line(&self, uuid: &str, line: &str) -> Result<LineOutcome> {
        let table = self.registry.table(uuid)?;
        let mut outcome = LineOutcome::default();

        match parse_line(line, table.as_ref()) {
            ShdrLine::Empty => {}
            ShdrLine::Command(command) => {
                outcome.observations = self.apply_command(uuid, &table, &command)?;
                outcome.command = Some(command);
            }
            ShdrLine::Data(batch) => {
                let timestamp = self.clocks.lock().entry(uuid.to_string()).or_default().resolve(
                    batch.timestamp.as_deref(),
                    &table.settings,
                    Utc::now(),
                );

                for entry in batch.entries {
                    match entry {
                        ShdrEntry::Value(value) => {
                            let key = value.key.clone();
                            let candidate = Candidate {
                                key: value.key,
                                value: value.value,
                                timestamp: timestamp.clone(),
                                duration: batch.duration.clone(),
                            };
                            match self.pipeline.commit(&table, candidate) {
                                Ok(observation) => outcome.observations.push(observation),
                                Err(e) => {
                                    if e.is_filtered() {
                                        debug!(category = "agent", key = %key, "{}", e);
                                    } else {
                                        warn!(category = "agent", uuid = %uuid, "{}", e);
                                    }
                                    outcome.rejected.push((key, e));
                                }
                            }
                        }
                        ShdrEntry::Asset(directive) => {
                            let sink = self.pipeline.asset_events(&table);
                            let applied = AssetCommand::decode(&directive).and_then(|command| {
                                self.assets.apply(uuid, command, &timestamp, &sink)
                            });
                            match applied {
                                Ok(records) => outcome.assets.extend(records),
                                Err(e) => {
                                    warn!(category = "agent", uuid = %uuid, "{}", e);
                                    outcome
                                        .rejected
                                        .push((directive.kind.token().to_string(), e));
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Apply a protocol command. Returns observations it re-committed.
    fn apply_command(
        &self,
        uuid: &str,
        table: &DeviceTable,
        command: &ProtocolCommand,
    ) -> Result<Vec<Observation>> {
        match command {
            ProtocolCommand::Calibration(entries) => {
                let applied = self.registry.calibrate(uuid, entries)?;
                info!(category = "agent", uuid = %uuid, applied, "Calibration applied");
            }
            ProtocolCommand::Description { field, value } => {
                self.registry.set_description_field(uuid, field, value)?;
            }
            ProtocolCommand::Uuid(new_uuid) => {
                if table.settings.preserve_uuid {
                    info!(category = "agent", uuid = %uuid, "Ignoring uuid change to {}", new_uuid);
                } else if !new_uuid.is_empty() {
                    let renamed = self.registry.rename_uuid(uuid, new_uuid)?;
                    {
                        let mut clocks = self.clocks.lock();
                        if let Some(clock) = clocks.remove(uuid) {
                            clocks.insert(new_uuid.clone(), clock);
                        }
                    }
                    let rekeyed = self.pipeline.rekey_current(&renamed);
                    debug!(
                        category = "agent",
                        uuid = %new_uuid,
                        count = rekeyed.len(),
                        "Current values moved to new uuid"
                    );
                    return Ok(rekeyed);
                }
            }
            ProtocolCommand::Other { name, .. } => {
                debug!(category = "agent", "Ignoring protocol command: {}", name);
            }
        }
        Ok(Vec::new())
    }

    /// Commit a single candidate for a device.
    pub fn commit(&self, uuid: &str, candidate: Candidate) -> Result<Observation> {
        let table = self.registry.table(uuid)?;
        self.pipeline.commit(&table, candidate)
    }

    /// Adapter connected: restart relative time and report availability.
    pub fn device_connected(&self, uuid: &str) -> Result<Vec<Observation>> {
        let table = self.registry.table(uuid)?;
        if let Some(clock) = self.clocks.lock().get_mut(uuid) {
            clock.reset();
        }
        Ok(self.pipeline.refresh_availability(&table, &Self::now()))
    }

    /// Adapter disconnected: every item goes UNAVAILABLE.
    pub fn device_disconnected(&self, uuid: &str) -> Result<Vec<Observation>> {
        let table = self.registry.table(uuid)?;
        if let Some(clock) = self.clocks.lock().get_mut(uuid) {
            clock.reset();
        }
        let flushed = self.pipeline.flush_unavailable(&table, &Self::now());
        info!(
            category = "agent",
            uuid = %uuid,
            flushed = flushed.len(),
            "Device disconnected"
        );
        Ok(flushed)
    }

    pub fn create_asset(
        &self,
        uuid: &str,
        asset_id: &str,
        asset_type: &str,
        body: Value,
    ) -> Result<AssetRecord> {
        let table = self.registry.table(uuid)?;
        let sink = self.pipeline.asset_events(&table);
        self.assets
            .create(uuid, asset_id, asset_type, body, &Self::now(), &sink)
    }

    pub fn update_asset(&self, uuid: &str, asset_id: &str, update: &AssetUpdate) -> Result<AssetRecord> {
        let table = self.registry.table(uuid)?;
        let sink = self.pipeline.asset_events(&table);
        self.assets.update(asset_id, update, &Self::now(), &sink)
    }

    pub fn remove_asset(&self, uuid: &str, asset_id: &str) -> Result<AssetRecord> {
        let table = self.registry.table(uuid)?;
        let sink = self.pipeline.asset_events(&table);
        self.assets.remove(asset_id, &Self::now(), &sink)
    }

    pub fn remove_all_assets(&self, uuid: &str, asset_type: &str) -> Result<Vec<AssetRecord>> {
        let table = self.registry.table(uuid)?;
        let sink = self.pipeline.asset_events(&table);
        Ok(self.assets.remove_all(uuid, asset_type, &Self::now(), &sink))
    }

    /// Probe summary for one device, or for all devices.
    pub fn probe(&self, uuid: Option<&str>) -> Result<ProbeDocument> {
        let uuids = match uuid {
            Some(uuid) => vec![uuid.to_string()],
            None => self.registry.device_uuids(),
        };
        let tables = uuids
            .iter()
            .map(|uuid| self.registry.table(uuid))
            .collect::<Result<Vec<_>>>()?;

        let namespaces = tables
            .first()
            .map(|t| t.schema.namespaces.clone())
            .unwrap_or_default();
        let asset_counts = self.assets.counts_by_type();

        Ok(ProbeDocument {
            namespaces,
            header: ProbeHeader {
                creation_time: Self::now(),
                sender: self.config.sender.clone(),
                instance_id: self.instance_id,
                version: defaults::SCHEMA_VERSION.to_string(),
                buffer_size: self.store().capacity(),
                asset_count: asset_counts.values().sum(),
                asset_counts,
            },
            devices: tables.iter().map(|t| ProbeDevice::from_table(t)).collect(),
        })
    }

    pub fn current(&self, data_item_id: &str) -> Option<Observation> {
        self.store().current(data_item_id)
    }

    pub fn current_snapshot(&self) -> Vec<Observation> {
        self.store().current_snapshot()
    }

    pub fn range(&self, from: u64, count: usize) -> Result<Vec<Observation>> {
        Ok(self.store().range(from, count)?)
    }

    pub fn descriptors(&self, uuid: &str) -> Result<Vec<DataItemDescriptor>> {
        self.registry.flatten(uuid)
    }

    pub fn latest_schema(&self, uuid: &str) -> Result<Arc<DeviceSchema>> {
        self.registry.latest(uuid)
    }

    pub fn assets(&self, asset_type: Option<&str>, include_removed: bool) -> Vec<AssetRecord> {
        self.assets.list(asset_type, include_removed)
    }

    pub fn asset(&self, asset_id: &str) -> Option<AssetRecord> {
        self.assets.get(asset_id)
    }

    pub fn path_exists(&self, expr: &str) -> bool {
        self.registry.path_exists(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "header": {"creationTime": "2013-02-11T12:12:57Z"},
        "namespaces": {"xmlns": "urn:mtconnect.org:MTConnectDevices:1.3"},
        "devices": [{
            "id": "dev", "name": "VMC-3Axis", "uuid": "000",
            "description": {"manufacturer": "SystemInsights"},
            "dataItems": [
                {"id": "avail", "name": "avail", "type": "AVAILABILITY", "category": "EVENT"},
                {"id": "estop", "name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT"}
            ]
        }]
    }"#;

    fn agent() -> Agent {
        let agent = Agent::new(AgentConfig::default()).unwrap();
        agent.ingest_schema(SCHEMA).unwrap();
        agent
    }

    #[test]
    fn test_unknown_device_line() {
        let agent = agent();
        assert!(matches!(
            agent.process_line("999", "t|avail|AVAILABLE"),
            Err(DeviceError::SchemaNotFound(_))
        ));
    }

    #[test]
    fn test_bad_entry_does_not_abort_line() {
        let agent = agent();
        let outcome = agent
            .process_line("000", "t|ghost|1|estop|TRIGGERED")
            .unwrap();
        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].0, "ghost");
    }

    #[test]
    fn test_description_command_shows_in_probe() {
        let agent = agent();
        agent
            .process_line("000", "* serialNumber: 1122")
            .unwrap();
        let probe = agent.probe(Some("000")).unwrap();
        let description = &probe.devices[0].description;
        assert_eq!(description.serial_number.as_deref(), Some("1122"));
        assert_eq!(description.manufacturer.as_deref(), Some("SystemInsights"));
    }

    #[test]
    fn test_uuid_command_respects_preserve() {
        let mut config = AgentConfig::default();
        config.defaults.preserve_uuid = true;
        let agent = Agent::new(config).unwrap();
        agent.ingest_schema(SCHEMA).unwrap();
        agent.process_line("000", "* uuid: 111").unwrap();
        assert!(agent.registry().table("000").is_ok());

        let agent = self::agent();
        agent.process_line("000", "* uuid: 111").unwrap();
        assert!(agent.registry().table("111").is_ok());
        assert!(agent.process_line("111", "t|avail|AVAILABLE").is_ok());
    }

    #[test]
    fn test_uuid_change_moves_current_values() {
        let agent = agent();
        agent.process_line("000", "2014-08-11T08:32:54Z|avail|AVAILABLE").unwrap();
        let before = agent.current("dev_avail").unwrap();

        let outcome = agent.process_line("000", "* uuid: 111").unwrap();
        assert_eq!(outcome.observations.len(), agent.descriptors("111").unwrap().len());

        let avail = agent.current("dev_avail").unwrap();
        assert_eq!(avail.device_uuid, "111");
        assert!(avail.path.contains(r#"@uuid="111""#));
        assert_eq!(avail.value, before.value);
        assert_eq!(avail.timestamp, before.timestamp);
        assert!(avail.sequence > before.sequence);
        assert!(agent
            .current_snapshot()
            .iter()
            .all(|o| o.device_uuid == "111"));
    }

    #[test]
    fn test_relative_time_bad_offset_does_not_panic() {
        let mut config = AgentConfig::default();
        config.defaults.relative_time = true;
        let agent = Agent::new(config).unwrap();
        agent.ingest_schema(SCHEMA).unwrap();

        agent.process_line("000", "0|avail|AVAILABLE").unwrap();
        for raw in ["inf", "NaN", "1e20"] {
            let outcome = agent
                .process_line("000", &format!("{}|estop|ARMED", raw))
                .unwrap();
            assert_eq!(outcome.observations.len(), 1);
        }
    }

    #[test]
    fn test_probe_header() {
        let agent = agent();
        agent
            .create_asset("000", "T1", "CuttingTool", serde_json::json!({"CuttingTool": {}}))
            .unwrap();
        let probe = agent.probe(None).unwrap();
        assert_eq!(probe.header.version, "1.3");
        assert_eq!(probe.header.buffer_size, 1000);
        assert_eq!(probe.header.asset_count, 1);
        assert_eq!(probe.header.asset_counts.get("CuttingTool"), Some(&1));
        assert_eq!(probe.devices.len(), 1);
        assert_eq!(
            probe.namespaces.get("xmlns").map(String::as_str),
            Some("urn:mtconnect.org:MTConnectDevices:1.3")
        );
    }

    #[test]
    fn test_disconnect_flushes() {
        let agent = agent();
        agent.process_line("000", "t|avail|AVAILABLE").unwrap();
        let flushed = agent.device_disconnected("000").unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(agent.current("dev_avail").unwrap().value.is_unavailable());
    }
}
