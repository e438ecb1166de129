//! Ingestion pipeline.
//!
//! Turns candidate values into committed observations. All checks against
//! the current value and the commit itself run inside one store
//! transaction, so two writers for the same item cannot both pass a
//! duplicate check.

use std::sync::Arc;

use tracing::{debug, trace};

use mtc_core::{
    Category, DeviceSettings, Observation, ObservationDraft, ObservationValue, AVAILABLE,
    UNAVAILABLE,
};
use mtc_storage::{ObservationStore, StoreState};

use crate::assets::AssetEventSink;
use crate::descriptor::DataItemDescriptor;
use crate::error::{DeviceError, Result};
use crate::registry::DeviceTable;
use crate::schema::{lifecycle, ValueFilter};
use crate::shdr::CandidateValue;
use crate::time::parse_timestamp;

/// A value ready for commit, with its timestamp already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub key: String,
    pub value: CandidateValue,
    pub timestamp: String,
    pub duration: Option<String>,
}

impl Candidate {
    pub fn scalar(
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: CandidateValue::Scalar(value.into()),
            timestamp: timestamp.into(),
            duration: None,
        }
    }
}

/// Value an item holds before any adapter data arrives.
pub fn default_value(descriptor: &DataItemDescriptor, settings: &DeviceSettings) -> ObservationValue {
    if let Some(fixed) = descriptor.constraints.fixed_value() {
        return ObservationValue::scalar(fixed);
    }
    if descriptor.data_item_type == lifecycle::AVAILABILITY && settings.auto_available {
        return ObservationValue::scalar(AVAILABLE);
    }
    ObservationValue::unavailable()
}

fn draft_for(
    table: &DeviceTable,
    descriptor: &DataItemDescriptor,
    timestamp: &str,
    value: ObservationValue,
) -> ObservationDraft {
    let mut draft = ObservationDraft::new(&descriptor.id, &table.uuid, timestamp, value);
    draft.data_item_name = descriptor.name.clone();
    draft.category = descriptor.category;
    draft.data_item_type = descriptor.data_item_type.clone();
    draft.path = descriptor.path.clone();
    draft.statistic = descriptor.statistic.clone();
    draft
}

fn shape(descriptor: &DataItemDescriptor, value: CandidateValue) -> ObservationValue {
    match value {
        CandidateValue::Scalar(v) if descriptor.category == Category::Condition => {
            ObservationValue::List(vec![v])
        }
        CandidateValue::Scalar(v) => ObservationValue::Scalar(v),
        CandidateValue::List(v) => ObservationValue::List(v),
        CandidateValue::TimeSeries { samples, .. } => ObservationValue::List(samples),
    }
}

fn is_suppressed(filter: ValueFilter, value: &ObservationValue, current: &Observation, timestamp: &str) -> bool {
    if current.value.is_unavailable() {
        return false;
    }
    match filter {
        ValueFilter::MinimumDelta(delta) => {
            let parse = |v: &ObservationValue| v.as_scalar().and_then(|s| s.trim().parse::<f64>().ok());
            match (parse(value), parse(&current.value)) {
                (Some(new), Some(previous)) => (new - previous).abs() <= delta,
                _ => false,
            }
        }
        ValueFilter::Period(seconds) => {
            match (parse_timestamp(timestamp), parse_timestamp(&current.timestamp)) {
                (Some(new), Some(previous)) => {
                    let elapsed = (new - previous).num_milliseconds() as f64 / 1000.0;
                    elapsed < seconds
                }
                _ => false,
            }
        }
    }
}

fn upcase(value: &mut ObservationValue) {
    match value {
        ObservationValue::Scalar(v) => *v = v.to_uppercase(),
        ObservationValue::List(items) => {
            if let Some(first) = items.first_mut() {
                *first = first.to_uppercase();
            }
        }
    }
}

/// Commits candidate values against a device table.
#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    store: Arc<ObservationStore>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<ObservationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ObservationStore> {
        &self.store
    }

    /// Commit one candidate, or report why it was rejected.
    pub fn commit(&self, table: &DeviceTable, candidate: Candidate) -> Result<Observation> {
        let descriptor = table
            .resolve(&candidate.key)
            .ok_or_else(|| DeviceError::UnknownDataItem {
                device: table.name.clone(),
                key: candidate.key.clone(),
            })?;
        let settings = &table.settings;
        let conversion = descriptor
            .conversion
            .filter(|_| settings.conversion_required);

        self.store.transact(|state| -> Result<Observation> {
            let current = state
                .current()
                .get(&descriptor.id)
                .ok_or_else(|| DeviceError::UninitializedDataItem(descriptor.id.clone()))?;

            let mut draft = draft_for(
                table,
                descriptor,
                &candidate.timestamp,
                ObservationValue::unavailable(),
            );
            draft.duration = candidate.duration;

            let value = match candidate.value {
                CandidateValue::TimeSeries {
                    sample_count,
                    sample_rate,
                    samples,
                } => {
                    draft.sample_count = Some(sample_count);
                    draft.sample_rate = Some(sample_rate);
                    match conversion {
                        Some(conversion) => ObservationValue::List(
                            samples.iter().map(|s| conversion.convert_text(s)).collect(),
                        ),
                        None => ObservationValue::List(samples),
                    }
                }
                other => {
                    let mut value = shape(descriptor, other);
                    if let Some(fixed) = descriptor.constraints.fixed_value() {
                        value = ObservationValue::scalar(fixed);
                    } else if let Some(filter) = descriptor.constraints.filter {
                        if is_suppressed(filter, &value, current, &candidate.timestamp) {
                            return Err(DeviceError::Filtered(descriptor.id.clone()));
                        }
                    }
                    if settings.upcase_values {
                        upcase(&mut value);
                    }
                    match (conversion, value) {
                        (Some(conversion), ObservationValue::Scalar(v))
                            if descriptor.category != Category::Condition =>
                        {
                            ObservationValue::Scalar(conversion.convert_text(&v))
                        }
                        (_, value) => value,
                    }
                }
            };

            if settings.filter_duplicates && !descriptor.is_discrete() && current.value == value {
                return Err(DeviceError::DuplicateValue(descriptor.id.clone()));
            }

            draft.value = value;
            let observation = state.commit(draft);
            trace!(
                category = "pipeline",
                id = %observation.data_item_id,
                sequence = observation.sequence,
                "Committed"
            );
            Ok(observation)
        })
    }

    /// Give every item of a freshly ingested schema its initial value.
    pub fn initialize(&self, table: &DeviceTable, timestamp: &str) -> Vec<Observation> {
        self.store.transact(|state| {
            table
                .descriptors()
                .iter()
                .map(|descriptor| {
                    let value = default_value(descriptor, &table.settings);
                    state.commit(draft_for(table, descriptor, timestamp, value))
                })
                .collect()
        })
    }

    /// Report AVAILABLE for auto-available items not already showing it.
    pub fn refresh_availability(&self, table: &DeviceTable, timestamp: &str) -> Vec<Observation> {
        if !table.settings.auto_available {
            return Vec::new();
        }
        let available = ObservationValue::scalar(AVAILABLE);
        self.store.transact(|state| {
            let stale: Vec<&DataItemDescriptor> = table
                .descriptors()
                .iter()
                .filter(|d| d.data_item_type == lifecycle::AVAILABILITY)
                .filter(|d| {
                    state
                        .current()
                        .get(&d.id)
                        .map(|current| current.value != available)
                        .unwrap_or(true)
                })
                .collect();
            stale
                .into_iter()
                .map(|d| state.commit(draft_for(table, d, timestamp, available.clone())))
                .collect()
        })
    }

    /// Mark a disconnected device's items UNAVAILABLE. Items already
    /// unavailable, or pinned to a constant, are left alone.
    pub fn flush_unavailable(&self, table: &DeviceTable, timestamp: &str) -> Vec<Observation> {
        self.store.transact(|state| {
            let mut flushed = Vec::new();
            for descriptor in table.descriptors() {
                let target = match descriptor.constraints.fixed_value() {
                    Some(fixed) => ObservationValue::scalar(fixed),
                    None => ObservationValue::unavailable(),
                };
                let skip = match state.current().get(&descriptor.id) {
                    Some(current) => current.value == target || current.value.is_unavailable(),
                    None => true,
                };
                if !skip {
                    flushed.push(state.commit(draft_for(table, descriptor, timestamp, target)));
                }
            }
            debug!(
                category = "pipeline",
                device = %table.name,
                count = flushed.len(),
                "Flushed unavailable"
            );
            flushed
        })
    }

    /// Re-commit every current value under the table's uuid and paths, e.g.
    /// after the adapter changed the device uuid. Values, timestamps and
    /// sample attributes are carried over unchanged.
    pub fn rekey_current(&self, table: &DeviceTable) -> Vec<Observation> {
        self.store.transact(|state| {
            let stale: Vec<(&DataItemDescriptor, Observation)> = table
                .descriptors()
                .iter()
                .filter_map(|d| state.current().get(&d.id).map(|o| (d, o.clone())))
                .filter(|(d, o)| o.device_uuid != table.uuid || o.path != d.path)
                .collect();
            stale
                .into_iter()
                .map(|(descriptor, previous)| {
                    let mut draft = draft_for(table, descriptor, &previous.timestamp, previous.value);
                    draft.duration = previous.duration;
                    draft.sample_rate = previous.sample_rate;
                    draft.sample_count = previous.sample_count;
                    draft.asset_type = previous.asset_type;
                    state.commit(draft)
                })
                .collect()
        })
    }

    /// Record that an asset was added or changed.
    pub fn asset_changed(
        &self,
        table: &DeviceTable,
        asset_id: &str,
        asset_type: &str,
        timestamp: &str,
    ) -> Result<Observation> {
        let descriptor = lifecycle_item(table, lifecycle::ASSET_CHANGED)?;
        self.store.transact(|state| -> Result<Observation> {
            Ok(commit_asset_event(
                state, table, descriptor, asset_id, asset_type, timestamp,
            ))
        })
    }

    /// Record that an asset was removed. When the asset is the latest
    /// changed one, ASSET_CHANGED first goes UNAVAILABLE.
    pub fn asset_removed(
        &self,
        table: &DeviceTable,
        asset_id: &str,
        asset_type: &str,
        timestamp: &str,
    ) -> Result<Vec<Observation>> {
        let removed = lifecycle_item(table, lifecycle::ASSET_REMOVED)?;
        let changed = table.first_of_type(lifecycle::ASSET_CHANGED);

        self.store.transact(|state| -> Result<Vec<Observation>> {
            let mut emitted = Vec::with_capacity(2);
            if let Some(changed) = changed {
                let is_latest = state
                    .current()
                    .get(&changed.id)
                    .and_then(|o| o.value.as_scalar().map(|v| v == asset_id))
                    .unwrap_or(false);
                if is_latest {
                    emitted.push(commit_asset_event(
                        state, table, changed, UNAVAILABLE, asset_type, timestamp,
                    ));
                }
            }
            emitted.push(commit_asset_event(
                state, table, removed, asset_id, asset_type, timestamp,
            ));
            Ok(emitted)
        })
    }

    /// Bind this pipeline to a device table as an asset event sink.
    pub fn asset_events<'a>(&'a self, table: &'a DeviceTable) -> DeviceAssetEvents<'a> {
        DeviceAssetEvents {
            pipeline: self,
            table,
        }
    }
}

fn lifecycle_item<'a>(table: &'a DeviceTable, data_item_type: &str) -> Result<&'a DataItemDescriptor> {
    table
        .first_of_type(data_item_type)
        .ok_or_else(|| DeviceError::UnknownDataItem {
            device: table.name.clone(),
            key: data_item_type.to_string(),
        })
}

fn commit_asset_event(
    state: &mut StoreState,
    table: &DeviceTable,
    descriptor: &DataItemDescriptor,
    value: &str,
    asset_type: &str,
    timestamp: &str,
) -> Observation {
    let mut draft = draft_for(table, descriptor, timestamp, ObservationValue::scalar(value));
    draft.asset_type = Some(asset_type.to_string());
    state.commit(draft)
}

/// Asset event sink that commits to one device's lifecycle items.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAssetEvents<'a> {
    pipeline: &'a IngestionPipeline,
    table: &'a DeviceTable,
}

impl AssetEventSink for DeviceAssetEvents<'_> {
    fn asset_changed(&self, asset_id: &str, asset_type: &str, timestamp: &str) -> Result<Vec<Observation>> {
        self.pipeline
            .asset_changed(self.table, asset_id, asset_type, timestamp)
            .map(|o| vec![o])
    }

    fn asset_removed(&self, asset_id: &str, asset_type: &str, timestamp: &str) -> Result<Vec<Observation>> {
        self.pipeline
            .asset_removed(self.table, asset_id, asset_type, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;
    use mtc_core::AgentConfig;

    const SCHEMA: &str = r#"{
        "header": {"creationTime": "t"},
        "devices": [{
            "id": "dev", "name": "VMC-3Axis", "uuid": "000",
            "dataItems": [
                {"id": "avail", "name": "avail", "type": "AVAILABILITY", "category": "EVENT"},
                {"id": "mode", "name": "mode", "type": "CONTROLLER_MODE", "category": "EVENT"},
                {"id": "power", "name": "power", "type": "POWER_STATE", "category": "EVENT",
                 "constraints": {"values": ["ON"]}},
                {"id": "pos", "name": "pos", "type": "POSITION", "category": "SAMPLE",
                 "units": "MILLIMETER", "nativeUnits": "INCH",
                 "constraints": {"filter": {"type": "MINIMUM_DELTA", "value": 1.0}}},
                {"id": "count", "name": "count", "type": "PART_COUNT", "category": "EVENT",
                 "representation": "DISCRETE"},
                {"id": "temp", "name": "temp", "type": "TEMPERATURE", "category": "SAMPLE",
                 "constraints": {"filter": {"type": "PERIOD", "value": 10}}},
                {"id": "system", "name": "system", "type": "SYSTEM", "category": "CONDITION"}
            ]
        }]
    }"#;

    fn setup(config: &AgentConfig) -> (IngestionPipeline, Arc<DeviceTable>) {
        let registry = SchemaRegistry::new();
        let table = registry.ingest(SCHEMA, config).unwrap().remove(0).table;
        let pipeline = IngestionPipeline::new(Arc::new(ObservationStore::new(100).unwrap()));
        pipeline.initialize(&table, "2014-08-11T08:32:54Z");
        (pipeline, table)
    }

    fn config_with(f: impl FnOnce(&mut DeviceSettings)) -> AgentConfig {
        let mut config = AgentConfig::default();
        f(&mut config.defaults);
        config
    }

    fn value_of(pipeline: &IngestionPipeline, id: &str) -> ObservationValue {
        pipeline.store().current(id).unwrap().value
    }

    #[test]
    fn test_initialize_defaults() {
        let (pipeline, table) = setup(&AgentConfig::default());
        assert_eq!(pipeline.store().stats().len, table.descriptors().len());
        assert!(value_of(&pipeline, "dev_avail").is_unavailable());
        assert_eq!(value_of(&pipeline, "dev_power").as_scalar(), Some("ON"));
    }

    #[test]
    fn test_commit_resolves_and_fills_descriptor_fields() {
        let (pipeline, table) = setup(&AgentConfig::default());
        let obs = pipeline
            .commit(&table, Candidate::scalar("avail", "AVAILABLE", "2014-08-11T08:32:54.028533Z"))
            .unwrap();
        assert_eq!(obs.data_item_id, "dev_avail");
        assert_eq!(obs.data_item_name.as_deref(), Some("avail"));
        assert_eq!(obs.data_item_type, "AVAILABILITY");
        assert_eq!(obs.timestamp, "2014-08-11T08:32:54.028533Z");
        assert_eq!(obs.device_uuid, "000");
    }

    #[test]
    fn test_unknown_item() {
        let (pipeline, table) = setup(&AgentConfig::default());
        let err = pipeline
            .commit(&table, Candidate::scalar("ghost", "1", "t"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownDataItem { .. }));
    }

    #[test]
    fn test_uninitialized_item() {
        let registry = SchemaRegistry::new();
        let table = registry.ingest(SCHEMA, &AgentConfig::default()).unwrap().remove(0).table;
        let pipeline = IngestionPipeline::new(Arc::new(ObservationStore::new(10).unwrap()));
        let err = pipeline
            .commit(&table, Candidate::scalar("mode", "AUTOMATIC", "t"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::UninitializedDataItem(_)));
    }

    #[test]
    fn test_duplicate_filter() {
        let config = config_with(|s| s.filter_duplicates = true);
        let (pipeline, table) = setup(&config);
        let before = pipeline.store().stats().len;

        pipeline.commit(&table, Candidate::scalar("mode", "AUTOMATIC", "t")).unwrap();
        let err = pipeline
            .commit(&table, Candidate::scalar("mode", "AUTOMATIC", "t"))
            .unwrap_err();
        assert!(err.is_filtered());
        assert_eq!(pipeline.store().stats().len, before + 1);

        // Discrete items always commit.
        pipeline.commit(&table, Candidate::scalar("count", "1", "t")).unwrap();
        pipeline.commit(&table, Candidate::scalar("count", "1", "t")).unwrap();
        assert_eq!(pipeline.store().stats().len, before + 3);
    }

    #[test]
    fn test_fixed_constraint_wins() {
        let (pipeline, table) = setup(&AgentConfig::default());
        let obs = pipeline
            .commit(&table, Candidate::scalar("power", "OFF", "t"))
            .unwrap();
        assert_eq!(obs.value.as_scalar(), Some("ON"));
    }

    #[test]
    fn test_minimum_delta_filter() {
        let (pipeline, table) = setup(&AgentConfig::default());
        pipeline.commit(&table, Candidate::scalar("pos", "10", "t")).unwrap();
        let err = pipeline
            .commit(&table, Candidate::scalar("pos", "10.5", "t"))
            .unwrap_err();
        assert!(matches!(err, DeviceError::Filtered(_)));
        pipeline.commit(&table, Candidate::scalar("pos", "12", "t")).unwrap();
    }

    #[test]
    fn test_period_filter() {
        let (pipeline, table) = setup(&AgentConfig::default());
        pipeline
            .commit(&table, Candidate::scalar("temp", "20", "2014-08-11T08:00:00Z"))
            .unwrap();
        assert!(pipeline
            .commit(&table, Candidate::scalar("temp", "21", "2014-08-11T08:00:05Z"))
            .is_err());
        pipeline
            .commit(&table, Candidate::scalar("temp", "22", "2014-08-11T08:00:10Z"))
            .unwrap();
    }

    #[test]
    fn test_upcase_and_conversion() {
        let config = config_with(|s| {
            s.upcase_values = true;
            s.conversion_required = true;
        });
        let (pipeline, table) = setup(&config);

        let obs = pipeline.commit(&table, Candidate::scalar("mode", "automatic", "t")).unwrap();
        assert_eq!(obs.value.as_scalar(), Some("AUTOMATIC"));

        let obs = pipeline.commit(&table, Candidate::scalar("pos", "2", "t")).unwrap();
        assert_eq!(obs.value.as_scalar(), Some("50.8"));

        let condition = Candidate {
            key: "system".into(),
            value: CandidateValue::List(vec!["fault".into(), "12".into(), "low".into()]),
            timestamp: "t".into(),
            duration: None,
        };
        let obs = pipeline.commit(&table, condition).unwrap();
        assert_eq!(
            obs.value,
            ObservationValue::List(vec!["FAULT".into(), "12".into(), "low".into()])
        );
        assert_eq!(pipeline.store().active_conditions("dev_system").len(), 1);
    }

    #[test]
    fn test_auto_available_refresh() {
        let config = config_with(|s| s.auto_available = true);
        let (pipeline, table) = setup(&config);
        assert_eq!(value_of(&pipeline, "dev_avail").as_scalar(), Some(AVAILABLE));
        assert!(pipeline.refresh_availability(&table, "t").is_empty());

        pipeline.commit(&table, Candidate::scalar("avail", UNAVAILABLE, "t")).unwrap();
        assert_eq!(pipeline.refresh_availability(&table, "t").len(), 1);
    }

    #[test]
    fn test_flush_unavailable() {
        let (pipeline, table) = setup(&AgentConfig::default());
        pipeline.commit(&table, Candidate::scalar("mode", "AUTOMATIC", "t")).unwrap();
        pipeline.commit(&table, Candidate::scalar("avail", "AVAILABLE", "t")).unwrap();

        let flushed = pipeline.flush_unavailable(&table, "t");
        let ids: Vec<_> = flushed.iter().map(|o| o.data_item_id.as_str()).collect();
        assert_eq!(ids, vec!["dev_avail", "dev_mode"]);
        assert!(value_of(&pipeline, "dev_mode").is_unavailable());
        assert_eq!(value_of(&pipeline, "dev_power").as_scalar(), Some("ON"));
    }

    #[test]
    fn test_asset_removed_clears_latest_change() {
        let (pipeline, table) = setup(&AgentConfig::default());
        pipeline.asset_changed(&table, "T1", "CuttingTool", "t").unwrap();

        let emitted = pipeline.asset_removed(&table, "T1", "CuttingTool", "t").unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].data_item_id, "dev_asset_chg");
        assert_eq!(emitted[0].value.as_scalar(), Some(UNAVAILABLE));
        assert_eq!(emitted[1].data_item_id, "dev_asset_rem");
        assert_eq!(emitted[1].asset_type.as_deref(), Some("CuttingTool"));

        // Removing an asset that is not the latest change emits one event.
        pipeline.asset_changed(&table, "T2", "CuttingTool", "t").unwrap();
        let emitted = pipeline.asset_removed(&table, "T3", "CuttingTool", "t").unwrap();
        assert_eq!(emitted.len(), 1);
    }
}
