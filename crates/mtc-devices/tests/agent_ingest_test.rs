//! End-to-end ingestion tests for the Agent.
//!
//! Covers schema versioning, line ingestion, duplicate filtering, the
//! asset lifecycle and buffer capacity.

use std::collections::HashMap;
use std::sync::Arc;

use mtc_core::{AgentConfig, DeviceSettings, ObservationValue};
use mtc_devices::{Agent, DeviceError};

fn schema(estop_units: &str) -> String {
    format!(
        r#"{{
        "header": {{"creationTime": "2014-08-11T08:32:54Z", "sender": "adapter"}},
        "namespaces": {{"xmlns": "urn:mtconnect.org:MTConnectDevices:1.3"}},
        "devices": [{{
            "id": "dev", "name": "VMC-3Axis", "uuid": "000",
            "dataItems": [
                {{"id": "avail", "name": "avail", "type": "AVAILABILITY", "category": "EVENT"}},
                {{"id": "estop", "name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT",
                  "units": "{}"}}
            ],
            "components": [{{
                "tag": "Controller",
                "name": "controller",
                "dataItems": [
                    {{"name": "execution", "type": "EXECUTION", "category": "EVENT"}},
                    {{"name": "line", "type": "LINE", "category": "EVENT"}},
                    {{"name": "mode", "type": "CONTROLLER_MODE", "category": "EVENT"}},
                    {{"name": "partcount", "type": "PART_COUNT", "category": "EVENT",
                      "representation": "DISCRETE"}}
                ]
            }}]
        }}]
    }}"#,
        estop_units
    )
}

fn config(settings: DeviceSettings) -> AgentConfig {
    AgentConfig {
        defaults: settings,
        devices: HashMap::new(),
        ..Default::default()
    }
}

fn agent_with(settings: DeviceSettings) -> Agent {
    let agent = Agent::new(config(settings)).unwrap();
    agent.ingest_schema(&schema("NONE")).unwrap();
    agent
}

fn id_of(agent: &Agent, name: &str) -> String {
    agent
        .descriptors("000")
        .unwrap()
        .into_iter()
        .find(|d| d.name.as_deref() == Some(name))
        .map(|d| d.id)
        .unwrap()
}

#[test]
fn test_initial_ingest_sets_unavailable() {
    let agent = agent_with(DeviceSettings::default());
    assert!(agent.current("dev_avail").unwrap().value.is_unavailable());
    assert!(agent.current("dev_estop").unwrap().value.is_unavailable());
}

#[test]
fn test_single_value_line() {
    let agent = agent_with(DeviceSettings::default());
    let outcome = agent
        .process_line("000", "2014-08-11T08:32:54.028533Z|avail|AVAILABLE")
        .unwrap();

    assert_eq!(outcome.observations.len(), 1);
    let observation = &outcome.observations[0];
    assert_eq!(observation.data_item_id, "dev_avail");
    assert_eq!(observation.value, ObservationValue::scalar("AVAILABLE"));
    assert_eq!(observation.timestamp, "2014-08-11T08:32:54.028533Z");
    assert_eq!(agent.current("dev_avail").unwrap().sequence, observation.sequence);
}

#[test]
fn test_multi_value_line() {
    let agent = agent_with(DeviceSettings::default());
    let outcome = agent
        .process_line(
            "000",
            "2014-08-11T08:32:54Z|execution|READY|line|204|mode|AUTOMATIC",
        )
        .unwrap();

    assert_eq!(outcome.observations.len(), 3);
    assert!(outcome.rejected.is_empty());
    assert!(outcome
        .observations
        .iter()
        .all(|o| o.timestamp == "2014-08-11T08:32:54Z"));
    assert!(outcome
        .observations
        .windows(2)
        .all(|w| w[0].sequence < w[1].sequence));

    let mode = agent.current(&id_of(&agent, "mode")).unwrap();
    assert_eq!(mode.value.as_scalar(), Some("AUTOMATIC"));
}

#[test]
fn test_identical_reingest_keeps_version_and_ids() {
    let agent = agent_with(DeviceSettings::default());
    let before = agent.descriptors("000").unwrap();
    let stats = agent.store().stats();

    let outcomes = agent.ingest_schema(&schema("NONE")).unwrap();
    assert!(outcomes[0].is_duplicate);
    assert_eq!(outcomes[0].version, 1);
    assert_eq!(agent.registry().versions("000").len(), 1);
    assert_eq!(agent.descriptors("000").unwrap(), before);
    assert_eq!(agent.store().stats().last_sequence, stats.last_sequence);
}

#[test]
fn test_attribute_change_adds_version_with_stable_ids() {
    let agent = agent_with(DeviceSettings::default());
    let before: Vec<String> = agent
        .descriptors("000")
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();

    let outcomes = agent.ingest_schema(&schema("COUNT")).unwrap();
    assert!(!outcomes[0].is_duplicate);
    assert_eq!(outcomes[0].version, 2);
    assert_eq!(agent.registry().versions("000").len(), 2);

    let after = agent.descriptors("000").unwrap();
    let ids: Vec<String> = after.iter().map(|d| d.id.clone()).collect();
    assert_eq!(ids, before);

    let estop = after.iter().find(|d| d.id == "dev_estop").unwrap();
    assert_eq!(estop.units.as_deref(), Some("COUNT"));
}

#[test]
fn test_duplicate_filtering() {
    let agent = agent_with(DeviceSettings {
        filter_duplicates: true,
        ..Default::default()
    });

    agent.process_line("000", "t1|estop|ARMED").unwrap();
    let second = agent.process_line("000", "t2|estop|ARMED").unwrap();
    assert!(second.observations.is_empty());
    assert!(matches!(second.rejected[0].1, DeviceError::DuplicateValue(_)));

    let stored = agent
        .store()
        .snapshot()
        .into_iter()
        .filter(|o| o.data_item_id == "dev_estop" && !o.value.is_unavailable())
        .count();
    assert_eq!(stored, 1);

    // Discrete items keep every value.
    let partcount = id_of(&agent, "partcount");
    agent.process_line("000", "t3|partcount|1").unwrap();
    let again = agent.process_line("000", "t4|partcount|1").unwrap();
    assert_eq!(again.observations.len(), 1);
    assert_eq!(agent.current(&partcount).unwrap().timestamp, "t4");
}

#[test]
fn test_asset_create_then_remove() {
    let agent = agent_with(DeviceSettings::default());

    let created = agent
        .process_line(
            "000",
            r#"2014-08-11T08:32:54Z|@ASSET@|T1|CuttingTool|{"CuttingTool": {"serialNumber": "1"}}"#,
        )
        .unwrap();
    assert_eq!(created.assets.len(), 1);
    assert_eq!(
        agent.current("dev_asset_chg").unwrap().value.as_scalar(),
        Some("T1")
    );

    let last = agent.store().stats().last_sequence.unwrap();
    let removed = agent
        .process_line("000", "2014-08-11T08:33:00Z|@REMOVE_ASSET@|T1")
        .unwrap();
    assert!(removed.assets[0].removed);
    assert!(agent.asset("T1").unwrap().removed);

    let emitted = agent.range(last + 1, 10).unwrap();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].data_item_id, "dev_asset_chg");
    assert!(emitted[0].value.is_unavailable());
    assert_eq!(emitted[1].data_item_id, "dev_asset_rem");
    assert_eq!(emitted[1].value.as_scalar(), Some("T1"));
    assert_eq!(emitted[1].asset_type.as_deref(), Some("CuttingTool"));

    // Removing again is rejected without new emissions.
    let again = agent
        .process_line("000", "2014-08-11T08:33:01Z|@REMOVE_ASSET@|T1")
        .unwrap();
    assert!(matches!(again.rejected[0].1, DeviceError::AssetNotFound(_)));
    assert!(agent.range(last + 3, 10).is_err());
}

#[test]
fn test_remove_all_assets_of_type() {
    let agent = agent_with(DeviceSettings::default());
    for id in ["T1", "T2"] {
        agent
            .create_asset("000", id, "CuttingTool", serde_json::json!({"CuttingTool": {}}))
            .unwrap();
    }
    agent
        .create_asset("000", "F1", "Fixture", serde_json::json!({"Fixture": {}}))
        .unwrap();

    let outcome = agent
        .process_line("000", "t|@REMOVE_ALL_ASSETS@|CuttingTool")
        .unwrap();
    assert_eq!(outcome.assets.len(), 2);
    assert_eq!(agent.assets(Some("CuttingTool"), false).len(), 0);
    assert_eq!(agent.assets(None, false).len(), 1);
    assert_eq!(agent.assets(None, true).len(), 3);
}

#[test]
fn test_buffer_capacity_holds_latest() {
    let agent = Agent::new(AgentConfig {
        buffer_size: 4,
        ..Default::default()
    })
    .unwrap();
    agent.ingest_schema(&schema("NONE")).unwrap();

    for i in 0..10 {
        agent
            .process_line("000", &format!("t|line|{}", i))
            .unwrap();
    }
    let snapshot = agent.store().snapshot();
    assert_eq!(snapshot.len(), 4);
    let values: Vec<&str> = snapshot.iter().filter_map(|o| o.value.as_scalar()).collect();
    assert_eq!(values, vec!["6", "7", "8", "9"]);

    // A start older than the buffer begins at the oldest retained record.
    let range = agent.range(1, 2).unwrap();
    assert_eq!(range[0].sequence, snapshot[0].sequence);
}

#[test]
fn test_path_queries() {
    let agent = agent_with(DeviceSettings::default());
    assert!(agent.path_exists(r#"//Device[@name="VMC-3Axis"]//DataItem[@type="AVAILABILITY"]"#));
    assert!(agent.path_exists(r#"//Controller//DataItem[@type="EXECUTION"]"#));
    assert!(agent.path_exists(
        r#"//DataItem[@type="NOPE"]|//Controller//DataItem[@type="LINE"]"#
    ));
    assert!(!agent.path_exists(r#"//Axes//DataItem[@type="LINE"]"#));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reingest_races_with_commits() {
    let agent = Arc::new(agent_with(DeviceSettings::default()));

    let writer = {
        let agent = agent.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..500 {
                let outcome = agent
                    .process_line("000", &format!("t|line|{}", i))
                    .unwrap();
                assert_eq!(outcome.observations.len(), 1);
            }
        })
    };
    let ingester = {
        let agent = agent.clone();
        tokio::task::spawn_blocking(move || {
            for i in 0..20 {
                let units = if i % 2 == 0 { "COUNT" } else { "NONE" };
                agent.ingest_schema(&schema(units)).unwrap();
            }
        })
    };
    writer.await.unwrap();
    ingester.await.unwrap();

    let snapshot = agent.store().snapshot();
    assert!(snapshot.windows(2).all(|w| w[0].sequence < w[1].sequence));
}
