//! Deterministic identifier assignment.
//!
//! Identifiers are derived from the tree structure alone, so re-ingesting
//! the same schema text always yields the same ids. Component and data item
//! ids are scoped by their parent's id.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::schema::{ComponentNode, DataItemNode, DeviceNode, Reference};

/// Namespace constant hashed into device ids the schema leaves out.
pub const DEVICE_NAMESPACE: &str = "6ba7b812-9dad-11d1-80b4-00c04fd430c8";
/// Salt paired with [`DEVICE_NAMESPACE`].
pub const DEVICE_NAMESPACE_SALT: &str = "urn:mtconnect.org";

const KEY_LEN: usize = 5;

/// Short keyed hash: PBKDF2-HMAC-SHA256, one iteration, 5 bytes, hex.
pub fn derive_key(input: &str, salt: &str) -> String {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(input.as_bytes(), salt.as_bytes(), 1, &mut key);
    hex::encode(key)
}

/// Assign ids throughout a device tree and return the device id.
pub fn assign_identifiers(device: &mut DeviceNode) -> String {
    let device_id = match &device.id {
        Some(id) => id.clone(),
        None => {
            let id = format!(
                "{}_{}",
                derive_key(DEVICE_NAMESPACE, DEVICE_NAMESPACE_SALT),
                device.uuid
            );
            device.id = Some(id.clone());
            id
        }
    };

    assign_data_items(&mut device.data_items, &device_id, &device_id);
    assign_references(&mut device.references, &device_id);
    for component in &mut device.components {
        assign_component(component, &device_id, &device_id);
    }
    device_id
}

fn assign_component(component: &mut ComponentNode, device_id: &str, parent_id: &str) {
    let id = match &component.id {
        Some(id) => id.clone(),
        None => {
            let input = format!("{}{}", component.tag, component.name.as_deref().unwrap_or(""));
            let id = format!("{}_{}", parent_id, derive_key(&input, parent_id));
            component.id = Some(id.clone());
            id
        }
    };

    assign_data_items(&mut component.data_items, device_id, &id);
    assign_references(&mut component.references, device_id);
    for child in &mut component.components {
        assign_component(child, device_id, &id);
    }
}

fn assign_data_items(items: &mut [DataItemNode], device_id: &str, parent_id: &str) {
    for item in items {
        let id = match &item.id {
            Some(declared) => format!("{}_{}", device_id, declared),
            None => {
                let input = format!(
                    "DataItem{}{}{}",
                    item.data_item_type,
                    item.sub_type.as_deref().unwrap_or(""),
                    item.name.as_deref().unwrap_or("")
                );
                format!("{}_{}", parent_id, derive_key(&input, parent_id))
            }
        };
        item.id = Some(id);
    }
}

fn assign_references(references: &mut [Reference], device_id: &str) {
    for reference in references {
        reference.data_item_id = format!("{}_{}", device_id, reference.data_item_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDocument;

    fn device(text: &str) -> DeviceNode {
        SchemaDocument::parse(text).unwrap().devices.remove(0)
    }

    const SCHEMA: &str = r#"{
        "header": {"creationTime": "t"},
        "devices": [{
            "name": "VMC-3Axis",
            "uuid": "000",
            "dataItems": [{"id": "avail", "type": "AVAILABILITY", "category": "EVENT"}],
            "components": [{
                "tag": "Controller",
                "name": "ctl",
                "dataItems": [{"name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT"}],
                "components": [{"tag": "Path", "id": "path1"}],
                "references": [{"dataItemId": "avail"}]
            }]
        }]
    }"#;

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key("Controllerctl", "dev");
        assert_eq!(a, derive_key("Controllerctl", "dev"));
        assert_eq!(a.len(), 10);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, derive_key("Controllerctl", "other"));
    }

    #[test]
    fn test_device_id_synthesized_from_uuid() {
        let mut dev = device(SCHEMA);
        let id = assign_identifiers(&mut dev);
        let prefix = derive_key(DEVICE_NAMESPACE, DEVICE_NAMESPACE_SALT);
        assert_eq!(id, format!("{}_000", prefix));
        assert_eq!(dev.id.as_deref(), Some(id.as_str()));
    }

    #[test]
    fn test_declared_ids_are_device_prefixed() {
        let mut dev = device(SCHEMA);
        dev.id = Some("dev".to_string());
        assign_identifiers(&mut dev);

        assert_eq!(dev.data_items[0].id.as_deref(), Some("dev_avail"));
        let controller = &dev.components[0];
        assert_eq!(controller.references[0].data_item_id, "dev_avail");
        assert_eq!(controller.components[0].id.as_deref(), Some("path1"));
    }

    #[test]
    fn test_synthesized_ids_are_parent_scoped() {
        let mut dev = device(SCHEMA);
        dev.id = Some("dev".to_string());
        assign_identifiers(&mut dev);

        let controller = &dev.components[0];
        let controller_id = controller.id.clone().unwrap();
        assert_eq!(
            controller_id,
            format!("dev_{}", derive_key("Controllerctl", "dev"))
        );

        let estop = controller.data_items[0].id.clone().unwrap();
        assert_eq!(
            estop,
            format!(
                "{}_{}",
                controller_id,
                derive_key("DataItemEMERGENCY_STOPestop", &controller_id)
            )
        );
    }

    #[test]
    fn test_identical_subtrees_under_different_parents_do_not_collide() {
        let mut dev = device(
            r#"{
            "header": {"creationTime": "t"},
            "devices": [{
                "id": "dev", "name": "VMC-3Axis", "uuid": "000",
                "components": [
                    {"tag": "Door", "name": "front",
                     "dataItems": [{"name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT"}],
                     "components": [{"tag": "Lock", "name": "latch",
                        "dataItems": [{"name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT"}]}]},
                    {"tag": "Door", "name": "rear",
                     "dataItems": [{"name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT"}],
                     "components": [{"tag": "Lock", "name": "latch",
                        "dataItems": [{"name": "estop", "type": "EMERGENCY_STOP", "category": "EVENT"}]}]}
                ]
            }]
        }"#,
        );
        assign_identifiers(&mut dev);

        let (front, rear) = (&dev.components[0], &dev.components[1]);
        assert_ne!(front.id, rear.id);
        assert_ne!(front.data_items[0].id, rear.data_items[0].id);
        assert_ne!(front.components[0].id, rear.components[0].id);
        assert_ne!(
            front.components[0].data_items[0].id,
            rear.components[0].data_items[0].id
        );

        let mut ids = vec![
            front.data_items[0].id.clone(),
            rear.data_items[0].id.clone(),
            front.components[0].data_items[0].id.clone(),
            rear.components[0].data_items[0].id.clone(),
        ];
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_reassignment_of_identical_text_is_stable() {
        let mut first = device(SCHEMA);
        let mut second = device(SCHEMA);
        assign_identifiers(&mut first);
        assign_identifiers(&mut second);
        assert_eq!(first, second);
    }
}
