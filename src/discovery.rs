//! Home Assistant MQTT discovery payloads.
//!
//! See <https://www.home-assistant.io/integrations/mqtt/#mqtt-discovery>.

use crate::device::{DeviceIdentity, STATUS_OFFLINE, STATUS_ONLINE};
use crate::mapper::SET_PREFIX;
use crate::registry::{EntityKind, Registry, ValueDomain};
use std::collections::BTreeMap;

pub const MANUFACTURER: &str = "Tuya";

/// Seconds after which a plain sensor's value is considered stale.
pub const DEFAULT_EXPIRE_AFTER: u64 = 120;

/// Discovery entries keyed by `<component>/<object id>/config`.
pub type DiscoveryMessage = BTreeMap<String, EntityDiscovery>;

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct DeviceDiscovery {
    pub ids: Vec<String>,
    pub name: String,
    pub manufacturer: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'static str>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct EntityDiscovery {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub availability_topic: String,
    pub payload_available: &'static str,
    pub payload_not_available: &'static str,
    pub device: DeviceDiscovery,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<&'static [&'static str]>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_position_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_open: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_closed: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimistic: Option<bool>,
}

impl EntityDiscovery {
    fn new(
        name: String,
        unique_id: String,
        state_topic: String,
        device_topic: &str,
        device: DeviceDiscovery,
    ) -> Self {
        Self {
            name,
            unique_id,
            state_topic,
            command_topic: None,
            availability_topic: format!("{device_topic}/status"),
            payload_available: STATUS_ONLINE,
            payload_not_available: STATUS_OFFLINE,
            device,
            device_class: None,
            unit_of_measurement: None,
            expire_after: None,
            options: None,
            min: None,
            max: None,
            step: None,
            payload_on: None,
            payload_off: None,
            position_topic: None,
            set_position_topic: None,
            position_open: None,
            position_closed: None,
            optimistic: None,
        }
    }
}

pub fn root_key(identity: &DeviceIdentity, root_kind: EntityKind) -> String {
    format!("{root_kind}/{}/config", identity.sanitized_name)
}

/// Build the discovery entries for a device: one for the device itself and one per sensor.
pub fn assemble(
    identity: &DeviceIdentity,
    base: &str,
    registry: Registry,
    root_kind: EntityKind,
    model: Option<&'static str>,
) -> DiscoveryMessage {
    let topic = identity.topic(base);
    let name = &identity.sanitized_name;
    let device = DeviceDiscovery {
        ids: vec![identity.device_id()],
        name: identity.display_name.clone(),
        manufacturer: MANUFACTURER,
        model,
    };

    let mut message = DiscoveryMessage::new();
    let mut root = EntityDiscovery::new(
        name.clone(),
        name.clone(),
        format!("{topic}/state"),
        &topic,
        device.clone(),
    );
    if root_kind.is_writable() {
        root.command_topic = Some(format!("{topic}/command"));
    }
    message.insert(root_key(identity, root_kind), root);

    for sensor in registry.iter() {
        let identifier = sensor.identifier;
        let mut entity = EntityDiscovery::new(
            format!("{} {identifier}", identity.display_name),
            format!("{name}_{identifier}"),
            format!("{topic}/{identifier}"),
            &topic,
            device.clone(),
        );
        if sensor.entity_kind.is_writable() {
            entity.command_topic = Some(format!("{topic}/{SET_PREFIX}{identifier}"));
        }
        entity.device_class = sensor.device_class;
        entity.unit_of_measurement = sensor.unit;
        match sensor.entity_kind {
            EntityKind::Number => {
                if let Some((min, max)) = sensor.display_bounds() {
                    entity.min = Some(min);
                    entity.max = Some(max);
                }
                entity.step = sensor.display_step();
            }
            EntityKind::Sensor => {
                entity.expire_after = Some(DEFAULT_EXPIRE_AFTER);
                if let ValueDomain::Enum(values) = sensor.domain {
                    if sensor.device_class == Some("enum") {
                        entity.options = Some(values);
                    }
                }
            }
            _ => {}
        }
        message.insert(format!("{}/{name}/{identifier}/config", sensor.entity_kind), entity);
    }
    message
}

/// Replace the staleness timeout of every entry that has one.
pub fn set_expiry(message: &mut DiscoveryMessage, seconds: u64) {
    for entity in message.values_mut() {
        if entity.expire_after.is_some() {
            entity.expire_after = Some(seconds);
        }
    }
}
