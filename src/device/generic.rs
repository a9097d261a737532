use super::{Device, DeviceCore, DeviceType, STATUS_OFFLINE, STATUS_ONLINE};
use crate::discovery::EntityDiscovery;
use crate::registry::EntityKind;

/// A device of an unrecognized model.
///
/// Only connectivity and the raw data points are exposed.
pub struct Generic {
    core: DeviceCore,
}

impl Generic {
    pub fn new(core: DeviceCore) -> Self {
        Self { core }
    }
}

impl Device for Generic {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Generic
    }

    fn root_entity(&self) -> EntityKind {
        EntityKind::BinarySensor
    }

    fn adjust_root_entity(&self, _: &str, entity: &mut EntityDiscovery) {
        entity.state_topic = entity.availability_topic.clone();
        entity.payload_on = Some(STATUS_ONLINE);
        entity.payload_off = Some(STATUS_OFFLINE);
        entity.device_class = Some("connectivity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::dps;
    use crate::device::DeviceIdentity;
    use crate::link::RecordingLink;
    use std::sync::Arc;

    #[test]
    fn connectivity_sensor() {
        let link = Arc::new(RecordingLink::default());
        let identity = DeviceIdentity::new("bf01", Some("Garage"), None);
        let mut device = Generic::new(DeviceCore::new(identity, link));
        let message = device.discovery_message("tuya");
        assert_eq!(message.len(), 1);
        let root = &message["binary_sensor/garage/config"];
        assert_eq!(root.state_topic, "tuya/garage/status");
        assert_eq!(root.device_class, Some("connectivity"));
        assert_eq!(root.command_topic, None);

        device.on_update(&dps([("1", true), ("2", false)]));
        let state = device.state_message(None);
        assert_eq!(state.get("state"), None);
        assert_eq!(state["dps"], serde_json::json!({"1": true, "2": false}));
        assert_eq!(device.command("set", "on"), Ok(false));
    }
}
