//! Mapping of MQTT topics onto devices and their commands.

use crate::device::{Device, DeviceIdentity};
use crate::mapper::SET_PREFIX;

/// Whether `topic` is the device's own topic or any topic below it.
pub fn matches_topic(identity: &DeviceIdentity, base: &str, topic: &str) -> bool {
    let prefix = format!("{}/", identity.topic(base));
    format!("{topic}/").starts_with(&prefix)
}

/// Find the first device the topic belongs to.
pub fn resolve_by_topic<'a>(
    devices: &'a [Box<dyn Device>],
    base: &str,
    topic: &str,
) -> Option<&'a dyn Device> {
    devices.iter().map(|d| &**d).find(|d| matches_topic(d.identity(), base, topic))
}

pub fn is_command(command: &str) -> bool {
    command == "set" || command == "command" || command.starts_with(SET_PREFIX)
}

/// Split `<base>/<device>/<command>` into the device segment and the command.
///
/// Returns `None` for topics that aren't commands, such as the state topics this bridge
/// publishes to itself.
pub fn parse_command_topic<'a>(base: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let (device, command) = rest.split_once('/')?;
    if device.is_empty() || !is_command(command) {
        return None;
    }
    Some((device, command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::roleta;
    use crate::device::{Cover, DeviceCore, DeviceType, Generic};
    use crate::link::OfflineLink;
    use rstest::rstest;
    use std::sync::Arc;

    fn devices() -> Vec<Box<dyn Device>> {
        let kitchen = DeviceIdentity::new("bf02", Some("roleta"), None);
        vec![
            Box::new(Generic::new(DeviceCore::new(kitchen, Arc::new(OfflineLink)))),
            Box::new(Cover::new(DeviceCore::new(roleta(), Arc::new(OfflineLink)))),
        ]
    }

    #[rstest]
    #[case("tuya/roleta_jeremi/state")]
    #[case("tuya/roleta_jeremi/set_position")]
    #[case("tuya/roleta_jeremi")]
    fn finds_the_cover(#[case] topic: &str) {
        let devices = devices();
        let found = resolve_by_topic(&devices, "tuya", topic).unwrap();
        assert_eq!(found.device_type(), DeviceType::Cover);
    }

    #[rstest]
    #[case("tuya/roleta_jeremix/state")]
    #[case("tuya/roleta_jere")]
    #[case("other/roleta_jeremi/state")]
    #[case("tuya")]
    fn does_not_match_prefixes(#[case] topic: &str) {
        let devices = devices();
        assert!(resolve_by_topic(&devices[1..], "tuya", topic).is_none());
    }

    #[test]
    fn device_names_that_prefix_each_other() {
        let devices = devices();
        let found = resolve_by_topic(&devices, "tuya", "tuya/roleta/command").unwrap();
        assert_eq!(found.device_type(), DeviceType::Generic);
    }

    #[rstest]
    #[case("tuya/lamp/set", Some(("lamp", "set")))]
    #[case("tuya/lamp/command", Some(("lamp", "command")))]
    #[case("tuya/lamp/set_countdown_1", Some(("lamp", "set_countdown_1")))]
    #[case("tuya/lamp/set_position", Some(("lamp", "set_position")))]
    #[case("tuya/lamp/state", None)]
    #[case("tuya/lamp/switch_1", None)]
    #[case("tuya/lamp/reset", None)]
    #[case("tuya/lamp", None)]
    #[case("tuyaa/lamp/set", None)]
    #[case("other/lamp/set", None)]
    fn command_topics(#[case] topic: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(parse_command_topic("tuya", topic), expected);
    }
}
