use super::{Device, DeviceCore, DeviceType};
use crate::datapoint::{DataPointSet, DpValue};
use crate::mapper::{self, CommandError, StateMessage};
use crate::registry::EntityKind;

/// The DP carrying the relay state.
const RELAY_DP: &str = "1";

/// Relay behaviour shared by all the switch-like devices.
#[derive(Debug, Default)]
struct Relay {
    on: Option<bool>,
}

impl Relay {
    fn reported(delta: &DataPointSet) -> Option<bool> {
        delta.get(RELAY_DP).and_then(DpValue::as_bool)
    }

    fn on_update(&mut self, delta: &DataPointSet) {
        if let Some(on) = Self::reported(delta) {
            self.on = Some(on);
        }
    }

    fn state(&self, delta: Option<&DataPointSet>, message: &mut StateMessage) {
        if let Some(on) = delta.and_then(Self::reported).or(self.on) {
            message.insert("state".into(), mapper::switch_payload(on).into());
        }
    }

    fn set(core: &DeviceCore, on: bool) {
        core.write(DataPointSet::from([(RELAY_DP.to_string(), DpValue::Boolean(on))]));
    }

    fn command(core: &DeviceCore, command: &str, argument: &str) -> bool {
        match command {
            "command" | "set" => {
                let argument = argument.trim();
                let on = mapper::parse_switch_argument(argument)
                    || argument.eq_ignore_ascii_case("open");
                Self::set(core, on);
                true
            }
            _ => false,
        }
    }
}

/// A single channel relay.
pub struct Switch {
    core: DeviceCore,
    relay: Relay,
}

impl Switch {
    pub fn new(core: DeviceCore) -> Self {
        Self { core, relay: Relay::default() }
    }

    /// The last relay state the device reported, if any.
    pub fn is_on(&self) -> Option<bool> {
        self.relay.on
    }

    pub fn set_state(&self, on: bool) {
        Relay::set(&self.core, on)
    }
}

impl Device for Switch {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Switch
    }

    fn root_entity(&self) -> EntityKind {
        EntityKind::Switch
    }

    fn model(&self) -> Option<&'static str> {
        Some("Switch/Socket")
    }

    fn on_kind_update(&mut self, delta: &DataPointSet) {
        self.relay.on_update(delta)
    }

    fn kind_state(&self, delta: Option<&DataPointSet>, message: &mut StateMessage) {
        self.relay.state(delta, message)
    }

    fn kind_command(&self, command: &str, argument: &str) -> Result<bool, CommandError> {
        Ok(Relay::command(&self.core, command, argument))
    }
}

/// A metering plug.
///
/// The plug is exposed as a read-only root entity; its relay is controlled through the
/// `switch_1` entity instead.
pub struct Plug {
    core: DeviceCore,
    relay: Relay,
}

impl Plug {
    pub fn new(core: DeviceCore) -> Self {
        Self { core, relay: Relay::default() }
    }

    pub fn is_on(&self) -> Option<bool> {
        self.relay.on
    }

    pub fn set_state(&self, on: bool) {
        Relay::set(&self.core, on)
    }
}

impl Device for Plug {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DeviceCore {
        &mut self.core
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Plug
    }

    fn root_entity(&self) -> EntityKind {
        EntityKind::Sensor
    }

    fn model(&self) -> Option<&'static str> {
        Some("Switch/Socket")
    }

    fn on_kind_update(&mut self, delta: &DataPointSet) {
        self.relay.on_update(delta)
    }

    fn kind_state(&self, delta: Option<&DataPointSet>, message: &mut StateMessage) {
        self.relay.state(delta, message)
    }

    fn kind_command(&self, command: &str, argument: &str) -> Result<bool, CommandError> {
        if Relay::command(&self.core, command, argument) {
            return Ok(true);
        }
        // Shorthand for the countdown of the only channel.
        if command == "set_countdown" {
            return self.command("set_countdown_1", argument);
        }
        Ok(false)
    }
}
