//! The device model.
//!
//! A device owns the cumulative view of the data points its transport has reported and knows how
//! to present them as named entities. All device kinds implement [`Device`]; the provided methods
//! implement the behaviour common to all of them and call out to the kind hooks where kinds
//! differ.

mod cover;
mod generic;
mod switch;

pub use cover::{Cover, CoverRuntime, CoverSignal, CoverState, Direction, MOTION_DP};
pub use generic::Generic;
pub use switch::{Plug, Switch};

use crate::config::DeviceConfig;
use crate::datapoint::DataPointSet;
use crate::discovery::{self, DiscoveryMessage, EntityDiscovery};
use crate::link::DeviceLink;
use crate::mapper::{self, CommandError, MapMode, StateMessage};
use crate::registry::{self, EntityKind, Registry};
use std::sync::Arc;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    strum::Display,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::VariantArray,
    serde::Deserialize,
    serde::Serialize,
    clap::ValueEnum,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cover,
    Switch,
    Plug,
    Generic,
}

impl DeviceType {
    pub fn registry(self) -> Registry {
        match self {
            DeviceType::Cover => registry::COVER,
            DeviceType::Switch => registry::SWITCH,
            DeviceType::Plug => registry::PLUG,
            DeviceType::Generic => Registry::EMPTY,
        }
    }

    /// Product keys of the models known to be of a certain kind.
    pub fn from_product_key(product_key: &str) -> Option<Self> {
        match product_key {
            "aacztutbu69gdpdf" => Some(DeviceType::Cover),
            "key7axydcvmea3x9" => Some(DeviceType::Switch),
            "keyjup78v54myhan" => Some(DeviceType::Plug),
            _ => None,
        }
    }
}

/// Normalize a name into something usable as a topic segment.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// The vendor assigned device id.
    pub id: String,
    /// Distinguishes several representations of the same physical device.
    pub id_suffix: String,
    pub display_name: String,
    pub sanitized_name: String,
}

impl DeviceIdentity {
    pub fn new(id: &str, name: Option<&str>, id_suffix: Option<&str>) -> Self {
        let id_suffix = id_suffix.unwrap_or_default();
        let name = match name {
            Some(name) if !name.trim().is_empty() => name,
            _ => id,
        };
        let display_name = format!("{name}{id_suffix}");
        let sanitized_name = sanitize_name(&display_name);
        Self {
            id: id.to_string(),
            id_suffix: id_suffix.to_string(),
            display_name,
            sanitized_name,
        }
    }

    /// The id under which the device is registered with the automation hub.
    pub fn device_id(&self) -> String {
        format!("{}{}", self.id, self.id_suffix)
    }

    /// `<base>/<sanitized name>`, the prefix of all the device's topics.
    pub fn topic(&self, base: &str) -> String {
        format!("{base}/{}", self.sanitized_name)
    }
}

/// State common to every kind of device.
pub struct DeviceCore {
    identity: DeviceIdentity,
    link: Arc<dyn DeviceLink>,
    dps: DataPointSet,
    last_state_change: DataPointSet,
}

impl DeviceCore {
    pub fn new(identity: DeviceIdentity, link: Arc<dyn DeviceLink>) -> Self {
        Self {
            identity,
            link,
            dps: DataPointSet::new(),
            last_state_change: DataPointSet::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The cumulative view of all the data points reported so far.
    pub fn dps(&self) -> &DataPointSet {
        &self.dps
    }

    pub fn last_state_change(&self) -> &DataPointSet {
        &self.last_state_change
    }

    pub fn connected(&self) -> bool {
        self.link.connected()
    }

    pub fn link(&self) -> &Arc<dyn DeviceLink> {
        &self.link
    }

    fn merge(&mut self, delta: &DataPointSet) {
        self.dps.extend(delta.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.last_state_change = delta.clone();
    }

    /// Send data points to the device.
    pub fn write(&self, dps: DataPointSet) {
        tracing::debug!(device = %self.identity.sanitized_name, ?dps, "writing data points");
        self.link.write(dps);
    }
}

pub trait Device: Send {
    fn core(&self) -> &DeviceCore;
    fn core_mut(&mut self) -> &mut DeviceCore;
    fn device_type(&self) -> DeviceType;
    /// The kind of the entity representing the device as a whole.
    fn root_entity(&self) -> EntityKind;

    fn sensors(&self) -> Registry {
        self.device_type().registry()
    }

    /// Model label advertised in the discovery message.
    fn model(&self) -> Option<&'static str> {
        None
    }

    /// Derive kind-specific state once `delta` has been merged into the cumulative view.
    fn on_kind_update(&mut self, _delta: &DataPointSet) {}

    /// Add the kind-specific fields to a state message.
    fn kind_state(&self, _delta: Option<&DataPointSet>, _message: &mut StateMessage) {}

    fn adjust_root_entity(&self, _topic: &str, _entity: &mut EntityDiscovery) {}

    /// Handle the commands specific to this kind of device.
    ///
    /// Returns `Ok(false)` if the command isn't one of them.
    fn kind_command(&self, _command: &str, _argument: &str) -> Result<bool, CommandError> {
        Ok(false)
    }

    fn identity(&self) -> &DeviceIdentity {
        self.core().identity()
    }

    fn on_update(&mut self, delta: &DataPointSet) {
        self.core_mut().merge(delta);
        self.on_kind_update(delta);
    }

    /// Named state of the device.
    ///
    /// Entity values are derived from `delta` if given, or from all the known data points
    /// otherwise.
    fn state_message(&self, delta: Option<&DataPointSet>) -> StateMessage {
        let core = self.core();
        let mut message = StateMessage::new();
        let status = if core.connected() { STATUS_ONLINE } else { STATUS_OFFLINE };
        message.insert("status".into(), status.into());
        let dps = core.dps.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        message.insert("dps".into(), serde_json::Value::Object(dps));
        if let Some(ip) = core.link.address() {
            message.insert("ip".into(), ip.into());
        }
        message.insert("id".into(), core.identity.id.clone().into());
        let sensors = self
            .sensors()
            .iter()
            .map(|s| (s.identifier.to_string(), serde_json::to_value(s).unwrap_or_default()))
            .collect();
        message.insert("sensors".into(), serde_json::Value::Object(sensors));
        let source = delta.unwrap_or(&core.dps);
        message.extend(mapper::map_raw_to_named(source, self.sensors(), MapMode::KnownOnly));
        self.kind_state(delta, &mut message);
        message
    }

    /// Discovery entries keyed by their topic below the discovery prefix.
    fn discovery_message(&self, base: &str) -> DiscoveryMessage {
        let identity = self.identity();
        let mut message = discovery::assemble(
            identity,
            base,
            self.sensors(),
            self.root_entity(),
            self.model(),
        );
        let root_key = discovery::root_key(identity, self.root_entity());
        if let Some(root) = message.get_mut(&root_key) {
            self.adjust_root_entity(&identity.topic(base), root);
        }
        message
    }

    /// Execute a command received for this device.
    ///
    /// Returns `Ok(false)` if the command is not understood by this device.
    fn command(&self, command: &str, argument: &str) -> Result<bool, CommandError> {
        if self.kind_command(command, argument)? {
            return Ok(true);
        }
        match mapper::map_named_command_to_dp(self.sensors(), command, argument)? {
            Some(dps) => {
                self.core().write(dps);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Construct the right kind of device for the configuration.
pub fn create_device(config: &DeviceConfig, link: Arc<dyn DeviceLink>) -> Box<dyn Device> {
    let identity = config.identity();
    let core = DeviceCore::new(identity, link);
    match config.resolved_type() {
        DeviceType::Cover => Box::new(Cover::new(core)),
        DeviceType::Switch => Box::new(Switch::new(core)),
        DeviceType::Plug => Box::new(Plug::new(core)),
        DeviceType::Generic => Box::new(Generic::new(core)),
    }
}
