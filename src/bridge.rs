//! Glue between the devices, the transport and the MQTT broker.

use crate::datapoint::DataPointSet;
use crate::device::Device;
use crate::discovery;
use crate::link::LinkEvent;
use crate::router;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Filter, PublishProperties};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

/// Delay before polling the MQTT event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not subscribe to `{1}`")]
    Subscribe(#[source] Box<dyn std::error::Error + Send + Sync>, String),
    #[error("the device transport has gone away")]
    TransportClosed,
    #[error("disconnected from the MQTT server")]
    MqttDisconnect,
}

/// Where messages get published to.
#[allow(async_fn_in_trait)]
pub trait Publisher {
    type Error: std::error::Error + Send + Sync + 'static;
    async fn publish_message(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        expiry: Option<Duration>,
    ) -> Result<(), Self::Error>;
    async fn subscribe_topic(&self, topic: String) -> Result<(), Self::Error>;
}

impl Publisher for rumqttc::v5::AsyncClient {
    type Error = rumqttc::v5::ClientError;

    async fn publish_message(
        &self,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        expiry: Option<Duration>,
    ) -> Result<(), Self::Error> {
        let properties = PublishProperties {
            message_expiry_interval: expiry
                .map(|e| u32::try_from(e.as_secs()).unwrap_or(u32::MAX)),
            ..Default::default()
        };
        self.publish_with_properties(topic, QoS::AtMostOnce, retain, payload, properties).await
    }

    async fn subscribe_topic(&self, topic: String) -> Result<(), Self::Error> {
        self.subscribe_many([Filter::new(topic, QoS::AtMostOnce)]).await
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    /// Prefix of the per-device topics.
    pub base_topic: String,
    /// Prefix of the Home Assistant discovery topics.
    pub discovery_topic: String,
    /// Home Assistant announces its restarts here.
    pub status_topic: String,
    pub republish_period: Duration,
}

impl Settings {
    /// State messages outlive a couple of missed republish rounds at most.
    pub fn message_expiry(&self) -> Duration {
        self.republish_period * 2
    }
}

/// Render a state value as an MQTT payload.
///
/// Strings are published as they are, everything else as JSON.
pub fn state_payload(value: &serde_json::Value) -> Vec<u8> {
    match value {
        serde_json::Value::String(s) => s.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

pub struct Bridge<P> {
    publisher: P,
    settings: Settings,
    devices: Vec<Box<dyn Device>>,
}

impl<P: Publisher> Bridge<P> {
    pub fn new(publisher: P, settings: Settings, devices: Vec<Box<dyn Device>>) -> Self {
        Self { publisher, settings, devices }
    }

    pub fn devices(&self) -> &[Box<dyn Device>] {
        &self.devices
    }

    /// Subscribe to the command and status topics, then bring everybody up to date.
    pub async fn start(&self) -> Result<(), Error> {
        let topics = [format!("{}/#", self.settings.base_topic), self.settings.status_topic.clone()];
        for topic in topics {
            debug!(message = "subscribing", %topic);
            self.publisher
                .subscribe_topic(topic.clone())
                .await
                .map_err(|e| Error::Subscribe(Box::new(e), topic))?;
        }
        for device in &self.devices {
            device.core().link().request_update();
        }
        self.republish_all().await;
        Ok(())
    }

    pub async fn republish_all(&self) {
        debug!(devices = self.devices.len(), "republishing all devices");
        for device in &self.devices {
            self.publish_discovery(&**device).await;
            self.publish_state(&**device, None).await;
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let id = event.device_id();
        let targets = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.identity().id == id)
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        if targets.is_empty() {
            debug!(message = "event for an unknown device", id);
            return;
        }
        match &event {
            LinkEvent::Update { .. } => {}
            LinkEvent::Connected { ip, .. } => {
                info!(message = "device connected", id, ip = ip.as_deref().unwrap_or("unknown"))
            }
            LinkEvent::Disconnected { .. } => info!(message = "device disconnected", id),
            LinkEvent::Error { message, .. } => {
                warn!(message = "device transport error", id, error = message.as_str())
            }
        }
        // Devices sharing a vendor id are different views of the same hardware.
        for index in targets {
            match &event {
                LinkEvent::Update { dps, .. } => {
                    trace!(device = %self.devices[index].identity().sanitized_name, ?dps, "update");
                    self.devices[index].on_update(dps);
                    self.publish_state(&*self.devices[index], Some(dps)).await;
                }
                LinkEvent::Connected { .. } => {
                    self.publish_discovery(&*self.devices[index]).await;
                    self.publish_state(&*self.devices[index], None).await;
                }
                LinkEvent::Disconnected { .. } | LinkEvent::Error { .. } => {
                    self.publish_state(&*self.devices[index], None).await;
                }
            }
        }
    }

    /// React to a message received from the broker.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.settings.status_topic {
            if payload == b"online" {
                info!("home assistant came online, republishing");
                self.republish_all().await;
            }
            return;
        }
        let Some((_, command)) = router::parse_command_topic(&self.settings.base_topic, topic)
        else {
            trace!(message = "ignoring", topic);
            return;
        };
        let Some(device) = router::resolve_by_topic(&self.devices, &self.settings.base_topic, topic)
        else {
            warn!(message = "no device for the command topic", topic);
            return;
        };
        let argument = String::from_utf8_lossy(payload);
        debug!(message = "command", device = %device.identity().sanitized_name, command, %argument);
        match device.command(command, &argument) {
            Ok(true) => {}
            Ok(false) => warn!(message = "command not understood", topic, command),
            Err(e) => warn!(
                message = "command failed",
                topic,
                error = (&e as &dyn std::error::Error)
            ),
        }
    }

    async fn publish_discovery(&self, device: &dyn Device) {
        let mut message = device.discovery_message(&self.settings.base_topic);
        discovery::set_expiry(&mut message, self.settings.message_expiry().as_secs());
        for (key, entity) in message {
            let topic = format!("{}/{key}", self.settings.discovery_topic);
            let payload = match serde_json::to_vec(&entity) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(
                        message = "could not serialize discovery",
                        %topic,
                        error = (&e as &dyn std::error::Error)
                    );
                    continue;
                }
            };
            self.publish(topic, payload, None).await;
        }
    }

    async fn publish_state(&self, device: &dyn Device, delta: Option<&DataPointSet>) {
        let device_topic = device.identity().topic(&self.settings.base_topic);
        let expiry = Some(self.settings.message_expiry());
        for (key, value) in device.state_message(delta) {
            self.publish(format!("{device_topic}/{key}"), state_payload(&value), expiry).await;
        }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>, expiry: Option<Duration>) {
        trace!(message = "publishing", %topic, payload = %String::from_utf8_lossy(&payload));
        if let Err(e) = self.publisher.publish_message(topic.clone(), payload, false, expiry).await {
            warn!(message = "could not publish", %topic, error = (&e as &dyn std::error::Error));
        }
    }
}

type MqttEvent = Result<rumqttc::v5::Event, rumqttc::v5::ConnectionError>;

/// Poll the MQTT event loop in a task of its own.
///
/// Requests queued by the client only reach the broker while the event loop is being polled.
pub(crate) fn pump_mqtt_events(
    mut mqtt_loop: rumqttc::v5::EventLoop,
) -> (UnboundedReceiver<MqttEvent>, AbortOnDropHandle<()>) {
    use rumqttc::Outgoing;
    use rumqttc::v5::Event;

    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    let task = tokio::task::spawn(async move {
        loop {
            let event = mqtt_loop.poll().await;
            let failed = event.is_err();
            let disconnected = matches!(event, Ok(Event::Outgoing(Outgoing::Disconnect)));
            if sender.send(event).is_err() || disconnected {
                break;
            }
            if failed {
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    });
    (receiver, AbortOnDropHandle::new(task))
}

impl Bridge<rumqttc::v5::AsyncClient> {
    /// Serve until the transport goes away or the broker disconnects us.
    pub async fn run(
        mut self,
        mqtt_loop: rumqttc::v5::EventLoop,
        mut events: UnboundedReceiver<LinkEvent>,
    ) -> Result<(), Error> {
        use rumqttc::Outgoing;
        use rumqttc::v5::Event;
        use rumqttc::v5::mqttbytes::v5::Packet;

        let (mut mqtt_events, _pump) = pump_mqtt_events(mqtt_loop);
        let mut mqtt_connected = false;
        let mut republish = tokio::time::interval(self.settings.republish_period);
        republish.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately; startup publishes on connect instead
        republish.tick().await;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(Error::TransportClosed);
                    };
                    self.handle_link_event(event).await;
                }
                _ = republish.tick() => {
                    if mqtt_connected {
                        self.republish_all().await;
                    } else {
                        debug!("not connected to mqtt, skipping the republish");
                    }
                }
                mqtt_event = mqtt_events.recv() => match mqtt_event {
                    Some(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                        info!("connected to mqtt");
                        mqtt_connected = true;
                        self.start().await?;
                    }
                    Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        let topic = String::from_utf8_lossy(&publish.topic);
                        self.handle_message(&topic, &publish.payload).await;
                    }
                    Some(Ok(Event::Outgoing(Outgoing::Disconnect))) | None => {
                        return Err(Error::MqttDisconnect);
                    }
                    Some(Ok(event)) => trace!(?event, "not handled in any way"),
                    Some(Err(e)) => {
                        mqtt_connected = false;
                        warn!(
                            message = "mqtt connection error, will reconnect",
                            error = (&e as &dyn std::error::Error)
                        );
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::dps;
    use crate::device::{Cover, DeviceCore, DeviceIdentity, Plug};
    use crate::link::RecordingLink;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingPublisher {
        published: RefCell<Vec<(String, String, Option<Duration>)>>,
        subscribed: RefCell<Vec<String>>,
    }

    impl RecordingPublisher {
        fn take(&self) -> Vec<(String, String, Option<Duration>)> {
            std::mem::take(&mut *self.published.borrow_mut())
        }
    }

    impl Publisher for &RecordingPublisher {
        type Error = std::convert::Infallible;

        async fn publish_message(
            &self,
            topic: String,
            payload: Vec<u8>,
            retain: bool,
            expiry: Option<Duration>,
        ) -> Result<(), Self::Error> {
            assert!(!retain);
            let payload = String::from_utf8(payload).unwrap();
            self.published.borrow_mut().push((topic, payload, expiry));
            Ok(())
        }

        async fn subscribe_topic(&self, topic: String) -> Result<(), Self::Error> {
            self.subscribed.borrow_mut().push(topic);
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings {
            base_topic: "tuya".into(),
            discovery_topic: "homeassistant".into(),
            status_topic: "homeassistant/status".into(),
            republish_period: Duration::from_secs(60),
        }
    }

    struct Fixture {
        cover_link: Arc<RecordingLink>,
        plug_link: Arc<RecordingLink>,
        publisher: RecordingPublisher,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cover_link: Default::default(),
                plug_link: Default::default(),
                publisher: Default::default(),
            }
        }

        fn bridge(&self) -> Bridge<&RecordingPublisher> {
            let cover = DeviceIdentity::new("bf9346c6635dfb4b38sj2p", Some("roleta Jeremi"), None);
            let plug = DeviceIdentity::new("bf02", Some("myPlug"), None);
            let plug_twin = DeviceIdentity::new("bf02", Some("myPlug"), Some("_b"));
            let devices: Vec<Box<dyn Device>> = vec![
                Box::new(Cover::new(DeviceCore::new(cover, self.cover_link.clone()))),
                Box::new(Plug::new(DeviceCore::new(plug, self.plug_link.clone()))),
                Box::new(Plug::new(DeviceCore::new(plug_twin, self.plug_link.clone()))),
            ];
            Bridge::new(&self.publisher, settings(), devices)
        }
    }

    fn topics(published: &[(String, String, Option<Duration>)]) -> Vec<&str> {
        published.iter().map(|(t, _, _)| t.as_str()).collect()
    }

    #[test]
    fn state_payloads() {
        assert_eq!(state_payload(&serde_json::json!("ON")), b"ON");
        assert_eq!(state_payload(&serde_json::json!(23.5)), b"23.5");
        assert_eq!(state_payload(&serde_json::json!(true)), b"true");
        assert_eq!(state_payload(&serde_json::json!({"1": "open"})), br#"{"1":"open"}"#);
    }

    #[tokio::test]
    async fn start_subscribes_and_refreshes() {
        let fixture = Fixture::new();
        let bridge = fixture.bridge();
        bridge.start().await.unwrap();
        assert_eq!(
            *fixture.publisher.subscribed.borrow(),
            ["tuya/#", "homeassistant/status"]
        );
        assert_eq!(fixture.cover_link.refreshes(), 1);
        assert_eq!(fixture.plug_link.refreshes(), 2);
        let published = fixture.publisher.take();
        let discovery = published.iter().filter(|(t, _, _)| t.starts_with("homeassistant/")).count();
        assert_eq!(discovery, 4 + 2 * 16);
    }

    #[tokio::test]
    async fn updates_publish_the_delta_state() {
        let fixture = Fixture::new();
        let mut bridge = fixture.bridge();
        bridge
            .handle_link_event(LinkEvent::Update {
                id: "bf9346c6635dfb4b38sj2p".into(),
                dps: dps([("1", "open")]),
            })
            .await;
        let published = fixture.publisher.take();
        assert_eq!(
            topics(&published),
            [
                "tuya/roleta_jeremi/control",
                "tuya/roleta_jeremi/dps",
                "tuya/roleta_jeremi/id",
                "tuya/roleta_jeremi/last_move",
                "tuya/roleta_jeremi/position",
                "tuya/roleta_jeremi/sensors",
                "tuya/roleta_jeremi/state",
                "tuya/roleta_jeremi/status",
            ]
        );
        let state = published.iter().find(|(t, _, _)| t.ends_with("/state")).unwrap();
        assert_eq!(state.1, "opening");
        assert_eq!(state.2, Some(Duration::from_secs(120)));
        let position = published.iter().find(|(t, _, _)| t.ends_with("/position")).unwrap();
        assert_eq!(position.1, "0");
    }

    #[tokio::test]
    async fn updates_reach_every_twin() {
        let fixture = Fixture::new();
        let mut bridge = fixture.bridge();
        bridge
            .handle_link_event(LinkEvent::Update { id: "bf02".into(), dps: dps([("1", true)]) })
            .await;
        let published = fixture.publisher.take();
        let states = published
            .iter()
            .filter(|(t, _, _)| t.ends_with("/state"))
            .map(|(t, p, _)| (t.as_str(), p.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(states, [("tuya/myplug/state", "ON"), ("tuya/myplug_b/state", "ON")]);
        assert!(published.iter().all(|(t, _, _)| !t.contains("roleta")));
    }

    #[tokio::test]
    async fn connection_publishes_discovery() {
        let fixture = Fixture::new();
        let mut bridge = fixture.bridge();
        fixture.cover_link.set_connected(true, Some("10.0.0.9"));
        bridge
            .handle_link_event(LinkEvent::Connected {
                id: "bf9346c6635dfb4b38sj2p".into(),
                ip: Some("10.0.0.9".into()),
            })
            .await;
        let published = fixture.publisher.take();
        assert!(topics(&published).contains(&"homeassistant/cover/roleta_jeremi/config"));
        let status = published.iter().find(|(t, _, _)| t == "tuya/roleta_jeremi/status").unwrap();
        assert_eq!(status.1, "online");
        let ip = published.iter().find(|(t, _, _)| t == "tuya/roleta_jeremi/ip").unwrap();
        assert_eq!(ip.1, "10.0.0.9");

        bridge
            .handle_link_event(LinkEvent::Disconnected { id: "bf9346c6635dfb4b38sj2p".into() })
            .await;
        let published = fixture.publisher.take();
        assert!(!topics(&published).iter().any(|t| t.starts_with("homeassistant/")));
    }

    #[tokio::test]
    async fn discovery_expiry_follows_the_republish_period() {
        let fixture = Fixture::new();
        let bridge = fixture.bridge();
        bridge.republish_all().await;
        let published = fixture.publisher.take();
        let (_, voltage, expiry) = published
            .iter()
            .find(|(t, _, _)| t == "homeassistant/sensor/myplug/cur_voltage/config")
            .unwrap();
        assert_eq!(*expiry, None);
        let voltage: serde_json::Value = serde_json::from_str(voltage).unwrap();
        assert_eq!(voltage["expire_after"], 120);
    }

    #[tokio::test]
    async fn commands_are_dispatched() {
        let fixture = Fixture::new();
        let bridge = fixture.bridge();
        bridge.handle_message("tuya/roleta_jeremi/command", b"close").await;
        bridge.handle_message("tuya/roleta_jeremi/set_position", b"100").await;
        bridge.handle_message("tuya/myplug/set_switch_1", b"ON").await;
        bridge.handle_message("tuya/myplug/set_countdown_1", b"forever").await;
        bridge.handle_message("tuya/myplug/state", b"OFF").await;
        bridge.handle_message("tuya/nobody/set", b"ON").await;
        assert_eq!(fixture.cover_link.written(), [dps([("1", "close")]), dps([("1", "close")])]);
        assert_eq!(fixture.plug_link.written(), [dps([("1", true)])]);
        assert!(fixture.publisher.take().is_empty());
    }

    #[tokio::test]
    async fn home_assistant_restart_triggers_republish() {
        let fixture = Fixture::new();
        let bridge = fixture.bridge();
        bridge.handle_message("homeassistant/status", b"offline").await;
        assert!(fixture.publisher.take().is_empty());
        bridge.handle_message("homeassistant/status", b"online").await;
        let published = fixture.publisher.take();
        assert!(topics(&published).contains(&"homeassistant/sensor/myplug_b/config"));
        assert!(topics(&published).contains(&"tuya/roleta_jeremi/status"));
    }

    #[tokio::test]
    async fn republishing_many_devices_through_a_client() {
        use rumqttc::v5::mqttbytes::v5::Packet;
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _broker = AbortOnDropHandle::new(tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = vec![0; 64 * 1024];
            // CONNECT, answered with a successful CONNACK without properties
            let _ = socket.read(&mut buffer).await.unwrap();
            socket.write_all(&[0x20, 0x03, 0x00, 0x00, 0x00]).await.unwrap();
            while socket.read(&mut buffer).await.is_ok_and(|n| n > 0) {}
        }));

        let options = rumqttc::v5::MqttOptions::new("tuya2mqtt-test", "127.0.0.1", port);
        let (client, mqtt_loop) = rumqttc::v5::AsyncClient::new(options, 10);
        let (mut mqtt_events, _pump) = pump_mqtt_events(mqtt_loop);
        let devices = (0..8)
            .map(|n| {
                let suffix = format!("_{n}");
                let identity =
                    DeviceIdentity::new(&format!("bf{n}"), Some("plug"), Some(suffix.as_str()));
                let link = Arc::new(RecordingLink::default());
                Box::new(Plug::new(DeviceCore::new(identity, link))) as Box<dyn Device>
            })
            .collect();
        // 16 discovery entries and 4 state topics per plug
        let bridge = Bridge::new(client, settings(), devices);
        let republished =
            tokio::time::timeout(Duration::from_secs(10), bridge.republish_all()).await;
        assert!(republished.is_ok(), "republishing 160 messages did not complete");
        let first = mqtt_events.recv().await.unwrap().unwrap();
        assert!(matches!(first, rumqttc::v5::Event::Incoming(Packet::ConnAck(_))));
    }
}
