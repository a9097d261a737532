//! The connection between devices and whatever talks the Tuya local protocol to them.
//!
//! The bridge does not speak the device protocol itself. Instead a transport process exchanges
//! newline-delimited JSON with it over stdio: device events come in on stdin, and data point
//! writes and refresh requests go out on stdout.

use crate::config::DeviceConfig;
use crate::datapoint::DataPointSet;
use futures::{SinkExt as _, StreamExt as _};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

/// Longest line accepted from the transport.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A device's handle onto the transport.
pub trait DeviceLink: Send + Sync {
    fn connected(&self) -> bool;
    /// Network address of the device, once known.
    fn address(&self) -> Option<String>;
    /// Send data points to the device. Delivery is not confirmed.
    fn write(&self, dps: DataPointSet);
    /// Ask the device to report its full state.
    fn request_update(&self);
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LinkEvent {
    Update {
        id: String,
        dps: DataPointSet,
    },
    Connected {
        id: String,
        #[serde(default)]
        ip: Option<String>,
    },
    Disconnected {
        id: String,
    },
    Error {
        id: String,
        #[serde(default)]
        message: String,
    },
}

impl LinkEvent {
    /// The vendor id of the device the event is about.
    pub fn device_id(&self) -> &str {
        match self {
            LinkEvent::Update { id, .. }
            | LinkEvent::Connected { id, .. }
            | LinkEvent::Disconnected { id }
            | LinkEvent::Error { id, .. } => id,
        }
    }
}

#[derive(Debug, PartialEq, serde::Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request {
    Connect {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    Write {
        id: String,
        dps: DataPointSet,
    },
    Refresh {
        id: String,
    },
}

#[derive(Debug, Default)]
struct LinkState {
    connected: bool,
    address: Option<String>,
}

/// A link to a device behind the stdio transport.
pub struct StdioLink {
    id: String,
    state: Mutex<LinkState>,
    requests: UnboundedSender<Request>,
}

impl StdioLink {
    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            warn!(message = "transport writer is gone, dropping request", id = %self.id);
        }
    }

    fn observe(&self, event: &LinkEvent) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match event {
            LinkEvent::Connected { ip, .. } => {
                guard.connected = true;
                if ip.is_some() {
                    guard.address.clone_from(ip);
                }
            }
            LinkEvent::Disconnected { .. } => guard.connected = false,
            LinkEvent::Update { .. } | LinkEvent::Error { .. } => {}
        }
    }
}

impl DeviceLink for StdioLink {
    fn connected(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).connected
    }

    fn address(&self) -> Option<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).address.clone()
    }

    fn write(&self, dps: DataPointSet) {
        self.send(Request::Write { id: self.id.clone(), dps })
    }

    fn request_update(&self) {
        self.send(Request::Refresh { id: self.id.clone() })
    }
}

type Links = Arc<Mutex<BTreeMap<String, Arc<StdioLink>>>>;

/// The stdio transport and the links of all the devices behind it.
pub struct Transport {
    links: Links,
    requests: UnboundedSender<Request>,
    _reader: AbortOnDropHandle<()>,
    _writer: AbortOnDropHandle<()>,
}

impl Transport {
    pub fn stdio() -> (Self, UnboundedReceiver<LinkEvent>) {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn new<R, W>(reader: R, writer: W) -> (Self, UnboundedReceiver<LinkEvent>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let links = Links::default();
        let (requests, outbox) = tokio::sync::mpsc::unbounded_channel();
        let (events, inbox) = tokio::sync::mpsc::unbounded_channel();
        let reader = tokio::task::spawn(read_events(reader, Arc::clone(&links), events));
        let writer = tokio::task::spawn(write_requests(writer, outbox));
        let transport = Self {
            links,
            requests,
            _reader: AbortOnDropHandle::new(reader),
            _writer: AbortOnDropHandle::new(writer),
        };
        (transport, inbox)
    }

    /// The link for the configured device.
    ///
    /// Configurations sharing a vendor id share the link; the transport is asked to connect to
    /// each vendor id once.
    pub fn link(&self, config: &DeviceConfig) -> Arc<dyn DeviceLink> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(link) = links.get(&config.id) {
            return Arc::clone(link) as Arc<dyn DeviceLink>;
        }
        let link = Arc::new(StdioLink {
            id: config.id.clone(),
            state: Mutex::default(),
            requests: self.requests.clone(),
        });
        link.send(Request::Connect {
            id: config.id.clone(),
            ip: config.ip.clone(),
            key: config.key.clone(),
            version: config.version.clone(),
        });
        links.insert(config.id.clone(), Arc::clone(&link));
        link
    }
}

async fn read_events<R: AsyncRead + Unpin>(
    reader: R,
    links: Links,
    events: UnboundedSender<LinkEvent>,
) {
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(
                    message = "could not read from the transport",
                    error = (&e as &dyn std::error::Error)
                );
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!(message = "transport event", %line);
        let event = match serde_json::from_str::<LinkEvent>(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    message = "ignoring malformed transport event",
                    %line,
                    error = (&e as &dyn std::error::Error)
                );
                continue;
            }
        };
        let link = links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(event.device_id())
            .cloned();
        match link {
            Some(link) => link.observe(&event),
            None => debug!(message = "event for an unconfigured device", id = event.device_id()),
        }
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("transport input closed");
}

async fn write_requests<W: AsyncWrite + Unpin>(writer: W, mut outbox: UnboundedReceiver<Request>) {
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(request) = outbox.recv().await {
        let line = match serde_json::to_string(&request) {
            Ok(line) => line,
            Err(e) => {
                warn!(
                    message = "could not encode a transport request",
                    error = (&e as &dyn std::error::Error)
                );
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            warn!(message = "could not write to the transport", error = (&e as &dyn std::error::Error));
            break;
        }
    }
}

/// A link for devices that are never reached, e.g. when only rendering discovery payloads.
#[derive(Debug, Default)]
pub struct OfflineLink;

impl DeviceLink for OfflineLink {
    fn connected(&self) -> bool {
        false
    }

    fn address(&self) -> Option<String> {
        None
    }

    fn write(&self, dps: DataPointSet) {
        debug!(message = "device is offline, dropping write", ?dps);
    }

    fn request_update(&self) {}
}

/// A link that remembers what was sent through it.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingLink {
    state: Mutex<LinkState>,
    written: Mutex<Vec<DataPointSet>>,
    refreshes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl RecordingLink {
    pub(crate) fn set_connected(&self, connected: bool, address: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.connected = connected;
        state.address = address.map(str::to_string);
    }

    pub(crate) fn written(&self) -> Vec<DataPointSet> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl DeviceLink for RecordingLink {
    fn connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn address(&self) -> Option<String> {
        self.state.lock().unwrap().address.clone()
    }

    fn write(&self, dps: DataPointSet) {
        self.written.lock().unwrap().push(dps);
    }

    fn request_update(&self) {
        self.refreshes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::dps;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

    #[test]
    fn parses_events() {
        let event: LinkEvent =
            serde_json::from_str(r#"{"event":"update","id":"bf01","dps":{"1":"open"}}"#).unwrap();
        assert_eq!(event, LinkEvent::Update { id: "bf01".into(), dps: dps([("1", "open")]) });
        let event: LinkEvent = serde_json::from_str(r#"{"event":"disconnected","id":"bf01"}"#).unwrap();
        assert_eq!(event.device_id(), "bf01");
        let event: LinkEvent = serde_json::from_str(r#"{"event":"connected","id":"bf01"}"#).unwrap();
        assert_eq!(event, LinkEvent::Connected { id: "bf01".into(), ip: None });
    }

    #[test]
    fn serializes_requests() {
        let write = Request::Write { id: "bf01".into(), dps: dps([("1", true)]) };
        assert_eq!(
            serde_json::to_string(&write).unwrap(),
            r#"{"op":"write","id":"bf01","dps":{"1":true}}"#
        );
        let refresh = Request::Refresh { id: "bf01".into() };
        assert_eq!(serde_json::to_string(&refresh).unwrap(), r#"{"op":"refresh","id":"bf01"}"#);
    }

    #[tokio::test]
    async fn exchanges_lines() {
        let (mut input, transport_in) = tokio::io::duplex(4096);
        let (transport_out, output) = tokio::io::duplex(4096);
        let (transport, mut events) = Transport::new(transport_in, transport_out);
        let mut output = BufReader::new(output).lines();

        let config = DeviceConfig::new("bf01", "Garage");
        let link = transport.link(&config);
        let twin = transport.link(&config);
        assert!(!link.connected());
        assert_eq!(output.next_line().await.unwrap().unwrap(), r#"{"op":"connect","id":"bf01"}"#);

        input
            .write_all(b"garbage\n{\"event\":\"connected\",\"id\":\"bf01\",\"ip\":\"10.0.0.7\"}\n")
            .await
            .unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, LinkEvent::Connected { id: "bf01".into(), ip: Some("10.0.0.7".into()) });
        assert!(twin.connected());
        assert_eq!(link.address().as_deref(), Some("10.0.0.7"));

        link.write(dps([("1", false)]));
        link.request_update();
        assert_eq!(
            output.next_line().await.unwrap().unwrap(),
            r#"{"op":"write","id":"bf01","dps":{"1":false}}"#
        );
        assert_eq!(output.next_line().await.unwrap().unwrap(), r#"{"op":"refresh","id":"bf01"}"#);

        input.write_all(b"{\"event\":\"disconnected\",\"id\":\"bf01\"}\n").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected { id: "bf01".into() });
        assert!(!link.connected());

        drop(input);
        assert_eq!(events.recv().await, None);
    }
}
