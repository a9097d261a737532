pub mod sensors {
    use crate::device::DeviceType;
    use crate::output;
    use crate::registry::Sensor;
    use strum::VariantArray as _;

    /// Search and output the known data points of each device kind.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list the data points of this kind of device.
        #[arg(long = "type", short = 't', value_enum)]
        device_type: Option<DeviceType>,
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the data points")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct SensorRecord {
        pub device_type: DeviceType,
        #[serde(flatten)]
        pub sensor: &'static Sensor,
    }

    impl SensorRecord {
        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.sensor.identifier.contains(&pattern)
                || self.sensor.dp_id == pattern
                || self.sensor.device_class.is_some_and(|c| c.contains(&pattern))
        }

        fn table_row(&self) -> Vec<String> {
            let s = self.sensor;
            vec![
                self.device_type.to_string(),
                s.dp_id.to_string(),
                s.identifier.to_string(),
                s.entity_kind.to_string(),
                s.domain.to_string(),
                s.scale.map(|v| v.to_string()).unwrap_or_default(),
                s.step.map(|v| v.to_string()).unwrap_or_default(),
                s.unit.unwrap_or_default().to_string(),
                s.device_class.unwrap_or_default().to_string(),
            ]
        }
    }

    pub fn records(device_type: Option<DeviceType>) -> impl Iterator<Item = SensorRecord> {
        DeviceType::VARIANTS
            .iter()
            .copied()
            .filter(move |t| device_type.is_none_or(|wanted| wanted == *t))
            .flat_map(|device_type| {
                device_type.registry().iter().map(move |sensor| SensorRecord { device_type, sensor })
            })
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec![
                "Device", "DP", "Identifier", "Entity", "Values", "Scale", "Step", "Unit", "Class",
            ])
            .map_err(Error::Output)?;
        for record in records(args.device_type) {
            if let Some(pattern) = &args.filter {
                if !record.is_match(pattern) {
                    continue;
                }
            }
            output.result(|| record.table_row(), || &record).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}

pub mod decode {
    use crate::config::DeviceConfig;
    use crate::datapoint::DataPointSet;
    use crate::device::{self, DeviceType};
    use crate::link::OfflineLink;
    use crate::mapper::{self, MapMode};
    use std::sync::Arc;

    /// Translate raw data points into the named values a device of the given kind would publish.
    ///
    /// Data points the kind does not declare are shown under their raw ids.
    #[derive(clap::Parser)]
    pub struct Args {
        #[arg(long = "type", short = 't', value_enum)]
        device_type: DeviceType,
        /// A JSON object of data points, e.g. `{"1": true, "19": 1234}`.
        dps: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not parse the data points")]
        ParseDps(#[source] serde_json::Error),
        #[error("could not write data to the terminal")]
        WriteStdout(#[source] std::io::Error),
        #[error("could not serialize the named values to JSON")]
        SerializeJson(#[source] serde_json::Error),
    }

    pub fn decode(device_type: DeviceType, json: &str) -> Result<mapper::StateMessage, Error> {
        let dps: DataPointSet = serde_json::from_str(json).map_err(Error::ParseDps)?;
        let mut named = mapper::map_raw_to_named(&dps, device_type.registry(), MapMode::IncludeUnknown);
        let config = DeviceConfig {
            device_type: Some(device_type),
            ..DeviceConfig::new("decode", "decode")
        };
        let device = device::create_device(&config, Arc::new(OfflineLink));
        device.kind_state(Some(&dps), &mut named);
        Ok(named)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        use std::io::Write as _;
        let named = decode(args.device_type, &args.dps)?;
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &named).map_err(Error::SerializeJson)?;
        writeln!(stdout).map_err(Error::WriteStdout)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn decodes_plug_telemetry() {
            let named = decode(DeviceType::Plug, r#"{"1": true, "20": 2304, "101": 5}"#).unwrap();
            assert_eq!(named["switch_1"], json!("ON"));
            assert_eq!(named["state"], json!("ON"));
            assert_eq!(named["cur_voltage"], json!(230.4));
            assert_eq!(named["101"], json!(5));
        }

        #[test]
        fn derives_cover_motion() {
            let named = decode(DeviceType::Cover, r#"{"1": "close"}"#).unwrap();
            assert_eq!(named["control"], json!("close"));
            assert_eq!(named["state"], json!("closing"));
            assert_eq!(named["position"], json!(100));
        }

        #[test]
        fn rejects_non_objects() {
            assert!(matches!(decode(DeviceType::Plug, "[1, 2]"), Err(Error::ParseDps(_))));
        }
    }
}

pub mod discovery {
    use crate::config;
    use crate::device;
    use crate::link::OfflineLink;
    use crate::output;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Output the Home Assistant discovery payloads of the configured devices.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// The JSON list of devices.
        #[arg(long, short = 'd', default_value = "devices.json")]
        devices: PathBuf,
        #[arg(long, default_value = "tuya")]
        base_topic: String,
        #[arg(long, default_value = "homeassistant")]
        discovery_topic: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not load the devices")]
        LoadDevices(#[source] config::Error),
        #[error("could not output the discovery payloads")]
        Output(#[source] output::Error),
        #[error("could not serialize the discovery payload for `{1}`")]
        SerializeJson(#[source] serde_json::Error, String),
        #[error("could not construct the runtime")]
        Runtime(#[source] std::io::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        topic: &'a str,
        payload: &'a crate::discovery::EntityDiscovery,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        let configs = runtime
            .block_on(config::load_devices(&args.devices))
            .map_err(Error::LoadDevices)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(vec!["Topic", "Payload"]).map_err(Error::Output)?;
        for config in &configs {
            let device = device::create_device(config, Arc::new(OfflineLink));
            for (key, entity) in device.discovery_message(&args.base_topic) {
                let topic = format!("{}/{key}", args.discovery_topic);
                let payload = serde_json::to_string_pretty(&entity)
                    .map_err(|e| Error::SerializeJson(e, topic.clone()))?;
                output
                    .result(
                        || vec![topic.clone(), payload],
                        || Record { topic: &topic, payload: &entity },
                    )
                    .map_err(Error::Output)?;
            }
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod bridge {
    use crate::bridge::{Bridge, Settings};
    use crate::config;
    use crate::device;
    use crate::link::Transport;
    use rumqttc::v5::MqttOptions;
    use std::path::PathBuf;

    /// Bridge the devices to an MQTT broker.
    ///
    /// Device events are read from stdin and requests for the devices are written to stdout, one
    /// JSON object per line.
    #[derive(clap::Parser)]
    pub struct Args {
        /// How to connect to the MQTT broker.
        ///
        /// The value is expected to be provided as an URL, such as:
        /// `mqtt://location:1883?client_id=hostname` for plain text connection or
        /// `mqtts://location:1883?client_id=hostname` for TLS protected connection.
        #[arg(short = 'm', long)]
        mqtt_broker: String,

        /// To be provided together with `--mqtt-password` to use password based authentication
        /// with the broker.
        #[arg(short = 'u', long, requires = "mqtt_password")]
        mqtt_user: Option<String>,

        /// To be provided together with `--mqtt-user` to use password based authentication with
        /// the broker.
        #[arg(short = 'p', long, requires = "mqtt_user", env = "TUYA2MQTT_MQTT_PASSWORD")]
        mqtt_password: Option<String>,

        /// The JSON list of devices.
        #[arg(long, short = 'd', default_value = "devices.json")]
        devices: PathBuf,

        /// Prefix of the device state and command topics.
        #[arg(long, default_value = "tuya")]
        base_topic: String,

        /// Prefix under which Home Assistant looks for discovery payloads.
        #[arg(long, default_value = "homeassistant")]
        discovery_topic: String,

        /// Home Assistant publishes `online` here whenever it (re)starts.
        #[arg(long, default_value = "homeassistant/status")]
        status_topic: String,

        /// Publish the discovery payloads and the full device state this often.
        ///
        /// Published state expires after twice this period.
        #[arg(long, default_value = "60s")]
        republish_period: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not parse the `--mqtt-broker` argument")]
        ParseMqttBroker(#[source] rumqttc::v5::OptionError),
        #[error("could not load the devices")]
        LoadDevices(#[source] config::Error),
        #[error("could not construct the runtime")]
        Runtime(#[source] std::io::Error),
        #[error("the bridge has stopped")]
        Bridge(#[source] crate::bridge::Error),
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut mqtt_options =
            MqttOptions::parse_url(&args.mqtt_broker).map_err(Error::ParseMqttBroker)?;
        if let (Some(u), Some(p)) = (args.mqtt_user.as_ref(), args.mqtt_password.as_ref()) {
            mqtt_options.set_credentials(u, p);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(async move {
            let configs = config::load_devices(&args.devices).await.map_err(Error::LoadDevices)?;
            tracing::info!(devices = configs.len(), "loaded the device list");
            let (transport, events) = Transport::stdio();
            let devices = configs
                .iter()
                .map(|config| {
                    let device = device::create_device(config, transport.link(config));
                    tracing::debug!(
                        device = %device.identity().sanitized_name,
                        kind = %device.device_type(),
                        "configured"
                    );
                    device
                })
                .collect();
            let settings = Settings {
                base_topic: args.base_topic,
                discovery_topic: args.discovery_topic,
                status_topic: args.status_topic,
                republish_period: *args.republish_period,
            };
            let (mqtt, mqtt_loop) = rumqttc::v5::AsyncClient::new(mqtt_options, 100);
            let bridge = Bridge::new(mqtt, settings, devices);
            let result = bridge.run(mqtt_loop, events).await.map_err(Error::Bridge);
            drop(transport);
            result
        })
    }
}
