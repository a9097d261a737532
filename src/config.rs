use crate::device::{DeviceIdentity, DeviceType};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the device list from {1:?}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("could not parse the device list in {1:?}")]
    Parse(#[source] serde_json::Error, PathBuf),
    #[error("device #{0} in {1:?} has an empty id")]
    EmptyId(usize, PathBuf),
}

/// A single entry of the device list.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Overrides the kind otherwise inferred from the product key.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(default, alias = "idSuffix", skip_serializing_if = "Option::is_none")]
    pub id_suffix: Option<String>,
    #[serde(default, alias = "productKey", skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    /// Address of the device, if it can't be discovered on the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// The local key the device protocol is encrypted with.
    #[serde(default, skip_serializing)]
    pub key: Option<String>,
    /// Protocol version, e.g. `3.3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DeviceConfig {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            device_type: None,
            id_suffix: None,
            product_key: None,
            ip: None,
            key: None,
            version: None,
        }
    }

    /// The explicitly configured kind, or the kind of the product, or [`DeviceType::Generic`].
    pub fn resolved_type(&self) -> DeviceType {
        self.device_type
            .or_else(|| self.product_key.as_deref().and_then(DeviceType::from_product_key))
            .unwrap_or(DeviceType::Generic)
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.id, self.name.as_deref(), self.id_suffix.as_deref())
    }
}

pub fn parse_devices(json: &str, path: &Path) -> Result<Vec<DeviceConfig>, Error> {
    let devices: Vec<DeviceConfig> =
        serde_json::from_str(json).map_err(|e| Error::Parse(e, path.to_path_buf()))?;
    if let Some(index) = devices.iter().position(|d| d.id.trim().is_empty()) {
        return Err(Error::EmptyId(index, path.to_path_buf()));
    }
    Ok(devices)
}

pub async fn load_devices(path: &Path) -> Result<Vec<DeviceConfig>, Error> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Read(e, path.to_path_buf()))?;
    parse_devices(&json, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_both_spellings() {
        let devices = parse_devices(
            r#"[
                {"id": "bf01", "name": "roleta Jeremi", "type": "cover", "key": "secret"},
                {"id": "bf02", "productKey": "keyjup78v54myhan", "idSuffix": "_b"},
                {"id": "bf03", "product_key": "nothing-we-know", "ip": "10.0.0.3", "version": "3.3"}
            ]"#,
            Path::new("devices.json"),
        )
        .unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].resolved_type(), DeviceType::Cover);
        assert_eq!(devices[0].key.as_deref(), Some("secret"));
        assert_eq!(devices[1].resolved_type(), DeviceType::Plug);
        assert_eq!(devices[1].identity().sanitized_name, "bf02_b");
        assert_eq!(devices[2].resolved_type(), DeviceType::Generic);
        assert_eq!(devices[2].ip.as_deref(), Some("10.0.0.3"));
    }

    #[test]
    fn explicit_type_wins() {
        let mut config = DeviceConfig::new("bf01", "Lamp");
        config.product_key = Some("aacztutbu69gdpdf".into());
        assert_eq!(config.resolved_type(), DeviceType::Cover);
        config.device_type = Some(DeviceType::Switch);
        assert_eq!(config.resolved_type(), DeviceType::Switch);
    }

    #[test]
    fn key_is_not_echoed() {
        let mut config = DeviceConfig::new("bf01", "Lamp");
        config.key = Some("secret".into());
        assert!(!serde_json::to_string(&config).unwrap().contains("secret"));
    }

    #[test]
    fn errors_carry_the_path() {
        let error = parse_devices("{}", Path::new("/etc/devices.json")).unwrap_err();
        assert!(matches!(error, Error::Parse(_, ref path) if path == Path::new("/etc/devices.json")));
        let error = parse_devices(r#"[{"id": " "}]"#, Path::new("d.json")).unwrap_err();
        assert!(matches!(error, Error::EmptyId(0, _)));
    }
}
