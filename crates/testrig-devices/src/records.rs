/*!
 * Device records and options files.
 *
 * Two JSON documents: the device file maps a device name to its persistent and
 * optional identifiers, the options file maps a device name to option
 * overrides. Maps are ordered so that rewriting unchanged data produces
 * identical bytes.
 */
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use testrig_core::config::GeneralConfig;
use testrig_core::types::{DeviceConfig, PropertyValue};

use crate::error::{DeviceError, Result};

/// Persistent property holding the device name
pub const NAME: &str = "name";
/// Persistent property holding the model id
pub const DEVICE_TYPE: &str = "device_type";
/// Persistent property holding the communication type name
pub const COMMUNICATION_TYPE: &str = "communication_type";
/// Persistent property holding the communication address
pub const COMMUNICATION_ADDRESS: &str = "communication_address";
/// Persistent property holding the serial number
pub const SERIAL_NUMBER: &str = "serial_number";

/// Identifiers of one known device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Identifiers fixed at detection
    pub persistent: DeviceConfig,
    /// Identifiers with defaults that users may change
    #[serde(default)]
    pub optional: DeviceConfig,
}

impl DeviceRecord {
    /// A record with the default identity fields
    pub fn new(name: &str, device_type: &str, communication_type: &str, address: &str, serial_number: &str) -> Self {
        let mut persistent = DeviceConfig::new();
        persistent.insert(NAME.to_string(), name.into());
        persistent.insert(DEVICE_TYPE.to_string(), device_type.into());
        persistent.insert(COMMUNICATION_TYPE.to_string(), communication_type.into());
        persistent.insert(COMMUNICATION_ADDRESS.to_string(), address.into());
        persistent.insert(SERIAL_NUMBER.to_string(), serial_number.into());
        Self {
            persistent,
            optional: DeviceConfig::new(),
        }
    }

    fn text(&self, key: &str) -> &str {
        self.persistent.get(key).and_then(PropertyValue::as_str).unwrap_or_default()
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.text(NAME)
    }

    /// Model id
    pub fn device_type(&self) -> &str {
        self.text(DEVICE_TYPE)
    }

    /// Communication type name
    pub fn communication_type(&self) -> &str {
        self.text(COMMUNICATION_TYPE)
    }

    /// Communication address
    pub fn address(&self) -> &str {
        self.text(COMMUNICATION_ADDRESS)
    }

    /// Serial number
    pub fn serial_number(&self) -> &str {
        self.text(SERIAL_NUMBER)
    }

    /// Persistent keys whose values differ between the two records
    pub fn changed_fields(&self, other: &DeviceRecord) -> Vec<String> {
        let keys: BTreeSet<&String> = self.persistent.keys().chain(other.persistent.keys()).collect();
        keys.into_iter()
            .filter(|key| self.persistent.get(*key) != other.persistent.get(*key))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DevicesDocument {
    #[serde(default)]
    devices: BTreeMap<String, DeviceRecord>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct OptionsDocument {
    #[serde(default)]
    device_options: BTreeMap<String, DeviceConfig>,
}

/// In-memory copy of the two files
#[derive(Debug)]
pub struct RecordsStore {
    device_file: PathBuf,
    options_file: PathBuf,
    devices: BTreeMap<String, DeviceRecord>,
    options: BTreeMap<String, DeviceConfig>,
}

impl RecordsStore {
    /// Load both files; missing files are treated as empty
    pub async fn load<P: AsRef<Path>, Q: AsRef<Path>>(device_file: P, options_file: Q) -> Result<Self> {
        let device_file = device_file.as_ref().to_path_buf();
        let options_file = options_file.as_ref().to_path_buf();

        let devices: DevicesDocument = read_document(&device_file).await?;
        let options: OptionsDocument = read_document(&options_file).await?;
        debug!(
            "Loaded {} device records from {}",
            devices.devices.len(),
            device_file.display()
        );

        Ok(Self {
            device_file,
            options_file,
            devices: devices.devices,
            options: options.device_options,
        })
    }

    /// Load the files named in the `[general]` configuration section
    pub async fn from_config(config: &GeneralConfig) -> Result<Self> {
        Self::load(config.device_file_path(), config.options_file_path()).await
    }

    /// Path of the device file
    pub fn device_file(&self) -> &Path {
        &self.device_file
    }

    /// Path of the options file
    pub fn options_file(&self) -> &Path {
        &self.options_file
    }

    /// Record of a device
    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(name)
    }

    /// Known device names, sorted
    pub fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Addresses of every known device
    pub fn addresses(&self) -> BTreeSet<String> {
        self.devices.values().map(|r| r.address().to_string()).collect()
    }

    /// Whether a device with this name is known
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Add or overwrite a record; returns the previous one
    pub fn insert(&mut self, record: DeviceRecord) -> Option<DeviceRecord> {
        let name = record.name().to_string();
        self.options.entry(name.clone()).or_default();
        self.devices.insert(name, record)
    }

    /// Remove a device and its options
    pub fn remove(&mut self, name: &str) -> Option<DeviceRecord> {
        self.options.remove(name);
        self.devices.remove(name)
    }

    /// Option overrides of a device
    pub fn options(&self, name: &str) -> DeviceConfig {
        self.options.get(name).cloned().unwrap_or_default()
    }

    /// Set one option on a known device
    pub fn set_option(&mut self, name: &str, key: &str, value: PropertyValue) -> Result<()> {
        if !self.devices.contains_key(name) {
            return Err(DeviceError::not_found(format!("device {}", name)));
        }
        self.options
            .entry(name.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Rewrite both files
    pub async fn save(&self) -> Result<()> {
        let devices = DevicesDocument {
            devices: self.devices.clone(),
        };
        let options = OptionsDocument {
            device_options: self.options.clone(),
        };
        write_document(&self.device_file, &devices).await?;
        write_document(&self.options_file, &options).await?;
        info!("Saved {} device records", self.devices.len());
        Ok(())
    }
}

async fn read_document<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match fs::read_to_string(path).await {
        Ok(text) if text.trim().is_empty() => Ok(T::default()),
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temporary file and rename so readers never see a partial file
async fn write_document<T: Serialize>(path: &Path, document: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut text = serde_json::to_string_pretty(document)?;
    text.push('\n');

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(name: &str, address: &str) -> DeviceRecord {
        DeviceRecord::new(name, "raspberrypi", "ssh", address, "0001")
    }

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let dir = tempdir().unwrap();
        let store = RecordsStore::load(dir.path().join("devices.json"), dir.path().join("options.json"))
            .await
            .unwrap();
        assert!(store.names().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let devices = dir.path().join("conf/devices.json");
        let options = dir.path().join("conf/options.json");

        let mut store = RecordsStore::load(&devices, &options).await.unwrap();
        store.insert(record("raspberrypi-0001", "10.0.0.2"));
        store.set_option("raspberrypi-0001", "alias", "lab-pi".into()).unwrap();
        store.save().await.unwrap();

        let text = std::fs::read_to_string(&devices).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["devices"]["raspberrypi-0001"]["persistent"]["communication_address"], "10.0.0.2");
        let text = std::fs::read_to_string(&options).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["device_options"]["raspberrypi-0001"]["alias"], "lab-pi");

        let reloaded = RecordsStore::load(&devices, &options).await.unwrap();
        assert_eq!(reloaded.get("raspberrypi-0001"), store.get("raspberrypi-0001"));
        assert_eq!(reloaded.options("raspberrypi-0001").get("alias").and_then(|v| v.as_str()), Some("lab-pi"));
        assert!(reloaded.addresses().contains("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_rewriting_unchanged_data_is_byte_identical() {
        let dir = tempdir().unwrap();
        let devices = dir.path().join("devices.json");
        let options = dir.path().join("options.json");

        let mut store = RecordsStore::load(&devices, &options).await.unwrap();
        store.insert(record("b-0002", "10.0.0.3"));
        store.insert(record("a-0001", "10.0.0.2"));
        store.save().await.unwrap();
        let first = std::fs::read(&devices).unwrap();

        let reloaded = RecordsStore::load(&devices, &options).await.unwrap();
        reloaded.save().await.unwrap();
        assert_eq!(std::fs::read(&devices).unwrap(), first);
        assert!(!devices.with_extension("tmp").exists());
    }

    #[test]
    fn test_remove_and_unknown_option() {
        let mut store = RecordsStore {
            device_file: PathBuf::from("devices.json"),
            options_file: PathBuf::from("options.json"),
            devices: BTreeMap::new(),
            options: BTreeMap::new(),
        };
        assert!(matches!(
            store.set_option("ghost", "alias", "x".into()),
            Err(DeviceError::NotFound(_))
        ));
        store.insert(record("a-0001", "10.0.0.2"));
        assert!(store.remove("a-0001").is_some());
        assert!(!store.contains("a-0001"));
        assert!(store.options("a-0001").is_empty());
    }

    #[test]
    fn test_changed_fields() {
        let before = record("a-0001", "10.0.0.2");
        let mut after = before.clone();
        assert!(before.changed_fields(&after).is_empty());

        after.persistent.insert(SERIAL_NUMBER.to_string(), "9999".into());
        after.persistent.insert("firmware".to_string(), "1.2".into());
        assert_eq!(before.changed_fields(&after), vec!["firmware".to_string(), SERIAL_NUMBER.to_string()]);
    }
}
