/*!
 * Device manager for testrig.
 *
 * The manager owns the device records, runs detection and hands out open
 * device handles. Every change to the set of known devices is written back to
 * the records files and announced to subscribers.
 */
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn, Instrument};

use testrig_core::config::{Config, SharedConfig};
use testrig_core::logging::component_span;
use testrig_core::types::PropertyValue;

use crate::capability::CapabilityResolver;
use crate::detection::{DetectionEngine, DetectionFailure, DetectionReport};
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::records::{DeviceRecord, RecordsStore};
use crate::registry::ExtensionRegistry;

/// Changes to the set of known or open devices
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    /// A new device was detected and recorded
    DeviceDetected(DeviceRecord),
    /// A device record was rewritten by redetection
    DeviceRedetected {
        /// The device name after redetection
        name: String,
        /// Persistent fields that changed
        changed: Vec<String>,
    },
    /// A device record was deleted
    DeviceDeleted(String),
    /// A device handle was created
    DeviceOpened(String),
    /// A device handle was closed
    DeviceClosed(String),
}

/// Result of redetecting one device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedetectOutcome {
    /// The record before redetection
    pub previous: DeviceRecord,
    /// The record now stored
    pub current: DeviceRecord,
    /// Persistent fields whose values differ
    pub changed: Vec<String>,
}

impl RedetectOutcome {
    /// Whether the hardware identity is unchanged
    pub fn is_unchanged(&self) -> bool {
        self.changed.is_empty()
    }
}

/// Entry point for working with the device fleet
#[derive(Debug)]
pub struct Manager {
    config: SharedConfig,
    registry: Arc<ExtensionRegistry>,
    resolver: Arc<CapabilityResolver>,
    detection: DetectionEngine,
    records: Mutex<RecordsStore>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    event_sender: broadcast::Sender<ManagerEvent>,
}

impl Manager {
    /// Create a manager over a populated registry, loading the records files
    pub async fn new(config: SharedConfig, registry: Arc<ExtensionRegistry>) -> Result<Self> {
        let records = RecordsStore::from_config(&config.get().general).await?;
        let detection = DetectionEngine::new(
            Arc::clone(&registry),
            config.get().detection.clone(),
            config.get().switchboard.clone(),
            PathBuf::from(&config.get().general.log_directory),
        );
        let (event_sender, _) = broadcast::channel(100);

        info!(
            "Device manager ready with {} known devices and {} models",
            records.names().len(),
            registry.supported_models().len()
        );
        Ok(Self {
            resolver: Arc::new(CapabilityResolver::new(Arc::clone(&registry))),
            config,
            registry,
            detection,
            records: Mutex::new(records),
            devices: Mutex::new(HashMap::new()),
            event_sender,
        })
    }

    /// The loaded configuration
    pub fn config(&self) -> &Config {
        self.config.get()
    }

    /// The extension registry
    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// The capability resolver shared by every device
    pub fn resolver(&self) -> &Arc<CapabilityResolver> {
        &self.resolver
    }

    /// Subscribe to device changes
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_sender.subscribe()
    }

    /// Detect devices at addresses not yet known and record them
    pub async fn detect(&self) -> Result<DetectionReport> {
        let span = component_span("manager", Some("detect"));
        async {
            let mut records = self.records.lock().await;
            let mut report = self.detection.detect(&records.addresses()).await;

            let mut recorded = Vec::new();
            for record in std::mem::take(&mut report.detected) {
                if let Some(existing) = records.get(record.name()) {
                    // Two addresses can derive the same name
                    warn!(
                        "{} at {} collides with the device already at {}",
                        record.name(),
                        record.address(),
                        existing.address()
                    );
                    report.errors.push(DetectionFailure {
                        communication_type: record.communication_type().to_string(),
                        address: Some(record.address().to_string()),
                        reason: format!("device name {} is already in use", record.name()),
                    });
                    continue;
                }
                records.insert(record.clone());
                recorded.push(record);
            }

            if !recorded.is_empty() {
                records.save().await?;
            }
            for record in &recorded {
                let _ = self.event_sender.send(ManagerEvent::DeviceDetected(record.clone()));
            }
            report.detected = recorded;

            info!(
                "Detection finished: {} new, {} unknown, {} errors",
                report.detected.len(),
                report.unknown.len(),
                report.errors.len()
            );
            Ok::<_, DeviceError>(report)
        }
        .instrument(span)
        .await
    }

    /// Detect a known device again and compare its persistent identifiers
    ///
    /// The device is closed first. The stored record is replaced by the new one;
    /// user-set optional identifiers and options are kept.
    pub async fn redetect(&self, name: &str) -> Result<RedetectOutcome> {
        self.close_device(name).await?;

        let mut records = self.records.lock().await;
        let previous = records
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::not_found(format!("device {}", name)))?;
        let communication = self
            .registry
            .communication_type(previous.communication_type())
            .ok_or_else(|| {
                DeviceError::not_found(format!("communication type {}", previous.communication_type()))
            })?;

        let mut current = self
            .detection
            .classify(&communication, previous.address())
            .await?
            .ok_or_else(|| DeviceError::device(name, format!("no model matches {} any more", previous.address())))?;
        for (key, value) in &previous.optional {
            current.optional.insert(key.clone(), value.clone());
        }
        let changed = previous.changed_fields(&current);

        if current.name() != name {
            if let Some(existing) = records.get(current.name()) {
                return Err(DeviceError::device(
                    name,
                    format!(
                        "redetected as {}, a name already used by the device at {}",
                        current.name(),
                        existing.address()
                    ),
                ));
            }
            let options = records.options(name);
            records.remove(name);
            records.insert(current.clone());
            for (key, value) in options {
                records.set_option(current.name(), &key, value)?;
            }
        } else {
            records.insert(current.clone());
        }
        records.save().await?;

        if changed.is_empty() {
            debug!("Redetected {} unchanged", name);
        } else {
            warn!("Redetected {} with changed fields: {}", name, changed.join(", "));
        }
        let _ = self.event_sender.send(ManagerEvent::DeviceRedetected {
            name: current.name().to_string(),
            changed: changed.clone(),
        });

        Ok(RedetectOutcome {
            previous,
            current,
            changed,
        })
    }

    /// Close a device and forget its record and options
    pub async fn delete(&self, name: &str) -> Result<DeviceRecord> {
        self.close_device(name).await?;
        let mut records = self.records.lock().await;
        let removed = records
            .remove(name)
            .ok_or_else(|| DeviceError::not_found(format!("device {}", name)))?;
        records.save().await?;

        info!("Deleted device {}", name);
        let _ = self.event_sender.send(ManagerEvent::DeviceDeleted(name.to_string()));
        Ok(removed)
    }

    /// The stored record of a device
    pub async fn get_device_record(&self, name: &str) -> Result<DeviceRecord> {
        self.records
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::not_found(format!("device {}", name)))
    }

    /// Set an option on a known device and save it
    ///
    /// Open handles keep the options they were created with.
    pub async fn set_option(&self, name: &str, key: &str, value: PropertyValue) -> Result<()> {
        let mut records = self.records.lock().await;
        records.set_option(name, key, value)?;
        records.save().await
    }

    /// Names of all known devices, sorted
    pub async fn devices(&self) -> Vec<String> {
        self.records.lock().await.names()
    }

    /// Names of devices with an open handle, sorted
    pub async fn open_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle for a known device; an already open device is returned as is
    pub async fn create_device(&self, name: &str) -> Result<Arc<Device>> {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get(name) {
            return Ok(Arc::clone(device));
        }

        let (record, options) = {
            let records = self.records.lock().await;
            let record = records
                .get(name)
                .cloned()
                .ok_or_else(|| DeviceError::not_found(format!("device {}", name)))?;
            (record, records.options(name))
        };
        let device = Arc::new(Device::new(
            record,
            options,
            &self.registry,
            Arc::clone(&self.resolver),
            self.config.get(),
        )?);
        devices.insert(name.to_string(), Arc::clone(&device));

        info!("Opened device {} ({})", name, device.model().id);
        let _ = self.event_sender.send(ManagerEvent::DeviceOpened(name.to_string()));
        Ok(device)
    }

    /// Close a device handle; closing a device that is not open does nothing
    pub async fn close_device(&self, name: &str) -> Result<()> {
        let device = self.devices.lock().await.remove(name);
        if let Some(device) = device {
            device.close().await?;
            debug!("Closed device {}", name);
            let _ = self.event_sender.send(ManagerEvent::DeviceClosed(name.to_string()));
        }
        Ok(())
    }

    /// Close every open device; all are attempted and the first error is returned
    pub async fn close(&self) -> Result<()> {
        let devices: Vec<(String, Arc<Device>)> = self.devices.lock().await.drain().collect();
        let mut first_error = None;
        for (name, device) in devices {
            match device.close().await {
                Ok(()) => {
                    let _ = self.event_sender.send(ManagerEvent::DeviceClosed(name));
                }
                Err(e) => {
                    warn!("Failed to close {}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use testrig_core::types::DeviceConfig;
    use testrig_switchboard::transports::DuplexTransport;
    use testrig_switchboard::Transport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use crate::builtin::{builtin_package, SwitchboardCapability, SWITCHBOARD_INTERFACE};
    use crate::communication::StaticComms;
    use crate::detection::{
        CommandQuery, DetectContext, DetectQuery, Identify, MatchCriterion, QueryResponse, QueryResponses,
    };
    use crate::extension::{DeviceModelDescriptor, ExtensionPackage};
    use crate::records::SERIAL_NUMBER;

    /// Serial numbers reported by each virtual address; tests swap hardware by editing it
    type Bench = Arc<StdMutex<HashMap<String, String>>>;

    /// A scripted console: answers `cat /etc/product` and `cat /etc/serial`
    fn bench_comms(bench: Bench) -> StaticComms {
        let addresses = {
            let mut addresses: Vec<String> = bench.lock().unwrap().keys().cloned().collect();
            addresses.sort();
            addresses
        };
        StaticComms::new("bench", addresses, move |address| {
            let (transport, device) = DuplexTransport::pair(address);
            let bench = Arc::clone(&bench);
            let address = address.to_string();
            tokio::spawn(async move {
                let (read_half, mut write_half) = tokio::io::split(device);
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let serial = bench.lock().unwrap().get(&address).cloned().unwrap_or_default();
                    let reply = match line.as_str() {
                        "cat /etc/product" if serial.starts_with("W") => "product: widget\n".to_string(),
                        "cat /etc/product" => "product: gadget\n".to_string(),
                        "cat /etc/serial" => format!("serial: {}\n", serial),
                        other => format!("{}: command not found\n", other),
                    };
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(transport) as Box<dyn Transport>)
        })
    }

    /// Reads the serial number off the console
    #[derive(Debug)]
    struct SerialFromConsole;

    #[async_trait]
    impl Identify for SerialFromConsole {
        async fn identify(
            &self,
            _model: &DeviceModelDescriptor,
            context: &DetectContext,
            _responses: &QueryResponses,
        ) -> anyhow::Result<DeviceConfig> {
            let query = CommandQuery::new("serial", "cat /etc/serial", r"serial: (\S+)")?;
            let QueryResponse::Text(serial) = query.query(context).await? else {
                anyhow::bail!("no serial number");
            };
            let mut props = DeviceConfig::new();
            props.insert(SERIAL_NUMBER.to_string(), serial.into());
            Ok(props)
        }
    }

    fn registry(bench: Bench) -> Arc<ExtensionRegistry> {
        let product = CommandQuery::new("product", "cat /etc/product", r"product: (\w+)")
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let package = ExtensionPackage::new("bench", "1.0")
            .with_communication_type(bench_comms(bench))
            .with_detect_query("bench", product)
            .with_model(
                DeviceModelDescriptor::new("widget", "bench")
                    .with_capability(SWITCHBOARD_INTERFACE, "switchboard_default")
                    .with_criterion("product", MatchCriterion::matches("^widget$").unwrap())
                    .with_optional_property("alias", "")
                    .with_identify(SerialFromConsole),
            );

        let mut registry = ExtensionRegistry::new();
        registry.register(builtin_package(&Config::default()).unwrap()).unwrap();
        registry.register(package).unwrap();
        Arc::new(registry)
    }

    fn config(dir: &Path) -> SharedConfig {
        let mut config = Config::default();
        config.general.data_dir = dir.join("data").display().to_string();
        config.general.log_directory = dir.join("logs").display().to_string();
        SharedConfig::new(config)
    }

    fn bench(entries: &[(&str, &str)]) -> Bench {
        Arc::new(StdMutex::new(
            entries.iter().map(|(a, s)| (a.to_string(), s.to_string())).collect(),
        ))
    }

    #[test_log::test(tokio::test)]
    async fn test_detect_records_devices_and_tolerates_unknown() {
        let dir = tempdir().unwrap();
        let bench = bench(&[("bench-1", "W0001AB12"), ("bench-2", "G0002"), ("bench-3", "W0003CD34")]);
        let manager = Manager::new(config(dir.path()), registry(Arc::clone(&bench))).await.unwrap();
        let mut events = manager.subscribe();

        let report = manager.detect().await.unwrap();
        let names: Vec<&str> = report.detected.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["widget-ab12", "widget-cd34"]);
        assert_eq!(report.unknown.len(), 1);
        assert_eq!(report.unknown[0].address, "bench-2");
        assert_eq!(manager.devices().await, vec!["widget-ab12", "widget-cd34"]);
        assert!(matches!(events.recv().await.unwrap(), ManagerEvent::DeviceDetected(_)));

        // Known addresses are skipped on the next pass
        let again = manager.detect().await.unwrap();
        assert!(again.detected.is_empty());
        assert_eq!(again.unknown.len(), 1);

        // Records survive a restart
        let reloaded = Manager::new(config(dir.path()), registry(bench)).await.unwrap();
        let record = reloaded.get_device_record("widget-ab12").await.unwrap();
        assert_eq!(record.serial_number(), "W0001AB12");
        assert_eq!(record.address(), "bench-1");
    }

    #[tokio::test]
    async fn test_redetect_is_idempotent_and_reports_drift() {
        let dir = tempdir().unwrap();
        let bench = bench(&[("bench-1", "W0001AB12")]);
        let manager = Manager::new(config(dir.path()), registry(Arc::clone(&bench))).await.unwrap();
        manager.detect().await.unwrap();
        manager.set_option("widget-ab12", "alias", "left".into()).await.unwrap();

        let device_file = manager.config().general.device_file_path();
        let before = std::fs::read(&device_file).unwrap();
        let outcome = manager.redetect("widget-ab12").await.unwrap();
        assert!(outcome.is_unchanged());
        assert_eq!(outcome.previous.persistent, outcome.current.persistent);
        assert_eq!(std::fs::read(&device_file).unwrap(), before);

        // Swap the board behind the same address
        bench
            .lock()
            .unwrap()
            .insert("bench-1".to_string(), "W0009EF56".to_string());
        let outcome = manager.redetect("widget-ab12").await.unwrap();
        assert_eq!(outcome.changed, vec!["name".to_string(), SERIAL_NUMBER.to_string()]);
        assert_eq!(outcome.current.name(), "widget-ef56");
        assert_eq!(manager.devices().await, vec!["widget-ef56"]);
        let options = manager.records.lock().await.options("widget-ef56");
        assert_eq!(options.get("alias").and_then(|v| v.as_str()), Some("left"));
    }

    #[tokio::test]
    async fn test_redetect_refuses_to_take_another_devices_name() {
        let dir = tempdir().unwrap();
        let bench = bench(&[("bench-1", "W0001AB12"), ("bench-2", "W0002CD34")]);
        let manager = Manager::new(config(dir.path()), registry(Arc::clone(&bench))).await.unwrap();
        manager.detect().await.unwrap();
        manager.set_option("widget-cd34", "alias", "right".into()).await.unwrap();

        let device_file = manager.config().general.device_file_path();
        let before = std::fs::read(&device_file).unwrap();
        bench
            .lock()
            .unwrap()
            .insert("bench-1".to_string(), "W0009CD34".to_string());

        let err = manager.redetect("widget-ab12").await.unwrap_err();
        assert!(matches!(err, DeviceError::Device { .. }));
        assert_eq!(manager.devices().await, vec!["widget-ab12", "widget-cd34"]);
        assert_eq!(
            manager.get_device_record("widget-cd34").await.unwrap().address(),
            "bench-2"
        );
        let options = manager.records.lock().await.options("widget-cd34");
        assert_eq!(options.get("alias").and_then(|v| v.as_str()), Some("right"));
        assert_eq!(std::fs::read(&device_file).unwrap(), before);
    }

    #[tokio::test]
    async fn test_device_lifecycle() {
        let dir = tempdir().unwrap();
        let bench = bench(&[("bench-1", "W0001AB12")]);
        let manager = Manager::new(config(dir.path()), registry(bench)).await.unwrap();
        manager.detect().await.unwrap();

        let device = manager.create_device("widget-ab12").await.unwrap();
        let same = manager.create_device("widget-ab12").await.unwrap();
        assert!(Arc::ptr_eq(&device, &same));
        assert_eq!(manager.open_devices().await, vec!["widget-ab12"]);

        let console = device
            .capability_as::<SwitchboardCapability>(SWITCHBOARD_INTERFACE)
            .await
            .unwrap();
        let response = console
            .send_and_expect("cat /etc/serial\n", &[r"serial: (\S+)"], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.line.as_deref(), Some("serial: W0001AB12"));

        manager.close_device("widget-ab12").await.unwrap();
        assert!(manager.open_devices().await.is_empty());
        assert!(!device.is_open().await);
        assert!(manager.resolver().cached_interfaces(device.instance_id()).is_empty());

        let reopened = manager.create_device("widget-ab12").await.unwrap();
        assert!(!Arc::ptr_eq(&device, &reopened));

        let removed = manager.delete("widget-ab12").await.unwrap();
        assert_eq!(removed.address(), "bench-1");
        assert!(manager.open_devices().await.is_empty());
        assert!(matches!(
            manager.create_device("widget-ab12").await,
            Err(DeviceError::NotFound(_))
        ));
        assert!(matches!(manager.delete("widget-ab12").await, Err(DeviceError::NotFound(_))));
        manager.close().await.unwrap();
    }
}
