/*!
 * Device handle.
 *
 * A `Device` ties one device record to its registered model: it owns the
 * device's event parser and lazily opened switchboard, resolves capabilities
 * through the shared resolver and runs the model's health checks.
 */
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use testrig_core::config::Config;
use testrig_core::types::{DeviceConfig, Id, PropertyValue};
use testrig_core::utils::with_retry;
use testrig_switchboard::log::events_path_for;
use testrig_switchboard::{EventParser, Switchboard};

use crate::capability::{Capability, CapabilityContext, CapabilityResolver};
use crate::communication::CommunicationType;
use crate::error::{DeviceError, Result};
use crate::extension::DeviceModelDescriptor;
use crate::health::ReadySetting;
use crate::records::DeviceRecord;
use crate::registry::ExtensionRegistry;
use crate::session::SwitchboardSlot;

/// Summary of an open device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Model id
    pub device_type: String,
    /// Communication type name
    pub communication_type: String,
    /// Communication address
    pub address: String,
    /// Serial number
    pub serial_number: String,
    /// Declared capability interfaces
    pub capabilities: Vec<String>,
    /// Current device log file
    pub log_path: PathBuf,
}

/// An open device
#[derive(Debug)]
pub struct Device {
    instance_id: Id,
    record: DeviceRecord,
    options: DeviceConfig,
    model: Arc<DeviceModelDescriptor>,
    communication: Arc<dyn CommunicationType>,
    parser: Arc<EventParser>,
    switchboard: Arc<SwitchboardSlot>,
    resolver: Arc<CapabilityResolver>,
}

impl Device {
    /// Build the handle for a known device
    ///
    /// The switchboard is not opened until first use. The device log is
    /// `<log_directory>/<name>-<timestamp>.txt` with parsed events next to it.
    pub fn new(
        record: DeviceRecord,
        options: DeviceConfig,
        registry: &ExtensionRegistry,
        resolver: Arc<CapabilityResolver>,
        config: &Config,
    ) -> Result<Self> {
        let name = record.name().to_string();
        let model = registry
            .model(record.device_type())
            .cloned()
            .ok_or_else(|| DeviceError::not_found(format!("device model {} of {}", record.device_type(), name)))?;
        let communication = registry.communication_type(record.communication_type()).ok_or_else(|| {
            DeviceError::not_found(format!(
                "communication type {} of {}",
                record.communication_type(),
                name
            ))
        })?;

        let log_path = device_log_path(Path::new(&config.general.log_directory), &name);
        let mut parser = EventParser::new(name.clone()).with_reboot_window(config.health.reboot_window());
        for (label, pattern) in &model.event_filters {
            parser = parser.with_filter(label.clone(), pattern)?;
        }
        let parser = Arc::new(parser.with_events_file(events_path_for(&log_path))?);

        let switchboard_options = communication.switchboard_options(log_path, &config.switchboard)?;
        let switchboard = Arc::new(SwitchboardSlot::new(
            name.clone(),
            record.address(),
            Arc::clone(&communication),
            Arc::clone(&parser),
            switchboard_options,
        ));

        debug!(device = %name, "Created {} device on {}", model.id, record.address());
        Ok(Self {
            instance_id: Id::new(),
            record,
            options,
            model,
            communication,
            parser,
            switchboard,
            resolver,
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Identity of this handle; a device reopened later gets a new one
    pub fn instance_id(&self) -> &Id {
        &self.instance_id
    }

    /// The device's model
    pub fn model(&self) -> &DeviceModelDescriptor {
        &self.model
    }

    /// The record the device was opened from
    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    /// Option overrides
    pub fn options(&self) -> &DeviceConfig {
        &self.options
    }

    /// Communication address
    pub fn address(&self) -> &str {
        self.record.address()
    }

    /// Communication type
    pub fn communication_type(&self) -> &Arc<dyn CommunicationType> {
        &self.communication
    }

    /// A property: option overrides first, then optional, then persistent identifiers
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.options
            .get(name)
            .or_else(|| self.record.optional.get(name))
            .or_else(|| self.record.persistent.get(name))
    }

    /// Current device log file
    pub fn log_path(&self) -> PathBuf {
        self.switchboard.log_path()
    }

    /// Event parser fed by the switchboard
    pub fn event_parser(&self) -> &Arc<EventParser> {
        &self.parser
    }

    /// The open switchboard, opening it if needed
    pub async fn switchboard(&self) -> Result<Arc<Switchboard>> {
        self.switchboard.get().await
    }

    /// Close the switchboard; the next `switchboard()` opens a new one
    pub async fn close_switchboard(&self) -> Result<()> {
        self.switchboard.close().await
    }

    /// Whether the switchboard is currently open
    pub async fn is_open(&self) -> bool {
        self.switchboard.is_open().await
    }

    /// What flavors get to build capabilities for this device
    pub fn capability_context(&self) -> CapabilityContext {
        CapabilityContext {
            device_name: self.name().to_string(),
            model: self.model.id.clone(),
            address: self.address().to_string(),
            switchboard: Arc::clone(&self.switchboard),
            event_parser: Arc::clone(&self.parser),
        }
    }

    /// The capability implementing `interface`
    pub async fn capability(&self, interface: &str) -> Result<Arc<dyn Capability>> {
        self.resolver.get(self, interface).await
    }

    /// The capability implementing `interface`, as its concrete type
    pub async fn capability_as<T: Capability>(&self, interface: &str) -> Result<Arc<T>> {
        self.resolver.get_as::<T>(self, interface).await
    }

    /// Whether the model declares `interface`
    pub fn has_capability(&self, interface: &str) -> bool {
        self.model.has_capability(interface)
    }

    /// Declared interfaces
    pub fn capabilities(&self) -> Vec<&str> {
        self.model.interfaces()
    }

    /// Summary for listings
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name().to_string(),
            device_type: self.record.device_type().to_string(),
            communication_type: self.record.communication_type().to_string(),
            address: self.address().to_string(),
            serial_number: self.record.serial_number().to_string(),
            capabilities: self.capabilities().into_iter().map(String::from).collect(),
            log_path: self.log_path(),
        }
    }

    /// Run the model's health checks in order, stopping at the first failure
    pub async fn check_health(&self) -> Result<()> {
        for check in &self.model.health_checks {
            check
                .check(self)
                .await
                .map_err(|e| DeviceError::health_check(self.name(), check.name(), format!("{:#}", e)))?;
            debug!(device = %self.name(), "Health check {} passed", check.name());
        }
        Ok(())
    }

    /// Verify the device is usable, recovering once if the model allows it
    ///
    /// Without a recovery hook a failed check is returned as is.
    pub async fn make_device_ready(&self, setting: ReadySetting) -> Result<()> {
        match setting {
            ReadySetting::Off => Ok(()),
            ReadySetting::CheckOnly => self.check_health().await,
            ReadySetting::On => {
                let error = match self.check_health().await {
                    Ok(()) => return Ok(()),
                    Err(error) => error,
                };
                let Some(recovery) = &self.model.recovery else {
                    return Err(error);
                };

                warn!(device = %self.name(), "Recovering after failed health check: {}", error);
                if let Err(e) = recovery.recover(self, &error).await {
                    return Err(DeviceError::health_check(
                        self.name(),
                        "recovery",
                        format!("{:#} (after: {})", e, error),
                    ));
                }
                self.check_health().await?;
                info!(device = %self.name(), "Device recovered");
                Ok(())
            }
        }
    }

    /// `make_device_ready` with a bounded number of fixed-delay retries
    pub async fn make_device_ready_with_retry(
        &self,
        setting: ReadySetting,
        retries: usize,
        delay: Duration,
    ) -> Result<()> {
        with_retry(retries, delay, || self.make_device_ready(setting)).await
    }

    /// Drop cached capabilities and close the switchboard
    pub async fn close(&self) -> Result<()> {
        let evicted = self.resolver.evict(&self.instance_id);
        debug!(device = %self.name(), "Evicted {} capabilities", evicted);
        self.switchboard.close().await
    }
}

fn device_log_path(log_dir: &Path, name: &str) -> PathBuf {
    log_dir.join(format!("{}-{}.txt", name, Utc::now().format("%Y%m%d-%H%M%S%.3f")))
}
