/*!
 * Health checks and recovery.
 *
 * A model lists ordered checks that verify a device is usable, and optionally a
 * recovery hook. Without a hook a failed check is returned unchanged: recovery
 * needs a human.
 */
use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{DeviceError, Result};

/// How far `make_device_ready` goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadySetting {
    /// Skip health checks
    Off,
    /// Run the checks and report the first failure
    CheckOnly,
    /// Run the checks, recover on failure, then check again
    #[default]
    On,
}

impl FromStr for ReadySetting {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(ReadySetting::Off),
            "check_only" => Ok(ReadySetting::CheckOnly),
            "on" => Ok(ReadySetting::On),
            other => Err(DeviceError::Core(testrig_core::error::Error::config(format!(
                "unknown ready setting {:?}, expected off, check_only or on",
                other
            )))),
        }
    }
}

/// One readiness check
#[async_trait]
pub trait HealthCheck: Send + Sync + Debug {
    /// Check name, reported on failure
    fn name(&self) -> &str;

    /// Verify the device
    async fn check(&self, device: &Device) -> anyhow::Result<()>;
}

/// Per-model recovery from a failed health check
#[async_trait]
pub trait RecoveryHook: Send + Sync + Debug {
    /// Try to bring the device back; the checks run again afterwards
    async fn recover(&self, device: &Device, error: &DeviceError) -> anyhow::Result<()>;
}

/// Sends a command and expects a pattern back
#[derive(Debug, Clone)]
pub struct ResponsiveCheck {
    command: String,
    pattern: String,
    timeout: Duration,
}

impl ResponsiveCheck {
    /// Expect `pattern` within `timeout` after sending `command` plus a newline
    pub fn new<C: Into<String>, P: Into<String>>(command: C, pattern: P, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            pattern: pattern.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthCheck for ResponsiveCheck {
    fn name(&self) -> &str {
        "check_responsive"
    }

    async fn check(&self, device: &Device) -> anyhow::Result<()> {
        let switchboard = device.switchboard().await?;
        let response = switchboard
            .send_and_expect(format!("{}\n", self.command), &[self.pattern.as_str()], self.timeout)
            .await?;
        if response.timed_out {
            anyhow::bail!(
                "no {:?} in response to {:?} within {:?}",
                self.pattern,
                self.command,
                self.timeout
            );
        }
        Ok(())
    }
}

/// Fails if the event parser has seen a bootup nobody asked for
#[derive(Debug, Clone, Default)]
pub struct NoUnexpectedRebootsCheck;

#[async_trait]
impl HealthCheck for NoUnexpectedRebootsCheck {
    fn name(&self) -> &str {
        "check_no_unexpected_reboots"
    }

    async fn check(&self, device: &Device) -> anyhow::Result<()> {
        let reboots = device.event_parser().get_unexpected_reboots();
        if let Some(last) = reboots.last() {
            anyhow::bail!(
                "{} unexpected reboot(s), most recent at {}",
                reboots.len(),
                last.timestamp.to_rfc3339()
            );
        }
        Ok(())
    }
}

/// Recovery that closes and reopens the device's switchboard
#[derive(Debug, Clone, Default)]
pub struct ReopenSwitchboard;

#[async_trait]
impl RecoveryHook for ReopenSwitchboard {
    async fn recover(&self, device: &Device, error: &DeviceError) -> anyhow::Result<()> {
        tracing::info!(device = %device.name(), "Reopening switchboard after: {}", error);
        device.close_switchboard().await?;
        device.switchboard().await?;
        Ok(())
    }
}
