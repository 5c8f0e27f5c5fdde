/*!
 * Communication types.
 *
 * A communication type knows how to enumerate the addresses reachable over it
 * right now, and how to build the transport for one of those addresses. SSH and
 * ADB sessions are realised as child processes; the core never speaks either
 * protocol itself.
 */
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use testrig_core::config::SwitchboardConfig;
use testrig_switchboard::transports::ProcessTransport;
use testrig_switchboard::{SwitchboardOptions, Transport};

use crate::error::{DeviceError, Result};
use crate::keys::{check_key, KeyInfo};

/// Name of the built-in serial communication type
pub const SERIAL: &str = "serial";
/// Name of the built-in SSH communication type
pub const SSH: &str = "ssh";
/// Name of the built-in ADB communication type
pub const ADB: &str = "adb";
/// Name of the built-in process communication type
pub const PTY_PROCESS: &str = "pty_process";

/// Options passed to every `ssh` invocation
pub const DEFAULT_SSH_OPTIONS: &[&str] = &[
    "-oPasswordAuthentication=no",
    "-oStrictHostKeyChecking=no",
    "-oBatchMode=yes",
    "-oConnectTimeout=3",
    "-oServerAliveInterval=3",
];

/// A way of reaching devices
#[async_trait]
pub trait CommunicationType: Send + Sync + Debug {
    /// Unique name of the communication type
    fn name(&self) -> &str;

    /// Addresses reachable over this communication type right now
    async fn list_addresses(&self) -> Result<Vec<String>>;

    /// Build the transport for a device at `address`
    fn transport(&self, address: &str) -> Result<Box<dyn Transport>>;

    /// Switchboard settings for devices on this communication type
    fn switchboard_options(&self, log_path: PathBuf, config: &SwitchboardConfig) -> Result<SwitchboardOptions> {
        Ok(SwitchboardOptions::from_config(config, log_path)?)
    }
}

/// Devices on a serial port
#[derive(Debug, Clone)]
pub struct SerialComms {
    baudrate: u32,
}

impl SerialComms {
    /// Serial comms at `baudrate`
    pub fn new(baudrate: u32) -> Self {
        Self { baudrate }
    }
}

impl Default for SerialComms {
    fn default() -> Self {
        Self::new(115_200)
    }
}

#[async_trait]
impl CommunicationType for SerialComms {
    fn name(&self) -> &str {
        SERIAL
    }

    async fn list_addresses(&self) -> Result<Vec<String>> {
        #[cfg(feature = "serial")]
        {
            Ok(testrig_switchboard::transports::serial::available_ports()?)
        }
        #[cfg(not(feature = "serial"))]
        {
            Ok(Vec::new())
        }
    }

    fn transport(&self, address: &str) -> Result<Box<dyn Transport>> {
        #[cfg(feature = "serial")]
        {
            Ok(Box::new(testrig_switchboard::transports::SerialTransport::new(
                address,
                self.baudrate,
            )))
        }
        #[cfg(not(feature = "serial"))]
        {
            Err(DeviceError::device(
                address,
                format!("serial support is not compiled in (baudrate {})", self.baudrate),
            ))
        }
    }
}

/// Devices reached with `ssh`
#[derive(Debug, Clone)]
pub struct SshComms {
    static_ips: Vec<String>,
    username: String,
    options: Vec<String>,
    key: Option<KeyInfo>,
    key_dir: PathBuf,
}

impl SshComms {
    /// SSH comms over a configured list of addresses
    pub fn new(static_ips: Vec<String>) -> Self {
        Self {
            static_ips,
            username: "root".to_string(),
            options: DEFAULT_SSH_OPTIONS.iter().map(|s| s.to_string()).collect(),
            key: None,
            key_dir: PathBuf::new(),
        }
    }

    /// Log in as `username`
    pub fn with_username<S: Into<String>>(mut self, username: S) -> Self {
        self.username = username.into();
        self
    }

    /// Authenticate with a package key stored under `key_dir`
    pub fn with_key<P: AsRef<Path>>(mut self, key: KeyInfo, key_dir: P) -> Self {
        self.key = Some(key);
        self.key_dir = key_dir.as_ref().to_path_buf();
        self
    }

    fn command_args(&self, address: &str) -> Result<Vec<String>> {
        let mut args = self.options.clone();
        if let Some(key) = &self.key {
            let path = check_key(key, &self.key_dir)?;
            args.push("-i".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        args.push(format!("{}@{}", self.username, address));
        Ok(args)
    }
}

#[async_trait]
impl CommunicationType for SshComms {
    fn name(&self) -> &str {
        SSH
    }

    async fn list_addresses(&self) -> Result<Vec<String>> {
        Ok(self.static_ips.clone())
    }

    fn transport(&self, address: &str) -> Result<Box<dyn Transport>> {
        let args = self.command_args(address)?;
        Ok(Box::new(ProcessTransport::new(address, "ssh", args)))
    }
}

/// Android devices reached with `adb`
#[derive(Debug, Clone)]
pub struct AdbComms {
    adb_path: String,
}

impl AdbComms {
    /// ADB comms using the `adb` binary at `adb_path`
    pub fn new<S: Into<String>>(adb_path: S) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }
}

impl Default for AdbComms {
    fn default() -> Self {
        Self::new("adb")
    }
}

/// Serials of the devices listed by `adb devices` that are ready for use
pub fn parse_adb_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl CommunicationType for AdbComms {
    fn name(&self) -> &str {
        ADB
    }

    async fn list_addresses(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.adb_path).arg("devices").output().await?;
        if !output.status.success() {
            return Err(DeviceError::detection(format!(
                "{} devices exited with {}",
                self.adb_path, output.status
            )));
        }
        let addresses = parse_adb_devices(&String::from_utf8_lossy(&output.stdout));
        debug!("adb reports {} devices", addresses.len());
        Ok(addresses)
    }

    fn transport(&self, address: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(ProcessTransport::new(
            address,
            self.adb_path.clone(),
            ["-s", address, "shell"],
        )))
    }
}

/// Devices that are local processes; the address is the command line
#[derive(Debug, Clone, Default)]
pub struct PtyProcessComms {
    commands: Vec<String>,
}

impl PtyProcessComms {
    /// Process comms over a configured list of command lines
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl CommunicationType for PtyProcessComms {
    fn name(&self) -> &str {
        PTY_PROCESS
    }

    async fn list_addresses(&self) -> Result<Vec<String>> {
        Ok(self.commands.clone())
    }

    fn transport(&self, address: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(ProcessTransport::from_command_line(address, address)?))
    }
}

/// Builds a transport for an address
pub type TransportFactory = Arc<dyn Fn(&str) -> Result<Box<dyn Transport>> + Send + Sync>;

/// A fixed address list with a caller-supplied transport factory
///
/// Used for virtual devices and for scripting devices in tests.
#[derive(Clone)]
pub struct StaticComms {
    name: String,
    addresses: Vec<String>,
    factory: TransportFactory,
}

impl StaticComms {
    /// Create a static communication type
    pub fn new<N, F>(name: N, addresses: Vec<String>, factory: F) -> Self
    where
        N: Into<String>,
        F: Fn(&str) -> Result<Box<dyn Transport>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            addresses,
            factory: Arc::new(factory),
        }
    }
}

impl Debug for StaticComms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticComms")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CommunicationType for StaticComms {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_addresses(&self) -> Result<Vec<String>> {
        Ok(self.addresses.clone())
    }

    fn transport(&self, address: &str) -> Result<Box<dyn Transport>> {
        (self.factory)(address)
    }
}
