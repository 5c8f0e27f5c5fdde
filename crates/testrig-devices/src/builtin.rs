/*!
 * The built-in extension package.
 *
 * Provides the `switchboard` and `event_parser` capabilities every model can
 * declare, and the standard communication types with their basic detection
 * queries.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use testrig_core::config::Config;
use testrig_switchboard::{EventParser, ExpectResponse, LogEvent};

use crate::capability::{Capability, CapabilityContext, CapabilityFlavor, CapabilityInterface};
use crate::communication::{AdbComms, PtyProcessComms, SerialComms, SshComms, ADB, PTY_PROCESS, SERIAL, SSH};
use crate::detection::{AlwaysTrue, CommandQuery, PathExists, ProgramName};
use crate::error::Result;
use crate::extension::ExtensionPackage;
use crate::session::SwitchboardSlot;

/// Name of the built-in package
pub const BUILTIN_PACKAGE: &str = "testrig-builtin";

/// Interface for raw console access
pub const SWITCHBOARD_INTERFACE: &str = "switchboard";
/// Interface for querying parsed log events
pub const EVENT_PARSER_INTERFACE: &str = "event_parser";

const SWITCHBOARD_OPERATIONS: [&str; 6] = [
    "send",
    "expect",
    "send_and_expect",
    "add_log_note",
    "start_new_log",
    "close",
];
const EVENT_PARSER_OPERATIONS: [&str; 3] = ["get_last_events", "get_last_event", "get_unexpected_reboots"];

/// Console access through the device's switchboard
#[derive(Debug)]
pub struct SwitchboardCapability {
    slot: Arc<SwitchboardSlot>,
}

impl SwitchboardCapability {
    /// Write bytes to the device
    pub async fn send<D: AsRef<[u8]>>(&self, data: D) -> Result<()> {
        Ok(self.slot.get().await?.send(data).await?)
    }

    /// Wait for a line matching one of `patterns`
    pub async fn expect<S: AsRef<str>>(&self, patterns: &[S], timeout: Duration) -> Result<ExpectResponse> {
        Ok(self.slot.get().await?.expect(patterns, timeout).await?)
    }

    /// Send, then wait for a response
    pub async fn send_and_expect<D, S>(&self, data: D, patterns: &[S], timeout: Duration) -> Result<ExpectResponse>
    where
        D: AsRef<[u8]>,
        S: AsRef<str>,
    {
        Ok(self.slot.get().await?.send_and_expect(data, patterns, timeout).await?)
    }

    /// Write a host note into the device log
    pub async fn add_log_note<S: AsRef<str>>(&self, note: S) -> Result<()> {
        Ok(self.slot.get().await?.add_log_note(note).await?)
    }

    /// Continue logging in a new file
    pub async fn start_new_log<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        Ok(self.slot.get().await?.start_new_log(path).await?)
    }

    /// Close the session
    pub async fn close(&self) -> Result<()> {
        self.slot.close().await
    }
}

impl Capability for SwitchboardCapability {
    fn interface(&self) -> &str {
        SWITCHBOARD_INTERFACE
    }

    fn flavor(&self) -> &str {
        "switchboard_default"
    }

    fn operations(&self) -> Vec<&'static str> {
        SWITCHBOARD_OPERATIONS.to_vec()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[derive(Debug, Clone, Default)]
struct SwitchboardDefault;

#[async_trait]
impl CapabilityFlavor for SwitchboardDefault {
    fn name(&self) -> &str {
        "switchboard_default"
    }

    fn interface(&self) -> &str {
        SWITCHBOARD_INTERFACE
    }

    fn operations(&self) -> Vec<&'static str> {
        SWITCHBOARD_OPERATIONS.to_vec()
    }

    async fn build(&self, context: &CapabilityContext) -> Result<Arc<dyn Capability>> {
        Ok(Arc::new(SwitchboardCapability {
            slot: Arc::clone(&context.switchboard),
        }))
    }
}

/// Parsed events of one device
#[derive(Debug)]
pub struct EventParserCapability {
    parser: Arc<EventParser>,
}

impl EventParserCapability {
    /// Most recent events with the given labels, newest first
    pub fn get_last_events(&self, labels: &[&str], count: usize) -> Vec<LogEvent> {
        self.parser.get_last_events(labels, count)
    }

    /// Most recent event with a label
    pub fn get_last_event(&self, label: &str) -> Option<LogEvent> {
        self.parser.get_last_event(label)
    }

    /// Bootups no reboot request explains
    pub fn get_unexpected_reboots(&self) -> Vec<LogEvent> {
        self.parser.get_unexpected_reboots()
    }
}

impl Capability for EventParserCapability {
    fn interface(&self) -> &str {
        EVENT_PARSER_INTERFACE
    }

    fn flavor(&self) -> &str {
        "event_parser_default"
    }

    fn operations(&self) -> Vec<&'static str> {
        EVENT_PARSER_OPERATIONS.to_vec()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

#[derive(Debug, Clone, Default)]
struct EventParserDefault;

#[async_trait]
impl CapabilityFlavor for EventParserDefault {
    fn name(&self) -> &str {
        "event_parser_default"
    }

    fn interface(&self) -> &str {
        EVENT_PARSER_INTERFACE
    }

    fn operations(&self) -> Vec<&'static str> {
        EVENT_PARSER_OPERATIONS.to_vec()
    }

    async fn build(&self, context: &CapabilityContext) -> Result<Arc<dyn Capability>> {
        Ok(Arc::new(EventParserCapability {
            parser: Arc::clone(&context.event_parser),
        }))
    }
}

/// The package every registry starts with
pub fn builtin_package(config: &Config) -> Result<ExtensionPackage> {
    let ssh_product = CommandQuery::new("product_name", "cat /proc/device-tree/model", r"^(\S.*)$")?
        .with_timeout(config.detection.query_timeout());

    Ok(ExtensionPackage::new(BUILTIN_PACKAGE, crate::VERSION)
        .with_interface(CapabilityInterface::new(SWITCHBOARD_INTERFACE, SWITCHBOARD_OPERATIONS))
        .with_interface(CapabilityInterface::new(EVENT_PARSER_INTERFACE, EVENT_PARSER_OPERATIONS))
        .with_flavor(SwitchboardDefault)
        .with_flavor(EventParserDefault)
        .with_communication_type(SerialComms::default())
        .with_communication_type(SshComms::new(config.detection.static_ips.clone()))
        .with_communication_type(AdbComms::default())
        .with_communication_type(PtyProcessComms::default())
        .with_detect_query(SERIAL, AlwaysTrue)
        .with_detect_query(SERIAL, PathExists::new("port_exists"))
        .with_detect_query(SSH, AlwaysTrue)
        .with_detect_query(SSH, ssh_product)
        .with_detect_query(ADB, AlwaysTrue)
        .with_detect_query(PTY_PROCESS, AlwaysTrue)
        .with_detect_query(PTY_PROCESS, ProgramName::new("product_name")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityResolver;
    use crate::communication::StaticComms;
    use crate::detection::{MatchCriterion, ALWAYS_TRUE};
    use crate::device::Device;
    use crate::error::DeviceError;
    use crate::extension::DeviceModelDescriptor;
    use crate::records::DeviceRecord;
    use crate::registry::ExtensionRegistry;
    use tempfile::tempdir;
    use testrig_core::types::DeviceConfig;
    use testrig_switchboard::transports::DuplexTransport;
    use testrig_switchboard::Transport;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn registry() -> ExtensionRegistry {
        let comms = StaticComms::new("virtual", vec!["v1".to_string()], |address| {
            let (transport, device) = DuplexTransport::pair(address);
            tokio::spawn(async move {
                let (read_half, mut write_half) = tokio::io::split(device);
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = write_half.write_all(format!("you said {}\n", line).as_bytes()).await;
                }
            });
            Ok(Box::new(transport) as Box<dyn Transport>)
        });

        let mut registry = ExtensionRegistry::new();
        registry.register(builtin_package(&Config::default()).unwrap()).unwrap();
        registry
            .register(
                ExtensionPackage::new("bench", "1.0")
                    .with_communication_type(comms)
                    .with_detect_query("virtual", AlwaysTrue)
                    .with_model(
                        DeviceModelDescriptor::new("console_board", "virtual")
                            .with_capability(SWITCHBOARD_INTERFACE, "switchboard_default")
                            .with_capability(EVENT_PARSER_INTERFACE, "event_parser_default")
                            .with_criterion(ALWAYS_TRUE, MatchCriterion::Equals(true)),
                    )
                    .with_model(
                        DeviceModelDescriptor::new("mute_board", "virtual")
                            .with_criterion(ALWAYS_TRUE, MatchCriterion::Equals(true)),
                    ),
            )
            .unwrap();
        registry
    }

    fn device(registry: &Arc<ExtensionRegistry>, resolver: &Arc<CapabilityResolver>, model: &str, dir: &Path) -> Device {
        let mut config = Config::default();
        config.general.log_directory = dir.display().to_string();
        let record = DeviceRecord::new(&format!("{}-00v1", model), model, "virtual", "v1", "00v1");
        Device::new(record, DeviceConfig::new(), registry, Arc::clone(resolver), &config).unwrap()
    }

    #[test]
    fn test_builtin_package_registers() {
        let registry = registry();
        let snapshot = registry.export();
        assert_eq!(
            snapshot.communication_types,
            vec!["serial", "ssh", "adb", "pty_process", "virtual"]
        );
        assert_eq!(snapshot.capability_flavors["switchboard_default"].operations.len(), 6);
        assert_eq!(snapshot.detect_criteria["ssh"], vec!["always_true", "product_name"]);
    }

    #[tokio::test]
    async fn test_resolution_is_cached_per_device_instance() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(registry());
        let resolver = Arc::new(CapabilityResolver::new(Arc::clone(&registry)));
        let board = device(&registry, &resolver, "console_board", dir.path());

        let first = board.capability(SWITCHBOARD_INTERFACE).await.unwrap();
        let second = board.capability(SWITCHBOARD_INTERFACE).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        for operation in registry.interface(SWITCHBOARD_INTERFACE).unwrap().operations.iter() {
            assert!(first.operations().contains(&operation.as_str()));
        }

        let console = board
            .capability_as::<SwitchboardCapability>(SWITCHBOARD_INTERFACE)
            .await
            .unwrap();
        let response = console
            .send_and_expect("hello\n", &["you said (\\w+)"], Duration::from_secs(2))
            .await
            .unwrap();
        assert!(response.is_match());
        assert_eq!(response.line.as_deref(), Some("you said hello"));

        let events = board
            .capability_as::<EventParserCapability>(EVENT_PARSER_INTERFACE)
            .await
            .unwrap();
        console.add_log_note("manual check").await.unwrap();
        assert!(events.get_unexpected_reboots().is_empty());
        assert!(matches!(
            board
                .capability_as::<EventParserCapability>(SWITCHBOARD_INTERFACE)
                .await,
            Err(DeviceError::CapabilityNotReady { .. })
        ));

        // Another handle on the same device gets its own instances
        let other = device(&registry, &resolver, "console_board", dir.path());
        let third = other.capability(SWITCHBOARD_INTERFACE).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        assert_eq!(
            resolver.cached_interfaces(board.instance_id()),
            vec![EVENT_PARSER_INTERFACE.to_string(), SWITCHBOARD_INTERFACE.to_string()]
        );
        board.close().await.unwrap();
        assert!(resolver.cached_interfaces(board.instance_id()).is_empty());
        other.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_undeclared_capability_is_not_ready() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(registry());
        let resolver = Arc::new(CapabilityResolver::new(Arc::clone(&registry)));
        let board = device(&registry, &resolver, "mute_board", dir.path());

        assert!(!board.has_capability(SWITCHBOARD_INTERFACE));
        let err = board.capability(SWITCHBOARD_INTERFACE).await.unwrap_err();
        match err {
            DeviceError::CapabilityNotReady { interface, .. } => assert_eq!(interface, SWITCHBOARD_INTERFACE),
            other => panic!("unexpected error {}", other),
        }
    }
}
