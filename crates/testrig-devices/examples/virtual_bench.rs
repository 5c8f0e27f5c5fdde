use std::sync::Arc;
use std::time::Duration;

use testrig_core::config::{Config, SharedConfig};
use testrig_devices::builtin::{SwitchboardCapability, SWITCHBOARD_INTERFACE};
use testrig_devices::communication::StaticComms;
use testrig_devices::detection::CommandQuery;
use testrig_devices::{default_registry, DeviceModelDescriptor, ExtensionPackage, Manager, MatchCriterion, ReadySetting};
use testrig_devices::health::ResponsiveCheck;
use testrig_switchboard::transports::DuplexTransport;
use testrig_switchboard::Transport;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

/// A pretend board that answers a few shell commands
fn virtual_board(address: &str) -> testrig_devices::Result<Box<dyn Transport>> {
    let (transport, device) = DuplexTransport::pair(address);
    tokio::spawn(async move {
        let (read_half, mut write_half) = tokio::io::split(device);
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match line.as_str() {
                "uname -n" => "bench-pi\n",
                "uptime" => " 10:00:01 up 3 days,  2 users,  load average: 0.00, 0.01, 0.05\n",
                _ => "sh: command not found\n",
            };
            if write_half.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });
    Ok(Box::new(transport))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    testrig_core::logging::init_with_filter("debug")?;

    let workdir = std::env::temp_dir().join("testrig-virtual-bench");
    let mut config = Config::default();
    config.general.data_dir = workdir.join("data").display().to_string();
    config.general.log_directory = workdir.join("logs").display().to_string();

    // Registry: built-ins plus one virtual board model
    let mut registry = default_registry(&config)?;
    registry.register(
        ExtensionPackage::new("virtual-bench", "0.1.0")
            .with_communication_type(StaticComms::new(
                "virtual",
                vec!["vbench-0".to_string()],
                virtual_board,
            ))
            .with_detect_query("virtual", CommandQuery::new("hostname", "uname -n", r"^(\S+)$")?)
            .with_model(
                DeviceModelDescriptor::new("bench_pi", "virtual")
                    .with_capability(SWITCHBOARD_INTERFACE, "switchboard_default")
                    .with_criterion("hostname", MatchCriterion::matches("^bench-")?)
                    .with_health_check(ResponsiveCheck::new("uptime", r"load average", Duration::from_secs(2))),
            ),
    )?;

    let manager = Manager::new(SharedConfig::new(config), Arc::new(registry)).await?;
    let report = manager.detect().await?;
    info!("Detected {} devices", report.detected.len());

    for name in manager.devices().await {
        let device = manager.create_device(&name).await?;
        device.make_device_ready(ReadySetting::CheckOnly).await?;

        let console = device
            .capability_as::<SwitchboardCapability>(SWITCHBOARD_INTERFACE)
            .await?;
        console.add_log_note("example run").await?;
        let response = console
            .send_and_expect("uptime\n", &[r"up (\d+) days"], Duration::from_secs(2))
            .await?;
        info!("{} says: {}", name, response.line.unwrap_or_default());
        info!("Device log at {}", device.log_path().display());
    }

    manager.close().await?;
    Ok(())
}
