//! WebSocket gateway for industrial controllers.
//!
//! Polls controllers over Modbus TCP and relays values and writes to
//! WebSocket subscribers.

use anyhow::{Context, Result};
use tracing::info;

use plcbridge::{Bridge, PlcBridgeConfig, Server};
use plcbridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("plcbridge.json5");

    let config = PlcBridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = BridgeRunner::new_with_args(plcbridge::bridge::BRIDGE_NAME, config, Some(&args))?;
    info!("Loaded configuration from {:?}", args.config);

    let config = runner.config().clone();
    let (bridge, hub_task) = Bridge::from_config(&config)?;
    runner.spawn(hub_task.run());

    for poller in bridge.pollers(&config.plc) {
        runner.spawn(poller.run());
    }

    let server = Server::bind(
        &config.server.listen,
        bridge.clone(),
        config.server.max_connections,
    )
    .await?;

    info!(
        listen = %config.server.listen,
        controllers = bridge.registry().len(),
        workers = config.plc.workers,
        "Listening for subscribers"
    );
    runner.spawn(server.run());

    runner.run().await?;

    bridge.close_controllers().await;
    Ok(())
}
