//! Assembly of the shared bridge state.

use std::sync::Arc;

use tracing::{info, warn};

use plcbridge_common::ServerMessage;
use plcbridge_framework::{BridgeError, BridgeHealth, Result};

use crate::config::{DriverConfig, PlcBridgeConfig, PlcConfig};
use crate::controller::{Connector, Controller, ControllerRegistry};
use crate::hub::{HubHandle, HubTask};
use crate::modbus::ModbusConnector;
use crate::poller::ControllerPoller;
use crate::pool::WorkerPool;
use crate::relay::{CommandRelay, SequenceTable};
use crate::simulated::SimulatedConnector;

/// Name reported in health snapshots and logs.
pub const BRIDGE_NAME: &str = "plcbridge";

/// Everything a connection, poller or shutdown hook needs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Bridge {
    registry: Arc<ControllerRegistry>,
    hub: HubHandle,
    relay: CommandRelay,
    health: Arc<BridgeHealth>,
    pool: WorkerPool,
    subscriber_buffer: usize,
}

impl Bridge {
    /// Wire up a bridge over an existing registry.
    ///
    /// The returned [`HubTask`] must be spawned for pushes to be delivered.
    pub fn new(
        registry: ControllerRegistry,
        sequences: SequenceTable,
        workers: usize,
        subscriber_buffer: usize,
    ) -> (Self, HubTask) {
        let registry = Arc::new(registry);
        let (hub, hub_task) = HubTask::channel();
        // One worker per controller at least, so a hung controller cannot
        // starve the others.
        if workers < registry.len() {
            warn!(
                workers,
                controllers = registry.len(),
                "Fewer workers than controllers, raising pool size"
            );
        }
        let pool = WorkerPool::new(workers.max(registry.len()));

        let health = Arc::new(BridgeHealth::new(BRIDGE_NAME));
        health.register_controllers(registry.ids());

        let relay = CommandRelay::new(
            registry.clone(),
            sequences,
            pool.clone(),
            hub.clone(),
            health.clone(),
        );

        let bridge = Self {
            registry,
            hub,
            relay,
            health,
            pool,
            subscriber_buffer,
        };
        (bridge, hub_task)
    }

    /// Build controllers and drivers from configuration.
    pub fn from_config(config: &PlcBridgeConfig) -> Result<(Self, HubTask)> {
        let mut registry = ControllerRegistry::new();
        let mut sequences = SequenceTable::new();

        for controller in &config.plc.controllers {
            let connector: Box<dyn Connector> = match &controller.driver {
                DriverConfig::Modbus { unit_id, variables } => {
                    Box::new(ModbusConnector::new(*unit_id, variables.clone()))
                }
                DriverConfig::Simulated { initial } => {
                    Box::new(SimulatedConnector::new(initial.clone()))
                }
            };

            registry
                .insert(Controller::new(controller.identity(), connector))
                .map_err(|e| BridgeError::validation(e.to_string()))?;

            if !controller.sequences.is_empty() {
                sequences.insert(controller.id.clone(), controller.sequences.clone());
            }

            info!(
                controller = %controller.id,
                host = %controller.host,
                port = controller.port,
                watch = controller.watch.len(),
                "Configured controller"
            );
        }

        Ok(Self::new(
            registry,
            sequences,
            config.plc.workers,
            config.server.subscriber_buffer,
        ))
    }

    /// One poller per controller with a non-empty watch list.
    pub fn pollers(&self, plc: &PlcConfig) -> Vec<ControllerPoller> {
        plc.controllers
            .iter()
            .filter(|c| !c.watch.is_empty())
            .filter_map(|c| {
                let controller = self.registry.get(&c.id)?;
                Some(ControllerPoller::new(
                    controller,
                    c.watch.clone(),
                    plc.poll_interval(),
                    self.hub.clone(),
                    self.pool.clone(),
                    self.health.clone(),
                ))
            })
            .collect()
    }

    /// Health snapshot reply for the `health` command.
    pub fn health_report(&self) -> ServerMessage {
        ServerMessage::Health {
            health: serde_json::to_value(self.health.snapshot()).unwrap_or_default(),
            controllers: serde_json::to_value(self.health.all_controller_liveness())
                .unwrap_or_default(),
        }
    }

    /// Close every controller session on the worker pool.
    pub async fn close_controllers(&self) {
        let registry = self.registry.clone();
        if let Err(e) = self.pool.run(move || registry.close_all()).await {
            warn!(error = %e, "Failed to close controller sessions");
        }
    }

    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn relay(&self) -> &CommandRelay {
        &self.relay
    }

    pub fn health(&self) -> &BridgeHealth {
        &self.health
    }

    pub fn subscriber_buffer(&self) -> usize {
        self.subscriber_buffer
    }
}
