//! Configuration for the controller bridge.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use plcbridge_framework::{BridgeConfig, BridgeError, LoggingConfig, Result};

use crate::controller::ControllerIdentity;

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcBridgeConfig {
    /// Subscriber-facing WebSocket server
    #[serde(default)]
    pub server: ServerConfig,

    /// Controller polling and access settings
    pub plc: PlcConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (default: "0.0.0.0:8777")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Outbound messages buffered per subscriber before it is evicted
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    /// Concurrent connections accepted; extra connections are dropped
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            subscriber_buffer: default_subscriber_buffer(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8777".to_string()
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_max_connections() -> usize {
    256
}

/// Controller-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    /// Sleep between poll cycles in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Size of the blocking worker pool
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Controllers to bridge
    pub controllers: Vec<ControllerConfig>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_workers() -> usize {
    8
}

impl PlcConfig {
    /// Sleep between poll cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration for a single controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller id (used in tags and in write requests)
    pub id: String,

    /// Host address (IP or hostname)
    pub host: String,

    /// TCP port (default: 502)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts per read or write before giving up
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Variables polled every cycle, in order
    #[serde(default)]
    pub watch: Vec<String>,

    /// Protocol driver
    pub driver: DriverConfig,

    /// Named write sequences
    #[serde(default)]
    pub sequences: HashMap<String, Vec<SequenceStep>>,
}

fn default_port() -> u16 {
    502
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_retries() -> u32 {
    2
}

impl ControllerConfig {
    /// Identity of the controller wrapper built from this entry.
    pub fn identity(&self) -> ControllerIdentity {
        ControllerIdentity {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
        }
    }

    /// Whether the driver can address a variable by this name.
    pub fn knows_variable(&self, name: &str) -> bool {
        match &self.driver {
            DriverConfig::Modbus { variables, .. } => variables.contains_key(name),
            DriverConfig::Simulated { .. } => true,
        }
    }

    /// Whether the driver can write a variable by this name.
    pub fn can_write(&self, name: &str) -> bool {
        match &self.driver {
            DriverConfig::Modbus { variables, .. } => variables
                .get(name)
                .is_some_and(|register| register.register_type.is_writable()),
            DriverConfig::Simulated { .. } => true,
        }
    }
}

/// Protocol driver selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriverConfig {
    /// Modbus TCP
    Modbus {
        /// Modbus unit/slave ID (1-247)
        #[serde(default = "default_unit_id")]
        unit_id: u8,
        /// Variable name to register mapping
        #[serde(default)]
        variables: BTreeMap<String, RegisterConfig>,
    },
    /// In-memory controller, for bench runs without hardware
    Simulated {
        /// Initial variable values
        #[serde(default)]
        initial: HashMap<String, i64>,
    },
}

fn default_unit_id() -> u8 {
    1
}

/// Location of a variable in Modbus address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Register type
    #[serde(rename = "type")]
    pub register_type: RegisterType,

    /// Address (0-based)
    pub address: u16,

    /// Word interpretation for input and holding registers
    #[serde(default)]
    pub data_type: DataType,
}

/// Modbus register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    /// Discrete output coils (read/write, 1-bit)
    Coil,
    /// Discrete input contacts (read-only, 1-bit)
    Discrete,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl RegisterType {
    /// Return the string name for this register type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
            RegisterType::Input => "input",
            RegisterType::Holding => "holding",
        }
    }

    /// Whether values can be written to this register type.
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }
}

/// Integer interpretation of 16-bit registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    U16,
    /// Signed 16-bit integer
    I16,
    /// Unsigned 32-bit integer (2 registers, big-endian)
    U32,
    /// Signed 32-bit integer (2 registers, big-endian)
    I32,
    /// Unsigned 32-bit integer (2 registers, little-endian word order)
    U32Le,
    /// Signed 32-bit integer (2 registers, little-endian word order)
    I32Le,
}

impl DataType {
    /// Number of 16-bit registers one value occupies.
    pub fn word_count(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            _ => 2,
        }
    }
}

/// One step of a write sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceStep {
    /// Write a value to a variable
    Write { var: String, value: i64 },
    /// Pause before the next step
    Delay { delay_ms: u64 },
}

impl BridgeConfig for PlcBridgeConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> Result<()> {
        self.server
            .listen
            .parse::<SocketAddr>()
            .map_err(|e| BridgeError::validation(format!("server.listen: {}", e)))?;

        if self.server.subscriber_buffer == 0 {
            return Err(BridgeError::validation(
                "server.subscriber_buffer must be at least 1",
            ));
        }

        if self.server.max_connections == 0 {
            return Err(BridgeError::validation(
                "server.max_connections must be at least 1",
            ));
        }

        if self.plc.workers == 0 {
            return Err(BridgeError::validation("plc.workers must be at least 1"));
        }

        if self.plc.controllers.is_empty() {
            return Err(BridgeError::validation(
                "At least one controller must be configured",
            ));
        }

        let mut seen = HashSet::new();
        for controller in &self.plc.controllers {
            validate_controller(controller)?;

            if !seen.insert(controller.id.as_str()) {
                return Err(BridgeError::validation(format!(
                    "Duplicate controller id '{}'",
                    controller.id
                )));
            }
        }

        Ok(())
    }
}

fn validate_controller(controller: &ControllerConfig) -> Result<()> {
    let id = &controller.id;

    if id.trim().is_empty() {
        return Err(BridgeError::validation("Controller id cannot be empty"));
    }

    if controller.host.is_empty() {
        return Err(BridgeError::validation(format!(
            "Controller '{}': host cannot be empty",
            id
        )));
    }

    if controller.retries == 0 {
        return Err(BridgeError::validation(format!(
            "Controller '{}': retries must be at least 1",
            id
        )));
    }

    if let DriverConfig::Modbus { unit_id, .. } = &controller.driver {
        if *unit_id == 0 || *unit_id > 247 {
            return Err(BridgeError::validation(format!(
                "Controller '{}': unit_id must be 1-247",
                id
            )));
        }
    }

    for var in &controller.watch {
        if !controller.knows_variable(var) {
            return Err(BridgeError::validation(format!(
                "Controller '{}': watched variable '{}' is not defined",
                id, var
            )));
        }
    }

    for (name, steps) in &controller.sequences {
        if name.is_empty() || steps.is_empty() {
            return Err(BridgeError::validation(format!(
                "Controller '{}': sequence '{}' must have a name and at least one step",
                id, name
            )));
        }

        for step in steps {
            if let SequenceStep::Write { var, .. } = step {
                if !controller.can_write(var) {
                    return Err(BridgeError::validation(format!(
                        "Controller '{}': sequence '{}' writes undefined or read-only variable '{}'",
                        id, name, var
                    )));
                }
            }
        }
    }

    Ok(())
}
