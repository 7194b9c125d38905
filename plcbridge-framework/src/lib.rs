//! plcbridge Bridge Framework
//!
//! Common abstractions for running the controller gateway.
//!
//! # Overview
//!
//! This framework provides:
//! - [`BridgeConfig`] trait for configuration loading and validation
//! - [`BridgeRunner`] for managing bridge lifecycle (startup, shutdown, signal handling)
//! - [`BridgeArgs`] for common CLI argument parsing
//! - [`BridgeHealth`] for per-controller liveness and bridge-wide counters
//!
//! # Example
//!
//! ```ignore
//! use plcbridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let args = BridgeArgs::parse_with_default("mybridge.json5");
//!     let config = MyBridgeConfig::load(&args.config)?;
//!
//!     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
//!
//!     // Spawn protocol-specific workers
//!     runner.spawn(my_worker());
//!
//!     // Run until Ctrl+C
//!     runner.run().await?;
//!     Ok(())
//! }
//! ```

mod args;
mod config;
mod error;
pub mod health;
mod runner;

pub use args::BridgeArgs;
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use health::{BridgeHealth, ControllerLiveness, ControllerStatus, HealthSnapshot};
pub use runner::BridgeRunner;

// Re-export commonly used types from plcbridge-common
pub use plcbridge_common::{LogFormat, LoggingConfig};
