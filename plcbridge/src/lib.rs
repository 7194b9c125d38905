//! WebSocket gateway for industrial controllers.
//!
//! The bridge polls configured controllers and pushes each value to the
//! WebSocket subscribers of its tag. Subscribers can also write values,
//! which are acknowledged to the writer and then pushed like polled ones.
//!
//! # Tags
//!
//! ```text
//! <variable>@<controller>
//! ```
//!
//! Where:
//! - `<variable>` - Variable name, resolved by the controller's driver
//! - `<controller>` - Controller id from configuration
//!
//! # Wire protocol
//!
//! ```text
//! -> {"cmd":"subscribe","tag":"X@20"}
//! -> {"cmd":"write","ip":"20","var":"X","value":5}
//! <- {"status":"ok","var":"X","value":5}      (writer only)
//! <- {"tag":"X@20","value":5}                 (every subscriber of X@20)
//! <- {"error":"unknown controller 99"}
//! ```

pub mod bridge;
pub mod config;
pub mod controller;
pub mod hub;
pub mod modbus;
pub mod poller;
pub mod pool;
pub mod relay;
pub mod server;
pub mod simulated;

pub use bridge::Bridge;
pub use config::PlcBridgeConfig;
pub use server::Server;
