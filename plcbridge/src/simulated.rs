//! In-memory controller driver.
//!
//! Values live in a store shared by every session the connector opens, so
//! they survive reconnects. Unknown variables read as 0.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::controller::{Connector, ControllerSession, Endpoint, SessionError};

type Memory = Arc<Mutex<HashMap<String, i64>>>;

#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    memory: Memory,
}

impl SimulatedConnector {
    pub fn new(initial: HashMap<String, i64>) -> Self {
        Self {
            memory: Arc::new(Mutex::new(initial)),
        }
    }

    /// Current value of a variable, as a session would read it.
    pub fn value(&self, var: &str) -> i64 {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(var)
            .copied()
            .unwrap_or(0)
    }

    /// Change a value behind the bridge's back, like a process would.
    pub fn set(&self, var: &str, value: i64) {
        self.memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(var.to_string(), value);
    }
}

impl Connector for SimulatedConnector {
    fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn ControllerSession>, SessionError> {
        Ok(Box::new(SimulatedSession {
            connector: self.clone(),
            open: true,
        }))
    }
}

struct SimulatedSession {
    connector: SimulatedConnector,
    open: bool,
}

impl SimulatedSession {
    fn check_open(&self) -> Result<(), SessionError> {
        if self.open {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }
}

impl ControllerSession for SimulatedSession {
    fn read(&mut self, var: &str) -> Result<i64, SessionError> {
        self.check_open()?;
        Ok(self.connector.value(var))
    }

    fn write(&mut self, var: &str, value: i64) -> Result<(), SessionError> {
        self.check_open()?;
        self.connector.set(var, value);
        Ok(())
    }

    fn probe(&mut self) -> Result<(), SessionError> {
        self.check_open()
    }

    fn close(&mut self) {
        self.open = false;
    }
}
