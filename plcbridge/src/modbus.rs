//! Modbus TCP driver.
//!
//! Variables are resolved by name to a register address once, from
//! configuration. Calls use the blocking client with the controller's
//! timeout applied to every request.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tokio_modbus::client::sync::{self, Context, Reader, Writer};
use tokio_modbus::prelude::Slave;

use crate::config::{DataType, RegisterConfig, RegisterType};
use crate::controller::{Connector, ControllerSession, Endpoint, SessionError};

/// Opens Modbus TCP sessions for one unit id.
#[derive(Debug, Clone)]
pub struct ModbusConnector {
    unit_id: u8,
    variables: Arc<BTreeMap<String, RegisterConfig>>,
}

impl ModbusConnector {
    pub fn new(unit_id: u8, variables: BTreeMap<String, RegisterConfig>) -> Self {
        Self {
            unit_id,
            variables: Arc::new(variables),
        }
    }
}

impl Connector for ModbusConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ControllerSession>, SessionError> {
        let addr = resolve(endpoint)?;
        let ctx = sync::tcp::connect_slave_with_timeout(
            addr,
            Slave(self.unit_id),
            Some(endpoint.timeout),
        )
        .map_err(|e| transport_error(e, endpoint.timeout))?;

        Ok(Box::new(ModbusSession {
            ctx: Some(ctx),
            variables: self.variables.clone(),
            timeout: endpoint.timeout,
        }))
    }
}

fn resolve(endpoint: &Endpoint) -> Result<SocketAddr, SessionError> {
    (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            SessionError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}:{}", endpoint.host, endpoint.port),
            ))
        })
}

struct ModbusSession {
    ctx: Option<Context>,
    variables: Arc<BTreeMap<String, RegisterConfig>>,
    timeout: Duration,
}

impl ModbusSession {
    fn register(&self, var: &str) -> Result<RegisterConfig, SessionError> {
        self.variables
            .get(var)
            .copied()
            .ok_or_else(|| SessionError::UnknownVariable(var.to_string()))
    }

    fn context(&mut self) -> Result<&mut Context, SessionError> {
        self.ctx.as_mut().ok_or(SessionError::NotConnected)
    }
}

impl ControllerSession for ModbusSession {
    fn read(&mut self, var: &str) -> Result<i64, SessionError> {
        let register = self.register(var)?;
        let timeout = self.timeout;
        read_register(self.context()?, &register, timeout)
    }

    fn write(&mut self, var: &str, value: i64) -> Result<(), SessionError> {
        let register = self.register(var)?;
        let timeout = self.timeout;
        let ctx = self.context()?;
        let address = register.address;

        match register.register_type {
            RegisterType::Coil => flatten(ctx.write_single_coil(address, value != 0), timeout),
            RegisterType::Holding => {
                let words = encode_words(register.data_type, value).ok_or_else(|| {
                    SessionError::Unsupported(format!(
                        "value {} does not fit {:?} at {}",
                        value, register.data_type, var
                    ))
                })?;

                match words.as_slice() {
                    [word] => flatten(ctx.write_single_register(address, *word), timeout),
                    _ => flatten(ctx.write_multiple_registers(address, &words), timeout),
                }
            }
            RegisterType::Input | RegisterType::Discrete => Err(SessionError::Unsupported(
                format!("{} is a read-only {} register", var, register.register_type.as_str()),
            )),
        }
    }

    fn probe(&mut self) -> Result<(), SessionError> {
        let first = self.variables.values().next().copied();
        let timeout = self.timeout;
        let ctx = self.context()?;

        match first {
            Some(register) => read_register(ctx, &register, timeout).map(|_| ()),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        // Dropping the context closes the socket.
        self.ctx = None;
    }
}

fn read_register(
    ctx: &mut Context,
    register: &RegisterConfig,
    timeout: Duration,
) -> Result<i64, SessionError> {
    let address = register.address;

    match register.register_type {
        RegisterType::Coil => first_bit(flatten(ctx.read_coils(address, 1), timeout)?),
        RegisterType::Discrete => {
            first_bit(flatten(ctx.read_discrete_inputs(address, 1), timeout)?)
        }
        RegisterType::Input => {
            let words = flatten(
                ctx.read_input_registers(address, register.data_type.word_count()),
                timeout,
            )?;
            decode_words(register.data_type, &words)
                .ok_or_else(|| SessionError::Protocol("short register response".to_string()))
        }
        RegisterType::Holding => {
            let words = flatten(
                ctx.read_holding_registers(address, register.data_type.word_count()),
                timeout,
            )?;
            decode_words(register.data_type, &words)
                .ok_or_else(|| SessionError::Protocol("short register response".to_string()))
        }
    }
}

fn first_bit(bits: Vec<bool>) -> Result<i64, SessionError> {
    bits.first()
        .map(|bit| i64::from(*bit))
        .ok_or_else(|| SessionError::Protocol("empty coil response".to_string()))
}

fn flatten<T>(result: tokio_modbus::Result<T>, timeout: Duration) -> Result<T, SessionError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(SessionError::Exception(format!("{:?}", exception))),
        Err(tokio_modbus::Error::Transport(e)) => Err(transport_error(e, timeout)),
        Err(e) => Err(SessionError::Protocol(e.to_string())),
    }
}

fn transport_error(error: io::Error, timeout: Duration) -> SessionError {
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SessionError::Timeout(timeout),
        _ => SessionError::Io(error),
    }
}

/// Decode register words into an integer.
pub fn decode_words(data_type: DataType, words: &[u16]) -> Option<i64> {
    let pair = |hi: u16, lo: u16| (u32::from(hi) << 16) | u32::from(lo);

    match (data_type, words) {
        (DataType::U16, [w, ..]) => Some(i64::from(*w)),
        (DataType::I16, [w, ..]) => Some(i64::from(*w as i16)),
        (DataType::U32, [hi, lo, ..]) => Some(i64::from(pair(*hi, *lo))),
        (DataType::I32, [hi, lo, ..]) => Some(i64::from(pair(*hi, *lo) as i32)),
        (DataType::U32Le, [lo, hi, ..]) => Some(i64::from(pair(*hi, *lo))),
        (DataType::I32Le, [lo, hi, ..]) => Some(i64::from(pair(*hi, *lo) as i32)),
        _ => None,
    }
}

/// Encode an integer into register words. `None` if it does not fit.
pub fn encode_words(data_type: DataType, value: i64) -> Option<Vec<u16>> {
    let split = |bits: u32| ((bits >> 16) as u16, bits as u16);

    match data_type {
        DataType::U16 => u16::try_from(value).ok().map(|w| vec![w]),
        DataType::I16 => i16::try_from(value).ok().map(|w| vec![w as u16]),
        DataType::U32 => u32::try_from(value).ok().map(|v| {
            let (hi, lo) = split(v);
            vec![hi, lo]
        }),
        DataType::I32 => i32::try_from(value).ok().map(|v| {
            let (hi, lo) = split(v as u32);
            vec![hi, lo]
        }),
        DataType::U32Le => u32::try_from(value).ok().map(|v| {
            let (hi, lo) = split(v);
            vec![lo, hi]
        }),
        DataType::I32Le => i32::try_from(value).ok().map(|v| {
            let (hi, lo) = split(v as u32);
            vec![lo, hi]
        }),
    }
}
