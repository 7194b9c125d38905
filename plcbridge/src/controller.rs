//! Resilient access to a single controller.
//!
//! A [`Controller`] owns one protocol session behind a mutex, so reads and
//! writes to the same controller never interleave. Failed calls are retried
//! after probing the session; a session that fails its probe is closed and
//! replaced before the next attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by a controller session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("controller exception: {0}")]
    Exception(String),

    #[error("unknown variable {0}")]
    UnknownVariable(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("not connected")]
    NotConnected,
}

impl SessionError {
    /// Whether another attempt on a (possibly fresh) session could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout(_)
                | SessionError::Io(_)
                | SessionError::Protocol(_)
                | SessionError::NotConnected
        )
    }
}

/// Network location of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

/// Static identity of a controller wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    /// Id used in tags and write requests.
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Total attempts per read or write.
    pub retries: u32,
}

impl ControllerIdentity {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            timeout: self.timeout,
        }
    }
}

/// An open protocol session. All calls block.
pub trait ControllerSession: Send {
    /// Read a variable by name.
    fn read(&mut self, var: &str) -> Result<i64, SessionError>;

    /// Write a variable by name.
    fn write(&mut self, var: &str, value: i64) -> Result<(), SessionError>;

    /// Cheap round trip used to decide whether the session is still usable.
    fn probe(&mut self) -> Result<(), SessionError>;

    /// Release the underlying connection.
    fn close(&mut self);
}

/// Opens sessions for a protocol driver.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ControllerSession>, SessionError>;
}

type SessionSlot = Option<Box<dyn ControllerSession>>;

/// Serialized, self-healing access to one controller.
///
/// All methods block and must run on the worker pool, never on the event
/// loop.
pub struct Controller {
    identity: ControllerIdentity,
    connector: Box<dyn Connector>,
    session: Mutex<SessionSlot>,
    /// Held by the one call allowed to wait for a worker.
    turn: tokio::sync::Mutex<()>,
}

impl Controller {
    /// Create a controller wrapper. The session is opened on first use.
    pub fn new(identity: ControllerIdentity, connector: Box<dyn Connector>) -> Self {
        Self {
            identity,
            connector,
            session: Mutex::new(None),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &ControllerIdentity {
        &self.identity
    }

    /// Wait until no other call for this controller is queued on or
    /// running in the worker pool.
    pub async fn wait_turn(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.turn.lock().await
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.lock_session().is_some()
    }

    /// Read a variable, retrying on transient failures.
    pub fn read(&self, var: &str) -> Result<i64, SessionError> {
        self.with_retry("read", var, |session| session.read(var))
    }

    /// Write a variable, retrying on transient failures.
    pub fn write(&self, var: &str, value: i64) -> Result<(), SessionError> {
        self.with_retry("write", var, |session| session.write(var, value))
    }

    /// Close the current session, if any.
    pub fn close(&self) {
        if let Some(mut session) = self.lock_session().take() {
            session.close();
            info!(controller = %self.identity.id, "Session closed");
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, SessionSlot> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_retry<T>(
        &self,
        op: &'static str,
        var: &str,
        mut call: impl FnMut(&mut dyn ControllerSession) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let attempts = self.identity.retries.max(1);
        let mut slot = self.lock_session();
        let mut attempt = 1;

        loop {
            let error = match self.attempt(&mut slot, &mut call) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            self.ensure_alive(&mut slot);

            if attempt >= attempts {
                warn!(
                    controller = %self.identity.id,
                    op,
                    var,
                    attempts,
                    error = %error,
                    "Giving up"
                );
                return Err(error);
            }

            debug!(
                controller = %self.identity.id,
                op,
                var,
                attempt,
                error = %error,
                "Retrying"
            );
            attempt += 1;
        }
    }

    fn attempt<T>(
        &self,
        slot: &mut SessionSlot,
        call: &mut impl FnMut(&mut dyn ControllerSession) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        if slot.is_none() {
            *slot = Some(self.connect()?);
        }

        match slot.as_mut() {
            Some(session) => call(session.as_mut()),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Probe the session and replace it if the probe fails.
    fn ensure_alive(&self, slot: &mut SessionSlot) {
        let Some(session) = slot.as_mut() else {
            return;
        };

        let Err(e) = session.probe() else {
            return;
        };

        warn!(controller = %self.identity.id, error = %e, "Probe failed, reconnecting");

        if let Some(mut stale) = slot.take() {
            stale.close();
        }

        match self.connect() {
            Ok(fresh) => *slot = Some(fresh),
            Err(e) => {
                warn!(controller = %self.identity.id, error = %e, "Reconnect failed");
            }
        }
    }

    fn connect(&self) -> Result<Box<dyn ControllerSession>, SessionError> {
        let endpoint = self.identity.endpoint();
        let session = self.connector.connect(&endpoint)?;
        info!(
            controller = %self.identity.id,
            host = %endpoint.host,
            port = endpoint.port,
            "Connected to controller"
        );
        Ok(session)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// A second controller was registered under an existing id.
#[derive(Debug, Error)]
#[error("duplicate controller id '{0}'")]
pub struct DuplicateController(pub String);

/// Controllers by id.
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    controllers: HashMap<String, Arc<Controller>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller. Ids must be unique.
    pub fn insert(&mut self, controller: Controller) -> Result<Arc<Controller>, DuplicateController> {
        let id = controller.id().to_string();
        if self.controllers.contains_key(&id) {
            return Err(DuplicateController(id));
        }

        let controller = Arc::new(controller);
        self.controllers.insert(id, controller.clone());
        Ok(controller)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Controller>> {
        self.controllers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.controllers.contains_key(id)
    }

    /// Controller ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.controllers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Close every open session. Blocks while in-flight calls finish.
    pub fn close_all(&self) {
        for controller in self.controllers.values() {
            controller.close();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Counters, Script, Step, scripted};
    use super::*;

    #[test]
    fn test_connects_lazily() {
        let (controller, counters) = scripted("20", 2, vec![]);
        assert!(!controller.is_connected());
        assert_eq!(Counters::get(&counters.connects), 0);

        assert_eq!(controller.read("X").unwrap(), 1);
        assert!(controller.is_connected());
        assert_eq!(Counters::get(&counters.connects), 1);

        controller.read("X").unwrap();
        assert_eq!(Counters::get(&counters.connects), 1);
    }

    #[test]
    fn test_failed_probe_reconnects_once() {
        let stale = Script {
            calls: vec![Step::Reset],
            probes: vec![Step::Reset],
        };
        let (controller, counters) = scripted("20", 2, vec![Some(stale), Some(Script::default())]);

        controller.write("X", 5).unwrap();

        assert_eq!(Counters::get(&counters.connects), 2);
        assert_eq!(Counters::get(&counters.closes), 1);
        assert_eq!(*counters.calls_per_session.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_healthy_probe_keeps_session() {
        let flaky = Script {
            calls: vec![Step::Timeout],
            probes: vec![Step::Ok],
        };
        let (controller, counters) = scripted("20", 2, vec![Some(flaky)]);

        controller.write("X", 5).unwrap();

        assert_eq!(Counters::get(&counters.connects), 1);
        assert_eq!(Counters::get(&counters.closes), 0);
        assert_eq!(*counters.calls_per_session.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_exhausted_retries_propagate_last_error() {
        let failing = Script {
            calls: vec![Step::Timeout, Step::Reset],
            probes: vec![Step::Ok, Step::Ok],
        };
        let (controller, counters) = scripted("20", 2, vec![Some(failing)]);

        let err = controller.write("X", 5).unwrap_err();

        match err {
            SessionError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("expected I/O error, got {other:?}"),
        }
        assert_eq!(Counters::get(&counters.calls), 2);
    }

    #[test]
    fn test_non_retryable_error_returns_immediately() {
        let rejecting = Script {
            calls: vec![Step::Exception],
            probes: vec![],
        };
        let (controller, counters) = scripted("20", 3, vec![Some(rejecting)]);

        let err = controller.write("X", 5).unwrap_err();

        assert!(matches!(err, SessionError::Exception(_)));
        assert_eq!(Counters::get(&counters.calls), 1);
        assert_eq!(Counters::get(&counters.probes), 0);
    }

    #[test]
    fn test_connect_failure_counts_as_attempt() {
        let (controller, counters) = scripted("20", 2, vec![None, Some(Script::default())]);

        assert_eq!(controller.read("X").unwrap(), 1);
        assert_eq!(Counters::get(&counters.connects), 2);

        let (controller, counters) = scripted("21", 2, vec![None, None]);

        let err = controller.read("X").unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
        assert_eq!(Counters::get(&counters.connects), 2);
        assert!(!controller.is_connected());
    }

    #[test]
    fn test_single_attempt_when_retries_is_one() {
        let failing = Script {
            calls: vec![Step::Timeout],
            probes: vec![Step::Ok],
        };
        let (controller, counters) = scripted("20", 1, vec![Some(failing)]);

        assert!(matches!(
            controller.read("X"),
            Err(SessionError::Timeout(_))
        ));
        assert_eq!(Counters::get(&counters.calls), 1);
    }

    #[test]
    fn test_close_releases_session() {
        let (controller, counters) = scripted("20", 2, vec![]);
        controller.read("X").unwrap();

        controller.close();
        controller.close();

        assert!(!controller.is_connected());
        assert_eq!(Counters::get(&counters.closes), 1);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = ControllerRegistry::new();
        registry.insert(scripted("21", 1, vec![]).0).unwrap();
        registry.insert(scripted("20", 1, vec![]).0).unwrap();

        let err = registry.insert(scripted("20", 1, vec![]).0).unwrap_err();
        assert_eq!(err.to_string(), "duplicate controller id '20'");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.ids(), vec!["20", "21"]);
        assert!(registry.get("20").is_some());
        assert!(registry.get("22").is_none());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SessionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SessionError::NotConnected.is_retryable());
        assert!(SessionError::Protocol("bad header".into()).is_retryable());
        assert!(!SessionError::UnknownVariable("X".into()).is_retryable());
        assert!(!SessionError::Unsupported("read-only".into()).is_retryable());
    }
}
