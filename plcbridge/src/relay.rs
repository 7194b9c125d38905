//! Validation and execution of subscriber write requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use plcbridge_common::{
    SequenceRequest, ServerMessage, ValueError, WriteRequest, build_tag, normalize,
};
use plcbridge_framework::BridgeHealth;

use crate::config::SequenceStep;
use crate::controller::{Controller, ControllerRegistry, SessionError};
use crate::hub::{HubHandle, Subscriber};
use crate::pool::{PoolError, WorkerPool};

/// A request was rejected before reaching a controller.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing controller id")]
    MissingController,

    #[error("unknown controller {0}")]
    UnknownController(String),

    #[error("missing variable name")]
    MissingVariable,

    #[error(transparent)]
    InvalidValue(#[from] ValueError),

    #[error("missing sequence name")]
    MissingSequence,

    #[error("unknown sequence {0}")]
    UnknownSequence(String),
}

/// Why a write or sequence failed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Controller(#[from] SessionError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// A write that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedWrite {
    pub controller: Arc<Controller>,
    pub var: String,
    pub value: i64,
}

/// A write that reached the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedWrite {
    pub controller: String,
    pub var: String,
    pub value: i64,
}

impl CompletedWrite {
    pub fn tag(&self) -> String {
        build_tag(&self.var, &self.controller)
    }
}

/// Named write sequences, by controller id then sequence name.
pub type SequenceTable = HashMap<String, HashMap<String, Vec<SequenceStep>>>;

/// Routes writes from subscribers to controllers.
///
/// A successful write is acknowledged to the requester first and then
/// pushed to every subscriber of its tag.
#[derive(Debug, Clone)]
pub struct CommandRelay {
    registry: Arc<ControllerRegistry>,
    sequences: Arc<SequenceTable>,
    pool: WorkerPool,
    hub: HubHandle,
    health: Arc<BridgeHealth>,
}

impl CommandRelay {
    pub fn new(
        registry: Arc<ControllerRegistry>,
        sequences: SequenceTable,
        pool: WorkerPool,
        hub: HubHandle,
        health: Arc<BridgeHealth>,
    ) -> Self {
        Self {
            registry,
            sequences: Arc::new(sequences),
            pool,
            hub,
            health,
        }
    }

    /// Check a write request without touching any controller.
    pub fn validate(&self, request: &WriteRequest) -> Result<ValidatedWrite, ValidationError> {
        let controller = self.lookup(&request.controller)?;

        let var = request
            .var
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(ValidationError::MissingVariable)?;

        let value = normalize(&request.value)?;

        Ok(ValidatedWrite {
            controller,
            var: var.to_string(),
            value,
        })
    }

    /// Validate and perform a write. Nothing is pushed.
    pub async fn write(&self, request: &WriteRequest) -> Result<CompletedWrite, RelayError> {
        let write = self.validate(request)?;
        self.dispatch(write).await
    }

    /// Handle a `write` command: acknowledge to the requester, then push
    /// the new value to subscribers of its tag. Errors go to the requester
    /// only.
    pub async fn handle_write(&self, requester: &Subscriber, request: &WriteRequest) {
        match self.write(request).await {
            Ok(done) => {
                info!(
                    controller = %done.controller,
                    var = %done.var,
                    value = done.value,
                    subscriber = requester.id(),
                    "Write applied"
                );
                requester
                    .reply(ServerMessage::ack(done.var.as_str(), done.value))
                    .await;
                self.publish(&done);
            }
            Err(e) => {
                log_failure(requester, "write", &e);
                requester.reply(ServerMessage::error(&e)).await;
            }
        }
    }

    /// Run a configured sequence. Each completed write is pushed as it
    /// lands; the first failure stops the sequence.
    pub async fn run_sequence(&self, request: &SequenceRequest) -> Result<String, RelayError> {
        let controller = self.lookup(&request.controller)?;

        let name = request
            .name
            .as_str()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(ValidationError::MissingSequence)?;

        let steps = self
            .sequences
            .get(controller.id())
            .and_then(|table| table.get(name))
            .ok_or_else(|| ValidationError::UnknownSequence(name.to_string()))?;

        for step in steps {
            match step {
                SequenceStep::Write { var, value } => {
                    let done = self
                        .dispatch(ValidatedWrite {
                            controller: controller.clone(),
                            var: var.clone(),
                            value: *value,
                        })
                        .await?;
                    self.publish(&done);
                }
                SequenceStep::Delay { delay_ms } => {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                }
            }
        }

        Ok(name.to_string())
    }

    /// Handle a `sequence` command.
    pub async fn handle_sequence(&self, requester: &Subscriber, request: &SequenceRequest) {
        match self.run_sequence(request).await {
            Ok(name) => {
                info!(subscriber = requester.id(), sequence = %name, "Sequence complete");
                requester.reply(ServerMessage::sequence_ack(name)).await;
            }
            Err(e) => {
                log_failure(requester, "sequence", &e);
                requester.reply(ServerMessage::error(&e)).await;
            }
        }
    }

    fn lookup(&self, id: &Value) -> Result<Arc<Controller>, ValidationError> {
        let id = controller_id(id).ok_or(ValidationError::MissingController)?;
        self.registry
            .get(&id)
            .ok_or(ValidationError::UnknownController(id))
    }

    async fn dispatch(&self, write: ValidatedWrite) -> Result<CompletedWrite, RelayError> {
        let ValidatedWrite {
            controller,
            var,
            value,
        } = write;

        let id = controller.id().to_string();
        let name = var.clone();

        let result = self
            .pool
            .run_on(&controller, move |target| target.write(&name, value))
            .await
            .map_err(RelayError::from)
            .and_then(|r| r.map_err(RelayError::from));

        match result {
            Ok(()) => {
                self.health.record_success(&id);
                Ok(CompletedWrite {
                    controller: id,
                    var,
                    value,
                })
            }
            Err(e) => {
                if matches!(&e, RelayError::Controller(s) if s.is_retryable()) {
                    self.health.record_failure(&id, &e.to_string());
                }
                Err(e)
            }
        }
    }

    fn publish(&self, done: &CompletedWrite) {
        self.hub.push(done.tag(), done.value);
        self.health.record_values_published(1);
    }
}

/// Controller ids arrive as strings or bare numbers.
fn controller_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn log_failure(requester: &Subscriber, op: &str, error: &RelayError) {
    match error {
        RelayError::Validation(e) => {
            debug!(subscriber = requester.id(), op, error = %e, "Request rejected");
        }
        e => warn!(subscriber = requester.id(), op, error = %e, "Request failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{Counters, Script, Step, identity, scripted};
    use crate::controller::{Connector, ControllerSession, Endpoint};
    use crate::hub::HubTask;
    use crate::simulated::SimulatedConnector;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        relay: CommandRelay,
        hub: HubHandle,
        counters: Arc<Counters>,
        simulated: SimulatedConnector,
    }

    fn fixture(sequences: SequenceTable) -> Fixture {
        let mut registry = ControllerRegistry::new();

        let (scripted_controller, counters) = scripted("20", 2, vec![]);
        registry.insert(scripted_controller).unwrap();

        let simulated = SimulatedConnector::default();
        registry
            .insert(Controller::new(identity("21", 2), Box::new(simulated.clone())))
            .unwrap();

        let (hub, task) = HubTask::channel();
        tokio::spawn(task.run());

        let relay = CommandRelay::new(
            Arc::new(registry),
            sequences,
            WorkerPool::new(4),
            hub.clone(),
            Arc::new(BridgeHealth::new("test")),
        );

        Fixture {
            relay,
            hub,
            counters,
            simulated,
        }
    }

    fn request(ip: Value, var: Value, value: Value) -> WriteRequest {
        WriteRequest {
            controller: ip,
            var,
            value,
        }
    }

    /// Subscribe to `tags` plus a sentinel tag, and return the receiver.
    fn watch(hub: &HubHandle, tags: &[&str]) -> (Subscriber, mpsc::Receiver<ServerMessage>) {
        let (subscriber, rx) = Subscriber::channel(99, 16);
        for tag in tags.iter().chain(&["sentinel@test"]) {
            hub.subscribe(subscriber.clone(), *tag);
        }
        (subscriber, rx)
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let fx = fixture(SequenceTable::new());

        let cases = [
            (request(json!("99"), json!("X"), json!(1)), "unknown controller 99"),
            (request(Value::Null, json!("X"), json!(1)), "missing controller id"),
            (request(json!("20"), json!(""), json!(1)), "missing variable name"),
            (request(json!("20"), Value::Null, json!(1)), "missing variable name"),
            (request(json!("20"), json!("  "), json!(1)), "missing variable name"),
            (request(json!("20"), json!("X"), json!("abc")), "value must be int-like"),
            (request(json!("20"), json!("X"), json!(1e300)), "value out of range"),
        ];

        for (req, message) in cases {
            let err = assert_err!(fx.relay.write(&req).await);
            assert!(matches!(err, RelayError::Validation(_)));
            assert_eq!(err.to_string(), message);
        }

        assert_eq!(Counters::get(&fx.counters.connects), 0);
        assert_eq!(Counters::get(&fx.counters.calls), 0);
    }

    #[tokio::test]
    async fn test_numeric_controller_id() {
        let fx = fixture(SequenceTable::new());
        let done = assert_ok!(fx.relay.write(&request(json!(21), json!("X"), json!("5"))).await);
        assert_eq!(done.tag(), "X@21");
        assert_eq!(fx.simulated.value("X"), 5);
    }

    #[tokio::test]
    async fn test_padded_variable_name_is_trimmed() {
        let fx = fixture(SequenceTable::new());
        let (_watcher, mut rx) = watch(&fx.hub, &["X@21"]);
        let (requester, mut replies) = Subscriber::channel(1, 8);

        fx.relay
            .handle_write(&requester, &request(json!(" 21 "), json!(" X "), json!(5)))
            .await;

        assert_eq!(replies.recv().await, Some(ServerMessage::ack("X", 5)));
        assert_eq!(rx.recv().await, Some(ServerMessage::push("X@21", 5)));
        assert_eq!(fx.simulated.value("X"), 5);
        assert_eq!(fx.simulated.value(" X "), 0);
    }

    #[tokio::test]
    async fn test_unknown_controller_is_not_broadcast() {
        let fx = fixture(SequenceTable::new());
        let (_watcher, mut rx) = watch(&fx.hub, &["X@99"]);
        let (requester, mut replies) = Subscriber::channel(1, 8);

        fx.relay
            .handle_write(&requester, &request(json!("99"), json!("X"), json!(1)))
            .await;

        assert_eq!(
            replies.recv().await,
            Some(ServerMessage::error("unknown controller 99"))
        );

        fx.hub.push("sentinel@test", 0);
        assert_eq!(rx.recv().await, Some(ServerMessage::push("sentinel@test", 0)));
        assert_eq!(Counters::get(&fx.counters.connects), 0);
    }

    #[tokio::test]
    async fn test_write_acks_then_pushes() {
        let fx = fixture(SequenceTable::new());
        let (_watcher, mut rx) = watch(&fx.hub, &["X@21"]);
        let (requester, mut replies) = Subscriber::channel(1, 8);

        fx.relay
            .handle_write(&requester, &request(json!("21"), json!("X"), json!(true)))
            .await;

        assert_eq!(replies.recv().await, Some(ServerMessage::ack("X", 1)));
        assert_eq!(rx.recv().await, Some(ServerMessage::push("X@21", 1)));
    }

    #[tokio::test]
    async fn test_controller_failure_is_reported_and_not_pushed() {
        let mut registry = ControllerRegistry::new();
        let failing = Script {
            calls: vec![Step::Timeout, Step::Timeout],
            probes: vec![],
        };
        registry.insert(scripted("20", 2, vec![Some(failing)]).0).unwrap();

        let (hub, task) = HubTask::channel();
        tokio::spawn(task.run());
        let health = Arc::new(BridgeHealth::new("test"));
        let relay = CommandRelay::new(
            Arc::new(registry),
            SequenceTable::new(),
            WorkerPool::new(1),
            hub.clone(),
            health.clone(),
        );

        let (_watcher, mut rx) = watch(&hub, &["X@20"]);
        let (requester, mut replies) = Subscriber::channel(1, 8);
        relay
            .handle_write(&requester, &request(json!("20"), json!("X"), json!(1)))
            .await;

        let Some(ServerMessage::Error { error }) = replies.recv().await else {
            panic!("expected error reply");
        };
        assert!(error.starts_with("timed out"));

        hub.push("sentinel@test", 0);
        assert_eq!(rx.recv().await, Some(ServerMessage::push("sentinel@test", 0)));
        assert_eq!(health.snapshot().errors_total, 1);
    }

    /// Session whose writes block until released.
    struct Gated {
        release: Arc<std::sync::Mutex<std_mpsc::Receiver<()>>>,
    }

    impl Connector for Gated {
        fn connect(&self, _: &Endpoint) -> Result<Box<dyn ControllerSession>, SessionError> {
            Ok(Box::new(Gated {
                release: self.release.clone(),
            }))
        }
    }

    impl ControllerSession for Gated {
        fn read(&mut self, _: &str) -> Result<i64, SessionError> {
            Ok(0)
        }

        fn write(&mut self, _: &str, _: i64) -> Result<(), SessionError> {
            self.release
                .lock()
                .unwrap()
                .recv()
                .map_err(|_| SessionError::NotConnected)
        }

        fn probe(&mut self) -> Result<(), SessionError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[tokio::test]
    async fn test_writes_to_different_controllers_do_not_block() {
        let (release, gate) = std_mpsc::channel();
        let mut registry = ControllerRegistry::new();
        registry
            .insert(Controller::new(
                identity("20", 1),
                Box::new(Gated {
                    release: Arc::new(std::sync::Mutex::new(gate)),
                }),
            ))
            .unwrap();
        registry
            .insert(Controller::new(
                identity("21", 1),
                Box::new(SimulatedConnector::default()),
            ))
            .unwrap();

        let (hub, _task) = HubTask::channel();
        let relay = CommandRelay::new(
            Arc::new(registry),
            SequenceTable::new(),
            WorkerPool::new(4),
            hub,
            Arc::new(BridgeHealth::new("test")),
        );

        let blocked = {
            let relay = relay.clone();
            tokio::spawn(async move {
                relay
                    .write(&request(json!("20"), json!("X"), json!(1)))
                    .await
            })
        };

        let free = tokio::time::timeout(
            Duration::from_secs(5),
            relay.write(&request(json!("21"), json!("Y"), json!(2))),
        )
        .await
        .expect("write to 21 was blocked by 20");
        assert_ok!(free);
        assert!(!blocked.is_finished());

        release.send(()).unwrap();
        assert_ok!(blocked.await.unwrap());
    }

    #[tokio::test]
    async fn test_hung_controller_holds_one_worker() {
        let (release, gate) = std_mpsc::channel();
        let mut registry = ControllerRegistry::new();
        registry
            .insert(Controller::new(
                identity("20", 1),
                Box::new(Gated {
                    release: Arc::new(std::sync::Mutex::new(gate)),
                }),
            ))
            .unwrap();
        registry
            .insert(Controller::new(
                identity("21", 1),
                Box::new(SimulatedConnector::default()),
            ))
            .unwrap();

        let pool = WorkerPool::new(2);
        let (hub, _task) = HubTask::channel();
        let relay = CommandRelay::new(
            Arc::new(registry),
            SequenceTable::new(),
            pool.clone(),
            hub,
            Arc::new(BridgeHealth::new("test")),
        );

        let queued: Vec<_> = (0..3)
            .map(|i| {
                let relay = relay.clone();
                tokio::spawn(async move {
                    relay
                        .write(&request(json!("20"), json!("X"), json!(i)))
                        .await
                })
            })
            .collect();
        tokio::task::yield_now().await;

        let free = tokio::time::timeout(
            Duration::from_secs(5),
            relay.write(&request(json!("21"), json!("Y"), json!(2))),
        )
        .await
        .expect("write to 21 waited for a worker held by 20");
        assert_ok!(free);
        assert_eq!(pool.idle(), 1);

        for _ in 0..3 {
            release.send(()).unwrap();
        }
        for write in queued {
            assert_ok!(write.await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_sequence_runs_in_order() {
        let sequences = SequenceTable::from([(
            "21".to_string(),
            HashMap::from([(
                "start".to_string(),
                vec![
                    SequenceStep::Write {
                        var: "run".to_string(),
                        value: 1,
                    },
                    SequenceStep::Delay { delay_ms: 5 },
                    SequenceStep::Write {
                        var: "auto".to_string(),
                        value: 1,
                    },
                ],
            )]),
        )]);
        let fx = fixture(sequences);
        let (_watcher, mut rx) = watch(&fx.hub, &["run@21", "auto@21"]);
        let (requester, mut replies) = Subscriber::channel(1, 8);

        let req = SequenceRequest {
            controller: json!("21"),
            name: json!("start"),
        };
        fx.relay.handle_sequence(&requester, &req).await;

        assert_eq!(replies.recv().await, Some(ServerMessage::sequence_ack("start")));
        assert_eq!(rx.recv().await, Some(ServerMessage::push("run@21", 1)));
        assert_eq!(rx.recv().await, Some(ServerMessage::push("auto@21", 1)));
        assert_eq!(fx.simulated.value("auto"), 1);
    }

    #[tokio::test]
    async fn test_unknown_sequence() {
        let fx = fixture(SequenceTable::new());
        let req = SequenceRequest {
            controller: json!("21"),
            name: json!("purge"),
        };

        let err = assert_err!(fx.relay.run_sequence(&req).await);
        assert_eq!(err.to_string(), "unknown sequence purge");

        let req = SequenceRequest {
            controller: json!("21"),
            name: Value::Null,
        };
        let err = assert_err!(fx.relay.run_sequence(&req).await);
        assert_eq!(err.to_string(), "missing sequence name");
    }
}
