//! Periodic polling of watched variables.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use plcbridge_common::build_tag;
use plcbridge_framework::{BridgeHealth, ControllerStatus};

use crate::controller::Controller;
use crate::hub::HubHandle;
use crate::pool::WorkerPool;

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Values read and pushed.
    pub read: usize,
    /// Variables that could not be read.
    pub failed: usize,
}

/// Polls one controller's watch list and pushes every value read.
pub struct ControllerPoller {
    controller: Arc<Controller>,
    watch: Vec<String>,
    interval: Duration,
    hub: HubHandle,
    pool: WorkerPool,
    health: Arc<BridgeHealth>,
}

impl ControllerPoller {
    /// Create a new poller for a controller.
    pub fn new(
        controller: Arc<Controller>,
        watch: Vec<String>,
        interval: Duration,
        hub: HubHandle,
        pool: WorkerPool,
        health: Arc<BridgeHealth>,
    ) -> Self {
        Self {
            controller,
            watch,
            interval,
            hub,
            pool,
            health,
        }
    }

    /// Run the polling loop.
    ///
    /// Each cycle is followed by a fixed sleep, so cycles never overlap.
    pub async fn run(self) {
        let id = self.controller.id().to_string();

        info!(
            controller = %id,
            variables = self.watch.len(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting poller"
        );

        loop {
            let stats = self.poll_once().await;
            debug!(
                controller = %id,
                read = stats.read,
                failed = stats.failed,
                "Poll cycle complete"
            );

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Read every watched variable once, in order.
    ///
    /// A failing variable is logged and skipped; the rest of the cycle
    /// still runs.
    pub async fn poll_once(&self) -> PollStats {
        let mut stats = PollStats::default();
        let id = self.controller.id();
        let start = Instant::now();
        let mut last_error = None;

        for var in &self.watch {
            let name = var.clone();
            let read = self
                .pool
                .run_on(&self.controller, move |controller| controller.read(&name))
                .await;

            let error = match read {
                Ok(Ok(value)) => {
                    self.hub.push(build_tag(var, id), value);
                    stats.read += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            };

            warn!(controller = %id, var = %var, error = %error, "Read failed");
            stats.failed += 1;
            last_error = Some(error);
        }

        self.health
            .record_poll_duration(start.elapsed().as_millis() as u64);
        self.health.record_values_published(stats.read as u64);

        match last_error {
            Some(error) if stats.read == 0 => {
                let status = self.health.record_failure(id, &error);
                if status == ControllerStatus::Offline {
                    warn!(controller = %id, "Controller offline");
                }
            }
            _ if stats.read > 0 => self.health.record_success(id),
            _ => {}
        }

        stats
    }
}
