//! Liveness monitor
//!
//! Periodic ping sweep over the client registry. A client still awaiting the
//! pong for the previous ping when the next sweep runs is terminated.

use crate::connection::{ClientRegistry, ClientSendError, Liveness};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Result of a single sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: usize,
}

/// Run one sweep over every registered connection
pub fn sweep(registry: &ClientRegistry) -> SweepReport {
    let mut report = SweepReport::default();

    for connection in registry.snapshot() {
        if connection.begin_probe() == Liveness::AwaitingPong {
            tracing::info!(client = %connection.id(), "No pong since last ping, terminating");
            connection.terminate();
            registry.remove(&connection);
            report.evicted += 1;
            continue;
        }

        match connection.try_ping() {
            Ok(()) => report.pinged += 1,
            // A backed-up client still gets evicted next sweep unless it pongs
            Err(ClientSendError::Full) => {
                tracing::debug!(client = %connection.id(), "Outbound buffer full, ping skipped");
            }
            Err(ClientSendError::Closed) => {
                registry.remove(&connection);
                report.evicted += 1;
            }
        }
    }

    report
}

/// Owns the sweep timer
#[derive(Debug)]
pub struct LivenessMonitor {
    registry: Arc<ClientRegistry>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ClientRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start sweeping; the first sweep runs one full interval from now
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_secs = self.interval.as_secs(), "Liveness monitor started");

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                tracing::debug!(clients = self.registry.len(), "Send Ping");
                let report = sweep(&self.registry);

                if report.evicted > 0 {
                    tracing::info!(
                        pinged = report.pinged,
                        evicted = report.evicted,
                        "Liveness sweep evicted clients"
                    );
                }
            }

            tracing::info!("Liveness monitor stopped");
        })
    }
}
