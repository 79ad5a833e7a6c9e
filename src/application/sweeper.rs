use super::engine::SettlementEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// Background task periodically maturing mentor earnings.
///
/// Runs are idempotent, so a second sweeper (or a manual `sweep` run) working
/// the same store at the same time releases nothing twice.
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Starts sweeping every `every`; the first run happens immediately.
    pub fn spawn(engine: Arc<SettlementEngine>, every: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = every.as_secs(), "earnings sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sweep_due_releases().await {
                            error!(error = %e, "earnings sweep failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("earnings sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Self { shutdown_tx, task }
    }

    /// Signals the loop to stop and waits for the in-flight run to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "earnings sweeper task panicked");
        }
    }
}
