//! Background task reclaiming lapsed holds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use super::ledger::ReservationLedger;

pub struct ExpirySweeper;

/// Handle to a running sweeper. Dropping it detaches the task, which keeps
/// sweeping until the runtime shuts down; call [`shutdown`](Self::shutdown) to stop it.
#[derive(Debug)]
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Sweep `ledger` every `every`, starting immediately.
    pub fn spawn(ledger: Arc<ReservationLedger>, every: Duration) -> SweeperHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = every.as_millis() as u64, "expiry sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = ledger.sweep_expired();
                        if report.reclaimed > 0 || report.forgotten > 0 {
                            info!(
                                reclaimed = report.reclaimed,
                                seats_freed = report.seats_freed,
                                forgotten = report.forgotten,
                                "sweep"
                            );
                        } else {
                            debug!("sweep found nothing");
                        }
                    }
                    // only an explicit stop ends the loop; a dropped handle is ignored
                    Ok(()) = stopped.changed() => break,
                }
            }

            info!("expiry sweeper stopped");
        });

        SweeperHandle { stop, task }
    }
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its current sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
