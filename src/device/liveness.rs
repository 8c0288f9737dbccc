use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};

use super::manager::{Probe, SessionShared};

/// Periodic link check for one session. Tears the session down when the
/// port stops answering, then exits.
pub struct LivenessMonitor {
    stop_tx: mpsc::Sender<()>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl LivenessMonitor {
    pub(crate) fn spawn(shared: SessionShared, epoch: u64, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task_handle = tokio::spawn(monitor_loop(shared, epoch, interval, stop_rx));
        Self { stop_tx, task_handle }
    }

    pub async fn stop(self) {
        // The loop may already have exited on its own
        let _ = self.stop_tx.send(()).await;
        let _ = timeout(Duration::from_secs(2), self.task_handle).await;
    }
}

async fn monitor_loop(shared: SessionShared, epoch: u64, interval: Duration, mut stop_rx: mpsc::Receiver<()>) {
    log::debug!("Liveness monitor started for session {} ({:?})", epoch, interval);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                log::debug!("Liveness monitor for session {} stopping", epoch);
                break;
            }
            _ = ticker.tick() => {
                match shared.probe(epoch).await {
                    Probe::Alive => {}
                    Probe::Lost => {
                        log::info!("Device lost, session {} closed", epoch);
                        break;
                    }
                    Probe::Ended => break,
                }
            }
        }
    }
}
