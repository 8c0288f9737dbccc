use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};

use crate::serial::{DeviceFilter, PortCandidate, SerialInterface};

/// Events emitted by the port monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A matching port appeared
    PortAdded(PortCandidate),
    /// A matching port went away
    PortRemoved(PortCandidate),
}

/// Watches the set of connectable ports
#[async_trait::async_trait]
pub trait PortMonitor: Send + Sync {
    /// Start monitoring for port changes
    async fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Stop monitoring
    async fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Get receiver for port events
    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>>;
}

/// Changes between two candidate lists: removals first, then additions, each
/// in list order.
pub fn diff_candidates(previous: &[PortCandidate], current: &[PortCandidate]) -> Vec<PortEvent> {
    let removed = previous
        .iter()
        .filter(|c| !current.contains(c))
        .cloned()
        .map(PortEvent::PortRemoved);
    let added = current
        .iter()
        .filter(|c| !previous.contains(c))
        .cloned()
        .map(PortEvent::PortAdded);
    removed.chain(added).collect()
}

pub type CandidateSource = Arc<dyn Fn() -> Vec<PortCandidate> + Send + Sync>;

/// Re-enumerates ports on a fixed interval and reports what changed. Never
/// opens a port, so it is safe to run next to an active session.
pub struct PollingPortMonitor {
    source: CandidateSource,
    interval: Duration,
    tx: Option<mpsc::Sender<PortEvent>>,
    rx: Option<mpsc::Receiver<PortEvent>>,
    stop_tx: Option<mpsc::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PollingPortMonitor {
    pub fn new(filter: DeviceFilter, interval: Duration) -> Self {
        Self::with_source(Arc::new(move || SerialInterface::list_candidates(&filter)), interval)
    }

    pub fn with_source(source: CandidateSource, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            source,
            interval,
            tx: Some(tx),
            rx: Some(rx),
            stop_tx: None,
            task_handle: None,
        }
    }
}

#[async_trait::async_trait]
impl PortMonitor for PollingPortMonitor {
    async fn start(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let tx = self.tx.take().ok_or("Already started")?;
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        self.stop_tx = Some(stop_tx);

        let source = self.source.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut known: Vec<PortCandidate> = Vec::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        log::info!("Port monitor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let source = source.clone();
                        let current = match tokio::task::spawn_blocking(move || source()).await {
                            Ok(current) => current,
                            Err(e) => {
                                log::warn!("Port enumeration task failed: {}", e);
                                continue;
                            }
                        };
                        for event in diff_candidates(&known, &current) {
                            log::debug!("Port event: {:?}", event);
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        known = current;
                    }
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = timeout(Duration::from_secs(2), handle).await;
        }
        Ok(())
    }

    fn get_receiver(&mut self) -> Option<mpsc::Receiver<PortEvent>> {
        self.rx.take()
    }
}

/// Create the port monitor for the given filter and refresh interval
pub fn create_port_monitor(filter: DeviceFilter, interval: Duration) -> Box<dyn PortMonitor> {
    Box::new(PollingPortMonitor::new(filter, interval))
}
