use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::EditorSettings;
use crate::serial::{FailureKind, SerialError, SerialInterface, SerialPortIO, SlotProtocol};
use super::liveness::LivenessMonitor;
use super::{
    ConnectionState, DeviceError, PortCandidate, Result, SessionEvent, SlotIndex, SlotRegistry,
    SlotStatus, SongBlob,
};

const EVENT_CAPACITY: usize = 256;
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// The open link. `epoch` tells sessions apart so a background task started
/// for one connection never touches the next.
pub(crate) struct ActiveSession {
    epoch: u64,
    protocol: SlotProtocol,
}

pub(crate) enum Probe {
    Alive,
    Lost,
    /// The session the caller was watching no longer exists.
    Ended,
}

/// State shared between the manager and its background tasks.
///
/// Lock order is always `session` then `registry`/`state`. Holding `session`
/// is what serializes access to the byte stream.
#[derive(Clone)]
pub(crate) struct SessionShared {
    session: Arc<Mutex<Option<ActiveSession>>>,
    registry: Arc<RwLock<SlotRegistry>>,
    state: Arc<RwLock<ConnectionState>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session: Arc::new(Mutex::new(None)),
            registry: Arc::new(RwLock::new(SlotRegistry::new())),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events,
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn record(&self, slot: SlotIndex, status: SlotStatus) {
        self.registry.write().await.update(slot, status);
        self.emit(SessionEvent::SlotUpdated { slot, status });
    }

    /// Close the session held in `current` (already locked) and take the
    /// registry offline. Returns the port name if there was a session.
    async fn close_locked(&self, current: &mut Option<ActiveSession>, lost: bool) -> Option<String> {
        let mut session = current.take()?;
        let port_name = session.protocol.interface().port_name().unwrap_or_default().to_string();
        session.protocol.interface_mut().disconnect();

        self.registry.write().await.mark_offline();
        *self.state.write().await = ConnectionState::Disconnected;

        if lost {
            log::warn!("Lost connection to {}", port_name);
            self.emit(SessionEvent::DeviceLost { port_name: port_name.clone() });
        }
        self.emit(SessionEvent::Disconnected { port_name: port_name.clone() });
        Some(port_name)
    }

    /// Liveness check for session `epoch`; tears it down when the port is gone.
    pub(crate) async fn probe(&self, epoch: u64) -> Probe {
        let mut guard = self.session.lock().await;
        let alive = match guard.as_ref() {
            Some(session) if session.epoch == epoch => session.protocol.interface().probe_alive(),
            _ => return Probe::Ended,
        };

        if alive {
            Probe::Alive
        } else {
            self.close_locked(&mut guard, true).await;
            Probe::Lost
        }
    }

    /// After a failed operation: a link-level error on a port that no longer
    /// answers the probe means the device is gone.
    async fn settle_failure(&self, current: &mut Option<ActiveSession>, err: SerialError) -> DeviceError {
        let gone = err.kind() == FailureKind::Connection
            && current.as_ref().map_or(false, |s| !s.protocol.interface().probe_alive());

        if gone {
            log::warn!("Operation failed on a vanished port: {}", err);
            self.close_locked(current, true).await;
            DeviceError::SerialError(SerialError::DeviceLost)
        } else {
            DeviceError::SerialError(err)
        }
    }

    /// Query every slot in order for session `epoch`. The session lock is
    /// taken per slot so foreground operations can interleave. Stops early on
    /// disconnect or link failure, leaving unscanned entries untouched.
    pub(crate) async fn scan(&self, epoch: u64) -> usize {
        let mut scanned = 0;
        let mut interrupted = false;

        for slot in SlotIndex::all() {
            let mut guard = self.session.lock().await;
            let session = match guard.as_mut() {
                Some(session) if session.epoch == epoch => session,
                _ => {
                    interrupted = true;
                    break;
                }
            };

            match session.protocol.try_query_status(slot).await {
                Ok(status) => {
                    self.record(slot, status).await;
                    scanned += 1;
                }
                Err(e) => {
                    log::warn!("Scan stopped at {}: {}", slot, e);
                    interrupted = true;
                    break;
                }
            }
        }

        if interrupted {
            log::info!("Slot scan interrupted after {} slots", scanned);
            self.emit(SessionEvent::ScanInterrupted { scanned });
        } else {
            log::info!("Slot scan complete");
            self.emit(SessionEvent::ScanCompleted { scanned });
        }
        scanned
    }
}

#[derive(Default)]
struct BackgroundTasks {
    scan: Option<JoinHandle<usize>>,
    liveness: Option<LivenessMonitor>,
}

/// One Arpmini session: connect, run slot operations, disconnect.
///
/// All operations on the link are serialized through a single mutex, shared
/// with the initial slot scan and the liveness monitor.
pub struct DeviceManager {
    settings: EditorSettings,
    shared: SessionShared,
    epoch: AtomicU64,
    tasks: Mutex<BackgroundTasks>,
}

impl DeviceManager {
    pub fn new(settings: EditorSettings) -> Self {
        Self {
            settings,
            shared: SessionShared::new(),
            epoch: AtomicU64::new(0),
            tasks: Mutex::new(BackgroundTasks::default()),
        }
    }

    pub fn settings(&self) -> &EditorSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Connectable Arpmini ports. Empty when none is plugged in.
    pub fn discover_devices(&self) -> Vec<PortCandidate> {
        SerialInterface::list_candidates(&self.settings.device_filter())
    }

    /// Connect to the first discovered device.
    pub async fn connect_first(&self) -> Result<String> {
        let candidate = self
            .discover_devices()
            .into_iter()
            .next()
            .ok_or(DeviceError::NoCandidates)?;
        self.connect(&candidate.port_name).await?;
        Ok(candidate.port_name)
    }

    /// Open `port_name` and start the background scan and liveness monitor.
    pub async fn connect(&self, port_name: &str) -> Result<()> {
        if self.is_connected().await {
            return Err(DeviceError::AlreadyConnected);
        }
        *self.shared.state.write().await = ConnectionState::Connecting;

        let mut interface = SerialInterface::new().with_read_timeout(self.settings.read_timeout());
        log::info!("Attempting to connect to port: {}", port_name);
        match interface.connect(port_name, self.settings.baud_rate) {
            Ok(()) => self.start_session(interface).await,
            Err(e) => {
                let error_msg = format!("Connection failed: {}", e);
                log::error!("{}", error_msg);
                *self.shared.state.write().await = ConnectionState::Error(error_msg);
                Err(DeviceError::SerialError(e))
            }
        }
    }

    /// Start a session over an already open transport.
    pub async fn connect_with_io(&self, port_name: &str, io: Box<dyn SerialPortIO>) -> Result<()> {
        let interface = SerialInterface::from_io(port_name, io).with_read_timeout(self.settings.read_timeout());
        self.start_session(interface).await
    }

    async fn start_session(&self, interface: SerialInterface) -> Result<()> {
        let port_name = interface.port_name().unwrap_or_default().to_string();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut guard = self.shared.session.lock().await;
            if guard.is_some() {
                return Err(DeviceError::AlreadyConnected);
            }
            self.shared.registry.write().await.reset_for(&port_name);
            *guard = Some(ActiveSession { epoch, protocol: SlotProtocol::new(interface) });
            *self.shared.state.write().await = ConnectionState::Connected;
        }
        self.shared.emit(SessionEvent::Connected { port_name: port_name.clone() });

        let mut tasks = self.tasks.lock().await;
        Self::stop_tasks(&mut tasks).await;

        let shared = self.shared.clone();
        tasks.scan = Some(tokio::spawn(async move { shared.scan(epoch).await }));
        tasks.liveness = Some(LivenessMonitor::spawn(
            self.shared.clone(),
            epoch,
            self.settings.liveness_interval(),
        ));

        log::info!("Successfully connected to device: {}", port_name);
        Ok(())
    }

    /// Close the link. An in-flight operation or slot query finishes first.
    pub async fn disconnect(&self) -> Result<()> {
        let closed = {
            let mut guard = self.shared.session.lock().await;
            self.shared.close_locked(&mut guard, false).await
        };

        let mut tasks = self.tasks.lock().await;
        Self::stop_tasks(&mut tasks).await;

        match closed {
            Some(port_name) => {
                log::info!("Disconnected from {}", port_name);
                Ok(())
            }
            None => Err(DeviceError::NotConnected),
        }
    }

    async fn stop_tasks(tasks: &mut BackgroundTasks) {
        if let Some(monitor) = tasks.liveness.take() {
            monitor.stop().await;
        }
        if let Some(scan) = tasks.scan.take() {
            let _ = timeout(TASK_SHUTDOWN_TIMEOUT, scan).await;
        }
    }

    /// Wait for the initial slot scan of the current session. Returns the
    /// number of slots scanned, or `None` if no scan is pending.
    pub async fn wait_for_scan(&self) -> Option<usize> {
        let handle = self.tasks.lock().await.scan.take()?;
        handle.await.ok()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.session.lock().await.is_some()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.state.read().await.clone()
    }

    /// Snapshot of the slot registry.
    pub async fn registry(&self) -> SlotRegistry {
        self.shared.registry.read().await.clone()
    }

    /// Rescan all slots in the foreground.
    pub async fn scan_all(&self) -> Result<SlotRegistry> {
        let epoch = {
            let guard = self.shared.session.lock().await;
            guard.as_ref().map(|s| s.epoch).ok_or(DeviceError::NotConnected)?
        };
        self.shared.scan(epoch).await;
        Ok(self.registry().await)
    }

    /// Re-read one slot's status. Unanswered queries read as `Empty` but are
    /// not recorded; a dead link closes the session.
    pub async fn query_status(&self, slot: SlotIndex) -> Result<SlotStatus> {
        let mut guard = self.shared.session.lock().await;
        let session = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        match session.protocol.try_query_status(slot).await {
            Ok(status) => {
                self.shared.record(slot, status).await;
                Ok(status)
            }
            Err(e) => {
                log::debug!("Status query for {} failed: {}", slot, e);
                self.shared.settle_failure(&mut guard, e).await;
                Ok(SlotStatus::Empty)
            }
        }
    }

    /// Write `data` into `slot`. The length is checked before anything is
    /// sent. On success the slot is re-queried and the registry updated.
    pub async fn import(&self, slot: SlotIndex, data: &[u8]) -> Result<SlotStatus> {
        let blob = SongBlob::from_bytes(data)?;
        let mut guard = self.shared.session.lock().await;
        let session = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        match session.protocol.import_blob(slot, &blob).await {
            Ok(status) => {
                self.shared.record(slot, status).await;
                Ok(status)
            }
            Err(e) => Err(self.shared.settle_failure(&mut guard, e).await),
        }
    }

    pub async fn export(&self, slot: SlotIndex) -> Result<SongBlob> {
        let mut guard = self.shared.session.lock().await;
        let session = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        match session.protocol.export(slot).await {
            Ok(blob) => Ok(blob),
            Err(e) => Err(self.shared.settle_failure(&mut guard, e).await),
        }
    }

    pub async fn clear(&self, slot: SlotIndex) -> Result<SlotStatus> {
        let mut guard = self.shared.session.lock().await;
        let session = guard.as_mut().ok_or(DeviceError::NotConnected)?;

        match session.protocol.clear(slot).await {
            Ok(status) => {
                self.shared.record(slot, status).await;
                Ok(status)
            }
            Err(e) => Err(self.shared.settle_failure(&mut guard, e).await),
        }
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new(EditorSettings::default())
    }
}
