//! Stream lifecycle and sample routing.
//!
//! A [`StreamController`] owns one worker thread, fed by two lanes:
//!
//! - samples arrive on a bounded channel; a full queue blocks the source
//!   until the worker catches up, so no sample is lost;
//! - commands, BLE connection and discovery callbacks arrive on an
//!   unbounded channel, so callbacks fired from the worker itself never
//!   block.
//!
//! Before handling a control message the worker applies every sample that
//! was already queued, so commands observe all samples pushed before them.
//! Estimator state and the session history are only touched by the worker.
//!
//! Every started stream gets a fresh generation number. Sinks handed to
//! sources carry it, and samples from any other generation are dropped, so
//! nothing lands in the history once a stream has been stopped.

use crate::archive::SessionArchive;
use crate::config::ControllerConfig;
use crate::estimator::{FusionState, SourceProfile};
use crate::observable::Observable;
use crate::session::{SessionAccumulator, SessionView};
use crate::source::{ConnectionSink, DiscoverySink, LocalSensors, RemoteSensors, SampleSink};
use crate::types::{
    ConnectionEvent, ConnectionState, DeviceInfo, SampleEvent, Sensors, SourceKind, StreamMode,
    Vector3,
};
use crate::{Result, TiltError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A sample tagged with the stream generation it was produced for.
pub(crate) struct SampleMessage {
    pub(crate) generation: u64,
    pub(crate) event: SampleEvent,
}

/// Control messages consumed by the stream worker.
pub(crate) enum WorkerMessage {
    Connection(ConnectionEvent),
    DeviceFound(DeviceInfo),
    Command(Command),
    Shutdown,
}

pub(crate) enum Command {
    Start {
        source: SourceKind,
        sensors: Sensors,
        reply: Sender<Result<StreamMode>>,
    },
    Stop {
        reply: Sender<Option<Vec<f64>>>,
    },
    StopRemote {
        reply: Sender<Option<Vec<f64>>>,
    },
    BeginDiscovery {
        reply: Sender<Result<()>>,
    },
    Snapshot {
        reply: Sender<SessionSnapshot>,
    },
}

/// Which remote device the controller is linked to, and how far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteLink {
    pub device_id: Option<String>,
    pub state: ConnectionState,
}

/// Consistent view of the controller, taken on the worker thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub mode: Option<StreamMode>,
    pub current_angle: Option<f64>,
    pub history: Vec<f64>,
    pub link: RemoteLink,
}

#[derive(Clone, Default)]
struct Published {
    mode: Observable<Option<StreamMode>>,
    link: Observable<RemoteLink>,
    measuring: Observable<bool>,
    connection_failed: Observable<bool>,
    scanned_devices: Observable<Vec<DeviceInfo>>,
    paired_devices: Observable<Vec<DeviceInfo>>,
}

/// Coordinates the local and remote sample sources.
///
/// At most one stream runs at a time; starting another stops (and archives)
/// the current one first, once the new start's preconditions hold.
pub struct StreamController {
    sender: Sender<WorkerMessage>,
    samples: Sender<SampleMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
    remote: Option<Arc<dyn RemoteSensors>>,
    archive: Arc<SessionArchive>,
    connect_timeout: Duration,
    session: SessionView,
    published: Published,
}

impl StreamController {
    /// Spawn the stream worker.
    ///
    /// `remote` is optional; without it every remote operation fails.
    pub fn new(
        config: &ControllerConfig,
        archive: Arc<SessionArchive>,
        local: Arc<dyn LocalSensors>,
        remote: Option<Arc<dyn RemoteSensors>>,
    ) -> Result<StreamController> {
        let (samples, sample_receiver) =
            crossbeam_channel::bounded(config.channel_capacity.max(1));
        let (sender, receiver) = crossbeam_channel::unbounded();
        let session = SessionAccumulator::new();
        let view = session.view();
        let published = Published::default();

        if let Some(remote) = &remote {
            remote.attach(ConnectionSink::new(sender.clone()));
        }

        let worker = StreamWorker {
            local,
            remote: remote.clone(),
            archive: archive.clone(),
            sender: sender.clone(),
            samples: samples.clone(),
            session,
            published: published.clone(),
            state: StreamState::Idle,
            fusion: FusionState::new(),
            latest_gyro: None,
            generation: 0,
        };

        let thread = std::thread::Builder::new()
            .name("tiltmeter-stream".into())
            .spawn(move || worker.run(receiver, sample_receiver))
            .map_err(|e| TiltError::Spawn(e.to_string()))?;

        Ok(StreamController {
            sender,
            samples,
            thread: Some(thread),
            remote,
            archive,
            connect_timeout: config.connect_timeout,
            session: view,
            published,
        })
    }

    /// Controller with a file-backed archive at the configured locations.
    pub fn open(
        config: &ControllerConfig,
        local: Arc<dyn LocalSensors>,
        remote: Option<Arc<dyn RemoteSensors>>,
    ) -> Result<StreamController> {
        Self::new(config, Arc::new(SessionArchive::open(config)), local, remote)
    }

    /// Start streaming from the host's own sensors.
    ///
    /// Requesting [`Sensors::GYROSCOPE`] selects the fused estimator.
    pub fn start_local(&self, sensors: Sensors) -> Result<StreamMode> {
        self.request(|reply| Command::Start {
            source: SourceKind::Local,
            sensors,
            reply,
        })?
    }

    /// Start streaming from the connected remote device.
    pub fn start_remote(&self, sensors: Sensors) -> Result<StreamMode> {
        self.request(|reply| Command::Start {
            source: SourceKind::Remote,
            sensors,
            reply,
        })?
    }

    /// Stop the active stream and archive its history.
    ///
    /// Returns the finished history, or `None` when nothing was streaming.
    pub fn stop(&self) -> Result<Option<Vec<f64>>> {
        self.request(|reply| Command::Stop { reply })
    }

    /// State after every message queued so far has been processed.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply })
    }

    /// Connect to a remote device, waiting up to the configured timeout
    /// for the hardware to confirm.
    ///
    /// Discovery is stopped afterwards whatever the outcome. On failure the
    /// link reverts to [`ConnectionState::Disconnected`] and the
    /// `connection_failed` flag is raised.
    pub fn connect(&self, device_id: &str) -> Result<()> {
        let remote = self.remote()?;

        let link = self.published.link.get();
        match (link.device_id.as_deref(), link.state) {
            (Some(id), ConnectionState::Connected) if id == device_id => {
                log::debug!("Already connected to {}", device_id);
                return Ok(());
            }
            (Some(other), ConnectionState::Connected | ConnectionState::Connecting)
                if other != device_id =>
            {
                return Err(TiltError::Transport(format!(
                    "already linked to {}, disconnect first",
                    other
                )));
            }
            _ => {}
        }

        self.published.connection_failed.set(false);
        let updates = self.published.link.subscribe();
        self.post(WorkerMessage::Connection(ConnectionEvent {
            device_id: device_id.to_string(),
            state: ConnectionState::Connecting,
        }))?;

        let result = remote
            .connect(device_id)
            .and_then(|()| self.await_connected(device_id, &updates));
        drop(updates);
        remote.stop_discovery();

        if let Err(e) = &result {
            match e {
                TiltError::ConnectionTimeout { .. } => {
                    log::warn!("{}", e);
                    if let Err(e) = remote.disconnect(device_id) {
                        log::debug!("Releasing {} after timeout failed: {}", device_id, e);
                    }
                }
                _ => log::error!("Failed to connect to {}: {}", device_id, e),
            }
            self.published.connection_failed.set(true);
            let _ = self.post(WorkerMessage::Connection(ConnectionEvent {
                device_id: device_id.to_string(),
                state: ConnectionState::Disconnected,
            }));
            // Make the reverted state visible before returning.
            let _ = self.snapshot();
        } else {
            log::info!("Connected to {}", device_id);
        }
        result
    }

    /// Stop any remote stream, then ask the device to disconnect.
    ///
    /// The link itself changes when the BLE layer reports the disconnect.
    pub fn disconnect(&self, device_id: &str) -> Result<()> {
        let remote = self.remote()?;
        if let Some(history) = self.request(|reply| Command::StopRemote { reply })? {
            log::info!("Remote stream stopped for disconnect ({} angles)", history.len());
        }
        remote.disconnect(device_id).map_err(|e| {
            log::error!("Failed to disconnect from {}: {}", device_id, e);
            e
        })
    }

    /// Clear the scanned list, refresh paired devices and start scanning.
    pub fn start_discovery(&self) -> Result<()> {
        self.request(|reply| Command::BeginDiscovery { reply })?
    }

    pub fn stop_discovery(&self) {
        if let Some(remote) = &self.remote {
            remote.stop_discovery();
        }
    }

    /// Write any history (live or archived) to `<export_dir>/<name>.csv`.
    pub fn export(&self, name: &str, history: &[f64]) -> Result<PathBuf> {
        self.archive.export_to_flat_file(name, history)
    }

    /// Export the live session, or the last stopped one if idle.
    pub fn write_current_to_file(&self, name: &str) -> Result<PathBuf> {
        let snapshot = self.snapshot()?;
        self.export(name, &snapshot.history)
    }

    /// Samples pushed but not yet applied by the worker.
    pub fn queued_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn archive(&self) -> &SessionArchive {
        &self.archive
    }

    /// Current angle, history and raw readings of the session.
    pub fn session(&self) -> &SessionView {
        &self.session
    }

    /// Active stream mode, `None` when idle.
    pub fn mode(&self) -> &Observable<Option<StreamMode>> {
        &self.published.mode
    }

    pub fn link(&self) -> &Observable<RemoteLink> {
        &self.published.link
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.published.link.with(|link| link.state)
    }

    pub fn is_connecting(&self) -> bool {
        self.connection_state() == ConnectionState::Connecting
    }

    /// True while a remote stream is running.
    pub fn measuring(&self) -> &Observable<bool> {
        &self.published.measuring
    }

    /// Raised when the last connect attempt failed.
    pub fn connection_failed(&self) -> &Observable<bool> {
        &self.published.connection_failed
    }

    pub fn scanned_devices(&self) -> &Observable<Vec<DeviceInfo>> {
        &self.published.scanned_devices
    }

    pub fn paired_devices(&self) -> &Observable<Vec<DeviceInfo>> {
        &self.published.paired_devices
    }

    fn remote(&self) -> Result<Arc<dyn RemoteSensors>> {
        self.remote
            .clone()
            .ok_or_else(|| TiltError::Transport("no remote sensor layer configured".into()))
    }

    fn await_connected(&self, device_id: &str, updates: &Receiver<RemoteLink>) -> Result<()> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut seen_connecting = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let link = match updates.recv_timeout(remaining) {
                Ok(link) => link,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TiltError::ConnectionTimeout {
                        device_id: device_id.to_string(),
                        timeout: self.connect_timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TiltError::WorkerStopped),
            };
            let ours = link.device_id.as_deref() == Some(device_id);
            match link.state {
                ConnectionState::Connected if ours => return Ok(()),
                ConnectionState::Connecting if ours => seen_connecting = true,
                ConnectionState::Disconnected if seen_connecting => {
                    return Err(TiltError::Transport(format!(
                        "{} disconnected while connecting",
                        device_id
                    )))
                }
                _ => {}
            }
        }
    }

    fn request<T>(&self, command: impl FnOnce(Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = crossbeam_channel::bounded(1);
        self.post(WorkerMessage::Command(command(reply)))?;
        response.recv().map_err(|_| TiltError::WorkerStopped)
    }

    fn post(&self, message: WorkerMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| TiltError::WorkerStopped)
    }

    fn shutdown(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum StreamState {
    Idle,
    Streaming {
        mode: StreamMode,
        generation: u64,
        profile: SourceProfile,
        device_id: Option<String>,
    },
}

/// State owned by the worker thread.
struct StreamWorker {
    local: Arc<dyn LocalSensors>,
    remote: Option<Arc<dyn RemoteSensors>>,
    archive: Arc<SessionArchive>,
    sender: Sender<WorkerMessage>,
    samples: Sender<SampleMessage>,
    session: SessionAccumulator,
    published: Published,
    state: StreamState,
    fusion: FusionState,
    latest_gyro: Option<Vector3>,
    generation: u64,
}

impl StreamWorker {
    fn run(mut self, control: Receiver<WorkerMessage>, samples: Receiver<SampleMessage>) {
        log::info!("Stream worker started");

        // The worker keeps a sender on both lanes for new sinks, so the loop
        // ends on Shutdown.
        loop {
            let running = crossbeam_channel::select! {
                recv(samples) -> message => match message {
                    Ok(SampleMessage { generation, event }) => {
                        self.on_sample(generation, event);
                        true
                    }
                    Err(_) => false,
                },
                recv(control) -> message => match message {
                    Ok(message) => {
                        self.drain_samples(&samples);
                        self.on_control(message)
                    }
                    Err(_) => false,
                },
            };
            if !running {
                break;
            }
        }

        self.stop();
        log::info!("Stream worker stopped");
    }

    /// Apply the samples queued right now. Later arrivals wait for the next
    /// turn of the loop, so a busy source cannot starve control messages.
    fn drain_samples(&mut self, samples: &Receiver<SampleMessage>) {
        for _ in 0..samples.len() {
            match samples.try_recv() {
                Ok(SampleMessage { generation, event }) => self.on_sample(generation, event),
                Err(_) => break,
            }
        }
    }

    /// Returns `false` on shutdown.
    fn on_control(&mut self, message: WorkerMessage) -> bool {
        match message {
            WorkerMessage::Connection(event) => self.on_connection(event),
            WorkerMessage::DeviceFound(device) => self.on_device_found(device),
            WorkerMessage::Command(command) => self.on_command(command),
            WorkerMessage::Shutdown => return false,
        }
        true
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start {
                source,
                sensors,
                reply,
            } => {
                let _ = reply.send(self.start(StreamMode::new(source, sensors)));
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop());
            }
            Command::StopRemote { reply } => {
                let remote_active =
                    self.active_mode().map(StreamMode::source) == Some(SourceKind::Remote);
                let stopped = if remote_active { self.stop() } else { None };
                let _ = reply.send(stopped);
            }
            Command::BeginDiscovery { reply } => {
                let _ = reply.send(self.begin_discovery());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    mode: self.active_mode(),
                    current_angle: self.session.current_angle(),
                    history: self.session.history(),
                    link: self.published.link.get(),
                });
            }
        }
    }

    fn active_mode(&self) -> Option<StreamMode> {
        match &self.state {
            StreamState::Idle => None,
            StreamState::Streaming { mode, .. } => Some(*mode),
        }
    }

    fn start(&mut self, mode: StreamMode) -> Result<StreamMode> {
        // Preconditions come first: a rejected start leaves the active stream running.
        let remote = match mode.source() {
            SourceKind::Local => {
                let missing = mode.sensors().difference(self.local.available());
                if !missing.is_empty() {
                    log::error!("Cannot start {:?}: {:?} not available", mode, missing);
                    return Err(TiltError::SensorUnavailable(missing));
                }
                None
            }
            SourceKind::Remote => Some(self.connected_remote().map_err(|e| {
                log::warn!("Cannot start {:?}: {}", mode, e);
                e
            })?),
        };

        if let Some(active) = self.active_mode() {
            log::warn!("Starting {:?} while {:?} is active, stopping it first", mode, active);
            self.stop();
        }

        self.generation += 1;
        let sink = SampleSink::new(self.generation, self.samples.clone());

        let (profile, device_id) = match remote {
            None => {
                self.local.register(mode.sensors(), sink)?;
                (self.local.profile(), None)
            }
            Some((remote, device_id)) => {
                start_remote_streams(remote.as_ref(), &device_id, mode.sensors(), &sink)?;
                (remote.profile(), Some(device_id))
            }
        };

        self.session.reset();
        self.fusion = FusionState::new();
        self.latest_gyro = None;
        self.state = StreamState::Streaming {
            mode,
            generation: self.generation,
            profile,
            device_id,
        };
        self.published.mode.set(Some(mode));
        if mode.source() == SourceKind::Remote {
            self.published.measuring.set(true);
        }

        log::info!("Started {:?} stream (generation {})", mode, self.generation);
        Ok(mode)
    }

    fn stop(&mut self) -> Option<Vec<f64>> {
        let StreamState::Streaming {
            mode, device_id, ..
        } = std::mem::replace(&mut self.state, StreamState::Idle)
        else {
            return None;
        };

        match (mode.source(), &self.remote, device_id) {
            (SourceKind::Local, _, _) => self.local.unregister(),
            (SourceKind::Remote, Some(remote), Some(device_id)) => remote.stop_streams(&device_id),
            _ => {}
        }
        if mode.source() == SourceKind::Remote {
            self.published.measuring.set(false);
        }

        self.fusion = FusionState::new();
        self.latest_gyro = None;
        self.published.mode.set(None);

        let history = self.session.history();
        if let Err(e) = self.archive.append_session(&history) {
            log::warn!("Failed to archive {:?} session: {}", mode, e);
        }
        log::info!("Stopped {:?} stream with {} angles", mode, history.len());
        Some(history)
    }

    fn connected_remote(&self) -> Result<(Arc<dyn RemoteSensors>, String)> {
        let remote = self.remote.clone().ok_or(TiltError::NotConnected)?;
        let link = self.published.link.get();
        match (link.state, link.device_id) {
            (ConnectionState::Connected, Some(device_id)) => Ok((remote, device_id)),
            _ => Err(TiltError::NotConnected),
        }
    }

    fn on_sample(&mut self, generation: u64, event: SampleEvent) {
        let (mode, profile) = match &self.state {
            StreamState::Streaming {
                mode,
                generation: active,
                profile,
                ..
            } if *active == generation => (*mode, *profile),
            _ => {
                log::trace!("Discarding sample from inactive stream {}", generation);
                return;
            }
        };

        match event {
            SampleEvent::Gyroscope(sample) => {
                self.session.record_gyroscope(sample);
                if mode.uses_gyroscope() {
                    self.latest_gyro = Some(sample);
                }
            }
            SampleEvent::Accelerometer(sample) => {
                self.session.record_accelerometer(sample);
                let angle = self.fusion.advance(mode, sample, self.latest_gyro, &profile);
                self.session.append(angle);
                log::trace!("angle {:.3} (#{})", angle, self.session.len());
            }
        }
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        let ConnectionEvent { device_id, state } = event;
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                log::info!("{}: {:?}", device_id, state);
                self.published.link.set(RemoteLink {
                    device_id: Some(device_id),
                    state,
                });
            }
            ConnectionState::Disconnected => {
                let linked = self.published.link.with(|link| link.device_id.clone());
                if linked.as_deref().is_some_and(|id| id != device_id) {
                    log::debug!("Ignoring disconnect of {} (linked to {:?})", device_id, linked);
                    return;
                }
                log::info!("{}: Disconnected", device_id);
                if self.active_mode().map(StreamMode::source) == Some(SourceKind::Remote) {
                    log::warn!("{} dropped while streaming, stopping stream", device_id);
                    self.stop();
                }
                self.published.link.set(RemoteLink::default());
            }
        }
    }

    fn on_device_found(&mut self, device: DeviceInfo) {
        self.published.scanned_devices.update(|devices| {
            if devices.iter().all(|known| known.id != device.id) {
                log::debug!("Discovered {} ({:?})", device.id, device.name);
                devices.push(device);
            }
        });
    }

    fn begin_discovery(&mut self) -> Result<()> {
        let remote = self
            .remote
            .clone()
            .ok_or_else(|| TiltError::Transport("no remote sensor layer configured".into()))?;
        self.published.scanned_devices.set(Vec::new());
        self.published.paired_devices.set(remote.paired_devices());
        remote.start_discovery(DiscoverySink::new(self.sender.clone()))
    }
}

/// Negotiate the highest settings and start each requested channel.
/// Already-started channels are stopped again if a later one fails.
fn start_remote_streams(
    remote: &dyn RemoteSensors,
    device_id: &str,
    sensors: Sensors,
    sink: &SampleSink,
) -> Result<()> {
    for sensor in sensors.iter() {
        let started = remote.stream_settings(device_id, sensor).and_then(|available| {
            let setting = available.maximum();
            log::debug!("{:?} settings for {}: {:?}", sensor, device_id, setting);
            remote.start_stream(device_id, sensor, &setting, sink.clone())
        });
        if let Err(e) = started {
            log::error!("Failed to start {:?} stream on {}: {}", sensor, device_id, e);
            remote.stop_streams(device_id);
            return Err(e);
        }
    }
    Ok(())
}
