//! Sample sources and the sinks they deliver into.
//!
//! Sources never touch estimator state. They push readings into a
//! [`SampleSink`], which forwards them onto the stream worker's sample
//! queue tagged with the generation of the stream they were registered for.

use crate::controller::{SampleMessage, WorkerMessage};
use crate::estimator::SourceProfile;
use crate::types::{ConnectionEvent, ConnectionState, DeviceInfo, SampleEvent, SensorSetting, Sensors, Vector3};
use crate::{Result, TiltError};
use crossbeam_channel::Sender;
use std::sync::{Mutex, PoisonError};

/// Delivery handle for one stream's samples.
///
/// Cheap to clone and safe to use from any sensor callback thread. When the
/// worker queue is full, `push` blocks until the worker has room, so every
/// sample is delivered in order. Sources must not wait for their own
/// callbacks to finish inside `unregister`/`stop_streams`.
#[derive(Debug, Clone)]
pub struct SampleSink {
    generation: u64,
    sender: Sender<SampleMessage>,
}

impl SampleSink {
    pub(crate) fn new(generation: u64, sender: Sender<SampleMessage>) -> Self {
        Self { generation, sender }
    }

    /// Returns `false` once the controller is gone.
    pub fn push(&self, event: SampleEvent) -> bool {
        let message = SampleMessage {
            generation: self.generation,
            event,
        };
        match self.sender.send(message) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("Stream worker gone, sample discarded");
                false
            }
        }
    }

    pub fn accelerometer(&self, sample: Vector3) -> bool {
        self.push(SampleEvent::Accelerometer(sample))
    }

    pub fn gyroscope(&self, sample: Vector3) -> bool {
        self.push(SampleEvent::Gyroscope(sample))
    }
}

/// Connection callbacks from the BLE layer. Never blocks, so it may be
/// called from inside any [`RemoteSensors`] method.
#[derive(Debug, Clone)]
pub struct ConnectionSink {
    sender: Sender<WorkerMessage>,
}

impl ConnectionSink {
    pub(crate) fn new(sender: Sender<WorkerMessage>) -> Self {
        Self { sender }
    }

    pub fn notify(&self, device_id: &str, state: ConnectionState) -> bool {
        let event = ConnectionEvent {
            device_id: device_id.to_string(),
            state,
        };
        self.sender.send(WorkerMessage::Connection(event)).is_ok()
    }

    pub fn connecting(&self, device_id: &str) -> bool {
        self.notify(device_id, ConnectionState::Connecting)
    }

    pub fn connected(&self, device_id: &str) -> bool {
        self.notify(device_id, ConnectionState::Connected)
    }

    pub fn disconnected(&self, device_id: &str) -> bool {
        self.notify(device_id, ConnectionState::Disconnected)
    }
}

/// Discovery callbacks from the BLE layer. Never blocks.
#[derive(Debug, Clone)]
pub struct DiscoverySink {
    sender: Sender<WorkerMessage>,
}

impl DiscoverySink {
    pub(crate) fn new(sender: Sender<WorkerMessage>) -> Self {
        Self { sender }
    }

    pub fn found(&self, device: DeviceInfo) -> bool {
        self.sender.send(WorkerMessage::DeviceFound(device)).is_ok()
    }
}

/// The host device's built-in motion sensors.
pub trait LocalSensors: Send + Sync {
    /// Channels this device has.
    fn available(&self) -> Sensors;

    /// Start delivering the requested channels into `sink`.
    fn register(&self, sensors: Sensors, sink: SampleSink) -> Result<()>;

    /// Stop delivering. Must be idempotent.
    fn unregister(&self);

    fn profile(&self) -> SourceProfile {
        SourceProfile::LOCAL
    }
}

/// A BLE peripheral that streams motion data (e.g. a Polar strap).
///
/// Methods request work from the vendor layer and return without waiting
/// for the hardware; connection progress is reported through the
/// [`ConnectionSink`] handed over in [`attach`](Self::attach).
pub trait RemoteSensors: Send + Sync {
    /// Called once when the controller is created.
    fn attach(&self, connection: ConnectionSink);

    fn connect(&self, device_id: &str) -> Result<()>;

    fn disconnect(&self, device_id: &str) -> Result<()>;

    fn start_discovery(&self, sink: DiscoverySink) -> Result<()>;

    fn stop_discovery(&self);

    /// Devices already bonded with the host.
    fn paired_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    /// Stream parameters the device offers for one channel.
    fn stream_settings(&self, device_id: &str, sensor: Sensors) -> Result<SensorSetting>;

    fn start_stream(
        &self,
        device_id: &str,
        sensor: Sensors,
        setting: &SensorSetting,
        sink: SampleSink,
    ) -> Result<()>;

    /// Stop every stream of the device. Must be idempotent.
    fn stop_streams(&self, device_id: &str);

    fn profile(&self) -> SourceProfile {
        SourceProfile::REMOTE
    }
}

/// Local sensors fed by the host application.
///
/// Platforms that receive sensor callbacks outside Rust (a mobile runtime,
/// the C API, a simulator) push readings here; they are forwarded only while
/// a stream has the matching channel registered.
#[derive(Debug)]
pub struct HostSensors {
    available: Sensors,
    profile: SourceProfile,
    registration: Mutex<Option<(Sensors, SampleSink)>>,
}

impl HostSensors {
    pub fn new(available: Sensors) -> Self {
        Self::with_profile(available, SourceProfile::LOCAL)
    }

    /// Host sensors reporting in non-default units.
    pub fn with_profile(available: Sensors, profile: SourceProfile) -> Self {
        Self {
            available,
            profile,
            registration: Mutex::new(None),
        }
    }

    /// Forward an accelerometer reading. Returns whether it was delivered.
    pub fn push_accelerometer(&self, sample: Vector3) -> bool {
        self.push(Sensors::ACCELEROMETER, SampleEvent::Accelerometer(sample))
    }

    /// Forward a gyroscope reading. Returns whether it was delivered.
    pub fn push_gyroscope(&self, sample: Vector3) -> bool {
        self.push(Sensors::GYROSCOPE, SampleEvent::Gyroscope(sample))
    }

    /// Channels currently registered, empty when idle.
    pub fn registered(&self) -> Sensors {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(sensors, _)| *sensors)
            .unwrap_or_else(Sensors::empty)
    }

    fn push(&self, channel: Sensors, event: SampleEvent) -> bool {
        // Release the lock before a possibly blocking send so `unregister`
        // on the worker never waits behind a full queue.
        let sink = match self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some((sensors, sink)) if sensors.contains(channel) => sink.clone(),
            _ => return false,
        };
        sink.push(event)
    }
}

impl LocalSensors for HostSensors {
    fn available(&self) -> Sensors {
        self.available
    }

    fn register(&self, sensors: Sensors, sink: SampleSink) -> Result<()> {
        let missing = sensors.difference(self.available);
        if !missing.is_empty() {
            return Err(TiltError::SensorUnavailable(missing));
        }
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *registration = Some((sensors, sink));
        log::debug!("Host sensors registered: {:?}", sensors);
        Ok(())
    }

    fn unregister(&self) {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registration.take().is_some() {
            log::debug!("Host sensors unregistered");
        }
    }

    fn profile(&self) -> SourceProfile {
        self.profile
    }
}
