/// Raw three-axis sensor reading.
///
/// Units depend on the source: accelerometers deliver m/s² (local) or
/// milli-g counts (remote), gyroscopes rad/s (local) or deg/s (remote).
/// See [`crate::estimator::SourceProfile`] for the conversions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Component-wise scale.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
            z: self.z * factor,
        }
    }
}

impl From<[f64; 3]> for Vector3 {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// A single reading pushed by a sample source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleEvent {
    Accelerometer(Vector3),
    Gyroscope(Vector3),
}

bitflags::bitflags! {
    /// Motion sensor channels, used both for stream requests and for the
    /// channels a source is able to deliver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(C)]
    pub struct Sensors: u32 {
        const ACCELEROMETER = 1 << 0;
        const GYROSCOPE     = 1 << 1;
    }
}

/// Which kind of sample source feeds a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// The host device's built-in sensors.
    Local,
    /// A connected BLE peripheral.
    Remote,
}

/// The active streaming configuration. At most one is active at a time.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamMode {
    LocalAccelerometerOnly = 0,
    LocalAccelerometerAndGyroscope = 1,
    RemoteAccelerometerOnly = 2,
    RemoteAccelerometerAndGyroscope = 3,
}

impl StreamMode {
    /// Build the mode for a source and a channel request.
    ///
    /// Any request containing the gyroscope selects the fused mode; the
    /// accelerometer is always part of a stream.
    pub fn new(source: SourceKind, sensors: Sensors) -> Self {
        let gyro = sensors.contains(Sensors::GYROSCOPE);
        match (source, gyro) {
            (SourceKind::Local, false) => StreamMode::LocalAccelerometerOnly,
            (SourceKind::Local, true) => StreamMode::LocalAccelerometerAndGyroscope,
            (SourceKind::Remote, false) => StreamMode::RemoteAccelerometerOnly,
            (SourceKind::Remote, true) => StreamMode::RemoteAccelerometerAndGyroscope,
        }
    }

    pub fn source(self) -> SourceKind {
        match self {
            StreamMode::LocalAccelerometerOnly | StreamMode::LocalAccelerometerAndGyroscope => {
                SourceKind::Local
            }
            StreamMode::RemoteAccelerometerOnly | StreamMode::RemoteAccelerometerAndGyroscope => {
                SourceKind::Remote
            }
        }
    }

    pub fn uses_gyroscope(self) -> bool {
        matches!(
            self,
            StreamMode::LocalAccelerometerAndGyroscope
                | StreamMode::RemoteAccelerometerAndGyroscope
        )
    }

    /// Channels that must be registered for this mode.
    pub fn sensors(self) -> Sensors {
        if self.uses_gyroscope() {
            Sensors::ACCELEROMETER | Sensors::GYROSCOPE
        } else {
            Sensors::ACCELEROMETER
        }
    }
}

/// Connection state of the remote peripheral.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

/// Connection callback from the BLE layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub device_id: String,
    pub state: ConnectionState,
}

/// A discovered or bonded remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Vendor device identifier (e.g. the 8-character Polar id).
    pub id: String,
    pub name: Option<String>,
    pub paired: bool,
    /// Channels the device can stream online.
    pub sensors: Sensors,
}

/// Stream parameters a remote device offers for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SensorSetting {
    pub sample_rates_hz: Vec<u32>,
    pub ranges: Vec<u32>,
    pub resolutions: Vec<u32>,
}

impl SensorSetting {
    /// Select the highest offered value of every parameter.
    pub fn maximum(&self) -> SensorSetting {
        fn max_only(values: &[u32]) -> Vec<u32> {
            values.iter().max().map(|v| vec![*v]).unwrap_or_default()
        }
        SensorSetting {
            sample_rates_hz: max_only(&self.sample_rates_hz),
            ranges: max_only(&self.ranges),
            resolutions: max_only(&self.resolutions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_mode_from_request() {
        let mode = StreamMode::new(SourceKind::Remote, Sensors::ACCELEROMETER | Sensors::GYROSCOPE);
        assert_eq!(mode, StreamMode::RemoteAccelerometerAndGyroscope);
        assert_eq!(mode.source(), SourceKind::Remote);
        assert!(mode.uses_gyroscope());

        let mode = StreamMode::new(SourceKind::Local, Sensors::ACCELEROMETER);
        assert_eq!(mode.sensors(), Sensors::ACCELEROMETER);
        assert!(!mode.uses_gyroscope());
    }

    #[test]
    fn test_sensor_setting_maximum() {
        let available = SensorSetting {
            sample_rates_hz: vec![25, 50, 100, 200],
            ranges: vec![2, 4, 8],
            resolutions: vec![16],
        };
        let max = available.maximum();
        assert_eq!(max.sample_rates_hz, vec![200]);
        assert_eq!(max.ranges, vec![8]);
        assert_eq!(max.resolutions, vec![16]);
        assert_eq!(SensorSetting::default().maximum(), SensorSetting::default());
    }
}
