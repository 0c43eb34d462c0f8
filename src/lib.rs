//! # tiltmeter - tilt estimation from accelerometer and gyroscope streams
//!
//! Turns raw motion readings into a tilt angle in degrees. Provides:
//! - Accelerometer-only smoothing and accelerometer/gyroscope complementary fusion
//! - One active stream at a time, from the host's sensors or a BLE peripheral
//! - An archive of finished sessions and flat-file export
//! - C FFI for integration with C/C++/Swift/Kotlin hosts
//!
//! ## Quick Start
//! ```no_run
//! use tiltmeter::{ControllerConfig, HostSensors, Sensors, StreamController, Vector3};
//! use std::sync::Arc;
//!
//! let sensors = Arc::new(HostSensors::new(Sensors::all()));
//! let config = ControllerConfig::from_env();
//! let controller = StreamController::open(&config, sensors.clone(), None).unwrap();
//!
//! controller.start_local(Sensors::ACCELEROMETER | Sensors::GYROSCOPE).unwrap();
//! sensors.push_gyroscope(Vector3::new(0.02, 0.0, 0.0));
//! sensors.push_accelerometer(Vector3::new(0.3, 9.6, 1.1));
//!
//! let history = controller.stop().unwrap().unwrap_or_default();
//! println!("angles: {:?}", history);
//! controller.export("session", &history).unwrap();
//! ```

pub mod error;
pub mod types;
pub mod estimator;
pub mod observable;
pub mod session;
pub mod source;
pub mod config;
pub mod archive;
pub mod controller;
pub mod ffi;

pub use archive::SessionArchive;
pub use config::ControllerConfig;
pub use controller::{RemoteLink, SessionSnapshot, StreamController};
pub use error::TiltError;
pub use estimator::{FusionState, SourceProfile};
pub use observable::Observable;
pub use session::{History, HistoryChange, SessionView};
pub use source::{ConnectionSink, DiscoverySink, HostSensors, LocalSensors, RemoteSensors, SampleSink};
pub use types::*;

/// Result type alias for tiltmeter operations.
pub type Result<T> = std::result::Result<T, TiltError>;
