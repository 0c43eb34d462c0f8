//! Stream synthetic tilt estimates as JSON lines.
//!
//! Outputs one JSON object per accelerometer sample:
//!
//! {"angle":37.42,"n":118,"t":2.360}
//!
//! Usage: cargo run --example stream_json [--accel-only]

use std::f64::consts::PI;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiltmeter::{ControllerConfig, HostSensors, Sensors, StreamController, Vector3};

fn main() {
    env_logger::init();

    let sensors = if std::env::args().any(|a| a == "--accel-only") {
        Sensors::ACCELEROMETER
    } else {
        Sensors::ACCELEROMETER | Sensors::GYROSCOPE
    };

    let host = Arc::new(HostSensors::new(Sensors::all()));
    let controller = match StreamController::open(&ControllerConfig::from_env(), host.clone(), None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create controller: {}", e);
            std::process::exit(1);
        }
    };

    let angles = controller.session().current_angle.subscribe();
    if let Err(e) = controller.start_local(sensors) {
        eprintln!("Failed to start stream: {}", e);
        std::process::exit(1);
    }

    // The sensor side runs on its own thread, as platform callbacks would.
    let producer = {
        let host = host.clone();
        std::thread::Builder::new()
            .name("synthetic-sensors".into())
            .spawn(move || {
                let start = Instant::now();
                loop {
                    let t = start.elapsed().as_secs_f64();
                    let pitch = (45.0 + 30.0 * (2.0 * PI * t / 8.0).sin()).to_radians();
                    let rate = (30.0 * 2.0 * PI / 8.0 * (2.0 * PI * t / 8.0).cos()).to_radians();
                    host.push_gyroscope(Vector3::new(rate, 0.0, 0.0));
                    if !host.push_accelerometer(Vector3::new(0.3, 9.81 * pitch.sin(), 9.81 * pitch.cos())) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            })
    };
    if let Err(e) = producer {
        eprintln!("Failed to spawn sensor thread: {}", e);
        std::process::exit(1);
    }

    eprintln!("Streaming JSON (Ctrl+C to stop)...");

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    let start = Instant::now();
    let mut n: u64 = 0;

    loop {
        match angles.recv_timeout(Duration::from_secs(2)) {
            Ok(Some(angle)) => {
                n += 1;
                let _ = writeln!(
                    out,
                    "{{\"angle\":{:.2},\"n\":{},\"t\":{:.3}}}",
                    angle,
                    n,
                    start.elapsed().as_secs_f64(),
                );
                let _ = out.flush();
            }
            Ok(None) => {}
            Err(_) => {
                eprintln!("No estimate for 2s, stopping");
                break;
            }
        }
    }
}
