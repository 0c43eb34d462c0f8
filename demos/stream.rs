//! Run a synthetic local session and print the estimated tilt.
//!
//! A simulated phone is rocked back and forth at ~50 Hz and fed through
//! `HostSensors`. The finished session is archived and exported.
//!
//! Usage: cargo run --example stream [seconds] [--accel-only]

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiltmeter::{ControllerConfig, HostSensors, Sensors, StreamController, Vector3};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(20);
const GRAVITY: f64 = 9.80665;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let seconds: u64 = args
        .iter()
        .find_map(|a| a.parse().ok())
        .unwrap_or(10);
    let sensors = if args.iter().any(|a| a == "--accel-only") {
        Sensors::ACCELEROMETER
    } else {
        Sensors::ACCELEROMETER | Sensors::GYROSCOPE
    };

    let config = ControllerConfig::from_env();
    let host = Arc::new(HostSensors::new(Sensors::all()));
    let controller = match StreamController::open(&config, host.clone(), None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to create controller: {}", e);
            std::process::exit(1);
        }
    };

    println!("Archive:  {}", config.archive_path.display());
    println!("Exports:  {}", config.export_dir.display());
    println!("Archived: {} session(s)", controller.archive().list_sessions().len());
    println!();

    let mode = match controller.start_local(sensors) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to start stream: {}", e);
            std::process::exit(1);
        }
    };
    println!("Streaming {:?} for {}s...", mode, seconds);

    let angles = controller.session().current_angle.subscribe();
    let start = Instant::now();
    let mut count: u64 = 0;

    while start.elapsed() < Duration::from_secs(seconds) {
        let t = start.elapsed().as_secs_f64();
        let (acc, gyro) = rocking_phone(t);
        host.push_gyroscope(gyro);
        host.push_accelerometer(acc);

        for angle in angles.try_iter().flatten() {
            count += 1;
            // Print every ~10th estimate to avoid flooding the terminal
            if count % 10 == 1 {
                println!("t={:>6.2}s  angle={:>7.2}°", t, angle);
            }
        }
        std::thread::sleep(SAMPLE_INTERVAL);
    }

    let history = match controller.stop() {
        Ok(h) => h.unwrap_or_default(),
        Err(e) => {
            eprintln!("Failed to stop stream: {}", e);
            std::process::exit(1);
        }
    };

    let elapsed = start.elapsed().as_secs_f64();
    println!(
        "\nTotal: {} angles in {:.1}s ({:.1} Hz)",
        history.len(),
        elapsed,
        history.len() as f64 / elapsed
    );
    println!("Archived: {} session(s)", controller.archive().list_sessions().len());

    match controller.export("last_session", &history) {
        Ok(path) => println!("Exported: {}", path.display()),
        Err(e) => eprintln!("Export failed: {}", e),
    }
}

/// Phone pitched 20..60 degrees around its x axis, period 5 s.
/// Returns (accelerometer m/s², gyroscope rad/s).
fn rocking_phone(t: f64) -> (Vector3, Vector3) {
    let omega = 2.0 * PI / 5.0;
    let pitch = (40.0 + 20.0 * (omega * t).sin()).to_radians();
    let rate = (20.0 * omega * (omega * t).cos()).to_radians();
    let acc = Vector3::new(0.05 * GRAVITY, GRAVITY * pitch.sin(), GRAVITY * pitch.cos());
    (acc, Vector3::new(rate, 0.0, 0.0))
}
