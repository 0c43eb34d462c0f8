//! Tilt server: synthetic sensor stream → WebSocket → browser.
//!
//!   - Runs a local fused stream fed by a simulated phone
//!   - Broadcasts each estimate as JSON over WebSocket
//!   - Serves a minimal live page on plain HTTP
//!
//! Usage:
//!   cargo run --example server
//!   Open http://localhost:8080

use std::f64::consts::PI;
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tiltmeter::{ControllerConfig, HostSensors, Sensors, StreamController, Vector3};
use tungstenite::Message;

const PORT: u16 = 8080;

type WsClient = Arc<Mutex<tungstenite::WebSocket<TcpStream>>>;

const PAGE: &str = r#"<!doctype html>
<html><body style="font:48px monospace;text-align:center;margin-top:20vh">
<div id="angle">--</div>
<script>
const ws = new WebSocket(`ws://${location.host}/`);
ws.onmessage = (e) => {
  const m = JSON.parse(e.data);
  document.getElementById("angle").textContent = m.angle.toFixed(1) + "°";
};
</script></body></html>"#;

fn main() {
    env_logger::init();

    let clients: Arc<Mutex<Vec<WsClient>>> = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(AtomicBool::new(true));

    let stream_clients = clients.clone();
    let stream_running = running.clone();
    let stream_thread = std::thread::Builder::new()
        .name("tilt-stream".into())
        .spawn(move || stream_loop(stream_clients, stream_running))
        .expect("Failed to spawn stream thread");

    let listener = TcpListener::bind(format!("0.0.0.0:{}", PORT)).unwrap_or_else(|e| {
        eprintln!("Failed to bind port {}: {}", PORT, e);
        std::process::exit(1);
    });
    eprintln!("[HTTP] http://localhost:{}", PORT);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                eprintln!("[TCP] accept error: {}", e);
                continue;
            }
        };
        let clients = clients.clone();
        std::thread::spawn(move || handle_connection(stream, clients));
    }

    running.store(false, Ordering::Relaxed);
    let _ = stream_thread.join();
}

/// Route incoming connection to WebSocket or HTTP handler.
fn handle_connection(stream: TcpStream, clients: Arc<Mutex<Vec<WsClient>>>) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream.set_nodelay(true).ok();

    let mut peek_buf = [0u8; 4096];
    let n = match stream.peek(&mut peek_buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&peek_buf[..n]).to_ascii_lowercase();

    if request.contains("upgrade: websocket") {
        handle_websocket(stream, clients);
    } else {
        handle_http(stream);
    }
}

/// Add the client to the broadcast list and wait until a failed send drops it.
fn handle_websocket(stream: TcpStream, clients: Arc<Mutex<Vec<WsClient>>>) {
    // Keeps the stream thread from blocking on a slow client
    stream.set_write_timeout(Some(Duration::from_secs(2))).ok();

    let ws = match tungstenite::accept(stream) {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("[WS] handshake error: {}", e);
            return;
        }
    };

    let ws = Arc::new(Mutex::new(ws));
    {
        let mut list = clients.lock().unwrap();
        list.push(ws.clone());
        eprintln!("[WS] Client connected ({} total)", list.len());
    }

    loop {
        std::thread::sleep(Duration::from_secs(1));
        let still_active = clients.lock().unwrap().iter().any(|c| Arc::ptr_eq(c, &ws));
        if !still_active {
            break;
        }
    }
    eprintln!("[WS] Client disconnected ({} total)", clients.lock().unwrap().len());
}

fn handle_http(mut stream: TcpStream) {
    let mut request_buf = vec![0u8; 8192];
    let _ = stream.read(&mut request_buf);

    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        PAGE.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(PAGE.as_bytes());
    let _ = stream.flush();
}

/// Feed a simulated phone into a local stream and broadcast every estimate.
fn stream_loop(clients: Arc<Mutex<Vec<WsClient>>>, running: Arc<AtomicBool>) {
    let host = Arc::new(HostSensors::new(Sensors::all()));
    let controller = match StreamController::open(&ControllerConfig::from_env(), host.clone(), None) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[TILT] Failed to create controller: {}", e);
            return;
        }
    };
    let angles = controller.session().current_angle.subscribe();
    if let Err(e) = controller.start_local(Sensors::ACCELEROMETER | Sensors::GYROSCOPE) {
        eprintln!("[TILT] Failed to start stream: {}", e);
        return;
    }
    eprintln!("[TILT] Streaming estimates to WebSocket clients...");

    let start = Instant::now();
    let mut sent: u64 = 0;
    let mut last_report = Instant::now();

    while running.load(Ordering::Relaxed) {
        let t = start.elapsed().as_secs_f64();
        let pitch = (30.0 + 25.0 * (2.0 * PI * t / 6.0).sin()).to_radians();
        let rate = (25.0 * 2.0 * PI / 6.0 * (2.0 * PI * t / 6.0).cos()).to_radians();
        host.push_gyroscope(Vector3::new(rate, 0.0, 0.0));
        host.push_accelerometer(Vector3::new(0.2, 9.81 * pitch.sin(), 9.81 * pitch.cos()));

        for angle in angles.try_iter().flatten() {
            let msg = Message::text(format!("{{\"angle\":{:.3},\"t\":{:.3}}}", angle, t));
            let mut list = clients.lock().unwrap();
            list.retain(|ws| ws.lock().unwrap().send(msg.clone()).is_ok());
            sent += 1;
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            let count = clients.lock().unwrap().len();
            eprintln!("[TILT] {} estimates sent, {} client(s)", sent, count);
            sent = 0;
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    match controller.stop() {
        Ok(Some(history)) => eprintln!("[TILT] Archived session of {} angles", history.len()),
        Ok(None) => {}
        Err(e) => eprintln!("[TILT] Failed to stop stream: {}", e),
    }
}
