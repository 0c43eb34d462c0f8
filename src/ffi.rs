//! C FFI layer for tiltmeter.
//!
//! Provides an opaque controller handle for C/C++ consumers that receive
//! motion callbacks from their own platform and push them in. Only local
//! streams are exposed here. The generated C header is written to
//! `include/tiltmeter.h` by cbindgen.

use crate::config::ControllerConfig;
use crate::controller::StreamController;
use crate::error::LastError;
use crate::source::HostSensors;
use crate::types::{Sensors, StreamMode, Vector3};
use crate::TiltError;
use std::ffi::{c_char, c_int, CStr};
use std::path::PathBuf;
use std::sync::Arc;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Opaque controller handle for C consumers.
pub struct TmController {
    controller: StreamController,
    sensors: Arc<HostSensors>,
}

unsafe fn optional_path(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    let s = CStr::from_ptr(ptr).to_string_lossy();
    (!s.is_empty()).then(|| PathBuf::from(s.as_ref()))
}

/// Counts beyond `c_int::MAX` saturate instead of wrapping negative.
fn count_to_c_int(count: usize) -> c_int {
    c_int::try_from(count).unwrap_or(c_int::MAX)
}

fn report<T>(result: crate::Result<T>) -> Option<T> {
    match result {
        Ok(value) => {
            LAST_ERROR.clear();
            Some(value)
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            None
        }
    }
}

/// Create a controller backed by host-fed sensors.
///
/// `sensors` is a bitmask: 1 = accelerometer, 2 = gyroscope.
/// `archive_path` and `export_dir` may be null to use the `TILTMETER_*`
/// environment or the per-user defaults.
/// Returns NULL on error (check tm_last_error()).
///
/// # Safety
/// `archive_path` and `export_dir` must be null or valid null-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn tm_controller_new(
    archive_path: *const c_char,
    export_dir: *const c_char,
    sensors: u32,
) -> *mut TmController {
    let mut config = ControllerConfig::from_env();
    if let Some(path) = optional_path(archive_path) {
        config.archive_path = path;
    }
    if let Some(dir) = optional_path(export_dir) {
        config.export_dir = dir;
    }

    let host = Arc::new(HostSensors::new(Sensors::from_bits_truncate(sensors)));
    match report(StreamController::open(&config, host.clone(), None)) {
        Some(controller) => Box::into_raw(Box::new(TmController {
            controller,
            sensors: host,
        })),
        None => std::ptr::null_mut(),
    }
}

/// Stop any active stream, archive it and free the controller.
///
/// # Safety
/// `ctrl` must be a pointer returned by `tm_controller_new`, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_controller_free(ctrl: *mut TmController) {
    if !ctrl.is_null() {
        drop(Box::from_raw(ctrl));
    }
}

/// Start a local stream. A running stream is stopped and archived first.
/// Returns the started `StreamMode`, or -1 on error.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_start_local(ctrl: *mut TmController, with_gyroscope: bool) -> c_int {
    if ctrl.is_null() {
        return -1;
    }
    let ctrl = &*ctrl;
    let sensors = if with_gyroscope {
        Sensors::ACCELEROMETER | Sensors::GYROSCOPE
    } else {
        Sensors::ACCELEROMETER
    };
    report(ctrl.controller.start_local(sensors))
        .map(|mode| mode as c_int)
        .unwrap_or(-1)
}

/// Stop the active stream and archive it.
/// Returns the number of angles in the finished session (0 if idle), or -1 on error.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_stop(ctrl: *mut TmController) -> c_int {
    if ctrl.is_null() {
        return -1;
    }
    let ctrl = &*ctrl;
    match report(ctrl.controller.stop()) {
        Some(history) => history.map_or(0, |h| count_to_c_int(h.len())),
        None => -1,
    }
}

/// Active stream mode, or -1 when idle.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_stream_mode(ctrl: *const TmController) -> c_int {
    if ctrl.is_null() {
        return -1;
    }
    let ctrl = &*ctrl;
    ctrl.controller
        .mode()
        .get()
        .map_or(-1, |mode: StreamMode| mode as c_int)
}

/// Push an accelerometer reading (m/s^2). Returns false when no stream
/// is consuming accelerometer data.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_push_accelerometer(
    ctrl: *const TmController,
    x: f64,
    y: f64,
    z: f64,
) -> bool {
    if ctrl.is_null() {
        return false;
    }
    let ctrl = &*ctrl;
    ctrl.sensors.push_accelerometer(Vector3::new(x, y, z))
}

/// Push a gyroscope reading (rad/s). Returns false when no stream is
/// consuming gyroscope data.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_push_gyroscope(ctrl: *const TmController, x: f64, y: f64, z: f64) -> bool {
    if ctrl.is_null() {
        return false;
    }
    let ctrl = &*ctrl;
    ctrl.sensors.push_gyroscope(Vector3::new(x, y, z))
}

/// Read the most recent angle in degrees.
/// Returns false if no angle has been computed yet.
///
/// # Safety
/// `ctrl` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_current_angle(ctrl: *const TmController, out: *mut f64) -> bool {
    if ctrl.is_null() || out.is_null() {
        return false;
    }
    let ctrl = &*ctrl;
    match ctrl.controller.session().current_angle.get() {
        Some(angle) => {
            out.write(angle);
            true
        }
        None => false,
    }
}

/// Number of angles in the live (or last stopped) session.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_history_len(ctrl: *const TmController) -> usize {
    if ctrl.is_null() {
        return 0;
    }
    let ctrl = &*ctrl;
    ctrl.controller.session().history.len()
}

/// Copy up to `max` angles of the live session, oldest first.
/// Returns the number written.
///
/// # Safety
/// `out` must point to an array of at least `max` doubles, or be null.
#[no_mangle]
pub unsafe extern "C" fn tm_history_copy(ctrl: *const TmController, out: *mut f64, max: usize) -> usize {
    if ctrl.is_null() || out.is_null() {
        return 0;
    }
    let ctrl = &*ctrl;
    ctrl.controller.session().history.with(|history| {
        let count = history.len().min(max);
        std::ptr::copy_nonoverlapping(history.as_ptr(), out, count);
        count
    })
}

/// Number of archived sessions.
///
/// # Safety
/// `ctrl` must be a valid controller pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_session_count(ctrl: *const TmController) -> usize {
    if ctrl.is_null() {
        return 0;
    }
    let ctrl = &*ctrl;
    ctrl.controller.archive().sessions().with(Vec::len)
}

/// Copy up to `max` angles of archived session `index` (oldest session is 0).
/// Returns the number written, or -1 if `index` is out of range.
///
/// # Safety
/// `out` must point to an array of at least `max` doubles, or be null.
#[no_mangle]
pub unsafe extern "C" fn tm_session_copy(
    ctrl: *const TmController,
    index: usize,
    out: *mut f64,
    max: usize,
) -> isize {
    if ctrl.is_null() {
        return -1;
    }
    let ctrl = &*ctrl;
    ctrl.controller.archive().sessions().with(|sessions| match sessions.get(index) {
        Some(session) if !out.is_null() => {
            let count = session.len().min(max);
            std::ptr::copy_nonoverlapping(session.as_ptr(), out, count);
            count as isize
        }
        Some(_) => 0,
        None => -1,
    })
}

/// Export the live (or last stopped) session to `<export_dir>/<name>.csv`.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `ctrl` must be a valid controller pointer and `name` a valid
/// null-terminated string, or null.
#[no_mangle]
pub unsafe extern "C" fn tm_write_current(ctrl: *const TmController, name: *const c_char) -> c_int {
    if ctrl.is_null() || name.is_null() {
        return -1;
    }
    let ctrl = &*ctrl;
    let name = match CStr::from_ptr(name).to_str() {
        Ok(name) => name,
        Err(_) => {
            LAST_ERROR.set(&TiltError::InvalidDeviceArgument(
                "export name is not valid UTF-8".into(),
            ));
            return -1;
        }
    };
    match report(ctrl.controller.write_current_to_file(name)) {
        Some(path) => {
            log::debug!("Exported via C API to {}", path.display());
            0
        }
        None => -1,
    }
}

/// Get the last error message. Returns NULL if the last call succeeded.
/// The returned pointer is valid until the next tiltmeter API call.
#[no_mangle]
pub extern "C" fn tm_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_local_session_through_c_api() {
        let dir = std::env::temp_dir().join(format!("tiltmeter-ffi-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let archive = CString::new(dir.join("sessions.txt").to_string_lossy().as_ref()).unwrap();
        let export = CString::new(dir.to_string_lossy().as_ref()).unwrap();

        unsafe {
            let ctrl = tm_controller_new(archive.as_ptr(), export.as_ptr(), 1);
            assert!(!ctrl.is_null());
            assert_eq!(tm_stream_mode(ctrl), -1);

            assert_eq!(tm_start_local(ctrl, true), -1);
            assert!(!tm_last_error().is_null());

            assert_eq!(
                tm_start_local(ctrl, false),
                StreamMode::LocalAccelerometerOnly as c_int
            );
            assert!(tm_push_accelerometer(ctrl, 0.0, 0.0, 9.8));
            assert!(!tm_push_gyroscope(ctrl, 0.1, 0.0, 0.0));
            assert_eq!(tm_stop(ctrl), 1);

            let mut angle = 0.0;
            assert!(tm_current_angle(ctrl, &mut angle));
            assert_eq!(angle, 90.0);

            let mut history = [0.0; 4];
            assert_eq!(tm_history_len(ctrl), 1);
            assert_eq!(tm_history_copy(ctrl, history.as_mut_ptr(), history.len()), 1);
            assert_eq!(history[0], 90.0);

            assert_eq!(tm_session_count(ctrl), 1);
            assert_eq!(tm_session_copy(ctrl, 0, history.as_mut_ptr(), history.len()), 1);
            assert_eq!(tm_session_copy(ctrl, 5, history.as_mut_ptr(), history.len()), -1);

            let name = CString::new("ffi").unwrap();
            assert_eq!(tm_write_current(ctrl, name.as_ptr()), 0);
            assert!(tm_last_error().is_null());
            assert!(dir.join("ffi.csv").exists());

            tm_controller_free(ctrl);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_counts_saturate_at_c_int_max() {
        assert_eq!(count_to_c_int(0), 0);
        assert_eq!(count_to_c_int(2048), 2048);
        assert_eq!(count_to_c_int(c_int::MAX as usize), c_int::MAX);
        assert_eq!(count_to_c_int(c_int::MAX as usize + 1), c_int::MAX);
        assert_eq!(count_to_c_int(usize::MAX), c_int::MAX);
    }

    #[test]
    fn test_null_handles_are_rejected() {
        unsafe {
            assert_eq!(tm_start_local(std::ptr::null_mut(), false), -1);
            assert_eq!(tm_stop(std::ptr::null_mut()), -1);
            assert!(!tm_push_accelerometer(std::ptr::null(), 0.0, 0.0, 0.0));
            assert_eq!(tm_history_len(std::ptr::null()), 0);
            tm_controller_free(std::ptr::null_mut());
        }
    }
}
