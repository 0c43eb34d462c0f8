//! Inclination estimation from accelerometer and gyroscope samples.
//!
//! The tilt angle is derived from the gravity component on the y axis:
//!
//! ```text
//! tilt = 90 - atan(y² / sqrt(x² + z²))   [degrees]
//! ```
//!
//! Accelerometer-only streams smooth successive tilts exponentially.
//! Fused streams blend the accelerometer tilt with an integrated gyroscope
//! angle, and recalibrate to zero whenever the y axis reads roughly 1 g.
//!
//! The two sample sources deliver different units, so every constant that
//! depends on units is carried by a [`SourceProfile`].

use crate::types::{StreamMode, Vector3};

/// Standard gravity in m/s².
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Weight of the new tilt in accelerometer-only smoothing (previous gets 0.1).
pub const SMOOTHING_WEIGHT: f64 = 0.9;

/// Weight of the accelerometer tilt in the complementary filter
/// (the integrated gyroscope angle gets 0.02).
pub const COMPLEMENTARY_WEIGHT: f64 = 0.98;

/// Integration step applied to each gyroscope rate sample.
pub const GYRO_STEP: f64 = 0.5;

/// Local y-axis reading (m/s²) treated as "upright", resets the fused angle.
pub const LOCAL_RESET_BAND_MPS2: ResetBand = ResetBand {
    low: 9.4,
    high: 10.0,
};

/// Remote y-axis reading (milli-g) treated as "upright", resets the fused angle.
pub const REMOTE_RESET_BAND_MILLI_G: ResetBand = ResetBand {
    low: 900.0,
    high: 1100.0,
};

/// Below this the tilt denominator is considered zero.
const MIN_TILT_DENOMINATOR: f64 = 1e-9;

/// Open interval on the raw accelerometer y component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResetBand {
    pub low: f64,
    pub high: f64,
}

impl ResetBand {
    /// Both bounds are exclusive.
    pub fn contains(&self, y: f64) -> bool {
        self.low < y && y < self.high
    }
}

/// Unit conventions and filter constants for one sample source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProfile {
    /// Multiplier turning raw accelerometer values into m/s².
    pub accel_to_mps2: f64,
    /// Raw y-axis band that triggers a fused-angle reset.
    pub reset_band: ResetBand,
    /// Multiplier turning raw gyroscope rates into deg/s.
    pub gyro_to_deg_per_s: f64,
    pub gyro_step: f64,
    pub complementary_weight: f64,
}

impl SourceProfile {
    /// Built-in phone sensors: m/s² and rad/s.
    pub const LOCAL: SourceProfile = SourceProfile {
        accel_to_mps2: 1.0,
        reset_band: LOCAL_RESET_BAND_MPS2,
        gyro_to_deg_per_s: 180.0 / std::f64::consts::PI,
        gyro_step: GYRO_STEP,
        complementary_weight: COMPLEMENTARY_WEIGHT,
    };

    /// Polar online streaming: milli-g counts and deg/s.
    pub const REMOTE: SourceProfile = SourceProfile {
        accel_to_mps2: STANDARD_GRAVITY / 1000.0,
        reset_band: REMOTE_RESET_BAND_MILLI_G,
        gyro_to_deg_per_s: 1.0,
        gyro_step: GYRO_STEP,
        complementary_weight: COMPLEMENTARY_WEIGHT,
    };
}

/// Tilt in degrees of a physical (m/s²) accelerometer vector.
///
/// Returns `None` when the x/z plane carries no gravity (the denominator
/// vanishes) or the inputs are not finite.
pub fn accelerometer_tilt(acc: Vector3) -> Option<f64> {
    let denominator = (acc.x * acc.x + acc.z * acc.z).sqrt();
    if denominator < MIN_TILT_DENOMINATOR {
        return None;
    }
    let tilt = 90.0 - (acc.y * acc.y / denominator).atan().to_degrees();
    tilt.is_finite().then_some(tilt)
}

/// Exponentially smoothed accelerometer-only estimate.
///
/// The first sample of a session (`previous == None`) is returned as-is.
/// A degenerate orientation keeps the previous angle, or 0 on the first
/// sample.
pub fn estimate_from_accelerometer(
    acc: Vector3,
    previous: Option<f64>,
    profile: &SourceProfile,
) -> f64 {
    let Some(raw) = accelerometer_tilt(acc.scaled(profile.accel_to_mps2)) else {
        log::trace!("Degenerate accelerometer sample {:?}", acc);
        return previous.unwrap_or(0.0);
    };
    match previous {
        None => raw,
        Some(prev) => SMOOTHING_WEIGHT * raw + (1.0 - SMOOTHING_WEIGHT) * prev,
    }
}

/// Output of one complementary-filter step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionEstimate {
    /// Fused angle in degrees.
    pub angle: f64,
    /// Integrated gyroscope angle in degrees, fed into the next step.
    pub gyro_integral: f64,
}

/// Complementary filter step.
pub fn estimate_from_fusion(
    acc: Vector3,
    gyro: Vector3,
    state: &FusionState,
    profile: &SourceProfile,
) -> FusionEstimate {
    if profile.reset_band.contains(acc.y) {
        return FusionEstimate {
            angle: 0.0,
            gyro_integral: 0.0,
        };
    }

    let from_acc = accelerometer_tilt(acc.scaled(profile.accel_to_mps2))
        .unwrap_or_else(|| state.previous_angle.unwrap_or(0.0));

    let rate = if gyro.x.is_finite() { gyro.x } else { 0.0 };
    let gyro_integral =
        state.gyro_integral + rate * profile.gyro_to_deg_per_s * profile.gyro_step;

    let w = profile.complementary_weight;
    FusionEstimate {
        angle: w * from_acc + (1.0 - w) * gyro_integral.abs(),
        gyro_integral,
    }
}

/// Estimator state carried between samples of one session.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FusionState {
    /// Last emitted angle; `None` until the first estimate of a session.
    pub previous_angle: Option<f64>,
    pub gyro_integral: f64,
}

impl FusionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the estimator selected by `mode` and store the result.
    ///
    /// In fused modes a missing gyroscope sample counts as zero rate.
    pub fn advance(
        &mut self,
        mode: StreamMode,
        acc: Vector3,
        gyro: Option<Vector3>,
        profile: &SourceProfile,
    ) -> f64 {
        let angle = if mode.uses_gyroscope() {
            let estimate = estimate_from_fusion(acc, gyro.unwrap_or(Vector3::ZERO), self, profile);
            self.gyro_integral = estimate.gyro_integral;
            estimate.angle
        } else {
            estimate_from_accelerometer(acc, self.previous_angle, profile)
        };
        self.previous_angle = Some(angle);
        angle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn reference_tilt(x: f64, y: f64, z: f64) -> f64 {
        90.0 - (y.powi(2) / (x.powi(2) + z.powi(2)).sqrt()).atan() * 180.0 / std::f64::consts::PI
    }

    #[test]
    fn test_tilt_flat_and_tilted() {
        // Gravity fully in the x/z plane: atan(0) = 0, tilt = 90.
        assert_relative_eq!(accelerometer_tilt(Vector3::new(0.0, 0.0, 9.8)).unwrap(), 90.0);

        let tilt = accelerometer_tilt(Vector3::new(3.0, 4.0, 5.0)).unwrap();
        assert_relative_eq!(tilt, reference_tilt(3.0, 4.0, 5.0), epsilon = 1e-12);
    }

    #[test]
    fn test_first_sample_is_unblended() {
        let acc = Vector3::new(1.2, 7.5, 5.1);
        let angle = estimate_from_accelerometer(acc, None, &SourceProfile::LOCAL);
        assert_eq!(angle, accelerometer_tilt(acc).unwrap());
    }

    #[test]
    fn test_smoothing_converges_monotonically() {
        let acc = Vector3::new(2.0, 6.0, 7.0);
        let raw = accelerometer_tilt(acc).unwrap();

        let mut previous = Some(0.0);
        let mut last_gap = (raw - 0.0).abs();
        for _ in 0..10 {
            let angle = estimate_from_accelerometer(acc, previous, &SourceProfile::LOCAL);
            let gap = (raw - angle).abs();
            assert!(gap < last_gap, "gap {} did not shrink below {}", gap, last_gap);
            last_gap = gap;
            previous = Some(angle);
        }
        assert!(last_gap < 1e-6);
    }

    #[test]
    fn test_smoothing_weights() {
        let acc = Vector3::new(0.0, 0.0, 9.8);
        let angle = estimate_from_accelerometer(acc, Some(50.0), &SourceProfile::LOCAL);
        assert_relative_eq!(angle, 0.9 * 90.0 + 0.1 * 50.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_accelerometer_is_guarded() {
        let acc = Vector3::new(0.0, 5.0, 0.0);
        assert_eq!(accelerometer_tilt(acc), None);
        assert_eq!(estimate_from_accelerometer(acc, Some(12.5), &SourceProfile::LOCAL), 12.5);
        assert_eq!(estimate_from_accelerometer(acc, None, &SourceProfile::LOCAL), 0.0);

        let state = FusionState {
            previous_angle: Some(20.0),
            gyro_integral: 0.0,
        };
        let estimate = estimate_from_fusion(acc, Vector3::ZERO, &state, &SourceProfile::LOCAL);
        assert!(estimate.angle.is_finite());
        assert_relative_eq!(estimate.angle, 0.98 * 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_non_finite_input_never_leaks() {
        let acc = Vector3::new(f64::NAN, 1.0, 1.0);
        assert_eq!(estimate_from_accelerometer(acc, Some(3.0), &SourceProfile::LOCAL), 3.0);

        let gyro = Vector3::new(f64::INFINITY, 0.0, 0.0);
        let estimate = estimate_from_fusion(
            Vector3::new(1.0, 2.0, 1.0),
            gyro,
            &FusionState::new(),
            &SourceProfile::LOCAL,
        );
        assert!(estimate.angle.is_finite());
        assert_eq!(estimate.gyro_integral, 0.0);
    }

    #[test]
    fn test_reset_band_zeroes_fusion() {
        let state = FusionState {
            previous_angle: Some(35.0),
            gyro_integral: 42.0,
        };
        for gyro in [Vector3::ZERO, Vector3::new(100.0, -3.0, 7.0)] {
            let estimate =
                estimate_from_fusion(Vector3::new(10.0, 1000.0, -4.0), gyro, &state, &SourceProfile::REMOTE);
            assert_eq!(estimate.angle, 0.0);
            assert_eq!(estimate.gyro_integral, 0.0);

            let estimate =
                estimate_from_fusion(Vector3::new(0.3, 9.7, 0.2), gyro, &state, &SourceProfile::LOCAL);
            assert_eq!(estimate.angle, 0.0);
            assert_eq!(estimate.gyro_integral, 0.0);
        }
    }

    #[test]
    fn test_reset_band_bounds_are_exclusive() {
        assert!(!REMOTE_RESET_BAND_MILLI_G.contains(900.0));
        assert!(REMOTE_RESET_BAND_MILLI_G.contains(900.5));
        assert!(!REMOTE_RESET_BAND_MILLI_G.contains(1100.0));
        assert!(!LOCAL_RESET_BAND_MPS2.contains(10.0));
        assert!(LOCAL_RESET_BAND_MPS2.contains(9.81));
        // 1000 milli-g is far outside the m/s² band.
        assert!(!LOCAL_RESET_BAND_MPS2.contains(1000.0));
    }

    #[test]
    fn test_fusion_remote_units() {
        let acc = Vector3::new(100.0, 500.0, 100.0);
        let gyro = Vector3::new(10.0, 0.0, 0.0);
        let estimate = estimate_from_fusion(acc, gyro, &FusionState::new(), &SourceProfile::REMOTE);

        let g = STANDARD_GRAVITY / 1000.0;
        let from_acc = reference_tilt(100.0 * g, 500.0 * g, 100.0 * g);
        assert_relative_eq!(estimate.gyro_integral, 5.0, epsilon = 1e-12);
        assert_relative_eq!(estimate.angle, 0.98 * from_acc + 0.02 * 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fusion_local_gyro_is_converted_to_degrees() {
        let state = FusionState {
            previous_angle: Some(1.0),
            gyro_integral: 2.0,
        };
        let gyro = Vector3::new(-1.0, 0.0, 0.0);
        let estimate =
            estimate_from_fusion(Vector3::new(0.0, 0.0, 9.8), gyro, &state, &SourceProfile::LOCAL);

        let integral = 2.0 - 0.5 * 180.0 / std::f64::consts::PI;
        assert_relative_eq!(estimate.gyro_integral, integral, epsilon = 1e-12);
        // Negative integrals contribute their magnitude.
        assert_relative_eq!(estimate.angle, 0.98 * 90.0 + 0.02 * integral.abs(), epsilon = 1e-9);
    }

    #[test]
    fn test_state_advance_threads_integral() {
        let mut state = FusionState::new();
        let mode = StreamMode::RemoteAccelerometerAndGyroscope;
        let acc = Vector3::new(400.0, 300.0, 0.0);
        let gyro = Vector3::new(4.0, 0.0, 0.0);

        let first = state.advance(mode, acc, Some(gyro), &SourceProfile::REMOTE);
        assert_eq!(state.previous_angle, Some(first));
        assert_relative_eq!(state.gyro_integral, 2.0);

        state.advance(mode, acc, Some(gyro), &SourceProfile::REMOTE);
        assert_relative_eq!(state.gyro_integral, 4.0);

        // No gyroscope sample yet: integral holds.
        state.advance(mode, acc, None, &SourceProfile::REMOTE);
        assert_relative_eq!(state.gyro_integral, 4.0);
    }

    #[test]
    fn test_state_advance_accelerometer_only_smooths() {
        let mut state = FusionState::new();
        let mode = StreamMode::LocalAccelerometerOnly;
        let a = Vector3::new(0.0, 0.0, 9.8);
        let b = Vector3::new(3.0, 4.0, 5.0);

        let first = state.advance(mode, a, None, &SourceProfile::LOCAL);
        assert_relative_eq!(first, 90.0);
        let second = state.advance(mode, b, Some(Vector3::new(5.0, 5.0, 5.0)), &SourceProfile::LOCAL);
        assert_relative_eq!(second, 0.9 * reference_tilt(3.0, 4.0, 5.0) + 0.1 * 90.0, epsilon = 1e-9);
        assert_eq!(state.gyro_integral, 0.0);
    }
}
