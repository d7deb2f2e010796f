#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Traits that define the device and time abstractions used by the system.
//!
//! - `SampleSource` provides a blocking `next(timeout)` API that yields one
//!   raw gaze sample from whatever produces them (device adapter or mock).
//! - `RawSample` is the wire form of a sample before timestamping and
//!   calibration.
//! - `clock` offers a `MonotonicClock` for deterministic timing and
//!   testability.
//!
//! Other crates depend only on these traits, enabling simulation and
//! multiple device backends while keeping `gazed_core` device-agnostic.
pub mod clock;

pub use clock::{Clock, MonotonicClock};

/// One gaze sample as produced by a device adapter, before the engine
/// assigns a session-relative timestamp or applies calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// 2D gaze position in device camera pixels.
    pub device_x: f64,
    pub device_y: f64,
    /// Whether the 2D estimate is usable.
    pub valid: bool,
    /// Tracker confidence in [0, 1].
    pub confidence: f64,
    /// 3D gaze origin in millimetres (scene camera frame).
    pub pos_3d: [f64; 3],
    /// 3D gaze direction (unit-ish vector, scene camera frame).
    pub dir_3d: [f64; 3],
    pub valid_3d: bool,
    /// Pupil diameters in millimetres.
    pub pupil_left_mm: f64,
    pub pupil_right_mm: f64,
}

impl RawSample {
    /// A centred 2D-only sample; used by mocks and tests.
    pub fn at(device_x: f64, device_y: f64, confidence: f64) -> Self {
        Self {
            device_x,
            device_y,
            valid: true,
            confidence,
            pos_3d: [device_x * 0.1, device_y * 0.1, 100.0],
            dir_3d: [0.0, 0.0, -1.0],
            valid_3d: true,
            pupil_left_mm: 3.5,
            pupil_right_mm: 3.5,
        }
    }
}

pub trait SampleSource {
    /// Block until the next sample is available or `timeout` expires.
    fn next(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<RawSample, Box<dyn std::error::Error + Send + Sync>>;
}

// Allow boxed trait objects (Box<dyn SampleSource>) to be used where a
// generic S: SampleSource is expected.
impl<T: ?Sized + SampleSource> SampleSource for Box<T> {
    fn next(
        &mut self,
        timeout: std::time::Duration,
    ) -> Result<RawSample, Box<dyn std::error::Error + Send + Sync>> {
        (**self).next(timeout)
    }
}
