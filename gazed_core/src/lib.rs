#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Gaze-processing engine (device-agnostic).
//!
//! This crate turns a stream of raw gaze samples into calibrated screen
//! coordinates, AOI hit records, fixation/saccade events, adaptive-feedback
//! commands and a durable per-session log. All device interactions go
//! through `gazed_traits::SampleSource`.
//!
//! ## Architecture
//!
//! - **Calibration**: homography (DLT + deterministic RANSAC) with linear
//!   fallback (`calibration` module)
//! - **AOI index**: tiered point-in-rectangle lookup (`aoi`)
//! - **Detection**: I-DT fixation/saccade state machine (`detector`)
//! - **Hit log**: append-only hits, aggregates, discoveries (`hits`)
//! - **Cognitive load**: rolling dispersion/velocity score (`load`)
//! - **Rules**: table-ordered feedback with rate limiting (`rules`)
//! - **Achievements**: monotonic counters, exactly-once unlocks
//! - **Sessions**: registry + per-session worker trio (`session`)
//! - **Persistence**: batched appends and atomic export (`persist`)
//!
//! ## Concurrency
//!
//! Within a session, core logic is serialized on one worker; across
//! sessions it is parallel. Bounded channels drop the oldest entry under
//! overload; nothing on the live path blocks on subscribers or disk.

pub mod achievements;
pub mod aoi;
pub mod calibration;
pub mod detector;
pub mod error;
pub mod hits;
pub mod intake;
pub mod load;
pub mod mocks;
pub mod persist;
pub mod rules;
pub mod session;
pub mod types;
pub mod util;

pub use aoi::{Aoi, AoiIndex, AoiKind};
pub use calibration::{CalibrationPoint, CalibrationTransform, Calibrator, CalibratorState};
pub use detector::{EventDetector, Fixation, GazeEvent, Saccade};
pub use error::{EngineError, Result};
pub use hits::{AoiHit, HitLogBook, HitQuality};
pub use load::{CognitiveLoad, LoadEstimator};
pub use rules::{FeedbackCommand, FeedbackKind, RuleEngine};
pub use session::{
    Session, SessionRegistry, SessionState, SessionStats, Snapshot, StartOptions, StopReport,
};
pub use types::{CalibratedSample, GazeSample};
