#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema and persisted-calibration parsing for the gaze pipeline.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//!   Every section is defaultable so the server runs without a config file.
//! - `CalibrationDoc` is the on-disk JSON form of a computed calibration
//!   transform (including the points it was computed from), loadable at
//!   startup so later sessions reuse an earlier calibration.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ScreenCfg {
    pub width_px: u32,
    pub height_px: u32,
    /// Pixels per degree of visual angle; converts the dispersion threshold
    /// from degrees to pixels.
    pub pixels_per_degree: f64,
}

impl Default for ScreenCfg {
    fn default() -> Self {
        Self {
            width_px: 1920,
            height_px: 1080,
            pixels_per_degree: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StreamCfg {
    /// Expected device sampling rate.
    pub sampling_rate_hz: u32,
    /// Cadence of subscriber snapshots.
    pub snapshot_rate_hz: u32,
    /// Capacity of the per-session sample channel; intake drops the oldest
    /// sample when full.
    pub sample_queue_depth: usize,
    /// Length of the in-memory gaze trail kept for the live snapshot.
    pub trail_len: usize,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            sampling_rate_hz: 120,
            snapshot_rate_hz: 20,
            sample_queue_depth: 256,
            trail_len: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DetectorCfg {
    pub fixation_window_ms: u64,
    pub dispersion_threshold_deg: f64,
    pub min_fixation_ms: u64,
    /// Samples below this confidence are excluded from dispersion math but
    /// still counted toward gap detection.
    pub confidence_threshold: f64,
}

impl Default for DetectorCfg {
    fn default() -> Self {
        Self {
            fixation_window_ms: 100,
            dispersion_threshold_deg: 1.0,
            min_fixation_ms: 200,
            confidence_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FeedbackCfg {
    /// At most one feedback command per session per this many milliseconds.
    pub rate_limit_ms: u64,
    pub vocab_threshold_ms: u64,
    pub grammar_threshold_ms: u64,
    pub hint_threshold_ms: u64,
    pub enable_vocabulary: bool,
    pub enable_grammar: bool,
    pub enable_hints: bool,
}

impl Default for FeedbackCfg {
    fn default() -> Self {
        Self {
            rate_limit_ms: 5000,
            vocab_threshold_ms: 1500,
            grammar_threshold_ms: 2000,
            hint_threshold_ms: 3000,
            enable_vocabulary: true,
            enable_grammar: true,
            enable_hints: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistCfg {
    /// Directory for session exports and append sinks.
    pub data_dir: String,
    /// Raw samples are flushed in groups of this size...
    pub batch_size: usize,
    /// ...or after this many milliseconds, whichever comes first.
    pub batch_ms: u64,
    /// Include the full gaze trail in the session export document.
    pub export_gaze_trail: bool,
}

impl Default for PersistCfg {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            batch_size: 10,
            batch_ms: 100,
            export_gaze_trail: true,
        }
    }
}

/// Where samples come from. An explicit mode, never an exception fallback:
/// tests can force either variant.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Deterministic in-process generator.
    #[default]
    Mock,
    /// Poll a device adapter.
    Device,
    /// Samples arrive over the session WebSocket; no intake thread.
    Push,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceCfg {
    pub mode: SourceMode,
    pub device_address: String,
    pub device_port: u16,
    /// Max wait per source read (ms).
    pub read_timeout_ms: u64,
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            mode: SourceMode::Mock,
            device_address: "192.168.1.117".to_string(),
            device_port: 8080,
            read_timeout_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CalibrationCfg {
    /// Optional persisted calibration JSON to load at startup.
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerCfg,
    pub screen: ScreenCfg,
    pub stream: StreamCfg,
    pub detector: DetectorCfg,
    pub feedback: FeedbackCfg,
    pub persist: PersistCfg,
    pub source: SourceCfg,
    pub logging: Logging,
    pub calibration: CalibrationCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Screen
        if self.screen.width_px == 0 || self.screen.height_px == 0 {
            eyre::bail!("screen.width_px and screen.height_px must be > 0");
        }
        if !(self.screen.pixels_per_degree > 0.0) || !self.screen.pixels_per_degree.is_finite() {
            eyre::bail!("screen.pixels_per_degree must be finite and > 0");
        }

        // Stream
        if self.stream.sampling_rate_hz == 0 {
            eyre::bail!("stream.sampling_rate_hz must be > 0");
        }
        if self.stream.snapshot_rate_hz == 0 || self.stream.snapshot_rate_hz > 1000 {
            eyre::bail!("stream.snapshot_rate_hz must be in 1..=1000");
        }
        if self.stream.sample_queue_depth == 0 {
            eyre::bail!("stream.sample_queue_depth must be >= 1");
        }
        if self.stream.trail_len == 0 {
            eyre::bail!("stream.trail_len must be >= 1");
        }

        // Detector
        if self.detector.fixation_window_ms == 0 {
            eyre::bail!("detector.fixation_window_ms must be >= 1");
        }
        if !(self.detector.dispersion_threshold_deg > 0.0)
            || !self.detector.dispersion_threshold_deg.is_finite()
        {
            eyre::bail!("detector.dispersion_threshold_deg must be finite and > 0");
        }
        if self.detector.min_fixation_ms == 0 {
            eyre::bail!("detector.min_fixation_ms must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            eyre::bail!("detector.confidence_threshold must be in [0.0, 1.0]");
        }

        // Feedback
        if self.feedback.rate_limit_ms == 0 {
            eyre::bail!("feedback.rate_limit_ms must be >= 1");
        }
        if self.feedback.vocab_threshold_ms == 0
            || self.feedback.grammar_threshold_ms == 0
            || self.feedback.hint_threshold_ms == 0
        {
            eyre::bail!("feedback thresholds must be >= 1 ms");
        }

        // Persist
        if self.persist.batch_size == 0 {
            eyre::bail!("persist.batch_size must be >= 1");
        }
        if self.persist.batch_ms == 0 {
            eyre::bail!("persist.batch_ms must be >= 1");
        }
        if self.persist.data_dir.is_empty() {
            eyre::bail!("persist.data_dir must not be empty");
        }

        // Source
        if self.source.read_timeout_ms == 0 {
            eyre::bail!("source.read_timeout_ms must be >= 1");
        }

        Ok(())
    }
}

/// On-disk JSON form of a computed calibration, including the frozen points
/// it was computed from. `gazed_core` converts to/from its runtime transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationDoc {
    /// "homography" | "linear"
    pub method: String,
    /// Row-major 3x3 homography; present when method == "homography".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homography: Option<[[f64; 3]; 3]>,
    /// Per-axis linear coefficients; always present (the homography path
    /// keeps them as its degenerate-divisor fallback).
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub accuracy_px: f64,
    pub points_used: usize,
    pub screen_width_px: u32,
    pub screen_height_px: u32,
    pub calibrated: bool,
    /// Why a requested homography fell back to linear, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default)]
    pub points: Vec<CalibrationPointDoc>,
    /// Wall-clock creation time (ms since the Unix epoch).
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationPointDoc {
    pub index: u32,
    pub screen_x: f64,
    pub screen_y: f64,
    pub device_x: f64,
    pub device_y: f64,
    pub confidence: f64,
    pub ts_ms: u64,
}

pub fn load_calibration_json(path: &std::path::Path) -> eyre::Result<CalibrationDoc> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("open calibration JSON {:?}: {}", path, e))?;
    let doc: CalibrationDoc = serde_json::from_str(&text)
        .map_err(|e| eyre::eyre!("parse calibration JSON {:?}: {}", path, e))?;
    if doc.method != "homography" && doc.method != "linear" {
        eyre::bail!("calibration method must be 'homography' or 'linear', got {:?}", doc.method);
    }
    if doc.method == "homography" && doc.homography.is_none() {
        eyre::bail!("calibration method is 'homography' but no matrix is present");
    }
    Ok(doc)
}
