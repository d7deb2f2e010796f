use gazed_config::{Config, SourceMode, load_calibration_json, load_toml};
use rstest::rstest;

#[test]
fn empty_config_is_valid_with_defaults() {
    let cfg = load_toml("").unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.server.port, 8000);
    assert_eq!(cfg.stream.sampling_rate_hz, 120);
    assert_eq!(cfg.stream.snapshot_rate_hz, 20);
    assert_eq!(cfg.stream.sample_queue_depth, 256);
    assert_eq!(cfg.detector.fixation_window_ms, 100);
    assert_eq!(cfg.detector.min_fixation_ms, 200);
    assert!((cfg.detector.confidence_threshold - 0.8).abs() < 1e-12);
    assert_eq!(cfg.feedback.rate_limit_ms, 5000);
    assert_eq!(cfg.feedback.vocab_threshold_ms, 1500);
    assert_eq!(cfg.feedback.grammar_threshold_ms, 2000);
    assert_eq!(cfg.feedback.hint_threshold_ms, 3000);
    assert_eq!(cfg.persist.batch_size, 10);
    assert_eq!(cfg.persist.batch_ms, 100);
    assert_eq!(cfg.source.mode, SourceMode::Mock);
}

#[test]
fn full_config_parses_section_by_section() {
    let toml = r#"
[server]
host = "127.0.0.1"
port = 9001

[screen]
width_px = 2560
height_px = 1440
pixels_per_degree = 38.5

[stream]
sampling_rate_hz = 60
snapshot_rate_hz = 10
sample_queue_depth = 512

[detector]
fixation_window_ms = 120
dispersion_threshold_deg = 1.5
min_fixation_ms = 150
confidence_threshold = 0.75

[feedback]
rate_limit_ms = 4000
vocab_threshold_ms = 1200
enable_grammar = false

[persist]
data_dir = "/tmp/gazed"
batch_size = 25
batch_ms = 250
export_gaze_trail = false

[source]
mode = "push"

[logging]
level = "debug"
rotation = "daily"
"#;
    let cfg = load_toml(toml).unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.screen.width_px, 2560);
    assert_eq!(cfg.stream.sample_queue_depth, 512);
    assert!(!cfg.feedback.enable_grammar);
    assert!(cfg.feedback.enable_vocabulary);
    assert_eq!(cfg.source.mode, SourceMode::Push);
    assert_eq!(cfg.logging.rotation.as_deref(), Some("daily"));
}

#[rstest]
#[case("[stream]\nsampling_rate_hz = 0", "sampling_rate_hz")]
#[case("[stream]\nsnapshot_rate_hz = 0", "snapshot_rate_hz")]
#[case("[stream]\nsample_queue_depth = 0", "sample_queue_depth")]
#[case("[detector]\nfixation_window_ms = 0", "fixation_window_ms")]
#[case("[detector]\ndispersion_threshold_deg = -1.0", "dispersion_threshold_deg")]
#[case("[detector]\nconfidence_threshold = 1.5", "confidence_threshold")]
#[case("[feedback]\nrate_limit_ms = 0", "rate_limit_ms")]
#[case("[persist]\nbatch_size = 0", "batch_size")]
#[case("[persist]\ndata_dir = \"\"", "data_dir")]
#[case("[screen]\nwidth_px = 0", "width_px")]
fn out_of_bounds_values_are_rejected(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err().to_string();
    assert!(err.contains(needle), "error {err:?} should mention {needle}");
}

#[test]
fn unknown_source_mode_fails_to_parse() {
    assert!(load_toml("[source]\nmode = \"telepathy\"").is_err());
}

#[test]
fn calibration_doc_round_trips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    let doc = serde_json::json!({
        "method": "homography",
        "homography": [[3.2, 0.0, -320.0], [0.0, 2.7, -270.0], [0.0, 0.0, 1.0]],
        "scale_x": 3.2,
        "scale_y": 2.7,
        "offset_x": -320.0,
        "offset_y": -270.0,
        "accuracy_px": 0.4,
        "points_used": 4,
        "screen_width_px": 1920,
        "screen_height_px": 1080,
        "calibrated": true,
        "points": [
            {"index": 0, "screen_x": 0.0, "screen_y": 0.0, "device_x": 100.0,
             "device_y": 100.0, "confidence": 0.95, "ts_ms": 1000}
        ],
        "created_at_ms": 1700000000000u64
    });
    std::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let loaded = load_calibration_json(&path).unwrap();
    assert_eq!(loaded.method, "homography");
    assert_eq!(loaded.points_used, 4);
    assert_eq!(loaded.points.len(), 1);
    assert!(loaded.calibrated);
}

#[test]
fn calibration_doc_with_bad_method_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.json");
    std::fs::write(
        &path,
        r#"{"method": "cubic", "scale_x": 1.0, "scale_y": 1.0, "offset_x": 0.0,
            "offset_y": 0.0, "accuracy_px": 0.0, "points_used": 0,
            "screen_width_px": 1920, "screen_height_px": 1080,
            "calibrated": false, "created_at_ms": 0}"#,
    )
    .unwrap();
    assert!(load_calibration_json(&path).is_err());
}

#[test]
fn missing_calibration_file_surfaces_a_clear_error() {
    let err = load_calibration_json(std::path::Path::new("/nonexistent/cal.json")).unwrap_err();
    assert!(err.to_string().contains("open calibration JSON"));
}
