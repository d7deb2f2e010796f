//! End-to-end pipeline tests driven through the session registry using the
//! push-ingest path and a deterministic clock.
use gazed_config::{Config, SourceMode};
use gazed_core::rules::FeedbackCommand;
use gazed_core::session::{CommandSink, SessionRegistry, SessionState, SinkError, StartOptions};
use gazed_core::{Aoi, AoiKind};
use gazed_traits::RawSample;
use gazed_traits::clock::TestClock;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn test_config(data_dir: &std::path::Path) -> Arc<Config> {
    let mut cfg = Config::default();
    cfg.persist.data_dir = data_dir.display().to_string();
    cfg.stream.sample_queue_depth = 2048;
    cfg.source.mode = SourceMode::Push;
    cfg.validate().unwrap();
    Arc::new(cfg)
}

fn vocab_aoi(id: &str, x: f64, y: f64, w: f64, h: f64) -> Aoi {
    Aoi {
        id: id.to_string(),
        x,
        y,
        w,
        h,
        kind: AoiKind::Vocab,
        priority: 0,
        text: id.to_string(),
        difficulty: Some("hard".to_string()),
        attributes: serde_json::Map::new(),
    }
}

struct ChannelCommandSink(mpsc::Sender<FeedbackCommand>);

impl CommandSink for ChannelCommandSink {
    fn try_push(&self, command: &FeedbackCommand) -> Result<(), SinkError> {
        self.0.send(command.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Poll until the logic worker has consumed `n` samples.
fn wait_for_samples(session: &gazed_core::Session, n: u64) {
    for _ in 0..400 {
        if session.statistics().total_samples >= n {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!(
        "logic worker stuck: saw {} of {n} samples",
        session.statistics().total_samples
    );
}

#[test]
fn vocabulary_rule_emits_one_card() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(TestClock::new());
    let registry = SessionRegistry::with_clock(test_config(dir.path()), clock.clone());

    let (session, already) = registry.start_session(&StartOptions {
        session_id: Some("vocab-test".to_string()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    });
    assert!(!already);

    session
        .add_aoi(vocab_aoi("biodiversity", 556.0, 391.0, 100.0, 20.0))
        .unwrap();

    let (tx, rx) = mpsc::channel();
    session.subscribe_commands(Box::new(ChannelCommandSink(tx)));

    // 1600 ms of steady gaze centred in the AOI at 100 Hz.
    let mut pushed = 0u64;
    for i in 0..160u64 {
        clock.advance(Duration::from_millis(10));
        let x = 600.0 + (i % 2) as f64;
        session.push_sample(&RawSample::at(x, 400.0, 0.95)).unwrap();
        pushed += 1;
    }
    // A jump closes the fixation.
    clock.advance(Duration::from_millis(10));
    session.push_sample(&RawSample::at(1500.0, 900.0, 0.95)).unwrap();
    pushed += 1;
    wait_for_samples(&session, pushed);

    let cmd = rx.recv_timeout(Duration::from_secs(2)).expect("command");
    assert_eq!(cmd.kind, gazed_core::FeedbackKind::VocabCard);
    assert_eq!(cmd.payload["aoi_id"], "biodiversity");
    assert!(rx.try_recv().is_err(), "exactly one command expected");

    let stats = session.statistics();
    assert_eq!(stats.feedback_count, 1);
    assert_eq!(stats.vocabulary_count, 1);
    session.stop();
}

#[test]
fn feedback_rate_limit_spans_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(TestClock::new());
    let registry = SessionRegistry::with_clock(test_config(dir.path()), clock.clone());
    let (session, _) = registry.start_session(&StartOptions {
        session_id: Some("rate-test".to_string()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    });

    session.add_aoi(vocab_aoi("a", 550.0, 390.0, 120.0, 40.0)).unwrap();
    session.add_aoi(vocab_aoi("b", 50.0, 50.0, 200.0, 100.0)).unwrap();
    session.add_aoi(vocab_aoi("c", 850.0, 750.0, 200.0, 100.0)).unwrap();

    let (tx, rx) = mpsc::channel();
    session.subscribe_commands(Box::new(ChannelCommandSink(tx)));

    let mut pushed = 0u64;
    let mut now_ms = 0u64;
    let dwell_until = |until_ms: u64, x: f64, y: f64, pushed: &mut u64, now_ms: &mut u64| {
        while *now_ms < until_ms {
            clock.advance(Duration::from_millis(10));
            *now_ms += 10;
            session.push_sample(&RawSample::at(x, y, 0.95)).unwrap();
            *pushed += 1;
        }
    };

    // Fixation on "a" ending at 1600 ms: emitted.
    dwell_until(1600, 600.0, 410.0, &mut pushed, &mut now_ms);
    // Jump into "b"; 2 s later a qualifying fixation ends: suppressed.
    dwell_until(3600, 100.0, 100.0, &mut pushed, &mut now_ms);
    // Jump into "c"; fixation ends 5.5 s after the first: emitted.
    dwell_until(7100, 900.0, 800.0, &mut pushed, &mut now_ms);
    // Final jump closes the last fixation.
    clock.advance(Duration::from_millis(10));
    session.push_sample(&RawSample::at(10.0, 900.0, 0.95)).unwrap();
    pushed += 1;
    wait_for_samples(&session, pushed);

    let mut kinds = Vec::new();
    while let Ok(cmd) = rx.recv_timeout(Duration::from_millis(500)) {
        kinds.push((cmd.kind, cmd.payload["aoi_id"].clone()));
        if kinds.len() == 2 {
            break;
        }
    }
    assert_eq!(kinds.len(), 2, "first and third fixation only");
    assert_eq!(kinds[0].1, "a");
    assert_eq!(kinds[1].1, "c");

    let stats = session.statistics();
    assert_eq!(stats.feedback_count, 2);
    assert_eq!(stats.feedback_suppressed, 1);
    session.stop();
}

#[test]
fn export_round_trips_samples_hits_and_order() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(TestClock::new());
    let registry = SessionRegistry::with_clock(test_config(dir.path()), clock.clone());
    let (session, _) = registry.start_session(&StartOptions {
        session_id: Some("export-test".to_string()),
        student_name: Some("Ada".to_string()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    });

    // Corner AOI; exactly 10 of the 500 samples land inside it. The rest
    // jump around widely so no fixations form and the hit log stays at 10.
    session.add_aoi(vocab_aoi("corner", 0.0, 0.0, 50.0, 50.0)).unwrap();

    for i in 0..500u64 {
        clock.advance(Duration::from_millis(8));
        let (x, y) = if i % 50 == 0 {
            (25.0, 25.0)
        } else {
            // Large alternating jumps, always outside the corner AOI.
            (
                300.0 + ((i % 7) as f64) * 180.0,
                200.0 + ((i % 5) as f64) * 160.0,
            )
        };
        session.push_sample(&RawSample::at(x, y, 0.95)).unwrap();
    }
    wait_for_samples(&session, 500);

    let report = session.stop();
    assert_eq!(report.statistics.total_samples, 500);
    let path = report.export_path.clone().expect("export path");
    assert!(std::path::Path::new(&path).exists(), "export file missing");

    // Stopping again is a no-op returning the same report.
    assert_eq!(session.state(), SessionState::Stopped);
    let again = session.stop();
    assert_eq!(again.export_path, report.export_path);

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(doc["total_samples"], 500);
    assert_eq!(doc["student_name"], "Ada");
    assert_eq!(doc["hit_log"].as_array().unwrap().len(), 10);
    assert_eq!(doc["calibration"]["calibrated"], false);

    // Re-import: AOIs and hits survive the round trip.
    let aois = doc["aois"].as_array().unwrap();
    assert_eq!(aois.len(), 1);
    assert_eq!(aois[0]["id"], "corner");
    let hits = doc["hit_log"].as_array().unwrap();
    assert!(hits.iter().all(|h| h["aoi_id"] == "corner"));

    // Timestamps in the exported trail increase strictly.
    let trail = doc["gaze_trail"].as_array().unwrap();
    assert_eq!(trail.len(), 500);
    let ts: Vec<u64> = trail.iter().map(|g| g["ts_ms"].as_u64().unwrap()).collect();
    for w in ts.windows(2) {
        assert!(w[0] <= w[1], "trail out of order");
    }
    let seqs: Vec<u64> = hits.iter().map(|h| h["seq"].as_u64().unwrap()).collect();
    for w in seqs.windows(2) {
        assert!(w[0] < w[1], "hit seq not strictly increasing");
    }
}

#[test]
fn start_is_idempotent_for_a_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(test_config(dir.path()));
    let opts = StartOptions {
        session_id: Some("dup".to_string()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    };
    let (first, already_first) = registry.start_session(&opts);
    assert!(!already_first);
    let (second, already_second) = registry.start_session(&opts);
    assert!(already_second);
    assert!(Arc::ptr_eq(&first, &second));
    first.stop();
}

#[test]
fn calibration_capture_and_compute_swap_the_transform() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(TestClock::new());
    let registry = SessionRegistry::with_clock(test_config(dir.path()), clock.clone());
    let (session, _) = registry.start_session(&StartOptions {
        session_id: Some("cal".to_string()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    });

    session.begin_calibration();

    // No gaze yet: capture fails cleanly.
    assert!(session.capture_calibration_point(0, 0.0, 0.0).is_err());

    let targets = [
        ((100.0, 100.0), (0.0, 0.0)),
        ((700.0, 100.0), (1920.0, 0.0)),
        ((100.0, 500.0), (0.0, 1080.0)),
        ((700.0, 500.0), (1920.0, 1080.0)),
    ];
    for (i, ((dx, dy), (sx, sy))) in targets.iter().enumerate() {
        clock.advance(Duration::from_millis(50));
        session.push_sample(&RawSample::at(*dx, *dy, 0.97)).unwrap();
        wait_for_samples(&session, i as u64 + 1);
        let point = session
            .capture_calibration_point(i as u32, *sx, *sy)
            .unwrap();
        assert_eq!(point.device_x, *dx);
    }

    // Only 4 points: homography with a tiny reprojection error.
    let transform = session.compute_calibration(true).unwrap();
    assert_eq!(transform.method_name(), "homography");
    assert!(transform.accuracy_px < 1.0);

    // The swapped-in transform now maps the device centre to the screen
    // centre: verify through the live snapshot.
    clock.advance(Duration::from_millis(50));
    session.push_sample(&RawSample::at(400.0, 300.0, 0.97)).unwrap();
    wait_for_samples(&session, 5);
    let snap = session.snapshot();
    let gaze = snap.gaze.unwrap();
    assert!((gaze.x - 960.0).abs() < 5.0, "x {}", gaze.x);
    assert!((gaze.y - 540.0).abs() < 5.0, "y {}", gaze.y);
    assert!(snap.calibration.calibrated);

    // Registry adoption persists the transform for later sessions.
    registry
        .adopt_transform(&transform, &session.calibration_points())
        .unwrap();
    assert!(dir.path().join("calibration.json").exists());
    session.stop();
}

#[test]
fn insufficient_points_leave_existing_transform_intact() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(TestClock::new());
    let registry = SessionRegistry::with_clock(test_config(dir.path()), clock.clone());
    let (session, _) = registry.start_session(&StartOptions {
        session_id: Some("cal3".to_string()),
        source: Some(SourceMode::Push),
        ..StartOptions::default()
    });

    session.begin_calibration();
    for i in 0..3u64 {
        clock.advance(Duration::from_millis(50));
        session
            .push_sample(&RawSample::at(100.0 + i as f64, 100.0, 0.9))
            .unwrap();
        wait_for_samples(&session, i + 1);
        session
            .capture_calibration_point(i as u32, i as f64 * 600.0, 0.0)
            .unwrap();
    }

    let err = session.compute_calibration(true).unwrap_err();
    assert_eq!(err.code(), "insufficient_points");
    assert!(!session.transform().calibrated);
    session.stop();
}

#[test]
fn mock_session_streams_and_detects_on_its_own() {
    // Real clock, mock source: the deterministic reading pattern should
    // produce samples, fixations and a clean stop within a short run.
    let dir = tempfile::tempdir().unwrap();
    let registry = SessionRegistry::new(test_config(dir.path()));
    let (session, _) = registry.start_session(&StartOptions {
        session_id: Some("mock-run".to_string()),
        source: Some(SourceMode::Mock),
        ..StartOptions::default()
    });

    for _ in 0..100 {
        if session.statistics().total_samples >= 60 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    let report = session.stop();
    assert!(report.statistics.total_samples >= 60, "mock produced too few samples");
    assert_eq!(report.statistics.source, "mock");
    assert!(report.export_path.is_some());
}
