//! Per-session lifecycle and orchestration.
//!
//! A session owns its calibration transform, AOI index, detectors, logs and
//! achievements. Three workers run per streaming session:
//!
//! - the **intake** thread polls the sample source into a bounded queue
//!   (absent for push-driven sessions),
//! - the **logic** thread consumes the queue and drives calibration, event
//!   detection, hit logging, cognitive load, rules and achievements in
//!   sequence; core logic is serialized within a session,
//! - the **fan-out** thread copies the latest snapshot to subscriber sinks
//!   at the configured cadence; a slow subscriber is skipped, a closed one
//!   is unregistered.
//!
//! `SessionRegistry` maps session id to owned session; there is no global
//! manager singleton. Subscribers are held by id behind sink traits, so no
//! reference cycles form between sessions and their consumers.
use crate::achievements::{Achievement, AchievementBook};
use crate::aoi::{Aoi, AoiIndex, AoiKind};
use crate::calibration::{
    CalibrationPoint, CalibrationTransform, Calibrator, CalibratorState,
};
use crate::detector::{DetectorParams, EventDetector, GazeEvent};
use crate::error::EngineError;
use crate::hits::AoiHit;
use crate::intake::{IntakeWorker, SampleQueue};
use crate::load::{CognitiveLoad, LoadEstimator};
use crate::mocks::MockSource;
use crate::persist::{
    self, EventRecord, JsonlSink, PersistClient, PersistHandle, RawSampleRecord,
};
use crate::rules::{FeedbackCommand, RuleEngine};
use crate::types::{CalibratedSample, GazeSample};
use crate::util;
use crossbeam_channel as xch;
use gazed_config::{Config, SourceMode};
use gazed_traits::{Clock, MonotonicClock, RawSample, SampleSource};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Workers get this long to flush outstanding work on stop.
pub const STOP_GRACE: Duration = Duration::from_secs(2);
const LOGIC_TICK: Duration = Duration::from_millis(25);
const SNAPSHOT_TRAIL: usize = 5;
const SNAPSHOT_HITS: usize = 10;
const SNAPSHOT_LOAD_HISTORY: usize = 10;
const DISCOVERY_LIVE_BOUND: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Streaming,
    Stopped,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GazeView {
    pub x: f64,
    pub y: f64,
    pub ts_ms: u64,
    pub confidence: f64,
    pub valid: bool,
}

impl GazeView {
    fn of(cs: &CalibratedSample) -> Self {
        Self {
            x: cs.screen_x,
            y: cs.screen_y,
            ts_ms: cs.sample.ts_ms(),
            confidence: cs.sample.confidence,
            valid: cs.sample.valid && !cs.sample.is_flagged(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SessionStats {
    pub total_samples: u64,
    pub invalid_samples: u64,
    pub dropped_samples: u64,
    pub total_hits: u64,
    pub fixation_count: u64,
    pub saccade_count: u64,
    pub vocabulary_count: u64,
    pub feedback_count: u64,
    pub feedback_suppressed: u64,
    pub duration_ms: u64,
    pub samples_per_second: f64,
    pub words_per_minute: f64,
    pub persistence_degraded: bool,
    pub lost_samples: u64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationView {
    pub state: &'static str,
    pub calibrated: bool,
    pub method: &'static str,
    pub accuracy_px: f64,
    pub points_collected: usize,
}

/// The bounded live state delivered to subscribers. Separate from the
/// export document: small and cheap to copy.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub session_id: String,
    pub state: &'static str,
    pub ts_ms: u64,
    pub streaming: bool,
    pub gaze: Option<GazeView>,
    pub trail: Vec<GazeView>,
    pub recent_hits: Vec<AoiHit>,
    pub vocabulary_discoveries: Vec<String>,
    pub cognitive_load: Option<CognitiveLoad>,
    pub load_history: Vec<CognitiveLoad>,
    pub recent_unlocks: Vec<Achievement>,
    pub statistics: SessionStats,
    pub calibration: CalibrationView,
}

impl Snapshot {
    fn initial(session_id: &str, source: &str, calibration: CalibrationView) -> Self {
        Self {
            session_id: session_id.to_string(),
            state: SessionState::Created.as_str(),
            ts_ms: 0,
            streaming: false,
            gaze: None,
            trail: Vec::new(),
            recent_hits: Vec::new(),
            vocabulary_discoveries: Vec::new(),
            cognitive_load: None,
            load_history: Vec::new(),
            recent_unlocks: Vec::new(),
            statistics: SessionStats {
                source: source.to_string(),
                ..SessionStats::default()
            },
            calibration,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// Sink cannot accept right now; skip, do not back-pressure.
    NotWritable,
    /// Consumer is gone; unregister on this emit attempt.
    Closed,
}

pub trait SnapshotSink: Send {
    fn try_push(&self, snapshot: &Snapshot) -> Result<(), SinkError>;
}

pub trait CommandSink: Send {
    fn try_push(&self, command: &FeedbackCommand) -> Result<(), SinkError>;
}

/// Producer of device-backed sample sources; installed by the embedding
/// server. When absent (or failing), device sessions fall back to the mock
/// source and say so in their status.
pub type DeviceFactory =
    Box<dyn Fn() -> Result<Box<dyn SampleSource + Send>, EngineError> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub export_path: Option<String>,
    pub statistics: SessionStats,
}

#[derive(Debug, Default, Clone)]
pub struct StartOptions {
    pub session_id: Option<String>,
    pub student_name: Option<String>,
    pub lesson_title: Option<String>,
    /// Overrides `[source] mode` from config when set.
    pub source: Option<SourceMode>,
}

struct Shared {
    session_id: String,
    state: Mutex<SessionState>,
    shutdown: AtomicBool,
    snapshot: Mutex<Snapshot>,
    aois: RwLock<AoiIndex>,
    transform: RwLock<CalibrationTransform>,
    calibrator: Mutex<Calibrator>,
    /// Most recent sample in device coordinates (pre-transform); snapshotted
    /// by calibration capture.
    last_device_sample: Mutex<Option<GazeSample>>,
    snapshot_sinks: Mutex<HashMap<u64, Box<dyn SnapshotSink>>>,
    command_sinks: Mutex<HashMap<u64, Box<dyn CommandSink>>>,
    sink_seq: AtomicU64,
    export_path: Mutex<Option<String>>,
    /// Timestamp allocator for the push-ingest path.
    last_push_ts_ns: Mutex<u64>,
}

struct WorkerSet {
    intake: Option<IntakeWorker>,
    logic: Option<std::thread::JoinHandle<()>>,
    fanout: Option<std::thread::JoinHandle<()>>,
}

pub struct Session {
    id: String,
    student_name: Option<String>,
    lesson_title: Option<String>,
    started_at_ms: u64,
    epoch: Instant,
    clock: Arc<dyn Clock + Send + Sync>,
    cfg: Arc<Config>,
    shared: Arc<Shared>,
    queue: SampleQueue,
    persist: Mutex<Option<PersistHandle>>,
    workers: Mutex<WorkerSet>,
    stop_result: Mutex<Option<StopReport>>,
}

impl Session {
    #[allow(clippy::too_many_lines)]
    fn start(
        id: String,
        opts: &StartOptions,
        cfg: Arc<Config>,
        clock: Arc<dyn Clock + Send + Sync>,
        transform: CalibrationTransform,
        source: ResolvedSource,
    ) -> Arc<Self> {
        let epoch = clock.now();
        let started_at_ms = util::wall_ms();
        let source_label = source.label();

        let calibration_view = CalibrationView {
            state: CalibratorState::Idle.as_str(),
            calibrated: transform.calibrated,
            method: transform.method_name(),
            accuracy_px: transform.accuracy_px,
            points_collected: 0,
        };
        let shared = Arc::new(Shared {
            session_id: id.clone(),
            state: Mutex::new(SessionState::Created),
            shutdown: AtomicBool::new(false),
            snapshot: Mutex::new(Snapshot::initial(&id, source_label, calibration_view)),
            aois: RwLock::new(AoiIndex::new()),
            transform: RwLock::new(transform),
            calibrator: Mutex::new(Calibrator::new()),
            last_device_sample: Mutex::new(None),
            snapshot_sinks: Mutex::new(HashMap::new()),
            command_sinks: Mutex::new(HashMap::new()),
            sink_seq: AtomicU64::new(0),
            export_path: Mutex::new(None),
            last_push_ts_ns: Mutex::new(0),
        });

        let queue = SampleQueue::new(cfg.stream.sample_queue_depth);
        let sink = JsonlSink::new(cfg.persist.data_dir.clone(), id.clone());
        let persist = PersistHandle::spawn(
            Box::new(sink),
            cfg.persist.batch_size,
            cfg.persist.batch_ms,
        );
        let persist_client = persist.client();

        let intake = source.spawn_intake(&cfg, &queue, Arc::clone(&clock), epoch);

        let logic = {
            let worker = LogicWorker::new(
                id.clone(),
                opts.student_name.clone(),
                opts.lesson_title.clone(),
                Arc::clone(&shared),
                queue.clone(),
                persist_client,
                Arc::clone(&cfg),
                Arc::clone(&clock),
                epoch,
                started_at_ms,
                source_label.to_string(),
            );
            std::thread::spawn(move || worker.run())
        };

        let fanout = {
            let shared = Arc::clone(&shared);
            let period = Duration::from_millis(util::period_ms(cfg.stream.snapshot_rate_hz));
            std::thread::spawn(move || fanout_loop(&shared, period))
        };

        *lock(&shared.state) = SessionState::Streaming;
        {
            let mut snap = lock(&shared.snapshot);
            snap.state = SessionState::Streaming.as_str();
            snap.streaming = true;
        }
        tracing::info!(session_id = %id, source = source_label, "session streaming");

        Arc::new(Self {
            id,
            student_name: opts.student_name.clone(),
            lesson_title: opts.lesson_title.clone(),
            started_at_ms,
            epoch,
            clock,
            cfg,
            shared,
            queue,
            persist: Mutex::new(Some(persist)),
            workers: Mutex::new(WorkerSet {
                intake,
                logic: Some(logic),
                fanout: Some(fanout),
            }),
            stop_result: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn student_name(&self) -> Option<&str> {
        self.student_name.as_deref()
    }

    pub fn lesson_title(&self) -> Option<&str> {
        self.lesson_title.as_deref()
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn snapshot(&self) -> Snapshot {
        lock(&self.shared.snapshot).clone()
    }

    pub fn statistics(&self) -> SessionStats {
        lock(&self.shared.snapshot).statistics.clone()
    }

    pub fn export_path(&self) -> Option<String> {
        lock(&self.shared.export_path).clone()
    }

    // ---- subscribers -----------------------------------------------------

    pub fn subscribe_snapshots(&self, sink: Box<dyn SnapshotSink>) -> u64 {
        let sub_id = self.shared.sink_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.snapshot_sinks).insert(sub_id, sink);
        sub_id
    }

    pub fn unsubscribe_snapshots(&self, sub_id: u64) {
        lock(&self.shared.snapshot_sinks).remove(&sub_id);
    }

    pub fn subscribe_commands(&self, sink: Box<dyn CommandSink>) -> u64 {
        let sub_id = self.shared.sink_seq.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.command_sinks).insert(sub_id, sink);
        sub_id
    }

    pub fn unsubscribe_commands(&self, sub_id: u64) {
        lock(&self.shared.command_sinks).remove(&sub_id);
    }

    // ---- ingest ----------------------------------------------------------

    /// Accept one pushed sample (session-socket ingest). The sample gets a
    /// server-assigned, strictly increasing session timestamp.
    pub fn push_sample(&self, raw: &RawSample) -> Result<(), EngineError> {
        if self.state() != SessionState::Streaming {
            return Err(EngineError::InvalidState(format!(
                "session {} is not streaming",
                self.id
            )));
        }
        let ts_ns = {
            let mut last = lock(&self.shared.last_push_ts_ns);
            let ts = self.clock.ns_since(self.epoch).max(*last + 1);
            *last = ts;
            ts
        };
        let sample = GazeSample::from_raw(raw, ts_ns);
        if !sample.is_well_formed() {
            self.queue
                .counters()
                .dropped_invalid
                .fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::InvalidSample("non-finite or out-of-range"));
        }
        self.queue.push(sample);
        Ok(())
    }

    // ---- AOIs ------------------------------------------------------------

    pub fn add_aoi(&self, aoi: Aoi) -> Result<(), EngineError> {
        if self.state() == SessionState::Stopped {
            return Err(EngineError::InvalidState("session is stopped".to_string()));
        }
        write(&self.shared.aois).add(aoi);
        Ok(())
    }

    pub fn remove_aoi(&self, id: &str) -> Option<Aoi> {
        write(&self.shared.aois).remove(id)
    }

    pub fn aois(&self) -> Vec<Aoi> {
        read(&self.shared.aois).iter().cloned().collect()
    }

    // ---- calibration -----------------------------------------------------

    pub fn begin_calibration(&self) {
        lock(&self.shared.calibrator).begin();
        tracing::info!(session_id = %self.id, "calibration collecting");
    }

    /// Snapshot the most recent sample's device coordinates for a target.
    pub fn capture_calibration_point(
        &self,
        index: u32,
        screen_x: f64,
        screen_y: f64,
    ) -> Result<CalibrationPoint, EngineError> {
        let sample = (*lock(&self.shared.last_device_sample)).ok_or(
            EngineError::CalibrationFailed(crate::error::CalibrationError::NoSampleYet),
        )?;
        let point = CalibrationPoint {
            index,
            screen_x,
            screen_y,
            device_x: sample.device_x,
            device_y: sample.device_y,
            confidence: sample.confidence,
            ts_ms: sample.ts_ms(),
        };
        lock(&self.shared.calibrator)
            .capture(point)
            .map_err(EngineError::CalibrationFailed)?;
        Ok(point)
    }

    /// Compute and atomically swap in a new transform. On failure the
    /// existing transform stays intact.
    pub fn compute_calibration(
        &self,
        prefer_homography: bool,
    ) -> Result<CalibrationTransform, EngineError> {
        let transform = lock(&self.shared.calibrator)
            .compute(
                prefer_homography,
                self.cfg.screen.width_px,
                self.cfg.screen.height_px,
            )
            .map_err(EngineError::CalibrationFailed)?;
        *write(&self.shared.transform) = transform.clone();
        Ok(transform)
    }

    pub fn calibration_points(&self) -> Vec<CalibrationPoint> {
        lock(&self.shared.calibrator).points().to_vec()
    }

    pub fn transform(&self) -> CalibrationTransform {
        read(&self.shared.transform).clone()
    }

    pub fn calibration_view(&self) -> CalibrationView {
        let calibrator = lock(&self.shared.calibrator);
        let transform = read(&self.shared.transform);
        CalibrationView {
            state: calibrator.state().as_str(),
            calibrated: transform.calibrated,
            method: transform.method_name(),
            accuracy_px: transform.accuracy_px,
            points_collected: calibrator.points().len(),
        }
    }

    // ---- lifecycle -------------------------------------------------------

    /// Stop streaming: drain in-flight work, finalize any ongoing fixation,
    /// export the session document, release workers. Idempotent: the second
    /// and later calls return the first call's report.
    pub fn stop(&self) -> StopReport {
        let mut result = lock(&self.stop_result);
        if let Some(report) = result.as_ref() {
            return report.clone();
        }

        tracing::info!(session_id = %self.id, "session stopping");
        *lock(&self.shared.state) = SessionState::Stopped;
        self.shared.shutdown.store(true, Ordering::Relaxed);

        {
            let mut workers = lock(&self.workers);
            // Intake joins on drop (bounded by its read timeout).
            workers.intake.take();
            if let Some(h) = workers.logic.take() {
                if h.join().is_err() {
                    tracing::warn!("logic worker panicked during stop");
                }
            }
            if let Some(h) = workers.fanout.take() {
                if h.join().is_err() {
                    tracing::warn!("fanout worker panicked during stop");
                }
            }
        }

        if let Some(persist) = lock(&self.persist).take() {
            if !persist.shutdown(STOP_GRACE) {
                tracing::warn!(session_id = %self.id, "persistence flush exceeded grace period");
            }
        }

        // Dropping the sinks ends subscriber streams on their side.
        lock(&self.shared.snapshot_sinks).clear();
        lock(&self.shared.command_sinks).clear();

        let report = StopReport {
            export_path: self.export_path(),
            statistics: self.statistics(),
        };
        *result = Some(report.clone());
        report
    }
}

// Mutex poisoning cannot leave session state half-updated here (all updates
// are single assignments), so recover the guard rather than unwinding.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

enum ResolvedSource {
    Mock(&'static str),
    Device(Box<dyn SampleSource + Send>),
    Push,
}

impl ResolvedSource {
    fn label(&self) -> &'static str {
        match self {
            ResolvedSource::Mock(label) => label,
            ResolvedSource::Device(_) => "device",
            ResolvedSource::Push => "push",
        }
    }

    fn spawn_intake(
        self,
        cfg: &Config,
        queue: &SampleQueue,
        clock: Arc<dyn Clock + Send + Sync>,
        epoch: Instant,
    ) -> Option<IntakeWorker> {
        let timeout = Duration::from_millis(cfg.source.read_timeout_ms);
        let hz = cfg.stream.sampling_rate_hz;
        match self {
            ResolvedSource::Mock(_) => Some(IntakeWorker::spawn(
                MockSource::new(),
                queue.clone(),
                hz,
                timeout,
                ArcClock(clock),
                epoch,
            )),
            ResolvedSource::Device(source) => Some(IntakeWorker::spawn(
                source,
                queue.clone(),
                hz,
                timeout,
                ArcClock(clock),
                epoch,
            )),
            ResolvedSource::Push => None,
        }
    }
}

/// Adapter so an `Arc<dyn Clock>` satisfies the intake worker's generic
/// clock bound.
struct ArcClock(Arc<dyn Clock + Send + Sync>);

impl Clock for ArcClock {
    fn now(&self) -> Instant {
        self.0.now()
    }
    fn sleep(&self, d: Duration) {
        self.0.sleep(d);
    }
}

// ---------------------------------------------------------------------------
// Logic worker
// ---------------------------------------------------------------------------

struct LogicWorker {
    session_id: String,
    student_name: Option<String>,
    lesson_title: Option<String>,
    shared: Arc<Shared>,
    rx: xch::Receiver<GazeSample>,
    queue: SampleQueue,
    persist: PersistClient,
    cfg: Arc<Config>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    started_at_ms: u64,
    detector: EventDetector,
    hits: crate::hits::HitLogBook,
    load: LoadEstimator,
    rules: RuleEngine,
    achievements: AchievementBook,
    trail: VecDeque<GazeView>,
    export_trail: Vec<GazeView>,
    last_ts_ns: u64,
    samples_seen: u64,
    fixation_count: u64,
    saccade_count: u64,
    word_fixations: u64,
    source_label: String,
}

impl LogicWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        session_id: String,
        student_name: Option<String>,
        lesson_title: Option<String>,
        shared: Arc<Shared>,
        queue: SampleQueue,
        persist: PersistClient,
        cfg: Arc<Config>,
        clock: Arc<dyn Clock + Send + Sync>,
        epoch: Instant,
        started_at_ms: u64,
        source_label: String,
    ) -> Self {
        let params = DetectorParams::from_cfg(&cfg.detector, cfg.screen.pixels_per_degree);
        Self {
            rx: queue.receiver(),
            detector: EventDetector::new(params),
            hits: crate::hits::HitLogBook::new(session_id.clone(), DISCOVERY_LIVE_BOUND),
            load: LoadEstimator::new(),
            rules: RuleEngine::new(cfg.feedback),
            achievements: AchievementBook::standard(),
            trail: VecDeque::with_capacity(cfg.stream.trail_len),
            export_trail: Vec::new(),
            last_ts_ns: 0,
            samples_seen: 0,
            fixation_count: 0,
            saccade_count: 0,
            word_fixations: 0,
            session_id,
            student_name,
            lesson_title,
            shared,
            queue,
            persist,
            cfg,
            clock,
            epoch,
            started_at_ms,
            source_label,
        }
    }

    fn run(mut self) {
        loop {
            let shutting_down = self.shared.shutdown.load(Ordering::Relaxed);
            match self.rx.recv_timeout(LOGIC_TICK) {
                Ok(sample) => self.on_sample(sample),
                Err(xch::RecvTimeoutError::Timeout) => {}
                Err(xch::RecvTimeoutError::Disconnected) => break,
            }
            if shutting_down {
                // Drain whatever is already queued, then flush.
                while let Ok(sample) = self.rx.try_recv() {
                    self.on_sample(sample);
                }
                break;
            }
        }
        self.finish();
    }

    fn on_sample(&mut self, sample: GazeSample) {
        // Samples must be strictly increasing as observed here; the push
        // and intake paths each stamp monotonically but do not coordinate.
        if sample.ts_ns <= self.last_ts_ns {
            self.queue
                .counters()
                .dropped_stale
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.last_ts_ns = sample.ts_ns;
        self.samples_seen += 1;

        *lock(&self.shared.last_device_sample) = Some(sample);

        let (screen_x, screen_y) = read(&self.shared.transform)
            .apply(sample.device_x, sample.device_y);
        let cs = CalibratedSample {
            sample,
            screen_x,
            screen_y,
        };

        self.persist
            .offer_raw(RawSampleRecord::from_sample(&self.session_id, &cs));

        let view = GazeView::of(&cs);
        self.trail.push_back(view.clone());
        if self.trail.len() > self.cfg.stream.trail_len {
            self.trail.pop_front();
        }
        if self.cfg.persist.export_gaze_trail {
            self.export_trail.push(view);
        }

        // AOI hits are recorded for any hardware-valid sample; confidence
        // filtering is reserved for the detector and the rule engine.
        if cs.sample.valid {
            let aoi_hit = read(&self.shared.aois)
                .find_hit(screen_x, screen_y)
                .cloned();
            match aoi_hit {
                Some(aoi) => {
                    self.hits.record_sample_hit(&cs, &aoi);
                    self.hits.note_gaze(cs.sample.ts_ns, Some(&aoi));
                }
                None => self.hits.note_gaze(cs.sample.ts_ns, None),
            }
        }

        if let Some(event) =
            self.detector
                .push(cs.sample.ts_ns, screen_x, screen_y, cs.sample.confidence)
        {
            self.on_event(event);
        }

        self.load.push(cs.sample.ts_ns, screen_x, screen_y);

        let now_ms = cs.sample.ts_ms();
        self.achievements
            .update_focus(now_ms as f64 / 1000.0, now_ms);

        self.publish_snapshot(Some(&cs));
    }

    fn on_event(&mut self, mut event: GazeEvent) {
        let now_ms = event.end_ts_ns() / 1_000_000;
        let mut fixation_aoi: Option<Aoi> = None;

        if let GazeEvent::Fixation(fx) = &mut event {
            self.fixation_count += 1;
            // The AOI in effect at the centroid, not at entry.
            fixation_aoi = read(&self.shared.aois)
                .find_hit(fx.centroid_x, fx.centroid_y)
                .cloned();
            fx.aoi_id = fixation_aoi.as_ref().map(|a| a.id.clone());

            if let Some(aoi) = &fixation_aoi {
                self.hits.record_fixation(fx, aoi);
                if aoi.kind == AoiKind::Vocab || aoi.kind == AoiKind::Content {
                    self.word_fixations += 1;
                }
            }
        } else {
            self.saccade_count += 1;
        }

        self.persist
            .offer_event(EventRecord::from_event(&self.session_id, &event));

        if let GazeEvent::Fixation(fx) = &event {
            self.achievements
                .update_vocabulary(self.hits.discovery_count(), now_ms);
            let minutes = (now_ms as f64 / 60_000.0).max(1.0 / 60.0);
            self.achievements
                .update_reading(self.word_fixations as f64 / minutes, now_ms);

            if let Some(cmd) = self.rules.on_fixation(fx, fixation_aoi.as_ref(), &self.session_id)
            {
                self.dispatch_command(&cmd);
            }
        }
    }

    fn dispatch_command(&self, cmd: &FeedbackCommand) {
        let mut sinks = lock(&self.shared.command_sinks);
        let mut closed = Vec::new();
        for (&sub_id, sink) in sinks.iter() {
            match sink.try_push(cmd) {
                Ok(()) | Err(SinkError::NotWritable) => {}
                Err(SinkError::Closed) => closed.push(sub_id),
            }
        }
        for sub_id in closed {
            tracing::debug!(sub_id, "command subscriber closed, unregistering");
            sinks.remove(&sub_id);
        }
    }

    fn current_stats(&self) -> SessionStats {
        let counters = self.queue.counters();
        let duration_ms = self.clock.ms_since(self.epoch);
        let total = self.hits.len() as u64;
        SessionStats {
            total_samples: self.samples_seen,
            invalid_samples: counters.dropped_invalid.load(Ordering::Relaxed)
                + counters.dropped_stale.load(Ordering::Relaxed),
            dropped_samples: counters.dropped_overflow.load(Ordering::Relaxed),
            total_hits: total,
            fixation_count: self.fixation_count,
            saccade_count: self.saccade_count,
            vocabulary_count: self.hits.discovery_count() as u64,
            feedback_count: self.rules.emitted(),
            feedback_suppressed: self.rules.suppressed(),
            duration_ms,
            samples_per_second: 0.0,
            words_per_minute: 0.0,
            persistence_degraded: self.persist.degraded(),
            lost_samples: self.persist.lost_samples(),
            source: self.source_label.clone(),
        }
    }

    fn publish_snapshot(&mut self, current: Option<&CalibratedSample>) {
        let mut stats = self.current_stats();
        if stats.duration_ms > 0 {
            stats.samples_per_second =
                stats.total_samples as f64 * 1000.0 / stats.duration_ms as f64;
            stats.words_per_minute =
                self.word_fixations as f64 * 60_000.0 / stats.duration_ms as f64;
        }

        let calibration = {
            let calibrator = lock(&self.shared.calibrator);
            let transform = read(&self.shared.transform);
            CalibrationView {
                state: calibrator.state().as_str(),
                calibrated: transform.calibrated,
                method: transform.method_name(),
                accuracy_px: transform.accuracy_px,
                points_collected: calibrator.points().len(),
            }
        };

        let state = *lock(&self.shared.state);
        let snapshot = Snapshot {
            session_id: self.session_id.clone(),
            state: state.as_str(),
            ts_ms: self.clock.ms_since(self.epoch),
            streaming: state == SessionState::Streaming,
            gaze: current.map(GazeView::of).or_else(|| self.trail.back().cloned()),
            trail: self
                .trail
                .iter()
                .rev()
                .take(SNAPSHOT_TRAIL)
                .rev()
                .cloned()
                .collect(),
            recent_hits: self.hits.recent(SNAPSHOT_HITS).to_vec(),
            vocabulary_discoveries: self.hits.discoveries_live().to_vec(),
            cognitive_load: self.load.current().cloned(),
            load_history: self.load.recent_history(SNAPSHOT_LOAD_HISTORY),
            recent_unlocks: self.achievements.recent_unlocks().cloned().collect(),
            statistics: stats,
            calibration,
        };
        *lock(&self.shared.snapshot) = snapshot;
    }

    fn finish(&mut self) {
        if let Some(event) = self.detector.finalize() {
            self.on_event(event);
        }
        self.hits.flush_dwell();
        self.publish_snapshot(None);

        let path = persist::export_path(
            Path::new(&self.cfg.persist.data_dir),
            &self.session_id,
            util::wall_ms() / 1000,
        );
        let doc = self.export_document();
        self.persist.export(doc, path.clone());
        *lock(&self.shared.export_path) = Some(path.display().to_string());
        tracing::info!(session_id = %self.session_id, "logic worker finished");
    }

    fn export_document(&self) -> serde_json::Value {
        let snapshot = lock(&self.shared.snapshot).clone();
        let transform = read(&self.shared.transform);
        let calibration_doc = transform.to_doc(lock(&self.shared.calibrator).points());
        let aois: Vec<Aoi> = read(&self.shared.aois).iter().cloned().collect();

        let gaze_trail = if self.cfg.persist.export_gaze_trail {
            serde_json::to_value(&self.export_trail).unwrap_or_default()
        } else {
            serde_json::Value::Array(Vec::new())
        };

        serde_json::json!({
            "session_id": self.session_id,
            "student_name": self.student_name,
            "lesson_title": self.lesson_title,
            "started_at_ms": self.started_at_ms,
            "ended_at_ms": util::wall_ms(),
            "duration_ms": snapshot.statistics.duration_ms,
            "total_samples": snapshot.statistics.total_samples,
            "samples_per_second": snapshot.statistics.samples_per_second,
            "gaze_trail": gaze_trail,
            "aois": aois,
            "hit_log": self.hits.hits(),
            "aoi_statistics": self.hits.aggregates(),
            "vocabulary_discoveries": self.hits.discoveries_full(),
            "statistics": snapshot.statistics,
            "calibration": calibration_doc,
            "achievements": {
                "all": self.achievements.all(),
                "unlocked_count": self.achievements.unlocked_count(),
                "total_points": self.achievements.total_points(),
            },
        })
    }
}

fn fanout_loop(shared: &Arc<Shared>, period: Duration) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        std::thread::sleep(period);

        let snapshot = lock(&shared.snapshot).clone();
        let mut sinks = lock(&shared.snapshot_sinks);
        let mut closed = Vec::new();
        for (&sub_id, sink) in sinks.iter() {
            match sink.try_push(&snapshot) {
                Ok(()) => {}
                // Not writable: a slow subscriber never back-pressures
                // ingest; it just misses this snapshot.
                Err(SinkError::NotWritable) => {}
                Err(SinkError::Closed) => closed.push(sub_id),
            }
        }
        for sub_id in closed {
            tracing::debug!(sub_id, "snapshot subscriber closed, unregistering");
            sinks.remove(&sub_id);
        }
    }
    tracing::trace!("fanout thread exiting cleanly");
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maps session id to owned session. Sessions hold their own workers;
/// there is no process-wide manager.
pub struct SessionRegistry {
    cfg: Arc<Config>,
    clock: Arc<dyn Clock + Send + Sync>,
    base_transform: RwLock<CalibrationTransform>,
    device_factory: Mutex<Option<DeviceFactory>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    current: RwLock<Option<String>>,
}

impl SessionRegistry {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self::with_clock(cfg, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(cfg: Arc<Config>, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let mut base =
            CalibrationTransform::identity(cfg.screen.width_px, cfg.screen.height_px);
        if let Some(file) = &cfg.calibration.file {
            match gazed_config::load_calibration_json(Path::new(file)) {
                Ok(doc) => {
                    tracing::info!(
                        file,
                        method = %doc.method,
                        accuracy_px = doc.accuracy_px,
                        "loaded persisted calibration"
                    );
                    base = CalibrationTransform::from_doc(&doc);
                }
                Err(e) => {
                    tracing::warn!(file, error = %e, "persisted calibration unusable, starting uncalibrated");
                }
            }
        }
        Self {
            cfg,
            clock,
            base_transform: RwLock::new(base),
            device_factory: Mutex::new(None),
            sessions: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn set_device_factory(&self, factory: DeviceFactory) {
        *lock(&self.device_factory) = Some(factory);
    }

    /// Start (or idempotently rejoin) a session. Returns the session and
    /// whether it was already running.
    pub fn start_session(&self, opts: &StartOptions) -> (Arc<Session>, bool) {
        let id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| {
                format!(
                    "session_{}_{}",
                    util::wall_ms(),
                    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
                )
            });

        {
            let sessions = read(&self.sessions);
            if let Some(existing) = sessions.get(&id) {
                if existing.state() != SessionState::Stopped {
                    return (Arc::clone(existing), true);
                }
            }
        }

        let mode = opts.source.unwrap_or(self.cfg.source.mode);
        let source = self.resolve_source(mode);
        let transform = read(&self.base_transform).clone();
        let session = Session::start(
            id.clone(),
            opts,
            Arc::clone(&self.cfg),
            Arc::clone(&self.clock),
            transform,
            source,
        );

        write(&self.sessions).insert(id.clone(), Arc::clone(&session));
        *write(&self.current) = Some(id);
        (session, false)
    }

    fn resolve_source(&self, mode: SourceMode) -> ResolvedSource {
        match mode {
            SourceMode::Push => ResolvedSource::Push,
            SourceMode::Mock => ResolvedSource::Mock("mock"),
            SourceMode::Device => {
                let factory = lock(&self.device_factory);
                match factory.as_ref().map(|f| f()) {
                    Some(Ok(source)) => ResolvedSource::Device(source),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "device unavailable, falling back to mock source");
                        ResolvedSource::Mock("mock (device unavailable)")
                    }
                    None => {
                        tracing::warn!("no device adapter installed, falling back to mock source");
                        ResolvedSource::Mock("mock (device unavailable)")
                    }
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        read(&self.sessions).get(id).cloned()
    }

    /// The most recently started session, if any.
    pub fn current(&self) -> Option<Arc<Session>> {
        let id = read(&self.current).clone()?;
        self.get(&id)
    }

    /// Resolve an optional explicit id, defaulting to the current session.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<Session>, EngineError> {
        match id {
            Some(id) => self
                .get(id)
                .ok_or_else(|| EngineError::SessionNotFound(id.to_string())),
            None => self
                .current()
                .ok_or_else(|| EngineError::SessionNotFound("(no active session)".to_string())),
        }
    }

    pub fn stop_session(&self, id: &str) -> Result<StopReport, EngineError> {
        let session = self
            .get(id)
            .ok_or_else(|| EngineError::SessionNotFound(id.to_string()))?;
        Ok(session.stop())
    }

    pub fn stop_all(&self) {
        let sessions: Vec<Arc<Session>> = read(&self.sessions).values().cloned().collect();
        for session in sessions {
            session.stop();
        }
    }

    /// Adopt a freshly computed transform as the default for future
    /// sessions and persist it (atomic write) for later runs.
    pub fn adopt_transform(
        &self,
        transform: &CalibrationTransform,
        points: &[CalibrationPoint],
    ) -> Result<(), EngineError> {
        *write(&self.base_transform) = transform.clone();
        let doc = transform.to_doc(points);
        let path = Path::new(&self.cfg.persist.data_dir).join("calibration.json");
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;
        persist::write_atomic(&path, &bytes)
            .map_err(|e| EngineError::PersistenceFailed(e.to_string()))?;
        tracing::info!(path = %path.display(), "calibration persisted");
        Ok(())
    }
}
