//! Persistence worker: batched raw-sample appends, per-event appends, and
//! the atomic end-of-session export.
//!
//! The worker owns all file I/O and runs on its own thread behind a bounded
//! command queue with drop-oldest overflow, so ingest never blocks on disk.
//! Append failures retry with exponential backoff up to three attempts;
//! after that the batch is dropped, the loss is counted and the session is
//! flagged `persistence_degraded`; the live path keeps going.
use crate::detector::GazeEvent;
use crate::types::CalibratedSample;
use crossbeam_channel as xch;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(10);
const QUEUE_CAP: usize = 1024;
const TICK: Duration = Duration::from_millis(25);

/// One row of the raw-samples append path
/// (`raw_samples(timestamp, session_id, payload)`).
#[derive(Debug, Clone, Serialize)]
pub struct RawSampleRecord {
    pub timestamp: u64,
    pub session_id: String,
    pub payload: serde_json::Value,
}

impl RawSampleRecord {
    pub fn from_sample(session_id: &str, cs: &CalibratedSample) -> Self {
        Self {
            timestamp: cs.sample.ts_ns,
            session_id: session_id.to_string(),
            payload: serde_json::to_value(cs).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// One row of the events append path.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub session_id: String,
    pub event_type: String,
    pub start_ts: u64,
    pub end_ts: u64,
    pub duration_ms: u64,
    pub aoi_id: Option<String>,
    pub gaze_x: f64,
    pub gaze_y: f64,
    pub confidence: f64,
}

impl EventRecord {
    pub fn from_event(session_id: &str, ev: &GazeEvent) -> Self {
        match ev {
            GazeEvent::Fixation(f) => Self {
                session_id: session_id.to_string(),
                event_type: "fixation".to_string(),
                start_ts: f.start_ts_ns,
                end_ts: f.end_ts_ns,
                duration_ms: f.duration_ms,
                aoi_id: f.aoi_id.clone(),
                gaze_x: f.centroid_x,
                gaze_y: f.centroid_y,
                confidence: f.mean_confidence,
            },
            GazeEvent::Saccade(s) => Self {
                session_id: session_id.to_string(),
                event_type: "saccade".to_string(),
                start_ts: s.start_ts_ns,
                end_ts: s.end_ts_ns,
                duration_ms: s.duration_ms,
                aoi_id: None,
                gaze_x: (s.start_x + s.end_x) / 2.0,
                gaze_y: (s.start_y + s.end_y) / 2.0,
                confidence: 0.0,
            },
        }
    }
}

/// Bulk-append sink. The in-tree implementation appends JSON lines; a
/// database-backed sink plugs in here.
pub trait BulkSink: Send {
    fn append_samples(&mut self, batch: &[RawSampleRecord]) -> std::io::Result<()>;
    fn append_event(&mut self, event: &EventRecord) -> std::io::Result<()>;
}

/// JSONL sink under `data_dir`: `{session}_samples.jsonl` and
/// `{session}_events.jsonl`, opened lazily on first write.
pub struct JsonlSink {
    dir: PathBuf,
    session_id: String,
    samples: Option<std::io::BufWriter<std::fs::File>>,
    events: Option<std::io::BufWriter<std::fs::File>>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            session_id: session_id.into(),
            samples: None,
            events: None,
        }
    }

    fn open(&self, suffix: &str) -> std::io::Result<std::io::BufWriter<std::fs::File>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}_{suffix}.jsonl", self.session_id));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(std::io::BufWriter::new(file))
    }
}

impl BulkSink for JsonlSink {
    fn append_samples(&mut self, batch: &[RawSampleRecord]) -> std::io::Result<()> {
        if self.samples.is_none() {
            self.samples = Some(self.open("samples")?);
        }
        let w = self.samples.as_mut().ok_or_else(|| std::io::Error::other("no writer"))?;
        for rec in batch {
            serde_json::to_writer(&mut *w, rec)?;
            w.write_all(b"\n")?;
        }
        w.flush()
    }

    fn append_event(&mut self, event: &EventRecord) -> std::io::Result<()> {
        if self.events.is_none() {
            self.events = Some(self.open("events")?);
        }
        let w = self.events.as_mut().ok_or_else(|| std::io::Error::other("no writer"))?;
        serde_json::to_writer(&mut *w, event)?;
        w.write_all(b"\n")?;
        w.flush()
    }
}

/// Write-to-temp, fsync, rename. The export document is either fully
/// present or absent, never torn.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("new");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(tmp, path)
}

/// Export document path: `data/session_{id}_{epoch}.json`.
pub fn export_path(data_dir: &Path, session_id: &str, epoch_secs: u64) -> PathBuf {
    data_dir.join(format!("session_{session_id}_{epoch_secs}.json"))
}

enum Cmd {
    Raw(RawSampleRecord),
    Event(EventRecord),
}

struct ExportJob {
    doc: serde_json::Value,
    path: PathBuf,
}

/// Cheap handle for offering work to the persistence worker. Clones share
/// the queue and loss counters; `offer_*` never block.
#[derive(Clone)]
pub struct PersistClient {
    cmd_tx: xch::Sender<Cmd>,
    cmd_rx: xch::Receiver<Cmd>,
    export_tx: xch::Sender<ExportJob>,
    lost_samples: Arc<AtomicU64>,
    lost_events: Arc<AtomicU64>,
    degraded: Arc<AtomicBool>,
}

/// Owner of the persistence worker thread. Holds one `PersistClient` of its
/// own; `shutdown` disconnects the queue (all clients must be dropped by
/// then) and flushes with a bounded grace period.
pub struct PersistHandle {
    client: PersistClient,
    done_rx: xch::Receiver<()>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl PersistHandle {
    pub fn spawn(mut sink: Box<dyn BulkSink>, batch_size: usize, batch_ms: u64) -> Self {
        let (cmd_tx, cmd_rx) = xch::bounded::<Cmd>(QUEUE_CAP);
        let (export_tx, export_rx) = xch::bounded::<ExportJob>(1);
        let (done_tx, done_rx) = xch::bounded::<()>(1);
        let lost_samples = Arc::new(AtomicU64::new(0));
        let lost_events = Arc::new(AtomicU64::new(0));
        let degraded = Arc::new(AtomicBool::new(false));

        let worker_rx = cmd_rx.clone();
        let lost_s = lost_samples.clone();
        let degraded_flag = degraded.clone();
        let batch_size = batch_size.max(1);
        let batch_window = Duration::from_millis(batch_ms.max(1));

        let join_handle = std::thread::spawn(move || {
            let mut pending: Vec<RawSampleRecord> = Vec::with_capacity(batch_size);
            let mut first_pending: Option<Instant> = None;

            let flush = |pending: &mut Vec<RawSampleRecord>,
                         first: &mut Option<Instant>,
                         sink: &mut Box<dyn BulkSink>| {
                if pending.is_empty() {
                    return;
                }
                if append_with_retry(sink, pending) {
                    pending.clear();
                } else {
                    lost_s.fetch_add(pending.len() as u64, Ordering::Relaxed);
                    degraded_flag.store(true, Ordering::Relaxed);
                    tracing::error!(
                        dropped = pending.len(),
                        "raw batch dropped after retries; session persistence degraded"
                    );
                    pending.clear();
                }
                *first = None;
            };

            loop {
                match worker_rx.recv_timeout(TICK) {
                    Ok(Cmd::Raw(rec)) => {
                        if pending.is_empty() {
                            first_pending = Some(Instant::now());
                        }
                        pending.push(rec);
                        if pending.len() >= batch_size {
                            flush(&mut pending, &mut first_pending, &mut sink);
                        }
                    }
                    Ok(Cmd::Event(ev)) => {
                        if let Err(e) = sink.append_event(&ev) {
                            // Best-effort: one failure is logged, not retried.
                            tracing::warn!(error = %e, "event append failed");
                        }
                    }
                    Err(xch::RecvTimeoutError::Timeout) => {}
                    Err(xch::RecvTimeoutError::Disconnected) => {
                        flush(&mut pending, &mut first_pending, &mut sink);
                        if let Ok(job) = export_rx.try_recv() {
                            run_export(&job);
                        }
                        break;
                    }
                }

                if let Some(first) = first_pending {
                    if first.elapsed() >= batch_window {
                        flush(&mut pending, &mut first_pending, &mut sink);
                    }
                }
                if let Ok(job) = export_rx.try_recv() {
                    flush(&mut pending, &mut first_pending, &mut sink);
                    run_export(&job);
                }
            }
            let _ = done_tx.send(());
            tracing::trace!("persistence thread exiting cleanly");
        });

        Self {
            client: PersistClient {
                cmd_tx,
                cmd_rx,
                export_tx,
                lost_samples,
                lost_events,
                degraded,
            },
            done_rx,
            join_handle: Some(join_handle),
        }
    }

    pub fn client(&self) -> PersistClient {
        self.client.clone()
    }

    pub fn offer_raw(&self, rec: RawSampleRecord) {
        self.client.offer_raw(rec);
    }

    pub fn offer_event(&self, rec: EventRecord) {
        self.client.offer_event(rec);
    }

    pub fn export(&self, doc: serde_json::Value, path: PathBuf) {
        self.client.export(doc, path);
    }

    pub fn lost_samples(&self) -> u64 {
        self.client.lost_samples()
    }

    pub fn degraded(&self) -> bool {
        self.client.degraded()
    }

    /// Flush outstanding work and stop, bounded by `grace`. Every other
    /// `PersistClient` clone must already be dropped, otherwise the queue
    /// stays connected and the grace period elapses. Returns true if the
    /// worker confirmed a clean exit in time.
    pub fn shutdown(self, grace: Duration) -> bool {
        let PersistHandle {
            client,
            done_rx,
            mut join_handle,
        } = self;
        drop(client); // disconnect: worker drains and exits
        let clean = done_rx.recv_timeout(grace).is_ok();
        if clean {
            if let Some(h) = join_handle.take() {
                let _ = h.join();
            }
        } else {
            tracing::warn!("persistence worker did not drain within grace; detaching");
        }
        clean
    }
}

impl PersistClient {
    /// Enqueue a raw sample; drops the oldest queued command when full.
    pub fn offer_raw(&self, rec: RawSampleRecord) {
        let mut pending = Cmd::Raw(rec);
        loop {
            match self.cmd_tx.try_send(pending) {
                Ok(()) => return,
                Err(xch::TrySendError::Full(back)) => {
                    match self.cmd_rx.try_recv() {
                        Ok(Cmd::Raw(_)) => {
                            self.lost_samples.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Cmd::Event(_)) => {
                            self.lost_events.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {}
                    }
                    pending = back;
                }
                Err(xch::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Enqueue an event append (best-effort; dropped when the queue is full).
    pub fn offer_event(&self, rec: EventRecord) {
        if self.cmd_tx.try_send(Cmd::Event(rec)).is_err() {
            self.lost_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue the end-of-session export document.
    pub fn export(&self, doc: serde_json::Value, path: PathBuf) {
        let _ = self.export_tx.send(ExportJob { doc, path });
    }

    pub fn lost_samples(&self) -> u64 {
        self.lost_samples.load(Ordering::Relaxed)
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

fn append_with_retry(sink: &mut Box<dyn BulkSink>, batch: &[RawSampleRecord]) -> bool {
    let mut delay = RETRY_BASE;
    for attempt in 1..=RETRY_ATTEMPTS {
        match sink.append_samples(batch) {
            Ok(()) => return true,
            Err(e) => {
                tracing::warn!(attempt, error = %e, "raw batch append failed");
                if attempt < RETRY_ATTEMPTS {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }
    }
    false
}

fn run_export(job: &ExportJob) {
    match serde_json::to_vec_pretty(&job.doc) {
        Ok(bytes) => match write_atomic(&job.path, &bytes) {
            Ok(()) => tracing::info!(path = %job.path.display(), "session exported"),
            Err(e) => tracing::error!(error = %e, path = %job.path.display(), "session export failed"),
        },
        Err(e) => tracing::error!(error = %e, "export serialization failed"),
    }
}
