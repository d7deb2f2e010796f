//! Per-session sample intake.
//!
//! `SampleQueue` is the bounded channel between producers (the intake
//! thread or WebSocket push) and the logic worker. When full it drops the
//! OLDEST sample and counts the drop: the UI prefers freshness over
//! completeness, and intake must never block on downstream components.
//!
//! `IntakeWorker` spawns a thread that owns the `SampleSource`, stamps each
//! sample with a strictly increasing session-relative timestamp, and pushes
//! into the queue. The thread is signalled and joined when the worker is
//! dropped, preventing thread leaks.
use crate::types::GazeSample;
use crossbeam_channel as xch;
use gazed_traits::{Clock, SampleSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct IngestCounters {
    /// Samples discarded because the queue was full (oldest dropped).
    pub dropped_overflow: AtomicU64,
    /// Samples rejected as malformed (NaN, out-of-range confidence).
    pub dropped_invalid: AtomicU64,
    /// Samples rejected for violating timestamp monotonicity on the push path.
    pub dropped_stale: AtomicU64,
}

/// Bounded sample channel with drop-oldest overflow behavior. Cloneable;
/// all clones share the same buffer and counters.
#[derive(Clone)]
pub struct SampleQueue {
    tx: xch::Sender<GazeSample>,
    rx: xch::Receiver<GazeSample>,
    counters: Arc<IngestCounters>,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = xch::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            counters: Arc::new(IngestCounters::default()),
        }
    }

    /// Enqueue a sample, discarding the oldest entry when full.
    pub fn push(&self, sample: GazeSample) {
        let mut pending = sample;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return,
                Err(xch::TrySendError::Full(back)) => {
                    // Make room by discarding the oldest queued sample.
                    if self.rx.try_recv().is_ok() {
                        self.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                    }
                    pending = back;
                }
                Err(xch::TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Receiver end for the logic worker.
    pub fn receiver(&self) -> xch::Receiver<GazeSample> {
        self.rx.clone()
    }

    pub fn counters(&self) -> Arc<IngestCounters> {
        Arc::clone(&self.counters)
    }
}

/// Thread that polls a `SampleSource` at the configured rate.
pub struct IntakeWorker {
    shutdown: Arc<AtomicBool>,
    last_ok_ms: Arc<AtomicU64>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl IntakeWorker {
    pub fn spawn<S, C>(
        mut source: S,
        queue: SampleQueue,
        hz: u32,
        timeout: Duration,
        clock: C,
        epoch: Instant,
    ) -> Self
    where
        S: SampleSource + Send + 'static,
        C: Clock + Send + Sync + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let last_ok_ms = Arc::new(AtomicU64::new(0));
        let last_ok = last_ok_ms.clone();
        let period = Duration::from_micros(crate::util::period_us(hz));
        let counters = queue.counters();

        let join_handle = std::thread::spawn(move || {
            let mut last_ts_ns: u64 = 0;
            loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    tracing::debug!("intake thread received shutdown signal");
                    break;
                }

                match source.next(timeout) {
                    Ok(raw) => {
                        // Strictly increasing session-relative timestamps.
                        let ts = clock.ns_since(epoch).max(last_ts_ns + 1);
                        last_ts_ns = ts;
                        let sample = GazeSample::from_raw(&raw, ts);
                        if sample.is_well_formed() {
                            queue.push(sample);
                            last_ok.store(ts / 1_000_000, Ordering::Relaxed);
                        } else {
                            counters.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(e) => {
                        // Transient source errors are absorbed; the session
                        // watchdog observes staleness through last_ok.
                        tracing::trace!(error = %e, "sample source read failed");
                    }
                }

                if shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                clock.sleep(period);
            }
            tracing::trace!("intake thread exiting cleanly");
        });

        Self {
            shutdown,
            last_ok_ms,
            join_handle: Some(join_handle),
        }
    }

    /// Milliseconds of session time since the last good read.
    pub fn stalled_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_ok_ms.load(Ordering::Relaxed))
    }
}

impl Drop for IntakeWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        // The thread exits after at most one source read (bounded by the
        // read timeout) plus one sleep period.
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("intake thread joined"),
                Err(e) => tracing::warn!(?e, "intake thread panicked during shutdown"),
            }
        }
    }
}
