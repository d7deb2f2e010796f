//! I-DT fixation/saccade detection as an explicit state machine.
//!
//! `Idle` buffers calibrated samples until the time window fills, then
//! classifies the window by dispersion (x_range + y_range): within
//! threshold it transitions to `Fixating`, otherwise it emits a saccade
//! covering the window and restarts. `Fixating` grows the fixation until a
//! sample falls outside the dispersion threshold or a low-confidence run
//! interrupts it; fixations shorter than the minimum duration are aborted
//! rather than emitted.
//!
//! Low-confidence samples never participate in dispersion or centroid math
//! but count toward gap detection. The detector is pure: AOI attribution
//! happens downstream at the event's centroid.
use gazed_config::DetectorCfg;
use serde::Serialize;

/// Consecutive low-confidence samples that interrupt a fixation.
const LOW_CONFIDENCE_GAP: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct Fixation {
    /// AOI at the centroid, attributed by the session pipeline.
    pub aoi_id: Option<String>,
    pub start_ts_ns: u64,
    pub end_ts_ns: u64,
    pub duration_ms: u64,
    pub centroid_x: f64,
    pub centroid_y: f64,
    pub mean_confidence: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Saccade {
    pub start_ts_ns: u64,
    pub end_ts_ns: u64,
    pub duration_ms: u64,
    pub start_x: f64,
    pub start_y: f64,
    pub end_x: f64,
    pub end_y: f64,
    /// Highest inter-sample velocity in the window, px/s.
    pub peak_velocity: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "lowercase")]
pub enum GazeEvent {
    Fixation(Fixation),
    Saccade(Saccade),
}

impl GazeEvent {
    pub fn end_ts_ns(&self) -> u64 {
        match self {
            GazeEvent::Fixation(f) => f.end_ts_ns,
            GazeEvent::Saccade(s) => s.end_ts_ns,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            GazeEvent::Fixation(_) => "fixation",
            GazeEvent::Saccade(_) => "saccade",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pt {
    ts_ns: u64,
    x: f64,
    y: f64,
    confidence: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    pub window_ns: u64,
    pub dispersion_px: f64,
    pub min_fixation_ns: u64,
    pub confidence_threshold: f64,
}

impl DetectorParams {
    pub fn from_cfg(cfg: &DetectorCfg, pixels_per_degree: f64) -> Self {
        Self {
            window_ns: cfg.fixation_window_ms * 1_000_000,
            dispersion_px: cfg.dispersion_threshold_deg * pixels_per_degree,
            min_fixation_ns: cfg.min_fixation_ms * 1_000_000,
            confidence_threshold: cfg.confidence_threshold,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Idle {
        buf: Vec<Pt>,
    },
    Fixating {
        pts: Vec<Pt>,
        min_x: f64,
        max_x: f64,
        min_y: f64,
        max_y: f64,
        low_run: u32,
    },
}

#[derive(Debug)]
pub struct EventDetector {
    params: DetectorParams,
    phase: Phase,
}

impl EventDetector {
    pub fn new(params: DetectorParams) -> Self {
        Self {
            params,
            phase: Phase::Idle { buf: Vec::new() },
        }
    }

    /// Feed one calibrated sample; returns any event it completes.
    pub fn push(&mut self, ts_ns: u64, x: f64, y: f64, confidence: f64) -> Option<GazeEvent> {
        let pt = Pt {
            ts_ns,
            x,
            y,
            confidence,
        };
        let idle = Phase::Idle { buf: Vec::new() };
        let (next, event) = match std::mem::replace(&mut self.phase, idle) {
            Phase::Idle { mut buf } => {
                if confidence < self.params.confidence_threshold {
                    // Cannot seed a fixation; gap accounting only applies
                    // inside one.
                    (Phase::Idle { buf }, None)
                } else {
                    buf.push(pt);
                    let span = buf[buf.len() - 1].ts_ns - buf[0].ts_ns;
                    if span < self.params.window_ns {
                        (Phase::Idle { buf }, None)
                    } else if dispersion_of(&buf) <= self.params.dispersion_px {
                        (fixating_from(buf), None)
                    } else {
                        let ev = saccade_of(&buf);
                        (
                            Phase::Idle { buf: Vec::new() },
                            Some(GazeEvent::Saccade(ev)),
                        )
                    }
                }
            }
            Phase::Fixating {
                mut pts,
                mut min_x,
                mut max_x,
                mut min_y,
                mut max_y,
                mut low_run,
            } => {
                if confidence < self.params.confidence_threshold {
                    low_run += 1;
                    if low_run < LOW_CONFIDENCE_GAP {
                        (
                            Phase::Fixating {
                                pts,
                                min_x,
                                max_x,
                                min_y,
                                max_y,
                                low_run,
                            },
                            None,
                        )
                    } else {
                        // Gap: the fixation ends at the last supported
                        // sample. Below minimum duration it is aborted.
                        let ev = close_fixation(&pts, self.params.min_fixation_ns);
                        (Phase::Idle { buf: Vec::new() }, ev)
                    }
                } else {
                    let nx_min = min_x.min(x);
                    let nx_max = max_x.max(x);
                    let ny_min = min_y.min(y);
                    let ny_max = max_y.max(y);
                    if (nx_max - nx_min) + (ny_max - ny_min) <= self.params.dispersion_px {
                        min_x = nx_min;
                        max_x = nx_max;
                        min_y = ny_min;
                        max_y = ny_max;
                        pts.push(pt);
                        (
                            Phase::Fixating {
                                pts,
                                min_x,
                                max_x,
                                min_y,
                                max_y,
                                low_run: 0,
                            },
                            None,
                        )
                    } else {
                        // Out of bounds: finalize and restart the window at
                        // the out-of-bounds sample.
                        let ev = close_fixation(&pts, self.params.min_fixation_ns);
                        (Phase::Idle { buf: vec![pt] }, ev)
                    }
                }
            }
        };
        self.phase = next;
        event
    }

    /// Flush an in-progress fixation (e.g. on session stop).
    pub fn finalize(&mut self) -> Option<GazeEvent> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle { buf: Vec::new() });
        match phase {
            Phase::Fixating { pts, .. } => close_fixation(&pts, self.params.min_fixation_ns),
            Phase::Idle { .. } => None,
        }
    }
}

fn close_fixation(pts: &[Pt], min_fixation_ns: u64) -> Option<GazeEvent> {
    let (first, last) = (pts.first()?, pts.last()?);
    let span = last.ts_ns - first.ts_ns;
    if span < min_fixation_ns {
        tracing::trace!(span_ns = span, "fixation below minimum duration, aborted");
        return None;
    }
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let conf = pts.iter().map(|p| p.confidence).sum::<f64>() / n;
    Some(GazeEvent::Fixation(Fixation {
        aoi_id: None,
        start_ts_ns: first.ts_ns,
        end_ts_ns: last.ts_ns,
        duration_ms: span / 1_000_000,
        centroid_x: cx,
        centroid_y: cy,
        mean_confidence: conf,
        sample_count: pts.len(),
    }))
}

fn fixating_from(pts: Vec<Pt>) -> Phase {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for p in &pts {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    Phase::Fixating {
        pts,
        min_x,
        max_x,
        min_y,
        max_y,
        low_run: 0,
    }
}

fn dispersion_of(pts: &[Pt]) -> f64 {
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for p in pts {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    (max_x - min_x) + (max_y - min_y)
}

fn saccade_of(pts: &[Pt]) -> Saccade {
    let first = pts[0];
    let last = pts[pts.len() - 1];
    let mut peak = 0.0f64;
    for w in pts.windows(2) {
        let dt_s = (w[1].ts_ns.saturating_sub(w[0].ts_ns)) as f64 / 1e9;
        if dt_s > 0.0 {
            let d = ((w[1].x - w[0].x).powi(2) + (w[1].y - w[0].y).powi(2)).sqrt();
            peak = peak.max(d / dt_s);
        }
    }
    Saccade {
        start_ts_ns: first.ts_ns,
        end_ts_ns: last.ts_ns,
        duration_ms: (last.ts_ns - first.ts_ns) / 1_000_000,
        start_x: first.x,
        start_y: first.y,
        end_x: last.x,
        end_y: last.y,
        peak_velocity: peak,
    }
}
