//! Append-only AOI hit log, per-AOI aggregates and vocabulary discoveries.
use crate::aoi::Aoi;
use crate::detector::Fixation;
use crate::types::CalibratedSample;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HitType {
    #[serde(rename = "2d")]
    TwoD,
    #[serde(rename = "3d")]
    ThreeD,
    Fixation,
}

/// Quality of a hit derived from distance to the AOI centre, confidence and
/// dwell duration. Thresholds are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HitQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl HitQuality {
    pub fn classify(distance_px: f64, confidence: f64, duration_ms: u64) -> Self {
        if confidence >= 0.8 && distance_px <= 15.0 && duration_ms >= 1000 {
            HitQuality::Excellent
        } else if confidence >= 0.6 && distance_px <= 25.0 && duration_ms >= 500 {
            HitQuality::Good
        } else if confidence >= 0.4 && distance_px <= 40.0 {
            HitQuality::Fair
        } else {
            HitQuality::Poor
        }
    }

    fn slot(self) -> usize {
        match self {
            HitQuality::Excellent => 0,
            HitQuality::Good => 1,
            HitQuality::Fair => 2,
            HitQuality::Poor => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AoiHit {
    /// Strictly increasing within a session.
    pub seq: u64,
    pub sample_ts_ns: u64,
    pub aoi_id: String,
    pub aoi_text: String,
    pub is_vocabulary: bool,
    pub gaze_x: f64,
    pub gaze_y: f64,
    pub aoi_center_x: f64,
    pub aoi_center_y: f64,
    pub confidence: f64,
    pub hit_type: HitType,
    /// Zero for raw sample hits; only measured fixations carry dwell.
    pub fixation_duration_ms: u64,
    pub distance_px: f64,
    pub hit_quality: HitQuality,
    pub session_id: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QualityHistogram {
    pub excellent: u64,
    pub good: u64,
    pub fair: u64,
    pub poor: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AoiAggregate {
    pub text: String,
    pub is_vocabulary: bool,
    pub count: u64,
    pub total_dwell_ms: u64,
    pub mean_confidence: f64,
    pub quality: QualityHistogram,
}

#[derive(Debug)]
struct AggState {
    text: String,
    is_vocabulary: bool,
    count: u64,
    dwell_ms: u64,
    confidence_sum: f64,
    hist: [u64; 4],
}

/// Session-scoped hit bookkeeping. Owned by the logic worker; everything
/// here is single-threaded.
#[derive(Debug)]
pub struct HitLogBook {
    session_id: String,
    hits: Vec<AoiHit>,
    next_seq: u64,
    /// (aoi_id, entry_ts_ns, last_ts_ns) of the AOI currently being looked
    /// at; closed spans accumulate into the per-AOI dwell total.
    current_dwell: Option<(String, u64, u64)>,
    aggregates: HashMap<String, AggState>,
    /// Vocabulary texts with at least one qualifying fixation, ordered by
    /// first discovery. Full set; the live view is bounded.
    discoveries: Vec<String>,
    live_bound: usize,
}

impl HitLogBook {
    pub fn new(session_id: impl Into<String>, live_bound: usize) -> Self {
        Self {
            session_id: session_id.into(),
            hits: Vec::new(),
            next_seq: 0,
            current_dwell: None,
            aggregates: HashMap::new(),
            discoveries: Vec::new(),
            live_bound: live_bound.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn hits(&self) -> &[AoiHit] {
        &self.hits
    }

    pub fn recent(&self, n: usize) -> &[AoiHit] {
        let start = self.hits.len().saturating_sub(n);
        &self.hits[start..]
    }

    pub fn vocabulary_hits(&self) -> impl Iterator<Item = &AoiHit> {
        self.hits.iter().filter(|h| h.is_vocabulary)
    }

    /// Record a raw-sample hit (C5 hit log path).
    pub fn record_sample_hit(&mut self, cs: &CalibratedSample, aoi: &Aoi) -> AoiHit {
        let (cx, cy) = aoi.center();
        let distance = ((cs.screen_x - cx).powi(2) + (cs.screen_y - cy).powi(2)).sqrt();
        let hit = AoiHit {
            seq: self.bump_seq(),
            sample_ts_ns: cs.sample.ts_ns,
            aoi_id: aoi.id.clone(),
            aoi_text: aoi.text.clone(),
            is_vocabulary: aoi.is_vocab(),
            gaze_x: cs.screen_x,
            gaze_y: cs.screen_y,
            aoi_center_x: cx,
            aoi_center_y: cy,
            confidence: cs.sample.confidence,
            hit_type: HitType::TwoD,
            fixation_duration_ms: 0,
            distance_px: distance,
            hit_quality: HitQuality::classify(distance, cs.sample.confidence, 0),
            session_id: self.session_id.clone(),
        };
        self.push(hit.clone());
        hit
    }

    /// Record a finalized fixation attributed to an AOI. Every detector
    /// fixation already satisfies the minimum duration, so a vocabulary AOI
    /// counts as discovered here.
    pub fn record_fixation(&mut self, fx: &Fixation, aoi: &Aoi) -> AoiHit {
        let (cx, cy) = aoi.center();
        let distance = ((fx.centroid_x - cx).powi(2) + (fx.centroid_y - cy).powi(2)).sqrt();
        let hit = AoiHit {
            seq: self.bump_seq(),
            sample_ts_ns: fx.start_ts_ns,
            aoi_id: aoi.id.clone(),
            aoi_text: aoi.text.clone(),
            is_vocabulary: aoi.is_vocab(),
            gaze_x: fx.centroid_x,
            gaze_y: fx.centroid_y,
            aoi_center_x: cx,
            aoi_center_y: cy,
            confidence: fx.mean_confidence,
            hit_type: HitType::Fixation,
            fixation_duration_ms: fx.duration_ms,
            distance_px: distance,
            hit_quality: HitQuality::classify(distance, fx.mean_confidence, fx.duration_ms),
            session_id: self.session_id.clone(),
        };
        self.push(hit.clone());

        if aoi.is_vocab() && !self.discoveries.iter().any(|t| t == &aoi.text) {
            self.discoveries.push(aoi.text.clone());
            tracing::debug!(word = %aoi.text, "vocabulary discovered");
        }
        hit
    }

    /// Per-sample dwell accounting: consecutive samples on the same AOI
    /// accumulate time-on-AOI; leaving the AOI (or leaving all AOIs) closes
    /// the open span into the aggregate.
    pub fn note_gaze(&mut self, ts_ns: u64, aoi: Option<&Aoi>) {
        match (&mut self.current_dwell, aoi) {
            (Some((id, _, last)), Some(a)) if *id == a.id => {
                *last = ts_ns;
            }
            (current, hit) => {
                if let Some((id, entry, last)) = current.take() {
                    let dwell_ms = last.saturating_sub(entry) / 1_000_000;
                    if let Some(agg) = self.aggregates.get_mut(&id) {
                        agg.dwell_ms += dwell_ms;
                    }
                }
                *current = hit.map(|a| (a.id.clone(), ts_ns, ts_ns));
            }
        }
    }

    /// Close any open dwell span (called on session stop).
    pub fn flush_dwell(&mut self) {
        self.note_gaze(u64::MAX, None);
    }

    pub fn discoveries_full(&self) -> &[String] {
        &self.discoveries
    }

    /// Most recent N discoveries for live streaming.
    pub fn discoveries_live(&self) -> &[String] {
        let start = self.discoveries.len().saturating_sub(self.live_bound);
        &self.discoveries[start..]
    }

    pub fn discovery_count(&self) -> usize {
        self.discoveries.len()
    }

    /// Per-AOI aggregates in deterministic (id) order.
    pub fn aggregates(&self) -> std::collections::BTreeMap<String, AoiAggregate> {
        self.aggregates
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    AoiAggregate {
                        text: s.text.clone(),
                        is_vocabulary: s.is_vocabulary,
                        count: s.count,
                        total_dwell_ms: s.dwell_ms,
                        mean_confidence: if s.count == 0 {
                            0.0
                        } else {
                            s.confidence_sum / s.count as f64
                        },
                        quality: QualityHistogram {
                            excellent: s.hist[0],
                            good: s.hist[1],
                            fair: s.hist[2],
                            poor: s.hist[3],
                        },
                    },
                )
            })
            .collect()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn push(&mut self, hit: AoiHit) {
        let agg = self
            .aggregates
            .entry(hit.aoi_id.clone())
            .or_insert_with(|| AggState {
                text: hit.aoi_text.clone(),
                is_vocabulary: hit.is_vocabulary,
                count: 0,
                dwell_ms: 0,
                confidence_sum: 0.0,
                hist: [0; 4],
            });
        agg.count += 1;
        agg.confidence_sum += hit.confidence;
        agg.hist[hit.hit_quality.slot()] += 1;
        self.hits.push(hit);
    }
}
