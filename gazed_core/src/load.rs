//! Rolling cognitive-load estimate from gaze dispersion and velocity.
//!
//! score = 0.6 * dispersion_norm + 0.4 * velocity_norm, each component
//! clamped to [0, 100]. Dispersion is averaged over both axes and
//! normalized by /5; velocity (px/s) is normalized by /100.
use serde::Serialize;
use std::collections::VecDeque;

/// Samples considered per estimate.
const WINDOW: usize = 10;
/// Bounded score history published to subscribers.
const HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
}

impl LoadLevel {
    fn of(score: f64) -> Self {
        if score < 30.0 {
            LoadLevel::Low
        } else if score < 70.0 {
            LoadLevel::Medium
        } else {
            LoadLevel::High
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            LoadLevel::Low => "green",
            LoadLevel::Medium => "orange",
            LoadLevel::High => "red",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CognitiveLoad {
    pub score: f64,
    pub level: LoadLevel,
    pub color: &'static str,
    pub ts_ms: u64,
    pub gaze_dispersion: f64,
    pub avg_velocity: f64,
    pub sample_count: usize,
}

#[derive(Debug, Default)]
pub struct LoadEstimator {
    window: VecDeque<(u64, f64, f64)>, // (ts_ns, x, y)
    current: Option<CognitiveLoad>,
    history: VecDeque<CognitiveLoad>,
}

impl LoadEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one calibrated sample; recomputes once the window is full.
    pub fn push(&mut self, ts_ns: u64, x: f64, y: f64) {
        self.window.push_back((ts_ns, x, y));
        if self.window.len() > WINDOW {
            self.window.pop_front();
        }
        if self.window.len() >= WINDOW / 2 {
            self.recompute(ts_ns / 1_000_000);
        }
    }

    pub fn current(&self) -> Option<&CognitiveLoad> {
        self.current.as_ref()
    }

    pub fn history(&self) -> impl Iterator<Item = &CognitiveLoad> {
        self.history.iter()
    }

    pub fn recent_history(&self, n: usize) -> Vec<CognitiveLoad> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    fn recompute(&mut self, ts_ms: u64) {
        let pts: Vec<_> = self.window.iter().copied().collect();
        let xs = pts.iter().map(|p| p.1);
        let ys = pts.iter().map(|p| p.2);
        let x_range = xs.clone().fold(f64::NEG_INFINITY, f64::max)
            - xs.fold(f64::INFINITY, f64::min);
        let y_range = ys.clone().fold(f64::NEG_INFINITY, f64::max)
            - ys.fold(f64::INFINITY, f64::min);
        let dispersion = (x_range + y_range) / 2.0;

        let mut vel_sum = 0.0;
        let mut vel_n = 0usize;
        for w in pts.windows(2) {
            let dt_s = (w[1].0.saturating_sub(w[0].0)) as f64 / 1e9;
            if dt_s > 0.0 {
                let d = ((w[1].1 - w[0].1).powi(2) + (w[1].2 - w[0].2).powi(2)).sqrt();
                vel_sum += d / dt_s;
                vel_n += 1;
            }
        }
        let avg_velocity = if vel_n == 0 { 0.0 } else { vel_sum / vel_n as f64 };

        let dispersion_norm = (dispersion / 5.0).clamp(0.0, 100.0);
        let velocity_norm = (avg_velocity / 100.0).clamp(0.0, 100.0);
        let score = 0.6 * dispersion_norm + 0.4 * velocity_norm;
        let level = LoadLevel::of(score);

        let load = CognitiveLoad {
            score,
            level,
            color: level.color(),
            ts_ms,
            gaze_dispersion: dispersion,
            avg_velocity,
            sample_count: pts.len(),
        };
        self.history.push_back(load.clone());
        if self.history.len() > HISTORY {
            self.history.pop_front();
        }
        self.current = Some(load);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn steady_gaze_scores_low() {
        let mut est = LoadEstimator::new();
        for i in 0..WINDOW as u64 {
            est.push(i * 10 * MS, 500.0, 300.0);
        }
        let load = est.current().unwrap();
        assert_eq!(load.score, 0.0);
        assert_eq!(load.level, LoadLevel::Low);
        assert_eq!(load.color, "green");
    }

    #[test]
    fn erratic_gaze_scores_high() {
        let mut est = LoadEstimator::new();
        for i in 0..WINDOW as u64 {
            // 800 px jumps every 10 ms.
            let x = if i % 2 == 0 { 100.0 } else { 900.0 };
            est.push(i * 10 * MS, x, 300.0 + i as f64 * 40.0);
        }
        let load = est.current().unwrap();
        assert_eq!(load.level, LoadLevel::High);
        assert!(load.score >= 70.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut est = LoadEstimator::new();
        for i in 0..200u64 {
            est.push(i * 10 * MS, (i % 7) as f64 * 30.0, 300.0);
        }
        assert!(est.history().count() <= HISTORY);
        assert_eq!(est.recent_history(10).len(), 10);
    }
}
