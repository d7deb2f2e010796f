//! Test and helper sample sources.
use gazed_traits::{RawSample, SampleSource};
use std::time::Duration;

/// Deterministic reading-pattern generator: the gaze dwells on successive
/// "word" positions along text lines, with a small phase-stepped wobble
/// standing in for tracker noise. No RNG dependency; the same step count
/// always yields the same sample.
pub struct MockSource {
    step: u64,
    origin_x: f64,
    origin_y: f64,
    word_step_px: f64,
    line_height_px: f64,
    words_per_line: u64,
    /// Samples spent dwelling on each word before moving on.
    dwell_samples: u64,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            step: 0,
            origin_x: 320.0,
            origin_y: 240.0,
            word_step_px: 48.0,
            line_height_px: 36.0,
            words_per_line: 8,
            dwell_samples: 30,
        }
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for MockSource {
    fn next(
        &mut self,
        _timeout: Duration,
    ) -> Result<RawSample, Box<dyn std::error::Error + Send + Sync>> {
        let word = self.step / self.dwell_samples;
        let col = word % self.words_per_line;
        let line = (word / self.words_per_line) % 6;

        // Small deterministic wobble around the dwell point.
        let phase = self.step as f64 * 0.7;
        let jitter_x = phase.sin() * 2.0;
        let jitter_y = (phase * 1.3).cos() * 1.5;

        let x = self.origin_x + col as f64 * self.word_step_px + jitter_x;
        let y = self.origin_y + line as f64 * self.line_height_px + jitter_y;
        let confidence = 0.88 + 0.08 * (phase * 0.31).sin();

        self.step += 1;
        let mut raw = RawSample::at(x, y, confidence);
        raw.pupil_left_mm = 3.4 + 0.2 * (phase * 0.11).sin();
        raw.pupil_right_mm = 3.5 + 0.2 * (phase * 0.13).sin();
        Ok(raw)
    }
}

/// A source that always errors; used for push-driven sessions where every
/// sample arrives over the session socket.
pub struct NoopSource;

impl SampleSource for NoopSource {
    fn next(
        &mut self,
        _timeout: Duration,
    ) -> Result<RawSample, Box<dyn std::error::Error + Send + Sync>> {
        Err(Box::new(std::io::Error::other("noop source")))
    }
}
