//! Monotonic progress counters producing unlock events.
//!
//! Progress never decreases and an unlock never reverts; unlock events are
//! emitted exactly once and appended to a bounded recent list.
use serde::Serialize;
use std::collections::VecDeque;

const RECENT_UNLOCKS: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct Achievement {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub target: f64,
    pub current: f64,
    pub unlocked: bool,
    pub unlocked_at_ms: Option<u64>,
    pub points: u32,
}

impl Achievement {
    fn new(id: &str, title: &str, description: &str, category: &str, target: f64, points: u32) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            target,
            current: 0.0,
            unlocked: false,
            unlocked_at_ms: None,
            points,
        }
    }

    pub fn progress_pct(&self) -> f64 {
        if self.target <= 0.0 {
            return if self.unlocked { 100.0 } else { 0.0 };
        }
        (self.current / self.target * 100.0).min(100.0)
    }
}

#[derive(Debug)]
pub struct AchievementBook {
    all: Vec<Achievement>,
    recent_unlocks: VecDeque<Achievement>,
}

impl Default for AchievementBook {
    fn default() -> Self {
        Self::standard()
    }
}

impl AchievementBook {
    /// The standard ladder: vocabulary tiers, focus tiers, reading speed.
    pub fn standard() -> Self {
        let all = vec![
            Achievement::new("first_word", "First Discovery", "Discover your first vocabulary word", "vocabulary", 1.0, 5),
            Achievement::new("vocab_explorer", "Word Explorer", "Discover 5 vocabulary words", "vocabulary", 5.0, 25),
            Achievement::new("vocab_master", "Vocabulary Master", "Discover 10 vocabulary words", "vocabulary", 10.0, 50),
            Achievement::new("vocab_genius", "Word Genius", "Discover 20 vocabulary words", "vocabulary", 20.0, 100),
            Achievement::new("focused_reader", "Focused Reader", "Maintain focus for 2 minutes", "focus", 120.0, 12),
            Achievement::new("deep_focus", "Deep Focus", "Maintain focus for 5 minutes", "focus", 300.0, 30),
            Achievement::new("laser_focus", "Laser Focus", "Maintain focus for 10 minutes", "focus", 600.0, 60),
            Achievement::new("speed_reader", "Speed Reader", "Read 100 words per minute", "reading", 100.0, 25),
        ];
        Self {
            all,
            recent_unlocks: VecDeque::new(),
        }
    }

    pub fn all(&self) -> &[Achievement] {
        &self.all
    }

    pub fn recent_unlocks(&self) -> impl Iterator<Item = &Achievement> {
        self.recent_unlocks.iter()
    }

    pub fn unlocked_count(&self) -> usize {
        self.all.iter().filter(|a| a.unlocked).count()
    }

    pub fn total_points(&self) -> u32 {
        self.all
            .iter()
            .filter(|a| a.unlocked)
            .map(|a| a.points)
            .sum()
    }

    pub fn update_vocabulary(&mut self, discovered: usize, now_ms: u64) -> Vec<Achievement> {
        self.advance("vocabulary", discovered as f64, now_ms)
    }

    pub fn update_focus(&mut self, session_seconds: f64, now_ms: u64) -> Vec<Achievement> {
        self.advance("focus", session_seconds, now_ms)
    }

    pub fn update_reading(&mut self, words_per_minute: f64, now_ms: u64) -> Vec<Achievement> {
        self.advance("reading", words_per_minute, now_ms)
    }

    /// Raise the counters of one category. Returns achievements that
    /// unlocked on this call, each emitted exactly once.
    fn advance(&mut self, category: &str, value: f64, now_ms: u64) -> Vec<Achievement> {
        let mut newly = Vec::new();
        for a in self.all.iter_mut().filter(|a| a.category == category) {
            a.current = a.current.max(value);
            if !a.unlocked && a.current >= a.target {
                a.unlocked = true;
                a.unlocked_at_ms = Some(now_ms);
                tracing::info!(id = %a.id, title = %a.title, "achievement unlocked");
                newly.push(a.clone());
            }
        }
        for a in &newly {
            self.recent_unlocks.push_back(a.clone());
            if self.recent_unlocks.len() > RECENT_UNLOCKS {
                self.recent_unlocks.pop_front();
            }
        }
        newly
    }
}
