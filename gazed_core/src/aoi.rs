//! Areas of Interest and the per-session hit index.
//!
//! Lookup contract: vocabulary AOIs are checked before content and custom
//! ones; within a tier higher priority wins and ties go to the most recent
//! insertion. Rectangles are half-open on their upper edges so adjacent
//! AOIs never double-hit.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AoiKind {
    Vocab,
    Content,
    Custom,
}

impl AoiKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AoiKind::Vocab => "vocab",
            AoiKind::Content => "content",
            AoiKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aoi {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub kind: AoiKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Aoi {
    /// Half-open on the upper edges: x_min <= x < x_max, y_min <= y < y_max.
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x < self.x + self.w && y >= self.y && y < self.y + self.h
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    pub fn is_vocab(&self) -> bool {
        self.kind == AoiKind::Vocab
    }
}

#[derive(Debug, Clone)]
struct Entry {
    insert_seq: u64,
    aoi: Aoi,
}

/// Per-session AOI store. AOIs are never mutated after being added; a
/// duplicate id replaces (remove + re-add) and takes the new insertion
/// order. Mutations are serialized against lookups by the owner (single
/// writer, many readers).
#[derive(Debug, Default)]
pub struct AoiIndex {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl AoiIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an AOI; a duplicate id replaces the existing one.
    pub fn add(&mut self, aoi: Aoi) {
        self.entries.retain(|e| e.aoi.id != aoi.id);
        self.next_seq += 1;
        self.entries.push(Entry {
            insert_seq: self.next_seq,
            aoi,
        });
    }

    pub fn remove(&mut self, id: &str) -> Option<Aoi> {
        let pos = self.entries.iter().position(|e| e.aoi.id == id)?;
        Some(self.entries.remove(pos).aoi)
    }

    pub fn get(&self, id: &str) -> Option<&Aoi> {
        self.entries.iter().find(|e| e.aoi.id == id).map(|e| &e.aoi)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All AOIs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Aoi> {
        self.entries.iter().map(|e| &e.aoi)
    }

    /// Find the AOI hit by a screen point, honoring the tier/priority
    /// contract.
    pub fn find_hit(&self, x: f64, y: f64) -> Option<&Aoi> {
        self.best_in_tier(x, y, true)
            .or_else(|| self.best_in_tier(x, y, false))
    }

    fn best_in_tier(&self, x: f64, y: f64, vocab: bool) -> Option<&Aoi> {
        self.entries
            .iter()
            .filter(|e| e.aoi.is_vocab() == vocab && e.aoi.contains(x, y))
            .max_by_key(|e| (e.aoi.priority, e.insert_seq))
            .map(|e| &e.aoi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn aoi(id: &str, x: f64, y: f64, w: f64, h: f64, kind: AoiKind, priority: i32) -> Aoi {
        Aoi {
            id: id.to_string(),
            x,
            y,
            w,
            h,
            kind,
            priority,
            text: id.to_string(),
            difficulty: None,
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn vocab_wins_over_overlapping_content() {
        let mut idx = AoiIndex::new();
        idx.add(aoi("para", 0.0, 0.0, 600.0, 300.0, AoiKind::Content, 100));
        idx.add(aoi("word", 100.0, 100.0, 80.0, 20.0, AoiKind::Vocab, 0));
        let hit = idx.find_hit(120.0, 110.0).unwrap();
        assert_eq!(hit.id, "word");
        // Outside the word but inside the paragraph.
        assert_eq!(idx.find_hit(400.0, 200.0).unwrap().id, "para");
    }

    #[test]
    fn priority_then_recency_break_ties_within_a_tier() {
        let mut idx = AoiIndex::new();
        idx.add(aoi("low", 0.0, 0.0, 100.0, 100.0, AoiKind::Content, 1));
        idx.add(aoi("high", 0.0, 0.0, 100.0, 100.0, AoiKind::Content, 5));
        idx.add(aoi("late", 0.0, 0.0, 100.0, 100.0, AoiKind::Content, 5));
        assert_eq!(idx.find_hit(50.0, 50.0).unwrap().id, "late");
    }

    #[rstest]
    #[case(100.0, 50.0, true)] // left/top edges inclusive
    #[case(199.999, 69.999, true)]
    #[case(200.0, 50.0, false)] // right edge exclusive
    #[case(100.0, 70.0, false)] // bottom edge exclusive
    fn rectangle_is_half_open(#[case] x: f64, #[case] y: f64, #[case] inside: bool) {
        let a = aoi("w", 100.0, 50.0, 100.0, 20.0, AoiKind::Vocab, 0);
        assert_eq!(a.contains(x, y), inside);
    }

    #[test]
    fn adjacent_aois_never_double_hit() {
        let mut idx = AoiIndex::new();
        idx.add(aoi("a", 0.0, 0.0, 100.0, 20.0, AoiKind::Vocab, 0));
        idx.add(aoi("b", 100.0, 0.0, 100.0, 20.0, AoiKind::Vocab, 0));
        assert_eq!(idx.find_hit(100.0, 10.0).unwrap().id, "b");
    }

    #[test]
    fn duplicate_id_replaces() {
        let mut idx = AoiIndex::new();
        idx.add(aoi("w", 0.0, 0.0, 50.0, 20.0, AoiKind::Vocab, 0));
        idx.add(aoi("w", 500.0, 0.0, 50.0, 20.0, AoiKind::Vocab, 0));
        assert_eq!(idx.len(), 1);
        assert!(idx.find_hit(10.0, 10.0).is_none());
        assert_eq!(idx.find_hit(510.0, 10.0).unwrap().id, "w");
    }
}
