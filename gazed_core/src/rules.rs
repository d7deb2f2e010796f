//! Adaptive-feedback rule engine.
//!
//! A fixed table evaluated in order on each finalized fixation; the first
//! matching enabled rule wins, so at most one command per event. Rate
//! limiting is per session in session time: at most one command per
//! `rate_limit_ms`, suppressed commands are silent.
use crate::aoi::{Aoi, AoiKind};
use crate::detector::Fixation;
use gazed_config::FeedbackCfg;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    VocabCard,
    GrammarPopup,
    Hint,
}

impl FeedbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackKind::VocabCard => "vocab_card",
            FeedbackKind::GrammarPopup => "grammar_popup",
            FeedbackKind::Hint => "hint",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackCommand {
    pub kind: FeedbackKind,
    pub payload: serde_json::Value,
    /// Session-relative ms of the triggering event's end.
    pub ts_ms: u64,
    pub session_id: String,
}

#[derive(Debug)]
pub struct RuleEngine {
    cfg: FeedbackCfg,
    last_emit_ms: Option<u64>,
    emitted: u64,
    suppressed: u64,
}

impl RuleEngine {
    pub fn new(cfg: FeedbackCfg) -> Self {
        Self {
            cfg,
            last_emit_ms: None,
            emitted: 0,
            suppressed: 0,
        }
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Evaluate the rule table against one finalized fixation.
    pub fn on_fixation(
        &mut self,
        fx: &Fixation,
        aoi: Option<&Aoi>,
        session_id: &str,
    ) -> Option<FeedbackCommand> {
        let now_ms = fx.end_ts_ns / 1_000_000;
        let (kind, payload) = self.match_rule(fx, aoi)?;

        if let Some(last) = self.last_emit_ms {
            if now_ms.saturating_sub(last) < self.cfg.rate_limit_ms {
                self.suppressed += 1;
                tracing::trace!(kind = kind.as_str(), "feedback suppressed by rate limit");
                return None;
            }
        }
        self.last_emit_ms = Some(now_ms);
        self.emitted += 1;
        tracing::info!(
            kind = kind.as_str(),
            duration_ms = fx.duration_ms,
            aoi = aoi.map(|a| a.id.as_str()).unwrap_or(""),
            "feedback command"
        );
        Some(FeedbackCommand {
            kind,
            payload,
            ts_ms: now_ms,
            session_id: session_id.to_string(),
        })
    }

    /// Table order decides ties: vocabulary, grammar, then the general hint.
    fn match_rule(
        &self,
        fx: &Fixation,
        aoi: Option<&Aoi>,
    ) -> Option<(FeedbackKind, serde_json::Value)> {
        if self.cfg.enable_vocabulary
            && fx.duration_ms >= self.cfg.vocab_threshold_ms
            && aoi.is_some_and(|a| a.kind == AoiKind::Vocab)
        {
            let a = aoi?;
            return Some((
                FeedbackKind::VocabCard,
                json!({
                    "aoi_id": a.id,
                    "word": a.text,
                    "difficulty": a.difficulty,
                    "show_definition": true,
                    "show_pronunciation": true,
                }),
            ));
        }
        if self.cfg.enable_grammar
            && fx.duration_ms >= self.cfg.grammar_threshold_ms
            && aoi.is_some_and(|a| a.kind == AoiKind::Content)
        {
            let a = aoi?;
            return Some((
                FeedbackKind::GrammarPopup,
                json!({
                    "aoi_id": a.id,
                    "show_grammar_help": true,
                    "show_translation": true,
                }),
            ));
        }
        if self.cfg.enable_hints && fx.duration_ms >= self.cfg.hint_threshold_ms {
            return Some((
                FeedbackKind::Hint,
                json!({
                    "message": "Need help with this section?",
                    "aoi_id": aoi.map(|a| a.id.clone()),
                }),
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn cfg() -> FeedbackCfg {
        FeedbackCfg::default()
    }

    fn aoi(id: &str, kind: AoiKind) -> Aoi {
        Aoi {
            id: id.to_string(),
            x: 0.0,
            y: 0.0,
            w: 100.0,
            h: 20.0,
            kind,
            priority: 0,
            text: id.to_string(),
            difficulty: None,
            attributes: Map::new(),
        }
    }

    fn fixation_ending_at(end_ms: u64, duration_ms: u64) -> Fixation {
        Fixation {
            aoi_id: None,
            start_ts_ns: (end_ms - duration_ms) * 1_000_000,
            end_ts_ns: end_ms * 1_000_000,
            duration_ms,
            centroid_x: 50.0,
            centroid_y: 10.0,
            mean_confidence: 0.9,
            sample_count: 100,
        }
    }

    #[test]
    fn vocabulary_rule_fires_on_long_vocab_fixation() {
        let mut eng = RuleEngine::new(cfg());
        let word = aoi("biodiversity", AoiKind::Vocab);
        let cmd = eng
            .on_fixation(&fixation_ending_at(2000, 1600), Some(&word), "s1")
            .expect("command expected");
        assert_eq!(cmd.kind, FeedbackKind::VocabCard);
        assert_eq!(cmd.payload["aoi_id"], "biodiversity");
        assert_eq!(eng.emitted(), 1);
    }

    #[test]
    fn short_fixations_fire_nothing() {
        let mut eng = RuleEngine::new(cfg());
        let word = aoi("w", AoiKind::Vocab);
        assert!(eng
            .on_fixation(&fixation_ending_at(2000, 900), Some(&word), "s1")
            .is_none());
    }

    #[test]
    fn grammar_rule_needs_a_sentence_aoi() {
        let mut eng = RuleEngine::new(cfg());
        let sentence = aoi("s", AoiKind::Content);
        let cmd = eng
            .on_fixation(&fixation_ending_at(3000, 2200), Some(&sentence), "s1")
            .unwrap();
        assert_eq!(cmd.kind, FeedbackKind::GrammarPopup);
    }

    #[test]
    fn hint_fires_off_aoi_after_three_seconds() {
        let mut eng = RuleEngine::new(cfg());
        let cmd = eng
            .on_fixation(&fixation_ending_at(4000, 3200), None, "s1")
            .unwrap();
        assert_eq!(cmd.kind, FeedbackKind::Hint);
    }

    #[test]
    fn table_order_breaks_ties() {
        // 3.5 s on a vocab AOI satisfies all three rules; vocabulary wins.
        let mut eng = RuleEngine::new(cfg());
        let word = aoi("w", AoiKind::Vocab);
        let cmd = eng
            .on_fixation(&fixation_ending_at(4000, 3500), Some(&word), "s1")
            .unwrap();
        assert_eq!(cmd.kind, FeedbackKind::VocabCard);
    }

    #[test]
    fn rate_limit_allows_one_command_per_five_seconds() {
        let mut eng = RuleEngine::new(cfg());
        let a = aoi("a", AoiKind::Vocab);
        let b = aoi("b", AoiKind::Vocab);

        assert!(eng
            .on_fixation(&fixation_ending_at(1600, 1600), Some(&a), "s1")
            .is_some());
        // 2 s later: suppressed.
        assert!(eng
            .on_fixation(&fixation_ending_at(3600, 1600), Some(&b), "s1")
            .is_none());
        // 5.5 s after the first: allowed again.
        assert!(eng
            .on_fixation(&fixation_ending_at(7100, 1600), Some(&b), "s1")
            .is_some());
        assert_eq!(eng.emitted(), 2);
        assert_eq!(eng.suppressed(), 1);
    }

    #[test]
    fn disabled_rules_fall_through_to_later_rows() {
        let mut c = cfg();
        c.enable_vocabulary = false;
        let mut eng = RuleEngine::new(c);
        let word = aoi("w", AoiKind::Vocab);
        // Vocabulary disabled: a 3.2 s vocab fixation reaches the hint row.
        let cmd = eng
            .on_fixation(&fixation_ending_at(4000, 3200), Some(&word), "s1")
            .unwrap();
        assert_eq!(cmd.kind, FeedbackKind::Hint);
    }

    #[test]
    fn non_matching_events_do_not_arm_the_rate_limit() {
        let mut eng = RuleEngine::new(cfg());
        let word = aoi("w", AoiKind::Vocab);
        assert!(eng
            .on_fixation(&fixation_ending_at(500, 400), Some(&word), "s1")
            .is_none());
        assert!(eng
            .on_fixation(&fixation_ending_at(2100, 1600), Some(&word), "s1")
            .is_some());
    }
}
