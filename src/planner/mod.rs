//! Transition planning: how to get from one track to the next.
//!
//! The rule engine picks the transition type from the pair's composite score
//! and tempo gap, sizes the blend from the phase's preferred range, and
//! places the cut on a structural boundary of the outgoing track.

pub mod automation;
pub mod cuts;
pub mod strategy;

use serde::{Deserialize, Serialize};

use crate::analysis::{SectionLabel, TrackAnalysis};
use crate::compatibility::CompatibilityScore;
use crate::curve::{SetCurvePolicy, SetPhase};
use automation::{StemAutomation, VOCAL_CLASH_INTENSITY};

pub const STEM_BLEND_MIN_SCORE: u8 = 85;
pub const STEM_BLEND_MAX_BPM_DIFF: f64 = 3.0;
pub const CROSSFADE_MIN_SCORE: u8 = 60;
pub const CROSSFADE_MAX_BPM_DIFF: f64 = 5.0;
pub const CROSSFADE_BARS: (u32, u32) = (8, 16);
/// Past this tempo gap nothing can be blended.
pub const HARD_CUT_BPM_DIFF: f64 = 6.0;
pub const DOUBLE_DROP_MAX_BPM_DIFF: f64 = 1.0;
/// Length of a reverb or delay tail laid over the incoming track.
pub const TAIL_BARS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionType {
    StemBlend,
    Crossfade,
    HardCut,
    FilterSweep,
    EchoOut,
    DoubleDrop,
}

impl TransitionType {
    /// Creative types are only ever offered as alternates.
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::StemBlend | Self::Crossfade | Self::HardCut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StemBlend => "STEM_BLEND",
            Self::Crossfade => "CROSSFADE",
            Self::HardCut => "HARD_CUT",
            Self::FilterSweep => "FILTER_SWEEP",
            Self::EchoOut => "ECHO_OUT",
            Self::DoubleDrop => "DOUBLE_DROP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::StemBlend,
            Self::Crossfade,
            Self::HardCut,
            Self::FilterSweep,
            Self::EchoOut,
            Self::DoubleDrop,
        ]
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(raw))
    }
}

impl std::fmt::Display for TransitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailEffect {
    Reverb,
    Delay,
}

/// Where each track enters and leaves the transition, in that track's own
/// timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CutPoints {
    /// A's solo playback ends here and the transition begins.
    pub track_a_mix_start_ms: u64,
    /// A is fully gone; always a structural boundary of A.
    pub track_a_cut_ms: u64,
    /// First moment of B heard in the transition.
    pub track_b_mix_start_ms: u64,
    /// B's solo playback resumes here.
    pub track_b_start_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionPlan {
    pub transition_type: TransitionType,
    #[serde(default)]
    pub tail: Option<TailEffect>,
    pub duration_bars: u32,
    /// Length of the rendered transition segment.
    pub duration_ms: u64,
    pub cut_points: CutPoints,
    #[serde(default)]
    pub automation: Option<StemAutomation>,
    #[serde(default)]
    pub alternates: Vec<TransitionType>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Everything the planner knows about one adjacent pair.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub from: &'a TrackAnalysis,
    pub to: &'a TrackAnalysis,
    pub score: &'a CompatibilityScore,
    /// Phase of the outgoing track's slot.
    pub from_phase: SetPhase,
    /// Phase of the incoming track's slot; the transition belongs to it.
    pub phase: SetPhase,
    /// Index of this transition in the set (0 = first pair).
    pub position: usize,
    /// Where A's solo playback starts; the blend may not begin earlier.
    pub from_entry_ms: u64,
}

/// Primary transition type from the decision table.
pub fn primary_type(score: &CompatibilityScore) -> TransitionType {
    if score.score >= STEM_BLEND_MIN_SCORE && score.bpm_difference <= STEM_BLEND_MAX_BPM_DIFF {
        TransitionType::StemBlend
    } else if score.score >= CROSSFADE_MIN_SCORE && score.bpm_difference <= CROSSFADE_MAX_BPM_DIFF {
        TransitionType::Crossfade
    } else {
        TransitionType::HardCut
    }
}

/// Tail for a hard cut when the outgoing track exits dramatically.
pub fn dramatic_tail(from_phase: SetPhase, to_phase: SetPhase) -> Option<TailEffect> {
    if from_phase == SetPhase::Peak && to_phase != SetPhase::Peak {
        Some(TailEffect::Delay)
    } else if from_phase != to_phase && to_phase == SetPhase::Cooldown {
        Some(TailEffect::Reverb)
    } else {
        None
    }
}

/// Where B enters the transition.
pub fn incoming_entry_ms(to: &TrackAnalysis) -> u64 {
    to.best_mix_in_ms
        .or(to.intro_start_ms)
        .unwrap_or(0)
        .min(to.duration_ms)
}

/// Start of the outro from the analysis fields or, failing that, the
/// structure.
pub fn outro_start_ms(track: &TrackAnalysis) -> Option<u64> {
    track.outro_start_ms.or_else(|| {
        track
            .structure
            .iter()
            .find(|s| s.label == SectionLabel::Outro)
            .map(|s| s.start_ms)
    })
}

/// The deterministic rule engine.
#[derive(Debug, Clone, Default)]
pub struct TransitionPlanner {
    policy: SetCurvePolicy,
}

impl TransitionPlanner {
    pub fn new(policy: SetCurvePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SetCurvePolicy {
        &self.policy
    }

    pub fn plan(&self, ctx: &PlanContext<'_>) -> TransitionPlan {
        let primary = primary_type(ctx.score);
        let mut warnings = Vec::new();

        let blended = match primary {
            TransitionType::StemBlend | TransitionType::Crossfade => {
                self.plan_blend(ctx, primary, &mut warnings)
            }
            _ => None,
        };
        let mut plan = blended.unwrap_or_else(|| self.plan_hard_cut(ctx, &mut warnings));
        plan.alternates = self.alternates(ctx, plan.transition_type);
        plan.warnings = warnings;

        log::debug!(
            "Planned {} -> {} as {} ({} bars, cut at {} ms)",
            ctx.from.track_id,
            ctx.to.track_id,
            plan.transition_type,
            plan.duration_bars,
            plan.cut_points.track_a_cut_ms
        );
        plan
    }

    /// Blend length range and the length we aim for within it.
    fn blend_bars(&self, ctx: &PlanContext<'_>, kind: TransitionType) -> (u32, u32) {
        let ((min, max), floor_score, span) = match kind {
            TransitionType::StemBlend => (
                self.policy.duration_range(ctx.phase),
                STEM_BLEND_MIN_SCORE,
                f64::from(100 - STEM_BLEND_MIN_SCORE),
            ),
            _ => (
                CROSSFADE_BARS,
                CROSSFADE_MIN_SCORE,
                f64::from(STEM_BLEND_MIN_SCORE - CROSSFADE_MIN_SCORE),
            ),
        };
        // Better pairs get the longer end of the range.
        let t = (f64::from(ctx.score.score.saturating_sub(floor_score)) / span).clamp(0.0, 1.0);
        let desired = f64::from(min) + f64::from(max - min) * t;
        let desired = cuts::floor_to_phrase(desired.floor() as u32).max(min);
        (min, desired)
    }

    fn plan_blend(
        &self,
        ctx: &PlanContext<'_>,
        kind: TransitionType,
        warnings: &mut Vec<String>,
    ) -> Option<TransitionPlan> {
        let (a, b) = (ctx.from, ctx.to);
        let (min_bars, mut desired) = self.blend_bars(ctx, kind);

        // Both tracks' blend windows and B's remaining length cap the blend.
        if let Some(max_out) = a.max_blend_out_ms {
            desired = desired.min(cuts::phrase_bars_within(max_out, a.bpm));
        }
        let b_entry = incoming_entry_ms(b);
        let mut b_room = b.duration_ms - b_entry;
        if let Some(max_in) = b.max_blend_in_ms {
            b_room = b_room.min(max_in);
        }
        desired = desired.min(cuts::phrase_bars_within(b_room, b.bpm));
        if desired == 0 {
            warnings.push(format!(
                "no phrase-aligned blend window between {} and {}; using a hard cut",
                a.track_id, b.track_id
            ));
            return None;
        }
        let min_bars = min_bars.min(desired);

        let boundaries = cuts::boundaries(a);
        let anchor = a
            .best_mix_out_ms
            .unwrap_or_else(|| a.duration_ms.saturating_sub(cuts::bars_to_ms(desired, a.bpm)))
            .max(ctx.from_entry_ms);

        let Some(cut) = cuts::choose_blend_cut(&boundaries, anchor, min_bars, desired, a.bpm) else {
            warnings.push(format!(
                "no structural boundary leaves room for a blend out of {}; using a hard cut",
                a.track_id
            ));
            return None;
        };
        if cut.shortened {
            warnings.push(format!(
                "{} shortened to {} bars to land on a boundary of {}",
                kind, cut.bars, a.track_id
            ));
        }

        // Phrase rounding can put the start a millisecond before A entered.
        let a_mix_start = cut
            .cut_ms
            .saturating_sub(cuts::bars_to_ms(cut.bars, a.bpm))
            .max(ctx.from_entry_ms)
            .min(cut.cut_ms);
        let a_blend_ms = cut.cut_ms - a_mix_start;
        let b_blend_ms = cuts::bars_to_ms(cut.bars, b.bpm).min(b.duration_ms - b_entry);
        let automation = (kind == TransitionType::StemBlend).then(|| {
            let clash = a.vocal_intensity.unwrap_or(0.0) >= VOCAL_CLASH_INTENSITY
                && b.vocal_intensity.unwrap_or(0.0) >= VOCAL_CLASH_INTENSITY;
            StemAutomation::stem_blend(cut.bars, clash)
        });

        Some(TransitionPlan {
            transition_type: kind,
            tail: None,
            duration_bars: cut.bars,
            duration_ms: a_blend_ms,
            cut_points: CutPoints {
                track_a_mix_start_ms: a_mix_start,
                track_a_cut_ms: cut.cut_ms,
                track_b_mix_start_ms: b_entry,
                track_b_start_ms: b_entry + b_blend_ms,
            },
            automation,
            alternates: Vec::new(),
            warnings: Vec::new(),
        })
    }

    fn plan_hard_cut(&self, ctx: &PlanContext<'_>, warnings: &mut Vec<String>) -> TransitionPlan {
        let (a, b) = (ctx.from, ctx.to);
        let boundaries = cuts::boundaries(a);
        let preferred = a
            .best_mix_out_ms
            .or_else(|| outro_start_ms(a))
            .unwrap_or(a.duration_ms);
        let cut_ms = cuts::choose_hard_cut(&boundaries, preferred, ctx.from_entry_ms)
            .unwrap_or_else(|| {
                warnings.push(format!("no boundary left in {}; cutting at its end", a.track_id));
                a.duration_ms
            });

        let tail = dramatic_tail(ctx.from_phase, ctx.phase);
        let b_entry = incoming_entry_ms(b);
        let tail_ms = match tail {
            Some(_) => cuts::bars_to_ms(TAIL_BARS, b.bpm).min(b.duration_ms - b_entry),
            None => 0,
        };

        TransitionPlan {
            transition_type: TransitionType::HardCut,
            tail,
            duration_bars: 0,
            duration_ms: tail_ms,
            cut_points: CutPoints {
                track_a_mix_start_ms: cut_ms,
                track_a_cut_ms: cut_ms,
                track_b_mix_start_ms: b_entry,
                track_b_start_ms: b_entry + tail_ms,
            },
            automation: None,
            alternates: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Creative alternates the phase welcomes and the pair can support.
    pub fn alternates(
        &self,
        ctx: &PlanContext<'_>,
        primary: TransitionType,
    ) -> Vec<TransitionType> {
        [
            TransitionType::FilterSweep,
            TransitionType::EchoOut,
            TransitionType::DoubleDrop,
        ]
        .into_iter()
        .filter(|&t| t != primary && self.policy.allows_style(ctx.phase, t))
        .filter(|&t| alternate_supported(ctx, t))
        .collect()
    }
}

/// Whether the pair meets an alternate's requirements.
pub fn alternate_supported(ctx: &PlanContext<'_>, alternate: TransitionType) -> bool {
    match alternate {
        TransitionType::FilterSweep => ctx.score.bpm_difference <= HARD_CUT_BPM_DIFF,
        TransitionType::EchoOut => true,
        TransitionType::DoubleDrop => {
            ctx.score.same_key
                && ctx.score.bpm_difference <= DOUBLE_DROP_MAX_BPM_DIFF
                && ctx.from.has_section(SectionLabel::Drop)
                && ctx.to.has_section(SectionLabel::Drop)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Section;
    use crate::camelot::CamelotKey;
    use crate::compatibility::Scorer;

    fn track(id: &str, bpm: f64, key: &str, energy: f64) -> TrackAnalysis {
        TrackAnalysis::new(id, bpm, CamelotKey::parse(key), energy)
    }

    fn with_drops(mut t: TrackAnalysis) -> TrackAnalysis {
        let bar = cuts::bar_ms(t.bpm);
        let at = |bars: f64| (bars * bar).round() as u64;
        t.duration_ms = at(160.0);
        t.structure = vec![
            Section { label: SectionLabel::Intro, start_ms: 0, end_ms: at(32.0) },
            Section { label: SectionLabel::Drop, start_ms: at(32.0), end_ms: at(96.0) },
            Section { label: SectionLabel::Breakdown, start_ms: at(96.0), end_ms: at(112.0) },
            Section { label: SectionLabel::Drop, start_ms: at(112.0), end_ms: at(128.0) },
            Section { label: SectionLabel::Outro, start_ms: at(128.0), end_ms: at(160.0) },
        ];
        t
    }

    fn ctx<'a>(
        a: &'a TrackAnalysis,
        b: &'a TrackAnalysis,
        score: &'a CompatibilityScore,
        from_phase: SetPhase,
        phase: SetPhase,
    ) -> PlanContext<'a> {
        PlanContext {
            from: a,
            to: b,
            score,
            from_phase,
            phase,
            position: 0,
            from_entry_ms: 0,
        }
    }

    fn score_with(score: u8, bpm_difference: f64) -> CompatibilityScore {
        CompatibilityScore {
            score,
            harmonic_score: 100.0,
            bpm_score: 100.0,
            energy_score: 100.0,
            compatibility_type: crate::compatibility::CompatibilityType::PerfectMatch,
            bpm_difference,
            energy_difference: 0.0,
            same_key: true,
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(primary_type(&score_with(85, 3.0)), TransitionType::StemBlend);
        assert_eq!(primary_type(&score_with(100, 0.0)), TransitionType::StemBlend);
        assert_eq!(primary_type(&score_with(84, 0.0)), TransitionType::Crossfade);
        assert_eq!(primary_type(&score_with(90, 4.0)), TransitionType::Crossfade);
        assert_eq!(primary_type(&score_with(60, 5.0)), TransitionType::Crossfade);
        assert_eq!(primary_type(&score_with(59, 0.0)), TransitionType::HardCut);
        assert_eq!(primary_type(&score_with(95, 5.5)), TransitionType::HardCut);
        assert_eq!(primary_type(&score_with(95, 7.0)), TransitionType::HardCut);
    }

    #[test]
    fn test_stem_blend_in_peak_uses_peak_range() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.7));
        let b = with_drops(track("b", 126.0, "8A", 0.8));
        let score = score_with(100, 0.0);
        let plan = planner.plan(&ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Peak));

        assert_eq!(plan.transition_type, TransitionType::StemBlend);
        assert_eq!(plan.duration_bars, 16);
        assert!(cuts::is_boundary(&a, plan.cut_points.track_a_cut_ms));
        let cp = plan.cut_points;
        assert_eq!(cp.track_a_cut_ms - cp.track_a_mix_start_ms, plan.duration_ms);
        assert!(plan.automation.as_ref().unwrap().validate().is_ok());
        assert!(plan.alternates.contains(&TransitionType::DoubleDrop));
        assert!(!plan.alternates.contains(&TransitionType::StemBlend));
    }

    #[test]
    fn test_stem_blend_duration_by_phase() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.5));
        let b = with_drops(track("b", 126.0, "8A", 0.5));
        let score = score_with(100, 0.0);
        for (phase, (min, max)) in [
            (SetPhase::Warmup, (32, 64)),
            (SetPhase::Build, (16, 32)),
            (SetPhase::Peak, (8, 16)),
            (SetPhase::Cooldown, (32, 64)),
        ] {
            let plan = planner.plan(&ctx(&a, &b, &score, phase, phase));
            assert_eq!(plan.transition_type, TransitionType::StemBlend);
            assert!(plan.duration_bars % 4 == 0);
            assert!(plan.duration_bars >= min);
            assert!(plan.duration_bars <= max, "{phase}: {}", plan.duration_bars);
        }
    }

    #[test]
    fn test_crossfade_range() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.5));
        let b = with_drops(track("b", 128.0, "9A", 0.5));
        for s in [60, 72, 84] {
            let score = score_with(s, 4.0);
            let plan = planner.plan(&ctx(&a, &b, &score, SetPhase::Build, SetPhase::Build));
            assert_eq!(plan.transition_type, TransitionType::Crossfade);
            assert!((8..=16).contains(&plan.duration_bars));
            assert_eq!(plan.duration_bars % 4, 0);
            assert!(plan.automation.is_none());
        }
    }

    #[test]
    fn test_hard_cut_tail() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.9));
        let b = with_drops(track("b", 140.0, "2B", 0.4));
        let score = score_with(30, 11.0);

        let plan = planner.plan(&ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Cooldown));
        assert_eq!(plan.transition_type, TransitionType::HardCut);
        assert_eq!(plan.duration_bars, 0);
        assert_eq!(plan.tail, Some(TailEffect::Delay));
        assert!(plan.duration_ms > 0);
        // cut at the start of the outro
        assert_eq!(plan.cut_points.track_a_cut_ms, a.structure[4].start_ms);

        let plan = planner.plan(&ctx(&a, &b, &score, SetPhase::Build, SetPhase::Cooldown));
        assert_eq!(plan.tail, Some(TailEffect::Reverb));

        let plan = planner.plan(&ctx(&a, &b, &score, SetPhase::Build, SetPhase::Build));
        assert_eq!(plan.tail, None);
        assert_eq!(plan.duration_ms, 0);
        assert_eq!(plan.cut_points.track_b_start_ms, plan.cut_points.track_b_mix_start_ms);
    }

    #[test]
    fn test_blend_degrades_without_room() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.5));
        let mut b = with_drops(track("b", 126.0, "8A", 0.5));
        b.max_blend_in_ms = Some(1_000);
        let score = score_with(100, 0.0);
        let plan = planner.plan(&ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Peak));
        assert_eq!(plan.transition_type, TransitionType::HardCut);
        assert!(!plan.warnings.is_empty());
    }

    #[test]
    fn test_blend_respects_entry_floor() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.5));
        let b = with_drops(track("b", 126.0, "8A", 0.5));
        let score = score_with(100, 0.0);
        let mut c = ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Peak);
        c.from_entry_ms = a.structure[4].start_ms;
        let plan = planner.plan(&c);
        assert!(plan.cut_points.track_a_mix_start_ms >= c.from_entry_ms);
    }

    #[test]
    fn test_blend_never_starts_before_entry() {
        let planner = TransitionPlanner::default();
        let entry = 60_000;
        // eight bars at 123 BPM round up to 15_610 ms, one more than the gap
        let mut a = track("a", 123.0, "8A", 0.5);
        a.best_mix_out_ms = Some(entry);
        a.outro_start_ms = Some(entry + 15_609);
        a.max_blend_out_ms = Some(16_000);
        let b = track("b", 123.0, "8A", 0.5);
        let score = score_with(100, 0.0);
        let mut c = ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Peak);
        c.from_entry_ms = entry;

        let plan = planner.plan(&c);
        assert_eq!(plan.transition_type, TransitionType::StemBlend);
        assert_eq!(plan.duration_bars, 8);
        let cp = plan.cut_points;
        assert_eq!(cp.track_a_cut_ms, entry + 15_609);
        assert_eq!(cp.track_a_mix_start_ms, entry);
        assert_eq!(plan.duration_ms, 15_609);
        assert!(strategy::validate_plan(planner.policy(), &c, &plan).is_ok());
    }

    #[test]
    fn test_double_drop_needs_same_key_and_tempo() {
        let planner = TransitionPlanner::default();
        let a = with_drops(track("a", 126.0, "8A", 0.8));
        let b = with_drops(track("b", 126.0, "8A", 0.8));
        let mut score = score_with(100, 0.0);
        let c = ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Peak);
        assert!(alternate_supported(&c, TransitionType::DoubleDrop));

        score.same_key = false;
        let c = ctx(&a, &b, &score, SetPhase::Peak, SetPhase::Peak);
        assert!(!alternate_supported(&c, TransitionType::DoubleDrop));

        let plain_b = track("b", 126.0, "8A", 0.8);
        let score = score_with(100, 0.0);
        let c = ctx(&a, &plain_b, &score, SetPhase::Peak, SetPhase::Peak);
        assert!(!alternate_supported(&c, TransitionType::DoubleDrop));
        // never offered outside phases that welcome it
        let c = ctx(&a, &b, &score, SetPhase::Warmup, SetPhase::Warmup);
        let offered = planner.alternates(&c, TransitionType::StemBlend);
        assert!(!offered.contains(&TransitionType::DoubleDrop));
    }

    #[test]
    fn test_scenario_pair_blends() {
        let scorer = Scorer::default();
        let planner = TransitionPlanner::default();
        let t1 = track("t1", 126.0, "8A", 0.5);
        let t2 = track("t2", 125.0, "8A", 0.6);
        let score = scorer.score(&t1, &t2);
        assert!(score.score >= 90);
        let plan = planner.plan(&ctx(&t1, &t2, &score, SetPhase::Warmup, SetPhase::Peak));
        assert_eq!(plan.transition_type, TransitionType::StemBlend);
        assert!(plan.automation.unwrap().bass_overlap_beats().unwrap() <= 2.0);
    }
}
