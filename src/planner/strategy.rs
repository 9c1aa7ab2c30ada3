//! Pluggable plan proposers.
//!
//! A proposer suggests a plan for one pair. The rule engine always proposes
//! something valid; external proposers (an assistant, a hand-written file)
//! may not, so every proposal is checked against the hard invariants and
//! replaced by the rule engine's plan when it fails.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::automation::StemAutomation;
use super::{
    alternate_supported, cuts, incoming_entry_ms, CutPoints, PlanContext, TailEffect,
    TransitionPlan, TransitionPlanner, TransitionType, HARD_CUT_BPM_DIFF, TAIL_BARS,
};
use crate::camelot::CamelotKey;
use crate::curve::{SetCurvePolicy, SetPhase};

/// Millisecond slack for rounding between bars and ms.
const MS_SLACK: u64 = 1;

#[derive(Error, Debug)]
pub enum ProposalError {
    #[error("proposal source failed: {0}")]
    Source(String),
    #[error("malformed proposal: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no proposal for {from} -> {to}")]
    Missing { from: String, to: String },
    #[error("proposal violates {0}")]
    Invalid(String),
}

/// Something that can propose a transition plan.
pub trait PlanProposer: Send + Sync {
    /// Propose a plan for one adjacent pair
    fn propose(&self, ctx: &PlanContext<'_>) -> Result<TransitionPlan, ProposalError>;

    /// Get the name of this proposer (for logging)
    fn name(&self) -> &'static str;
}

impl PlanProposer for TransitionPlanner {
    fn propose(&self, ctx: &PlanContext<'_>) -> Result<TransitionPlan, ProposalError> {
        Ok(self.plan(ctx))
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}

/// What an external proposer is told about a pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRequest {
    pub from_track_id: String,
    pub to_track_id: String,
    pub position: usize,
    pub phase: SetPhase,
    pub score: u8,
    pub bpm_difference: f64,
    pub from_bpm: f64,
    pub to_bpm: f64,
    pub from_key: Option<CamelotKey>,
    pub to_key: Option<CamelotKey>,
    /// Legal cut points in the outgoing track.
    pub boundaries_ms: Vec<u64>,
    pub earliest_mix_start_ms: u64,
    pub preferred_bars: (u32, u32),
    pub styles: Vec<TransitionType>,
}

impl ProposalRequest {
    pub fn new(policy: &SetCurvePolicy, ctx: &PlanContext<'_>) -> Self {
        Self {
            from_track_id: ctx.from.track_id.clone(),
            to_track_id: ctx.to.track_id.clone(),
            position: ctx.position,
            phase: ctx.phase,
            score: ctx.score.score,
            bpm_difference: ctx.score.bpm_difference,
            from_bpm: ctx.from.bpm,
            to_bpm: ctx.to.bpm,
            from_key: ctx.from.key,
            to_key: ctx.to.key,
            boundaries_ms: cuts::boundaries(ctx.from),
            earliest_mix_start_ms: ctx.from_entry_ms,
            preferred_bars: policy.duration_range(ctx.phase),
            styles: policy.band(ctx.phase).styles.clone(),
        }
    }
}

/// Raw answer from an external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPlanProposal {
    pub transition_type: TransitionType,
    #[serde(default)]
    pub duration_bars: u32,
    pub track_a_cut_ms: u64,
    #[serde(default)]
    pub track_b_mix_start_ms: Option<u64>,
    #[serde(default)]
    pub tail: Option<TailEffect>,
    #[serde(default)]
    pub automation: Option<StemAutomation>,
    #[serde(default)]
    pub alternates: Vec<TransitionType>,
}

impl ExternalPlanProposal {
    /// Expand into a full plan; derived fields follow the pair's tempos.
    pub fn into_plan(self, ctx: &PlanContext<'_>) -> TransitionPlan {
        let (a, b) = (ctx.from, ctx.to);
        let b_entry = self
            .track_b_mix_start_ms
            .unwrap_or_else(|| incoming_entry_ms(b));
        let b_room = b.duration_ms.saturating_sub(b_entry);

        let (duration_ms, a_mix_start, b_consumed) = match self.transition_type {
            TransitionType::HardCut => {
                let tail_ms = match self.tail {
                    Some(_) => cuts::bars_to_ms(TAIL_BARS, b.bpm).min(b_room),
                    None => 0,
                };
                (tail_ms, self.track_a_cut_ms, tail_ms)
            }
            _ => {
                let a_ms = cuts::bars_to_ms(self.duration_bars, a.bpm);
                let b_ms = cuts::bars_to_ms(self.duration_bars, b.bpm).min(b_room);
                (a_ms, self.track_a_cut_ms.saturating_sub(a_ms), b_ms)
            }
        };
        let automation = match (self.transition_type, self.automation) {
            (TransitionType::StemBlend, None) => {
                Some(StemAutomation::stem_blend(self.duration_bars, false))
            }
            (_, automation) => automation,
        };

        TransitionPlan {
            transition_type: self.transition_type,
            tail: self.tail,
            duration_bars: self.duration_bars,
            duration_ms,
            cut_points: CutPoints {
                track_a_mix_start_ms: a_mix_start,
                track_a_cut_ms: self.track_a_cut_ms,
                track_b_mix_start_ms: b_entry,
                track_b_start_ms: b_entry + b_consumed,
            },
            automation,
            alternates: self.alternates,
            warnings: Vec::new(),
        }
    }
}

/// Where external proposals come from.
pub trait ProposalSource: Send + Sync {
    /// Return the proposal for `request` as JSON text
    fn fetch(&self, request: &ProposalRequest) -> Result<String, ProposalError>;

    /// Get the name of this source (for logging)
    fn name(&self) -> &'static str;
}

/// Proposals read from a JSON file keyed by `"<from>-><to>"`.
#[derive(Debug, Clone, Default)]
pub struct ProposalFile {
    entries: HashMap<String, serde_json::Value>,
}

impl ProposalFile {
    pub fn load(path: &Path) -> Result<Self, ProposalError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ProposalError> {
        Ok(Self {
            entries: serde_json::from_str(json)?,
        })
    }

    pub fn key(from: &str, to: &str) -> String {
        format!("{from}->{to}")
    }
}

impl ProposalSource for ProposalFile {
    fn fetch(&self, request: &ProposalRequest) -> Result<String, ProposalError> {
        self.entries
            .get(&Self::key(&request.from_track_id, &request.to_track_id))
            .map(|v| v.to_string())
            .ok_or_else(|| ProposalError::Missing {
                from: request.from_track_id.clone(),
                to: request.to_track_id.clone(),
            })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Adapter turning a [`ProposalSource`] into a [`PlanProposer`].
pub struct ExternalProposer<S> {
    source: S,
    policy: SetCurvePolicy,
}

impl<S: ProposalSource> ExternalProposer<S> {
    pub fn new(source: S, policy: SetCurvePolicy) -> Self {
        Self { source, policy }
    }
}

impl<S: ProposalSource> PlanProposer for ExternalProposer<S> {
    fn propose(&self, ctx: &PlanContext<'_>) -> Result<TransitionPlan, ProposalError> {
        let request = ProposalRequest::new(&self.policy, ctx);
        let raw = self.source.fetch(&request)?;
        let proposal: ExternalPlanProposal = serde_json::from_str(&raw)?;
        Ok(proposal.into_plan(ctx))
    }

    fn name(&self) -> &'static str {
        self.source.name()
    }
}

/// Check a plan against the invariants every rendered transition relies on.
pub fn validate_plan(
    policy: &SetCurvePolicy,
    ctx: &PlanContext<'_>,
    plan: &TransitionPlan,
) -> Result<(), ProposalError> {
    let invalid = |msg: String| Err(ProposalError::Invalid(msg));
    let (a, b) = (ctx.from, ctx.to);
    let cp = &plan.cut_points;
    let kind = plan.transition_type;

    if !kind.is_primary() {
        return invalid(format!("{kind} is only allowed as an alternate"));
    }
    if plan.duration_bars % 4 != 0 {
        return invalid(format!("phrase alignment: {} bars", plan.duration_bars));
    }
    match kind {
        TransitionType::HardCut if plan.duration_bars != 0 => {
            return invalid(format!("hard cut with {} bars", plan.duration_bars));
        }
        TransitionType::StemBlend | TransitionType::Crossfade => {
            if plan.duration_bars == 0 {
                return invalid(format!("{kind} with no bars"));
            }
            if ctx.score.bpm_difference > HARD_CUT_BPM_DIFF {
                return invalid(format!(
                    "{kind} across a {:.1}% tempo gap",
                    ctx.score.bpm_difference
                ));
            }
        }
        _ => {}
    }

    if !cuts::is_boundary(a, cp.track_a_cut_ms) {
        return invalid(format!("cut at {} ms is not a boundary", cp.track_a_cut_ms));
    }
    if cp.track_a_mix_start_ms + MS_SLACK < ctx.from_entry_ms {
        return invalid(format!(
            "mix starts at {} ms, before the track enters at {} ms",
            cp.track_a_mix_start_ms, ctx.from_entry_ms
        ));
    }
    let blend_ms = cp.track_a_cut_ms.saturating_sub(cp.track_a_mix_start_ms);
    let expected_ms = cuts::bars_to_ms(plan.duration_bars, a.bpm);
    if blend_ms.abs_diff(expected_ms) > MS_SLACK {
        return invalid(format!(
            "blend of {blend_ms} ms does not match {} bars",
            plan.duration_bars
        ));
    }
    if cp.track_b_mix_start_ms > cp.track_b_start_ms || cp.track_b_start_ms > b.duration_ms {
        return invalid(format!(
            "incoming window {}..{} ms outside the track",
            cp.track_b_mix_start_ms, cp.track_b_start_ms
        ));
    }

    if kind == TransitionType::StemBlend {
        let Some(automation) = &plan.automation else {
            return invalid("stem blend without automation".into());
        };
        if automation.total_beats != f64::from(plan.duration_bars * cuts::BEATS_PER_BAR) {
            return invalid("automation length differs from the blend".into());
        }
        automation
            .validate()
            .map_err(|e| ProposalError::Invalid(format!("bass swap: {e}")))?;
    }

    for &alt in &plan.alternates {
        if alt.is_primary()
            || !policy.allows_style(ctx.phase, alt)
            || !alternate_supported(ctx, alt)
        {
            return invalid(format!("alternate {alt} in {}", ctx.phase));
        }
    }
    Ok(())
}

/// Which proposer produced a plan, and why a proposal was dropped if it was.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: TransitionPlan,
    pub source: &'static str,
    pub rejection: Option<String>,
}

/// Runs a proposer and falls back to the rule engine when its plan is
/// unusable.
pub struct ValidatingPlanner {
    proposer: Option<Box<dyn PlanProposer>>,
    rules: TransitionPlanner,
}

impl ValidatingPlanner {
    /// Rule engine only.
    pub fn rules(policy: SetCurvePolicy) -> Self {
        Self {
            proposer: None,
            rules: TransitionPlanner::new(policy),
        }
    }

    pub fn with_proposer(policy: SetCurvePolicy, proposer: Box<dyn PlanProposer>) -> Self {
        Self {
            proposer: Some(proposer),
            rules: TransitionPlanner::new(policy),
        }
    }

    pub fn policy(&self) -> &SetCurvePolicy {
        self.rules.policy()
    }

    pub fn plan(&self, ctx: &PlanContext<'_>) -> PlanOutcome {
        let Some(proposer) = &self.proposer else {
            return PlanOutcome {
                plan: self.rules.plan(ctx),
                source: self.rules.name(),
                rejection: None,
            };
        };

        let checked = proposer
            .propose(ctx)
            .and_then(|plan| validate_plan(self.policy(), ctx, &plan).map(|_| plan));
        match checked {
            Ok(plan) => PlanOutcome {
                plan,
                source: proposer.name(),
                rejection: None,
            },
            Err(e) => {
                log::warn!(
                    "{} proposal for {} -> {} rejected: {e}",
                    proposer.name(),
                    ctx.from.track_id,
                    ctx.to.track_id
                );
                let mut plan = self.rules.plan(ctx);
                plan.warnings
                    .push(format!("{} proposal rejected ({e}); using rule plan", proposer.name()));
                PlanOutcome {
                    plan,
                    source: self.rules.name(),
                    rejection: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Section, SectionLabel, TrackAnalysis};
    use crate::compatibility::{CompatibilityScore, Scorer};

    fn structured(id: &str, bpm: f64, key: &str) -> TrackAnalysis {
        let mut t = TrackAnalysis::new(id, bpm, CamelotKey::parse(key), 0.8);
        let bar = cuts::bar_ms(bpm);
        let at = |bars: f64| (bars * bar).round() as u64;
        t.duration_ms = at(128.0);
        t.structure = vec![
            Section { label: SectionLabel::Intro, start_ms: 0, end_ms: at(16.0) },
            Section { label: SectionLabel::Drop, start_ms: at(16.0), end_ms: at(80.0) },
            Section { label: SectionLabel::Outro, start_ms: at(96.0), end_ms: at(128.0) },
        ];
        t
    }

    struct Fixed(&'static str);

    impl ProposalSource for Fixed {
        fn fetch(&self, _: &ProposalRequest) -> Result<String, ProposalError> {
            Ok(self.0.to_string())
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn pair() -> (TrackAnalysis, TrackAnalysis, CompatibilityScore) {
        let a = structured("a", 120.0, "8A");
        let b = structured("b", 120.0, "8A");
        let score = Scorer::default().score(&a, &b);
        (a, b, score)
    }

    fn ctx<'a>(
        a: &'a TrackAnalysis,
        b: &'a TrackAnalysis,
        s: &'a CompatibilityScore,
    ) -> PlanContext<'a> {
        PlanContext {
            from: a,
            to: b,
            score: s,
            from_phase: SetPhase::Peak,
            phase: SetPhase::Peak,
            position: 0,
            from_entry_ms: 0,
        }
    }

    #[test]
    fn test_rule_plans_validate() {
        let (a, b, s) = pair();
        let policy = SetCurvePolicy::default();
        let planner = TransitionPlanner::new(policy.clone());
        for phase in SetPhase::ALL {
            let mut c = ctx(&a, &b, &s);
            c.phase = phase;
            let plan = planner.plan(&c);
            assert!(validate_plan(&policy, &c, &plan).is_ok(), "{phase}: {plan:?}");
        }
    }

    #[test]
    fn test_valid_external_proposal_is_kept() {
        let (a, b, s) = pair();
        // 120 BPM: 2000 ms per bar; outro starts at 192 s
        let json = r#"{"transitionType":"CROSSFADE","durationBars":8,"trackACutMs":192000}"#;
        let planner = ValidatingPlanner::with_proposer(
            SetCurvePolicy::default(),
            Box::new(ExternalProposer::new(Fixed(json), SetCurvePolicy::default())),
        );
        let outcome = planner.plan(&ctx(&a, &b, &s));
        assert_eq!(outcome.source, "fixed");
        assert!(outcome.rejection.is_none());
        assert_eq!(outcome.plan.transition_type, TransitionType::Crossfade);
        assert_eq!(outcome.plan.cut_points.track_a_mix_start_ms, 176_000);
        assert_eq!(outcome.plan.cut_points.track_b_start_ms, 16_000);
    }

    #[test]
    fn test_off_boundary_cut_falls_back() {
        let (a, b, s) = pair();
        let json = r#"{"transitionType":"CROSSFADE","durationBars":8,"trackACutMs":190000}"#;
        let planner = ValidatingPlanner::with_proposer(
            SetCurvePolicy::default(),
            Box::new(ExternalProposer::new(Fixed(json), SetCurvePolicy::default())),
        );
        let outcome = planner.plan(&ctx(&a, &b, &s));
        assert_eq!(outcome.source, "rules");
        assert!(outcome.rejection.unwrap().contains("boundary"));
        assert!(!outcome.plan.warnings.is_empty());
    }

    #[test]
    fn test_misaligned_and_creative_proposals_fall_back() {
        let (a, b, s) = pair();
        for json in [
            r#"{"transitionType":"STEM_BLEND","durationBars":6,"trackACutMs":192000}"#,
            r#"{"transitionType":"DOUBLE_DROP","durationBars":8,"trackACutMs":192000}"#,
            r#"{"transitionType":"HARD_CUT","durationBars":4,"trackACutMs":192000}"#,
            r#"not json"#,
        ] {
            let planner = ValidatingPlanner::with_proposer(
                SetCurvePolicy::default(),
                Box::new(ExternalProposer::new(Fixed(json), SetCurvePolicy::default())),
            );
            let outcome = planner.plan(&ctx(&a, &b, &s));
            assert_eq!(outcome.source, "rules", "{json}");
            assert!(outcome.rejection.is_some());
        }
    }

    #[test]
    fn test_bad_bass_swap_is_rejected() {
        let (a, b, s) = pair();
        let c = ctx(&a, &b, &s);
        let policy = SetCurvePolicy::default();
        let mut plan = TransitionPlanner::new(policy.clone()).plan(&c);
        assert_eq!(plan.transition_type, TransitionType::StemBlend);
        let automation = plan.automation.as_mut().unwrap();
        let total = automation.total_beats;
        // keep A's bass up for the whole blend
        automation.lanes[0].points = vec![
            crate::planner::automation::GainPoint { beat: 0.0, gain: 1.0 },
            crate::planner::automation::GainPoint { beat: total, gain: 1.0 },
        ];
        let err = validate_plan(&policy, &c, &plan).unwrap_err();
        assert!(err.to_string().contains("bass"));
    }

    #[test]
    fn test_proposal_file_lookup() {
        let file = ProposalFile::from_json(
            r#"{"a->b": {"transitionType":"HARD_CUT","trackACutMs":192000}}"#,
        )
        .unwrap();
        let (a, b, s) = pair();
        let proposer = ExternalProposer::new(file, SetCurvePolicy::default());
        let plan = proposer.propose(&ctx(&a, &b, &s)).unwrap();
        assert_eq!(plan.transition_type, TransitionType::HardCut);
        assert_eq!(plan.duration_ms, 0);

        let plan = proposer.propose(&ctx(&b, &a, &s));
        assert!(matches!(plan, Err(ProposalError::Missing { .. })));
    }
}
