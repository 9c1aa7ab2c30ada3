//! Pairwise track compatibility: harmonic, tempo and energy sub-scores and
//! their weighted composite.
//!
//! Scoring never fails. Missing or unreliable detections pull the relevant
//! sub-score toward a neutral 50 instead.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::analysis::TrackAnalysis;
use crate::camelot::{self, HarmonicRelation};
use crate::curve::EnergyBias;

/// Sub-score used when there is nothing to measure.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Tempo difference reported when either tempo is missing. Folded
/// differences never exceed ~41%, and anything this far apart is never
/// blended by the planner.
pub const UNKNOWN_BPM_DIFFERENCE: f64 = 100.0;

/// Scoring knobs, loaded from the `[scoring]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub harmonic_weight: f64,
    pub bpm_weight: f64,
    pub energy_weight: f64,
    /// BPM difference (%) at which the tempo sub-score reaches zero.
    pub bpm_tolerance_pct: f64,
    /// Detections below these confidences are blended toward neutral.
    pub min_key_confidence: f64,
    pub min_bpm_confidence: f64,
    /// Energy delta at which the energy sub-score reaches zero.
    pub energy_span: f64,
    /// Multiplier on |delta| when the change goes the way the phase wants.
    pub favored_direction_factor: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            harmonic_weight: 0.40,
            bpm_weight: 0.35,
            energy_weight: 0.25,
            bpm_tolerance_pct: 8.0,
            min_key_confidence: 0.5,
            min_bpm_confidence: 0.5,
            energy_span: 0.5,
            favored_direction_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompatibilityType {
    PerfectMatch,
    Adjacent,
    Relative,
    DiagonalAdjacent,
    EnergyBoost,
    Compatible,
    Risky,
}

impl CompatibilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerfectMatch => "perfect-match",
            Self::Adjacent => "adjacent",
            Self::Relative => "relative",
            Self::DiagonalAdjacent => "diagonal-adjacent",
            Self::EnergyBoost => "energy-boost",
            Self::Compatible => "compatible",
            Self::Risky => "risky",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::PerfectMatch,
            Self::Adjacent,
            Self::Relative,
            Self::DiagonalAdjacent,
            Self::EnergyBoost,
            Self::Compatible,
            Self::Risky,
        ]
        .into_iter()
        .find(|t| t.as_str() == raw)
    }
}

/// Phase-independent parts of a pair score. The energy sub-score depends on
/// where in the set the pair lands, so it is finished later.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairTerms {
    pub harmonic_score: f64,
    pub compatibility_type: CompatibilityType,
    pub bpm_score: f64,
    pub bpm_difference: f64,
    /// Signed: positive when energy rises from A to B.
    pub energy_difference: f64,
    /// True when both keys are known and A and B share the same Camelot code.
    pub same_key: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilityScore {
    /// Composite 0–100.
    pub score: u8,
    pub harmonic_score: f64,
    pub bpm_score: f64,
    pub energy_score: f64,
    pub compatibility_type: CompatibilityType,
    /// Percent, after tempo-octave folding; `UNKNOWN_BPM_DIFFERENCE` when a
    /// tempo is missing.
    pub bpm_difference: f64,
    pub energy_difference: f64,
    #[serde(default)]
    pub same_key: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score A→B with no phase preference on the energy change.
    pub fn score(&self, a: &TrackAnalysis, b: &TrackAnalysis) -> CompatibilityScore {
        self.score_with_bias(a, b, EnergyBias::Neutral)
    }

    pub fn score_with_bias(
        &self,
        a: &TrackAnalysis,
        b: &TrackAnalysis,
        bias: EnergyBias,
    ) -> CompatibilityScore {
        self.finish(&self.pair_terms(a, b), bias)
    }

    pub fn pair_terms(&self, a: &TrackAnalysis, b: &TrackAnalysis) -> PairTerms {
        let (harmonic_score, compatibility_type, same_key) = self.harmonic_terms(a, b);
        let (bpm_score, bpm_difference) = match bpm_difference_pct(a.bpm, b.bpm) {
            Some(difference) => {
                let raw = bpm_score(difference, self.config.bpm_tolerance_pct);
                let confidence = min_confidence(a.bpm_confidence, b.bpm_confidence);
                (
                    toward_neutral(raw, confidence, self.config.min_bpm_confidence),
                    difference,
                )
            }
            None => (NEUTRAL_SCORE, UNKNOWN_BPM_DIFFERENCE),
        };

        PairTerms {
            harmonic_score,
            compatibility_type,
            bpm_score,
            bpm_difference,
            energy_difference: b.energy - a.energy,
            same_key,
        }
    }

    fn harmonic_terms(
        &self,
        a: &TrackAnalysis,
        b: &TrackAnalysis,
    ) -> (f64, CompatibilityType, bool) {
        let (Some(key_a), Some(key_b)) = (a.key, b.key) else {
            return (NEUTRAL_SCORE, band_type(NEUTRAL_SCORE), false);
        };

        let raw = camelot::harmonic_score(&key_a, &key_b);
        let confidence = min_confidence(a.key_confidence, b.key_confidence);
        let reliable = confidence >= self.config.min_key_confidence;
        let score = toward_neutral(raw, confidence, self.config.min_key_confidence);

        let compatibility_type = if reliable {
            match key_a.relation_to(&key_b) {
                HarmonicRelation::Identical => CompatibilityType::PerfectMatch,
                HarmonicRelation::Adjacent => CompatibilityType::Adjacent,
                HarmonicRelation::Relative => CompatibilityType::Relative,
                HarmonicRelation::Diagonal => CompatibilityType::DiagonalAdjacent,
                HarmonicRelation::EnergyBoost => CompatibilityType::EnergyBoost,
                HarmonicRelation::Distant(_) => band_type(score),
            }
        } else {
            band_type(score)
        };
        (score, compatibility_type, reliable && key_a == key_b)
    }

    /// Apply the phase's energy preference and combine into a composite.
    pub fn finish(&self, terms: &PairTerms, bias: EnergyBias) -> CompatibilityScore {
        let energy_score = self.energy_score(terms.energy_difference, bias);
        let c = &self.config;
        let total_weight = c.harmonic_weight + c.bpm_weight + c.energy_weight;
        let weighted = if total_weight <= f64::EPSILON {
            0.0
        } else {
            (c.harmonic_weight * terms.harmonic_score
                + c.bpm_weight * terms.bpm_score
                + c.energy_weight * energy_score)
                / total_weight
        };

        CompatibilityScore {
            score: weighted.round().clamp(0.0, 100.0) as u8,
            harmonic_score: terms.harmonic_score,
            bpm_score: terms.bpm_score,
            energy_score,
            compatibility_type: terms.compatibility_type,
            bpm_difference: terms.bpm_difference,
            energy_difference: terms.energy_difference,
            same_key: terms.same_key,
        }
    }

    fn energy_score(&self, delta: f64, bias: EnergyBias) -> f64 {
        let favored = match bias {
            EnergyBias::Neutral => false,
            EnergyBias::Rising => delta > 0.0,
            EnergyBias::Falling => delta < 0.0,
        };
        let magnitude = if favored {
            delta.abs() * self.config.favored_direction_factor
        } else {
            delta.abs()
        };
        let span = self.config.energy_span.max(f64::EPSILON);
        (100.0 * (1.0 - magnitude / span)).clamp(0.0, 100.0)
    }
}

/// Tempo difference in percent of A's tempo, after folding B into the
/// tempo octave closest to A (so 128 vs 64 or 256 counts as identical).
/// `None` when either tempo is missing (zero, negative or non-finite).
pub fn bpm_difference_pct(bpm_a: f64, bpm_b: f64) -> Option<f64> {
    if !(bpm_a > 0.0 && bpm_b > 0.0) || !bpm_a.is_finite() || !bpm_b.is_finite() {
        return None;
    }
    let mut ratio = bpm_b / bpm_a;
    // Fold into [1/√2, √2). Dividing by two is exact, so octave shifts of
    // either tempo land on the same folded ratio.
    while ratio >= std::f64::consts::SQRT_2 {
        ratio /= 2.0;
    }
    while ratio < std::f64::consts::FRAC_1_SQRT_2 {
        ratio *= 2.0;
    }
    Some((1.0 - ratio).abs() * 100.0)
}

/// 100 at no difference, linearly down to 0 at `tolerance_pct`.
pub fn bpm_score(difference_pct: f64, tolerance_pct: f64) -> f64 {
    if !difference_pct.is_finite() || tolerance_pct <= 0.0 {
        return 0.0;
    }
    (100.0 * (1.0 - difference_pct / tolerance_pct)).clamp(0.0, 100.0)
}

/// Harmonic score band used when the wheel relation alone does not name the pair.
fn band_type(harmonic_score: f64) -> CompatibilityType {
    if harmonic_score >= NEUTRAL_SCORE {
        CompatibilityType::Compatible
    } else {
        CompatibilityType::Risky
    }
}

fn min_confidence(a: Option<f64>, b: Option<f64>) -> f64 {
    a.unwrap_or(1.0).min(b.unwrap_or(1.0))
}

/// Blend `raw` toward neutral in proportion to how far `confidence` falls
/// short of `threshold`.
fn toward_neutral(raw: f64, confidence: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return raw;
    }
    let weight = (confidence / threshold).clamp(0.0, 1.0);
    NEUTRAL_SCORE + (raw - NEUTRAL_SCORE) * weight
}

/// Phase-independent terms for every ordered pair in a set, computed in
/// parallel. Row `i`, column `j` holds the terms for `i → j`.
pub struct ScoreMatrix {
    n: usize,
    terms: Vec<PairTerms>,
}

impl ScoreMatrix {
    pub fn compute(scorer: &Scorer, tracks: &[&TrackAnalysis]) -> Self {
        let n = tracks.len();
        let rows: Vec<Vec<PairTerms>> = (0..n)
            .into_par_iter()
            .map(|i| {
                (0..n)
                    .map(|j| scorer.pair_terms(tracks[i], tracks[j]))
                    .collect()
            })
            .collect();

        log::debug!("Scored {} ordered pairs", n * n.saturating_sub(1));

        Self {
            n,
            terms: rows.into_iter().flatten().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn terms(&self, from: usize, to: usize) -> &PairTerms {
        &self.terms[from * self.n + to]
    }
}
