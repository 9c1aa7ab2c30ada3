//! Track ordering: a greedy walk along the set's energy curve followed by
//! adjacent-swap improvement.
//!
//! Tracks are indexed by sorted ID before anything else happens, so the
//! result depends only on the set, never on the order it arrived in.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{TrackAnalysis, TrackRecord};
use crate::compatibility::{CompatibilityScore, ScoreMatrix, Scorer};
use crate::curve::{EnergyTarget, SetCurvePolicy, SetPhase};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("set has {count} usable tracks; at most {max} can be ordered")]
    TooManyTracks { count: usize, max: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Orderer knobs, loaded from the `[ordering]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingConfig {
    /// Cap on adjacent-swap passes; 0 means one pass per track.
    pub max_improvement_passes: usize,
    /// How far outside its band a track may sit and still count as placed.
    pub energy_tolerance: f64,
    pub max_tracks: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            max_improvement_passes: 0,
            energy_tolerance: 0.1,
            max_tracks: 50,
        }
    }
}

/// Score of one adjacent pair in the final order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjacentScore {
    pub from_track_id: String,
    pub to_track_id: String,
    pub position: usize,
    /// Phase of the incoming track's slot.
    pub phase: SetPhase,
    pub score: CompatibilityScore,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderingResult {
    pub ordered_tracks: Vec<String>,
    pub excluded_track_ids: Vec<String>,
    pub adjacent_scores: Vec<AdjacentScore>,
    pub average_mix_score: Option<f64>,
    pub processing_time_ms: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Usable analyses and the IDs that were dropped on the way in.
pub struct Partition<'a> {
    pub usable: Vec<&'a TrackAnalysis>,
    pub excluded: Vec<String>,
    pub warnings: Vec<String>,
}

/// Split records into usable analyses (sorted by ID) and exclusions.
pub fn partition(tracks: &[TrackRecord]) -> Partition<'_> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut usable = Vec::new();
    let mut excluded = Vec::new();
    let mut warnings = Vec::new();

    for record in tracks {
        if !seen.insert(record.track_id.as_str()) {
            warnings.push(format!("duplicate track {} ignored", record.track_id));
            continue;
        }
        match &record.analysis {
            None => {
                warnings.push(format!("{} has no analysis", record.track_id));
                excluded.push(record.track_id.clone());
            }
            Some(analysis) => match analysis.validate() {
                Ok(()) if analysis.track_id == record.track_id => usable.push(analysis),
                Ok(()) => {
                    warnings.push(format!(
                        "{} carries the analysis of {}",
                        record.track_id, analysis.track_id
                    ));
                    excluded.push(record.track_id.clone());
                }
                Err(e) => {
                    warnings.push(e.to_string());
                    excluded.push(record.track_id.clone());
                }
            },
        }
    }
    for w in &warnings {
        log::warn!("{w}");
    }

    usable.sort_by(|a, b| a.track_id.cmp(&b.track_id));
    Partition {
        usable,
        excluded,
        warnings,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Orderer {
    scorer: Scorer,
    policy: SetCurvePolicy,
    config: OrderingConfig,
}

impl Orderer {
    pub fn new(scorer: Scorer, policy: SetCurvePolicy, config: OrderingConfig) -> Self {
        Self {
            scorer,
            policy,
            config,
        }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn policy(&self) -> &SetCurvePolicy {
        &self.policy
    }

    pub fn config(&self) -> &OrderingConfig {
        &self.config
    }

    /// Order a set of tracks.
    pub fn order(&self, tracks: &[TrackRecord]) -> Result<OrderingResult, EngineError> {
        let start = Instant::now();
        let Partition {
            usable,
            excluded,
            warnings,
        } = partition(tracks);

        if usable.len() > self.config.max_tracks {
            return Err(EngineError::TooManyTracks {
                count: usable.len(),
                max: self.config.max_tracks,
            });
        }

        let order = match usable.len() {
            0 => Vec::new(),
            1 => vec![0],
            n => {
                let matrix = ScoreMatrix::compute(&self.scorer, &usable);
                let mut order = self.greedy(&usable, &matrix);
                let swaps = self.improve(&usable, &matrix, &mut order);
                log::debug!("Adjacent-swap pass accepted {swaps} swaps over {n} tracks");
                order
            }
        };

        let ordered: Vec<&TrackAnalysis> = order.iter().map(|&i| usable[i]).collect();
        let (adjacent_scores, average_mix_score) = self.score_sequence(&ordered);
        let processing_time_ms = start.elapsed().as_millis() as u64;

        log::info!(
            "Ordered {} tracks ({} excluded) in {processing_time_ms} ms, average score {}",
            ordered.len(),
            excluded.len(),
            average_mix_score.map_or("n/a".to_string(), |a| format!("{a:.1}"))
        );

        Ok(OrderingResult {
            ordered_tracks: ordered.iter().map(|t| t.track_id.clone()).collect(),
            excluded_track_ids: excluded,
            adjacent_scores,
            average_mix_score,
            processing_time_ms,
            warnings,
        })
    }

    /// Scores for a fixed sequence, with each pair judged by the phase of
    /// its incoming slot.
    pub fn score_sequence(&self, ordered: &[&TrackAnalysis]) -> (Vec<AdjacentScore>, Option<f64>) {
        let n = ordered.len();
        let scores: Vec<AdjacentScore> = ordered
            .windows(2)
            .enumerate()
            .map(|(position, pair)| {
                let phase = self.policy.phase_at(position + 1, n);
                let bias = self.policy.band(phase).bias;
                AdjacentScore {
                    from_track_id: pair[0].track_id.clone(),
                    to_track_id: pair[1].track_id.clone(),
                    position,
                    phase,
                    score: self.scorer.score_with_bias(pair[0], pair[1], bias),
                }
            })
            .collect();
        let average = if scores.is_empty() {
            None
        } else {
            let sum: f64 = scores.iter().map(|s| f64::from(s.score.score)).sum();
            Some(sum / scores.len() as f64)
        };
        (scores, average)
    }

    /// Composite for `from → to` when `to` lands in `slot`.
    fn composite(&self, matrix: &ScoreMatrix, from: usize, to: usize, slot: usize) -> u8 {
        let phase = self.policy.phase_at(slot, matrix.len());
        let bias = self.policy.band(phase).bias;
        self.scorer.finish(matrix.terms(from, to), bias).score
    }

    fn seed(&self, tracks: &[&TrackAnalysis]) -> usize {
        let warmup_min = self.policy.band(SetPhase::Warmup).min_energy;
        let mut best = 0;
        for i in 1..tracks.len() {
            let (a, b) = (tracks[i], tracks[best]);
            let by_energy = (a.energy - warmup_min)
                .abs()
                .total_cmp(&(b.energy - warmup_min).abs());
            let better = by_energy
                .then_with(|| b.detection_confidence().total_cmp(&a.detection_confidence()))
                .then_with(|| a.track_id.cmp(&b.track_id));
            if better == Ordering::Less {
                best = i;
            }
        }
        best
    }

    fn greedy(&self, tracks: &[&TrackAnalysis], matrix: &ScoreMatrix) -> Vec<usize> {
        let n = tracks.len();
        let mut used = vec![false; n];
        let first = self.seed(tracks);
        used[first] = true;
        let mut order = Vec::with_capacity(n);
        order.push(first);

        for slot in 1..n {
            let last = order[slot - 1];
            let target = self.policy.target_for_slot(slot, n);
            let mut best: Option<(usize, f64, u8)> = None;

            for c in (0..n).filter(|&c| !used[c]) {
                let raw = self.composite(matrix, last, c, slot);
                let proximity = SetCurvePolicy::energy_proximity(&target, tracks[c].energy);
                let value = f64::from(raw) * proximity;
                let replace = match best {
                    None => true,
                    Some((b, b_value, b_raw)) => value
                        .total_cmp(&b_value)
                        .then(raw.cmp(&b_raw))
                        .then_with(|| {
                            matrix
                                .terms(last, b)
                                .bpm_difference
                                .total_cmp(&matrix.terms(last, c).bpm_difference)
                        })
                        .then_with(|| tracks[b].track_id.cmp(&tracks[c].track_id))
                        == Ordering::Greater,
                };
                if replace {
                    best = Some((c, value, raw));
                }
            }

            if let Some((c, _, _)) = best {
                used[c] = true;
                order.push(c);
            }
        }
        order
    }

    /// Sum of composites over the edges touching positions `p` and `p + 1`.
    fn local_sum(&self, matrix: &ScoreMatrix, order: &[usize], p: usize) -> u32 {
        let lo = p.saturating_sub(1);
        let hi = (p + 2).min(order.len() - 1);
        (lo..hi)
            .map(|k| u32::from(self.composite(matrix, order[k], order[k + 1], k + 1)))
            .sum()
    }

    fn keeps_bands(&self, tracks: &[&TrackAnalysis], order: &[usize], p: usize) -> bool {
        let n = order.len();
        let tolerance = self.config.energy_tolerance;
        let targets: [EnergyTarget; 2] = [
            self.policy.target_for_slot(p, n),
            self.policy.target_for_slot(p + 1, n),
        ];
        // order[p] moves to p + 1 and order[p + 1] moves to p
        let moves = [(order[p], 0, 1), (order[p + 1], 1, 0)];
        moves.iter().all(|&(track, from, to)| {
            let energy = tracks[track].energy;
            !targets[from].within(energy, tolerance) || targets[to].within(energy, tolerance)
        })
    }

    /// Accept adjacent swaps that strictly raise the affected scores.
    /// Returns the number of swaps made.
    fn improve(
        &self,
        tracks: &[&TrackAnalysis],
        matrix: &ScoreMatrix,
        order: &mut [usize],
    ) -> usize {
        let n = order.len();
        let cap = match self.config.max_improvement_passes {
            0 => n,
            cap => cap,
        };
        let mut swaps = 0;

        for pass in 0..cap {
            let mut improved = false;
            for p in 0..n - 1 {
                if !self.keeps_bands(tracks, order, p) {
                    continue;
                }
                let before = self.local_sum(matrix, order, p);
                order.swap(p, p + 1);
                let after = self.local_sum(matrix, order, p);
                if after > before {
                    improved = true;
                    swaps += 1;
                } else {
                    order.swap(p, p + 1);
                }
            }
            if !improved {
                log::trace!("Swap pass {pass} found nothing; stopping");
                break;
            }
        }
        swaps
    }
}
