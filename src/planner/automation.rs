//! Per-stem gain automation for stem blends.
//!
//! Each lane is a piecewise-linear gain curve over the blend, in beats from
//! the start of the transition. Gain holds its first value before the first
//! point and its last value after the last point.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest stretch (in beats) both decks may carry bass at once.
pub const MAX_BASS_OVERLAP_BEATS: f64 = 2.0;

/// Vocal intensity above which the incoming vocals wait for the outgoing ones.
pub const VOCAL_CLASH_INTENSITY: f64 = 0.5;

#[derive(Error, Debug, PartialEq)]
pub enum AutomationError {
    #[error("missing {stem:?} lane for the {deck:?} deck")]
    MissingLane { deck: Deck, stem: Stem },
    #[error("{deck:?} {stem:?} lane: {message}")]
    BadLane { deck: Deck, stem: Stem, message: String },
    #[error("bass stems overlap for {0:.2} beats")]
    BassOverlap(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stem {
    Drums,
    Bass,
    Vocals,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deck {
    /// Outgoing track
    A,
    /// Incoming track
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainPoint {
    pub beat: f64,
    pub gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationLane {
    pub deck: Deck,
    pub stem: Stem,
    pub points: Vec<GainPoint>,
}

impl AutomationLane {
    fn new(deck: Deck, stem: Stem, points: &[(f64, f64)]) -> Self {
        Self {
            deck,
            stem,
            points: points
                .iter()
                .map(|&(beat, gain)| GainPoint { beat, gain })
                .collect(),
        }
    }

    pub fn gain_at(&self, beat: f64) -> f64 {
        let Some(first) = self.points.first() else {
            return 0.0;
        };
        if beat <= first.beat {
            return first.gain;
        }
        for pair in self.points.windows(2) {
            let (p0, p1) = (pair[0], pair[1]);
            if beat <= p1.beat {
                if p1.beat <= p0.beat {
                    return p1.gain;
                }
                let t = (beat - p0.beat) / (p1.beat - p0.beat);
                return p0.gain + (p1.gain - p0.gain) * t;
            }
        }
        self.points.last().map_or(0.0, |p| p.gain)
    }

    /// Intervals within `[0, total_beats]` where the gain is above zero.
    pub fn audible_intervals(&self, total_beats: f64) -> Vec<(f64, f64)> {
        let mut knots: Vec<(f64, f64)> = Vec::with_capacity(self.points.len() + 2);
        knots.push((0.0, self.gain_at(0.0)));
        for p in &self.points {
            if p.beat > 0.0 && p.beat < total_beats {
                knots.push((p.beat, p.gain));
            }
        }
        knots.push((total_beats, self.gain_at(total_beats)));

        let mut intervals: Vec<(f64, f64)> = Vec::new();
        for pair in knots.windows(2) {
            let ((x0, g0), (x1, g1)) = (pair[0], pair[1]);
            if x1 <= x0 {
                continue;
            }
            let span = match (g0 > 0.0, g1 > 0.0) {
                (true, true) => Some((x0, x1)),
                (true, false) => Some((x0, x0 + (x1 - x0) * g0 / (g0 - g1))),
                (false, true) => Some((x0 + (x1 - x0) * -g0 / (g1 - g0), x1)),
                (false, false) => None,
            };
            if let Some((start, end)) = span {
                match intervals.last_mut() {
                    Some(last) if (start - last.1).abs() < 1e-9 => last.1 = end,
                    _ => intervals.push((start, end)),
                }
            }
        }
        intervals
    }

    fn check(&self, total_beats: f64) -> Result<(), AutomationError> {
        let bad = |message: String| AutomationError::BadLane {
            deck: self.deck,
            stem: self.stem,
            message,
        };
        if self.points.is_empty() {
            return Err(bad("no points".into()));
        }
        for (i, p) in self.points.iter().enumerate() {
            if !(0.0..=1.0).contains(&p.gain) {
                return Err(bad(format!("gain {} outside [0, 1]", p.gain)));
            }
            if !(0.0..=total_beats).contains(&p.beat) {
                return Err(bad(format!("beat {} outside the blend", p.beat)));
            }
            if i > 0 && p.beat < self.points[i - 1].beat {
                return Err(bad("points out of order".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemAutomation {
    pub total_beats: f64,
    pub lanes: Vec<AutomationLane>,
}

impl StemAutomation {
    /// Standard stem blend over `bars` bars.
    ///
    /// Bass swaps hard on the middle bar line; drums and other stems cross
    /// around it. With `vocal_clash`, the incoming vocals stay out until the
    /// outgoing vocals are gone.
    pub fn stem_blend(bars: u32, vocal_clash: bool) -> Self {
        let total = f64::from(bars * 4);
        let swap = f64::from((bars / 2) * 4);
        let ramp = 1.0_f64.min(swap);

        let b_vocals: Vec<(f64, f64)> = if vocal_clash {
            vec![(0.0, 0.0), (swap, 0.0), ((swap + 4.0).min(total), 1.0), (total, 1.0)]
        } else {
            vec![(0.0, 0.0), (swap, 1.0), (total, 1.0)]
        };

        Self {
            total_beats: total,
            lanes: vec![
                AutomationLane::new(
                    Deck::A,
                    Stem::Bass,
                    &[(0.0, 1.0), (swap - ramp, 1.0), (swap, 0.0), (total, 0.0)],
                ),
                AutomationLane::new(
                    Deck::B,
                    Stem::Bass,
                    &[(0.0, 0.0), (swap, 0.0), (swap + ramp, 1.0), (total, 1.0)],
                ),
                AutomationLane::new(Deck::A, Stem::Drums, &[(0.0, 1.0), (swap, 1.0), (total, 0.0)]),
                AutomationLane::new(Deck::B, Stem::Drums, &[(0.0, 0.0), (swap, 1.0), (total, 1.0)]),
                AutomationLane::new(
                    Deck::A,
                    Stem::Vocals,
                    &[(0.0, 1.0), (swap, 0.0), (total, 0.0)],
                ),
                AutomationLane::new(Deck::B, Stem::Vocals, &b_vocals),
                AutomationLane::new(Deck::A, Stem::Other, &[(0.0, 1.0), (total, 0.0)]),
                AutomationLane::new(Deck::B, Stem::Other, &[(0.0, 0.0), (swap, 1.0), (total, 1.0)]),
            ],
        }
    }

    pub fn lane(&self, deck: Deck, stem: Stem) -> Option<&AutomationLane> {
        self.lanes.iter().find(|l| l.deck == deck && l.stem == stem)
    }

    /// Beats during which both decks' bass stems are audible.
    pub fn bass_overlap_beats(&self) -> Result<f64, AutomationError> {
        let a = self.required_lane(Deck::A, Stem::Bass)?;
        let b = self.required_lane(Deck::B, Stem::Bass)?;
        Ok(overlap(
            &a.audible_intervals(self.total_beats),
            &b.audible_intervals(self.total_beats),
        ))
    }

    /// Check the curve shapes and the bass-swap constraint.
    pub fn validate(&self) -> Result<(), AutomationError> {
        for lane in &self.lanes {
            lane.check(self.total_beats)?;
        }
        let overlap = self.bass_overlap_beats()?;
        if overlap > MAX_BASS_OVERLAP_BEATS + 1e-9 {
            return Err(AutomationError::BassOverlap(overlap));
        }
        Ok(())
    }

    fn required_lane(&self, deck: Deck, stem: Stem) -> Result<&AutomationLane, AutomationError> {
        self.lane(deck, stem)
            .ok_or(AutomationError::MissingLane { deck, stem })
    }
}

fn overlap(a: &[(f64, f64)], b: &[(f64, f64)]) -> f64 {
    let mut total = 0.0;
    for &(a0, a1) in a {
        for &(b0, b1) in b {
            let start = a0.max(b0);
            let end = a1.min(b1);
            if end > start {
                total += end - start;
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_blend_has_clean_bass_swap() {
        for bars in [4, 8, 16, 32, 64] {
            for clash in [false, true] {
                let auto = StemAutomation::stem_blend(bars, clash);
                assert_eq!(auto.total_beats, f64::from(bars * 4));
                assert!(auto.validate().is_ok(), "{bars} bars");
                assert!(auto.bass_overlap_beats().unwrap() <= MAX_BASS_OVERLAP_BEATS);
            }
        }
    }

    #[test]
    fn test_gain_interpolation() {
        let auto = StemAutomation::stem_blend(8, false);
        let a_other = auto.lane(Deck::A, Stem::Other).unwrap();
        assert_eq!(a_other.gain_at(0.0), 1.0);
        assert!((a_other.gain_at(16.0) - 0.5).abs() < 1e-9);
        assert_eq!(a_other.gain_at(40.0), 0.0);
    }

    #[test]
    fn test_vocal_clash_delays_incoming_vocals() {
        let auto = StemAutomation::stem_blend(16, true);
        let b_vocals = auto.lane(Deck::B, Stem::Vocals).unwrap();
        assert_eq!(b_vocals.gain_at(32.0), 0.0);
        assert_eq!(b_vocals.gain_at(36.0), 1.0);
        let a_vocals = auto.lane(Deck::A, Stem::Vocals).unwrap();
        assert_eq!(a_vocals.gain_at(32.0), 0.0);
    }

    #[test]
    fn test_detects_bass_overlap() {
        let mut auto = StemAutomation::stem_blend(8, false);
        // let A's bass ride to the end: overlaps B's bass for most of the second half
        auto.lanes[0] = AutomationLane::new(Deck::A, Stem::Bass, &[(0.0, 1.0), (32.0, 0.0)]);
        let overlap = auto.bass_overlap_beats().unwrap();
        assert!(overlap > 10.0, "{overlap}");
        assert!(matches!(auto.validate(), Err(AutomationError::BassOverlap(_))));
    }

    #[test]
    fn test_small_overlap_is_tolerated() {
        let mut auto = StemAutomation::stem_blend(8, false);
        // A's bass fades over two beats after B's bass arrives at beat 16
        auto.lanes[0] = AutomationLane::new(
            Deck::A,
            Stem::Bass,
            &[(0.0, 1.0), (16.0, 1.0), (18.0, 0.0), (32.0, 0.0)],
        );
        let overlap = auto.bass_overlap_beats().unwrap();
        assert!((overlap - 2.0).abs() < 1e-9, "{overlap}");
        assert!(auto.validate().is_ok());
    }

    #[test]
    fn test_missing_lane() {
        let mut auto = StemAutomation::stem_blend(8, false);
        auto.lanes.retain(|l| !(l.deck == Deck::B && l.stem == Stem::Bass));
        assert_eq!(
            auto.validate(),
            Err(AutomationError::MissingLane { deck: Deck::B, stem: Stem::Bass })
        );
    }
}
