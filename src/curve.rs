//! Set energy curve: where in the set we are, and what energy and transition
//! style that position calls for.
//!
//! Both the orderer and the planner read phase boundaries from here and
//! nowhere else.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::planner::TransitionType;

#[derive(Error, Debug, PartialEq)]
pub enum PolicyError {
    #[error("curve needs exactly one band per phase in warmup, build, peak, cooldown order")]
    PhaseLayout,
    #[error("first band must start at 0.0, got {0}")]
    FirstStart(f64),
    #[error("band {phase} starts at {start}, not after the previous band")]
    StartOrder { phase: SetPhase, start: f64 },
    #[error("band {phase} has energy range {min}..{max}")]
    EnergyRange { phase: SetPhase, min: f64, max: f64 },
    #[error("band {phase} has duration range {min}..{max} bars (want multiples of 4, min <= max)")]
    DurationRange { phase: SetPhase, min: u32, max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetPhase {
    Warmup,
    Build,
    Peak,
    Cooldown,
}

impl SetPhase {
    pub const ALL: [SetPhase; 4] = [Self::Warmup, Self::Build, Self::Peak, Self::Cooldown];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warmup => "warmup",
            Self::Build => "build",
            Self::Peak => "peak",
            Self::Cooldown => "cooldown",
        }
    }
}

impl std::fmt::Display for SetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which direction of energy change a phase rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyBias {
    Neutral,
    Rising,
    Falling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseBand {
    pub phase: SetPhase,
    /// Inclusive lower bound of the position fraction.
    pub start: f64,
    pub min_energy: f64,
    pub max_energy: f64,
    pub bias: EnergyBias,
    /// Preferred blend length in bars.
    pub min_bars: u32,
    pub max_bars: u32,
    /// Transition styles this phase welcomes.
    pub styles: Vec<TransitionType>,
}

/// The band a position falls into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyTarget {
    pub phase: SetPhase,
    pub min_energy: f64,
    pub max_energy: f64,
}

impl EnergyTarget {
    /// Distance from `energy` to the band (0 inside it).
    pub fn distance(&self, energy: f64) -> f64 {
        if energy < self.min_energy {
            self.min_energy - energy
        } else if energy > self.max_energy {
            energy - self.max_energy
        } else {
            0.0
        }
    }

    pub fn within(&self, energy: f64, tolerance: f64) -> bool {
        self.distance(energy) <= tolerance + 1e-9
    }
}

/// Distance from a band at which proximity bottoms out.
const PROXIMITY_SPAN: f64 = 0.5;
const PROXIMITY_FLOOR: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetCurvePolicy {
    bands: Vec<PhaseBand>,
}

impl Default for SetCurvePolicy {
    fn default() -> Self {
        use TransitionType::*;
        Self {
            bands: vec![
                PhaseBand {
                    phase: SetPhase::Warmup,
                    start: 0.0,
                    min_energy: 0.3,
                    max_energy: 0.5,
                    bias: EnergyBias::Neutral,
                    min_bars: 32,
                    max_bars: 64,
                    styles: vec![StemBlend, Crossfade, FilterSweep],
                },
                PhaseBand {
                    phase: SetPhase::Build,
                    start: 0.20,
                    min_energy: 0.5,
                    max_energy: 0.7,
                    bias: EnergyBias::Rising,
                    min_bars: 16,
                    max_bars: 32,
                    styles: vec![StemBlend, Crossfade, FilterSweep, EchoOut],
                },
                PhaseBand {
                    phase: SetPhase::Peak,
                    start: 0.50,
                    min_energy: 0.7,
                    max_energy: 0.9,
                    bias: EnergyBias::Rising,
                    min_bars: 8,
                    max_bars: 16,
                    styles: vec![StemBlend, Crossfade, HardCut, DoubleDrop, EchoOut],
                },
                PhaseBand {
                    phase: SetPhase::Cooldown,
                    start: 0.80,
                    min_energy: 0.3,
                    max_energy: 0.5,
                    bias: EnergyBias::Falling,
                    min_bars: 32,
                    max_bars: 64,
                    styles: vec![StemBlend, Crossfade, EchoOut, FilterSweep],
                },
            ],
        }
    }
}

impl SetCurvePolicy {
    /// Build a policy from a custom band table.
    pub fn new(bands: Vec<PhaseBand>) -> Result<Self, PolicyError> {
        let policy = Self { bands };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let phases: Vec<SetPhase> = self.bands.iter().map(|b| b.phase).collect();
        if phases != SetPhase::ALL {
            return Err(PolicyError::PhaseLayout);
        }
        if self.bands[0].start != 0.0 {
            return Err(PolicyError::FirstStart(self.bands[0].start));
        }
        for pair in self.bands.windows(2) {
            if pair[1].start <= pair[0].start || pair[1].start > 1.0 {
                return Err(PolicyError::StartOrder {
                    phase: pair[1].phase,
                    start: pair[1].start,
                });
            }
        }
        for band in &self.bands {
            let energy_ok = (0.0..=1.0).contains(&band.min_energy)
                && (0.0..=1.0).contains(&band.max_energy)
                && band.min_energy <= band.max_energy;
            if !energy_ok {
                return Err(PolicyError::EnergyRange {
                    phase: band.phase,
                    min: band.min_energy,
                    max: band.max_energy,
                });
            }
            if band.min_bars > band.max_bars || band.min_bars % 4 != 0 || band.max_bars % 4 != 0 {
                return Err(PolicyError::DurationRange {
                    phase: band.phase,
                    min: band.min_bars,
                    max: band.max_bars,
                });
            }
        }
        Ok(())
    }

    pub fn bands(&self) -> &[PhaseBand] {
        &self.bands
    }

    pub fn band(&self, phase: SetPhase) -> &PhaseBand {
        // validate() guarantees one band per phase in enum order
        &self.bands[phase as usize]
    }

    /// Fraction through the set for a slot: `index / (count - 1)`.
    pub fn position_fraction(index: usize, track_count: usize) -> f64 {
        if track_count <= 1 {
            0.0
        } else {
            (index as f64 / (track_count - 1) as f64).clamp(0.0, 1.0)
        }
    }

    pub fn target_energy_band(&self, position_fraction: f64, track_count: usize) -> EnergyTarget {
        let band = if track_count <= 1 {
            &self.bands[0]
        } else {
            let fraction = position_fraction.clamp(0.0, 1.0);
            self.bands
                .iter()
                .rev()
                .find(|b| fraction >= b.start)
                .unwrap_or(&self.bands[0])
        };
        EnergyTarget {
            phase: band.phase,
            min_energy: band.min_energy,
            max_energy: band.max_energy,
        }
    }

    /// Target band for the slot at `index` in a set of `track_count`.
    pub fn target_for_slot(&self, index: usize, track_count: usize) -> EnergyTarget {
        self.target_energy_band(Self::position_fraction(index, track_count), track_count)
    }

    pub fn phase_at(&self, index: usize, track_count: usize) -> SetPhase {
        self.target_for_slot(index, track_count).phase
    }

    /// How well `energy` sits in `target`: 1.0 inside the band, falling
    /// linearly with distance to a small floor.
    pub fn energy_proximity(target: &EnergyTarget, energy: f64) -> f64 {
        (1.0 - target.distance(energy) / PROXIMITY_SPAN).max(PROXIMITY_FLOOR)
    }

    /// Preferred blend range in bars for a phase.
    pub fn duration_range(&self, phase: SetPhase) -> (u32, u32) {
        let band = self.band(phase);
        (band.min_bars, band.max_bars)
    }

    pub fn allows_style(&self, phase: SetPhase, style: TransitionType) -> bool {
        self.band(phase).styles.contains(&style)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SetCurvePolicy::default().validate().is_ok());
    }

    #[test]
    fn test_default_band_boundaries() {
        let p = SetCurvePolicy::default();
        assert_eq!(p.target_energy_band(0.0, 10).phase, SetPhase::Warmup);
        assert_eq!(p.target_energy_band(0.19, 10).phase, SetPhase::Warmup);
        assert_eq!(p.target_energy_band(0.20, 10).phase, SetPhase::Build);
        assert_eq!(p.target_energy_band(0.49, 10).phase, SetPhase::Build);
        assert_eq!(p.target_energy_band(0.50, 10).phase, SetPhase::Peak);
        assert_eq!(p.target_energy_band(0.79, 10).phase, SetPhase::Peak);
        assert_eq!(p.target_energy_band(0.80, 10).phase, SetPhase::Cooldown);
        assert_eq!(p.target_energy_band(1.0, 10).phase, SetPhase::Cooldown);

        let peak = p.target_energy_band(0.6, 10);
        assert_eq!((peak.min_energy, peak.max_energy), (0.7, 0.9));
    }

    #[test]
    fn test_slots() {
        let p = SetCurvePolicy::default();
        assert_eq!(SetCurvePolicy::position_fraction(0, 1), 0.0);
        assert_eq!(SetCurvePolicy::position_fraction(2, 3), 1.0);
        assert_eq!(p.phase_at(0, 3), SetPhase::Warmup);
        assert_eq!(p.phase_at(1, 3), SetPhase::Peak);
        assert_eq!(p.phase_at(2, 3), SetPhase::Cooldown);
        assert_eq!(p.phase_at(0, 1), SetPhase::Warmup);
    }

    #[test]
    fn test_proximity() {
        let p = SetCurvePolicy::default();
        let peak = p.target_energy_band(0.6, 10);
        assert_eq!(SetCurvePolicy::energy_proximity(&peak, 0.8), 1.0);
        assert!((SetCurvePolicy::energy_proximity(&peak, 0.6) - 0.8).abs() < 1e-9);
        assert_eq!(SetCurvePolicy::energy_proximity(&peak, 0.0), PROXIMITY_FLOOR);
        assert!(peak.within(0.6, 0.1));
        assert!(!peak.within(0.55, 0.1));
    }

    #[test]
    fn test_duration_ranges() {
        let p = SetCurvePolicy::default();
        assert_eq!(p.duration_range(SetPhase::Warmup), (32, 64));
        assert_eq!(p.duration_range(SetPhase::Build), (16, 32));
        assert_eq!(p.duration_range(SetPhase::Peak), (8, 16));
        assert_eq!(p.duration_range(SetPhase::Cooldown), (32, 64));
    }

    #[test]
    fn test_rejects_bad_tables() {
        let mut bands = SetCurvePolicy::default().bands().to_vec();
        bands.swap(1, 2);
        assert_eq!(SetCurvePolicy::new(bands), Err(PolicyError::PhaseLayout));

        let mut bands = SetCurvePolicy::default().bands().to_vec();
        bands[2].start = 0.1;
        assert!(matches!(
            SetCurvePolicy::new(bands),
            Err(PolicyError::StartOrder { phase: SetPhase::Peak, .. })
        ));

        let mut bands = SetCurvePolicy::default().bands().to_vec();
        bands[1].min_bars = 10;
        assert!(matches!(
            SetCurvePolicy::new(bands),
            Err(PolicyError::DurationRange { .. })
        ));
    }
}
