//! Per-track analysis records produced by the external analysis worker.
//!
//! The engine never mutates these; it only reads them and decides whether a
//! record is usable.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::camelot::CamelotKey;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Track {track_id}: {message}")]
    Invalid { track_id: String, message: String },
}

/// Structural section labels reported by the analysis worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionLabel {
    Intro,
    Buildup,
    Drop,
    Breakdown,
    Outro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub label: SectionLabel,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Section {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Measured attributes of one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAnalysis {
    pub track_id: String,
    pub duration_ms: u64,

    pub bpm: f64,
    #[serde(default)]
    pub bpm_confidence: Option<f64>,

    /// Camelot code or standard key name; `None` when detection failed.
    #[serde(default, alias = "camelot", deserialize_with = "lenient_key")]
    pub key: Option<CamelotKey>,
    #[serde(default)]
    pub key_confidence: Option<f64>,

    pub energy: f64,
    #[serde(default)]
    pub danceability: Option<f64>,
    /// Integrated loudness in LUFS.
    #[serde(default)]
    pub loudness: Option<f64>,

    #[serde(default)]
    pub intro_start_ms: Option<u64>,
    #[serde(default)]
    pub intro_end_ms: Option<u64>,
    #[serde(default)]
    pub outro_start_ms: Option<u64>,
    #[serde(default)]
    pub outro_end_ms: Option<u64>,

    #[serde(default)]
    pub structure: Vec<Section>,

    // Mixability
    #[serde(default)]
    pub vocal_intensity: Option<f64>,
    #[serde(default)]
    pub best_mix_in_ms: Option<u64>,
    #[serde(default)]
    pub best_mix_out_ms: Option<u64>,
    /// Longest stretch of the intro that can sit under another track.
    #[serde(default)]
    pub max_blend_in_ms: Option<u64>,
    /// Longest stretch of the outro that can sit under another track.
    #[serde(default)]
    pub max_blend_out_ms: Option<u64>,
}

impl TrackAnalysis {
    /// Minimal record, mostly for tests and fixtures.
    pub fn new(
        track_id: impl Into<String>,
        bpm: f64,
        key: Option<CamelotKey>,
        energy: f64,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            duration_ms: 360_000,
            bpm,
            bpm_confidence: None,
            key,
            key_confidence: None,
            energy,
            danceability: None,
            loudness: None,
            intro_start_ms: None,
            intro_end_ms: None,
            outro_start_ms: None,
            outro_end_ms: None,
            structure: Vec::new(),
            vocal_intensity: None,
            best_mix_in_ms: None,
            best_mix_out_ms: None,
            max_blend_in_ms: None,
            max_blend_out_ms: None,
        }
    }

    /// Check that the record is usable by the engine.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let invalid = |message: String| AnalysisError::Invalid {
            track_id: self.track_id.clone(),
            message,
        };

        if self.track_id.trim().is_empty() {
            return Err(invalid("empty track id".into()));
        }
        if self.duration_ms == 0 {
            return Err(invalid("duration must be positive".into()));
        }
        if !self.bpm.is_finite() || self.bpm <= 0.0 {
            return Err(invalid(format!("bpm {} is not a positive number", self.bpm)));
        }
        if !(0.0..=1.0).contains(&self.energy) {
            return Err(invalid(format!("energy {} outside [0, 1]", self.energy)));
        }
        for (name, value) in [
            ("bpm confidence", self.bpm_confidence),
            ("key confidence", self.key_confidence),
            ("danceability", self.danceability),
            ("vocal intensity", self.vocal_intensity),
        ] {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                return Err(invalid(format!("{name} {v} outside [0, 1]")));
            }
        }
        for (name, value) in [
            ("intro start", self.intro_start_ms),
            ("intro end", self.intro_end_ms),
            ("outro start", self.outro_start_ms),
            ("outro end", self.outro_end_ms),
            ("mix-in point", self.best_mix_in_ms),
            ("mix-out point", self.best_mix_out_ms),
        ] {
            if let Some(ms) = value
                && ms > self.duration_ms
            {
                return Err(invalid(format!(
                    "{name} at {ms} ms is past the end of the track ({} ms)",
                    self.duration_ms
                )));
            }
        }
        for (i, section) in self.structure.iter().enumerate() {
            if section.end_ms <= section.start_ms {
                return Err(invalid(format!(
                    "section {i} ({:?}) has an empty or inverted span",
                    section.label
                )));
            }
            if section.end_ms > self.duration_ms {
                return Err(invalid(format!("section {i} ends past the end of the track")));
            }
            if i > 0 && section.start_ms < self.structure[i - 1].start_ms {
                return Err(invalid(format!("section {i} is out of order")));
            }
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Milliseconds per beat at the track's own tempo.
    pub fn beat_ms(&self) -> f64 {
        60_000.0 / self.bpm
    }

    /// Combined detection confidence used for tie-breaking (0–1).
    /// An undetected key counts as zero; an unreported confidence counts as full.
    pub fn detection_confidence(&self) -> f64 {
        let bpm = self.bpm_confidence.unwrap_or(1.0);
        let key = if self.key.is_some() {
            self.key_confidence.unwrap_or(1.0)
        } else {
            0.0
        };
        (bpm + key) / 2.0
    }

    pub fn has_section(&self, label: SectionLabel) -> bool {
        self.structure.iter().any(|s| s.label == label)
    }

    /// Load a single record from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, AnalysisError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Keys the worker could not resolve ("", "unknown", ...) count as undetected
/// rather than rejecting the whole record.
fn lenient_key<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<CamelotKey>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let key = CamelotKey::parse(trimmed);
        if key.is_none() {
            log::warn!("Unrecognized key {raw:?}; treating it as undetected");
        }
        key
    }))
}

/// A track in a project, with its analysis if the worker produced one.
#[derive(Debug, Clone)]
pub struct TrackRecord {
    pub track_id: String,
    pub analysis: Option<TrackAnalysis>,
}

impl TrackRecord {
    pub fn analyzed(analysis: TrackAnalysis) -> Self {
        Self {
            track_id: analysis.track_id.clone(),
            analysis: Some(analysis),
        }
    }

    pub fn missing(track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            analysis: None,
        }
    }
}
