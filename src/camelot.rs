//! Camelot wheel keys and the harmonic relationships between them.
//!
//! The wheel has 12 positions; `A` keys are minor, `B` keys are major. Keys
//! one step apart on the same ring, or at the same position on the other
//! ring, share most of their notes and blend cleanly.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyMode {
    /// Minor ring
    A,
    /// Major ring
    B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CamelotKey {
    number: u8,
    mode: KeyMode,
}

/// How two keys relate on the wheel, from the outgoing key's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarmonicRelation {
    /// Same code
    Identical,
    /// ±1 on the same ring
    Adjacent,
    /// Same number, other ring
    Relative,
    /// ±1 on the other ring
    Diagonal,
    /// +2 clockwise on the same ring
    EnergyBoost,
    /// Anything further away; carries the wheel distance (2..=6)
    Distant(u8),
}

/// `8A`, `08a`, `12B`
static CAMELOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^0?(?P<num>[1-9]|1[0-2])\s*(?P<mode>[AB])$").unwrap());

/// `Am`, `A minor`, `F#m`, `Bb major`, `Dbmaj`, `C`
static STANDARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<root>[A-G])(?P<acc>#|♯|b|♭)?\s*(?P<quality>minor|min|m|major|maj)?$")
        .unwrap()
});

impl CamelotKey {
    pub fn new(number: u8, mode: KeyMode) -> Option<Self> {
        (1..=12).contains(&number).then_some(Self { number, mode })
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    /// Parse a Camelot code or a standard key name.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Self::parse_camelot(trimmed).or_else(|| Self::parse_standard(trimmed))
    }

    fn parse_camelot(raw: &str) -> Option<Self> {
        let caps = CAMELOT_RE.captures(raw)?;
        let number: u8 = caps["num"].parse().ok()?;
        let mode = if caps["mode"].eq_ignore_ascii_case("a") {
            KeyMode::A
        } else {
            KeyMode::B
        };
        Self::new(number, mode)
    }

    fn parse_standard(raw: &str) -> Option<Self> {
        let caps = STANDARD_RE.captures(raw)?;
        let root = caps["root"].to_ascii_uppercase();
        let accidental = caps.name("acc").map(|m| m.as_str());
        let quality = caps.name("quality").map(|m| m.as_str());

        // A bare lowercase "m" means minor; "M" on its own is ambiguous so we
        // only honor the spelled-out forms case-insensitively.
        let minor = match quality {
            Some("m") => true,
            Some(q) => q.to_ascii_lowercase().starts_with("min"),
            None => false,
        };

        let base = match root.as_str() {
            "C" => 0,
            "D" => 2,
            "E" => 4,
            "F" => 5,
            "G" => 7,
            "A" => 9,
            "B" => 11,
            _ => return None,
        };
        let shift: i8 = match accidental {
            Some("#") | Some("♯") => 1,
            Some("b") | Some("♭") => -1,
            _ => 0,
        };
        let pitch_class = (base as i8 + shift).rem_euclid(12) as u8;
        Some(Self::from_pitch_class(pitch_class, minor))
    }

    /// Map a pitch class (C = 0) and mode to its wheel position.
    fn from_pitch_class(pitch_class: u8, minor: bool) -> Self {
        // Moving a fifth up (+7 semitones) moves one step clockwise.
        // C major is 8B and A minor is 8A.
        let anchor = if minor { 9 } else { 0 };
        let fifths = ((pitch_class as i16 - anchor) * 7).rem_euclid(12) as u8;
        let number = (fifths + 7) % 12 + 1;
        Self {
            number,
            mode: if minor { KeyMode::A } else { KeyMode::B },
        }
    }

    /// Clockwise steps from `self` to `other` on the number ring (0..12).
    pub fn clockwise_steps(&self, other: &CamelotKey) -> u8 {
        ((other.number as i16 - self.number as i16).rem_euclid(12)) as u8
    }

    /// Shortest number distance around the wheel (0..=6), ignoring the ring.
    pub fn wheel_distance(&self, other: &CamelotKey) -> u8 {
        let cw = self.clockwise_steps(other);
        cw.min(12 - cw)
    }

    pub fn relation_to(&self, other: &CamelotKey) -> HarmonicRelation {
        let distance = self.wheel_distance(other);
        let same_ring = self.mode == other.mode;
        match (distance, same_ring) {
            (0, true) => HarmonicRelation::Identical,
            (0, false) => HarmonicRelation::Relative,
            (1, true) => HarmonicRelation::Adjacent,
            (1, false) => HarmonicRelation::Diagonal,
            (2, true) if self.clockwise_steps(other) == 2 => HarmonicRelation::EnergyBoost,
            (d, _) => HarmonicRelation::Distant(d),
        }
    }
}

impl fmt::Display for CamelotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self.mode {
            KeyMode::A => 'A',
            KeyMode::B => 'B',
        };
        write!(f, "{}{}", self.number, letter)
    }
}

impl Serialize for CamelotKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CamelotKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CamelotKey::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognized key: {raw:?}")))
    }
}

/// Score for an exact match.
pub const PERFECT_SCORE: f64 = 100.0;
/// Floor for maximally distant keys.
pub const HARMONIC_FLOOR: f64 = 20.0;

/// Harmonic sub-score (0–100) for mixing from `from` into `to`.
///
/// Symmetric in its arguments: every input is either a wheel distance or a
/// ring comparison, neither of which depends on direction.
pub fn harmonic_score(from: &CamelotKey, to: &CamelotKey) -> f64 {
    let distance = from.wheel_distance(to);
    let same_ring = from.mode == to.mode;
    match (distance, same_ring) {
        (0, true) => PERFECT_SCORE,
        (1, true) => 90.0,
        (0, false) => 85.0,
        (1, false) => 75.0,
        (d, same_ring) => {
            // 70 at two steps down to the floor at the opposite side of the wheel
            let steps = f64::from(d - 2);
            let mut score = 70.0 - steps * 12.5;
            if !same_ring {
                score -= 5.0;
            }
            score.max(HARMONIC_FLOOR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> CamelotKey {
        CamelotKey::parse(raw).unwrap()
    }

    #[test]
    fn test_parse_camelot_codes() {
        assert_eq!(key("8A"), CamelotKey::new(8, KeyMode::A).unwrap());
        assert_eq!(key("08a"), CamelotKey::new(8, KeyMode::A).unwrap());
        assert_eq!(key(" 12B "), CamelotKey::new(12, KeyMode::B).unwrap());
        assert!(CamelotKey::parse("13A").is_none());
        assert!(CamelotKey::parse("0B").is_none());
        assert!(CamelotKey::parse("").is_none());
        assert!(CamelotKey::parse("8C").is_none());
    }

    #[test]
    fn test_parse_standard_names() {
        assert_eq!(key("Am").to_string(), "8A");
        assert_eq!(key("A minor").to_string(), "8A");
        assert_eq!(key("C").to_string(), "8B");
        assert_eq!(key("C major").to_string(), "8B");
        assert_eq!(key("G").to_string(), "9B");
        assert_eq!(key("F#m").to_string(), "11A");
        assert_eq!(key("Gbm").to_string(), "11A");
        assert_eq!(key("Bb major").to_string(), "6B");
        assert_eq!(key("Dbmaj").to_string(), "3B");
        assert_eq!(key("E").to_string(), "12B");
        assert_eq!(key("B").to_string(), "1B");
        assert_eq!(key("Abm").to_string(), "1A");
        assert_eq!(key("Em").to_string(), "9A");
    }

    #[test]
    fn test_relations() {
        assert_eq!(key("8A").relation_to(&key("8A")), HarmonicRelation::Identical);
        assert_eq!(key("8A").relation_to(&key("9A")), HarmonicRelation::Adjacent);
        assert_eq!(key("1A").relation_to(&key("12A")), HarmonicRelation::Adjacent);
        assert_eq!(key("8A").relation_to(&key("8B")), HarmonicRelation::Relative);
        assert_eq!(key("8A").relation_to(&key("7B")), HarmonicRelation::Diagonal);
        assert_eq!(key("8A").relation_to(&key("10A")), HarmonicRelation::EnergyBoost);
        assert_eq!(key("10A").relation_to(&key("8A")), HarmonicRelation::Distant(2));
        assert_eq!(key("8A").relation_to(&key("2B")), HarmonicRelation::Distant(6));
    }

    #[test]
    fn test_harmonic_score_bands() {
        assert_eq!(harmonic_score(&key("8A"), &key("8A")), 100.0);
        assert_eq!(harmonic_score(&key("8A"), &key("9A")), 90.0);
        assert_eq!(harmonic_score(&key("8A"), &key("8B")), 85.0);
        assert_eq!(harmonic_score(&key("8A"), &key("9B")), 75.0);
        assert_eq!(harmonic_score(&key("8A"), &key("10A")), 70.0);
        assert_eq!(harmonic_score(&key("8A"), &key("2A")), HARMONIC_FLOOR);
        assert_eq!(harmonic_score(&key("8A"), &key("2B")), HARMONIC_FLOOR);
    }

    #[test]
    fn test_harmonic_score_symmetric_and_monotone() {
        let all: Vec<CamelotKey> = (1..=12)
            .flat_map(|n| [KeyMode::A, KeyMode::B].map(|m| CamelotKey::new(n, m).unwrap()))
            .collect();
        for a in &all {
            assert_eq!(harmonic_score(a, a), PERFECT_SCORE);
            for b in &all {
                assert_eq!(harmonic_score(a, b), harmonic_score(b, a));
                let s = harmonic_score(a, b);
                assert!((HARMONIC_FLOOR..=PERFECT_SCORE).contains(&s));
            }
        }
    }

    #[test]
    fn test_serde_as_code() {
        let k: CamelotKey = serde_json::from_str("\"F#m\"").unwrap();
        assert_eq!(serde_json::to_string(&k).unwrap(), "\"11A\"");
    }
}
