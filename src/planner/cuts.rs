//! Structural boundaries and phrase-aligned cut selection.
//!
//! The cut point is where the outgoing track is fully gone. It always lands
//! on a structural boundary: the end of a drop, the start of the outro, or
//! the end of the track. Blend lengths are whole multiples of four bars
//! counted back from the cut.

use crate::analysis::{SectionLabel, TrackAnalysis};

/// Bars per phrase when a track carries no structure at all.
pub const FALLBACK_PHRASE_BARS: u32 = 16;

/// Beats per bar; every track is assumed to be in 4/4.
pub const BEATS_PER_BAR: u32 = 4;

/// Slack for ms rounding when converting durations back to bars.
const ROUNDING_SLACK_MS: f64 = 1.0;

pub fn bar_ms(bpm: f64) -> f64 {
    f64::from(BEATS_PER_BAR) * 60_000.0 / bpm
}

pub fn bars_to_ms(bars: u32, bpm: f64) -> u64 {
    (f64::from(bars) * bar_ms(bpm)).round() as u64
}

/// Round down to a multiple of four bars.
pub fn floor_to_phrase(bars: u32) -> u32 {
    bars - bars % 4
}

/// Largest multiple of four bars that fits in `ms` at `bpm`.
pub fn phrase_bars_within(ms: u64, bpm: f64) -> u32 {
    let bars = ((ms as f64 + ROUNDING_SLACK_MS) / bar_ms(bpm)).floor();
    floor_to_phrase(bars.clamp(0.0, f64::from(u32::MAX)) as u32)
}

/// Candidate cut points for the outgoing track, sorted and deduplicated.
///
/// Tracks with no section data fall back to a phrase grid counted from the
/// first downbeat (intro start, or zero).
pub fn boundaries(track: &TrackAnalysis) -> Vec<u64> {
    let mut points: Vec<u64> = Vec::new();

    for section in &track.structure {
        match section.label {
            SectionLabel::Drop => points.push(section.end_ms),
            SectionLabel::Outro => points.push(section.start_ms),
            _ => {}
        }
    }
    if let Some(outro_start) = track.outro_start_ms {
        points.push(outro_start);
    }

    if track.structure.is_empty() && track.outro_start_ms.is_none() {
        let origin = track.intro_start_ms.unwrap_or(0);
        let step = bars_to_ms(FALLBACK_PHRASE_BARS, track.bpm).max(1);
        let mut at = origin + step;
        while at < track.duration_ms {
            points.push(at);
            at += step;
        }
    }

    points.push(track.outro_end_ms.unwrap_or(track.duration_ms));
    points.push(track.duration_ms);

    points.retain(|&p| p > 0 && p <= track.duration_ms);
    points.sort_unstable();
    points.dedup();
    points
}

pub fn is_boundary(track: &TrackAnalysis, ms: u64) -> bool {
    boundaries(track).binary_search(&ms).is_ok()
}

/// A blend cut chosen by [`choose_blend_cut`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendCut {
    pub cut_ms: u64,
    pub bars: u32,
    /// True when no boundary fit the preferred window and the blend was
    /// shortened to an earlier one.
    pub shortened: bool,
}

/// Pick the cut for a blend of `desired_bars` that may begin no earlier than
/// `anchor_ms`.
///
/// Boundaries in `[anchor + min_bars, anchor + desired_bars]` are preferred,
/// latest first. Failing that, the latest boundary between the anchor and the
/// window gives a shorter blend. Returns `None` when nothing leaves room for
/// even one phrase.
pub fn choose_blend_cut(
    boundaries: &[u64],
    anchor_ms: u64,
    min_bars: u32,
    desired_bars: u32,
    bpm: f64,
) -> Option<BlendCut> {
    let window_start = anchor_ms + bars_to_ms(min_bars, bpm);
    let window_end = anchor_ms + bars_to_ms(desired_bars, bpm);

    let in_window = boundaries
        .iter()
        .rev()
        .find(|&&b| b >= window_start.saturating_sub(1) && b <= window_end + 1);
    if let Some(&cut_ms) = in_window {
        let bars = phrase_bars_within(cut_ms - anchor_ms.min(cut_ms), bpm).min(desired_bars);
        if bars > 0 {
            return Some(BlendCut {
                cut_ms,
                bars,
                shortened: false,
            });
        }
    }

    let earlier = boundaries
        .iter()
        .rev()
        .find(|&&b| b > anchor_ms && b < window_start)?;
    let bars = phrase_bars_within(earlier - anchor_ms, bpm).min(desired_bars);
    (bars > 0).then_some(BlendCut {
        cut_ms: *earlier,
        bars,
        shortened: true,
    })
}

/// Cut for a hard cut: the first boundary at or after `preferred_ms`,
/// otherwise the latest one at or after `floor_ms`.
pub fn choose_hard_cut(boundaries: &[u64], preferred_ms: u64, floor_ms: u64) -> Option<u64> {
    let preferred = preferred_ms.max(floor_ms);
    boundaries
        .iter()
        .copied()
        .find(|&b| b >= preferred)
        .or_else(|| boundaries.iter().copied().rev().find(|&b| b >= floor_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Section;

    fn structured() -> TrackAnalysis {
        let mut t = TrackAnalysis::new("a", 120.0, None, 0.6);
        // 120 BPM: one bar = 2000 ms
        t.duration_ms = 300_000;
        t.structure = vec![
            Section { label: SectionLabel::Intro, start_ms: 0, end_ms: 32_000 },
            Section { label: SectionLabel::Drop, start_ms: 32_000, end_ms: 160_000 },
            Section { label: SectionLabel::Breakdown, start_ms: 160_000, end_ms: 192_000 },
            Section { label: SectionLabel::Drop, start_ms: 192_000, end_ms: 256_000 },
            Section { label: SectionLabel::Outro, start_ms: 256_000, end_ms: 300_000 },
        ];
        t
    }

    #[test]
    fn test_phrase_math() {
        assert_eq!(bar_ms(120.0), 2000.0);
        assert_eq!(bars_to_ms(16, 120.0), 32_000);
        assert_eq!(floor_to_phrase(15), 12);
        assert_eq!(floor_to_phrase(3), 0);
        assert_eq!(phrase_bars_within(31_000, 120.0), 12);
        assert_eq!(phrase_bars_within(31_999, 120.0), 16);
        assert_eq!(phrase_bars_within(32_000, 120.0), 16);
    }

    #[test]
    fn test_structural_boundaries() {
        let t = structured();
        assert_eq!(boundaries(&t), vec![160_000, 256_000, 300_000]);
        assert!(is_boundary(&t, 256_000));
        assert!(!is_boundary(&t, 250_000));
    }

    #[test]
    fn test_phrase_grid_fallback() {
        let mut t = TrackAnalysis::new("a", 120.0, None, 0.6);
        t.duration_ms = 100_000;
        // 16 bars at 120 BPM = 32 s
        assert_eq!(boundaries(&t), vec![32_000, 64_000, 96_000, 100_000]);
    }

    #[test]
    fn test_blend_cut_in_window() {
        let b = boundaries(&structured());
        // anchor 236 s, 8..16 bars -> window [252 s, 268 s] contains the outro start
        let cut = choose_blend_cut(&b, 236_000, 8, 16, 120.0).unwrap();
        assert_eq!(cut.cut_ms, 256_000);
        assert_eq!(cut.bars, 8);
        assert!(!cut.shortened);
    }

    #[test]
    fn test_blend_cut_shortened_to_earlier_boundary() {
        let b = boundaries(&structured());
        // anchor 240 s, 16..32 bars -> window [272 s, 304 s] holds the track end
        let cut = choose_blend_cut(&b, 240_000, 16, 32, 120.0).unwrap();
        assert_eq!(cut.cut_ms, 300_000);
        assert_eq!(cut.bars, 28);

        // anchor 244 s, window [308 s, 372 s] is past the end -> shorten to the track end
        let cut = choose_blend_cut(&b, 244_000, 32, 64, 120.0).unwrap();
        assert_eq!(cut.cut_ms, 300_000);
        assert!(cut.shortened);
        assert_eq!(cut.bars, 28);
    }

    #[test]
    fn test_blend_cut_infeasible() {
        let b = boundaries(&structured());
        // less than one phrase left before the only boundary after the anchor
        assert_eq!(choose_blend_cut(&b, 295_000, 8, 16, 120.0), None);
    }

    #[test]
    fn test_hard_cut_choice() {
        let b = boundaries(&structured());
        assert_eq!(choose_hard_cut(&b, 256_000, 0), Some(256_000));
        assert_eq!(choose_hard_cut(&b, 200_000, 0), Some(256_000));
        assert_eq!(choose_hard_cut(&b, 0, 270_000), Some(300_000));
    }
}
