//! Mix segments and their render lifecycle.
//!
//! A mix of `n` tracks is laid out as `2n - 1` segments: solo `i` at position
//! `2i`, the transition out of track `i` at `2i + 1`. Each segment owns its
//! render status behind its own lock, so callbacks for different segments
//! never contend and a claim is a compare-and-swap on one segment's status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::TrackAnalysis;
use crate::planner::{TransitionPlan, TransitionType};

#[derive(Error, Debug, PartialEq)]
pub enum SegmentError {
    #[error("no segment with id {0}")]
    NotFound(String),
    #[error("segment {id} is {from}; cannot move to {to}")]
    InvalidTransition {
        id: String,
        from: AudioStatus,
        to: AudioStatus,
    },
    #[error("segment {0} was superseded by a newer plan")]
    Cancelled(String),
    #[error("bad render callback for {id}: {message}")]
    BadCallback { id: String, message: String },
    #[error("{plans} transition plans for {tracks} tracks")]
    Layout { tracks: usize, plans: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentKind {
    Solo,
    Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl AudioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Legal render lifecycle moves. Shared with the database layer.
    pub fn can_transition_to(&self, next: AudioStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Error)
                | (Self::Error, Self::Pending)
        )
    }
}

impl std::fmt::Display for AudioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a segment plays. Two segments with equal specs render identical audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentSpec {
    #[serde(rename_all = "camelCase")]
    Solo {
        track_id: String,
        start_ms: u64,
        end_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Transition {
        from_track_id: String,
        to_track_id: String,
        plan: TransitionPlan,
    },
}

impl SegmentSpec {
    pub fn kind(&self) -> SegmentKind {
        match self {
            Self::Solo { .. } => SegmentKind::Solo,
            Self::Transition { .. } => SegmentKind::Transition,
        }
    }

    pub fn planned_duration_ms(&self) -> u64 {
        match self {
            Self::Solo { start_ms, end_ms, .. } => end_ms.saturating_sub(*start_ms),
            Self::Transition { plan, .. } => plan.duration_ms,
        }
    }
}

/// Lay out solo and transition segments for an ordered set and its plans.
///
/// Solo `i` runs from where track `i` leaves the previous transition to
/// where the next transition begins.
pub fn plan_segments(
    ordered: &[&TrackAnalysis],
    plans: &[TransitionPlan],
) -> Result<Vec<SegmentSpec>, SegmentError> {
    if plans.len() != ordered.len().saturating_sub(1) {
        return Err(SegmentError::Layout {
            tracks: ordered.len(),
            plans: plans.len(),
        });
    }

    let mut specs = Vec::with_capacity(ordered.len() * 2);
    for (i, track) in ordered.iter().enumerate() {
        let start_ms = match i {
            0 => 0,
            _ => plans[i - 1].cut_points.track_b_start_ms,
        };
        let end_ms = match plans.get(i) {
            Some(plan) => plan.cut_points.track_a_mix_start_ms,
            None => track.duration_ms,
        };
        specs.push(SegmentSpec::Solo {
            track_id: track.track_id.clone(),
            start_ms,
            end_ms: end_ms.max(start_ms),
        });
        if let Some(plan) = plans.get(i) {
            specs.push(SegmentSpec::Transition {
                from_track_id: track.track_id.clone(),
                to_track_id: ordered[i + 1].track_id.clone(),
                plan: plan.clone(),
            });
        }
    }
    Ok(specs)
}

/// Number of leading segments two layouts share.
pub fn stable_prefix_len(old: &[SegmentSpec], new: &[SegmentSpec]) -> usize {
    old.iter().zip(new).take_while(|(a, b)| a == b).count()
}

/// Mutable render state of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRuntime {
    pub status: AudioStatus,
    pub audio_file_path: Option<String>,
    /// Measured length of the rendered artifact.
    pub audio_duration_ms: Option<u64>,
    pub error: Option<String>,
    pub attempts: u32,
}

impl Default for SegmentRuntime {
    fn default() -> Self {
        Self {
            status: AudioStatus::Pending,
            audio_file_path: None,
            audio_duration_ms: None,
            error: None,
            attempts: 0,
        }
    }
}

#[derive(Debug)]
pub struct SegmentCell {
    id: String,
    spec: SegmentSpec,
    cancelled: AtomicBool,
    runtime: Mutex<SegmentRuntime>,
}

impl SegmentCell {
    pub fn new(id: impl Into<String>, spec: SegmentSpec) -> Self {
        Self::with_runtime(id, spec, SegmentRuntime::default())
    }

    /// Rebuild a cell from stored state.
    pub fn with_runtime(id: impl Into<String>, spec: SegmentSpec, runtime: SegmentRuntime) -> Self {
        Self {
            id: id.into(),
            spec,
            cancelled: AtomicBool::new(false),
            runtime: Mutex::new(runtime),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &SegmentSpec {
        &self.spec
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, SegmentRuntime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn runtime(&self) -> SegmentRuntime {
        self.lock().clone()
    }

    pub fn status(&self) -> AudioStatus {
        self.lock().status
    }

    /// Measured duration once rendered, planned duration before.
    pub fn duration_ms(&self) -> u64 {
        let rt = self.lock();
        match (rt.status, rt.audio_duration_ms) {
            (AudioStatus::Completed, Some(ms)) => ms,
            _ => self.spec.planned_duration_ms(),
        }
    }

    /// Completed, or failed while still holding an earlier artifact.
    pub fn is_playable(&self) -> bool {
        let rt = self.lock();
        match rt.status {
            AudioStatus::Completed => true,
            AudioStatus::Error => rt.audio_file_path.is_some(),
            _ => false,
        }
    }

    /// Mark superseded. Late results for this segment are discarded.
    pub fn cancel(&self) {
        let _guard = self.lock();
        self.cancelled.store(true, Ordering::Release);
    }

    fn advance(
        &self,
        to: AudioStatus,
        apply: impl FnOnce(&mut SegmentRuntime),
    ) -> Result<(), SegmentError> {
        let mut rt = self.lock();
        if self.cancelled.load(Ordering::Acquire) {
            return Err(SegmentError::Cancelled(self.id.clone()));
        }
        if !rt.status.can_transition_to(to) {
            return Err(SegmentError::InvalidTransition {
                id: self.id.clone(),
                from: rt.status,
                to,
            });
        }
        rt.status = to;
        apply(&mut rt);
        Ok(())
    }

    /// PENDING -> PROCESSING. Exactly one concurrent caller wins.
    pub fn claim(&self) -> Result<(), SegmentError> {
        self.advance(AudioStatus::Processing, |rt| {
            rt.attempts += 1;
            rt.error = None;
        })
    }

    pub fn complete(&self, audio_file_path: String, duration_ms: u64) -> Result<(), SegmentError> {
        self.advance(AudioStatus::Completed, |rt| {
            rt.audio_file_path = Some(audio_file_path);
            rt.audio_duration_ms = Some(duration_ms);
            rt.error = None;
        })
    }

    /// PROCESSING -> ERROR; any earlier artifact stays referenced.
    pub fn fail(&self, error: String) -> Result<(), SegmentError> {
        self.advance(AudioStatus::Error, |rt| rt.error = Some(error))
    }

    pub fn retry(&self) -> Result<(), SegmentError> {
        self.advance(AudioStatus::Pending, |_| {})
    }
}

/// Result report from the render worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderCallback {
    pub segment_id: String,
    pub status: AudioStatus,
    #[serde(default)]
    pub audio_file_path: Option<String>,
    /// Signed so a worker reporting a negative length is caught.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Applied(AudioStatus),
    /// The segment was superseded; nothing changed.
    Discarded,
}

impl RenderCallback {
    /// Apply to a segment cell.
    pub fn apply_to(&self, cell: &SegmentCell) -> Result<CallbackOutcome, SegmentError> {
        let bad = |message: &str| SegmentError::BadCallback {
            id: self.segment_id.clone(),
            message: message.to_string(),
        };
        if let Some(ms) = self.duration_ms
            && ms < 0
        {
            return Err(bad("negative duration"));
        }
        if cell.is_cancelled() {
            log::debug!("Discarding late {} callback for {}", self.status, self.segment_id);
            return Ok(CallbackOutcome::Discarded);
        }

        let result = match self.status {
            AudioStatus::Processing => cell.claim(),
            AudioStatus::Completed => {
                let path = self
                    .audio_file_path
                    .clone()
                    .ok_or_else(|| bad("completed without an audio file"))?;
                let duration = self
                    .duration_ms
                    .map_or_else(|| cell.spec().planned_duration_ms(), |ms| ms as u64);
                cell.complete(path, duration)
            }
            AudioStatus::Error => cell.fail(
                self.error
                    .clone()
                    .unwrap_or_else(|| "render failed".to_string()),
            ),
            AudioStatus::Pending => return Err(bad("pending is not a render result")),
        };

        match result {
            Ok(()) => Ok(CallbackOutcome::Applied(self.status)),
            // cancelled between the check above and taking the lock
            Err(SegmentError::Cancelled(_)) => Ok(CallbackOutcome::Discarded),
            Err(e) => Err(e),
        }
    }
}

/// Serializable view of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixSegment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition_type: Option<TransitionType>,
    /// Where the segment starts in the finished mix.
    pub offset_ms: u64,
    pub duration_ms: u64,
    pub audio_status: AudioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderProgress {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
}

impl RenderProgress {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.error
    }

    pub fn fraction_complete(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.completed as f64 / total as f64,
        }
    }
}

/// The segments of one plan, in playback order.
#[derive(Debug, Clone, Default)]
pub struct MixTimeline {
    generation: u64,
    segments: Vec<Arc<SegmentCell>>,
}

impl MixTimeline {
    pub fn segment_id(generation: u64, position: usize) -> String {
        format!("g{generation}-s{position}")
    }

    /// Fresh timeline with every segment pending.
    pub fn new(generation: u64, specs: Vec<SegmentSpec>) -> Self {
        let segments = specs
            .into_iter()
            .enumerate()
            .map(|(position, spec)| {
                Arc::new(SegmentCell::new(Self::segment_id(generation, position), spec))
            })
            .collect();
        Self {
            generation,
            segments,
        }
    }

    /// Timeline from cells restored elsewhere (the database).
    pub fn from_cells(generation: u64, segments: Vec<Arc<SegmentCell>>) -> Self {
        Self {
            generation,
            segments,
        }
    }

    /// New timeline for `specs` that keeps this timeline's segments up to the
    /// first difference and cancels the rest. Returns the kept count.
    pub fn replan(&self, generation: u64, specs: Vec<SegmentSpec>) -> (Self, usize) {
        let old_specs: Vec<SegmentSpec> = self.segments.iter().map(|c| c.spec().clone()).collect();
        let keep = stable_prefix_len(&old_specs, &specs);

        for cell in &self.segments[keep..] {
            cell.cancel();
        }
        let mut segments: Vec<Arc<SegmentCell>> = self.segments[..keep].to_vec();
        segments.extend(specs.into_iter().enumerate().skip(keep).map(|(position, spec)| {
            Arc::new(SegmentCell::new(Self::segment_id(generation, position), spec))
        }));

        log::info!(
            "Re-planned mix: kept {keep} segments, regenerated {}",
            segments.len() - keep
        );
        (
            Self {
                generation,
                segments,
            },
            keep,
        )
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn cells(&self) -> &[Arc<SegmentCell>] {
        &self.segments
    }

    pub fn get(&self, id: &str) -> Option<&Arc<SegmentCell>> {
        self.segments.iter().find(|c| c.id() == id)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.segments.iter().position(|c| c.id() == id)
    }

    fn require(&self, id: &str) -> Result<&Arc<SegmentCell>, SegmentError> {
        self.get(id).ok_or_else(|| SegmentError::NotFound(id.to_string()))
    }

    pub fn claim(&self, id: &str) -> Result<(), SegmentError> {
        self.require(id)?.claim()
    }

    pub fn retry(&self, id: &str) -> Result<(), SegmentError> {
        self.require(id)?.retry()
    }

    pub fn apply_callback(
        &self,
        callback: &RenderCallback,
    ) -> Result<CallbackOutcome, SegmentError> {
        callback.apply_to(self.require(&callback.segment_id)?)
    }

    /// First pending segment in playback order.
    pub fn next_pending(&self) -> Option<&Arc<SegmentCell>> {
        self.segments
            .iter()
            .find(|c| c.status() == AudioStatus::Pending)
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.segments.iter().map(|c| c.duration_ms()).sum()
    }

    pub fn segments(&self) -> Vec<MixSegment> {
        let mut offset_ms = 0;
        self.segments
            .iter()
            .enumerate()
            .map(|(position, cell)| {
                let rt = cell.runtime();
                let duration_ms = cell.duration_ms();
                let (track_id, start_ms, end_ms, transition_type) = match cell.spec() {
                    SegmentSpec::Solo {
                        track_id,
                        start_ms,
                        end_ms,
                    } => (Some(track_id.clone()), Some(*start_ms), Some(*end_ms), None),
                    SegmentSpec::Transition { plan, .. } => {
                        (None, None, None, Some(plan.transition_type))
                    }
                };
                let segment = MixSegment {
                    id: cell.id().to_string(),
                    kind: cell.spec().kind(),
                    position,
                    track_id,
                    start_ms,
                    end_ms,
                    transition_type,
                    offset_ms,
                    duration_ms,
                    audio_status: rt.status,
                    audio_file_path: rt.audio_file_path,
                    error: rt.error,
                };
                offset_ms += duration_ms;
                segment
            })
            .collect()
    }

    pub fn playable_segments(&self) -> Vec<MixSegment> {
        let playable: Vec<bool> = self.segments.iter().map(|c| c.is_playable()).collect();
        self.segments()
            .into_iter()
            .zip(playable)
            .filter_map(|(s, ok)| ok.then_some(s))
            .collect()
    }

    /// Length of the mix that can play from the top without a gap.
    pub fn playable_prefix_ms(&self) -> u64 {
        self.segments
            .iter()
            .take_while(|c| c.is_playable())
            .map(|c| c.duration_ms())
            .sum()
    }

    pub fn progress(&self) -> RenderProgress {
        let mut progress = RenderProgress::default();
        for cell in &self.segments {
            match cell.status() {
                AudioStatus::Pending => progress.pending += 1,
                AudioStatus::Processing => progress.processing += 1,
                AudioStatus::Completed => progress.completed += 1,
                AudioStatus::Error => progress.error += 1,
            }
        }
        progress
    }

    pub fn is_complete(&self) -> bool {
        self.segments
            .iter()
            .all(|c| c.status() == AudioStatus::Completed)
    }

    /// Status by segment ID, for persisting.
    pub fn statuses(&self) -> HashMap<String, AudioStatus> {
        self.segments
            .iter()
            .map(|c| (c.id().to_string(), c.status()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camelot::CamelotKey;
    use crate::compatibility::Scorer;
    use crate::curve::SetPhase;
    use crate::planner::{PlanContext, TransitionPlanner};

    fn tracks() -> Vec<TrackAnalysis> {
        vec![
            TrackAnalysis::new("t1", 126.0, CamelotKey::parse("8A"), 0.5),
            TrackAnalysis::new("t2", 125.0, CamelotKey::parse("8A"), 0.6),
            TrackAnalysis::new("t3", 140.0, CamelotKey::parse("2B"), 0.9),
        ]
    }

    fn plans(ordered: &[&TrackAnalysis]) -> Vec<TransitionPlan> {
        let scorer = Scorer::default();
        let planner = TransitionPlanner::default();
        let mut entry = 0;
        let mut out = Vec::new();
        for (i, pair) in ordered.windows(2).enumerate() {
            let score = scorer.score(pair[0], pair[1]);
            let plan = planner.plan(&PlanContext {
                from: pair[0],
                to: pair[1],
                score: &score,
                from_phase: SetPhase::Build,
                phase: SetPhase::Peak,
                position: i,
                from_entry_ms: entry,
            });
            entry = plan.cut_points.track_b_start_ms;
            out.push(plan);
        }
        out
    }

    fn timeline() -> MixTimeline {
        let tracks = tracks();
        let ordered: Vec<&TrackAnalysis> = tracks.iter().collect();
        let specs = plan_segments(&ordered, &plans(&ordered)).unwrap();
        MixTimeline::new(1, specs)
    }

    fn render(timeline: &MixTimeline, position: usize) {
        let cell = &timeline.cells()[position];
        cell.claim().unwrap();
        cell.complete(format!("/renders/{position}.wav"), cell.spec().planned_duration_ms())
            .unwrap();
    }

    #[test]
    fn test_lifecycle_rules() {
        use AudioStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(Error.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Error.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_layout() {
        let timeline = timeline();
        let segments = timeline.segments();
        assert_eq!(segments.len(), 5);
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.position, i);
            let expected = if i % 2 == 0 { SegmentKind::Solo } else { SegmentKind::Transition };
            assert_eq!(s.kind, expected);
        }
        // offsets concatenate with no gaps or overlaps
        for pair in segments.windows(2) {
            assert_eq!(pair[0].offset_ms + pair[0].duration_ms, pair[1].offset_ms);
        }
        let sum: u64 = segments.iter().map(|s| s.duration_ms).sum();
        assert_eq!(sum, timeline.total_duration_ms());
        assert_eq!(segments[1].transition_type, Some(TransitionType::StemBlend));
        assert_eq!(segments[3].transition_type, Some(TransitionType::HardCut));
    }

    #[test]
    fn test_layout_mismatch() {
        let tracks = tracks();
        let ordered: Vec<&TrackAnalysis> = tracks.iter().collect();
        assert_eq!(
            plan_segments(&ordered, &[]),
            Err(SegmentError::Layout { tracks: 3, plans: 0 })
        );
        assert_eq!(plan_segments(&[], &[]), Ok(Vec::new()));
    }

    #[test]
    fn test_error_in_the_middle_keeps_prefix_playable() {
        let timeline = timeline();
        for p in 0..3 {
            render(&timeline, p);
        }
        let third = &timeline.cells()[3];
        third.claim().unwrap();
        third.fail("renderer crashed".into()).unwrap();

        let statuses: Vec<AudioStatus> =
            timeline.segments().iter().map(|s| s.audio_status).collect();
        assert_eq!(
            statuses,
            vec![
                AudioStatus::Completed,
                AudioStatus::Completed,
                AudioStatus::Completed,
                AudioStatus::Error,
                AudioStatus::Pending,
            ]
        );
        let playable: Vec<usize> =
            timeline.playable_segments().iter().map(|s| s.position).collect();
        assert_eq!(playable, vec![0, 1, 2]);
        let prefix: u64 = timeline.segments()[..3].iter().map(|s| s.duration_ms).sum();
        assert_eq!(timeline.playable_prefix_ms(), prefix);
        assert!(!timeline.is_complete());

        // retry puts it back in the queue
        timeline.retry(third.id()).unwrap();
        assert_eq!(third.status(), AudioStatus::Pending);
        assert_eq!(timeline.next_pending().unwrap().id(), third.id());
    }

    #[test]
    fn test_failure_keeps_prior_artifact() {
        let timeline = timeline();
        let cell = &timeline.cells()[0];
        cell.claim().unwrap();
        cell.complete("/renders/v1.wav".into(), 1000).unwrap();
        // completed segments cannot be re-rendered in place
        assert!(matches!(cell.claim(), Err(SegmentError::InvalidTransition { .. })));

        let cell = SegmentCell::with_runtime(
            "x",
            cell.spec().clone(),
            SegmentRuntime {
                status: AudioStatus::Processing,
                audio_file_path: Some("/renders/v1.wav".into()),
                ..Default::default()
            },
        );
        cell.fail("boom".into()).unwrap();
        assert_eq!(cell.runtime().audio_file_path.as_deref(), Some("/renders/v1.wav"));
        assert!(cell.is_playable());
    }

    #[test]
    fn test_completion_updates_total() {
        let timeline = timeline();
        let before = timeline.total_duration_ms();
        let cell = &timeline.cells()[0];
        let planned = cell.spec().planned_duration_ms();
        cell.claim().unwrap();
        cell.complete("/renders/0.wav".into(), planned + 250).unwrap();
        assert_eq!(timeline.total_duration_ms(), before + 250);
    }

    #[test]
    fn test_callbacks() {
        let timeline = timeline();
        let id = timeline.cells()[1].id().to_string();
        let callback = |status, path: Option<&str>, duration: Option<i64>| RenderCallback {
            segment_id: id.clone(),
            status,
            audio_file_path: path.map(String::from),
            duration_ms: duration,
            error: None,
        };

        assert!(matches!(
            timeline.apply_callback(&callback(AudioStatus::Completed, Some("/a.wav"), Some(-5))),
            Err(SegmentError::BadCallback { .. })
        ));
        assert!(matches!(
            timeline.apply_callback(&callback(AudioStatus::Completed, Some("/a.wav"), None)),
            Err(SegmentError::InvalidTransition { .. })
        ));
        assert_eq!(
            timeline.apply_callback(&callback(AudioStatus::Processing, None, None)),
            Ok(CallbackOutcome::Applied(AudioStatus::Processing))
        );
        assert!(matches!(
            timeline.apply_callback(&callback(AudioStatus::Completed, None, Some(10))),
            Err(SegmentError::BadCallback { .. })
        ));
        assert_eq!(
            timeline.apply_callback(&callback(
                AudioStatus::Completed,
                Some("/a.wav"),
                Some(12_000)
            )),
            Ok(CallbackOutcome::Applied(AudioStatus::Completed))
        );
        assert_eq!(timeline.cells()[1].duration_ms(), 12_000);

        let unknown = RenderCallback {
            segment_id: "nope".into(),
            ..callback(AudioStatus::Error, None, None)
        };
        assert_eq!(
            timeline.apply_callback(&unknown),
            Err(SegmentError::NotFound("nope".into()))
        );
    }

    #[test]
    fn test_only_one_claim_wins() {
        let timeline = timeline();
        let cell = timeline.cells()[2].clone();
        let wins: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| cell.claim().is_ok())).collect();
            handles.into_iter().map(|h| usize::from(h.join().unwrap())).sum()
        });
        assert_eq!(wins, 1);
        assert_eq!(cell.runtime().attempts, 1);
    }

    #[test]
    fn test_parallel_callbacks_on_different_segments() {
        let timeline = timeline();
        std::thread::scope(|s| {
            for cell in timeline.cells() {
                s.spawn(move || {
                    cell.claim().unwrap();
                    cell.complete(format!("/r/{}.wav", cell.id()), 1_000).unwrap();
                });
            }
        });
        assert!(timeline.is_complete());
        assert_eq!(timeline.total_duration_ms(), 5_000);
        assert_eq!(timeline.progress().fraction_complete(), 1.0);
    }

    #[test]
    fn test_replan_keeps_stable_prefix_and_cancels_the_rest() {
        let timeline = timeline();
        render(&timeline, 0);
        render(&timeline, 1);
        timeline.cells()[3].claim().unwrap();

        let tracks = tracks();
        let t4 = TrackAnalysis::new("t4", 124.0, CamelotKey::parse("9A"), 0.7);
        let ordered = vec![&tracks[0], &tracks[1], &t4];
        let specs = plan_segments(&ordered, &plans(&ordered)).unwrap();
        let (next, kept) = timeline.replan(2, specs);

        // t1 solo and t1 -> t2 are unchanged
        assert!(kept >= 2);
        assert_eq!(next.len(), 5);
        for p in 0..kept {
            assert!(Arc::ptr_eq(&next.cells()[p], &timeline.cells()[p]));
        }
        assert_eq!(next.cells()[0].status(), AudioStatus::Completed);
        for cell in &timeline.cells()[kept..] {
            assert!(cell.is_cancelled());
        }
        for cell in &next.cells()[kept..] {
            assert_eq!(cell.status(), AudioStatus::Pending);
            assert!(cell.id().starts_with("g2-"));
        }

        // the in-flight render of the superseded segment is dropped
        let late = RenderCallback {
            segment_id: timeline.cells()[3].id().to_string(),
            status: AudioStatus::Completed,
            audio_file_path: Some("/late.wav".into()),
            duration_ms: Some(5),
            error: None,
        };
        assert_eq!(late.apply_to(&timeline.cells()[3]), Ok(CallbackOutcome::Discarded));
        assert_eq!(timeline.cells()[3].status(), AudioStatus::Processing);
    }

    #[test]
    fn test_stable_prefix_len() {
        let solo = |id: &str| SegmentSpec::Solo {
            track_id: id.into(),
            start_ms: 0,
            end_ms: 10,
        };
        assert_eq!(stable_prefix_len(&[solo("a"), solo("b")], &[solo("a"), solo("c")]), 1);
        assert_eq!(stable_prefix_len(&[solo("a")], &[solo("a"), solo("b")]), 1);
        assert_eq!(stable_prefix_len(&[], &[solo("a")]), 0);
    }
}
