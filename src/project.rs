//! Projects: the ordered set, its transitions and segments, and the status
//! machine that drives them.
//!
//! Every ordering run builds a complete [`MixSnapshot`] off to the side and
//! swaps it in at once, so readers see either the old plan or the new one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{TrackAnalysis, TrackRecord};
use crate::assistant::{apply_chat_order, ChatOrderPayload};
use crate::compatibility::CompatibilityScore;
use crate::curve::SetPhase;
use crate::ordering::{EngineError, Orderer, OrderingResult};
use crate::planner::strategy::ValidatingPlanner;
use crate::planner::{PlanContext, TransitionPlan};
use crate::segments::{
    plan_segments, AudioStatus, CallbackOutcome, MixSegment, MixTimeline, RenderCallback,
    RenderProgress, SegmentError, SegmentSpec,
};

#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("project is {from}; cannot move to {to}")]
    InvalidStatus { from: ProjectStatus, to: ProjectStatus },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Created,
    Uploading,
    Analyzing,
    Ordering,
    Ready,
    Mixing,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Uploading => "uploading",
            Self::Analyzing => "analyzing",
            Self::Ordering => "ordering",
            Self::Ready => "ready",
            Self::Mixing => "mixing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Created,
            Self::Uploading,
            Self::Analyzing,
            Self::Ordering,
            Self::Ready,
            Self::Mixing,
            Self::Completed,
            Self::Failed,
        ]
        .into_iter()
        .find(|s| s.as_str() == raw)
    }

    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Created, Uploading | Analyzing | Ordering)
            | (Uploading, Analyzing)
            | (Analyzing, Ordering)
            | (Ordering, Ready)
            | (Ready, Mixing | Ordering)
            | (Mixing, Completed | Ordering)
            | (Completed, Ordering | Mixing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned transition between adjacent tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTransition {
    pub from_track_id: String,
    pub to_track_id: String,
    pub position: usize,
    pub phase: SetPhase,
    pub score: CompatibilityScore,
    pub plan: TransitionPlan,
    /// Name of the proposer whose plan was used.
    pub plan_source: String,
}

/// A transition joined with its segment's render state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionView {
    pub id: String,
    pub from_track_id: String,
    pub to_track_id: String,
    pub position: usize,
    #[serde(flatten)]
    pub score: CompatibilityScore,
    pub transition_type: crate::planner::TransitionType,
    pub duration_bars: u32,
    pub track_a_cut_ms: u64,
    pub track_b_start_ms: u64,
    pub audio_status: AudioStatus,
    pub audio_file_path: Option<String>,
    pub audio_duration_ms: Option<u64>,
}

/// Result of ordering plus planning, before it becomes a snapshot.
#[derive(Debug, Clone)]
pub struct MixPlan {
    pub ordering: OrderingResult,
    pub transitions: Vec<PlannedTransition>,
    pub specs: Vec<SegmentSpec>,
}

/// Ordering, transitions and segments as of one planning run.
#[derive(Debug, Default)]
pub struct MixSnapshot {
    pub version: u64,
    pub ordering: OrderingResult,
    pub transitions: Vec<PlannedTransition>,
    pub timeline: MixTimeline,
    /// IDs of segments superseded by this or earlier plans.
    pub retired: HashSet<String>,
}

impl MixSnapshot {
    /// Build the next snapshot from this one, keeping the stable prefix.
    pub fn successor(&self, plan: MixPlan) -> Self {
        let version = self.version + 1;
        let (timeline, kept) = self.timeline.replan(version, plan.specs);
        let mut retired = self.retired.clone();
        retired.extend(self.timeline.cells()[kept..].iter().map(|c| c.id().to_string()));
        Self {
            version,
            ordering: plan.ordering,
            transitions: plan.transitions,
            timeline,
            retired,
        }
    }

    pub fn total_duration_ms(&self) -> u64 {
        self.timeline.total_duration_ms()
    }

    pub fn segments(&self) -> Vec<MixSegment> {
        self.timeline.segments()
    }

    pub fn transitions(&self) -> Vec<TransitionView> {
        self.transitions
            .iter()
            .filter_map(|t| {
                let cell = self.timeline.cells().get(2 * t.position + 1)?;
                let rt = cell.runtime();
                Some(TransitionView {
                    id: cell.id().to_string(),
                    from_track_id: t.from_track_id.clone(),
                    to_track_id: t.to_track_id.clone(),
                    position: t.position,
                    score: t.score,
                    transition_type: t.plan.transition_type,
                    duration_bars: t.plan.duration_bars,
                    track_a_cut_ms: t.plan.cut_points.track_a_cut_ms,
                    track_b_start_ms: t.plan.cut_points.track_b_start_ms,
                    audio_status: rt.status,
                    audio_file_path: rt.audio_file_path,
                    audio_duration_ms: rt.audio_duration_ms,
                })
            })
            .collect()
    }
}

/// Orderer plus planner: everything that turns tracks into a plan.
pub struct MixEngine {
    orderer: Orderer,
    planner: ValidatingPlanner,
}

impl MixEngine {
    pub fn new(orderer: Orderer, planner: ValidatingPlanner) -> Self {
        Self { orderer, planner }
    }

    pub fn orderer(&self) -> &Orderer {
        &self.orderer
    }

    pub fn order(&self, tracks: &[TrackRecord]) -> Result<MixPlan, EngineError> {
        let ordering = self.orderer.order(tracks)?;
        self.plan(tracks, ordering)
    }

    /// Take the assistant's order, or `None` when it kept the current one.
    pub fn chat_order(
        &self,
        tracks: &[TrackRecord],
        payload: &ChatOrderPayload,
    ) -> Result<Option<MixPlan>, EngineError> {
        apply_chat_order(&self.orderer, tracks, payload)?
            .map(|ordering| self.plan(tracks, ordering))
            .transpose()
    }

    /// Plan every adjacent pair of an ordering and lay out its segments.
    pub fn plan(
        &self,
        tracks: &[TrackRecord],
        ordering: OrderingResult,
    ) -> Result<MixPlan, EngineError> {
        let lookup = |id: &str| -> Result<&TrackAnalysis, EngineError> {
            tracks
                .iter()
                .find(|t| t.track_id == id)
                .and_then(|t| t.analysis.as_ref())
                .ok_or_else(|| EngineError::InvalidInput(format!("no analysis for {id}")))
        };
        let ordered = ordering
            .ordered_tracks
            .iter()
            .map(|id| lookup(id))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = self.planner.policy();
        let n = ordered.len();
        let mut entry_ms = 0;
        let mut transitions = Vec::with_capacity(n.saturating_sub(1));
        let mut ordering = ordering;

        for adjacent in &ordering.adjacent_scores {
            let position = adjacent.position;
            let ctx = PlanContext {
                from: ordered[position],
                to: ordered[position + 1],
                score: &adjacent.score,
                from_phase: policy.phase_at(position, n),
                phase: adjacent.phase,
                position,
                from_entry_ms: entry_ms,
            };
            let outcome = self.planner.plan(&ctx);
            entry_ms = outcome.plan.cut_points.track_b_start_ms;
            transitions.push(PlannedTransition {
                from_track_id: adjacent.from_track_id.clone(),
                to_track_id: adjacent.to_track_id.clone(),
                position,
                phase: adjacent.phase,
                score: adjacent.score,
                plan: outcome.plan,
                plan_source: outcome.source.to_string(),
            });
        }
        for t in &transitions {
            ordering.warnings.extend(t.plan.warnings.iter().cloned());
        }

        let plans: Vec<TransitionPlan> = transitions.iter().map(|t| t.plan.clone()).collect();
        let specs = plan_segments(&ordered, &plans)
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

        log::info!(
            "Planned {} transitions across {} segments",
            transitions.len(),
            specs.len()
        );
        Ok(MixPlan {
            ordering,
            transitions,
            specs,
        })
    }
}

pub struct Project {
    pub id: String,
    pub name: String,
    tracks: Vec<TrackRecord>,
    status: Mutex<ProjectStatus>,
    snapshot: RwLock<Arc<MixSnapshot>>,
    /// Serializes planning runs so versions never interleave.
    planning: Mutex<()>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tracks: Vec<TrackRecord>) -> Self {
        Self::restore(id, name, tracks, ProjectStatus::Created, MixSnapshot::default())
    }

    /// Rebuild from stored state.
    pub fn restore(
        id: impl Into<String>,
        name: impl Into<String>,
        tracks: Vec<TrackRecord>,
        status: ProjectStatus,
        snapshot: MixSnapshot,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tracks,
            status: Mutex::new(status),
            snapshot: RwLock::new(Arc::new(snapshot)),
            planning: Mutex::new(()),
        }
    }

    pub fn tracks(&self) -> &[TrackRecord] {
        &self.tracks
    }

    pub fn status(&self) -> ProjectStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, next: ProjectStatus) -> Result<(), ProjectError> {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == next {
            return Ok(());
        }
        if !status.can_transition_to(next) {
            return Err(ProjectError::InvalidStatus { from: *status, to: next });
        }
        log::debug!("Project {}: {} -> {}", self.id, *status, next);
        *status = next;
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<MixSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn install(&self, plan: MixPlan) -> Arc<MixSnapshot> {
        let mut slot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let next = Arc::new(slot.successor(plan));
        *slot = next.clone();
        next
    }

    /// Run the orderer and planner and swap in the result.
    pub fn run_ordering(&self, engine: &MixEngine) -> Result<Arc<MixSnapshot>, ProjectError> {
        self.replan(|| engine.order(&self.tracks).map(Some))
    }

    /// Adopt the assistant's order. The current snapshot is returned
    /// unchanged when the payload carries no new order.
    pub fn apply_chat(
        &self,
        engine: &MixEngine,
        payload: &ChatOrderPayload,
    ) -> Result<Arc<MixSnapshot>, ProjectError> {
        self.replan(|| engine.chat_order(&self.tracks, payload))
    }

    fn replan(
        &self,
        run: impl FnOnce() -> Result<Option<MixPlan>, EngineError>,
    ) -> Result<Arc<MixSnapshot>, ProjectError> {
        let _planning = self.planning.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.status();
        self.set_status(ProjectStatus::Ordering)?;

        match run() {
            Ok(Some(plan)) => {
                let snapshot = self.install(plan);
                self.set_status(ProjectStatus::Ready)?;
                Ok(snapshot)
            }
            Ok(None) => {
                let restored = match previous {
                    ProjectStatus::Mixing | ProjectStatus::Completed => previous,
                    _ => ProjectStatus::Ready,
                };
                *self.status.lock().unwrap_or_else(|e| e.into_inner()) = restored;
                Ok(self.snapshot())
            }
            Err(e) => {
                log::warn!("Ordering failed for project {}: {e}", self.id);
                self.set_status(ProjectStatus::Failed)?;
                Err(e.into())
            }
        }
    }

    /// Claim a segment for rendering.
    pub fn claim(&self, segment_id: &str) -> Result<(), ProjectError> {
        self.snapshot().timeline.claim(segment_id)?;
        if self.status() == ProjectStatus::Ready {
            self.set_status(ProjectStatus::Mixing)?;
        }
        Ok(())
    }

    /// Apply a render result. Results for superseded segments are dropped.
    pub fn apply_callback(
        &self,
        callback: &RenderCallback,
    ) -> Result<CallbackOutcome, ProjectError> {
        let snapshot = self.snapshot();
        if snapshot.retired.contains(&callback.segment_id) {
            log::debug!("Dropping result for superseded segment {}", callback.segment_id);
            return Ok(CallbackOutcome::Discarded);
        }
        let outcome = snapshot.timeline.apply_callback(callback)?;
        if snapshot.timeline.is_complete() && self.status() == ProjectStatus::Mixing {
            self.set_status(ProjectStatus::Completed)?;
        }
        Ok(outcome)
    }

    pub fn retry(&self, segment_id: &str) -> Result<(), ProjectError> {
        self.snapshot().timeline.retry(segment_id)?;
        if self.status() == ProjectStatus::Completed {
            self.set_status(ProjectStatus::Mixing)?;
        }
        Ok(())
    }

    pub fn progress(&self) -> RenderProgress {
        self.snapshot().timeline.progress()
    }
}
