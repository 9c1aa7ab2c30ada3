use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::models::{AnalysisSummary, ClaimedSegment, LibraryStats, ProjectRow, SegmentRow};
use super::{parse_project_status, parse_status, Database, DbError, Result};
use crate::analysis::{TrackAnalysis, TrackRecord};
use crate::ordering::OrderingResult;
use crate::project::{MixSnapshot, PlannedTransition, Project, ProjectStatus};
use crate::segments::{
    AudioStatus, CallbackOutcome, MixTimeline, RenderCallback, SegmentCell, SegmentError,
    SegmentKind, SegmentRuntime, SegmentSpec,
};

/// Attempts at claiming the next pending segment before giving up to a busier
/// worker pool.
const CLAIM_ATTEMPTS: usize = 8;

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// The only status a segment may move to `next` from.
fn predecessor(next: AudioStatus) -> AudioStatus {
    [
        AudioStatus::Pending,
        AudioStatus::Processing,
        AudioStatus::Completed,
        AudioStatus::Error,
    ]
    .into_iter()
    .find(|s| s.can_transition_to(next))
    .unwrap_or(next)
}

const SEGMENT_COLUMNS: &str = "id, project_id, position, kind, spec_json, status, audio_file_path,
     audio_duration_ms, error, attempts, cancelled, claimed_at, finished_at";

/// Raw segment columns; status and JSON are parsed outside the row closure.
struct RawSegment {
    id: String,
    project_id: String,
    position: i64,
    spec_json: String,
    status: String,
    audio_file_path: Option<String>,
    audio_duration_ms: Option<i64>,
    error: Option<String>,
    attempts: i64,
    cancelled: bool,
    claimed_at: Option<String>,
    finished_at: Option<String>,
}

impl RawSegment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            position: row.get(2)?,
            spec_json: row.get(4)?,
            status: row.get(5)?,
            audio_file_path: row.get(6)?,
            audio_duration_ms: row.get(7)?,
            error: row.get(8)?,
            attempts: row.get(9)?,
            cancelled: row.get(10)?,
            claimed_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_row(self) -> Result<SegmentRow> {
        let spec: SegmentSpec = serde_json::from_str(&self.spec_json)?;
        Ok(SegmentRow {
            kind: spec.kind(),
            spec,
            status: parse_status(&self.status)?,
            id: self.id,
            project_id: self.project_id,
            position: self.position as usize,
            audio_file_path: self.audio_file_path,
            audio_duration_ms: self.audio_duration_ms.map(|ms| ms.max(0) as u64),
            error: self.error,
            attempts: self.attempts.max(0) as u32,
            cancelled: self.cancelled,
            claimed_at: self.claimed_at.as_deref().map(parse_time),
            finished_at: self.finished_at.as_deref().map(parse_time),
        })
    }
}

impl Database {
    // ---- Analyses ----

    /// Insert or replace the analysis for a track.
    pub fn upsert_analysis(&self, a: &TrackAnalysis, source_path: Option<&str>) -> Result<()> {
        let json = serde_json::to_string(a)?;
        let now = now();
        self.conn.execute(
            "INSERT INTO analyses (
                track_id, source_path, duration_ms, bpm, camelot, energy,
                analysis_json, imported_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(track_id) DO UPDATE SET
                source_path = excluded.source_path,
                duration_ms = excluded.duration_ms,
                bpm = excluded.bpm,
                camelot = excluded.camelot,
                energy = excluded.energy,
                analysis_json = excluded.analysis_json,
                updated_at = excluded.updated_at",
            params![
                a.track_id,
                source_path,
                a.duration_ms as i64,
                a.bpm,
                a.key.map(|k| k.to_string()),
                a.energy,
                json,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis(&self, track_id: &str) -> Result<Option<TrackAnalysis>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT analysis_json FROM analyses WHERE track_id = ?1",
                params![track_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    pub fn list_analyses(&self) -> Result<Vec<AnalysisSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT track_id, bpm, camelot, energy, duration_ms, source_path
             FROM analyses ORDER BY track_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AnalysisSummary {
                    track_id: row.get(0)?,
                    bpm: row.get(1)?,
                    camelot: row.get(2)?,
                    energy: row.get(3)?,
                    duration_ms: row.get::<_, i64>(4)?.max(0) as u64,
                    source_path: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- Projects ----

    /// Create a project over the given tracks. Repeated IDs are kept once.
    pub fn create_project(&self, id: &str, name: &str, track_ids: &[String]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now();
        tx.execute(
            "INSERT INTO projects (id, name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, name, ProjectStatus::Created.as_str(), now],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO project_tracks (project_id, track_id, added_index)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (i, track_id) in track_ids.iter().enumerate() {
                stmt.execute(params![id, track_id, i as i64])?;
            }
        }
        tx.commit()?;
        log::info!("Created project {id} with {} tracks", track_ids.len());
        Ok(())
    }

    fn project_row(row: &Row<'_>) -> rusqlite::Result<(ProjectRow, String)> {
        let status: String = row.get(2)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;
        Ok((
            ProjectRow {
                id: row.get(0)?,
                name: row.get(1)?,
                status: ProjectStatus::Created,
                plan_version: row.get::<_, i64>(3)?.max(0) as u64,
                average_mix_score: row.get(4)?,
                track_count: row.get(5)?,
                created_at: parse_time(&created_at),
                updated_at: parse_time(&updated_at),
            },
            status,
        ))
    }

    const PROJECT_SELECT: &str = "SELECT p.id, p.name, p.status, p.plan_version,
            p.average_mix_score,
            (SELECT COUNT(*) FROM project_tracks pt WHERE pt.project_id = p.id),
            p.created_at, p.updated_at
         FROM projects p";

    pub fn get_project(&self, id: &str) -> Result<ProjectRow> {
        let found = self
            .conn
            .query_row(
                &format!("{} WHERE p.id = ?1", Self::PROJECT_SELECT),
                params![id],
                Self::project_row,
            )
            .optional()?;
        let (mut row, status) = found.ok_or_else(|| DbError::ProjectNotFound(id.to_string()))?;
        row.status = parse_project_status(&status)?;
        Ok(row)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} ORDER BY p.created_at, p.id", Self::PROJECT_SELECT))?;
        let raw = stmt
            .query_map([], Self::project_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(mut row, status)| {
                row.status = parse_project_status(&status)?;
                Ok(row)
            })
            .collect()
    }

    /// The project's tracks in the order they were added. Tracks without a
    /// stored analysis, or with one that no longer parses, come back missing.
    pub fn project_tracks(&self, project_id: &str) -> Result<Vec<TrackRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT pt.track_id, a.analysis_json
             FROM project_tracks pt
             LEFT JOIN analyses a ON a.track_id = pt.track_id
             WHERE pt.project_id = ?1
             ORDER BY pt.added_index",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(track_id, json)| match json.map(|j| serde_json::from_str(&j)) {
                Some(Ok(analysis)) => TrackRecord::analyzed(analysis),
                Some(Err(e)) => {
                    log::warn!("Stored analysis for {track_id} is unreadable: {e}");
                    TrackRecord::missing(track_id)
                }
                None => TrackRecord::missing(track_id),
            })
            .collect())
    }

    /// Move a project to `next` if its stored status allows it.
    pub fn set_project_status(&self, id: &str, next: ProjectStatus) -> Result<()> {
        let current = self.get_project(id)?.status;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(DbError::InvalidStatus { from: current, to: next });
        }
        let changed = self.conn.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![next.as_str(), now(), id, current.as_str()],
        )?;
        if changed == 0 {
            // someone else moved it first
            let from = self.get_project(id)?.status;
            return Err(DbError::InvalidStatus { from, to: next });
        }
        log::debug!("Project {id}: {current} -> {next}");
        Ok(())
    }

    /// Rebuild a project and its current plan from storage.
    pub fn load_project(&self, id: &str) -> Result<Project> {
        let row = self.get_project(id)?;
        let tracks = self.project_tracks(id)?;

        let ordering_json: Option<String> = self.conn.query_row(
            "SELECT ordering_json FROM projects WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        let ordering: OrderingResult = match ordering_json {
            Some(json) => serde_json::from_str(&json)?,
            None => OrderingResult::default(),
        };

        let mut stmt = self
            .conn
            .prepare("SELECT plan_json FROM transitions WHERE project_id = ?1 ORDER BY position")?;
        let transitions = stmt
            .query_map(params![id], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .iter()
            .map(|json| serde_json::from_str::<PlannedTransition>(json))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut live = Vec::new();
        let mut retired = HashSet::new();
        for segment in self.project_segments(id)? {
            if segment.cancelled {
                retired.insert(segment.id);
                continue;
            }
            let runtime = SegmentRuntime {
                status: segment.status,
                audio_file_path: segment.audio_file_path,
                audio_duration_ms: segment.audio_duration_ms,
                error: segment.error,
                attempts: segment.attempts,
            };
            live.push(Arc::new(SegmentCell::with_runtime(
                segment.id,
                segment.spec,
                runtime,
            )));
        }

        let snapshot = MixSnapshot {
            version: row.plan_version,
            ordering,
            transitions,
            timeline: MixTimeline::from_cells(row.plan_version, live),
            retired,
        };
        Ok(Project::restore(row.id, row.name, tracks, row.status, snapshot))
    }

    /// Persist a project's current plan and status in one transaction.
    ///
    /// Segments kept from the previous plan keep their stored render state;
    /// dropped ones are marked cancelled rather than deleted.
    pub fn save_plan(&self, project: &Project) -> Result<()> {
        let snapshot = project.snapshot();
        let tx = self.conn.unchecked_transaction()?;
        let now = now();

        let changed = tx.execute(
            "UPDATE projects SET status = ?1, plan_version = ?2, ordering_json = ?3,
                average_mix_score = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                project.status().as_str(),
                snapshot.version as i64,
                serde_json::to_string(&snapshot.ordering)?,
                snapshot.ordering.average_mix_score,
                now,
                project.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::ProjectNotFound(project.id.clone()));
        }

        let keep: HashSet<&str> = snapshot.timeline.cells().iter().map(|c| c.id()).collect();
        let stored: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT id FROM segments WHERE project_id = ?1 AND cancelled = 0")?;
            stmt.query_map(params![project.id], |r| r.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        let mut superseded = 0;
        for segment_id in stored.iter().filter(|s| !keep.contains(s.as_str())) {
            tx.execute(
                "UPDATE segments SET cancelled = 1 WHERE project_id = ?1 AND id = ?2",
                params![project.id, segment_id],
            )?;
            superseded += 1;
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO segments
                    (id, project_id, position, kind, spec_json, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(project_id, id) DO NOTHING",
            )?;
            for (position, cell) in snapshot.timeline.cells().iter().enumerate() {
                let kind = match cell.spec().kind() {
                    SegmentKind::Solo => "SOLO",
                    SegmentKind::Transition => "TRANSITION",
                };
                stmt.execute(params![
                    cell.id(),
                    project.id,
                    position as i64,
                    kind,
                    serde_json::to_string(cell.spec())?,
                    AudioStatus::Pending.as_str(),
                    now,
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM transitions WHERE project_id = ?1",
            params![project.id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transitions (
                    id, project_id, position, from_track_id, to_track_id, phase,
                    score, harmonic_score, bpm_score, energy_score, compatibility_type,
                    bpm_difference, energy_difference,
                    transition_type, duration_bars, track_a_cut_ms, track_b_start_ms,
                    plan_json, plan_source
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                          ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            )?;
            for t in &snapshot.transitions {
                let id = snapshot
                    .timeline
                    .cells()
                    .get(2 * t.position + 1)
                    .map(|c| c.id().to_string())
                    .unwrap_or_else(|| format!("{}-t{}", project.id, t.position));
                stmt.execute(params![
                    id,
                    project.id,
                    t.position as i64,
                    t.from_track_id,
                    t.to_track_id,
                    t.phase.as_str(),
                    t.score.score as i64,
                    t.score.harmonic_score,
                    t.score.bpm_score,
                    t.score.energy_score,
                    t.score.compatibility_type.as_str(),
                    t.score.bpm_difference,
                    t.score.energy_difference,
                    t.plan.transition_type.as_str(),
                    t.plan.duration_bars as i64,
                    t.plan.cut_points.track_a_cut_ms as i64,
                    t.plan.cut_points.track_b_start_ms as i64,
                    serde_json::to_string(t)?,
                    t.plan_source,
                ])?;
            }
        }

        tx.commit()?;
        log::info!(
            "Saved plan v{} for {} ({} segments, {} superseded)",
            snapshot.version,
            project.id,
            snapshot.timeline.len(),
            superseded
        );
        Ok(())
    }

    // ---- Segments ----

    pub fn get_segment(&self, project_id: &str, segment_id: &str) -> Result<Option<SegmentRow>> {
        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SEGMENT_COLUMNS} FROM segments WHERE project_id = ?1 AND id = ?2"
                ),
                params![project_id, segment_id],
                RawSegment::from_row,
            )
            .optional()?;
        raw.map(RawSegment::into_row).transpose()
    }

    /// All segment rows of a project, superseded ones included.
    pub fn project_segments(&self, project_id: &str) -> Result<Vec<SegmentRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE project_id = ?1
             ORDER BY cancelled, position, created_at"
        ))?;
        let raw = stmt
            .query_map(params![project_id], RawSegment::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawSegment::into_row).collect()
    }

    /// Error explaining why a conditional segment update touched no row.
    fn refusal(&self, project_id: &str, segment_id: &str, to: AudioStatus) -> DbError {
        match self.get_segment(project_id, segment_id) {
            Ok(Some(row)) if row.cancelled => {
                SegmentError::Cancelled(segment_id.to_string()).into()
            }
            Ok(Some(row)) => SegmentError::InvalidTransition {
                id: segment_id.to_string(),
                from: row.status,
                to,
            }
            .into(),
            Ok(None) => SegmentError::NotFound(segment_id.to_string()).into(),
            Err(e) => e,
        }
    }

    /// Mark a pending segment as processing.
    pub fn claim_segment(&self, project_id: &str, segment_id: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE segments SET status = ?1, attempts = attempts + 1, error = NULL, claimed_at = ?2
             WHERE project_id = ?3 AND id = ?4 AND status = ?5 AND cancelled = 0",
            params![
                AudioStatus::Processing.as_str(),
                now(),
                project_id,
                segment_id,
                predecessor(AudioStatus::Processing).as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(self.refusal(project_id, segment_id, AudioStatus::Processing));
        }
        self.sync_project_status(project_id)
    }

    /// Claim the first pending segment in playback order, if any.
    pub fn claim_next(&self, project_id: &str) -> Result<Option<ClaimedSegment>> {
        for _ in 0..CLAIM_ATTEMPTS {
            let next = self
                .conn
                .query_row(
                    &format!(
                        "SELECT {SEGMENT_COLUMNS} FROM segments
                         WHERE project_id = ?1 AND status = ?2 AND cancelled = 0
                         ORDER BY position LIMIT 1"
                    ),
                    params![project_id, AudioStatus::Pending.as_str()],
                    RawSegment::from_row,
                )
                .optional()?;
            let Some(raw) = next else {
                return Ok(None);
            };
            let row = raw.into_row()?;
            match self.claim_segment(project_id, &row.id) {
                Ok(()) => {
                    return Ok(Some(ClaimedSegment {
                        id: row.id,
                        project_id: row.project_id,
                        position: row.position,
                        spec: row.spec,
                    }));
                }
                Err(DbError::Segment(
                    SegmentError::InvalidTransition { .. } | SegmentError::Cancelled(_),
                )) => {
                    log::debug!("Lost the claim on {}, trying the next segment", row.id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Apply a render worker's report. Reports for superseded segments are
    /// discarded without touching anything.
    pub fn apply_callback(
        &self,
        project_id: &str,
        callback: &RenderCallback,
    ) -> Result<CallbackOutcome> {
        let bad = |message: &str| SegmentError::BadCallback {
            id: callback.segment_id.clone(),
            message: message.to_string(),
        };
        if let Some(ms) = callback.duration_ms
            && ms < 0
        {
            return Err(bad("negative duration").into());
        }
        let row = self
            .get_segment(project_id, &callback.segment_id)?
            .ok_or_else(|| SegmentError::NotFound(callback.segment_id.clone()))?;
        if row.cancelled {
            log::debug!("Discarding late {} report for {}", callback.status, row.id);
            return Ok(CallbackOutcome::Discarded);
        }

        let changed = match callback.status {
            AudioStatus::Processing => {
                return match self.claim_segment(project_id, &row.id) {
                    Ok(()) => Ok(CallbackOutcome::Applied(AudioStatus::Processing)),
                    Err(DbError::Segment(SegmentError::Cancelled(_))) => {
                        Ok(CallbackOutcome::Discarded)
                    }
                    Err(e) => Err(e),
                };
            }
            AudioStatus::Completed => {
                let path = callback
                    .audio_file_path
                    .as_deref()
                    .ok_or_else(|| bad("completed without an audio file"))?;
                let duration = callback
                    .duration_ms
                    .map_or_else(|| row.spec.planned_duration_ms(), |ms| ms as u64);
                self.conn.execute(
                    "UPDATE segments SET status = ?1, audio_file_path = ?2, audio_duration_ms = ?3,
                        error = NULL, finished_at = ?4
                     WHERE project_id = ?5 AND id = ?6 AND status = ?7 AND cancelled = 0",
                    params![
                        AudioStatus::Completed.as_str(),
                        path,
                        duration as i64,
                        now(),
                        project_id,
                        row.id,
                        predecessor(AudioStatus::Completed).as_str(),
                    ],
                )?
            }
            AudioStatus::Error => self.conn.execute(
                "UPDATE segments SET status = ?1, error = ?2, finished_at = ?3
                 WHERE project_id = ?4 AND id = ?5 AND status = ?6 AND cancelled = 0",
                params![
                    AudioStatus::Error.as_str(),
                    callback.error.as_deref().unwrap_or("render failed"),
                    now(),
                    project_id,
                    row.id,
                    predecessor(AudioStatus::Error).as_str(),
                ],
            )?,
            AudioStatus::Pending => return Err(bad("pending is not a render result").into()),
        };

        if changed == 0 {
            return match self.refusal(project_id, &row.id, callback.status) {
                DbError::Segment(SegmentError::Cancelled(_)) => Ok(CallbackOutcome::Discarded),
                e => Err(e),
            };
        }
        self.sync_project_status(project_id)?;
        Ok(CallbackOutcome::Applied(callback.status))
    }

    /// Put a failed segment back in the queue.
    pub fn retry_segment(&self, project_id: &str, segment_id: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE segments SET status = ?1, finished_at = NULL
             WHERE project_id = ?2 AND id = ?3 AND status = ?4 AND cancelled = 0",
            params![
                AudioStatus::Pending.as_str(),
                project_id,
                segment_id,
                predecessor(AudioStatus::Pending).as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(self.refusal(project_id, segment_id, AudioStatus::Pending));
        }
        self.sync_project_status(project_id)
    }

    /// Follow the live segments: ready -> mixing once rendering starts,
    /// mixing -> completed once every segment is done, and back to mixing on
    /// a retry.
    fn sync_project_status(&self, project_id: &str) -> Result<()> {
        let (total, started, completed): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(status != ?2), 0),
                    COALESCE(SUM(status = ?3), 0)
             FROM segments WHERE project_id = ?1 AND cancelled = 0",
            params![
                project_id,
                AudioStatus::Pending.as_str(),
                AudioStatus::Completed.as_str()
            ],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let status = self.get_project(project_id)?.status;
        let next = match status {
            ProjectStatus::Ready if started > 0 => ProjectStatus::Mixing,
            ProjectStatus::Mixing if total > 0 && completed == total => ProjectStatus::Completed,
            ProjectStatus::Completed if completed < total => ProjectStatus::Mixing,
            _ => return Ok(()),
        };
        self.set_project_status(project_id, next)?;
        if next == ProjectStatus::Mixing && total > 0 && completed == total {
            self.set_project_status(project_id, ProjectStatus::Completed)?;
        }
        Ok(())
    }

    // ---- Stats ----

    pub fn stats(&self) -> Result<LibraryStats> {
        let (analyzed_tracks, total_ms): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(duration_ms), 0) FROM analyses",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let projects: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM projects", [], |r| r.get(0))?;
        let superseded_segments: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM segments WHERE cancelled = 1",
            [],
            |r| r.get(0),
        )?;

        let group = |sql: &str| -> Result<Vec<(String, i64)>> {
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        };

        Ok(LibraryStats {
            analyzed_tracks,
            total_duration_hours: total_ms as f64 / 3_600_000.0,
            projects,
            projects_by_status: group(
                "SELECT status, COUNT(*) FROM projects GROUP BY status ORDER BY status",
            )?,
            segments_by_status: group(
                "SELECT status, COUNT(*) FROM segments WHERE cancelled = 0
                 GROUP BY status ORDER BY status",
            )?,
            superseded_segments,
        })
    }
}
