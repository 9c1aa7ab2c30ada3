use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::project::ProjectStatus;
use crate::segments::{AudioStatus, SegmentKind, SegmentSpec};

/// A project row read from the database.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub plan_version: u64,
    pub average_mix_score: Option<f64>,
    pub track_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Summary of an imported analysis, for listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub track_id: String,
    pub bpm: f64,
    pub camelot: Option<String>,
    pub energy: f64,
    pub duration_ms: u64,
    pub source_path: Option<String>,
}

/// A segment row, including superseded ones.
#[derive(Debug, Clone)]
pub struct SegmentRow {
    pub id: String,
    pub project_id: String,
    pub position: usize,
    pub kind: SegmentKind,
    pub spec: SegmentSpec,
    pub status: AudioStatus,
    pub audio_file_path: Option<String>,
    pub audio_duration_ms: Option<u64>,
    pub error: Option<String>,
    pub attempts: u32,
    pub cancelled: bool,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A segment handed to a render worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedSegment {
    pub id: String,
    pub project_id: String,
    pub position: usize,
    pub spec: SegmentSpec,
}

/// Database-wide statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryStats {
    pub analyzed_tracks: i64,
    pub total_duration_hours: f64,
    pub projects: i64,
    pub projects_by_status: Vec<(String, i64)>,
    pub segments_by_status: Vec<(String, i64)>,
    pub superseded_segments: i64,
}
