//! Orders proposed by the chat assistant.
//!
//! The assistant only ever hands back a payload; its order skips the orderer
//! but still goes through the transition planner like any other.

use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::analysis::{TrackAnalysis, TrackRecord};
use crate::ordering::{partition, EngineError, Orderer, OrderingResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOrderPayload {
    /// `None` when the assistant changed nothing about the order.
    #[serde(default)]
    pub new_order: Option<Vec<String>>,
    #[serde(default)]
    pub changes_made: Vec<String>,
}

impl ChatOrderPayload {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Turn a chat payload into an ordering result, or `None` if it leaves the
/// order alone.
///
/// Unknown, duplicate or unanalyzed IDs reject the payload. Usable tracks
/// the assistant left out are reported as excluded.
pub fn apply_chat_order(
    orderer: &Orderer,
    tracks: &[TrackRecord],
    payload: &ChatOrderPayload,
) -> Result<Option<OrderingResult>, EngineError> {
    let Some(new_order) = &payload.new_order else {
        log::info!("Assistant left the order unchanged");
        return Ok(None);
    };
    let start = Instant::now();

    let parts = partition(tracks);
    let known: HashSet<&str> = tracks.iter().map(|t| t.track_id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<&TrackAnalysis> = Vec::with_capacity(new_order.len());

    for id in new_order {
        if !known.contains(id.as_str()) {
            return Err(EngineError::InvalidInput(format!("unknown track {id}")));
        }
        if !seen.insert(id.as_str()) {
            return Err(EngineError::InvalidInput(format!("track {id} listed twice")));
        }
        let analysis = parts
            .usable
            .iter()
            .find(|a| a.track_id == *id)
            .copied()
            .ok_or_else(|| {
                EngineError::InvalidInput(format!("track {id} has no usable analysis"))
            })?;
        ordered.push(analysis);
    }
    if ordered.len() > orderer.config().max_tracks {
        return Err(EngineError::TooManyTracks {
            count: ordered.len(),
            max: orderer.config().max_tracks,
        });
    }

    let mut excluded = parts.excluded;
    let mut warnings = parts.warnings;
    for analysis in &parts.usable {
        if !seen.contains(analysis.track_id.as_str()) {
            warnings.push(format!("assistant order leaves out {}", analysis.track_id));
            excluded.push(analysis.track_id.clone());
        }
    }
    for change in &payload.changes_made {
        log::info!("Assistant: {change}");
    }

    let (adjacent_scores, average_mix_score) = orderer.score_sequence(&ordered);
    Ok(Some(OrderingResult {
        ordered_tracks: new_order.clone(),
        excluded_track_ids: excluded,
        adjacent_scores,
        average_mix_score,
        processing_time_ms: start.elapsed().as_millis() as u64,
        warnings,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camelot::CamelotKey;

    fn tracks() -> Vec<TrackRecord> {
        vec![
            TrackRecord::analyzed(TrackAnalysis::new("t1", 126.0, CamelotKey::parse("8A"), 0.5)),
            TrackRecord::analyzed(TrackAnalysis::new("t2", 125.0, CamelotKey::parse("8A"), 0.6)),
            TrackRecord::analyzed(TrackAnalysis::new("t3", 140.0, CamelotKey::parse("2B"), 0.9)),
            TrackRecord::missing("t4"),
        ]
    }

    fn payload(json: &str) -> ChatOrderPayload {
        ChatOrderPayload::from_json(json).unwrap()
    }

    #[test]
    fn test_null_order_changes_nothing() {
        let p = payload(r#"{"new_order": null, "changes_made": []}"#);
        assert_eq!(apply_chat_order(&Orderer::default(), &tracks(), &p).unwrap(), None);
        let p = payload(r#"{"changes_made": ["nothing"]}"#);
        assert_eq!(p.new_order, None);
    }

    #[test]
    fn test_order_is_taken_verbatim() {
        let p = payload(r#"{"new_order": ["t3", "t1", "t2"], "changes_made": ["opened hot"]}"#);
        let result = apply_chat_order(&Orderer::default(), &tracks(), &p)
            .unwrap()
            .unwrap();
        assert_eq!(result.ordered_tracks, vec!["t3", "t1", "t2"]);
        assert_eq!(result.adjacent_scores.len(), 2);
        assert_eq!(result.adjacent_scores[0].from_track_id, "t3");
        assert_eq!(result.excluded_track_ids, vec!["t4"]);
    }

    #[test]
    fn test_omitted_tracks_are_excluded() {
        let p = payload(r#"{"new_order": ["t2", "t1"], "changes_made": []}"#);
        let result = apply_chat_order(&Orderer::default(), &tracks(), &p)
            .unwrap()
            .unwrap();
        assert_eq!(result.excluded_track_ids, vec!["t4", "t3"]);
        assert!(result.warnings.iter().any(|w| w.contains("t3")));
    }

    #[test]
    fn test_rejects_bad_orders() {
        let orderer = Orderer::default();
        for json in [
            r#"{"new_order": ["t1", "zz"]}"#,
            r#"{"new_order": ["t1", "t1"]}"#,
            r#"{"new_order": ["t1", "t4"]}"#,
        ] {
            assert!(
                matches!(
                    apply_chat_order(&orderer, &tracks(), &payload(json)),
                    Err(EngineError::InvalidInput(_))
                ),
                "{json}"
            );
        }
        assert!(matches!(
            ChatOrderPayload::from_json("{\"new_order\": 5}"),
            Err(EngineError::Payload(_))
        ));
    }
}
