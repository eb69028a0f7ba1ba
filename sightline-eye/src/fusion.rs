//! Fusion of per-path results into one timestamped analysis result

use crate::processing::{ActionObservation, Detection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Result emitted once per admitted frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Admission sequence number of the frame, increasing with gaps for drops
    pub sequence: u64,
    /// Ordered by confidence, highest first
    pub detections: Vec<Detection>,
    /// Ordered by confidence, highest first
    pub actions: Vec<ActionObservation>,
    pub processing_duration: Duration,
    /// Admission time of the frame
    pub timestamp: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty() && self.actions.is_empty()
    }
}

/// Keeps the latest action observations and merges them with each frame's
/// detections. Confidences are never blended across modalities.
#[derive(Debug)]
pub struct FusionStage {
    latest_actions: Vec<ActionObservation>,
    actions_updated_at: Option<Instant>,
    max_action_age: Duration,
}

impl FusionStage {
    pub fn new(max_action_age: Duration) -> Self {
        Self {
            latest_actions: Vec::new(),
            actions_updated_at: None,
            max_action_age,
        }
    }

    /// Replace the cached action observations
    pub fn update_actions(&mut self, actions: Vec<ActionObservation>, at: Instant) {
        self.latest_actions = actions;
        self.actions_updated_at = Some(at);
    }

    pub fn clear_actions(&mut self) {
        self.latest_actions.clear();
        self.actions_updated_at = None;
    }

    /// Cached observations still young enough to report at `now`
    pub fn current_actions(&self, now: Instant) -> &[ActionObservation] {
        match self.actions_updated_at {
            Some(at) if now.saturating_duration_since(at) <= self.max_action_age => &self.latest_actions,
            _ => &[],
        }
    }

    pub fn fuse(
        &self,
        sequence: u64,
        mut detections: Vec<Detection>,
        admitted_at: DateTime<Utc>,
        started: Instant,
        now: Instant,
    ) -> AnalysisResult {
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut actions = self.current_actions(now).to_vec();
        actions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        AnalysisResult {
            sequence,
            detections,
            actions,
            processing_duration: now.saturating_duration_since(started),
            timestamp: admitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::BoundingBox;

    fn detection(confidence: f32) -> Detection {
        Detection {
            class_id: 0,
            label: "person".to_string(),
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    fn action(id: usize, confidence: f32) -> ActionObservation {
        ActionObservation {
            action_id: id,
            label: format!("action{}", id),
            confidence,
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_fuse_orders_by_confidence() {
        let start = Instant::now();
        let mut stage = FusionStage::new(Duration::from_secs(3));
        stage.update_actions(vec![action(0, 0.4), action(1, 0.6)], start);

        let admitted = Utc::now();
        let result = stage.fuse(
            7,
            vec![detection(0.6), detection(0.9), detection(0.7)],
            admitted,
            start,
            start + Duration::from_millis(40),
        );

        assert_eq!(result.sequence, 7);
        assert_eq!(result.timestamp, admitted);
        assert_eq!(result.processing_duration, Duration::from_millis(40));
        let confidences: Vec<f32> = result.detections.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7, 0.6]);
        assert_eq!(result.actions[0].action_id, 1);
    }

    #[test]
    fn test_stale_actions_dropped() {
        let start = Instant::now();
        let mut stage = FusionStage::new(Duration::from_secs(3));
        stage.update_actions(vec![action(0, 0.5)], start);

        assert_eq!(stage.current_actions(start + Duration::from_secs(3)).len(), 1);
        assert!(stage.current_actions(start + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn test_clear_actions() {
        let start = Instant::now();
        let mut stage = FusionStage::new(Duration::from_secs(3));
        stage.update_actions(vec![action(0, 0.5)], start);
        stage.clear_actions();
        let result = stage.fuse(1, vec![], Utc::now(), start, start);
        assert!(result.is_empty());
    }

    #[test]
    fn test_result_serializes() {
        let start = Instant::now();
        let stage = FusionStage::new(Duration::from_secs(3));
        let result = stage.fuse(1, vec![detection(0.8)], Utc::now(), start, start);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"label\":\"person\""));
        assert!(json.contains("\"sequence\":1"));
    }
}
