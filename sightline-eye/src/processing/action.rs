//! Action recognition postprocessing: softmax and top-K ranking

use crate::config::ActionConfig;
use crate::error::VisionError;
use crate::models::LabelTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Recognized action for the window ending at `captured_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionObservation {
    pub action_id: usize,
    pub label: String,
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
}

/// Numerically stable softmax.
///
/// The max logit is subtracted before exponentiating so large logits do not
/// overflow. Fails on empty input or when no finite maximum exists.
pub fn softmax(logits: &[f32]) -> Result<Vec<f32>, VisionError> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if logits.is_empty() || !max.is_finite() {
        return Err(VisionError::MalformedOutput {
            expected: "at least one finite logit".to_string(),
            actual: logits.len(),
        });
    }

    let exps: Vec<f32> = logits
        .iter()
        .map(|&l| if l.is_nan() { 0.0 } else { (l - max).exp() })
        .collect();
    let sum: f32 = exps.iter().sum();

    Ok(exps.into_iter().map(|e| e / sum).collect())
}

#[derive(Debug, Clone)]
pub struct ActionPostprocessor {
    labels: LabelTable,
    confidence_threshold: f32,
    top_k: usize,
}

impl ActionPostprocessor {
    pub fn new(labels: LabelTable, config: &ActionConfig) -> Self {
        Self {
            labels,
            confidence_threshold: config.confidence_threshold,
            top_k: config.top_k,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    /// Rank `logits`, logging and returning an empty list on malformed output.
    pub fn postprocess(&self, logits: &[f32], captured_at: DateTime<Utc>) -> Vec<ActionObservation> {
        match self.try_postprocess(logits, captured_at) {
            Ok(observations) => observations,
            Err(e) => {
                warn!("Discarding action output: {}", e);
                Vec::new()
            }
        }
    }

    pub fn try_postprocess(
        &self,
        logits: &[f32],
        captured_at: DateTime<Utc>,
    ) -> Result<Vec<ActionObservation>, VisionError> {
        if logits.len() != self.num_classes() {
            return Err(VisionError::MalformedOutput {
                expected: format!("{} action logits", self.num_classes()),
                actual: logits.len(),
            });
        }

        let probabilities = softmax(logits)?;
        let mut ranked: Vec<(usize, f32)> = probabilities.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let observations: Vec<ActionObservation> = ranked
            .into_iter()
            .take(self.top_k)
            .filter(|(_, p)| *p >= self.confidence_threshold)
            .map(|(action_id, confidence)| ActionObservation {
                action_id,
                label: self.labels.label(action_id),
                confidence,
                captured_at,
            })
            .collect();

        debug!("Ranked {} action classes, kept {}", logits.len(), observations.len());
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn postprocessor(n: usize, threshold: f32, top_k: usize) -> ActionPostprocessor {
        let config = ActionConfig {
            confidence_threshold: threshold,
            top_k,
            ..ActionConfig::default()
        };
        let labels = LabelTable::new((0..n).map(|i| format!("action{}", i)).collect());
        ActionPostprocessor::new(labels, &config)
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]).unwrap();
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_softmax_large_logits() {
        let p = softmax(&[1000.0, 999.0, -1000.0]).unwrap();
        assert!(p.iter().all(|v| v.is_finite()));
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(p[0] > 0.7);
    }

    #[test]
    fn test_softmax_uniform() {
        let p = softmax(&[5.0; 4]).unwrap();
        assert!(p.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_softmax_rejects_bad_input() {
        assert!(softmax(&[]).is_err());
        assert!(softmax(&[f32::NAN, f32::NAN]).is_err());
        assert!(softmax(&[f32::INFINITY, 1.0]).is_err());
    }

    #[test]
    fn test_top_k_and_threshold() {
        let pp = postprocessor(5, 0.1, 2);
        let now = Utc::now();
        let obs = pp.postprocess(&[0.0, 3.0, 1.0, 2.9, -2.0], now);
        assert_eq!(obs.len(), 2);
        assert_eq!(obs[0].action_id, 1);
        assert_eq!(obs[1].action_id, 3);
        assert_eq!(obs[0].label, "action1");
        assert!(obs.iter().all(|o| o.captured_at == now));
        assert!(obs[0].confidence >= obs[1].confidence);
    }

    #[test]
    fn test_threshold_filters_everything() {
        let pp = postprocessor(4, 0.9, 5);
        // Uniform distribution never reaches 0.9
        assert!(pp.postprocess(&[1.0; 4], Utc::now()).is_empty());
    }

    #[test]
    fn test_wrong_logit_count() {
        let pp = postprocessor(4, 0.1, 5);
        assert!(pp.postprocess(&[1.0; 3], Utc::now()).is_empty());
        assert!(matches!(
            pp.try_postprocess(&[1.0; 3], Utc::now()),
            Err(VisionError::MalformedOutput { actual: 3, .. })
        ));
    }
}
