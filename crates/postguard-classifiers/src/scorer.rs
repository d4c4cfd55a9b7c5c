//! Scorer trait: the opaque inference contract behind a scoring resource

use postguard_core::ScoreError;

/// Inference handle wrapped by a [`ScoringResource`](crate::ScoringResource).
///
/// Implementations are CPU-bound and synchronous; callers are expected to run
/// them off the I/O tasks. They must be safe to call from many threads at
/// once and must not mutate state between calls, so that a given text always
/// yields the same probabilities.
pub trait Scorer: Send + Sync {
    /// Class labels, in the order `probabilities` reports them
    fn labels(&self) -> &[String];

    /// Probability distribution over `labels` for `text`
    fn probabilities(&self, text: &str) -> Result<Vec<f32>, ScoreError>;

    /// Get the scorer name (for logs)
    fn name(&self) -> &str;
}

/// Fill in missing label names so that every class index has one
pub fn normalized_labels(num_labels: usize, labels: &[String]) -> Vec<String> {
    if labels.is_empty() {
        return match num_labels {
            0 | 2 => vec!["negative".to_string(), "positive".to_string()],
            1 => vec!["positive".to_string()],
            n => (0..n).map(|idx| format!("label_{}", idx)).collect(),
        };
    }

    let mut resolved = labels.to_vec();
    for idx in resolved.len()..num_labels {
        resolved.push(format!("label_{}", idx));
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_labels_defaults() {
        assert_eq!(normalized_labels(2, &[]), vec!["negative", "positive"]);
        assert_eq!(normalized_labels(3, &[]), vec!["label_0", "label_1", "label_2"]);
    }

    #[test]
    fn test_normalized_labels_pads() {
        let labels = vec!["positive".to_string()];
        assert_eq!(normalized_labels(3, &labels), vec!["positive", "label_1", "label_2"]);
    }
}
