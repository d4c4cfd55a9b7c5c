//! Scoring resource: one loaded, immutable artifact

use crate::artifact::ArtifactIdentity;
use crate::scorer::Scorer;
use postguard_core::{LoadError, ScoreError};
use std::fmt;

/// A fully constructed scorer plus the identity of the artifact it came
/// from. Immutable after construction and safe to share across threads; the
/// [`ResourceManager`](crate::ResourceManager) hands out `Arc`s to it.
pub struct ScoringResource {
    identity: ArtifactIdentity,
    max_length: usize,
    flag_index: usize,
    inference: Box<dyn Scorer>,
}

impl ScoringResource {
    /// Wrap an inference handle. `flag_index` selects the class whose
    /// probability is reported as the score.
    pub fn new(
        identity: ArtifactIdentity,
        max_length: usize,
        flag_index: usize,
        inference: Box<dyn Scorer>,
    ) -> Result<Self, LoadError> {
        let labels = inference.labels();
        if flag_index >= labels.len() {
            return Err(LoadError::invalid(format!(
                "flag class {} out of range for scorer '{}' with {} labels",
                flag_index,
                inference.name(),
                labels.len()
            )));
        }

        Ok(Self {
            identity,
            max_length,
            flag_index,
            inference,
        })
    }

    /// Probability of the flag class for `text`, guaranteed in `[0.0, 1.0]`
    pub fn score(&self, text: &str) -> Result<f32, ScoreError> {
        let probabilities = self.inference.probabilities(text)?;

        let score = probabilities.get(self.flag_index).copied().ok_or_else(|| {
            ScoreError::inference(format!(
                "scorer '{}' returned {} probabilities, flag class is {}",
                self.inference.name(),
                probabilities.len(),
                self.flag_index
            ))
        })?;

        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ScoreError::inference(format!(
                "scorer '{}' produced out-of-range score {}",
                self.inference.name(),
                score
            )));
        }

        Ok(score)
    }

    pub fn identity(&self) -> &ArtifactIdentity {
        &self.identity
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Label of the class reported as the score
    pub fn flag_label(&self) -> &str {
        &self.inference.labels()[self.flag_index]
    }
}

impl fmt::Debug for ScoringResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringResource")
            .field("identity", &self.identity)
            .field("scorer", &self.inference.name())
            .field("flag_label", &self.flag_label())
            .field("max_length", &self.max_length)
            .finish()
    }
}
