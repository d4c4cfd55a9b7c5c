//! Mock scorers and loaders for testing
//!
//! Provides configurable implementations of the `Scorer` and
//! `ResourceLoader` traits for exercising the resource manager without
//! model weights.

#![allow(dead_code)]

use async_trait::async_trait;
use postguard_classifiers::{
    ArtifactIdentity, ArtifactRef, ResourceLoader, Scorer, ScoringResource,
};
use postguard_core::{LoadError, ScoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A binary scorer that always reports the same flag probability
pub struct MockScorer {
    labels: Vec<String>,
    score: f32,
    latency: Option<Duration>,
    call_count: Arc<AtomicU32>,
    dropped: Arc<AtomicBool>,
}

impl MockScorer {
    pub fn new(score: f32) -> Self {
        Self {
            labels: vec!["clean".to_string(), "flag".to_string()],
            score,
            latency: None,
            call_count: Arc::new(AtomicU32::new(0)),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulated inference time (blocks the calling thread)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl Scorer for MockScorer {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn probabilities(&self, _text: &str) -> Result<Vec<f32>, ScoreError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        Ok(vec![1.0 - self.score, self.score])
    }

    fn name(&self) -> &str {
        "mock"
    }
}

impl Drop for MockScorer {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// What the mock loader builds for one artifact locator
#[derive(Clone)]
pub struct MockArtifact {
    pub score: f32,
    pub latency: Option<Duration>,
    pub load_delay: Option<Duration>,
    pub failure: Option<LoadError>,
    pub dropped: Arc<AtomicBool>,
    pub calls: Arc<AtomicU32>,
}

impl MockArtifact {
    pub fn scoring(score: f32) -> Self {
        Self {
            score,
            latency: None,
            load_delay: None,
            failure: None,
            dropped: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn failing(failure: LoadError) -> Self {
        Self {
            failure: Some(failure),
            ..Self::scoring(0.0)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Whether the resource built from this artifact has been destroyed
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Loader serving `MockArtifact`s by locator string
#[derive(Default)]
pub struct MockLoader {
    artifacts: HashMap<String, MockArtifact>,
    in_progress: AtomicUsize,
    max_in_progress: AtomicUsize,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, locator: &str, artifact: MockArtifact) -> Self {
        self.artifacts.insert(locator.to_string(), artifact);
        self
    }

    /// Highest number of loads observed running at the same time
    pub fn max_concurrent_loads(&self) -> usize {
        self.max_in_progress.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceLoader for MockLoader {
    async fn load(&self, artifact: &ArtifactRef) -> Result<ScoringResource, LoadError> {
        let locator = artifact.to_string();
        let spec = self
            .artifacts
            .get(&locator)
            .cloned()
            .ok_or_else(|| LoadError::not_found(locator.clone()))?;

        let running = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_progress.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = spec.load_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_progress.fetch_sub(1, Ordering::SeqCst);

        if let Some(failure) = spec.failure {
            return Err(failure);
        }

        let mut scorer = MockScorer::new(spec.score);
        scorer.dropped = spec.dropped;
        scorer.call_count = spec.calls;
        if let Some(latency) = spec.latency {
            scorer = scorer.with_latency(latency);
        }

        ScoringResource::new(
            ArtifactIdentity {
                locator,
                version: "test".to_string(),
            },
            256,
            1,
            Box::new(scorer),
        )
    }
}

pub fn artifact(locator: &str) -> ArtifactRef {
    locator.parse().expect("valid artifact reference")
}
