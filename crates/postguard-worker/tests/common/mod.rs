//! Shared fixtures for worker integration tests
//!
//! A table-driven scorer (content → flag probability) behind a loader that
//! serves one table per artifact, plus helpers to wire a processor or a
//! coordinator to an in-memory broker.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use postguard_classifiers::{
    ArtifactIdentity, ArtifactRef, ResourceLoader, ResourceManager, Scorer, ScoringResource,
};
use postguard_core::{LoadError, ScoreError};
use postguard_telemetry::PipelineMetrics;
use postguard_worker::{
    Delivery, InMemoryBroker, LifecycleCoordinator, MessageProcessor, ProcessorSettings,
    QueueClient,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const INPUT: &str = "post-create";
pub const OUTPUT: &str = "post-sentiment";
pub const THRESHOLD: f32 = 0.8;
pub const MAX_DELIVERIES: u32 = 3;

/// Content that makes the scorer fail
pub const FAILING_CONTENT: &str = "<<fail>>";

/// Scores by exact content match, `default` otherwise
#[derive(Clone)]
pub struct ScoreTable {
    pub scores: HashMap<String, f32>,
    pub default: f32,
    pub latency: Option<Duration>,
    pub running: Arc<AtomicUsize>,
    pub max_running: Arc<AtomicUsize>,
}

impl ScoreTable {
    pub fn new(default: f32) -> Self {
        Self {
            scores: HashMap::new(),
            default,
            latency: None,
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(mut self, content: &str, score: f32) -> Self {
        self.scores.insert(content.to_string(), score);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Highest number of scoring calls observed running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct TableScorer {
    labels: Vec<String>,
    table: ScoreTable,
}

impl Scorer for TableScorer {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn probabilities(&self, text: &str) -> Result<Vec<f32>, ScoreError> {
        let running = self.table.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.table.max_running.fetch_max(running, Ordering::SeqCst);
        if let Some(latency) = self.table.latency {
            std::thread::sleep(latency);
        }
        self.table.running.fetch_sub(1, Ordering::SeqCst);

        if text == FAILING_CONTENT {
            return Err(ScoreError::inference("tensor shape mismatch"));
        }
        let score = self
            .table
            .scores
            .get(text)
            .copied()
            .unwrap_or(self.table.default);
        Ok(vec![1.0 - score, score])
    }

    fn name(&self) -> &str {
        "table"
    }
}

/// Serves a [`ScoreTable`] per artifact. `latest:` references are keyed by
/// the version they currently resolve to, everything else by locator.
#[derive(Default)]
pub struct TableLoader {
    tables: HashMap<String, ScoreTable>,
    delay: Option<Duration>,
    loads: Arc<AtomicUsize>,
}

impl TableLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, table: ScoreTable) -> Self {
        self.tables.insert(key.to_string(), table);
        self
    }

    /// Make every load take at least `delay`
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of loads started, shared with the loader once it is moved
    pub fn load_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }
}

#[async_trait]
impl ResourceLoader for TableLoader {
    async fn load(&self, artifact: &ArtifactRef) -> Result<ScoringResource, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let (key, version) = match artifact {
            ArtifactRef::Latest(_) => {
                let version = artifact.current_version()?;
                (version.clone(), version)
            }
            _ => (artifact.to_string(), "test".to_string()),
        };
        let table = self
            .tables
            .get(&key)
            .cloned()
            .ok_or_else(|| LoadError::not_found(key.clone()))?;

        ScoringResource::new(
            ArtifactIdentity {
                locator: artifact.to_string(),
                version,
            },
            256,
            1,
            Box::new(TableScorer {
                labels: vec!["clean".to_string(), "flag".to_string()],
                table,
            }),
        )
    }
}

pub fn artifact(locator: &str) -> ArtifactRef {
    locator.parse().expect("valid artifact reference")
}

pub fn settings(max_concurrency: usize) -> ProcessorSettings {
    ProcessorSettings {
        input_queue: INPUT.to_string(),
        output_queue: OUTPUT.to_string(),
        threshold: THRESHOLD,
        max_concurrency,
        max_deliveries: MAX_DELIVERIES,
    }
}

pub fn manager(loader: TableLoader) -> Arc<ResourceManager> {
    ResourceManager::new(Arc::new(loader), 4)
}

/// A processor over `table` loaded as `models/current`
pub async fn processor(
    table: ScoreTable,
    broker: &InMemoryBroker,
    max_concurrency: usize,
) -> (Arc<MessageProcessor>, Arc<ResourceManager>, PipelineMetrics) {
    let manager = manager(TableLoader::new().with("models/current", table));
    let handle = manager
        .load(&artifact("models/current"))
        .await
        .expect("load succeeds");
    let metrics = PipelineMetrics::new();
    let processor = MessageProcessor::new(
        handle,
        Arc::new(broker.clone()) as Arc<dyn QueueClient>,
        settings(max_concurrency),
        metrics.clone(),
    );
    (Arc::new(processor), manager, metrics)
}

pub fn coordinator(
    loader: TableLoader,
    locator: &str,
    broker: &InMemoryBroker,
    max_concurrency: usize,
) -> (LifecycleCoordinator, PipelineMetrics) {
    let metrics = PipelineMetrics::new();
    let coordinator = LifecycleCoordinator::new(
        manager(loader),
        Arc::new(broker.clone()),
        artifact(locator),
        settings(max_concurrency),
        metrics.clone(),
    );
    (coordinator, metrics)
}

/// Take the next delivery from the input queue
pub async fn next_delivery(broker: &InMemoryBroker) -> Delivery {
    let mut subscription = broker.consume(INPUT).await.expect("consume");
    tokio::time::timeout(Duration::from_secs(2), subscription.next())
        .await
        .expect("delivery within timeout")
        .expect("subscription open")
}

pub fn post(post_id: &str, content: &str) -> String {
    serde_json::json!({ "post_id": post_id, "content": content }).to_string()
}

/// Published payloads on the output queue, parsed
pub fn published(broker: &InMemoryBroker) -> Vec<serde_json::Value> {
    broker
        .messages(OUTPUT)
        .iter()
        .map(|payload| serde_json::from_slice(payload).expect("published JSON"))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
