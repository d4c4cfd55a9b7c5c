//! Lifecycle coordinator: load before consume, stop consuming before release

use crate::processor::{MessageProcessor, ProcessorSettings};
use crate::queue::QueueClient;
use crate::reload::Reloader;
use postguard_classifiers::{ArtifactRef, ResourceManager};
use postguard_core::{Error, LoadError, Result};
use postguard_telemetry::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a call to [`LifecycleCoordinator::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running
    NotRunning,
    /// All in-flight deliveries finished within the grace window
    Drained,
    /// The grace window ran out; unfinished deliveries were abandoned
    /// unsettled and will be redelivered by the transport
    GraceExpired,
}

struct Running {
    intake: CancellationToken,
    exited: CancellationToken,
    consumer: JoinHandle<()>,
    watcher: Option<JoinHandle<()>>,
}

pub struct LifecycleCoordinator {
    manager: Arc<ResourceManager>,
    queue: Arc<dyn QueueClient>,
    artifact: ArtifactRef,
    settings: ProcessorSettings,
    metrics: PipelineMetrics,
    running: Option<Running>,
}

impl LifecycleCoordinator {
    pub fn new(
        manager: Arc<ResourceManager>,
        queue: Arc<dyn QueueClient>,
        artifact: ArtifactRef,
        settings: ProcessorSettings,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            manager,
            queue,
            artifact,
            settings,
            metrics,
            running: None,
        }
    }

    /// Load the configured artifact, then start consuming.
    ///
    /// A load failure is returned as is and nothing is consumed.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Err(Error::internal("consumer already running"));
        }

        tracing::info!(artifact = %self.artifact, "Loading scoring resource before consuming");
        let scoring = self.manager.load(&self.artifact).await?;

        let subscription = self.queue.consume(&self.settings.input_queue).await?;
        let processor = Arc::new(MessageProcessor::new(
            scoring,
            Arc::clone(&self.queue),
            self.settings.clone(),
            self.metrics.clone(),
        ));

        let intake = CancellationToken::new();
        let exited = CancellationToken::new();
        let consumer = {
            let intake = intake.clone();
            let exited = exited.clone();
            tokio::spawn(async move {
                let _exited = exited.drop_guard();
                processor.run(subscription, intake).await;
            })
        };

        self.running = Some(Running {
            intake,
            exited,
            consumer,
            watcher: None,
        });
        Ok(())
    }

    /// Poll the configured artifact every `interval` and reload when its
    /// version changes. The watcher ends with [`stop`](Self::stop), which
    /// waits for a reload already under way before releasing the resource.
    pub fn watch(&mut self, interval: Duration) -> Result<()> {
        let reloader = self.reloader();
        let artifact = self.artifact.clone();
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| Error::internal("consumer is not running"))?;
        if running.watcher.is_some() {
            return Err(Error::internal("artifact watcher already running"));
        }

        running.watcher = Some(tokio::spawn(crate::reload::watch(
            reloader,
            artifact,
            interval,
            running.intake.child_token(),
        )));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Cancelled once the consumer task has returned, whether through
    /// [`stop`](Self::stop) or because the subscription ended
    pub fn consumer_exited(&self) -> Option<CancellationToken> {
        self.running.as_ref().map(|r| r.exited.clone())
    }

    /// Stop intake, give in-flight work up to `grace` to finish, then
    /// release the scoring resource.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        let Some(running) = self.running.take() else {
            return StopOutcome::NotRunning;
        };

        tracing::info!(grace_secs = grace.as_secs_f64(), "Stopping consumer");
        running.intake.cancel();

        // A reload finishing after release would put a resource back.
        if let Some(mut watcher) = running.watcher {
            if tokio::time::timeout(grace, &mut watcher).await.is_err() {
                tracing::warn!("Reload still running at shutdown, abandoning it");
                watcher.abort();
                let _ = watcher.await;
            }
        }

        let mut consumer = running.consumer;
        let outcome = match tokio::time::timeout(grace, &mut consumer).await {
            Ok(Ok(())) => StopOutcome::Drained,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Consumer task failed");
                StopOutcome::Drained
            }
            Err(_) => {
                tracing::warn!("Grace window expired, abandoning in-flight deliveries");
                // Dropping the consumer's task set aborts the remaining
                // deliveries before they settle.
                consumer.abort();
                let _ = consumer.await;
                StopOutcome::GraceExpired
            }
        };

        self.manager.release();
        self.metrics.log_summary();
        outcome
    }

    /// Reload the configured artifact (re-resolving moving references)
    pub async fn reload(&self) -> std::result::Result<(), LoadError> {
        self.reload_from(&self.artifact).await
    }

    /// Reload from a different artifact. Failures are non-fatal: the
    /// previous resource stays active.
    pub async fn reload_from(&self, artifact: &ArtifactRef) -> std::result::Result<(), LoadError> {
        self.reloader().reload(artifact).await
    }

    pub fn reloader(&self) -> Reloader {
        Reloader::new(Arc::clone(&self.manager), self.metrics.clone())
    }

    pub fn artifact(&self) -> &ArtifactRef {
        &self.artifact
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.intake.cancel();
            running.consumer.abort();
            if let Some(watcher) = running.watcher {
                watcher.abort();
            }
        }
    }
}
