//! Reload triggering
//!
//! [`Reloader`] is the entry point every trigger goes through (signal,
//! poll, coordinator); it logs and counts the attempt and never lets a
//! failed reload take the active resource down. [`watch`] re-resolves an
//! artifact reference on an interval and reloads when the version it
//! points at has moved.

use postguard_classifiers::{ArtifactRef, ResourceManager};
use postguard_core::LoadError;
use postguard_telemetry::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Reloader {
    manager: Arc<ResourceManager>,
    metrics: PipelineMetrics,
}

impl Reloader {
    pub fn new(manager: Arc<ResourceManager>, metrics: PipelineMetrics) -> Self {
        Self { manager, metrics }
    }

    /// Swap in a resource built from `artifact`. On failure the previous
    /// resource keeps serving and the error is returned for reporting only.
    pub async fn reload(&self, artifact: &ArtifactRef) -> Result<(), LoadError> {
        match self.manager.reload(artifact).await {
            Ok(()) => {
                self.metrics.record_reload(true);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_reload(false);
                tracing::warn!(
                    artifact = %artifact,
                    active = ?self.manager.active_identity().map(|id| id.to_string()),
                    error = %e,
                    "Reload failed, keeping active resource"
                );
                Err(e)
            }
        }
    }

    /// Reload only if `artifact` now resolves to a different version than
    /// the active resource. Returns whether a reload happened.
    pub async fn reload_if_changed(&self, artifact: &ArtifactRef) -> Result<bool, LoadError> {
        let pointer = artifact.clone();
        let latest = tokio::task::spawn_blocking(move || pointer.current_version())
            .await
            .map_err(|e| LoadError::invalid(format!("version check failed: {}", e)))??;

        let active = self.manager.active_identity();
        let unchanged = active
            .as_ref()
            .is_some_and(|id| id.locator == artifact.to_string() && id.version == latest);
        if unchanged {
            return Ok(false);
        }

        tracing::info!(
            artifact = %artifact,
            from = ?active.map(|id| id.version),
            to = %latest,
            "Artifact version changed"
        );
        self.reload(artifact).await?;
        Ok(true)
    }
}

/// Poll `artifact` every `interval` until `shutdown` fires
pub async fn watch(
    reloader: Reloader,
    artifact: ArtifactRef,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(artifact = %artifact, interval_secs = interval.as_secs(), "Watching artifact for new versions");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already loaded.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = reloader.reload_if_changed(&artifact).await {
                    tracing::debug!(artifact = %artifact, error = %e, "Version check did not reload");
                }
            }
        }
    }

    tracing::debug!(artifact = %artifact, "Artifact watcher stopped");
}
