//! Resource manager: owns the active scoring resource and swaps it on reload
//!
//! The active slot is an `Option<Arc<ScoringResource>>` behind a
//! `parking_lot::RwLock` that is only ever held long enough to clone or
//! replace the `Arc`. Replacement resources are built completely before the
//! swap (copy-on-reload), so inference never runs under the lock and readers
//! never see a half-built resource. A scoring call keeps its own `Arc` for
//! its full duration, which keeps a superseded resource alive until the last
//! in-flight call against it returns.

use crate::artifact::{ArtifactIdentity, ArtifactRef};
use crate::loader::ResourceLoader;
use crate::resource::ScoringResource;
use parking_lot::RwLock;
use postguard_core::{LoadError, ScoreError};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};

/// Default size of the inference pool
pub fn default_compute_workers() -> usize {
    num_cpus::get().max(1)
}

pub struct ResourceManager {
    loader: Arc<dyn ResourceLoader>,
    active: RwLock<Option<Arc<ScoringResource>>>,
    /// Serializes load/reload so at most one replacement is built at a time
    reload_lock: Mutex<()>,
    /// Permits for concurrent inference jobs on the blocking pool
    compute: Arc<Semaphore>,
}

/// Proof that a resource has been loaded.
///
/// Only [`ResourceManager::load`] can produce one, and consumers are built
/// from it, so a consumer cannot exist before the first successful load.
#[derive(Clone)]
pub struct ScoringHandle {
    manager: Arc<ResourceManager>,
}

impl ResourceManager {
    /// Create an empty manager; nothing can be scored until [`load`](Self::load)
    pub fn new(loader: Arc<dyn ResourceLoader>, compute_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            loader,
            active: RwLock::new(None),
            reload_lock: Mutex::new(()),
            compute: Arc::new(Semaphore::new(compute_workers.max(1))),
        })
    }

    /// First-time construction of the active resource
    pub async fn load(self: &Arc<Self>, artifact: &ArtifactRef) -> Result<ScoringHandle, LoadError> {
        self.install(artifact, "load").await?;
        Ok(ScoringHandle {
            manager: Arc::clone(self),
        })
    }

    /// Build a replacement from `artifact` and swap it in. On failure the
    /// active resource is left untouched.
    pub async fn reload(&self, artifact: &ArtifactRef) -> Result<(), LoadError> {
        self.install(artifact, "reload").await
    }

    async fn install(&self, artifact: &ArtifactRef, op: &'static str) -> Result<(), LoadError> {
        let _reload = self.reload_lock.lock().await;
        let started = Instant::now();

        let resource = match self.loader.load(artifact).await {
            Ok(resource) => Arc::new(resource),
            Err(e) => {
                tracing::warn!(artifact = %artifact, error = %e, "Failed to {} scoring resource", op);
                return Err(e);
            }
        };

        let identity = resource.identity().clone();
        let previous = self.active.write().replace(resource);

        match previous {
            Some(previous) => tracing::info!(
                from = %previous.identity(),
                to = %identity,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Swapped scoring resource"
            ),
            None => tracing::info!(
                artifact = %identity,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Scoring resource loaded"
            ),
        }

        Ok(())
    }

    /// Snapshot of the active resource
    pub fn current(&self) -> Option<Arc<ScoringResource>> {
        self.active.read().clone()
    }

    pub fn active_identity(&self) -> Option<ArtifactIdentity> {
        self.active.read().as_ref().map(|r| r.identity().clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.active.read().is_some()
    }

    /// Score `text` with whichever resource is active at call time.
    ///
    /// Inference runs on the blocking pool; the caller suspends until a
    /// compute permit is free and the job returns.
    pub async fn score(&self, text: &str) -> Result<f32, ScoreError> {
        let resource = self.current().ok_or(ScoreError::NotLoaded)?;

        let permit = Arc::clone(&self.compute)
            .acquire_owned()
            .await
            .map_err(|_| ScoreError::inference("compute pool closed"))?;

        let text = text.to_owned();
        tokio::task::spawn_blocking(move || {
            // Held by the job, not the caller: a cancelled caller must not
            // free the permit while inference is still running.
            let _permit = permit;
            resource.score(&text)
        })
        .await
        .map_err(|e| ScoreError::inference(format!("scoring task failed: {}", e)))?
    }

    /// Empty the active slot. Subsequent calls fail with `NotLoaded`;
    /// calls already running finish against the released resource.
    pub fn release(&self) -> bool {
        match self.active.write().take() {
            Some(resource) => {
                tracing::info!(artifact = %resource.identity(), "Scoring resource released");
                true
            }
            None => false,
        }
    }
}

impl ScoringHandle {
    pub async fn score(&self, text: &str) -> Result<f32, ScoreError> {
        self.manager.score(text).await
    }

    pub fn manager(&self) -> &Arc<ResourceManager> {
        &self.manager
    }
}

impl std::fmt::Debug for ScoringHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringHandle")
            .field("active", &self.manager.active_identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ArtifactLoader;
    use crate::model_spec::ModelSpec;

    fn manager() -> Arc<ResourceManager> {
        ResourceManager::new(Arc::new(ArtifactLoader::new(ModelSpec::default())), 2)
    }

    #[tokio::test]
    async fn test_score_before_load() {
        let manager = manager();
        assert!(!manager.is_loaded());
        assert_eq!(manager.score("x").await, Err(ScoreError::NotLoaded));
    }

    #[tokio::test]
    async fn test_load_then_score() {
        let manager = manager();
        let handle = manager.load(&"builtin:lexicon".parse().unwrap()).await.unwrap();

        assert_eq!(handle.score("what an awful, stupid post").await.unwrap(), 1.0);
        assert_eq!(
            manager.active_identity().unwrap().locator,
            "builtin:lexicon"
        );
    }

    #[tokio::test]
    async fn test_failed_first_load_stays_unloaded() {
        let manager = manager();
        let err = manager.load(&"builtin:missing".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
        assert!(!manager.is_loaded());
    }

    #[tokio::test]
    async fn test_release() {
        let manager = manager();
        let handle = manager.load(&"builtin:lexicon".parse().unwrap()).await.unwrap();

        assert!(manager.release());
        assert!(!manager.release());
        assert_eq!(handle.score("x").await, Err(ScoreError::NotLoaded));
    }
}
