//! Resource loader: artifact reference → fully constructed resource

use crate::artifact::{ArtifactRef, ResolvedArtifact, BUILTIN_LEXICON};
use crate::lexicon::LexiconScorer;
use crate::model_spec::ModelSpec;
use crate::resource::ScoringResource;
use crate::scorer::Scorer;
use async_trait::async_trait;
use postguard_core::LoadError;

/// Builds scoring resources from artifact references.
///
/// The manager calls this off to the side of the active slot, so an
/// implementation may take as long as it needs; it must either return a
/// complete resource or an error.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, artifact: &ArtifactRef) -> Result<ScoringResource, LoadError>;
}

/// Default loader: resolves the reference and builds the matching scorer
pub struct ArtifactLoader {
    spec: ModelSpec,
}

impl ArtifactLoader {
    pub fn new(spec: ModelSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn load_blocking(spec: &ModelSpec, artifact: &ArtifactRef) -> Result<ScoringResource, LoadError> {
        let (identity, resolved) = artifact.resolve()?;

        let inference: Box<dyn Scorer> = match resolved {
            ResolvedArtifact::Builtin(name) if name == BUILTIN_LEXICON => {
                Box::new(LexiconScorer::new(spec.max_length)?)
            }
            ResolvedArtifact::Builtin(name) => {
                return Err(LoadError::not_found(format!("unknown builtin '{}'", name)));
            }
            ResolvedArtifact::Directory(dir) => Self::load_directory(spec, &dir)?,
        };

        let flag_index = spec.flag_class(inference.labels())?;
        ScoringResource::new(identity, spec.max_length, flag_index, inference)
    }

    #[cfg(feature = "ml-models")]
    fn load_directory(spec: &ModelSpec, dir: &std::path::Path) -> Result<Box<dyn Scorer>, LoadError> {
        Ok(Box::new(crate::sequence::SequenceScorer::load(dir, spec)?))
    }

    #[cfg(not(feature = "ml-models"))]
    fn load_directory(_spec: &ModelSpec, dir: &std::path::Path) -> Result<Box<dyn Scorer>, LoadError> {
        Err(LoadError::invalid(format!(
            "loading {} requires the 'ml-models' feature",
            dir.display()
        )))
    }
}

#[async_trait]
impl ResourceLoader for ArtifactLoader {
    async fn load(&self, artifact: &ArtifactRef) -> Result<ScoringResource, LoadError> {
        tracing::info!(artifact = %artifact, "Loading scoring resource");

        let spec = self.spec.clone();
        let artifact = artifact.clone();

        // Resolution and weight loading are blocking (filesystem, mmap, Hub).
        tokio::task::spawn_blocking(move || Self::load_blocking(&spec, &artifact))
            .await
            .map_err(|e| LoadError::invalid(format!("loader task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_builtin_lexicon() {
        let loader = ArtifactLoader::new(ModelSpec::default());
        let artifact: ArtifactRef = "builtin:lexicon".parse().unwrap();

        let resource = loader.load(&artifact).await.unwrap();
        assert_eq!(resource.identity().locator, "builtin:lexicon");
        assert_eq!(resource.flag_label(), "negative");
        assert_eq!(resource.score("").unwrap(), 0.0);
        assert_eq!(resource.score("this is awful").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_unknown_flag_label_is_invalid() {
        let loader = ArtifactLoader::new(ModelSpec {
            flag_label: Some("toxic".to_string()),
            ..Default::default()
        });
        let artifact: ArtifactRef = "builtin:lexicon".parse().unwrap();

        let err = loader.load(&artifact).await.unwrap_err();
        assert!(matches!(err, LoadError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_found() {
        let loader = ArtifactLoader::new(ModelSpec::default());
        let artifact: ArtifactRef = "/no/such/model".parse().unwrap();

        let err = loader.load(&artifact).await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }
}
