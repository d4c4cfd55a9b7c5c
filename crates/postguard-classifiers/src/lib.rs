//! PostGuard Classifiers
//!
//! Scoring resources for the moderation pipeline and the manager that keeps
//! exactly one of them active while allowing hot reloads.
//!
//! - [`Scorer`]: the opaque inference contract (probabilities over labels)
//! - [`ScoringResource`]: a loaded artifact plus its flag-class selection
//! - [`ResourceLoader`]: artifact reference → resource (default: [`ArtifactLoader`])
//! - [`ResourceManager`]: active-slot ownership, copy-on-reload, bounded
//!   inference dispatch

pub mod artifact;
pub mod lexicon;
pub mod loader;
pub mod manager;
pub mod model_spec;
pub mod resource;
pub mod scorer;
#[cfg(feature = "ml-models")]
pub mod sequence;

pub use artifact::{ArtifactIdentity, ArtifactRef, ResolvedArtifact};
pub use lexicon::LexiconScorer;
pub use loader::{ArtifactLoader, ResourceLoader};
pub use manager::{default_compute_workers, ResourceManager, ScoringHandle};
pub use model_spec::{Architecture, ModelSpec};
pub use resource::ScoringResource;
pub use scorer::Scorer;
#[cfg(feature = "ml-models")]
pub use sequence::SequenceScorer;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::artifact::{ArtifactIdentity, ArtifactRef};
    pub use crate::loader::{ArtifactLoader, ResourceLoader};
    pub use crate::manager::{ResourceManager, ScoringHandle};
    pub use crate::model_spec::ModelSpec;
    pub use crate::resource::ScoringResource;
    pub use crate::scorer::Scorer;
}
