//! Artifact references and their resolution to loadable locations
//!
//! A reference is an opaque locator string handed to `load`/`reload`:
//!
//! - `builtin:<name>`: a scorer bundled with the binary (`builtin:lexicon`)
//! - `latest:<dir>`: the version named by `<dir>/latest.json`, i.e.
//!   `{"version": "v3"}` resolves to `<dir>/v3`
//! - `hf:<repo>[@<revision>]`: a Hugging Face Hub checkpoint
//! - anything else: a local artifact directory

use postguard_core::LoadError;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Builtin scorers known to the loader
pub const BUILTIN_LEXICON: &str = "lexicon";

/// Files fetched for a Hub checkpoint
const HF_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

/// Opaque locator of a model artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Builtin(String),
    Latest(PathBuf),
    HuggingFace { repo: String, revision: String },
    Local(PathBuf),
}

/// Identity of a resolved artifact, recorded on the resource built from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactIdentity {
    /// The reference as given
    pub locator: String,

    /// Version the reference resolved to
    pub version: String,
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.locator, self.version)
    }
}

/// Where the resolved artifact lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedArtifact {
    Builtin(String),
    Directory(PathBuf),
}

#[derive(Debug, Deserialize)]
struct LatestPointer {
    version: String,
}

impl FromStr for ArtifactRef {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LoadError::not_found("empty artifact reference"));
        }

        if let Some(name) = s.strip_prefix("builtin:") {
            return Ok(Self::Builtin(name.to_string()));
        }

        if let Some(dir) = s.strip_prefix("latest:") {
            return Ok(Self::Latest(PathBuf::from(dir)));
        }

        if let Some(repo) = s.strip_prefix("hf:") {
            let (repo, revision) = match repo.split_once('@') {
                Some((repo, revision)) => (repo, revision),
                None => (repo, "main"),
            };
            if repo.is_empty() {
                return Err(LoadError::not_found(format!("no repository in '{}'", s)));
            }
            return Ok(Self::HuggingFace {
                repo: repo.to_string(),
                revision: revision.to_string(),
            });
        }

        Ok(Self::Local(PathBuf::from(s)))
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(name) => write!(f, "builtin:{}", name),
            Self::Latest(dir) => write!(f, "latest:{}", dir.display()),
            Self::HuggingFace { repo, revision } => write!(f, "hf:{}@{}", repo, revision),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl ArtifactRef {
    /// Resolve to a loadable location. Blocking: may read the filesystem or
    /// download from the Hub.
    pub fn resolve(&self) -> Result<(ArtifactIdentity, ResolvedArtifact), LoadError> {
        let version = self.current_version()?;
        let identity = ArtifactIdentity {
            locator: self.to_string(),
            version: version.clone(),
        };

        let resolved = match self {
            Self::Builtin(name) => ResolvedArtifact::Builtin(name.clone()),
            Self::Latest(dir) => ResolvedArtifact::Directory(existing_dir(&dir.join(&version))?),
            Self::Local(path) => ResolvedArtifact::Directory(existing_dir(path)?),
            Self::HuggingFace { repo, revision } => {
                ResolvedArtifact::Directory(download_from_huggingface(repo, revision)?)
            }
        };

        Ok((identity, resolved))
    }

    /// Version this reference currently points at, without loading anything
    pub fn current_version(&self) -> Result<String, LoadError> {
        match self {
            Self::Builtin(name) => {
                if name != BUILTIN_LEXICON {
                    return Err(LoadError::not_found(format!("unknown builtin '{}'", name)));
                }
                Ok(env!("CARGO_PKG_VERSION").to_string())
            }
            Self::Latest(dir) => read_latest_version(dir),
            Self::Local(path) => Ok(path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("local")
                .to_string()),
            Self::HuggingFace { revision, .. } => Ok(revision.clone()),
        }
    }
}

fn existing_dir(path: &Path) -> Result<PathBuf, LoadError> {
    if !path.is_dir() {
        return Err(LoadError::not_found(format!(
            "artifact directory does not exist: {}",
            path.display()
        )));
    }
    Ok(path.to_path_buf())
}

fn read_latest_version(dir: &Path) -> Result<String, LoadError> {
    let meta_path = dir.join("latest.json");
    let contents = std::fs::read_to_string(&meta_path).map_err(|e| {
        LoadError::not_found(format!("no model metadata at {}: {}", meta_path.display(), e))
    })?;

    let pointer: LatestPointer = serde_json::from_str(&contents).map_err(|e| {
        LoadError::invalid(format!("malformed {}: {}", meta_path.display(), e))
    })?;

    let version = pointer.version.trim();
    if version.is_empty() || version.contains(|c| c == '/' || c == '\\') || version == ".." {
        return Err(LoadError::invalid(format!(
            "invalid version '{}' in {}",
            pointer.version,
            meta_path.display()
        )));
    }

    Ok(version.to_string())
}

/// Where Hub checkpoints are cached between runs
fn model_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache/postguard/models")
}

fn download_from_huggingface(repo: &str, revision: &str) -> Result<PathBuf, LoadError> {
    tracing::info!(repo, revision, "Downloading model from HuggingFace");

    let api = hf_hub::api::sync::ApiBuilder::new()
        .with_cache_dir(model_cache_dir())
        .build()
        .map_err(|e| {
            LoadError::not_found(format!("Failed to initialize HuggingFace API: {}", e))
        })?;

    let repo_obj = api.repo(hf_hub::Repo::with_revision(
        repo.to_string(),
        hf_hub::RepoType::Model,
        revision.to_string(),
    ));

    let mut model_dir = None;
    for file in HF_FILES {
        tracing::debug!("Downloading {}", file);
        let path = repo_obj
            .get(file)
            .map_err(|e| LoadError::not_found(format!("Failed to download {}: {}", file, e)))?;
        model_dir = path.parent().map(Path::to_path_buf);
    }

    let model_dir = model_dir.ok_or_else(|| LoadError::invalid("Invalid cache path"))?;
    tracing::info!("Model available at: {}", model_dir.display());
    Ok(model_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            "builtin:lexicon".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Builtin("lexicon".to_string())
        );
        assert_eq!(
            "latest:/models/sentiment".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Latest(PathBuf::from("/models/sentiment"))
        );
        assert_eq!(
            "hf:w11wo/indonesian-roberta-base-sentiment-classifier"
                .parse::<ArtifactRef>()
                .unwrap(),
            ArtifactRef::HuggingFace {
                repo: "w11wo/indonesian-roberta-base-sentiment-classifier".to_string(),
                revision: "main".to_string(),
            }
        );
        assert_eq!(
            "hf:org/model@v2".parse::<ArtifactRef>().unwrap().to_string(),
            "hf:org/model@v2"
        );
        assert_eq!(
            "./models/v1".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Local(PathBuf::from("./models/v1"))
        );
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!("  ".parse::<ArtifactRef>(), Err(LoadError::NotFound(_))));
        assert!(matches!("hf:@main".parse::<ArtifactRef>(), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn test_resolve_builtin() {
        let (identity, resolved) = ArtifactRef::Builtin("lexicon".to_string())
            .resolve()
            .unwrap();
        assert_eq!(identity.locator, "builtin:lexicon");
        assert_eq!(resolved, ResolvedArtifact::Builtin("lexicon".to_string()));

        let err = ArtifactRef::Builtin("nope".to_string()).resolve().unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[test]
    fn test_resolve_latest_pointer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("v2")).unwrap();
        std::fs::write(dir.path().join("latest.json"), r#"{"version": "v2"}"#).unwrap();

        let artifact = ArtifactRef::Latest(dir.path().to_path_buf());
        let (identity, resolved) = artifact.resolve().unwrap();
        assert_eq!(identity.version, "v2");
        assert_eq!(resolved, ResolvedArtifact::Directory(dir.path().join("v2")));
    }

    #[test]
    fn test_resolve_latest_errors() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ArtifactRef::Latest(dir.path().to_path_buf());

        assert!(matches!(artifact.resolve(), Err(LoadError::NotFound(_))));

        std::fs::write(dir.path().join("latest.json"), "{").unwrap();
        assert!(matches!(artifact.resolve(), Err(LoadError::Invalid(_))));

        std::fs::write(dir.path().join("latest.json"), r#"{"version": "../etc"}"#).unwrap();
        assert!(matches!(artifact.resolve(), Err(LoadError::Invalid(_))));

        std::fs::write(dir.path().join("latest.json"), r#"{"version": "v9"}"#).unwrap();
        assert!(matches!(artifact.resolve(), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn test_resolve_missing_local() {
        let artifact = ArtifactRef::Local(PathBuf::from("/definitely/not/here"));
        assert!(matches!(artifact.resolve(), Err(LoadError::NotFound(_))));
    }
}
