//! Model specification: how to turn a resolved artifact into a scorer

use postguard_core::LoadError;
use serde::{Deserialize, Serialize};

/// Everything needed to build an inference handle besides the artifact itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Network family of the checkpoint (ignored by builtin artifacts)
    #[serde(default)]
    pub architecture: Architecture,

    /// Class labels in logit order; padded with `label_<n>` when short
    #[serde(default)]
    pub labels: Vec<String>,

    /// Number of output classes; defaults to `labels.len()`
    #[serde(default)]
    pub num_labels: Option<usize>,

    /// Name of the class whose probability is the flag score
    #[serde(default = "default_flag_label")]
    pub flag_label: Option<String>,

    /// Index of the flag class; wins over `flag_label` when both are set
    #[serde(default)]
    pub flag_index: Option<usize>,

    /// Maximum sequence length (tokens, or words for the lexicon)
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Device to run on (cpu, cuda, mps)
    #[serde(default = "default_device")]
    pub device: String,
}

/// Supported checkpoint families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    #[default]
    Bert,
    Roberta,
    DistilBert,
}

fn default_flag_label() -> Option<String> {
    Some("negative".to_string())
}

fn default_max_length() -> usize {
    256
}

fn default_device() -> String {
    "cpu".to_string()
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            architecture: Architecture::default(),
            labels: vec![
                "positive".to_string(),
                "neutral".to_string(),
                "negative".to_string(),
            ],
            num_labels: None,
            flag_label: default_flag_label(),
            flag_index: None,
            max_length: default_max_length(),
            device: default_device(),
        }
    }
}

impl ModelSpec {
    /// Load a model spec from a YAML file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoadError::not_found(format!("model spec {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| LoadError::invalid(format!("model spec {}: {}", path.display(), e)))
    }

    /// Effective number of classes
    pub fn class_count(&self) -> usize {
        self.num_labels.unwrap_or(self.labels.len())
    }

    /// Resolve which class index carries the flag score for `labels`.
    ///
    /// A binary model with no explicit choice flags on index 1; anything
    /// wider must be configured, there is no safe guess.
    pub fn flag_class(&self, labels: &[String]) -> Result<usize, LoadError> {
        if let Some(index) = self.flag_index {
            if index >= labels.len() {
                return Err(LoadError::invalid(format!(
                    "flag_index {} out of range for {} labels",
                    index,
                    labels.len()
                )));
            }
            return Ok(index);
        }

        if let Some(label) = &self.flag_label {
            return labels.iter().position(|l| l == label).ok_or_else(|| {
                LoadError::invalid(format!(
                    "flag_label '{}' not among model labels {:?}",
                    label, labels
                ))
            });
        }

        if labels.len() == 2 {
            return Ok(1);
        }

        Err(LoadError::invalid(format!(
            "flag class is ambiguous for {} labels; set flag_label or flag_index",
            labels.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_model_spec() {
        let yaml = r#"
architecture: roberta
labels: [positive, neutral, negative]
flag_label: negative
max_length: 128
"#;
        let spec: ModelSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.architecture, Architecture::Roberta);
        assert_eq!(spec.max_length, 128);
        assert_eq!(spec.device, "cpu");
        assert_eq!(spec.flag_class(&spec.labels).unwrap(), 2);
    }

    #[test]
    fn test_flag_index_wins() {
        let spec = ModelSpec {
            flag_index: Some(0),
            ..Default::default()
        };
        assert_eq!(spec.flag_class(&spec.labels).unwrap(), 0);
    }

    #[test]
    fn test_flag_index_out_of_range() {
        let spec = ModelSpec {
            flag_index: Some(3),
            ..Default::default()
        };
        assert!(matches!(spec.flag_class(&spec.labels), Err(LoadError::Invalid(_))));
    }

    #[test]
    fn test_unknown_flag_label() {
        let spec = ModelSpec::default();
        let result = spec.flag_class(&labels(&["toxic", "clean"]));
        assert!(matches!(result, Err(LoadError::Invalid(_))));
    }

    #[test]
    fn test_binary_default_and_ambiguous() {
        let spec = ModelSpec {
            flag_label: None,
            ..Default::default()
        };
        assert_eq!(spec.flag_class(&labels(&["clean", "toxic"])).unwrap(), 1);
        assert!(spec.flag_class(&labels(&["a", "b", "c"])).is_err());
    }
}
