//! Candle-backed sequence classification scorer
//!
//! Loads a Hugging Face style checkpoint directory (`config.json`,
//! `tokenizer.json` or `vocab.txt`, `model.safetensors`) and runs
//! backbone → classification head → softmax on CPU or an accelerator.

use crate::model_spec::{Architecture, ModelSpec};
use crate::scorer::{normalized_labels, Scorer};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};
use candle_transformers::models::xlm_roberta::{Config as RobertaConfig, XLMRobertaModel};
use postguard_core::{LoadError, ScoreError};
use serde::de::DeserializeOwned;
use std::path::Path;
use tokenizers::{Tokenizer, TruncationDirection};

enum Backbone {
    Bert(BertModel),
    /// Positions start at `pad_token_id + 1`, unlike BERT
    Roberta(XLMRobertaModel),
    DistilBert(DistilBertModel),
}

enum Head {
    /// `bert.pooler.dense → tanh → classifier`
    Pooled {
        pooler: Option<Linear>,
        classifier: Linear,
    },
    /// `classifier.dense → tanh → classifier.out_proj`
    Roberta { dense: Linear, out_proj: Linear },
    /// `pre_classifier → relu → classifier`
    PreClassified {
        pre_classifier: Option<Linear>,
        classifier: Linear,
    },
}

pub struct SequenceScorer {
    name: String,
    tokenizer: Tokenizer,
    backbone: Backbone,
    head: Head,
    device: Device,
    labels: Vec<String>,
    max_length: usize,
}

impl SequenceScorer {
    /// Load a checkpoint directory according to `spec`
    pub fn load(model_dir: &Path, spec: &ModelSpec) -> Result<Self, LoadError> {
        let config_path = model_dir.join("config.json");
        let raw_config: serde_json::Value = parse_json_config(&config_path)?;

        let hidden_size = raw_config
            .get("hidden_size")
            .or_else(|| raw_config.get("dim"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                LoadError::invalid(format!("no hidden size in {}", config_path.display()))
            })? as usize;

        let labels = resolve_labels(spec, &raw_config)?;
        let num_labels = labels.len();

        let tokenizer = load_tokenizer(model_dir)?;
        let device = get_device(&spec.device)?;
        let vb = load_var_builder(model_dir, &device)?;

        let (backbone, head) = match spec.architecture {
            Architecture::Bert => {
                let config: BertConfig = parse_json_config(&config_path)?;
                let model = BertModel::load(vb.pp("bert"), &config)
                    .map_err(|e| LoadError::invalid(format!("Failed to load BERT backbone: {}", e)))?;
                let pooler = candle_nn::linear(hidden_size, hidden_size, vb.pp("bert.pooler.dense")).ok();
                let classifier = load_linear(&vb, "classifier", hidden_size, num_labels)?;
                (Backbone::Bert(model), Head::Pooled { pooler, classifier })
            }
            Architecture::Roberta => {
                let config = roberta_config(&raw_config)?;
                let model = XLMRobertaModel::new(&config, vb.pp("roberta")).map_err(|e| {
                    LoadError::invalid(format!("Failed to load RoBERTa backbone: {}", e))
                })?;
                let dense = load_linear(&vb, "classifier.dense", hidden_size, hidden_size)?;
                let out_proj = load_linear(&vb, "classifier.out_proj", hidden_size, num_labels)?;
                (Backbone::Roberta(model), Head::Roberta { dense, out_proj })
            }
            Architecture::DistilBert => {
                let config: DistilBertConfig = parse_json_config(&config_path)?;
                let model = DistilBertModel::load(vb.pp("distilbert"), &config).map_err(|e| {
                    LoadError::invalid(format!("Failed to load DistilBERT model: {}", e))
                })?;
                let pre_classifier =
                    candle_nn::linear(hidden_size, hidden_size, vb.pp("pre_classifier")).ok();
                let classifier = load_linear(&vb, "classifier", hidden_size, num_labels)?;
                (
                    Backbone::DistilBert(model),
                    Head::PreClassified {
                        pre_classifier,
                        classifier,
                    },
                )
            }
        };

        let name = model_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("sequence-classifier")
            .to_string();

        tracing::info!(
            model = %name,
            architecture = ?spec.architecture,
            ?labels,
            "Loaded sequence classifier"
        );

        Ok(Self {
            name,
            tokenizer,
            backbone,
            head,
            device,
            labels,
            max_length: spec.max_length,
        })
    }

    fn forward(&self, ids: &[u32], type_ids: &[u32], mask: &[u32]) -> candle_core::Result<Vec<f32>> {
        let cls_embedding = match &self.backbone {
            Backbone::Bert(model) => {
                let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
                let token_type_ids = Tensor::new(type_ids, &self.device)?.unsqueeze(0)?;
                model
                    .forward(&input_ids, &token_type_ids, None)?
                    .i((0, 0, ..))?
                    .unsqueeze(0)?
            }
            Backbone::Roberta(model) => {
                let input_ids = Tensor::new(ids, &self.device)?.unsqueeze(0)?;
                let token_type_ids = Tensor::new(type_ids, &self.device)?.unsqueeze(0)?;
                let attention_mask = Tensor::new(mask, &self.device)?.unsqueeze(0)?;
                model
                    .forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)?
                    .i((0, 0, ..))?
                    .unsqueeze(0)?
            }
            Backbone::DistilBert(model) => {
                let ids: Vec<i64> = ids.iter().map(|&x| x as i64).collect();
                // DistilBERT expects 1 on positions to mask out.
                let inverted: Vec<u8> = mask.iter().map(|&x| u8::from(x == 0)).collect();
                let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
                let attention_mask = Tensor::new(inverted.as_slice(), &self.device)?.unsqueeze(0)?;
                model
                    .forward(&input_ids, &attention_mask)?
                    .i((0, 0, ..))?
                    .unsqueeze(0)?
            }
        };

        let logits = match &self.head {
            Head::Pooled { pooler, classifier } => {
                let pooled = match pooler {
                    Some(pooler) => pooler.forward(&cls_embedding)?.tanh()?,
                    None => cls_embedding,
                };
                classifier.forward(&pooled)?
            }
            Head::Roberta { dense, out_proj } => {
                out_proj.forward(&dense.forward(&cls_embedding)?.tanh()?)?
            }
            Head::PreClassified {
                pre_classifier,
                classifier,
            } => {
                let pooled = match pre_classifier {
                    Some(pre) => pre.forward(&cls_embedding)?.relu()?,
                    None => cls_embedding,
                };
                classifier.forward(&pooled)?
            }
        };

        candle_nn::ops::softmax(&logits, D::Minus1)?
            .squeeze(0)?
            .to_vec1::<f32>()
    }
}

impl Scorer for SequenceScorer {
    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn probabilities(&self, text: &str) -> Result<Vec<f32>, ScoreError> {
        let mut encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| ScoreError::inference(format!("Tokenization failed: {}", e)))?;

        encoding.truncate(self.max_length, 0, TruncationDirection::Right);

        self.forward(
            encoding.get_ids(),
            encoding.get_type_ids(),
            encoding.get_attention_mask(),
        )
        .map_err(|e| ScoreError::inference(format!("Model forward pass failed: {}", e)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Labels from the model spec, else from the checkpoint's `id2label`
fn resolve_labels(spec: &ModelSpec, raw_config: &serde_json::Value) -> Result<Vec<String>, LoadError> {
    let count = spec.class_count();
    if count > 0 {
        return Ok(normalized_labels(count, &spec.labels));
    }

    let id2label = raw_config
        .get("id2label")
        .and_then(|v| v.as_object())
        .ok_or_else(|| LoadError::invalid("no labels configured and no id2label in config.json"))?;

    let mut labels = vec![String::new(); id2label.len()];
    for (idx, label) in id2label {
        let idx: usize = idx
            .parse()
            .map_err(|_| LoadError::invalid(format!("bad id2label key '{}'", idx)))?;
        let slot = labels
            .get_mut(idx)
            .ok_or_else(|| LoadError::invalid(format!("id2label index {} out of range", idx)))?;
        *slot = label.as_str().unwrap_or_default().to_lowercase();
    }

    Ok(normalized_labels(labels.len(), &labels))
}

/// RoBERTa backbone config; older checkpoints omit `position_embedding_type`
fn roberta_config(raw_config: &serde_json::Value) -> Result<RobertaConfig, LoadError> {
    let mut raw = raw_config.clone();
    if let Some(fields) = raw.as_object_mut() {
        fields
            .entry("position_embedding_type")
            .or_insert_with(|| serde_json::Value::from("absolute"));
    }

    serde_json::from_value(raw)
        .map_err(|e| LoadError::invalid(format!("Failed to parse RoBERTa config: {}", e)))
}

fn get_device(device_str: &str) -> Result<Device, LoadError> {
    match device_str.to_lowercase().as_str() {
        "cuda" | "cuda:0" => Device::new_cuda(0)
            .map_err(|e| LoadError::invalid(format!("Failed to initialize CUDA: {}", e))),
        "mps" | "metal" => Device::new_metal(0)
            .map_err(|e| LoadError::invalid(format!("Failed to initialize Metal: {}", e))),
        _ => Ok(Device::Cpu),
    }
}

fn parse_json_config<T: DeserializeOwned>(config_path: &Path) -> Result<T, LoadError> {
    let config_str = std::fs::read_to_string(config_path).map_err(|e| {
        LoadError::not_found(format!("Failed to read config {}: {}", config_path.display(), e))
    })?;

    serde_json::from_str(&config_str).map_err(|e| {
        LoadError::invalid(format!("Failed to parse config {}: {}", config_path.display(), e))
    })
}

fn load_var_builder(model_path: &Path, device: &Device) -> Result<VarBuilder<'static>, LoadError> {
    let weights_path = model_path.join("model.safetensors");
    if !weights_path.exists() {
        return Err(LoadError::not_found(format!(
            "model.safetensors not found in {}",
            model_path.display()
        )));
    }

    // SAFETY: the weights file is treated as read-only for the lifetime of
    // the mapping; artifacts are immutable once published.
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, device)
            .map_err(|e| LoadError::invalid(format!("Failed to load weights: {}", e)))?
    };

    Ok(vb)
}

fn load_linear(vb: &VarBuilder, prefix: &str, in_dim: usize, out_dim: usize) -> Result<Linear, LoadError> {
    candle_nn::linear(in_dim, out_dim, vb.pp(prefix)).map_err(|e| {
        LoadError::invalid(format!(
            "classification layer '{}' ({}x{}) missing from checkpoint: {}",
            prefix, out_dim, in_dim, e
        ))
    })
}

fn load_tokenizer(model_path: &Path) -> Result<Tokenizer, LoadError> {
    let tokenizer_json_path = model_path.join("tokenizer.json");
    if tokenizer_json_path.exists() {
        tracing::debug!("Loading tokenizer from tokenizer.json");
        return Tokenizer::from_file(&tokenizer_json_path)
            .map_err(|e| LoadError::invalid(format!("Failed to load tokenizer.json: {}", e)));
    }

    let vocab_path = model_path.join("vocab.txt");
    if vocab_path.exists() {
        tracing::debug!("Building tokenizer from vocab.txt");

        use tokenizers::models::wordpiece::WordPiece;
        use tokenizers::normalizers::BertNormalizer;
        use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
        use tokenizers::processors::bert::BertProcessing;

        let wordpiece = WordPiece::from_file(vocab_path.to_string_lossy().as_ref())
            .unk_token("[UNK]".to_string())
            .build()
            .map_err(|e| LoadError::invalid(format!("Failed to build WordPiece model: {}", e)))?;

        let mut tokenizer = Tokenizer::new(wordpiece);
        tokenizer.with_normalizer(Some(BertNormalizer::default()));
        tokenizer.with_pre_tokenizer(Some(BertPreTokenizer));

        let sep = ("[SEP]".to_string(), 102);
        let cls = ("[CLS]".to_string(), 101);
        tokenizer.with_post_processor(Some(BertProcessing::new(sep, cls)));

        return Ok(tokenizer);
    }

    Err(LoadError::not_found(format!(
        "No tokenizer found in {} (tried tokenizer.json, vocab.txt)",
        model_path.display()
    )))
}
