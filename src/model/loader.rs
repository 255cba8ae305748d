// loader.rs — Loads a sentence-transformers checkpoint from a local directory.
//
// Layout (as written by SentenceTransformer.save):
//   modules.json                 pipeline modules (Transformer, Pooling, Normalize)
//   config.json                  encoder config (HF transformers)
//   model.safetensors            encoder weights (or pytorch_model.bin)
//   tokenizer.json               fast tokenizer definition
//   1_Pooling/config.json        pooling flags
//   sentence_bert_config.json    optional, max_seq_length

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::config;
use crate::error::ExportError;
use crate::model::pooling::PoolingConfig;

const TRANSFORMER_MODULE: &str = "sentence_transformers.models.Transformer";
const POOLING_MODULE: &str = "sentence_transformers.models.Pooling";
const NORMALIZE_MODULE: &str = "sentence_transformers.models.Normalize";

// Prefixes seen on encoder weights depending on which class saved the checkpoint.
const WEIGHT_PREFIXES: [&str; 4] = ["", "bert.", "roberta.", "model."];

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleEntry {
    #[serde(default)]
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Where each pipeline stage lives inside the checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub transformer_dir: String,
    pub pooling_dir: String,
    pub normalize: bool,
}

impl Default for ModuleLayout {
    fn default() -> Self {
        Self {
            transformer_dir: String::new(),
            pooling_dir: config::model::DEFAULT_POOLING_DIR.to_string(),
            normalize: false,
        }
    }
}

impl ModuleLayout {
    pub fn parse(modules_json: &str) -> anyhow::Result<Self> {
        let entries: Vec<ModuleEntry> = serde_json::from_str(modules_json).context("parse modules.json")?;
        let transformer = entries
            .iter()
            .find(|m| m.kind == TRANSFORMER_MODULE)
            .context("modules.json has no Transformer module")?;
        let pooling = entries
            .iter()
            .find(|m| m.kind == POOLING_MODULE)
            .context("modules.json has no Pooling module")?;
        Ok(Self {
            transformer_dir: transformer.path.clone(),
            pooling_dir: pooling.path.clone(),
            normalize: entries.iter().any(|m| m.kind == NORMALIZE_MODULE),
        })
    }

    pub fn read(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(config::model::MODULES_FILE);
        if !path.exists() {
            log::warn!("{} not found, assuming default module layout", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Absolute positions `0..seq_len`.
    Bert,
    /// Positions count non-padding tokens starting after `pad_token_id`.
    Roberta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Gelu,
    Relu,
}

fn default_model_type() -> String {
    "bert".to_string()
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

/// The subset of HF `config.json` the encoder forward pass needs.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: Option<i64>,
    #[serde(default)]
    pub position_embedding_type: Option<String>,
}

impl EncoderConfig {
    pub fn architecture(&self) -> Result<Architecture, ExportError> {
        match self.model_type.as_str() {
            "bert" => Ok(Architecture::Bert),
            "roberta" | "xlm-roberta" | "camembert" => Ok(Architecture::Roberta),
            other => Err(ExportError::UnsupportedArchitecture {
                detail: format!("model_type `{other}`"),
            }),
        }
    }

    pub fn activation(&self) -> Result<Activation, ExportError> {
        match self.hidden_act.as_str() {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            other => Err(ExportError::UnsupportedArchitecture {
                detail: format!("hidden_act `{other}`"),
            }),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn validate(&self) -> Result<(), ExportError> {
        if let Some(kind) = self.position_embedding_type.as_deref() {
            if kind != "absolute" {
                return Err(ExportError::UnsupportedArchitecture {
                    detail: format!("position_embedding_type `{kind}`"),
                });
            }
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ExportError::UnsupportedArchitecture {
                detail: format!(
                    "hidden_size {} is not divisible by {} attention heads",
                    self.hidden_size, self.num_attention_heads
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SentenceBertConfig {
    #[serde(default)]
    max_seq_length: Option<usize>,
}

/// A loaded checkpoint: encoder config + weights, pooling config and tokenizer.
pub struct SentenceTransformer {
    pub model_id: String,
    pub encoder: EncoderConfig,
    pub architecture: Architecture,
    pub activation: Activation,
    pub pooling: PoolingConfig,
    pub normalize: bool,
    pub tokenizer: Tokenizer,
    pub max_seq_length: Option<usize>,
    pub pad_token_id: i64,
    weights: VarBuilder<'static>,
    weight_prefix: String,
}

impl SentenceTransformer {
    pub fn load(dir: &Path, model_id: &str) -> anyhow::Result<Self> {
        let layout = ModuleLayout::read(dir)?;
        let encoder_dir = dir.join(&layout.transformer_dir);

        // Load config.json
        let config_path = encoder_dir.join(config::model::CONFIG_FILE);
        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let encoder: EncoderConfig = serde_json::from_str(&config_str)
            .with_context(|| format!("parse {}", config_path.display()))?;
        encoder.validate()?;
        let architecture = encoder.architecture()?;
        let activation = encoder.activation()?;

        log::info!(
            "Loading encoder: model_type={}, hidden_size={}, layers={}, heads={}",
            encoder.model_type,
            encoder.hidden_size,
            encoder.num_hidden_layers,
            encoder.num_attention_heads,
        );

        let pooling_path = dir.join(&layout.pooling_dir).join(config::model::CONFIG_FILE);
        let pooling_str = std::fs::read_to_string(&pooling_path)
            .with_context(|| format!("read {}", pooling_path.display()))?;
        let pooling: PoolingConfig = serde_json::from_str(&pooling_str)
            .with_context(|| format!("parse {}", pooling_path.display()))?;
        if pooling.word_embedding_dimension != encoder.hidden_size {
            bail!(
                "pooling word_embedding_dimension {} does not match encoder hidden_size {}",
                pooling.word_embedding_dimension,
                encoder.hidden_size
            );
        }

        let max_seq_length = read_max_seq_length(&encoder_dir)?;

        let weights = open_weights(&encoder_dir)?;
        let weight_prefix = WEIGHT_PREFIXES
            .iter()
            .find(|p| weights.contains_tensor(&format!("{p}embeddings.word_embeddings.weight")))
            .map(|p| p.to_string())
            .ok_or_else(|| ExportError::UnsupportedArchitecture {
                detail: "checkpoint has no embeddings.word_embeddings.weight tensor".to_string(),
            })?;

        // Load tokenizer
        let tokenizer_path = encoder_dir.join(config::model::TOKENIZER_FILE);
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", tokenizer_path.display()))?;

        let pad_token_id = encoder.pad_token_id.unwrap_or(match architecture {
            Architecture::Bert => 0,
            Architecture::Roberta => 1,
        });

        log::info!(
            "Checkpoint loaded (dims={}, vocab={}, tokenizer vocab={}, weight prefix={:?})",
            encoder.hidden_size,
            encoder.vocab_size,
            tokenizer.get_vocab_size(true),
            weight_prefix
        );

        Ok(Self {
            model_id: model_id.to_string(),
            encoder,
            architecture,
            activation,
            pooling,
            normalize: layout.normalize,
            tokenizer,
            max_seq_length,
            pad_token_id,
            weights,
            weight_prefix,
        })
    }

    /// Fetch an encoder weight as f32 on CPU. Returns the full checkpoint name with the tensor.
    pub fn weight<S: Into<Shape>>(&self, name: &str, shape: S) -> anyhow::Result<(String, Tensor)> {
        let full = format!("{}{}", self.weight_prefix, name);
        let tensor = self
            .weights
            .get(shape, &full)
            .with_context(|| format!("load weight {full}"))?;
        Ok((full, tensor))
    }

    pub fn embedding_dim(&self) -> usize {
        self.pooling.word_embedding_dimension
    }

    /// Exclusive upper bound for token ids that are valid for both tokenizer and embedding table.
    pub fn token_id_bound(&self) -> usize {
        self.tokenizer.get_vocab_size(true).min(self.encoder.vocab_size)
    }

    /// Longest sequence the position embedding table can address.
    pub fn max_supported_seq_length(&self) -> usize {
        match self.architecture {
            Architecture::Bert => self.encoder.max_position_embeddings,
            Architecture::Roberta => self
                .encoder
                .max_position_embeddings
                .saturating_sub(self.pad_token_id.max(0) as usize + 1),
        }
    }
}

fn read_max_seq_length(encoder_dir: &Path) -> anyhow::Result<Option<usize>> {
    let path = encoder_dir.join(config::model::SENTENCE_BERT_CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SentenceBertConfig =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg.max_seq_length)
}

fn open_weights(encoder_dir: &Path) -> anyhow::Result<VarBuilder<'static>> {
    let device = Device::Cpu;
    let safetensors = encoder_dir.join(config::model::SAFETENSORS_FILE);
    if safetensors.exists() {
        log::info!("Memory-mapping weights from {}", safetensors.display());
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[safetensors.clone()], DType::F32, &device)
                .with_context(|| format!("load weights from {}", safetensors.display()))?
        };
        return Ok(vb);
    }

    let pth: PathBuf = encoder_dir.join(config::model::PYTORCH_FILE);
    if pth.exists() {
        log::info!("Loading PyTorch weights from {}", pth.display());
        return VarBuilder::from_pth(&pth, DType::F32, &device)
            .with_context(|| format!("load weights from {}", pth.display()));
    }

    bail!(
        "no {} or {} in {}",
        config::model::SAFETENSORS_FILE,
        config::model::PYTORCH_FILE,
        encoder_dir.display()
    )
}
