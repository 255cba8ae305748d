// config.rs — Centralized constants and the per-run export configuration.
//
// IMPORTANT:
// Keep ALL numeric values centralized here (repo rule: no hardcoded numeric values scattered around).

use std::path::PathBuf;

use anyhow::{bail, Context};

// NOTE: EXPORTER_VERSION must stay in sync with the `version` field in Cargo.toml.
pub const EXPORTER_VERSION: &str = "0.1.0";
pub const PRODUCER_NAME: &str = "embed-export";

pub mod logging {
    pub const LOG_DIR_REL: &str = "logs";
    pub const LOG_FILE_NAME: &str = "embed_export";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;
}

pub mod model {
    // Same checkpoint the similarity service was built around.
    pub const DEFAULT_MODEL_ID: &str = "lang-uk/ukr-paraphrase-multilingual-mpnet-base";
    pub const DEFAULT_REVISION: &str = "main";

    pub const HUB_BASE_URL: &str = "https://huggingface.co";
    pub const CACHE_DIR_REL: &str = ".cache/embed-export/models";

    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

    pub const MODULES_FILE: &str = "modules.json";
    pub const CONFIG_FILE: &str = "config.json";
    pub const TOKENIZER_FILE: &str = "tokenizer.json";
    pub const SENTENCE_BERT_CONFIG_FILE: &str = "sentence_bert_config.json";
    pub const SAFETENSORS_FILE: &str = "model.safetensors";
    pub const PYTORCH_FILE: &str = "pytorch_model.bin";
    pub const DEFAULT_POOLING_DIR: &str = "1_Pooling";
}

pub mod export {
    pub const ONNX_DIR_REL: &str = "onnx_models";
    pub const ASSETS_DIR_REL: &str = "assets";
    pub const TOKENIZER_TEMP_DIR: &str = "tokenizer_temp";

    pub const MODEL_FILE_NAME: &str = "model.onnx";
    pub const GRAPH_NAME: &str = "main_graph";
    pub const EXTERNAL_DATA_SUFFIX: &str = ".data";

    pub const MAX_SEQ_LENGTH: usize = 128;
    pub const BATCH_SIZE: usize = 1;

    pub const OPSET_VERSION: i64 = 17;
    // IR version 8 is the first one that pairs with opset 17.
    pub const IR_VERSION: i64 = 8;

    // protobuf refuses messages over 2 GiB; above that weights must live in the companion file.
    pub const EXTERNAL_DATA_THRESHOLD_BYTES: u64 = 2 * 1024 * 1024 * 1024;
    pub const EXTERNAL_DATA_MIN_TENSOR_BYTES: usize = 1024;

    pub const BATCH_AXIS: &str = "batch_size";
    pub const SEQUENCE_AXIS: &str = "sequence_length";

    pub const INPUT_IDS: &str = "input_ids";
    pub const ATTENTION_MASK: &str = "attention_mask";
    pub const TOKEN_TYPE_IDS: &str = "token_type_ids";
    pub const OUTPUT_EMBEDDINGS: &str = "embeddings";
}

pub mod pooling {
    pub const MASK_SUM_EPS: f64 = 1e-9;
    pub const L2_NORM_EPS: f64 = 1e-12;

    // Tolerance for the unit-norm check on the traced output.
    pub const UNIT_NORM_TOLERANCE: f32 = 1e-3;
}

/// Where the pretrained checkpoint comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Hugging Face hub id, downloaded into the local cache.
    Hub { id: String, revision: String },
    /// Directory already laid out as a sentence-transformers checkpoint.
    Local(PathBuf),
}

impl ModelSource {
    /// Name recorded in the graph metadata and logs.
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::Hub { id, .. } => id.clone(),
            ModelSource::Local(dir) => dir.display().to_string(),
        }
    }
}

/// Everything a single export run needs. Defaults reproduce the historical fixed layout
/// (`onnx_models/`, `assets/`, seq len 128, batch 1).
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub model: ModelSource,
    pub onnx_dir: PathBuf,
    pub assets_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub max_seq_length: usize,
    pub batch_size: usize,
    pub opset_version: i64,
    pub fold_constants: bool,
    pub external_data_threshold_bytes: u64,
    pub seed: Option<u64>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            model: ModelSource::Hub {
                id: model::DEFAULT_MODEL_ID.to_string(),
                revision: model::DEFAULT_REVISION.to_string(),
            },
            onnx_dir: PathBuf::from(export::ONNX_DIR_REL),
            assets_dir: PathBuf::from(export::ASSETS_DIR_REL),
            cache_dir: None,
            log_dir: PathBuf::from(logging::LOG_DIR_REL),
            max_seq_length: export::MAX_SEQ_LENGTH,
            batch_size: export::BATCH_SIZE,
            opset_version: export::OPSET_VERSION,
            fold_constants: true,
            external_data_threshold_bytes: export::EXTERNAL_DATA_THRESHOLD_BYTES,
            seed: None,
        }
    }
}

impl ExportConfig {
    /// Build a config from command-line arguments (program name excluded).
    pub fn from_args(args: &[String]) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        let mut revision = model::DEFAULT_REVISION.to_string();
        let mut hub_id: Option<String> = None;

        let mut i = 0;
        while i < args.len() {
            let key = args[i].as_str();
            if key == "--no-constant-folding" {
                cfg.fold_constants = false;
                i += 1;
                continue;
            }
            let value = args
                .get(i + 1)
                .with_context(|| format!("missing value for {key}"))?;
            match key {
                "--model" => hub_id = Some(value.clone()),
                "--revision" => revision = value.clone(),
                "--model-dir" => cfg.model = ModelSource::Local(PathBuf::from(value)),
                "--onnx-dir" => cfg.onnx_dir = PathBuf::from(value),
                "--assets-dir" => cfg.assets_dir = PathBuf::from(value),
                "--cache-dir" => cfg.cache_dir = Some(PathBuf::from(value)),
                "--log-dir" => cfg.log_dir = PathBuf::from(value),
                "--max-seq-length" => cfg.max_seq_length = parse_positive(key, value)?,
                "--batch-size" => cfg.batch_size = parse_positive(key, value)?,
                "--seed" => {
                    cfg.seed = Some(value.parse().with_context(|| format!("invalid {key}: {value}"))?)
                }
                _ => bail!("unknown argument: {key}"),
            }
            i += 2;
        }

        if let Some(id) = hub_id {
            if matches!(cfg.model, ModelSource::Local(_)) {
                bail!("--model and --model-dir are mutually exclusive");
            }
            cfg.model = ModelSource::Hub { id, revision };
        } else if let ModelSource::Hub { revision: r, .. } = &mut cfg.model {
            *r = revision;
        }

        Ok(cfg)
    }

    pub fn onnx_path(&self) -> PathBuf {
        self.onnx_dir.join(export::MODEL_FILE_NAME)
    }
}

fn parse_positive(key: &str, value: &str) -> anyhow::Result<usize> {
    let n: usize = value.parse().with_context(|| format!("invalid {key}: {value}"))?;
    if n == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(n)
}

pub const USAGE: &str = "usage: embed_export [--model <hub id> [--revision <rev>] | --model-dir <path>] \
[--onnx-dir <path>] [--assets-dir <path>] [--cache-dir <path>] [--log-dir <path>] \
[--max-seq-length <n>] [--batch-size <n>] [--seed <u64>] [--no-constant-folding]";

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults_match_fixed_layout() {
        let cfg = ExportConfig::from_args(&[]).unwrap();
        assert_eq!(cfg.onnx_path(), PathBuf::from("onnx_models/model.onnx"));
        assert_eq!(cfg.assets_dir, PathBuf::from("assets"));
        assert_eq!(cfg.max_seq_length, 128);
        assert_eq!(cfg.batch_size, 1);
        assert!(cfg.fold_constants);
        assert_eq!(
            cfg.model,
            ModelSource::Hub {
                id: model::DEFAULT_MODEL_ID.to_string(),
                revision: "main".to_string()
            }
        );
    }

    #[test]
    fn test_overrides() {
        let cfg = ExportConfig::from_args(&args(&[
            "--model-dir",
            "/tmp/m",
            "--assets-dir",
            "out",
            "--max-seq-length",
            "64",
            "--seed",
            "7",
            "--no-constant-folding",
        ]))
        .unwrap();
        assert_eq!(cfg.model, ModelSource::Local(PathBuf::from("/tmp/m")));
        assert_eq!(cfg.assets_dir, PathBuf::from("out"));
        assert_eq!(cfg.max_seq_length, 64);
        assert_eq!(cfg.seed, Some(7));
        assert!(!cfg.fold_constants);
    }

    #[test]
    fn test_revision_applies_to_default_model() {
        let cfg = ExportConfig::from_args(&args(&["--revision", "v2"])).unwrap();
        assert!(matches!(cfg.model, ModelSource::Hub { ref revision, .. } if revision == "v2"));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(ExportConfig::from_args(&args(&["--bogus", "1"])).is_err());
        assert!(ExportConfig::from_args(&args(&["--batch-size", "0"])).is_err());
        assert!(ExportConfig::from_args(&args(&["--seed"])).is_err());
        assert!(ExportConfig::from_args(&args(&["--model", "a/b", "--model-dir", "x"])).is_err());
    }
}
