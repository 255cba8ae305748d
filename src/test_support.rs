// test_support.rs — Tiny random sentence-transformers checkpoints for tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use rand::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use crate::model::SentenceTransformer;

pub const VOCAB: [&str; 16] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "hello", "world", "the", "a", "model", "text", "export", "graph",
    "token", "vector", "mean", "pool",
];
const HIDDEN: usize = 8;
const INTERMEDIATE: usize = 16;
const HEADS: usize = 2;
const LAYERS: usize = 1;
const TYPE_VOCAB: usize = 2;

pub struct TinyModel {
    pub model_type: &'static str,
    pub pad_token_id: i64,
    pub max_position_embeddings: usize,
    pub hidden_act: &'static str,
    /// `mean`, `cls`, `max`, or flags joined with `+`.
    pub pooling_mode: &'static str,
    pub normalize: bool,
    pub seed: u64,
}

impl TinyModel {
    pub fn bert() -> Self {
        Self {
            model_type: "bert",
            pad_token_id: 0,
            max_position_embeddings: 192,
            hidden_act: "gelu",
            pooling_mode: "mean",
            normalize: true,
            seed: 17,
        }
    }

    pub fn xlm_roberta() -> Self {
        Self {
            model_type: "xlm-roberta",
            pad_token_id: 1,
            max_position_embeddings: 160,
            ..Self::bert()
        }
    }
}

/// Lay out a complete checkpoint directory: modules.json, config.json, model.safetensors,
/// tokenizer.json, sentence_bert_config.json and 1_Pooling/config.json.
pub fn write_tiny_model(dir: &Path, tiny: &TinyModel) -> anyhow::Result<()> {
    fs::create_dir_all(dir.join("1_Pooling"))?;

    let mut modules = vec![
        json!({"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"}),
        json!({"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"}),
    ];
    if tiny.normalize {
        modules.push(json!({"idx": 2, "name": "2", "path": "2_Normalize", "type": "sentence_transformers.models.Normalize"}));
    }
    fs::write(dir.join("modules.json"), serde_json::to_string_pretty(&modules)?)?;

    let config = json!({
        "architectures": ["BertModel"],
        "model_type": tiny.model_type,
        "vocab_size": VOCAB.len(),
        "hidden_size": HIDDEN,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": HEADS,
        "intermediate_size": INTERMEDIATE,
        "hidden_act": tiny.hidden_act,
        "hidden_dropout_prob": 0.1,
        "attention_probs_dropout_prob": 0.1,
        "max_position_embeddings": tiny.max_position_embeddings,
        "type_vocab_size": TYPE_VOCAB,
        "initializer_range": 0.02,
        "layer_norm_eps": 1e-12,
        "pad_token_id": tiny.pad_token_id,
        "position_embedding_type": "absolute",
        "use_cache": true,
        "classifier_dropout": null
    });
    fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;

    let flags: Vec<&str> = tiny.pooling_mode.split('+').collect();
    let pooling = json!({
        "word_embedding_dimension": HIDDEN,
        "pooling_mode_cls_token": flags.contains(&"cls"),
        "pooling_mode_mean_tokens": flags.contains(&"mean"),
        "pooling_mode_max_tokens": flags.contains(&"max"),
        "pooling_mode_mean_sqrt_len_tokens": false
    });
    fs::write(dir.join("1_Pooling").join("config.json"), serde_json::to_string_pretty(&pooling)?)?;

    fs::write(
        dir.join("sentence_bert_config.json"),
        r#"{"max_seq_length": 128, "do_lower_case": false}"#,
    )?;
    fs::write(dir.join("tokenizer.json"), tokenizer_json().to_string())?;

    candle_core::safetensors::save(&random_weights(tiny)?, dir.join("model.safetensors"))?;
    Ok(())
}

/// Write a tiny checkpoint into a fresh temp dir and load it.
pub fn load_tiny(tiny: &TinyModel) -> (TempDir, SentenceTransformer) {
    let dir = TempDir::new().unwrap();
    write_tiny_model(dir.path(), tiny).unwrap();
    let model = SentenceTransformer::load(dir.path(), "tiny").unwrap();
    (dir, model)
}

/// Token-level hidden states from candle's own BERT implementation on the same checkpoint.
pub fn reference_bert_hidden(dir: &Path, ids: &[Vec<i64>], mask: &[Vec<i64>], types: &[Vec<i64>]) -> Tensor {
    let config: BertConfig = serde_json::from_str(&fs::read_to_string(dir.join("config.json")).unwrap()).unwrap();
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[dir.join("model.safetensors")], DType::F32, &Device::Cpu).unwrap()
    };
    let model = BertModel::load(vb, &config).unwrap();
    let tensor = |rows: &[Vec<i64>]| {
        Tensor::from_vec(rows.concat(), (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    };
    model
        .forward(&tensor(ids), &tensor(types), Some(&tensor(mask)))
        .unwrap()
}

fn random_weights(tiny: &TinyModel) -> anyhow::Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(tiny.seed);
    let mut weights = HashMap::new();
    let mut put = |name: String, dims: &[usize], center: f32| -> anyhow::Result<()> {
        let n: usize = dims.iter().product();
        let data: Vec<f32> = (0..n).map(|_| center + rng.gen_range(-0.5f32..0.5)).collect();
        weights.insert(name, Tensor::from_vec(data, dims, &Device::Cpu)?);
        Ok(())
    };

    put("embeddings.word_embeddings.weight".into(), &[VOCAB.len(), HIDDEN], 0.0)?;
    put(
        "embeddings.position_embeddings.weight".into(),
        &[tiny.max_position_embeddings, HIDDEN],
        0.0,
    )?;
    put("embeddings.token_type_embeddings.weight".into(), &[TYPE_VOCAB, HIDDEN], 0.0)?;
    put("embeddings.LayerNorm.weight".into(), &[HIDDEN], 1.0)?;
    put("embeddings.LayerNorm.bias".into(), &[HIDDEN], 0.0)?;

    for i in 0..LAYERS {
        let p = format!("encoder.layer.{i}");
        for (name, out, inp) in [
            ("attention.self.query", HIDDEN, HIDDEN),
            ("attention.self.key", HIDDEN, HIDDEN),
            ("attention.self.value", HIDDEN, HIDDEN),
            ("attention.output.dense", HIDDEN, HIDDEN),
            ("intermediate.dense", INTERMEDIATE, HIDDEN),
            ("output.dense", HIDDEN, INTERMEDIATE),
        ] {
            put(format!("{p}.{name}.weight"), &[out, inp], 0.0)?;
            put(format!("{p}.{name}.bias"), &[out], 0.0)?;
        }
        for ln in ["attention.output.LayerNorm", "output.LayerNorm"] {
            put(format!("{p}.{ln}.weight"), &[HIDDEN], 1.0)?;
            put(format!("{p}.{ln}.bias"), &[HIDDEN], 0.0)?;
        }
    }
    Ok(weights)
}

fn tokenizer_json() -> serde_json::Value {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, tok)| (tok.to_string(), json!(i)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    })
}
