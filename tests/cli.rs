// cli.rs — Runs the embed_export binary against a tiny local checkpoint.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use assert_cmd::Command;
use candle_core::{Device, Tensor};
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

const HIDDEN: usize = 8;
const INTERMEDIATE: usize = 16;
const VOCAB: usize = 16;
const MAX_POSITIONS: usize = 64;

fn weight(dims: &[usize], center: f32, salt: usize) -> Tensor {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|i| center + 0.4 * ((i * 7 + salt * 13) as f32).sin())
        .collect();
    Tensor::from_vec(data, dims, &Device::Cpu).unwrap()
}

fn write_model(dir: &Path, pooling_flag: &str) {
    fs::create_dir_all(dir.join("1_Pooling")).unwrap();
    fs::write(
        dir.join("modules.json"),
        json!([
            {"idx": 0, "name": "0", "path": "", "type": "sentence_transformers.models.Transformer"},
            {"idx": 1, "name": "1", "path": "1_Pooling", "type": "sentence_transformers.models.Pooling"}
        ])
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("config.json"),
        json!({
            "model_type": "bert",
            "vocab_size": VOCAB,
            "hidden_size": HIDDEN,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": INTERMEDIATE,
            "hidden_act": "gelu",
            "max_position_embeddings": MAX_POSITIONS,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12,
            "pad_token_id": 0
        })
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("1_Pooling").join("config.json"),
        json!({"word_embedding_dimension": HIDDEN, pooling_flag: true}).to_string(),
    )
    .unwrap();

    let vocab: serde_json::Map<String, serde_json::Value> =
        (0..VOCAB).map(|i| (format!("tok{i}"), json!(i))).collect();
    fs::write(
        dir.join("tokenizer.json"),
        json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "tok1"}
        })
        .to_string(),
    )
    .unwrap();

    let mut weights: HashMap<String, Tensor> = HashMap::new();
    let mut salt = 0;
    let mut put = |name: &str, dims: &[usize], center: f32| {
        salt += 1;
        weights.insert(name.to_string(), weight(dims, center, salt));
    };
    put("embeddings.word_embeddings.weight", &[VOCAB, HIDDEN], 0.0);
    put("embeddings.position_embeddings.weight", &[MAX_POSITIONS, HIDDEN], 0.0);
    put("embeddings.token_type_embeddings.weight", &[2, HIDDEN], 0.0);
    put("embeddings.LayerNorm.weight", &[HIDDEN], 1.0);
    put("embeddings.LayerNorm.bias", &[HIDDEN], 0.0);
    for (name, out, inp) in [
        ("attention.self.query", HIDDEN, HIDDEN),
        ("attention.self.key", HIDDEN, HIDDEN),
        ("attention.self.value", HIDDEN, HIDDEN),
        ("attention.output.dense", HIDDEN, HIDDEN),
        ("intermediate.dense", INTERMEDIATE, HIDDEN),
        ("output.dense", HIDDEN, INTERMEDIATE),
    ] {
        put(&format!("encoder.layer.0.{name}.weight"), &[out, inp], 0.0);
        put(&format!("encoder.layer.0.{name}.bias"), &[out], 0.0);
    }
    for ln in ["attention.output.LayerNorm", "output.LayerNorm"] {
        put(&format!("encoder.layer.0.{ln}.weight"), &[HIDDEN], 1.0);
        put(&format!("encoder.layer.0.{ln}.bias"), &[HIDDEN], 0.0);
    }
    candle_core::safetensors::save(&weights, dir.join("model.safetensors")).unwrap();
}

fn export_cmd(work: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("embed_export").unwrap();
    cmd.current_dir(work.path()).args([
        "--model-dir",
        "model",
        "--max-seq-length",
        "16",
        "--seed",
        "3",
    ]);
    cmd
}

#[test]
fn test_help_prints_usage() {
    Command::cargo_bin("embed_export")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("usage: embed_export"));
}

#[test]
fn test_unknown_argument_is_usage_error() {
    Command::cargo_bin("embed_export")
        .unwrap()
        .args(["--frobnicate", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown argument"));
}

#[test]
fn test_exports_tiny_model() {
    let work = TempDir::new().unwrap();
    write_model(&work.path().join("model"), "pooling_mode_mean_tokens");

    export_cmd(&work)
        .assert()
        .success()
        .stdout(predicate::str::contains("ONNX model conversion successful"))
        .stdout(predicate::str::contains("All files are ready"))
        .stdout(predicate::str::contains("tokenizer.json"))
        .stdout(predicate::str::contains("Separate file with weights").not());

    let assets = work.path().join("assets");
    assert!(assets.join("model.onnx").exists());
    assert!(assets.join("tokenizer.json").exists());
    assert!(!assets.join("model.onnx.data").exists());
    assert!(!assets.join("tokenizer_temp").exists());
    assert!(work.path().join("onnx_models").join("model.onnx").exists());
    assert!(work.path().join("logs").is_dir());
}

#[test]
fn test_unsupported_pooling_is_fatal() {
    let work = TempDir::new().unwrap();
    write_model(&work.path().join("model"), "pooling_mode_cls_token");

    export_cmd(&work)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unsupported pooling mode `cls`"));

    assert!(!work.path().join("assets").join("model.onnx").exists());
}

#[test]
fn test_missing_model_dir_is_fatal() {
    let work = TempDir::new().unwrap();
    export_cmd(&work)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}
