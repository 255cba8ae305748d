// encoder.rs — BERT-family encoder forward pass as traced ops.
//
// Post-LN transformer: embeddings -> LayerNorm -> N x (self-attention, FFN), each sub-block
// followed by residual add + LayerNorm. Produces the token-level hidden states [batch, seq, hidden].

use candle_core::{DType, Shape};

use crate::model::loader::{Activation, Architecture};
use crate::model::SentenceTransformer;
use crate::trace::tracer::{Traced, Tracer};

/// Graph inputs the encoder consumes, all int64 `[batch, seq]`.
pub struct EncoderInputs<'a> {
    pub input_ids: &'a Traced,
    pub attention_mask: &'a Traced,
    pub token_type_ids: &'a Traced,
}

pub fn encode(tracer: &mut Tracer, model: &SentenceTransformer, inputs: &EncoderInputs) -> anyhow::Result<Traced> {
    let cfg = &model.encoder;
    let hidden = cfg.hidden_size;

    // Embeddings
    let word = param(tracer, model, "embeddings.word_embeddings.weight", (cfg.vocab_size, hidden))?;
    let pos_table = param(
        tracer,
        model,
        "embeddings.position_embeddings.weight",
        (cfg.max_position_embeddings, hidden),
    )?;
    let type_table = param(
        tracer,
        model,
        "embeddings.token_type_embeddings.weight",
        (cfg.type_vocab_size, hidden),
    )?;

    let positions = position_ids(tracer, inputs.input_ids, model.architecture, model.pad_token_id)?;
    let words = tracer.gather(&word, inputs.input_ids)?;
    let pos = tracer.gather(&pos_table, &positions)?;
    let types = tracer.gather(&type_table, inputs.token_type_ids)?;
    let sum = tracer.add(&words, &pos)?;
    let sum = tracer.add(&sum, &types)?;
    let mut hidden_states = layer_norm(tracer, model, "embeddings.LayerNorm", &sum)?;

    let mask = additive_mask(tracer, inputs.attention_mask)?;

    for i in 0..cfg.num_hidden_layers {
        hidden_states = encoder_layer(tracer, model, i, &hidden_states, &mask)?;
    }

    log::debug!("Traced {} encoder layers", cfg.num_hidden_layers);
    Ok(hidden_states)
}

/// Position ids for each token.
///
/// BERT counts `0..seq_len`. RoBERTa-style models count only non-padding tokens and start
/// right after `pad_token_id`; padding positions map to `pad_token_id` itself.
pub fn position_ids(
    tracer: &mut Tracer,
    input_ids: &Traced,
    architecture: Architecture,
    pad_token_id: i64,
) -> anyhow::Result<Traced> {
    match architecture {
        Architecture::Bert => {
            let shape = tracer.shape(input_ids)?;
            let ones = tracer.constant_of_shape(&shape, 1)?;
            let counts = tracer.cumsum(&ones, 1)?;
            let one = tracer.scalar_i64(1)?;
            tracer.sub(&counts, &one)
        }
        Architecture::Roberta => {
            let pad = tracer.scalar_i64(pad_token_id)?;
            let is_pad = tracer.equal(input_ids, &pad)?;
            let keep = tracer.not(&is_pad)?;
            let keep = tracer.cast(&keep, DType::I64)?;
            let counts = tracer.cumsum(&keep, 1)?;
            let counts = tracer.mul(&counts, &keep)?;
            tracer.add(&counts, &pad)
        }
    }
}

/// `[batch, seq]` 0/1 mask -> `[batch, 1, 1, seq]` with 0 for kept and f32::MIN for masked tokens.
fn additive_mask(tracer: &mut Tracer, attention_mask: &Traced) -> anyhow::Result<Traced> {
    let expanded = tracer.unsqueeze(attention_mask, &[1, 2])?;
    let expanded = tracer.cast(&expanded, DType::F32)?;
    let one = tracer.scalar_f32(1.0)?;
    let inverted = tracer.sub(&one, &expanded)?;
    let min = tracer.scalar_f32(f32::MIN)?;
    tracer.mul(&inverted, &min)
}

fn encoder_layer(
    tracer: &mut Tracer,
    model: &SentenceTransformer,
    index: usize,
    x: &Traced,
    mask: &Traced,
) -> anyhow::Result<Traced> {
    let cfg = &model.encoder;
    let prefix = format!("encoder.layer.{index}");
    let heads = cfg.num_attention_heads as i64;
    let head_dim = cfg.head_dim();

    // Self-attention
    let attn = format!("{prefix}.attention.self");
    let q = linear(tracer, model, &format!("{attn}.query"), cfg.hidden_size, cfg.hidden_size, x)?;
    let k = linear(tracer, model, &format!("{attn}.key"), cfg.hidden_size, cfg.hidden_size, x)?;
    let v = linear(tracer, model, &format!("{attn}.value"), cfg.hidden_size, cfg.hidden_size, x)?;

    let split = [0, 0, heads, head_dim as i64];
    let q = tracer.reshape(&q, &split)?;
    let q = tracer.transpose(&q, &[0, 2, 1, 3])?;
    let k = tracer.reshape(&k, &split)?;
    let k = tracer.transpose(&k, &[0, 2, 3, 1])?;
    let v = tracer.reshape(&v, &split)?;
    let v = tracer.transpose(&v, &[0, 2, 1, 3])?;

    let scores = tracer.matmul(&q, &k)?;
    let scale = tracer.scalar_f32((head_dim as f32).sqrt())?;
    let scores = tracer.div(&scores, &scale)?;
    let scores = tracer.add(&scores, mask)?;
    let probs = tracer.softmax(&scores)?;

    let context = tracer.matmul(&probs, &v)?;
    let context = tracer.transpose(&context, &[0, 2, 1, 3])?;
    let context = tracer.reshape(&context, &[0, 0, -1])?;

    let attn_out = linear(
        tracer,
        model,
        &format!("{prefix}.attention.output.dense"),
        cfg.hidden_size,
        cfg.hidden_size,
        &context,
    )?;
    let attn_out = tracer.add(&attn_out, x)?;
    let attn_out = layer_norm(tracer, model, &format!("{prefix}.attention.output.LayerNorm"), &attn_out)?;

    // Feed-forward
    let inter = linear(
        tracer,
        model,
        &format!("{prefix}.intermediate.dense"),
        cfg.hidden_size,
        cfg.intermediate_size,
        &attn_out,
    )?;
    let inter = match model.activation {
        Activation::Gelu => gelu(tracer, &inter)?,
        Activation::Relu => tracer.relu(&inter)?,
    };
    let out = linear(
        tracer,
        model,
        &format!("{prefix}.output.dense"),
        cfg.intermediate_size,
        cfg.hidden_size,
        &inter,
    )?;
    let out = tracer.add(&out, &attn_out)?;
    layer_norm(tracer, model, &format!("{prefix}.output.LayerNorm"), &out)
}

/// Exact GELU: `x * 0.5 * (1 + erf(x / sqrt(2)))`.
fn gelu(tracer: &mut Tracer, x: &Traced) -> anyhow::Result<Traced> {
    let sqrt2 = tracer.scalar_f32(std::f32::consts::SQRT_2)?;
    let scaled = tracer.div(x, &sqrt2)?;
    let erf = tracer.erf(&scaled)?;
    let one = tracer.scalar_f32(1.0)?;
    let shifted = tracer.add(&erf, &one)?;
    let y = tracer.mul(x, &shifted)?;
    let half = tracer.scalar_f32(0.5)?;
    tracer.mul(&y, &half)
}

/// `x @ W^T + b` with W stored as `[out, in]`. The transpose folds into the exported weight.
fn linear(
    tracer: &mut Tracer,
    model: &SentenceTransformer,
    prefix: &str,
    in_dim: usize,
    out_dim: usize,
    x: &Traced,
) -> anyhow::Result<Traced> {
    let weight = param(tracer, model, &format!("{prefix}.weight"), (out_dim, in_dim))?;
    let bias = param(tracer, model, &format!("{prefix}.bias"), out_dim)?;
    let weight_t = tracer.transpose(&weight, &[1, 0])?;
    let y = tracer.matmul(x, &weight_t)?;
    tracer.add(&y, &bias)
}

fn layer_norm(tracer: &mut Tracer, model: &SentenceTransformer, prefix: &str, x: &Traced) -> anyhow::Result<Traced> {
    let hidden = model.encoder.hidden_size;
    let scale = param(tracer, model, &format!("{prefix}.weight"), hidden)?;
    let bias = param(tracer, model, &format!("{prefix}.bias"), hidden)?;
    tracer.layer_norm(x, &scale, &bias, model.encoder.layer_norm_eps)
}

fn param<S: Into<Shape>>(
    tracer: &mut Tracer,
    model: &SentenceTransformer,
    name: &str,
    shape: S,
) -> anyhow::Result<Traced> {
    let (full, tensor) = model.weight(name, shape)?;
    Ok(tracer.parameter(&full, tensor))
}
