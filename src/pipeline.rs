// pipeline.rs — End-to-end export: load -> wrap -> trace -> write -> tokenizer -> assets.
//
// Load and wrap failures propagate to the caller as fatal. Everything from tracing to the
// final copy runs inside one catch-all boundary: a failure there is logged, printed with its
// cause chain, and turned into `RunOutcome::Failed` instead of an error.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::config::{self, ExportConfig};
use crate::error::ExportError;
use crate::model::download;
use crate::model::SentenceTransformer;
use crate::onnx::inspect::{read_signature, Dim};
use crate::onnx::proto::data_type;
use crate::onnx::writer::{self, WriteOptions, WrittenGraph};
use crate::sample::SampleBatch;
use crate::trace::tracer::{Axis, TracedGraph, Tracer};
use crate::wrapper::SentenceEmbeddingWrapper;

/// Anything that can write its full tokenizer definition into a directory.
pub trait TokenizerSource {
    fn save_definition(&self, dir: &Path) -> anyhow::Result<()>;
}

impl TokenizerSource for Tokenizer {
    fn save_definition(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(config::model::TOKENIZER_FILE);
        self.save(&path, false)
            .map_err(|e| anyhow::anyhow!("failed to save tokenizer to {}: {e}", path.display()))
    }
}

/// What ended up in the assets directory.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub graph: PathBuf,
    pub external_data: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub tokenizer_error: Option<String>,
    pub embedding_dim: usize,
    pub node_count: usize,
    pub initializer_bytes: u64,
}

impl ExportReport {
    /// Every file now present in the assets directory, graph first.
    pub fn files(&self) -> Vec<&Path> {
        let mut files = vec![self.graph.as_path()];
        files.extend(self.external_data.as_deref());
        files.extend(self.tokenizer.as_deref());
        files
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    /// Graph, optional companion and tokenizer are all in place.
    Complete(ExportReport),
    /// Graph copied but the tokenizer file is missing.
    Incomplete(ExportReport),
    /// The export boundary caught an error.
    Failed(anyhow::Error),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Complete(_) => 0,
            RunOutcome::Incomplete(_) | RunOutcome::Failed(_) => 2,
        }
    }
}

pub fn run(cfg: &ExportConfig) -> anyhow::Result<RunOutcome> {
    for dir in [&cfg.onnx_dir, &cfg.assets_dir] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let model_dir = download::resolve_model(&cfg.model, cfg.cache_dir.as_deref())?;
    let model = SentenceTransformer::load(&model_dir, &cfg.model.display_name())?;
    let wrapper = SentenceEmbeddingWrapper::new(&model)?;

    let outcome = match export_and_copy(cfg, &wrapper, &model.tokenizer) {
        Ok(report) if report.tokenizer.is_some() => RunOutcome::Complete(report),
        Ok(report) => {
            log::warn!("Export finished without a tokenizer file");
            RunOutcome::Incomplete(report)
        }
        Err(e) => {
            log::error!("Error during export: {e:?}");
            println!("\n❌ Error during export: {e:?}");
            RunOutcome::Failed(e)
        }
    };
    Ok(outcome)
}

/// Trace, serialize, verify, export the tokenizer and copy everything into the assets dir.
pub fn export_and_copy(
    cfg: &ExportConfig,
    wrapper: &SentenceEmbeddingWrapper,
    tokenizer: &dyn TokenizerSource,
) -> anyhow::Result<ExportReport> {
    let model = wrapper.model();
    let supported = model.max_supported_seq_length();
    if cfg.max_seq_length > supported {
        bail!(
            "max sequence length {} exceeds the {} positions the model supports",
            cfg.max_seq_length,
            supported
        );
    }
    if let Some(declared) = model.max_seq_length {
        if cfg.max_seq_length > declared {
            log::warn!(
                "Tracing with {} tokens, checkpoint declares max_seq_length {}",
                cfg.max_seq_length,
                declared
            );
        }
    }

    let sample = SampleBatch::random(
        cfg.batch_size,
        cfg.max_seq_length,
        model.token_id_bound(),
        cfg.seed,
        &Device::Cpu,
    )?;
    let graph = trace_graph(cfg, wrapper, &sample).context("tracing failed")?;

    let onnx_path = cfg.onnx_path();
    let written = writer::write_model(graph, &onnx_path, &write_options(cfg, wrapper))
        .with_context(|| format!("failed to write {}", onnx_path.display()))?;
    println!("\n✅ ONNX model conversion successful: {}", onnx_path.display());

    verify_signature(&written, wrapper.embedding_dim())?;

    if let Some(data) = &written.external_data_path {
        log::warn!("Separate file with weights created: {}", data.display());
        println!("⚠️  Separate file with weights created: {}", data.display());
    }

    println!("\n🔄 Exporting tokenizer...");
    let (tokenizer_path, tokenizer_error) = match export_tokenizer(tokenizer, &cfg.assets_dir) {
        Ok(path) => {
            println!("✅ Tokenizer saved: {}", path.display());
            (Some(path), None)
        }
        Err(e) => {
            if !matches!(
                e.downcast_ref::<ExportError>(),
                Some(ExportError::MissingTokenizerFile { .. })
            ) {
                return Err(e);
            }
            log::error!("{e}");
            println!("❌ {e}");
            (None, Some(e.to_string()))
        }
    };

    println!("\n🔄 Copying files to {}/...", cfg.assets_dir.display());
    let graph_dest = cfg.assets_dir.join(config::export::MODEL_FILE_NAME);
    copy_file(&written.graph_path, &graph_dest)?;

    let data_dest = writer::external_data_path(&graph_dest);
    let external_data = match &written.external_data_path {
        Some(src) => {
            copy_file(src, &data_dest)?;
            Some(data_dest)
        }
        None => {
            if data_dest.exists() {
                log::info!("Removing stale {}", data_dest.display());
                fs::remove_file(&data_dest)
                    .with_context(|| format!("failed removing {}", data_dest.display()))?;
            }
            None
        }
    };

    let report = ExportReport {
        graph: graph_dest,
        external_data,
        tokenizer: tokenizer_path,
        tokenizer_error,
        embedding_dim: wrapper.embedding_dim(),
        node_count: written.node_count,
        initializer_bytes: written.initializer_bytes,
    };
    print_manifest(&report, &cfg.assets_dir);
    Ok(report)
}

fn trace_graph(
    cfg: &ExportConfig,
    wrapper: &SentenceEmbeddingWrapper,
    sample: &SampleBatch,
) -> anyhow::Result<TracedGraph> {
    let dynamic = [
        Axis::Variable(config::export::BATCH_AXIS),
        Axis::Variable(config::export::SEQUENCE_AXIS),
    ];

    let mut tracer = Tracer::new(cfg.fold_constants);
    let input_ids = tracer.input(config::export::INPUT_IDS, sample.input_ids.clone(), &dynamic)?;
    let attention_mask = tracer.input(config::export::ATTENTION_MASK, sample.attention_mask.clone(), &dynamic)?;
    let token_type_ids = tracer.input(config::export::TOKEN_TYPE_IDS, sample.token_type_ids.clone(), &dynamic)?;

    let embeddings = wrapper.forward(&mut tracer, &input_ids, &attention_mask, &token_type_ids)?;
    check_embeddings(embeddings.value(), cfg.batch_size, wrapper.embedding_dim())?;
    log::debug!("Binding {} to output {}", embeddings.name(), config::export::OUTPUT_EMBEDDINGS);

    tracer.output(
        &embeddings,
        config::export::OUTPUT_EMBEDDINGS,
        &[Axis::Variable(config::export::BATCH_AXIS), Axis::Fixed],
    )?;
    Ok(tracer.finish())
}

/// The eager output on the sample batch must be `[batch, dim]`, finite and unit length.
fn check_embeddings(value: &Tensor, batch: usize, dim: usize) -> anyhow::Result<()> {
    if value.dims() != [batch, dim] {
        bail!("traced output has shape {:?}, expected [{batch}, {dim}]", value.dims());
    }
    for (i, row) in value.to_vec2::<f32>()?.iter().enumerate() {
        if row.iter().any(|v| !v.is_finite()) {
            bail!("traced embedding {i} contains non-finite values");
        }
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if (norm - 1.0).abs() > config::pooling::UNIT_NORM_TOLERANCE {
            bail!("traced embedding {i} has L2 norm {norm}, expected 1");
        }
    }
    Ok(())
}

fn write_options(cfg: &ExportConfig, wrapper: &SentenceEmbeddingWrapper) -> WriteOptions {
    WriteOptions {
        graph_name: config::export::GRAPH_NAME.to_string(),
        opset_version: cfg.opset_version,
        external_data_threshold_bytes: cfg.external_data_threshold_bytes,
        metadata: vec![
            ("model_id".to_string(), wrapper.model().model_id.clone()),
            ("pooling_mode".to_string(), wrapper.pooling_mode().to_string()),
            ("embedding_dim".to_string(), wrapper.embedding_dim().to_string()),
            ("max_seq_length".to_string(), cfg.max_seq_length.to_string()),
            ("normalize".to_string(), "true".to_string()),
        ],
    }
}

/// Read the written graph back and check its declared interface.
fn verify_signature(written: &WrittenGraph, embedding_dim: usize) -> anyhow::Result<()> {
    let sig = read_signature(&written.graph_path)?;

    let expected_inputs = [
        config::export::INPUT_IDS,
        config::export::ATTENTION_MASK,
        config::export::TOKEN_TYPE_IDS,
    ];
    if sig.input_names() != expected_inputs {
        bail!("graph inputs are {:?}, expected {:?}", sig.input_names(), expected_inputs);
    }
    if sig.output_names() != [config::export::OUTPUT_EMBEDDINGS] {
        bail!("graph outputs are {:?}, expected [{}]", sig.output_names(), config::export::OUTPUT_EMBEDDINGS);
    }

    let batch = Dim::Variable(config::export::BATCH_AXIS.to_string());
    let seq = Dim::Variable(config::export::SEQUENCE_AXIS.to_string());
    for input in &sig.inputs {
        if input.elem_type != data_type::INT64 || input.dims != [batch.clone(), seq.clone()] {
            bail!(
                "input {} declared as type {} [{}]",
                input.name,
                input.elem_type,
                join_dims(&input.dims)
            );
        }
    }
    let output = &sig.outputs[0];
    if output.elem_type != data_type::FLOAT || output.dims != [batch, Dim::Fixed(embedding_dim as i64)] {
        bail!(
            "output {} declared as type {} [{}]",
            output.name,
            output.elem_type,
            join_dims(&output.dims)
        );
    }

    let declared_dim = embedding_dim.to_string();
    if sig.metadata_value("embedding_dim") != Some(declared_dim.as_str()) {
        bail!("graph metadata does not record embedding_dim {declared_dim}");
    }

    log::info!(
        "Verified {} (opset {}, inputs {:?}, output [{}])",
        written.graph_path.display(),
        sig.opset_version,
        sig.input_names(),
        join_dims(&output.dims)
    );
    Ok(())
}

fn join_dims(dims: &[Dim]) -> String {
    dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
}

/// Save the tokenizer into `<assets>/tokenizer_temp`, keep only tokenizer.json, drop the rest.
fn export_tokenizer(tokenizer: &dyn TokenizerSource, assets_dir: &Path) -> anyhow::Result<PathBuf> {
    let temp_dir = assets_dir.join(config::export::TOKENIZER_TEMP_DIR);
    if temp_dir.exists() {
        log::info!("Clearing leftover {}", temp_dir.display());
        fs::remove_dir_all(&temp_dir).with_context(|| format!("failed removing {}", temp_dir.display()))?;
    }
    fs::create_dir_all(&temp_dir).with_context(|| format!("failed to create {}", temp_dir.display()))?;

    tokenizer.save_definition(&temp_dir)?;

    let src = temp_dir.join(config::model::TOKENIZER_FILE);
    if !src.exists() {
        return Err(ExportError::MissingTokenizerFile { dir: temp_dir }.into());
    }

    let dest = assets_dir.join(config::model::TOKENIZER_FILE);
    copy_file(&src, &dest)?;
    fs::remove_dir_all(&temp_dir).with_context(|| format!("failed removing {}", temp_dir.display()))?;
    Ok(dest)
}

/// Copy `src` over `dest` unless both already name the same file.
fn copy_file(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if dest.exists() {
        let src_real = fs::canonicalize(src).with_context(|| format!("failed to resolve {}", src.display()))?;
        let dest_real = fs::canonicalize(dest).with_context(|| format!("failed to resolve {}", dest.display()))?;
        if src_real == dest_real {
            return Ok(());
        }
    }
    fs::copy(src, dest).with_context(|| format!("failed to copy {} -> {}", src.display(), dest.display()))?;
    Ok(())
}

fn print_manifest(report: &ExportReport, assets_dir: &Path) {
    println!("\n✅ All files are ready in the {}/ folder:", assets_dir.display());
    for file in report.files() {
        println!("   - {}", file.display());
        log::info!("Asset ready: {}", file.display());
    }
    log::info!(
        "Export summary: {} nodes, {} bytes of weights, embedding dim {}",
        report.node_count,
        report.initializer_bytes,
        report.embedding_dim
    );
}
