// writer.rs — Serializes a traced graph to an .onnx file, splitting large weights out when needed.
//
// Layout matches what onnx.save(..., save_as_external_data=True) produces: large initializers
// are appended to `<model>.onnx.data` and referenced by location/offset/length.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use prost::Message;

use crate::config;
use crate::onnx::proto::{
    data_location, GraphProto, ModelProto, OperatorSetIdProto, StringStringEntryProto, TensorProto,
};
use crate::trace::tracer::{onnx_data_type, raw_bytes, TracedGraph};

pub struct WriteOptions {
    pub graph_name: String,
    pub opset_version: i64,
    /// Total initializer payload above which weights go to the companion file.
    pub external_data_threshold_bytes: u64,
    pub metadata: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WrittenGraph {
    pub graph_path: PathBuf,
    pub external_data_path: Option<PathBuf>,
    pub initializer_bytes: u64,
    pub node_count: usize,
}

/// `<dir>/model.onnx` → `<dir>/model.onnx.data`.
pub fn external_data_path(graph_path: &Path) -> PathBuf {
    let mut name = graph_path.as_os_str().to_owned();
    name.push(config::export::EXTERNAL_DATA_SUFFIX);
    PathBuf::from(name)
}

pub fn write_model(graph: TracedGraph, path: &Path, opts: &WriteOptions) -> anyhow::Result<WrittenGraph> {
    let initializer_bytes: u64 = graph
        .initializers
        .iter()
        .map(|(_, t)| (t.elem_count() * t.dtype().size_in_bytes()) as u64)
        .sum();
    let split = initializer_bytes > opts.external_data_threshold_bytes;
    let data_path = external_data_path(path);

    log::info!(
        "Serializing graph: {} nodes, {} initializers ({} bytes), {} folded ops",
        graph.nodes.len(),
        graph.initializers.len(),
        initializer_bytes,
        graph.folded_ops
    );

    let initializers = if split {
        write_external(&graph, &data_path)?
    } else {
        if data_path.exists() {
            log::info!("Removing stale companion file {}", data_path.display());
            fs::remove_file(&data_path)
                .with_context(|| format!("failed removing {}", data_path.display()))?;
        }
        graph
            .initializers
            .iter()
            .map(|(name, t)| crate::trace::tracer::tensor_proto(name, t))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let node_count = graph.nodes.len();
    let model = ModelProto {
        ir_version: config::export::IR_VERSION,
        producer_name: config::PRODUCER_NAME.to_string(),
        producer_version: config::EXPORTER_VERSION.to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opts.opset_version,
        }],
        graph: Some(GraphProto {
            node: graph.nodes,
            name: opts.graph_name.clone(),
            initializer: initializers,
            input: graph.inputs,
            output: graph.outputs,
            ..Default::default()
        }),
        metadata_props: opts
            .metadata
            .iter()
            .map(|(k, v)| StringStringEntryProto::new(k.as_str(), v.as_str()))
            .collect(),
        ..Default::default()
    };

    // Write atomically: write to .tmp, then rename
    let tmp_path = path.with_extension("onnx.tmp");
    fs::write(&tmp_path, model.encode_to_vec())
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), path.display()))?;

    Ok(WrittenGraph {
        graph_path: path.to_path_buf(),
        external_data_path: split.then_some(data_path),
        initializer_bytes,
        node_count,
    })
}

fn write_external(graph: &TracedGraph, data_path: &Path) -> anyhow::Result<Vec<TensorProto>> {
    let location = data_path
        .file_name()
        .context("external data path has no file name")?
        .to_string_lossy()
        .into_owned();
    let file = fs::File::create(data_path)
        .with_context(|| format!("failed to create {}", data_path.display()))?;
    let mut out = BufWriter::new(file);
    let mut offset: u64 = 0;
    let mut protos = Vec::with_capacity(graph.initializers.len());

    for (name, tensor) in &graph.initializers {
        let bytes = raw_bytes(tensor)?;
        if bytes.len() < config::export::EXTERNAL_DATA_MIN_TENSOR_BYTES {
            protos.push(TensorProto {
                dims: tensor.dims().iter().map(|&d| d as i64).collect(),
                data_type: onnx_data_type(tensor.dtype())?,
                name: name.clone(),
                raw_data: bytes,
                data_location: data_location::DEFAULT,
                ..Default::default()
            });
            continue;
        }

        out.write_all(&bytes)
            .with_context(|| format!("failed writing {name} to {}", data_path.display()))?;
        protos.push(TensorProto {
            dims: tensor.dims().iter().map(|&d| d as i64).collect(),
            data_type: onnx_data_type(tensor.dtype())?,
            name: name.clone(),
            external_data: vec![
                StringStringEntryProto::new("location", location.as_str()),
                StringStringEntryProto::new("offset", offset.to_string()),
                StringStringEntryProto::new("length", bytes.len().to_string()),
            ],
            data_location: data_location::EXTERNAL,
            ..Default::default()
        });
        offset += bytes.len() as u64;
    }
    out.flush().with_context(|| format!("failed flushing {}", data_path.display()))?;

    log::info!("Wrote {} bytes of weights to {}", offset, data_path.display());
    Ok(protos)
}
