use std::fmt;
use std::path::Path;

use anyhow::{bail, Context};
use prost::Message;

use crate::onnx::proto::{tensor_shape_proto::dimension, ModelProto, ValueInfoProto};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Variable(String),
    Unknown,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(n) => write!(f, "{n}"),
            Dim::Variable(name) => write!(f, "{name}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorSignature {
    pub name: String,
    pub elem_type: i32,
    pub dims: Vec<Dim>,
}

/// Declared interface of a serialized graph.
#[derive(Debug, Clone)]
pub struct GraphSignature {
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
    pub opset_version: i64,
    pub metadata: Vec<(String, String)>,
}

impl GraphSignature {
    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

pub fn read_signature(path: &Path) -> anyhow::Result<GraphSignature> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let model = ModelProto::decode(bytes.as_slice()).with_context(|| format!("decode {}", path.display()))?;
    let graph = model.graph.as_ref().context("model has no graph")?;

    let opset_version = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .unwrap_or_default();

    // Initializers may be listed as inputs by older exporters; they are not part of the interface.
    let inputs = graph
        .input
        .iter()
        .filter(|i| !graph.initializer.iter().any(|t| t.name == i.name))
        .map(signature)
        .collect::<anyhow::Result<Vec<_>>>()?;
    let outputs = graph.output.iter().map(signature).collect::<anyhow::Result<Vec<_>>>()?;

    Ok(GraphSignature {
        inputs,
        outputs,
        opset_version,
        metadata: model.metadata_props.iter().map(|e| (e.key.clone(), e.value.clone())).collect(),
    })
}

fn signature(info: &ValueInfoProto) -> anyhow::Result<TensorSignature> {
    let Some(tensor) = info.tensor_type() else {
        bail!("{} is not a tensor value", info.name);
    };
    let dims = tensor
        .shape
        .as_ref()
        .map(|s| {
            s.dim
                .iter()
                .map(|d| match &d.value {
                    Some(dimension::Value::DimValue(n)) => Dim::Fixed(*n),
                    Some(dimension::Value::DimParam(p)) => Dim::Variable(p.clone()),
                    None => Dim::Unknown,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(TensorSignature {
        name: info.name.clone(),
        elem_type: tensor.elem_type,
        dims,
    })
}
