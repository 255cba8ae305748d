// tracer.rs — Records a computation as ONNX nodes while evaluating it eagerly with candle.
//
// Every op computes its real result on the sample input (so shapes and values can be checked)
// and appends the matching node. Values derived only from parameters/constants are folded:
// the eager result is kept as a constant and no node is emitted. Constants become graph
// initializers only once a recorded node consumes them.

use std::collections::HashSet;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};

use crate::onnx::proto::{
    data_type, tensor_shape_proto::Dimension, AttributeProto, NodeProto, TensorProto, ValueInfoProto,
};

/// A value flowing through the traced computation.
#[derive(Debug, Clone)]
pub struct Traced {
    name: String,
    value: Tensor,
    constant: bool,
}

impl Traced {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Eager value computed on the sample input.
    pub fn value(&self) -> &Tensor {
        &self.value
    }
}

/// Per-dimension description of a graph input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis<'a> {
    Fixed,
    Variable(&'a str),
}

/// Everything the writer needs to serialize the traced computation.
#[derive(Debug)]
pub struct TracedGraph {
    pub nodes: Vec<NodeProto>,
    pub initializers: Vec<(String, Tensor)>,
    pub inputs: Vec<ValueInfoProto>,
    pub outputs: Vec<ValueInfoProto>,
    pub folded_ops: usize,
}

pub struct Tracer {
    device: Device,
    fold_constants: bool,
    nodes: Vec<NodeProto>,
    initializers: Vec<(String, Tensor)>,
    materialized: HashSet<String>,
    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
    next_id: usize,
    folded_ops: usize,
}

impl Tracer {
    pub fn new(fold_constants: bool) -> Self {
        Self {
            device: Device::Cpu,
            fold_constants,
            nodes: Vec::new(),
            initializers: Vec::new(),
            materialized: HashSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            next_id: 0,
            folded_ops: 0,
        }
    }

    /// Declare a graph input. `axes` must have one entry per dimension of `value`.
    pub fn input(&mut self, name: &str, value: Tensor, axes: &[Axis]) -> anyhow::Result<Traced> {
        let info = value_info(name, &value, axes)?;
        self.inputs.push(info);
        Ok(Traced {
            name: name.to_string(),
            value,
            constant: false,
        })
    }

    /// A named model parameter. Exported only if a recorded node ends up reading it.
    pub fn parameter(&mut self, name: &str, value: Tensor) -> Traced {
        Traced {
            name: name.to_string(),
            value,
            constant: true,
        }
    }

    pub fn scalar_f32(&mut self, v: f32) -> anyhow::Result<Traced> {
        let value = Tensor::new(v, &self.device)?;
        Ok(self.constant(value))
    }

    pub fn scalar_i64(&mut self, v: i64) -> anyhow::Result<Traced> {
        let value = Tensor::new(v, &self.device)?;
        Ok(self.constant(value))
    }

    pub fn const_i64(&mut self, values: &[i64]) -> anyhow::Result<Traced> {
        let value = Tensor::new(values, &self.device)?;
        Ok(self.constant(value))
    }

    fn constant(&mut self, value: Tensor) -> Traced {
        let name = self.next_name("const");
        Traced {
            name,
            value,
            constant: true,
        }
    }

    pub fn gather(&mut self, data: &Traced, indices: &Traced) -> anyhow::Result<Traced> {
        let flat = indices.value.flatten_all()?;
        let picked = data.value.index_select(&flat, 0)?;
        let mut dims = indices.value.dims().to_vec();
        dims.extend_from_slice(&data.value.dims()[1..]);
        let value = picked.reshape(dims)?;
        Ok(self.emit("Gather", &[data, indices], vec![AttributeProto::int("axis", 0)], value))
    }

    pub fn add(&mut self, a: &Traced, b: &Traced) -> anyhow::Result<Traced> {
        let value = a.value.broadcast_add(&b.value)?;
        Ok(self.emit("Add", &[a, b], vec![], value))
    }

    pub fn sub(&mut self, a: &Traced, b: &Traced) -> anyhow::Result<Traced> {
        let value = a.value.broadcast_sub(&b.value)?;
        Ok(self.emit("Sub", &[a, b], vec![], value))
    }

    pub fn mul(&mut self, a: &Traced, b: &Traced) -> anyhow::Result<Traced> {
        let value = a.value.broadcast_mul(&b.value)?;
        Ok(self.emit("Mul", &[a, b], vec![], value))
    }

    pub fn div(&mut self, a: &Traced, b: &Traced) -> anyhow::Result<Traced> {
        let value = a.value.broadcast_div(&b.value)?;
        Ok(self.emit("Div", &[a, b], vec![], value))
    }

    pub fn matmul(&mut self, a: &Traced, b: &Traced) -> anyhow::Result<Traced> {
        let value = a.value.contiguous()?.broadcast_matmul(&b.value.contiguous()?)?;
        Ok(self.emit("MatMul", &[a, b], vec![], value))
    }

    pub fn transpose(&mut self, x: &Traced, perm: &[usize]) -> anyhow::Result<Traced> {
        let value = x.value.permute(perm.to_vec())?.contiguous()?;
        let perm: Vec<i64> = perm.iter().map(|&p| p as i64).collect();
        Ok(self.emit("Transpose", &[x], vec![AttributeProto::ints("perm", &perm)], value))
    }

    /// Reshape with ONNX semantics: `0` copies the input dimension, `-1` is inferred.
    pub fn reshape(&mut self, x: &Traced, shape: &[i64]) -> anyhow::Result<Traced> {
        let dims = resolve_reshape(x.value.dims(), shape)?;
        let value = x.value.reshape(dims)?;
        let shape = self.const_i64(shape)?;
        Ok(self.emit("Reshape", &[x, &shape], vec![], value))
    }

    pub fn unsqueeze(&mut self, x: &Traced, axes: &[usize]) -> anyhow::Result<Traced> {
        let mut sorted = axes.to_vec();
        sorted.sort_unstable();
        let mut value = x.value.clone();
        for &axis in &sorted {
            value = value.unsqueeze(axis)?;
        }
        let axes: Vec<i64> = sorted.iter().map(|&a| a as i64).collect();
        let axes = self.const_i64(&axes)?;
        Ok(self.emit("Unsqueeze", &[x, &axes], vec![], value))
    }

    pub fn cast(&mut self, x: &Traced, to: DType) -> anyhow::Result<Traced> {
        let value = x.value.to_dtype(to)?;
        let to = onnx_data_type(to)?;
        Ok(self.emit("Cast", &[x], vec![AttributeProto::int("to", i64::from(to))], value))
    }

    pub fn shape(&mut self, x: &Traced) -> anyhow::Result<Traced> {
        let dims: Vec<i64> = x.value.dims().iter().map(|&d| d as i64).collect();
        let value = Tensor::new(dims.as_slice(), &self.device)?;
        Ok(self.emit("Shape", &[x], vec![], value))
    }

    /// An int64 tensor of the given (1-D int64) shape filled with `fill`.
    pub fn constant_of_shape(&mut self, shape: &Traced, fill: i64) -> anyhow::Result<Traced> {
        let dims: Vec<usize> = shape
            .value
            .to_vec1::<i64>()
            .context("ConstantOfShape expects a 1-D int64 shape")?
            .into_iter()
            .map(|d| d as usize)
            .collect();
        let value = Tensor::full(fill, dims, &self.device)?;
        let fill_tensor = tensor_proto("", &Tensor::new(&[fill], &self.device)?)?;
        Ok(self.emit(
            "ConstantOfShape",
            &[shape],
            vec![AttributeProto::tensor("value", fill_tensor)],
            value,
        ))
    }

    pub fn cumsum(&mut self, x: &Traced, axis: usize) -> anyhow::Result<Traced> {
        // candle has no integer cumsum; token counts stay far below f32's exact-integer range.
        let value = x.value.to_dtype(DType::F32)?.cumsum(axis)?.to_dtype(x.value.dtype())?;
        let axis = self.scalar_i64(axis as i64)?;
        Ok(self.emit("CumSum", &[x, &axis], vec![], value))
    }

    /// Elementwise equality; the result is boolean (u8 eagerly).
    pub fn equal(&mut self, a: &Traced, b: &Traced) -> anyhow::Result<Traced> {
        let rhs = b.value.broadcast_as(a.value.shape())?;
        let value = a.value.eq(&rhs)?;
        Ok(self.emit("Equal", &[a, b], vec![], value))
    }

    pub fn not(&mut self, x: &Traced) -> anyhow::Result<Traced> {
        if x.value.dtype() != DType::U8 {
            bail!("Not expects a boolean input, got {:?}", x.value.dtype());
        }
        let value = (x.value.ones_like()? - &x.value)?;
        Ok(self.emit("Not", &[x], vec![], value))
    }

    /// Softmax over the last axis.
    pub fn softmax(&mut self, x: &Traced) -> anyhow::Result<Traced> {
        let value = candle_nn::ops::softmax_last_dim(&x.value.contiguous()?)?;
        Ok(self.emit("Softmax", &[x], vec![AttributeProto::int("axis", -1)], value))
    }

    pub fn erf(&mut self, x: &Traced) -> anyhow::Result<Traced> {
        let value = x.value.erf()?;
        Ok(self.emit("Erf", &[x], vec![], value))
    }

    pub fn sqrt(&mut self, x: &Traced) -> anyhow::Result<Traced> {
        let value = x.value.sqrt()?;
        Ok(self.emit("Sqrt", &[x], vec![], value))
    }

    pub fn relu(&mut self, x: &Traced) -> anyhow::Result<Traced> {
        let value = x.value.relu()?;
        Ok(self.emit("Relu", &[x], vec![], value))
    }

    pub fn reduce_sum(&mut self, x: &Traced, axes: &[usize], keepdims: bool) -> anyhow::Result<Traced> {
        let mut sorted = axes.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        let mut value = x.value.clone();
        for &axis in &sorted {
            value = if keepdims { value.sum_keepdim(axis)? } else { value.sum(axis)? };
        }
        sorted.reverse();
        let axes: Vec<i64> = sorted.iter().map(|&a| a as i64).collect();
        let axes = self.const_i64(&axes)?;
        Ok(self.emit(
            "ReduceSum",
            &[x, &axes],
            vec![AttributeProto::int("keepdims", i64::from(keepdims))],
            value,
        ))
    }

    /// Clip with only a lower bound: `max(x, min)`.
    pub fn clip_min(&mut self, x: &Traced, min: f32) -> anyhow::Result<Traced> {
        let value = x.value.maximum(min)?;
        let min = self.scalar_f32(min)?;
        Ok(self.emit("Clip", &[x, &min], vec![], value))
    }

    /// LayerNormalization over the last axis.
    pub fn layer_norm(&mut self, x: &Traced, scale: &Traced, bias: &Traced, eps: f64) -> anyhow::Result<Traced> {
        let mean = x.value.mean_keepdim(candle_core::D::Minus1)?;
        let centered = x.value.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let std = (var + eps)?.sqrt()?;
        let value = centered
            .broadcast_div(&std)?
            .broadcast_mul(&scale.value)?
            .broadcast_add(&bias.value)?;
        Ok(self.emit(
            "LayerNormalization",
            &[x, scale, bias],
            vec![AttributeProto::int("axis", -1), AttributeProto::float("epsilon", eps as f32)],
            value,
        ))
    }

    /// Bind `value` to a graph output called `name` by renaming the node that produced it.
    pub fn output(&mut self, value: &Traced, name: &str, axes: &[Axis]) -> anyhow::Result<()> {
        if value.constant {
            bail!("graph output {name} does not depend on any input");
        }
        let node = self
            .nodes
            .iter_mut()
            .rev()
            .find(|n| n.output.iter().any(|o| o == &value.name))
            .with_context(|| format!("no node produces {}", value.name))?;
        for out in node.output.iter_mut().filter(|o| **o == value.name) {
            *out = name.to_string();
        }
        for node in self.nodes.iter_mut() {
            for input in node.input.iter_mut().filter(|i| **i == value.name) {
                *input = name.to_string();
            }
        }
        self.outputs.push(value_info(name, &value.value, axes)?);
        Ok(())
    }

    pub fn finish(self) -> TracedGraph {
        TracedGraph {
            nodes: self.nodes,
            initializers: self.initializers,
            inputs: self.inputs,
            outputs: self.outputs,
            folded_ops: self.folded_ops,
        }
    }

    fn next_name(&mut self, prefix: &str) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("{prefix}_{id}")
    }

    fn emit(&mut self, op_type: &str, inputs: &[&Traced], attribute: Vec<AttributeProto>, value: Tensor) -> Traced {
        if self.fold_constants && inputs.iter().all(|t| t.constant) {
            self.folded_ops += 1;
            return self.constant(value);
        }

        for input in inputs.iter().filter(|t| t.constant) {
            if self.materialized.insert(input.name.clone()) {
                self.initializers.push((input.name.clone(), input.value.clone()));
            }
        }

        let output = self.next_name(op_type);
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|t| t.name.clone()).collect(),
            output: vec![output.clone()],
            name: format!("/{output}"),
            op_type: op_type.to_string(),
            attribute,
            ..Default::default()
        });
        Traced {
            name: output,
            value,
            constant: false,
        }
    }
}

fn resolve_reshape(input: &[usize], shape: &[i64]) -> anyhow::Result<Vec<usize>> {
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(shape.len());
    let mut hole = None;
    for (i, &s) in shape.iter().enumerate() {
        match s {
            0 => dims.push(*input.get(i).with_context(|| format!("reshape: no input dim {i} to copy"))?),
            -1 => {
                if hole.replace(i).is_some() {
                    bail!("reshape: more than one -1 in {shape:?}");
                }
                dims.push(1);
            }
            s if s > 0 => dims.push(s as usize),
            s => bail!("reshape: invalid dimension {s}"),
        }
    }
    if let Some(i) = hole {
        let known: usize = dims.iter().product();
        if known == 0 || total % known != 0 {
            bail!("reshape: cannot infer dimension of {input:?} into {shape:?}");
        }
        dims[i] = total / known;
    }
    Ok(dims)
}

pub fn onnx_data_type(dtype: DType) -> anyhow::Result<i32> {
    match dtype {
        DType::F32 => Ok(data_type::FLOAT),
        DType::I64 => Ok(data_type::INT64),
        // candle has no bool dtype; comparisons yield u8 0/1.
        DType::U8 => Ok(data_type::BOOL),
        other => bail!("no ONNX element type mapping for {other:?}"),
    }
}

/// Serialize a tensor into an inline `TensorProto` (little-endian raw data).
pub fn tensor_proto(name: &str, tensor: &Tensor) -> anyhow::Result<TensorProto> {
    let data_type = onnx_data_type(tensor.dtype())?;
    Ok(TensorProto {
        dims: tensor.dims().iter().map(|&d| d as i64).collect(),
        data_type,
        name: name.to_string(),
        raw_data: raw_bytes(tensor)?,
        ..Default::default()
    })
}

pub fn raw_bytes(tensor: &Tensor) -> anyhow::Result<Vec<u8>> {
    let flat = tensor.flatten_all()?;
    let bytes = match tensor.dtype() {
        DType::F32 => flat.to_vec1::<f32>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::I64 => flat.to_vec1::<i64>()?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        DType::U8 => flat.to_vec1::<u8>()?,
        other => bail!("cannot serialize {other:?} tensor"),
    };
    Ok(bytes)
}

fn value_info(name: &str, value: &Tensor, axes: &[Axis]) -> anyhow::Result<ValueInfoProto> {
    let dims = value.dims();
    if dims.len() != axes.len() {
        bail!("{name}: {} axes declared for a rank-{} tensor", axes.len(), dims.len());
    }
    let dims = dims
        .iter()
        .zip(axes)
        .map(|(&size, axis)| match axis {
            Axis::Fixed => Dimension::fixed(size as i64),
            Axis::Variable(sym) => Dimension::symbolic(sym),
        })
        .collect();
    Ok(ValueInfoProto::tensor(name, onnx_data_type(value.dtype())?, dims))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(tracer: &mut Tracer, rows: &[&[i64]]) -> Traced {
        let data: Vec<i64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        let t = Tensor::from_vec(data, (rows.len(), rows[0].len()), &Device::Cpu).unwrap();
        tracer
            .input("input_ids", t, &[Axis::Variable("batch_size"), Axis::Variable("sequence_length")])
            .unwrap()
    }

    #[test]
    fn test_parameter_only_ops_are_folded() {
        let mut tracer = Tracer::new(true);
        let w = Tensor::new(&[[1f32, 2.], [3., 4.], [5., 6.]], &Device::Cpu).unwrap();
        let w = tracer.parameter("dense.weight", w);
        let wt = tracer.transpose(&w, &[1, 0]).unwrap();
        assert!(wt.constant);

        let x = Tensor::new(&[[1f32, 1.]], &Device::Cpu).unwrap();
        let x = tracer.input("x", x, &[Axis::Variable("batch_size"), Axis::Fixed]).unwrap();
        let y = tracer.matmul(&x, &wt).unwrap();
        assert_eq!(y.value().to_vec2::<f32>().unwrap(), vec![vec![3., 7., 11.]]);

        let graph = tracer.finish();
        assert_eq!(graph.folded_ops, 1);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].op_type, "MatMul");
        // Only the folded transpose is exported, not the original parameter.
        assert_eq!(graph.initializers.len(), 1);
        assert_eq!(graph.initializers[0].1.dims(), &[2, 3]);
    }

    #[test]
    fn test_without_folding_every_op_is_recorded() {
        let mut tracer = Tracer::new(false);
        let w = tracer.parameter("w", Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap());
        let wt = tracer.transpose(&w, &[1, 0]).unwrap();
        assert!(!wt.constant);
        let graph = tracer.finish();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.initializers[0].0, "w");
    }

    #[test]
    fn test_reshape_resolves_zero_and_hole() {
        assert_eq!(resolve_reshape(&[2, 5, 8], &[0, 0, 2, 4]).unwrap(), vec![2, 5, 2, 4]);
        assert_eq!(resolve_reshape(&[2, 5, 2, 4], &[0, 0, -1]).unwrap(), vec![2, 5, 8]);
        assert!(resolve_reshape(&[2, 5], &[-1, -1]).is_err());
        assert!(resolve_reshape(&[2, 5], &[3, -1]).is_err());
    }

    #[test]
    fn test_position_ops_on_dynamic_input() {
        let mut tracer = Tracer::new(true);
        let input_ids = ids(&mut tracer, &[&[5, 7, 1, 1]]);
        let pad = tracer.scalar_i64(1).unwrap();
        let is_pad = tracer.equal(&input_ids, &pad).unwrap();
        let keep = tracer.not(&is_pad).unwrap();
        let mask = tracer.cast(&keep, DType::I64).unwrap();
        let counts = tracer.cumsum(&mask, 1).unwrap();
        assert_eq!(mask.value().to_vec2::<i64>().unwrap(), vec![vec![1, 1, 0, 0]]);
        assert_eq!(counts.value().to_vec2::<i64>().unwrap(), vec![vec![1, 2, 2, 2]]);

        let shape = tracer.shape(&input_ids).unwrap();
        let ones = tracer.constant_of_shape(&shape, 1).unwrap();
        assert_eq!(ones.value().to_vec2::<i64>().unwrap(), vec![vec![1, 1, 1, 1]]);
        assert!(!ones.constant);
    }

    #[test]
    fn test_output_renames_producer() {
        let mut tracer = Tracer::new(true);
        let input_ids = ids(&mut tracer, &[&[1, 2]]);
        let m = tracer.cast(&input_ids, DType::F32).unwrap();
        let s = tracer.reduce_sum(&m, &[1], false).unwrap();
        assert_eq!(s.value().to_vec1::<f32>().unwrap(), vec![3.0]);
        tracer.output(&s, "total", &[Axis::Variable("batch_size")]).unwrap();
        let graph = tracer.finish();
        assert_eq!(graph.nodes.last().unwrap().output, vec!["total".to_string()]);
        assert_eq!(graph.outputs[0].name, "total");
    }

    #[test]
    fn test_output_rejects_constant() {
        let mut tracer = Tracer::new(true);
        let c = tracer.scalar_f32(1.0).unwrap();
        assert!(tracer.output(&c, "y", &[]).is_err());
    }

    #[test]
    fn test_layer_norm_matches_definition() {
        let mut tracer = Tracer::new(true);
        let x = Tensor::new(&[[[1f32, 2., 3., 4.]]], &Device::Cpu).unwrap();
        let x = tracer.input("x", x, &[Axis::Fixed, Axis::Fixed, Axis::Fixed]).unwrap();
        let scale = tracer.parameter("ln.weight", Tensor::ones(4, DType::F32, &Device::Cpu).unwrap());
        let bias = tracer.parameter("ln.bias", Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap());
        let y = tracer.layer_norm(&x, &scale, &bias, 1e-12).unwrap();
        let y: Vec<f32> = y.value().flatten_all().unwrap().to_vec1().unwrap();
        let sum: f32 = y.iter().sum();
        let var: f32 = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(sum.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }
}
