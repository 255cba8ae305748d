// onnx/ — Minimal ONNX model I/O.
//
// Provides:
// - protobuf message definitions (prost)
// - graph serialization with external-data splitting
// - reading back a written graph's declared interface

pub mod inspect;
pub mod proto;
pub mod writer;
