// trace/ — Graph tracing.
//
// Provides:
// - the eager+recording tracer with constant folding
// - the BERT-family encoder forward pass expressed as traced ops

pub mod encoder;
pub mod tracer;
