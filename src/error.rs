// error.rs — Typed rejections that callers and tests need to tell apart.
//
// Everything else travels as anyhow::Error with context attached.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    /// The checkpoint pools with something other than the attention-masked mean.
    #[error("unsupported pooling mode `{mode}`: only mean pooling is supported for ONNX export")]
    UnsupportedPooling { mode: String },

    /// Encoder family the tracer has no forward pass for.
    #[error("unsupported encoder architecture: {detail}")]
    UnsupportedArchitecture { detail: String },

    /// `tokenizer.json` did not appear after saving the tokenizer.
    #[error("tokenizer.json file not found in {}", dir.display())]
    MissingTokenizerFile { dir: PathBuf },
}
