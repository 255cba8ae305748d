// model/ — Pretrained sentence-transformers checkpoint.
//
// Provides:
// - hub download + local cache
// - checkpoint loading (encoder config, weights, tokenizer)
// - pooling configuration

pub mod download;
pub mod loader;
pub mod pooling;

pub use loader::SentenceTransformer;
