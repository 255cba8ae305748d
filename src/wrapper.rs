// wrapper.rs — Sentence-embedding head on top of the traced encoder.
//
// Maps (input_ids, attention_mask, token_type_ids) to one vector per input sequence:
// encoder -> masked mean pooling -> L2 normalization.

use candle_core::DType;

use crate::config;
use crate::error::ExportError;
use crate::model::pooling::PoolingStrategy;
use crate::model::SentenceTransformer;
use crate::trace::encoder::{self, EncoderInputs};
use crate::trace::tracer::{Traced, Tracer};

pub struct SentenceEmbeddingWrapper<'m> {
    model: &'m SentenceTransformer,
}

impl<'m> SentenceEmbeddingWrapper<'m> {
    /// Wrap a loaded checkpoint. Anything but mean pooling is rejected here, before any
    /// tracing happens.
    pub fn new(model: &'m SentenceTransformer) -> Result<Self, ExportError> {
        let strategy = PoolingStrategy::from_config(&model.pooling)?;
        if strategy != PoolingStrategy::Mean {
            return Err(ExportError::UnsupportedPooling {
                mode: strategy.as_str().to_string(),
            });
        }
        if !model.normalize {
            log::info!("{} declares no Normalize module; output is L2-normalized anyway", model.model_id);
        }
        log::info!("Wrapping {} with {} pooling", model.model_id, strategy.as_str());
        Ok(Self { model })
    }

    pub fn model(&self) -> &SentenceTransformer {
        self.model
    }

    pub fn pooling_mode(&self) -> &'static str {
        PoolingStrategy::Mean.as_str()
    }

    pub fn embedding_dim(&self) -> usize {
        self.model.embedding_dim()
    }

    /// `[batch, hidden]` unit-length sentence embeddings.
    pub fn forward(
        &self,
        tracer: &mut Tracer,
        input_ids: &Traced,
        attention_mask: &Traced,
        token_type_ids: &Traced,
    ) -> anyhow::Result<Traced> {
        let hidden = encoder::encode(
            tracer,
            self.model,
            &EncoderInputs {
                input_ids,
                attention_mask,
                token_type_ids,
            },
        )?;
        let pooled = mean_pool(tracer, &hidden, attention_mask)?;
        l2_normalize(tracer, &pooled)
    }
}

/// Average of the token vectors whose mask is 1. The token count is clamped to 1e-9 so an
/// all-zero mask yields zeros instead of NaN.
pub fn mean_pool(tracer: &mut Tracer, hidden: &Traced, attention_mask: &Traced) -> anyhow::Result<Traced> {
    let mask = tracer.unsqueeze(attention_mask, &[2])?;
    let mask = tracer.cast(&mask, DType::F32)?;
    let masked = tracer.mul(hidden, &mask)?;
    let summed = tracer.reduce_sum(&masked, &[1], false)?;
    let counts = tracer.reduce_sum(&mask, &[1], false)?;
    let counts = tracer.clip_min(&counts, config::pooling::MASK_SUM_EPS as f32)?;
    tracer.div(&summed, &counts)
}

/// `x / max(||x||_2, 1e-12)` along the last axis.
pub fn l2_normalize(tracer: &mut Tracer, x: &Traced) -> anyhow::Result<Traced> {
    let squared = tracer.mul(x, x)?;
    let sum = tracer.reduce_sum(&squared, &[1], true)?;
    let norm = tracer.sqrt(&sum)?;
    let norm = tracer.clip_min(&norm, config::pooling::L2_NORM_EPS as f32)?;
    tracer.div(x, &norm)
}
