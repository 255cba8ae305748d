// sample.rs — Example input used to trace the encoder.
//
// Only shapes and dtypes matter for the exported graph; the token ids are random.

use candle_core::{DType, Device, Tensor};
use rand::prelude::*;

/// `[batch, seq]` int64 tensors fed to the tracer.
pub struct SampleBatch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
}

impl SampleBatch {
    /// Random ids in `[0, vocab_bound)`, a full attention mask and zero token types.
    /// `seed` makes the ids reproducible; `None` draws from the thread RNG.
    pub fn random(
        batch: usize,
        seq_len: usize,
        vocab_bound: usize,
        seed: Option<u64>,
        device: &Device,
    ) -> anyhow::Result<Self> {
        if vocab_bound == 0 {
            anyhow::bail!("cannot sample token ids from an empty vocabulary");
        }
        let n = batch * seq_len;
        let bound = vocab_bound as i64;
        let ids: Vec<i64> = match seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                (0..n).map(|_| rng.gen_range(0..bound)).collect()
            }
            None => {
                let mut rng = thread_rng();
                (0..n).map(|_| rng.gen_range(0..bound)).collect()
            }
        };

        Ok(Self {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            attention_mask: Tensor::ones((batch, seq_len), DType::I64, device)?,
            token_type_ids: Tensor::zeros((batch, seq_len), DType::I64, device)?,
        })
    }
}
