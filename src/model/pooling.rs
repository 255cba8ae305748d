// pooling.rs — Pooling configuration of a sentence-transformers checkpoint.
//
// The `1_Pooling/config.json` file carries one boolean flag per strategy. We decode it into a
// closed enum; only `Mean` can be exported.

use serde::Deserialize;

use crate::error::ExportError;

#[derive(Debug, Clone, Deserialize)]
pub struct PoolingConfig {
    pub word_embedding_dimension: usize,
    #[serde(default)]
    pub pooling_mode_cls_token: bool,
    #[serde(default)]
    pub pooling_mode_mean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_max_tokens: bool,
    #[serde(default)]
    pub pooling_mode_mean_sqrt_len_tokens: bool,
    #[serde(default)]
    pub pooling_mode_weightedmean_tokens: bool,
    #[serde(default)]
    pub pooling_mode_lasttoken: bool,
    /// Newer checkpoints may name the mode directly instead of setting a flag.
    #[serde(default)]
    pub pooling_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingStrategy {
    Mean,
    Cls,
    Max,
    MeanSqrtLen,
    WeightedMean,
    LastToken,
}

impl PoolingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolingStrategy::Mean => "mean",
            PoolingStrategy::Cls => "cls",
            PoolingStrategy::Max => "max",
            PoolingStrategy::MeanSqrtLen => "mean_sqrt_len_tokens",
            PoolingStrategy::WeightedMean => "weightedmean",
            PoolingStrategy::LastToken => "lasttoken",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "mean" | "mean_tokens" => Some(PoolingStrategy::Mean),
            "cls" | "cls_token" => Some(PoolingStrategy::Cls),
            "max" | "max_tokens" => Some(PoolingStrategy::Max),
            "mean_sqrt_len_tokens" => Some(PoolingStrategy::MeanSqrtLen),
            "weightedmean" | "weightedmean_tokens" => Some(PoolingStrategy::WeightedMean),
            "lasttoken" => Some(PoolingStrategy::LastToken),
            _ => None,
        }
    }

    /// Decode the configured strategy. Zero or several enabled flags cannot be reproduced by a
    /// single pooling stage and are rejected.
    pub fn from_config(cfg: &PoolingConfig) -> Result<Self, ExportError> {
        let flags = [
            (cfg.pooling_mode_cls_token, PoolingStrategy::Cls),
            (cfg.pooling_mode_mean_tokens, PoolingStrategy::Mean),
            (cfg.pooling_mode_max_tokens, PoolingStrategy::Max),
            (cfg.pooling_mode_mean_sqrt_len_tokens, PoolingStrategy::MeanSqrtLen),
            (cfg.pooling_mode_weightedmean_tokens, PoolingStrategy::WeightedMean),
            (cfg.pooling_mode_lasttoken, PoolingStrategy::LastToken),
        ];
        let enabled: Vec<PoolingStrategy> = flags.iter().filter(|(on, _)| *on).map(|(_, s)| *s).collect();

        match enabled.as_slice() {
            [single] => Ok(*single),
            [] => match cfg.pooling_mode.as_deref() {
                Some(name) => Self::parse(name).ok_or_else(|| ExportError::UnsupportedPooling {
                    mode: name.to_string(),
                }),
                None => Err(ExportError::UnsupportedPooling {
                    mode: "none".to_string(),
                }),
            },
            several => Err(ExportError::UnsupportedPooling {
                mode: several.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("+"),
            }),
        }
    }
}
