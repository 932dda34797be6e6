//! Trainable tokens: sparse deltas on selected rows of an embedding table.
//!
//! Only the rows listed in `token_indices` receive a learned delta, so new or
//! re-purposed vocabulary entries can be trained without touching the rest
//! of the table.

use std::collections::HashMap;

use candle_core::{DType, Module, Tensor};
use candle_nn::Embedding;
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, PeftType, TunerConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::{BaseLayer, ForwardContext};
use crate::traits::{Adapter, AdapterConfig, Mergeable};

/// Configuration for trainable-token adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainableTokensConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Module selection; defaults to the input embedding.
    #[serde(flatten)]
    pub tuner: TunerConfig,

    /// Vocabulary rows that get a trainable delta.
    #[serde(default)]
    pub token_indices: Vec<usize>,

    /// Start from a zero delta; `false` draws the delta from U(0, 1).
    #[serde(default = "default_true")]
    pub init_weights: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TrainableTokensConfig {
    fn default() -> Self {
        Self {
            meta: PeftMeta::default(),
            tuner: TunerConfig::default(),
            token_indices: Vec::new(),
            init_weights: true,
        }
    }
}

impl AdapterConfig for TrainableTokensConfig {
    fn validate(&self) -> Result<()> {
        if self.token_indices.is_empty() {
            return Err(PeftError::InvalidConfig(
                "token_indices cannot be empty".into(),
            ));
        }
        self.tuner.validate()
    }
}

/// Sparse row deltas for one wrapped embedding.
#[derive(Debug, Clone)]
pub struct TrainableTokensAdapter {
    /// Row ids, `u32` for `index_add`.
    indices: Tensor,
    /// `[num_tokens, dim]`
    delta: Tensor,
    num_embeddings: usize,
    config: TrainableTokensConfig,
}

impl TrainableTokensAdapter {
    /// Create the delta rows for one wrapped embedding.
    ///
    /// # Errors
    /// Returns error if the layer is not an embedding or a token index is out
    /// of range.
    pub fn new(base: &BaseLayer, config: &TrainableTokensConfig) -> Result<Self> {
        config.validate()?;
        let BaseLayer::Embedding(embedding) = base else {
            return Err(PeftError::Unsupported {
                peft_type: PeftType::TrainableTokens,
                operation: "wrapping non-embedding modules",
            });
        };
        let weight = embedding.embeddings();
        let (num_embeddings, dim) = weight.dims2()?;
        if let Some(&bad) = config.token_indices.iter().find(|&&i| i >= num_embeddings) {
            return Err(PeftError::InvalidConfig(format!(
                "token index {bad} is out of range for an embedding with {num_embeddings} rows"
            )));
        }
        let ids: Vec<u32> = config
            .token_indices
            .iter()
            .map(|&i| u32::try_from(i))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| PeftError::InvalidConfig(format!("token index overflow: {e}")))?;
        let shape = (ids.len(), dim);
        let indices = Tensor::new(ids.as_slice(), weight.device())?;
        let delta = if config.init_weights {
            Tensor::zeros(shape, DType::F32, weight.device())?
        } else {
            Tensor::rand(0f32, 1.0, shape, weight.device())?
        };
        Ok(Self {
            indices,
            delta: delta.to_dtype(weight.dtype())?,
            num_embeddings,
            config: config.clone(),
        })
    }

    /// The learned rows, `[num_tokens, dim]`.
    #[must_use]
    pub fn delta(&self) -> &Tensor {
        &self.delta
    }

    /// Delta scattered into a full `[vocab, dim]` table.
    ///
    /// # Errors
    /// Returns error if the tensor operations fail.
    pub fn dense_delta(&self) -> Result<Tensor> {
        let dim = self.delta.dim(1)?;
        let table = Tensor::zeros(
            (self.num_embeddings, dim),
            self.delta.dtype(),
            self.delta.device(),
        )?;
        Ok(table.index_add(&self.indices, &self.delta, 0)?)
    }
}

impl Adapter for TrainableTokensAdapter {
    type Config = TrainableTokensConfig;

    fn forward(
        &self,
        input: &Tensor,
        base_output: Option<&Tensor>,
        _ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let dim = self.delta.dim(1)?;
        let rows = Embedding::new(self.dense_delta()?, dim).forward(input)?;
        match base_output {
            Some(base) => Ok(base.broadcast_add(&rows)?),
            None => Ok(rows),
        }
    }

    fn num_parameters(&self) -> usize {
        self.delta.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for TrainableTokensAdapter {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        Ok(base_weight.broadcast_add(&self.dense_delta()?.to_dtype(base_weight.dtype())?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        Ok(merged_weight.broadcast_sub(&self.dense_delta()?.to_dtype(merged_weight.dtype())?)?)
    }
}

impl SaveLoad for TrainableTokensAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "trainable_tokens_delta".to_string(),
            self.delta.clone(),
        )]))
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        self.delta = take_tensor(&mut state_dict, "trainable_tokens_delta", &self.delta)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn embedding() -> Result<BaseLayer> {
        let w = Tensor::randn(0f32, 1.0, (10, 4), &Device::Cpu)?;
        Ok(BaseLayer::Embedding(Embedding::new(w, 4)))
    }

    fn config(init_weights: bool) -> TrainableTokensConfig {
        TrainableTokensConfig {
            token_indices: vec![1, 3],
            init_weights,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_indices_rejected() {
        assert!(TrainableTokensConfig::default().validate().is_err());
    }

    #[test]
    fn test_out_of_range_index_rejected() -> Result<()> {
        let cfg = TrainableTokensConfig {
            token_indices: vec![10],
            ..Default::default()
        };
        assert!(TrainableTokensAdapter::new(&embedding()?, &cfg).is_err());
        Ok(())
    }

    #[test]
    fn test_only_selected_rows_change() -> Result<()> {
        let base = embedding()?;
        let adapter = TrainableTokensAdapter::new(&base, &config(false))?;
        let w = base.weight().unwrap();
        let merged = adapter.merge(w)?.to_vec2::<f32>()?;
        let orig = w.to_vec2::<f32>()?;
        for (row, (m, o)) in merged.iter().zip(orig.iter()).enumerate() {
            let changed = m != o;
            assert_eq!(changed, row == 1 || row == 3, "row {row}");
        }
        assert_eq!(adapter.num_parameters(), 8);
        Ok(())
    }

    #[test]
    fn test_forward_matches_fused_lookup() -> Result<()> {
        let base = embedding()?;
        let adapter = TrainableTokensAdapter::new(&base, &config(false))?;
        let ids = Tensor::new(&[[0u32, 1, 3, 9]], &Device::Cpu)?;
        let ctx = ForwardContext::eval();

        let out = adapter.forward(&ids, Some(&base.forward(&ids, &ctx)?), &ctx)?;
        let fused = base.with_weight(adapter.merge(base.weight().unwrap())?)?;
        let expected = fused.forward(&ids, &ctx)?;
        let diff = (out - expected)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
