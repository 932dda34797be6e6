//! P-tuning: virtual tokens produced by a small MLP over learned embeddings.
//!
//! Reference: <https://arxiv.org/abs/2103.10385>

use std::collections::HashMap;

use candle_core::{Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, Linear};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{PeftMeta, PromptLearningConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::ForwardContext;
use crate::traits::AdapterConfig;

/// Configuration for P-tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEncoderConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Virtual-token fields.
    #[serde(flatten)]
    pub prompt: PromptLearningConfig,

    /// Hidden width of the MLP; defaults to `token_dim`.
    #[serde(default)]
    pub encoder_hidden_size: Option<usize>,

    /// Number of MLP layers. The MLP always has two hidden layers.
    #[serde(default = "default_num_layers")]
    pub encoder_num_layers: usize,

    /// Dropout inside the encoder.
    #[serde(default)]
    pub encoder_dropout: f64,
}

fn default_num_layers() -> usize {
    2
}

impl Default for PromptEncoderConfig {
    fn default() -> Self {
        Self {
            meta: PeftMeta::default(),
            prompt: PromptLearningConfig::default(),
            encoder_hidden_size: None,
            encoder_num_layers: default_num_layers(),
            encoder_dropout: 0.0,
        }
    }
}

impl AdapterConfig for PromptEncoderConfig {
    fn validate(&self) -> Result<()> {
        self.prompt.validate()?;
        if matches!(self.encoder_hidden_size, Some(0)) {
            return Err(PeftError::InvalidConfig(
                "encoder_hidden_size must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.encoder_dropout) {
            return Err(PeftError::InvalidConfig(
                "encoder_dropout must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }
}

/// `Linear -> ReLU -> Linear -> ReLU -> Linear`
#[derive(Debug, Clone)]
struct MlpHead {
    layers: [Linear; 3],
}

impl MlpHead {
    const KEYS: [&'static str; 3] = ["mlp_head.0", "mlp_head.2", "mlp_head.4"];

    fn new(dim: usize, hidden: usize, device: &Device) -> Result<Self> {
        let linear = |i: usize, o: usize| -> Result<Linear> {
            let bound = 1.0 / (i as f32).sqrt();
            Ok(Linear::new(
                Tensor::rand(-bound, bound, (o, i), device)?,
                Some(Tensor::rand(-bound, bound, o, device)?),
            ))
        };
        Ok(Self {
            layers: [linear(dim, hidden)?, linear(hidden, hidden)?, linear(hidden, dim)?],
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.layers[0].forward(x)?.relu()?;
        let h = self.layers[1].forward(&h)?.relu()?;
        Ok(self.layers[2].forward(&h)?)
    }
}

/// Prompt encoder for P-tuning.
///
/// In inference mode only the embedding is kept: it then holds the already
/// encoded virtual tokens.
#[derive(Debug, Clone)]
pub struct PromptEncoder {
    embedding: Embedding,
    mlp_head: Option<MlpHead>,
    dropout: Dropout,
}

impl PromptEncoder {
    /// Create the encoder.
    ///
    /// # Errors
    /// Returns error if the configuration is unresolved.
    pub fn new(config: &PromptEncoderConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let dim = config.prompt.token_dim()?;
        let total = config.prompt.num_virtual_tokens
            * config.prompt.num_transformer_submodules.unwrap_or(1);
        let hidden = config.encoder_hidden_size.unwrap_or(dim);
        if config.encoder_num_layers != 2 {
            warn!(
                num_layers = config.encoder_num_layers,
                "the MLP prompt encoder always uses 2 hidden layers, ignoring encoder_num_layers"
            );
        }
        let table = Tensor::randn(0f32, 1.0, (total, dim), device)?;
        let mlp_head = if config.meta.inference_mode {
            None
        } else {
            Some(MlpHead::new(dim, hidden, device)?)
        };
        Ok(Self {
            embedding: Embedding::new(table, dim),
            mlp_head,
            dropout: Dropout::new(config.encoder_dropout as f32),
        })
    }

    /// Encoded virtual tokens for `indices`.
    ///
    /// # Errors
    /// Returns error if an index is out of range.
    pub fn forward(&self, indices: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let embeds = self.embedding.forward(indices)?;
        match &self.mlp_head {
            Some(mlp) => {
                let out = mlp.forward(&embeds)?;
                Ok(self.dropout.forward(&out, ctx.training)?)
            }
            None => Ok(embeds),
        }
    }

    /// The raw embedding table.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        let mlp = self.mlp_head.as_ref().map_or(0, |m| {
            m.layers
                .iter()
                .map(|l| l.weight().elem_count() + l.bias().map_or(0, Tensor::elem_count))
                .sum()
        });
        self.weight().elem_count() + mlp
    }
}

impl SaveLoad for PromptEncoder {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("embedding.weight".to_string(), self.weight().clone());
        if let Some(mlp) = &self.mlp_head {
            for (key, layer) in MlpHead::KEYS.iter().zip(&mlp.layers) {
                state_dict.insert(format!("{key}.weight"), layer.weight().clone());
                if let Some(b) = layer.bias() {
                    state_dict.insert(format!("{key}.bias"), b.clone());
                }
            }
        }
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        let weight = take_tensor(&mut state_dict, "embedding.weight", self.weight())?;
        let mut layers = Vec::new();
        if let Some(mlp) = &self.mlp_head {
            for (key, layer) in MlpHead::KEYS.iter().zip(&mlp.layers) {
                let w = take_tensor(&mut state_dict, &format!("{key}.weight"), layer.weight())?;
                let b = match layer.bias() {
                    Some(b) => Some(take_tensor(&mut state_dict, &format!("{key}.bias"), b)?),
                    None => None,
                };
                layers.push(Linear::new(w, b));
            }
        }
        let dim = weight.dim(1)?;
        self.embedding = Embedding::new(weight, dim);
        if let Some(mlp) = &mut self.mlp_head {
            for (slot, layer) in mlp.layers.iter_mut().zip(layers) {
                *slot = layer;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(inference_mode: bool) -> PromptEncoderConfig {
        let mut config = PromptEncoderConfig {
            prompt: PromptLearningConfig {
                num_virtual_tokens: 3,
                token_dim: Some(8),
                ..Default::default()
            },
            encoder_hidden_size: Some(16),
            ..Default::default()
        };
        config.meta.inference_mode = inference_mode;
        config
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let encoder = PromptEncoder::new(&config(false), &Device::Cpu)?;
        let indices = Tensor::arange(0u32, 3, &Device::Cpu)?.unsqueeze(0)?;
        let out = encoder.forward(&indices, &ForwardContext::eval())?;
        assert_eq!(out.dims(), &[1, 3, 8]);
        // 3*8 + (8*16+16) + (16*16+16) + (16*8+8)
        assert_eq!(encoder.num_parameters(), 24 + 144 + 272 + 136);
        Ok(())
    }

    #[test]
    fn test_inference_mode_skips_mlp() -> Result<()> {
        let encoder = PromptEncoder::new(&config(true), &Device::Cpu)?;
        let indices = Tensor::arange(0u32, 3, &Device::Cpu)?;
        let out = encoder.forward(&indices, &ForwardContext::eval())?;
        let diff = (out - encoder.weight())?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-7);
        assert_eq!(encoder.num_parameters(), 24);
        Ok(())
    }

    #[test]
    fn test_state_dict_keys() -> Result<()> {
        let encoder = PromptEncoder::new(&config(false), &Device::Cpu)?;
        let state = encoder.state_dict()?;
        assert!(state.contains_key("embedding.weight"));
        assert!(state.contains_key("mlp_head.4.bias"));
        assert_eq!(state.len(), 7);

        let mut other = PromptEncoder::new(&config(false), &Device::Cpu)?;
        other.load_state_dict(state)?;
        Ok(())
    }
}
