//! Prefix Tuning implementation.
//!
//! Prefix tuning prepends trainable "prefix" vectors to the keys and values
//! in attention layers, without modifying the original model weights.
//!
//! Reference: <https://arxiv.org/abs/2101.00190>

use std::collections::HashMap;

use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, Linear};
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, PromptLearningConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::KeyValue;
use crate::traits::AdapterConfig;

/// Configuration for prefix tuning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrefixTuningConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Virtual-token fields.
    #[serde(flatten)]
    pub prompt: PromptLearningConfig,

    /// Hidden width of the projection MLP; defaults to `token_dim`.
    #[serde(default)]
    pub encoder_hidden_size: Option<usize>,

    /// Whether to use a reparameterization MLP.
    #[serde(default)]
    pub prefix_projection: bool,
}

impl AdapterConfig for PrefixTuningConfig {
    fn validate(&self) -> Result<()> {
        self.prompt.validate()?;
        if matches!(self.encoder_hidden_size, Some(0)) {
            return Err(PeftError::InvalidConfig(
                "encoder_hidden_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Projection {
    up: Linear,
    down: Linear,
}

/// Produces `num_layers * 2 * token_dim` prefix activations per virtual token.
///
/// With `prefix_projection` the table is `[num_virtual_tokens, token_dim]`
/// followed by `Linear -> tanh -> Linear`; otherwise (and always in
/// inference mode) the table holds the flattened key/value prefixes directly.
#[derive(Debug, Clone)]
pub struct PrefixEncoder {
    embedding: Embedding,
    projection: Option<Projection>,
    num_layers: usize,
    num_heads: usize,
    token_dim: usize,
}

impl PrefixEncoder {
    /// Create the encoder.
    ///
    /// # Errors
    /// Returns error if the configuration is unresolved.
    pub fn new(config: &PrefixTuningConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let token_dim = config.prompt.token_dim()?;
        let num_layers = config.prompt.num_layers()?;
        let num_heads = config.prompt.num_attention_heads()?;
        let total = config.prompt.num_virtual_tokens;
        let flat = num_layers * 2 * token_dim;

        let (embedding, projection) = if config.prefix_projection && !config.meta.inference_mode {
            let hidden = config.encoder_hidden_size.unwrap_or(token_dim);
            let linear = |i: usize, o: usize| -> Result<Linear> {
                let bound = 1.0 / (i as f32).sqrt();
                Ok(Linear::new(
                    Tensor::rand(-bound, bound, (o, i), device)?,
                    Some(Tensor::rand(-bound, bound, o, device)?),
                ))
            };
            let table = Tensor::randn(0f32, 1.0, (total, token_dim), device)?;
            (
                Embedding::new(table, token_dim),
                Some(Projection {
                    up: linear(token_dim, hidden)?,
                    down: linear(hidden, flat)?,
                }),
            )
        } else {
            let table = Tensor::randn(0f32, 1.0, (total, flat), device)?;
            (Embedding::new(table, flat), None)
        };
        Ok(Self {
            embedding,
            projection,
            num_layers,
            num_heads,
            token_dim,
        })
    }

    /// Flat prefix activations for `indices`: `[..., num_layers * 2 * token_dim]`.
    ///
    /// # Errors
    /// Returns error if an index is out of range.
    pub fn forward(&self, indices: &Tensor) -> Result<Tensor> {
        let embeds = self.embedding.forward(indices)?;
        match &self.projection {
            Some(p) => {
                let h = p.up.forward(&embeds)?.tanh()?;
                Ok(p.down.forward(&h)?)
            }
            None => Ok(embeds),
        }
    }

    /// Split `[batch, nvt, num_layers * 2 * token_dim]` into per-layer key/value
    /// prefixes of shape `[batch, heads, nvt, head_dim]`.
    ///
    /// # Errors
    /// Returns error if the activations have the wrong width.
    pub fn past_key_values(&self, flat: &Tensor) -> Result<Vec<KeyValue>> {
        let (batch, nvt, _) = flat.dims3()?;
        let head_dim = self.token_dim / self.num_heads;
        let pkv = flat
            .reshape((batch, nvt, self.num_layers * 2, self.num_heads, head_dim))?
            .permute((2, 0, 3, 1, 4))?
            .contiguous()?;
        (0..self.num_layers)
            .map(|layer| {
                let key = pkv.get(2 * layer)?;
                let value = pkv.get(2 * layer + 1)?;
                Ok((key, value))
            })
            .collect()
    }

    /// The raw embedding table.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        let projection = self.projection.as_ref().map_or(0, |p| {
            [&p.up, &p.down]
                .iter()
                .map(|l| l.weight().elem_count() + l.bias().map_or(0, Tensor::elem_count))
                .sum()
        });
        self.weight().elem_count() + projection
    }
}

impl SaveLoad for PrefixEncoder {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("embedding.weight".to_string(), self.weight().clone());
        if let Some(p) = &self.projection {
            for (key, layer) in [("transform.0", &p.up), ("transform.2", &p.down)] {
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
        let projection = match &self.projection {
            Some(p) => {
                let mut load = |key: &str, layer: &Linear| -> Result<Linear> {
                    let w = take_tensor(&mut state_dict, &format!("{key}.weight"), layer.weight())?;
                    let b = match layer.bias() {
                        Some(b) => Some(take_tensor(&mut state_dict, &format!("{key}.bias"), b)?),
                        None => None,
                    };
                    Ok(Linear::new(w, b))
                };
                Some(Projection {
                    up: load("transform.0", &p.up)?,
                    down: load("transform.2", &p.down)?,
                })
            }
            None => None,
        };
        let dim = weight.dim(1)?;
        self.embedding = Embedding::new(weight, dim);
        self.projection = projection;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(prefix_projection: bool) -> PrefixTuningConfig {
        PrefixTuningConfig {
            prompt: PromptLearningConfig {
                num_virtual_tokens: 4,
                token_dim: Some(8),
                num_attention_heads: Some(2),
                num_layers: Some(3),
                ..Default::default()
            },
            prefix_projection,
            encoder_hidden_size: Some(6),
            ..Default::default()
        }
    }

    #[test]
    fn test_prefix_tuning_config_default() {
        let config = PrefixTuningConfig::default();
        assert_eq!(config.prompt.num_virtual_tokens, 20);
        assert!(!config.prefix_projection);
    }

    #[test]
    fn test_unresolved_config_rejected() {
        let config = PrefixTuningConfig::default();
        assert!(PrefixEncoder::new(&config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_past_key_values_layout() -> Result<()> {
        let encoder = PrefixEncoder::new(&config(false), &Device::Cpu)?;
        let indices = Tensor::arange(0u32, 4, &Device::Cpu)?
            .unsqueeze(0)?
            .repeat((2, 1))?;
        let flat = encoder.forward(&indices)?;
        assert_eq!(flat.dims(), &[2, 4, 3 * 2 * 8]);

        let pkv = encoder.past_key_values(&flat)?;
        assert_eq!(pkv.len(), 3);
        assert_eq!(pkv[0].0.dims(), &[2, 2, 4, 4]);
        assert_eq!(pkv[2].1.dims(), &[2, 2, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_projection_parameters() -> Result<()> {
        let encoder = PrefixEncoder::new(&config(true), &Device::Cpu)?;
        // 4*8 + (8*6+6) + (6*48+48)
        assert_eq!(encoder.num_parameters(), 32 + 54 + 336);
        assert_eq!(encoder.state_dict()?.len(), 5);
        Ok(())
    }
}
