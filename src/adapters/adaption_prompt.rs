//! Adaption prompt: a learned prompt attended to from inside attention layers.
//!
//! Each wrapped attention module owns an `[1, adapter_len, hidden]` prompt and
//! a zero-initialized gate. The module's own projections turn the prompt into
//! keys and values, the input's queries attend over them, and the gated result
//! is added to the regular attention output. With the gate at zero the
//! adapter starts as a no-op.
//!
//! Reference: <https://arxiv.org/abs/2303.16199>

use std::collections::HashMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, TargetModules};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::attention::softmax_f32;
use crate::layers::{Attention, ForwardContext};
use crate::traits::AdapterConfig;

/// Configuration for adaption-prompt adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptionPromptConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Name suffix of the attention modules to wrap.
    #[serde(default = "default_target")]
    pub target_modules: String,

    /// Number of prompt tokens per layer.
    #[serde(default = "default_adapter_len")]
    pub adapter_len: usize,

    /// Number of layers, counted from the top, that receive a prompt.
    #[serde(default = "default_adapter_layers")]
    pub adapter_layers: usize,
}

fn default_target() -> String {
    "self_attn".into()
}

fn default_adapter_len() -> usize {
    10
}

fn default_adapter_layers() -> usize {
    1
}

impl Default for AdaptionPromptConfig {
    fn default() -> Self {
        Self {
            meta: PeftMeta::default(),
            target_modules: default_target(),
            adapter_len: default_adapter_len(),
            adapter_layers: default_adapter_layers(),
        }
    }
}

impl AdaptionPromptConfig {
    /// Selector matching the target attention modules by suffix.
    #[must_use]
    pub fn selector(&self) -> TargetModules {
        TargetModules::names([self.target_modules.as_str()])
    }
}

impl AdapterConfig for AdaptionPromptConfig {
    fn validate(&self) -> Result<()> {
        if self.target_modules.is_empty() {
            return Err(PeftError::InvalidConfig(
                "target_modules cannot be empty".into(),
            ));
        }
        if self.adapter_len == 0 {
            return Err(PeftError::InvalidConfig("adapter_len must be > 0".into()));
        }
        if self.adapter_layers == 0 {
            return Err(PeftError::InvalidConfig(
                "adapter_layers must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Prompt and gate attached to one attention module.
#[derive(Debug, Clone)]
pub struct AdaptionPromptAdapter {
    /// `[1, adapter_len, hidden]`
    prompt: Tensor,
    /// `[1]`
    gate: Tensor,
}

impl AdaptionPromptAdapter {
    /// Create a random prompt and a closed gate for `attention`.
    ///
    /// # Errors
    /// Returns error if initialization fails.
    pub fn new(attention: &Attention, config: &AdaptionPromptConfig) -> Result<Self> {
        config.validate()?;
        let hidden = attention.num_heads() * attention.head_dim();
        let (dtype, device) = attention.dtype_device()?;
        let prompt = Tensor::randn(0f32, 1.0, (1, config.adapter_len, hidden), &device)?
            .to_dtype(dtype)?;
        let gate = Tensor::zeros(1, dtype, &device)?;
        Ok(Self { prompt, gate })
    }

    /// The learned prompt.
    #[must_use]
    pub fn prompt(&self) -> &Tensor {
        &self.prompt
    }

    /// The learned gate.
    #[must_use]
    pub fn gate(&self) -> &Tensor {
        &self.gate
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.prompt.elem_count() + self.gate.elem_count()
    }

    /// Gated attention of `x` over the prompt, projected to the output space.
    ///
    /// # Errors
    /// Returns error if shapes do not line up.
    pub fn forward(&self, attention: &Attention, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let expand = |t: Tensor| -> Result<Tensor> {
            let (_, heads, len, head_dim) = t.dims4()?;
            Ok(t.broadcast_as((batch, heads, len, head_dim))?.contiguous()?)
        };
        let prompt = self.prompt.to_dtype(x.dtype())?;
        let keys = expand(attention.keys(&prompt, ctx)?)?;
        let values = expand(attention.values(&prompt, ctx)?)?;
        let queries = attention.queries(x, ctx)?;

        let scale = 1.0 / (attention.head_dim() as f64).sqrt();
        let scores = queries
            .matmul(&keys.t()?.contiguous()?)?
            .affine(scale, 0.0)?;
        let gate = self.gate.to_dtype(x.dtype())?;
        let scores = softmax_f32(&scores)?.broadcast_mul(&gate)?;
        let out = scores.matmul(&values)?;
        attention.output(&attention.merge_heads(&out)?, ctx)
    }
}

impl SaveLoad for AdaptionPromptAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([
            ("adaption_prompt".to_string(), self.prompt.clone()),
            ("adaption_gate".to_string(), self.gate.clone()),
        ]))
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        let prompt = take_tensor(&mut state_dict, "adaption_prompt", &self.prompt)?;
        let gate = take_tensor(&mut state_dict, "adaption_gate", &self.gate)?;
        self.prompt = prompt;
        self.gate = gate;
        Ok(())
    }
}

/// Gate value used by tests to open a fresh adapter.
#[cfg(test)]
pub(crate) fn open_gate(adapter: &mut AdaptionPromptAdapter, value: f32) -> Result<()> {
    let dtype = adapter.gate.dtype();
    adapter.gate = Tensor::full(value, 1, adapter.gate.device())?.to_dtype(dtype)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::Linear;

    fn attention() -> Result<Attention> {
        let device = Device::Cpu;
        let proj = || -> Result<Linear> {
            Ok(Linear::new(
                Tensor::randn(0f32, 0.3, (8, 8), &device)?,
                None,
            ))
        };
        Attention::new(proj()?, proj()?, proj()?, proj()?, 2)
    }

    #[test]
    fn test_config_defaults() {
        let config = AdaptionPromptConfig::default();
        assert_eq!(config.target_modules, "self_attn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_closed_gate_contributes_nothing() -> Result<()> {
        let attn = attention()?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 8), &Device::Cpu)?;
        let adapter = AdaptionPromptAdapter::new(&attn, &AdaptionPromptConfig::default())?;
        let out = adapter.forward(&attn, &x, &ForwardContext::eval())?;
        assert_eq!(out.dims(), &[2, 3, 8]);
        let max = out.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max < 1e-7);
        assert_eq!(adapter.num_parameters(), 10 * 8 + 1);
        Ok(())
    }

    #[test]
    fn test_open_gate_changes_output() -> Result<()> {
        let attn = attention()?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu)?;
        let mut adapter = AdaptionPromptAdapter::new(&attn, &AdaptionPromptConfig::default())?;
        open_gate(&mut adapter, 1.0)?;
        let out = adapter.forward(&attn, &x, &ForwardContext::eval())?;
        let max = out.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(max > 1e-4);
        Ok(())
    }
}
