//! IA³ (Infused Adapter by Inhibiting and Amplifying Inner Activations) implementation.
//!
//! IA³ is an extremely parameter-efficient fine-tuning method that learns
//! rescaling vectors for keys, values, and feedforward layers.
//!
//! Reference: <https://arxiv.org/abs/2205.05638>

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, PeftType, TargetModules, TunerConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::{BaseLayer, ForwardContext};
use crate::traits::{Adapter, AdapterConfig, Mergeable};

/// Configuration for IA³ adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ia3Config {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Module selection.
    #[serde(flatten)]
    pub tuner: TunerConfig,

    /// Modules treated as feedforward (scaling applied to input).
    /// Must be a subset of `target_modules`.
    #[serde(default)]
    pub feedforward_modules: Option<TargetModules>,

    /// Whether to initialize the vectors in IA³ layers to ones.
    /// Setting this to false is discouraged.
    #[serde(default = "default_true")]
    pub init_ia3_weights: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Ia3Config {
    fn default() -> Self {
        Self {
            meta: PeftMeta::default(),
            tuner: TunerConfig::default(),
            feedforward_modules: None,
            init_ia3_weights: true,
        }
    }
}

impl AdapterConfig for Ia3Config {
    fn validate(&self) -> Result<()> {
        self.tuner.validate()?;
        // feedforward_modules must be a subset of target_modules
        if let (
            Some(TargetModules::Names(targets)),
            Some(TargetModules::Names(feedforward)),
        ) = (&self.tuner.target_modules, &self.feedforward_modules)
        {
            for ff_module in feedforward {
                if !targets.contains(ff_module) {
                    return Err(PeftError::InvalidConfig(format!(
                        "feedforward_module '{ff_module}' must be in target_modules"
                    )));
                }
            }
        }
        if let Some(TargetModules::Regex(pattern)) = &self.feedforward_modules {
            regex::Regex::new(pattern).map_err(|e| {
                PeftError::InvalidConfig(format!("feedforward_modules is not a valid regex: {e}"))
            })?;
        }
        Ok(())
    }
}

/// One IA³ vector attached to one wrapped layer.
///
/// For non-feedforward modules: `output = base_output * ia3_vector`
/// For feedforward modules: `output = base_layer(input * ia3_vector)`
#[derive(Debug, Clone)]
pub struct Ia3Adapter {
    /// Scaling vector over the input (feedforward) or output features.
    ia3_l: Tensor,
    is_feedforward: bool,
    /// Features live on dim 1 for convolutions and on the last dim otherwise.
    is_conv: bool,
    config: Ia3Config,
}

impl Ia3Adapter {
    /// Create the scaling vector for one wrapped layer.
    ///
    /// # Errors
    /// Returns error if the layer kind cannot carry IA³ or initialization fails.
    pub fn new(base: &BaseLayer, is_feedforward: bool, config: &Ia3Config) -> Result<Self> {
        config.validate()?;
        let (weight, is_conv) = match base {
            BaseLayer::Linear(l) => (l.weight(), false),
            BaseLayer::Conv2d(c) => (c.weight(), true),
            BaseLayer::Embedding(_) | BaseLayer::Attention(_) => {
                return Err(PeftError::Unsupported {
                    peft_type: PeftType::Ia3,
                    operation: "wrapping embedding or attention modules",
                })
            }
        };
        // weight is [out, in, ...] for both kinds
        let features = if is_feedforward {
            weight.dim(1)?
        } else {
            weight.dim(0)?
        };
        let ia3_l = if config.init_ia3_weights {
            Tensor::ones(features, DType::F32, weight.device())?
        } else {
            Tensor::randn(0f32, 1.0, features, weight.device())?
        };
        Ok(Self {
            ia3_l: ia3_l.to_dtype(weight.dtype())?,
            is_feedforward,
            is_conv,
            config: config.clone(),
        })
    }

    /// Whether the scaling applies to the layer input.
    #[must_use]
    pub fn is_feedforward(&self) -> bool {
        self.is_feedforward
    }

    /// The learned scaling vector.
    #[must_use]
    pub fn vector(&self) -> &Tensor {
        &self.ia3_l
    }

    /// Multiply `x` by `scale` along the feature dimension.
    pub(crate) fn apply_scale(x: &Tensor, scale: &Tensor, is_conv: bool) -> Result<Tensor> {
        let scale = scale.to_dtype(x.dtype())?;
        let scale = if is_conv {
            scale.reshape((1, scale.elem_count(), 1, 1))?
        } else {
            scale
        };
        Ok(x.broadcast_mul(&scale)?)
    }

    /// Whether this vector scales convolution channels.
    #[must_use]
    pub fn is_conv(&self) -> bool {
        self.is_conv
    }

    /// Weight-shaped view of the vector for merging.
    fn weight_scale(&self, weight: &Tensor) -> Result<Tensor> {
        let mut shape = vec![1; weight.rank()];
        let axis = usize::from(self.is_feedforward);
        shape[axis] = self.ia3_l.elem_count();
        Ok(self.ia3_l.to_dtype(weight.dtype())?.reshape(shape)?)
    }

    /// Scale the base bias on merge; only output scaling touches the bias.
    ///
    /// # Errors
    /// Returns error if the tensor operations fail.
    pub fn merge_bias(&self, bias: &Tensor) -> Result<Tensor> {
        if self.is_feedforward {
            return Ok(bias.clone());
        }
        Ok(bias.mul(&self.ia3_l.to_dtype(bias.dtype())?)?)
    }

    /// Undo [`Ia3Adapter::merge_bias`].
    ///
    /// # Errors
    /// Returns error if the tensor operations fail.
    pub fn unmerge_bias(&self, bias: &Tensor) -> Result<Tensor> {
        if self.is_feedforward {
            return Ok(bias.clone());
        }
        let denom = self.ia3_l.to_dtype(bias.dtype())?.affine(1.0, 1e-8)?;
        Ok(bias.div(&denom)?)
    }
}

impl Adapter for Ia3Adapter {
    type Config = Ia3Config;

    fn forward(
        &self,
        input: &Tensor,
        base_output: Option<&Tensor>,
        _ctx: &ForwardContext,
    ) -> Result<Tensor> {
        match (self.is_feedforward, base_output) {
            (true, _) => Self::apply_scale(input, &self.ia3_l, self.is_conv),
            (false, Some(base)) => Self::apply_scale(base, &self.ia3_l, self.is_conv),
            (false, None) => Err(PeftError::InvalidConfig(
                "IA3 output scaling needs the base output".into(),
            )),
        }
    }

    fn num_parameters(&self) -> usize {
        self.ia3_l.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for Ia3Adapter {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let scale = self.weight_scale(base_weight)?;
        Ok(base_weight.broadcast_mul(&scale)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let scale = self.weight_scale(merged_weight)?.affine(1.0, 1e-8)?;
        Ok(merged_weight.broadcast_div(&scale)?)
    }
}

impl SaveLoad for Ia3Adapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([("ia3_l".to_string(), self.ia3_l.clone())]))
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        self.ia3_l = take_tensor(&mut state_dict, "ia3_l", &self.ia3_l)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::Linear;

    fn base(bias: bool) -> Result<BaseLayer> {
        let device = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (6, 4), &device)?;
        let b = if bias {
            Some(Tensor::randn(0f32, 1.0, 6, &device)?)
        } else {
            None
        };
        Ok(BaseLayer::Linear(Linear::new(w, b)))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_ia3_config_default() {
        let config = Ia3Config::default();
        assert!(config.init_ia3_weights);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_feedforward_must_be_targeted() {
        let config = Ia3Config {
            tuner: TunerConfig {
                target_modules: Some(TargetModules::names(["k_proj"])),
                ..Default::default()
            },
            feedforward_modules: Some(TargetModules::names(["down_proj"])),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ones_init_is_identity() -> Result<()> {
        let base = base(false)?;
        let adapter = Ia3Adapter::new(&base, false, &Ia3Config::default())?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        let base_out = base.forward(&x, &ctx)?;
        let out = adapter.forward(&x, Some(&base_out), &ctx)?;
        assert!(max_abs_diff(&out, &base_out)? < 1e-7);
        assert_eq!(adapter.num_parameters(), 6);
        Ok(())
    }

    #[test]
    fn test_output_scaling_merge_scales_bias() -> Result<()> {
        let base = base(true)?;
        let config = Ia3Config {
            init_ia3_weights: false,
            ..Default::default()
        };
        let adapter = Ia3Adapter::new(&base, false, &config)?;
        let x = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();

        let expected = adapter.forward(&x, Some(&base.forward(&x, &ctx)?), &ctx)?;
        let BaseLayer::Linear(l) = &base else {
            unreachable!()
        };
        let merged = BaseLayer::Linear(Linear::new(
            adapter.merge(l.weight())?,
            Some(adapter.merge_bias(l.bias().unwrap())?),
        ));
        assert!(max_abs_diff(&expected, &merged.forward(&x, &ctx)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_feedforward_merge_matches_forward() -> Result<()> {
        let base = base(false)?;
        let config = Ia3Config {
            init_ia3_weights: false,
            ..Default::default()
        };
        let adapter = Ia3Adapter::new(&base, true, &config)?;
        assert_eq!(adapter.vector().dims(), &[4]);
        let x = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();

        let scaled = adapter.forward(&x, None, &ctx)?;
        let expected = base.forward(&scaled, &ctx)?;
        let merged = base.with_weight(adapter.merge(base.weight().unwrap())?)?;
        assert!(max_abs_diff(&expected, &merged.forward(&x, &ctx)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_embedding_rejected() -> Result<()> {
        let w = Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?;
        let base = BaseLayer::Embedding(candle_nn::Embedding::new(w, 2));
        assert!(Ia3Adapter::new(&base, false, &Ia3Config::default()).is_err());
        Ok(())
    }
}
