//! LoRA (Low-Rank Adaptation) implementation.
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices: `ΔW = BA` where `B ∈ R^{d×r}` and `A ∈ R^{r×k}`.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2dConfig, Dropout, Embedding, Linear};
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, PeftType, TunerConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::{BaseLayer, ForwardContext};
use crate::traits::{Adapter, AdapterConfig, Mergeable};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Module selection.
    #[serde(flatten)]
    pub tuner: TunerConfig,

    /// Rank of the low-rank decomposition.
    #[serde(default = "default_rank")]
    pub r: usize,

    /// Scaling numerator (scaling is `alpha / r`).
    #[serde(default = "default_alpha")]
    pub lora_alpha: f64,

    /// Dropout probability applied to the adapter input.
    #[serde(default)]
    pub lora_dropout: f64,

    /// Use `alpha / sqrt(r)` as scaling.
    #[serde(default)]
    pub use_rslora: bool,

    /// How A and B are initialized.
    #[serde(default)]
    pub init_lora_weights: LoraInitialization,

    /// Per-module rank overrides, keyed by a name suffix regex.
    #[serde(default)]
    pub rank_pattern: BTreeMap<String, usize>,

    /// Per-module alpha overrides, keyed by a name suffix regex.
    #[serde(default)]
    pub alpha_pattern: BTreeMap<String, f64>,
}

fn default_rank() -> usize {
    8
}

fn default_alpha() -> f64 {
    8.0
}

/// Initialization strategy for LoRA weights.
///
/// Serialized as `true`, `false` or `"gaussian"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InitRepr", into = "InitRepr")]
pub enum LoraInitialization {
    /// A ~ U(-1/√in, 1/√in), B = 0; the adapter starts as a no-op.
    #[default]
    Standard,
    /// A ~ N(0, 1/r), B = 0.
    Gaussian,
    /// Both factors random; the adapter changes outputs right away.
    Random,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum InitRepr {
    Flag(bool),
    Named(String),
}

impl TryFrom<InitRepr> for LoraInitialization {
    type Error = String;

    fn try_from(repr: InitRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            InitRepr::Flag(true) => Ok(Self::Standard),
            InitRepr::Flag(false) => Ok(Self::Random),
            InitRepr::Named(name) if name == "gaussian" => Ok(Self::Gaussian),
            InitRepr::Named(name) => Err(format!("unknown init_lora_weights value '{name}'")),
        }
    }
}

impl From<LoraInitialization> for InitRepr {
    fn from(init: LoraInitialization) -> Self {
        match init {
            LoraInitialization::Standard => Self::Flag(true),
            LoraInitialization::Random => Self::Flag(false),
            LoraInitialization::Gaussian => Self::Named("gaussian".into()),
        }
    }
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            meta: PeftMeta::default(),
            tuner: TunerConfig::default(),
            r: default_rank(),
            lora_alpha: default_alpha(),
            lora_dropout: 0.0,
            use_rslora: false,
            init_lora_weights: LoraInitialization::Standard,
            rank_pattern: BTreeMap::new(),
            alpha_pattern: BTreeMap::new(),
        }
    }
}

impl LoraConfig {
    /// Rank for a module, honoring `rank_pattern`.
    #[must_use]
    pub fn rank_for(&self, module_name: &str) -> usize {
        lookup_pattern(&self.rank_pattern, module_name).unwrap_or(self.r)
    }

    /// Alpha for a module, honoring `alpha_pattern`.
    #[must_use]
    pub fn alpha_for(&self, module_name: &str) -> f64 {
        lookup_pattern(&self.alpha_pattern, module_name).unwrap_or(self.lora_alpha)
    }

    /// Scaling applied to `B A` for a given rank and alpha.
    #[must_use]
    pub fn scaling(&self, r: usize, alpha: f64) -> f64 {
        if self.use_rslora {
            alpha / (r as f64).sqrt()
        } else {
            alpha / r as f64
        }
    }
}

fn lookup_pattern<T: Copy>(patterns: &BTreeMap<String, T>, name: &str) -> Option<T> {
    patterns.iter().find_map(|(key, value)| {
        let re = regex::Regex::new(&format!(r"^(?:.*\.)?(?:{key})$")).ok()?;
        re.is_match(name).then_some(*value)
    })
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PeftError::InvalidConfig("rank must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(PeftError::InvalidConfig(
                "dropout must be in [0, 1)".into(),
            ));
        }
        if let Some((key, _)) = self.rank_pattern.iter().find(|(_, r)| **r == 0) {
            return Err(PeftError::InvalidConfig(format!(
                "rank_pattern entry '{key}' must be > 0"
            )));
        }
        for key in self.rank_pattern.keys().chain(self.alpha_pattern.keys()) {
            regex::Regex::new(key).map_err(|e| {
                PeftError::InvalidConfig(format!("invalid pattern '{key}': {e}"))
            })?;
        }
        self.tuner.validate()
    }
}

/// Shape-specific factor pair.
#[derive(Debug, Clone)]
enum LoraFactors {
    /// A `[r, in]`, B `[out, r]`.
    Linear { a: Tensor, b: Tensor },
    /// A `[r, vocab]`, B `[dim, r]`.
    Embedding { a: Tensor, b: Tensor },
    /// A `[r, in, kh, kw]` with the base geometry, B `[out, r, 1, 1]`.
    Conv2d {
        a: Tensor,
        b: Tensor,
        conv: Conv2dConfig,
    },
}

/// One LoRA adapter attached to one wrapped layer.
///
/// Computes: `output = base_output + B(A(dropout(x))) * scaling`
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    factors: LoraFactors,
    /// Rank of this layer's factors
    r: usize,
    /// Scaling factor = alpha / r (or alpha / √r)
    scaling: f64,
    dropout: Dropout,
    config: LoraConfig,
}

fn uniform(bound: f64, shape: (usize, usize), device: &Device) -> Result<Tensor> {
    Ok(Tensor::rand(-bound as f32, bound as f32, shape, device)?)
}

impl LoraAdapter {
    /// Create the factors for one wrapped layer.
    ///
    /// # Arguments
    /// * `base` - The layer being adapted
    /// * `module_name` - Qualified name, used for rank/alpha patterns
    /// * `config` - LoRA configuration
    ///
    /// # Errors
    /// Returns error if configuration is invalid, the layer kind cannot carry
    /// LoRA, or weight initialization fails.
    pub fn new(base: &BaseLayer, module_name: &str, config: &LoraConfig) -> Result<Self> {
        config.validate()?;
        let r = config.rank_for(module_name);
        let alpha = config.alpha_for(module_name);
        let weight = base.weight().ok_or(PeftError::Unsupported {
            peft_type: PeftType::Lora,
            operation: "wrapping attention modules",
        })?;
        let device = weight.device();
        let dtype = weight.dtype();
        let init = config.init_lora_weights;

        let factors = match base {
            BaseLayer::Linear(_) => {
                let (out_features, in_features) = weight.dims2()?;
                let a = match init {
                    LoraInitialization::Gaussian => {
                        Tensor::randn(0f32, 1.0 / r as f32, (r, in_features), device)?
                    }
                    _ => uniform(1.0 / (in_features as f64).sqrt(), (r, in_features), device)?,
                };
                let b = match init {
                    LoraInitialization::Random => {
                        uniform(1.0 / (r as f64).sqrt(), (out_features, r), device)?
                    }
                    _ => Tensor::zeros((out_features, r), DType::F32, device)?,
                };
                LoraFactors::Linear {
                    a: a.to_dtype(dtype)?,
                    b: b.to_dtype(dtype)?,
                }
            }
            BaseLayer::Embedding(_) => {
                let (vocab, dim) = weight.dims2()?;
                let a = match init {
                    LoraInitialization::Random => Tensor::randn(0f32, 1.0, (r, vocab), device)?,
                    _ => Tensor::zeros((r, vocab), DType::F32, device)?,
                };
                let b = Tensor::randn(0f32, 1.0, (dim, r), device)?;
                LoraFactors::Embedding {
                    a: a.to_dtype(dtype)?,
                    b: b.to_dtype(dtype)?,
                }
            }
            BaseLayer::Conv2d(conv) => {
                let (out_channels, in_channels, kh, kw) = weight.dims4()?;
                let fan_in = in_channels * kh * kw;
                let a = match init {
                    LoraInitialization::Gaussian => {
                        Tensor::randn(0f32, 1.0 / r as f32, (r, fan_in), device)?
                    }
                    _ => uniform(1.0 / (fan_in as f64).sqrt(), (r, fan_in), device)?,
                };
                let b = match init {
                    LoraInitialization::Random => {
                        uniform(1.0 / (r as f64).sqrt(), (out_channels, r), device)?
                    }
                    _ => Tensor::zeros((out_channels, r), DType::F32, device)?,
                };
                LoraFactors::Conv2d {
                    a: a.reshape((r, in_channels, kh, kw))?.to_dtype(dtype)?,
                    b: b.reshape((out_channels, r, 1, 1))?.to_dtype(dtype)?,
                    conv: *conv.config(),
                }
            }
            BaseLayer::Attention(_) => {
                return Err(PeftError::Unsupported {
                    peft_type: PeftType::Lora,
                    operation: "wrapping attention modules",
                })
            }
        };

        Ok(Self {
            factors,
            r,
            scaling: config.scaling(r, alpha),
            dropout: Dropout::new(config.lora_dropout as f32),
            config: config.clone(),
        })
    }

    /// Build an adapter from explicit factors, laid out as for `base`.
    ///
    /// For linear and embedding layers `a` is `[r, in]` and `b` is
    /// `[out, r]`; for convolutions they are the 4D kernels.
    ///
    /// # Errors
    /// Returns error if the factor shapes do not fit the layer.
    pub fn from_factors(
        base: &BaseLayer,
        config: &LoraConfig,
        a: Tensor,
        b: Tensor,
        scaling: f64,
    ) -> Result<Self> {
        let r = a.dim(0)?;
        if b.dim(1)? != r {
            return Err(PeftError::ShapeMismatch {
                expected: vec![b.dim(0)?, r],
                actual: b.dims().to_vec(),
            });
        }
        let factors = match base {
            BaseLayer::Linear(_) => LoraFactors::Linear { a, b },
            BaseLayer::Embedding(_) => LoraFactors::Embedding { a, b },
            BaseLayer::Conv2d(conv) => LoraFactors::Conv2d {
                a,
                b,
                conv: *conv.config(),
            },
            BaseLayer::Attention(_) => {
                return Err(PeftError::Unsupported {
                    peft_type: PeftType::Lora,
                    operation: "wrapping attention modules",
                })
            }
        };
        let adapter = Self {
            factors,
            r,
            scaling,
            dropout: Dropout::new(config.lora_dropout as f32),
            config: config.clone(),
        };
        if let Some(weight) = base.weight() {
            let delta = adapter.delta_weight()?;
            if delta.dims() != weight.dims() {
                return Err(PeftError::ShapeMismatch {
                    expected: weight.dims().to_vec(),
                    actual: delta.dims().to_vec(),
                });
            }
        }
        Ok(adapter)
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.r
    }

    /// Down projection factor.
    #[must_use]
    pub fn lora_a(&self) -> &Tensor {
        match &self.factors {
            LoraFactors::Linear { a, .. }
            | LoraFactors::Embedding { a, .. }
            | LoraFactors::Conv2d { a, .. } => a,
        }
    }

    /// Up projection factor.
    #[must_use]
    pub fn lora_b(&self) -> &Tensor {
        match &self.factors {
            LoraFactors::Linear { b, .. }
            | LoraFactors::Embedding { b, .. }
            | LoraFactors::Conv2d { b, .. } => b,
        }
    }

    /// `scaling · B A`, laid out like the base weight.
    ///
    /// # Errors
    /// Returns error if the tensor operations fail.
    pub fn delta_weight(&self) -> Result<Tensor> {
        let delta = match &self.factors {
            LoraFactors::Linear { a, b } => b.matmul(a)?,
            LoraFactors::Embedding { a, b } => b.matmul(a)?.t()?.contiguous()?,
            LoraFactors::Conv2d { a, b, .. } => {
                let (r, in_channels, kh, kw) = a.dims4()?;
                let out_channels = b.dim(0)?;
                b.reshape((out_channels, r))?
                    .matmul(&a.reshape((r, in_channels * kh * kw))?)?
                    .reshape((out_channels, in_channels, kh, kw))?
            }
        };
        Ok(delta.affine(self.scaling, 0.0)?)
    }

    fn state_keys(&self) -> (&'static str, &'static str) {
        match self.factors {
            LoraFactors::Embedding { .. } => ("lora_embedding_A", "lora_embedding_B"),
            _ => ("lora_A.weight", "lora_B.weight"),
        }
    }
}

impl Adapter for LoraAdapter {
    type Config = LoraConfig;

    fn forward(
        &self,
        input: &Tensor,
        base_output: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let lora_out = match &self.factors {
            LoraFactors::Linear { a, b } => {
                let x = self.dropout.forward(input, ctx.training)?;
                let h = Linear::new(a.clone(), None).forward(&x)?;
                Linear::new(b.clone(), None).forward(&h)?
            }
            LoraFactors::Embedding { a, b } => {
                // dropout does not apply to token ids
                let table = a.t()?.contiguous()?;
                let h = Embedding::new(table, self.r).forward(input)?;
                Linear::new(b.clone(), None).forward(&h)?
            }
            LoraFactors::Conv2d { a, b, conv } => {
                let x = self.dropout.forward(input, ctx.training)?;
                let h = x.conv2d(a, conv.padding, conv.stride, conv.dilation, 1)?;
                h.conv2d(b, 0, 1, 1, 1)?
            }
        };
        let lora_out = lora_out.affine(self.scaling, 0.0)?;

        match base_output {
            Some(base) => Ok(base.broadcast_add(&lora_out.to_dtype(base.dtype())?)?),
            None => Ok(lora_out),
        }
    }

    fn num_parameters(&self) -> usize {
        self.lora_a().elem_count() + self.lora_b().elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for LoraAdapter {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        let delta_w = self.delta_weight()?.to_dtype(base_weight.dtype())?;
        Ok(base_weight.broadcast_add(&delta_w)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        let delta_w = self.delta_weight()?.to_dtype(merged_weight.dtype())?;
        Ok(merged_weight.broadcast_sub(&delta_w)?)
    }
}

impl SaveLoad for LoraAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let (a_key, b_key) = self.state_keys();
        let mut state_dict = HashMap::new();
        state_dict.insert(a_key.to_string(), self.lora_a().clone());
        state_dict.insert(b_key.to_string(), self.lora_b().clone());
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        let (a_key, b_key) = self.state_keys();
        let new_a = take_tensor(&mut state_dict, a_key, self.lora_a())?;
        let new_b = take_tensor(&mut state_dict, b_key, self.lora_b())?;
        match &mut self.factors {
            LoraFactors::Linear { a, b }
            | LoraFactors::Embedding { a, b }
            | LoraFactors::Conv2d { a, b, .. } => {
                *a = new_a;
                *b = new_b;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::Conv2d;

    fn linear_base(i: usize, o: usize) -> Result<BaseLayer> {
        let w = Tensor::randn(0f32, 1.0, (o, i), &Device::Cpu)?;
        Ok(BaseLayer::Linear(Linear::new(w, None)))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.r, 8);
        assert!((config.lora_alpha - 8.0).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_invalid_rank() {
        let config = LoraConfig {
            r: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rslora_scaling() {
        let config = LoraConfig {
            r: 16,
            lora_alpha: 8.0,
            use_rslora: true,
            ..Default::default()
        };
        assert!((config.scaling(16, 8.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_rank_pattern_overrides() {
        let mut config = LoraConfig::default();
        config.rank_pattern.insert("down_proj".into(), 2);
        assert_eq!(config.rank_for("layers.0.mlp.down_proj"), 2);
        assert_eq!(config.rank_for("layers.0.mlp.up_proj"), 8);
    }

    #[test]
    fn test_init_serde_forms() {
        let init: LoraInitialization = serde_json::from_str("false").unwrap();
        assert_eq!(init, LoraInitialization::Random);
        let init: LoraInitialization = serde_json::from_str(r#""gaussian""#).unwrap();
        assert_eq!(init, LoraInitialization::Gaussian);
        assert!(serde_json::from_str::<LoraInitialization>(r#""olora""#).is_err());
    }

    #[test]
    fn test_standard_init_is_noop() -> Result<()> {
        let base = linear_base(16, 12)?;
        let adapter = LoraAdapter::new(&base, "proj", &LoraConfig::default())?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu)?;
        let delta = adapter.forward(&x, None, &ForwardContext::eval())?;
        assert_eq!(delta.dims(), &[2, 5, 12]);
        assert!(max_abs_diff(&delta, &delta.zeros_like()?)? < 1e-7);
        Ok(())
    }

    #[test]
    fn test_merge_matches_forward() -> Result<()> {
        let base = linear_base(16, 12)?;
        let config = LoraConfig {
            r: 4,
            init_lora_weights: LoraInitialization::Random,
            ..Default::default()
        };
        let adapter = LoraAdapter::new(&base, "proj", &config)?;
        let x = Tensor::randn(0f32, 1.0, (3, 16), &Device::Cpu)?;
        let ctx = ForwardContext::eval();

        let base_out = base.forward(&x, &ctx)?;
        let adapted = adapter.forward(&x, Some(&base_out), &ctx)?;
        let merged = base.with_weight(adapter.merge(base.weight().unwrap())?)?;
        let merged_out = merged.forward(&x, &ctx)?;

        assert!(max_abs_diff(&adapted, &merged_out)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_unmerge_restores_weight() -> Result<()> {
        let base = linear_base(8, 8)?;
        let config = LoraConfig {
            init_lora_weights: LoraInitialization::Random,
            ..Default::default()
        };
        let adapter = LoraAdapter::new(&base, "proj", &config)?;
        let w = base.weight().unwrap();
        let restored = adapter.unmerge(&adapter.merge(w)?)?;
        assert!(max_abs_diff(w, &restored)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_embedding_delta_layout() -> Result<()> {
        let w = Tensor::randn(0f32, 1.0, (10, 6), &Device::Cpu)?;
        let base = BaseLayer::Embedding(Embedding::new(w, 6));
        let config = LoraConfig {
            r: 2,
            init_lora_weights: LoraInitialization::Random,
            ..Default::default()
        };
        let adapter = LoraAdapter::new(&base, "embed_tokens", &config)?;
        assert_eq!(adapter.delta_weight()?.dims(), &[10, 6]);

        let ids = Tensor::new(&[[1u32, 4, 9]], &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        let base_out = base.forward(&ids, &ctx)?;
        let adapted = adapter.forward(&ids, Some(&base_out), &ctx)?;
        let merged = base.with_weight(adapter.merge(base.weight().unwrap())?)?;
        assert!(max_abs_diff(&adapted, &merged.forward(&ids, &ctx)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_conv_delta_matches_forward() -> Result<()> {
        let device = Device::Cpu;
        let w = Tensor::randn(0f32, 1.0, (4, 3, 3, 3), &device)?;
        let conv = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let base = BaseLayer::Conv2d(Conv2d::new(w, None, conv));
        let config = LoraConfig {
            r: 2,
            init_lora_weights: LoraInitialization::Random,
            ..Default::default()
        };
        let adapter = LoraAdapter::new(&base, "conv", &config)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 5, 5), &device)?;
        let ctx = ForwardContext::eval();

        let adapted = adapter.forward(&x, Some(&base.forward(&x, &ctx)?), &ctx)?;
        let merged = base.with_weight(adapter.merge(base.weight().unwrap())?)?;
        assert!(max_abs_diff(&adapted, &merged.forward(&x, &ctx)?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_lora_num_parameters() -> Result<()> {
        let base = linear_base(768, 768)?;
        let adapter = LoraAdapter::new(&base, "proj", &LoraConfig::default())?;
        // r * (in + out) = 8 * (768 + 768) = 12288
        assert_eq!(adapter.num_parameters(), 12288);
        Ok(())
    }

    #[test]
    fn test_state_dict_round_trip() -> Result<()> {
        let base = linear_base(8, 8)?;
        let config = LoraConfig {
            init_lora_weights: LoraInitialization::Random,
            ..Default::default()
        };
        let source = LoraAdapter::new(&base, "proj", &config)?;
        let mut target = LoraAdapter::new(&base, "proj", &LoraConfig::default())?;
        target.load_state_dict(source.state_dict()?)?;
        assert!(max_abs_diff(&source.delta_weight()?, &target.delta_weight()?)? < 1e-7);
        Ok(())
    }

    #[test]
    fn test_load_state_dict_rejects_wrong_shape() -> Result<()> {
        let base = linear_base(8, 8)?;
        let mut adapter = LoraAdapter::new(&base, "proj", &LoraConfig::default())?;
        let mut state = adapter.state_dict()?;
        state.insert(
            "lora_A.weight".into(),
            Tensor::zeros((3, 8), DType::F32, &Device::Cpu)?,
        );
        assert!(matches!(
            adapter.load_state_dict(state),
            Err(PeftError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
