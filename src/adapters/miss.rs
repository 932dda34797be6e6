//! MiSS (Matrix Shard Sharing) implementation.
//!
//! MiSS shares one small block across every shard of a linear weight. The
//! default layout splits the input features into groups of `r` and adds the
//! same `[r, out]` block to each group, so `ΔW[o, i] = block[i mod r, o]`.
//! The `bat` layout instead learns one `[r, r]` block per row of shards and
//! lets it interact with the frozen weight: `ΔW_blk = W_blk · B + B`.
//!
//! Reference: <https://arxiv.org/abs/2409.15371>

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::Dropout;
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, PeftType, TunerConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::layers::{BaseLayer, ForwardContext};
use crate::linalg;
use crate::traits::{Adapter, AdapterConfig, Mergeable};

/// Configuration for MiSS adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Module selection.
    #[serde(flatten)]
    pub tuner: TunerConfig,

    /// Shard size along the input features.
    #[serde(default = "default_rank")]
    pub r: usize,

    /// Output width of the shared block in `mini` mode.
    #[serde(default = "default_mini_r")]
    pub mini_r: usize,

    /// Dropout probability applied to the adapter input.
    #[serde(default)]
    pub miss_dropout: f64,

    /// Block layout and initialization.
    #[serde(default)]
    pub init_weights: MissInitialization,
}

fn default_rank() -> usize {
    64
}

fn default_mini_r() -> usize {
    1
}

impl Default for MissConfig {
    fn default() -> Self {
        Self {
            meta: PeftMeta::default(),
            tuner: TunerConfig::default(),
            r: default_rank(),
            mini_r: default_mini_r(),
            miss_dropout: 0.0,
            init_weights: MissInitialization::Balance,
        }
    }
}

impl AdapterConfig for MissConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(PeftError::InvalidConfig("rank must be > 0".into()));
        }
        if self.mini_r == 0 {
            return Err(PeftError::InvalidConfig("mini_r must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.miss_dropout) {
            return Err(PeftError::InvalidConfig(
                "dropout must be in [0, 1)".into(),
            ));
        }
        self.tuner.validate()
    }
}

/// Layout of the shared block.
///
/// Serialized as `true`, `false`, `"bat"` or `"mini"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "InitRepr", into = "InitRepr")]
pub enum MissInitialization {
    /// `[r, out]` block, zero-initialized.
    #[default]
    Balance,
    /// `[r, out]` block, uniform random; changes outputs right away.
    Random,
    /// One `[r, r]` block per output shard, mixed with the frozen weight.
    Bat,
    /// `[r, mini_r]` block tiled across the output features.
    Mini,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum InitRepr {
    Flag(bool),
    Named(String),
}

impl TryFrom<InitRepr> for MissInitialization {
    type Error = String;

    fn try_from(repr: InitRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            InitRepr::Flag(true) => Ok(Self::Balance),
            InitRepr::Flag(false) => Ok(Self::Random),
            InitRepr::Named(name) => match name.as_str() {
                "bat" => Ok(Self::Bat),
                "mini" => Ok(Self::Mini),
                _ => Err(format!("unknown init_weights value '{name}'")),
            },
        }
    }
}

impl From<MissInitialization> for InitRepr {
    fn from(init: MissInitialization) -> Self {
        match init {
            MissInitialization::Balance => Self::Flag(true),
            MissInitialization::Random => Self::Flag(false),
            MissInitialization::Bat => Self::Named("bat".into()),
            MissInitialization::Mini => Self::Named("mini".into()),
        }
    }
}

/// One MiSS block attached to one wrapped linear layer.
#[derive(Debug, Clone)]
pub struct MissAdapter {
    /// `[r, out]`, `[r, mini_r]` or `[out / r, r, r]` depending on the layout.
    miss_block: Tensor,
    /// Frozen weight the `bat` blocks interact with.
    base_weight: Option<Tensor>,
    in_features: usize,
    out_features: usize,
    r: usize,
    dropout: Dropout,
    config: MissConfig,
}

impl MissAdapter {
    /// Create the shared block for one wrapped layer.
    ///
    /// # Errors
    /// Returns error if the layer is not linear or its shape does not fit
    /// the requested layout.
    pub fn new(base: &BaseLayer, config: &MissConfig) -> Result<Self> {
        config.validate()?;
        let BaseLayer::Linear(linear) = base else {
            return Err(PeftError::Unsupported {
                peft_type: PeftType::Miss,
                operation: "wrapping non-linear modules",
            });
        };
        let weight = linear.weight();
        let (out_features, in_features) = weight.dims2()?;
        let r = config.r;
        let device = weight.device();

        let (miss_block, base_weight) = match config.init_weights {
            MissInitialization::Balance => {
                (Tensor::zeros((r, out_features), DType::F32, device)?, None)
            }
            MissInitialization::Random => {
                #[allow(clippy::cast_precision_loss)]
                let bound = (1.0 / (out_features as f64).sqrt()) as f32;
                (Tensor::rand(-bound, bound, (r, out_features), device)?, None)
            }
            MissInitialization::Mini => {
                if out_features % config.mini_r != 0 {
                    return Err(PeftError::InvalidConfig(format!(
                        "out_features {out_features} must be divisible by mini_r {}",
                        config.mini_r
                    )));
                }
                (Tensor::zeros((r, config.mini_r), DType::F32, device)?, None)
            }
            MissInitialization::Bat => {
                if in_features % r != 0 || out_features % r != 0 {
                    return Err(PeftError::InvalidConfig(
                        "the weight matrix must be fully divisible into [r, r] blocks".into(),
                    ));
                }
                let block = Tensor::zeros((out_features / r, r, r), DType::F32, device)?;
                (block, Some(weight.clone()))
            }
        };

        Ok(Self {
            miss_block: miss_block.to_dtype(weight.dtype())?,
            base_weight,
            in_features,
            out_features,
            r,
            dropout: Dropout::new(config.miss_dropout as f32),
            config: config.clone(),
        })
    }

    /// Block layout in use.
    #[must_use]
    pub fn layout(&self) -> MissInitialization {
        self.config.init_weights
    }

    /// The learned shared block.
    #[must_use]
    pub fn block(&self) -> &Tensor {
        &self.miss_block
    }

    /// Shared block widened to `[r, out]`.
    fn shared_block(&self) -> Result<Tensor> {
        match self.config.init_weights {
            MissInitialization::Mini => Ok(self
                .miss_block
                .repeat((1, self.out_features / self.config.mini_r))?),
            _ => Ok(self.miss_block.clone()),
        }
    }

    /// `W [out, in]` as `[in / r, out / r, r, r]` shards.
    fn shards(&self, weight: &Tensor) -> Result<Tensor> {
        let r = self.r;
        Ok(weight
            .reshape((self.out_features / r, r, self.in_features / r, r))?
            .permute((2, 0, 1, 3))?
            .contiguous()?)
    }

    /// Inverse of [`MissAdapter::shards`].
    fn unshard(&self, shards: &Tensor) -> Result<Tensor> {
        Ok(shards
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .reshape((self.out_features, self.in_features))?)
    }

    /// Weight-shaped update for `weight`.
    ///
    /// # Errors
    /// Returns error if the tensor operations fail.
    pub fn delta_weight(&self, weight: &Tensor) -> Result<Tensor> {
        let block = self.miss_block.to_dtype(weight.dtype())?;
        if self.config.init_weights == MissInitialization::Bat {
            let mixed = self.shards(weight)?.broadcast_matmul(&block)?.broadcast_add(&block)?;
            return self.unshard(&mixed);
        }
        let groups = self.in_features.div_ceil(self.r);
        Ok(self
            .shared_block()?
            .to_dtype(weight.dtype())?
            .t()?
            .repeat((1, groups))?
            .narrow(1, 0, self.in_features)?)
    }

    /// `x · ΔWᵀ` without materializing the update where possible.
    fn adapter_output(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let lead: Vec<usize> = dims[..dims.len() - 1].to_vec();
        let rows: usize = lead.iter().product();
        let x = x.reshape((rows, self.in_features))?;

        let out = match &self.base_weight {
            Some(weight) => {
                let delta = self.delta_weight(&weight.to_dtype(x.dtype())?)?;
                x.matmul(&delta.t()?)?
            }
            None => {
                // sum each group of r input features, then apply the shared block
                let pad = self.in_features.div_ceil(self.r) * self.r - self.in_features;
                let x = if pad > 0 {
                    let zeros = Tensor::zeros((rows, pad), x.dtype(), x.device())?;
                    Tensor::cat(&[&x, &zeros], 1)?
                } else {
                    x
                };
                let grouped = x
                    .reshape((rows, (self.in_features + pad) / self.r, self.r))?
                    .sum(1)?;
                grouped.matmul(&self.shared_block()?.to_dtype(grouped.dtype())?)?
            }
        };
        let mut shape = lead;
        shape.push(self.out_features);
        Ok(out.reshape(shape)?)
    }
}

impl Adapter for MissAdapter {
    type Config = MissConfig;

    fn forward(
        &self,
        input: &Tensor,
        base_output: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let x = self.dropout.forward(input, ctx.training)?;
        let update = self.adapter_output(&x)?;
        match base_output {
            Some(base) => Ok(base.broadcast_add(&update.to_dtype(base.dtype())?)?),
            None => Ok(update),
        }
    }

    fn num_parameters(&self) -> usize {
        self.miss_block.elem_count()
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for MissAdapter {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        Ok((base_weight + self.delta_weight(base_weight)?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        if self.config.init_weights != MissInitialization::Bat {
            return Ok((merged_weight - self.delta_weight(merged_weight)?)?);
        }
        // W' = W·(I + B) + B per shard
        let block = self.miss_block.to_dtype(merged_weight.dtype())?;
        let eye = linalg::eye(self.r, merged_weight.dtype(), merged_weight.device())?;
        let inverses = (0..block.dim(0)?)
            .map(|i| linalg::inverse(&block.get(i)?.broadcast_add(&eye)?))
            .collect::<Result<Vec<_>>>()?;
        let inverses = Tensor::stack(&inverses, 0)?;
        let shards = self
            .shards(merged_weight)?
            .broadcast_sub(&block)?
            .broadcast_matmul(&inverses)?;
        self.unshard(&shards)
    }
}

impl SaveLoad for MissAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "miss_block".to_string(),
            self.miss_block.clone(),
        )]))
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        self.miss_block = take_tensor(&mut state_dict, "miss_block", &self.miss_block)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::Linear;

    fn base(out: usize, inp: usize) -> Result<BaseLayer> {
        let w = Tensor::randn(0f32, 1.0, (out, inp), &Device::Cpu)?;
        Ok(BaseLayer::Linear(Linear::new(w, None)))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    fn randomize(adapter: &mut MissAdapter, std: f32) -> Result<()> {
        let block = Tensor::randn(0f32, std, adapter.block().dims(), &Device::Cpu)?;
        adapter.load_state_dict(HashMap::from([("miss_block".to_string(), block)]))
    }

    fn config(r: usize, init_weights: MissInitialization) -> MissConfig {
        MissConfig {
            r,
            init_weights,
            ..Default::default()
        }
    }

    #[test]
    fn test_miss_config_default() {
        let config = MissConfig::default();
        assert_eq!(config.r, 64);
        assert_eq!(config.mini_r, 1);
        assert_eq!(config.init_weights, MissInitialization::Balance);
        assert!(config.validate().is_ok());
        assert!(MissConfig { r: 0, ..Default::default() }.validate().is_err());
        assert!(MissConfig { miss_dropout: 1.0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_init_weights_serde() -> anyhow::Result<()> {
        let bat: MissConfig = serde_json::from_str(r#"{"r": 4, "init_weights": "bat"}"#)?;
        assert_eq!(bat.init_weights, MissInitialization::Bat);
        let random: MissConfig = serde_json::from_str(r#"{"init_weights": false}"#)?;
        assert_eq!(random.init_weights, MissInitialization::Random);
        let json = serde_json::to_value(config(2, MissInitialization::Mini))?;
        assert_eq!(json["init_weights"], "mini");
        assert!(serde_json::from_str::<MissConfig>(r#"{"init_weights": "svd"}"#).is_err());
        Ok(())
    }

    #[test]
    fn test_zero_init_is_identity() -> Result<()> {
        let base = base(6, 4)?;
        let adapter = MissAdapter::new(&base, &config(2, MissInitialization::Balance))?;
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        let base_out = base.forward(&x, &ctx)?;
        let out = adapter.forward(&x, Some(&base_out), &ctx)?;
        assert!(max_abs_diff(&out, &base_out)? < 1e-7);
        assert_eq!(adapter.num_parameters(), 2 * 6);
        assert_eq!(out.dims(), &[2, 3, 6]);
        Ok(())
    }

    #[test]
    fn test_balance_merge_matches_forward_with_padding() -> Result<()> {
        // 4 input features do not split into groups of 3
        let base = base(6, 4)?;
        let adapter = MissAdapter::new(&base, &config(3, MissInitialization::Random))?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();

        let expected = adapter.forward(&x, Some(&base.forward(&x, &ctx)?), &ctx)?;
        let weight = base.weight().unwrap();
        let merged = base.with_weight(adapter.merge(weight)?)?;
        assert!(max_abs_diff(&expected, &merged.forward(&x, &ctx)?)? < 1e-4);

        let restored = adapter.unmerge(&adapter.merge(weight)?)?;
        assert!(max_abs_diff(&restored, weight)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_mini_tiles_block() -> Result<()> {
        let base = base(6, 4)?;
        let mini = MissConfig {
            mini_r: 3,
            ..config(2, MissInitialization::Mini)
        };
        let mut adapter = MissAdapter::new(&base, &mini)?;
        assert_eq!(adapter.block().dims(), &[2, 3]);
        randomize(&mut adapter, 1.0)?;

        let delta = adapter.delta_weight(base.weight().unwrap())?.to_vec2::<f32>()?;
        let block = adapter.block().to_vec2::<f32>()?;
        for (o, row) in delta.iter().enumerate() {
            for (i, v) in row.iter().enumerate() {
                assert!((v - block[i % 2][o % 3]).abs() < 1e-6);
            }
        }

        let uneven = MissConfig {
            mini_r: 4,
            ..config(2, MissInitialization::Mini)
        };
        assert!(MissAdapter::new(&base, &uneven).is_err());
        Ok(())
    }

    #[test]
    fn test_bat_merge_round_trip() -> Result<()> {
        let base = base(6, 4)?;
        let mut adapter = MissAdapter::new(&base, &config(2, MissInitialization::Bat))?;
        assert_eq!(adapter.block().dims(), &[3, 2, 2]);
        randomize(&mut adapter, 0.1)?;

        let x = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        let expected = adapter.forward(&x, Some(&base.forward(&x, &ctx)?), &ctx)?;

        let weight = base.weight().unwrap();
        let merged_weight = adapter.merge(weight)?;
        let merged = base.with_weight(merged_weight.clone())?;
        assert!(max_abs_diff(&expected, &merged.forward(&x, &ctx)?)? < 1e-4);
        assert!(max_abs_diff(&adapter.unmerge(&merged_weight)?, weight)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_bat_needs_whole_blocks() -> Result<()> {
        let base = base(6, 4)?;
        assert!(MissAdapter::new(&base, &config(3, MissInitialization::Bat)).is_err());
        Ok(())
    }

    #[test]
    fn test_embedding_rejected() -> Result<()> {
        let w = Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?;
        let base = BaseLayer::Embedding(candle_nn::Embedding::new(w, 2));
        assert!(MissAdapter::new(&base, &MissConfig::default()).is_err());
        Ok(())
    }
}
