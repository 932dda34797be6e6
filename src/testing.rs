//! Small deterministic networks for exercising injection end to end.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Embedding, Linear};

use crate::error::{PeftError, Result};
use crate::layers::{Attention, Container, ForwardContext};
use crate::model::{BaseModel, ModelConfig, ModelInput, ModelOutput};

pub(crate) const VOCAB: usize = 16;
pub(crate) const HIDDEN: usize = 8;
pub(crate) const LAYERS: usize = 2;
pub(crate) const HEADS: usize = 2;

/// Fixed pseudo-random values so two fresh models share their weights.
fn param(shape: &[usize], seed: f64, scale: f64) -> Result<Tensor> {
    let n: usize = shape.iter().product();
    #[allow(clippy::cast_possible_truncation)]
    let t = Tensor::arange(0u32, n as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .affine(0.731, seed)?
        .sin()?
        .affine(scale, 0.0)?;
    Ok(t.reshape(shape)?)
}

fn linear(out_dim: usize, in_dim: usize, seed: f64, bias: bool) -> Result<Linear> {
    let b = if bias {
        Some(param(&[out_dim], seed + 0.5, 0.1)?)
    } else {
        None
    };
    Ok(Linear::new(param(&[out_dim, in_dim], seed, 0.4)?, b))
}

/// Embedding, two attention + MLP blocks and an output head, laid out like
/// a decoder checkpoint (`model.layers.N.self_attn.q_proj`, `lm_head`, ...).
#[derive(Debug, Clone)]
pub(crate) struct ToyTransformer {
    config: ModelConfig,
    modules: Container,
}

impl ToyTransformer {
    pub(crate) fn new() -> Result<Self> {
        let embed = Embedding::new(param(&[VOCAB, HIDDEN], 0.1, 1.0)?, HIDDEN);
        let mut layers = Container::new();
        for i in 0..LAYERS {
            #[allow(clippy::cast_precision_loss)]
            let s = 10.0 * (i + 1) as f64;
            let attention = Attention::new(
                linear(HIDDEN, HIDDEN, s + 1.0, false)?,
                linear(HIDDEN, HIDDEN, s + 2.0, false)?,
                linear(HIDDEN, HIDDEN, s + 3.0, false)?,
                linear(HIDDEN, HIDDEN, s + 4.0, false)?,
                HEADS,
            )?;
            let mlp = Container::new()
                .with("up_proj", linear(2 * HIDDEN, HIDDEN, s + 5.0, true)?)
                .with("down_proj", linear(HIDDEN, 2 * HIDDEN, s + 6.0, true)?);
            layers.push(
                i.to_string(),
                Container::new().with("self_attn", attention).with("mlp", mlp),
            );
        }
        let model = Container::new()
            .with("embed_tokens", embed)
            .with("layers", layers);
        let modules = Container::new()
            .with("model", model)
            .with("lm_head", linear(VOCAB, HIDDEN, 99.0, true)?);
        let config = ModelConfig {
            model_type: "llama".into(),
            name_or_path: Some("toy/transformer".into()),
            hidden_size: HIDDEN,
            num_attention_heads: HEADS,
            num_hidden_layers: LAYERS,
            vocab_size: VOCAB,
            ..Default::default()
        };
        Ok(Self { config, modules })
    }
}

impl BaseModel for ToyTransformer {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn modules(&self) -> &Container {
        &self.modules
    }

    fn modules_mut(&mut self) -> &mut Container {
        &mut self.modules
    }

    fn forward(&self, input: &ModelInput, ctx: &ForwardContext) -> Result<ModelOutput> {
        let mut h = match &input.inputs_embeds {
            Some(embeds) => embeds.clone(),
            None => {
                let ids = input.input_ids.as_ref().ok_or_else(|| {
                    PeftError::InvalidConfig("either input_ids or inputs_embeds must be provided".into())
                })?;
                self.embed(ids, ctx)?
            }
        };
        for i in 0..LAYERS {
            let prefix = format!("model.layers.{i}");
            let past = input.past_key_values.as_ref().and_then(|p| p.get(i));
            let attn = self
                .modules
                .module(&format!("{prefix}.self_attn"))?
                .forward_attention(&h, past, input.attention_mask.as_ref(), ctx)?;
            h = (h + attn)?;
            let up = self.modules.module(&format!("{prefix}.mlp.up_proj"))?.forward(&h, ctx)?;
            let down = self
                .modules
                .module(&format!("{prefix}.mlp.down_proj"))?
                .forward(&up.relu()?, ctx)?;
            h = (h + down)?;
        }
        let logits = self.modules.module("lm_head")?.forward(&h, ctx)?;
        Ok(ModelOutput { logits, loss: None })
    }
}

/// Conv layer, global average pool and a linear head over `[b, 3, h, w]`.
#[derive(Debug, Clone)]
pub(crate) struct ToyConvNet {
    config: ModelConfig,
    modules: Container,
}

impl ToyConvNet {
    pub(crate) fn new() -> Result<Self> {
        let conv = Conv2d::new(
            param(&[4, 3, 3, 3], 3.0, 0.3)?,
            Some(param(&[4], 4.0, 0.1)?),
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
        );
        let modules = Container::new()
            .with("conv", conv)
            .with("head", linear(3, 4, 5.0, true)?);
        let config = ModelConfig {
            model_type: "convnet".into(),
            hidden_size: 4,
            num_attention_heads: 1,
            num_hidden_layers: 1,
            vocab_size: 3,
            output_layer_name: "classifier".into(),
            ..Default::default()
        };
        Ok(Self { config, modules })
    }

    pub(crate) fn sample_input() -> Result<ModelInput> {
        Ok(ModelInput {
            inputs_embeds: Some(param(&[2, 3, 5, 5], 7.0, 1.0)?),
            ..Default::default()
        })
    }
}

impl BaseModel for ToyConvNet {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn modules(&self) -> &Container {
        &self.modules
    }

    fn modules_mut(&mut self) -> &mut Container {
        &mut self.modules
    }

    fn forward(&self, input: &ModelInput, ctx: &ForwardContext) -> Result<ModelOutput> {
        let x = input
            .inputs_embeds
            .as_ref()
            .ok_or_else(|| PeftError::InvalidConfig("ToyConvNet takes images as inputs_embeds".into()))?;
        let features = self.modules.module("conv")?.forward(x, ctx)?.relu()?;
        let pooled = features.mean(D::Minus1)?.mean(D::Minus1)?;
        let logits = self.modules.module("head")?.forward(&pooled, ctx)?;
        Ok(ModelOutput { logits, loss: None })
    }
}

/// Token ids `[2, 5]`.
pub(crate) fn sample_ids() -> Result<Tensor> {
    Ok(Tensor::new(
        &[[1u32, 4, 7, 3, 0], [15, 2, 9, 9, 11]],
        &Device::Cpu,
    )?)
}

pub(crate) fn sample_input() -> Result<ModelInput> {
    Ok(ModelInput::from_ids(sample_ids()?))
}

pub(crate) fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}
