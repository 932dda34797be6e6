//! Multi-head self-attention with adapter-wrappable projections.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::Linear;

use crate::error::{PeftError, Result};
use crate::layers::{join, ForwardContext, Module, NamedParameter};

/// Cached keys and values of one layer, each `[batch, heads, len, head_dim]`.
pub type KeyValue = (Tensor, Tensor);

const PROJECTIONS: [&str; 4] = ["q_proj", "k_proj", "v_proj", "o_proj"];

/// Non-causal multi-head self-attention.
///
/// The four projections are ordinary tree nodes so LoRA or IA³ can wrap them
/// individually, while adaption prompt wraps the attention module as a whole.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Module,
    k_proj: Module,
    v_proj: Module,
    o_proj: Module,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    /// Build attention from its four projections.
    ///
    /// # Errors
    ///
    /// Returns an error if the hidden size is not divisible by `num_heads`.
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        o_proj: Linear,
        num_heads: usize,
    ) -> Result<Self> {
        let (hidden, _) = q_proj.weight().dims2()?;
        if num_heads == 0 || hidden % num_heads != 0 {
            return Err(PeftError::InvalidConfig(format!(
                "hidden size {hidden} is not divisible by {num_heads} heads"
            )));
        }
        Ok(Self {
            q_proj: q_proj.into(),
            k_proj: k_proj.into(),
            v_proj: v_proj.into(),
            o_proj: o_proj.into(),
            num_heads,
            head_dim: hidden / num_heads,
        })
    }

    /// Number of heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Per-head width.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Storage type and device of the projection weights.
    pub(crate) fn dtype_device(&self) -> Result<(DType, Device)> {
        let mut params = Vec::new();
        self.named_parameters("", &mut params);
        let first = params.first().ok_or_else(|| {
            PeftError::InvalidConfig("attention module has no parameters".into())
        })?;
        Ok((first.tensor.dtype(), first.tensor.device().clone()))
    }

    pub(crate) fn child(&self, name: &str) -> Option<&Module> {
        match name {
            "q_proj" => Some(&self.q_proj),
            "k_proj" => Some(&self.k_proj),
            "v_proj" => Some(&self.v_proj),
            "o_proj" => Some(&self.o_proj),
            _ => None,
        }
    }

    pub(crate) fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        match name {
            "q_proj" => Some(&mut self.q_proj),
            "k_proj" => Some(&mut self.k_proj),
            "v_proj" => Some(&mut self.v_proj),
            "o_proj" => Some(&mut self.o_proj),
            _ => None,
        }
    }

    pub(crate) fn children(&self) -> Vec<(&str, &Module)> {
        PROJECTIONS
            .iter()
            .filter_map(|name| self.child(name).map(|m| (*name, m)))
            .collect()
    }

    pub(crate) fn named_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        for (name, child) in self.children() {
            child.collect_parameters(&join(prefix, name), out);
        }
    }

    /// `[b, t, hidden]` -> `[b, heads, t, head_dim]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        Ok(x.reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `[b, heads, t, head_dim]` -> `[b, t, hidden]`
    pub(crate) fn merge_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, _, t, _) = x.dims4()?;
        Ok(x.transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))?)
    }

    /// Queries of `x`, split into heads.
    pub(crate) fn queries(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.split_heads(&self.q_proj.forward(x, ctx)?)
    }

    /// Keys of `x`, split into heads.
    pub(crate) fn keys(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.split_heads(&self.k_proj.forward(x, ctx)?)
    }

    /// Values of `x`, split into heads.
    pub(crate) fn values(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.split_heads(&self.v_proj.forward(x, ctx)?)
    }

    /// Output projection of merged heads.
    pub(crate) fn output(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.o_proj.forward(x, ctx)
    }

    /// Scaled dot-product attention over `[b, heads, len, head_dim]` tensors.
    pub(crate) fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.0)?;
        if let Some(mask) = mask {
            let (b, kv_len) = mask.dims2()?;
            if kv_len != k.dim(2)? {
                return Err(PeftError::ShapeMismatch {
                    expected: vec![b, k.dim(2)?],
                    actual: mask.dims().to_vec(),
                });
            }
            // 1 keeps a position, 0 masks it out
            let bias = mask
                .to_dtype(scores.dtype())?
                .affine(1e9, -1e9)?
                .reshape((b, 1, 1, kv_len))?;
            scores = scores.broadcast_add(&bias)?;
        }
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        Ok(probs.matmul(v)?)
    }

    /// Self-attention over `x: [b, t, hidden]`.
    ///
    /// `past` holds cached keys and values that are prepended to this step's;
    /// `mask` is `[b, past_len + t]`.
    ///
    /// # Errors
    ///
    /// Returns an error if shapes do not line up.
    pub fn forward(
        &self,
        x: &Tensor,
        past: Option<&KeyValue>,
        mask: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let q = self.queries(x, ctx)?;
        let mut k = self.keys(x, ctx)?;
        let mut v = self.values(x, ctx)?;
        if let Some((past_k, past_v)) = past {
            k = Tensor::cat(&[&past_k.to_dtype(k.dtype())?, &k], 2)?;
            v = Tensor::cat(&[&past_v.to_dtype(v.dtype())?, &v], 2)?;
        }
        let attn = self.attend(&q, &k, &v, mask)?;
        self.output(&self.merge_heads(&attn)?, ctx)
    }
}

/// Softmax helper kept next to attention for the prompt gates.
pub(crate) fn softmax_f32(x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let probs = candle_nn::ops::softmax(&x.to_dtype(DType::F32)?, D::Minus1)?;
    Ok(probs.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attention(hidden: usize, heads: usize) -> Result<Attention> {
        let device = Device::Cpu;
        let proj = || -> Result<Linear> {
            Ok(Linear::new(
                Tensor::randn(0f32, 0.3, (hidden, hidden), &device)?,
                None,
            ))
        };
        Attention::new(proj()?, proj()?, proj()?, proj()?, heads)
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let attn = attention(8, 2)?;
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu)?;
        let y = attn.forward(&x, None, None, &ForwardContext::eval())?;
        assert_eq!(y.dims(), &[2, 5, 8]);
        assert_eq!(attn.head_dim(), 4);
        Ok(())
    }

    #[test]
    fn test_heads_must_divide_hidden() {
        assert!(attention(8, 3).is_err());
    }

    #[test]
    fn test_masked_past_is_ignored() -> Result<()> {
        let device = Device::Cpu;
        let attn = attention(8, 2)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
        let ctx = ForwardContext::eval();
        let past = (
            Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &device)?,
            Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &device)?,
        );
        let mask = Tensor::cat(
            &[
                &Tensor::zeros((1, 4), DType::F32, &device)?,
                &Tensor::ones((1, 3), DType::F32, &device)?,
            ],
            1,
        )?;

        let plain = attn.forward(&x, None, None, &ctx)?;
        let masked = attn.forward(&x, Some(&past), Some(&mask), &ctx)?;
        let diff = (plain - masked)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_mask_length_checked() -> Result<()> {
        let attn = attention(8, 2)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu)?;
        let mask = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        assert!(attn
            .forward(&x, None, Some(&mask), &ForwardContext::eval())
            .is_err());
        Ok(())
    }

    #[test]
    fn test_projection_children() -> Result<()> {
        let attn = attention(4, 1)?;
        let names: Vec<&str> = attn.children().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, PROJECTIONS);
        Ok(())
    }
}
