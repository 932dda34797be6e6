//! Adapter-carrying wrapper around one base layer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::{DType, Module as _, Tensor};
use candle_nn::Embedding;
use tracing::{debug, warn};

use crate::adapters::adaption_prompt::AdaptionPromptAdapter;
use crate::adapters::ia3::Ia3Adapter;
use crate::adapters::lora::LoraAdapter;
use crate::adapters::miss::MissAdapter;
use crate::adapters::trainable_tokens::TrainableTokensAdapter;
use crate::config::PeftType;
use crate::error::{PeftError, Result};
use crate::io::SaveLoad;
use crate::layers::{join, BaseLayer, ForwardContext, KeyValue, NamedParameter, ParamRole};
use crate::traits::{Adapter, Mergeable, Trainable};

/// Routing name that sends a batch row through the base layer only.
pub const BASE_ADAPTER_NAME: &str = "__base__";

/// Per-layer parameters of one named adapter.
#[derive(Debug, Clone)]
pub enum LayerAdapter {
    /// Low-rank update.
    Lora(LoraAdapter),
    /// Rescaling vector.
    Ia3(Ia3Adapter),
    /// Shared shard block.
    Miss(MissAdapter),
    /// Sparse embedding rows.
    TrainableTokens(TrainableTokensAdapter),
    /// Gated attention prompt.
    AdaptionPrompt(AdaptionPromptAdapter),
}

impl LayerAdapter {
    /// Family of this adapter.
    #[must_use]
    pub fn peft_type(&self) -> PeftType {
        match self {
            Self::Lora(_) => PeftType::Lora,
            Self::Ia3(_) => PeftType::Ia3,
            Self::Miss(_) => PeftType::Miss,
            Self::TrainableTokens(_) => PeftType::TrainableTokens,
            Self::AdaptionPrompt(_) => PeftType::AdaptionPrompt,
        }
    }

    /// Number of parameters this adapter adds to the layer.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        match self {
            Self::Lora(a) => a.num_parameters(),
            Self::Ia3(a) => a.num_parameters(),
            Self::Miss(a) => a.num_parameters(),
            Self::TrainableTokens(a) => a.num_parameters(),
            Self::AdaptionPrompt(a) => a.num_parameters(),
        }
    }

    /// LoRA factors, if this is a LoRA adapter.
    #[must_use]
    pub fn as_lora(&self) -> Option<&LoraAdapter> {
        match self {
            Self::Lora(a) => Some(a),
            _ => None,
        }
    }

    fn merge_into(&self, weight: &Tensor, bias: Option<Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            Self::Lora(a) => Ok((a.merge(weight)?, bias)),
            Self::TrainableTokens(a) => Ok((a.merge(weight)?, bias)),
            Self::Miss(a) => Ok((a.merge(weight)?, bias)),
            Self::Ia3(a) => {
                let bias = bias.map(|b| a.merge_bias(&b)).transpose()?;
                Ok((a.merge(weight)?, bias))
            }
            Self::AdaptionPrompt(_) => Err(PeftError::Unsupported {
                peft_type: PeftType::AdaptionPrompt,
                operation: "merging",
            }),
        }
    }

    fn unmerge_from(&self, weight: &Tensor, bias: Option<Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            Self::Lora(a) => Ok((a.unmerge(weight)?, bias)),
            Self::TrainableTokens(a) => Ok((a.unmerge(weight)?, bias)),
            Self::Miss(a) => Ok((a.unmerge(weight)?, bias)),
            Self::Ia3(a) => {
                let bias = bias.map(|b| a.unmerge_bias(&b)).transpose()?;
                Ok((a.unmerge(weight)?, bias))
            }
            Self::AdaptionPrompt(_) => Err(PeftError::Unsupported {
                peft_type: PeftType::AdaptionPrompt,
                operation: "unmerging",
            }),
        }
    }
}

impl SaveLoad for LayerAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        match self {
            Self::Lora(a) => a.state_dict(),
            Self::Ia3(a) => a.state_dict(),
            Self::Miss(a) => a.state_dict(),
            Self::TrainableTokens(a) => a.state_dict(),
            Self::AdaptionPrompt(a) => a.state_dict(),
        }
    }

    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()> {
        match self {
            Self::Lora(a) => a.load_state_dict(state_dict),
            Self::Ia3(a) => a.load_state_dict(state_dict),
            Self::Miss(a) => a.load_state_dict(state_dict),
            Self::TrainableTokens(a) => a.load_state_dict(state_dict),
            Self::AdaptionPrompt(a) => a.load_state_dict(state_dict),
        }
    }
}

/// A merged base layer waiting to be committed.
#[derive(Debug)]
pub struct StagedMerge {
    base: BaseLayer,
    names: Vec<String>,
}

/// Wrapper that replaces one base module and carries named adapters.
///
/// The wrapped weight is only ever changed by merge and unmerge; the forward
/// pass adds adapter contributions on the fly.
#[derive(Debug, Clone)]
pub struct TunerLayer {
    base: BaseLayer,
    adapters: BTreeMap<String, LayerAdapter>,
    active_adapters: Vec<String>,
    /// Adapters switched off individually.
    disabled: BTreeSet<String>,
    /// All adapters switched off.
    disable_adapters: bool,
    merged_adapters: Vec<String>,
    trainable: BTreeSet<String>,
}

impl TunerLayer {
    /// Wrap a base layer without any adapters.
    #[must_use]
    pub fn new(base: BaseLayer) -> Self {
        Self {
            base,
            adapters: BTreeMap::new(),
            active_adapters: Vec::new(),
            disabled: BTreeSet::new(),
            disable_adapters: false,
            merged_adapters: Vec::new(),
            trainable: BTreeSet::new(),
        }
    }

    /// The wrapped layer.
    #[must_use]
    pub fn base_layer(&self) -> &BaseLayer {
        &self.base
    }

    /// Mutable wrapped layer.
    pub fn base_layer_mut(&mut self) -> &mut BaseLayer {
        &mut self.base
    }

    /// Drop every adapter and return the wrapped layer as is.
    #[must_use]
    pub fn into_base_layer(self) -> BaseLayer {
        self.base
    }

    /// Family of the adapters on this layer.
    #[must_use]
    pub fn peft_type(&self) -> Option<PeftType> {
        self.adapters.values().next().map(LayerAdapter::peft_type)
    }

    /// Names of the adapters on this layer.
    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Whether the layer holds `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Adapter parameters for `name`.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&LayerAdapter> {
        self.adapters.get(name)
    }

    /// Mutable adapter parameters for `name`.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut LayerAdapter> {
        self.adapters.get_mut(name)
    }

    /// Adapters used by the forward pass.
    #[must_use]
    pub fn active_adapters(&self) -> &[String] {
        &self.active_adapters
    }

    /// Adapters folded into the base weight, in merge order.
    #[must_use]
    pub fn merged_adapters(&self) -> &[String] {
        &self.merged_adapters
    }

    /// Whether any adapter is merged.
    #[must_use]
    pub fn merged(&self) -> bool {
        !self.merged_adapters.is_empty()
    }

    /// Whether all adapters are switched off.
    #[must_use]
    pub fn adapters_disabled(&self) -> bool {
        self.disable_adapters
    }

    /// Whether `name` is switched off individually.
    #[must_use]
    pub fn is_adapter_disabled(&self, name: &str) -> bool {
        self.disabled.contains(name)
    }

    /// Attach an adapter. Existing names are kept as they are.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::IncompatibleAdapterType`] if the layer already
    /// carries another family.
    pub fn update_layer(&mut self, name: &str, adapter: LayerAdapter) -> Result<()> {
        if let Some(existing) = self.peft_type() {
            if existing != adapter.peft_type() {
                return Err(PeftError::IncompatibleAdapterType {
                    existing,
                    requested: adapter.peft_type(),
                });
            }
        }
        if self.adapters.contains_key(name) {
            warn!(adapter = name, "adapter already present on layer, keeping existing weights");
            return Ok(());
        }
        self.adapters.insert(name.to_string(), adapter);
        self.trainable.insert(name.to_string());
        Ok(())
    }

    /// Select the adapters used by the forward pass.
    ///
    /// Active adapters become trainable, the rest are frozen.
    pub fn set_adapter(&mut self, names: &[String]) {
        self.trainable = self
            .adapters
            .keys()
            .filter(|k| names.contains(k))
            .cloned()
            .collect();
        self.active_adapters = names.to_vec();
    }

    /// Select the adapters used by the forward pass without touching trainability.
    pub fn set_active(&mut self, names: &[String]) {
        self.active_adapters = names.to_vec();
    }

    /// Switch every adapter on or off.
    pub fn enable_adapters(&mut self, enabled: bool) {
        self.disable_adapters = !enabled;
    }

    /// Switch one adapter on or off.
    pub fn set_adapter_enabled(&mut self, name: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(name);
        } else if self.adapters.contains_key(name) {
            self.disabled.insert(name.to_string());
        }
    }

    /// Remove every trace of `name`. The caller unmerges it first.
    ///
    /// Returns whether the adapter was present.
    pub fn delete_adapter(&mut self, name: &str) -> bool {
        let removed = self.adapters.remove(name).is_some();
        self.active_adapters.retain(|n| n != name);
        self.disabled.remove(name);
        self.trainable.remove(name);
        self.merged_adapters.retain(|n| n != name);
        removed
    }

    /// Names to merge: the requested ones (default: active), minus merged ones.
    fn adapters_to_merge(&self, adapter_names: Option<&[String]>) -> Vec<String> {
        let requested = adapter_names.map_or_else(|| self.active_adapters.clone(), <[String]>::to_vec);
        let mut names = Vec::new();
        for name in requested {
            if !self.adapters.contains_key(&name) {
                continue;
            }
            if self.merged_adapters.contains(&name) {
                warn!(
                    adapter = %name,
                    merged = ?self.merged_adapters,
                    "adapter is already merged, skipping"
                );
                continue;
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Fold adapters into a copy of the base weight without committing.
    ///
    /// Returns `None` when there is nothing to merge.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::MergeNotFinite`] naming the first adapter whose
    /// merge produced a non-finite value when `safe_merge` is set, and
    /// [`PeftError::Unsupported`] for families without merge semantics.
    pub fn prepare_merge(
        &self,
        adapter_names: Option<&[String]>,
        safe_merge: bool,
    ) -> Result<Option<StagedMerge>> {
        let names = self.adapters_to_merge(adapter_names);
        if names.is_empty() {
            return Ok(None);
        }
        let mut weight = self
            .base
            .weight()
            .ok_or(PeftError::Unsupported {
                peft_type: self.peft_type().unwrap_or(PeftType::AdaptionPrompt),
                operation: "merging",
            })?
            .clone();
        let mut bias = self.base.bias().cloned();
        for name in &names {
            let adapter = &self.adapters[name];
            let (w, b) = adapter.merge_into(&weight, bias)?;
            if safe_merge && !all_finite(&w)? {
                return Err(PeftError::MergeNotFinite {
                    adapter: name.clone(),
                });
            }
            weight = w;
            bias = b;
        }
        Ok(Some(StagedMerge {
            base: self.base.with_parameters(weight, bias)?,
            names,
        }))
    }

    /// Commit a staged merge.
    pub fn apply_merge(&mut self, staged: StagedMerge) {
        debug!(adapters = ?staged.names, "merged adapters into base layer");
        self.base = staged.base;
        self.merged_adapters.extend(staged.names);
    }

    /// Merge adapters into the base weight.
    ///
    /// # Errors
    ///
    /// See [`TunerLayer::prepare_merge`]. The base weight is unchanged on error.
    pub fn merge(&mut self, adapter_names: Option<&[String]>, safe_merge: bool) -> Result<()> {
        if let Some(staged) = self.prepare_merge(adapter_names, safe_merge)? {
            self.apply_merge(staged);
        }
        Ok(())
    }

    /// Remove every merged adapter from the base weight, last merged first.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor operations fail; the layer is unchanged.
    pub fn unmerge(&mut self) -> Result<()> {
        if !self.merged() {
            warn!("Already unmerged. Nothing to do.");
            return Ok(());
        }
        let Some(current) = self.base.weight() else {
            return Ok(());
        };
        let mut weight = current.clone();
        let mut bias = self.base.bias().cloned();
        for name in self.merged_adapters.iter().rev() {
            if let Some(adapter) = self.adapters.get(name) {
                let (w, b) = adapter.unmerge_from(&weight, bias)?;
                weight = w;
                bias = b;
            }
        }
        self.base = self.base.with_parameters(weight, bias)?;
        debug!(adapters = ?self.merged_adapters, "unmerged adapters from base layer");
        self.merged_adapters.clear();
        Ok(())
    }

    /// Adapters contributing to the next forward pass.
    fn live_adapters(&self) -> impl Iterator<Item = (&str, &LayerAdapter)> {
        self.active_adapters.iter().filter_map(|name| {
            if self.disabled.contains(name) {
                return None;
            }
            self.adapters.get(name).map(|a| (name.as_str(), a))
        })
    }

    /// Forward pass of the wrapped layer plus active adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if shapes do not line up or per-sample routing is
    /// requested while adapters are merged.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        if self.disable_adapters || self.merged() {
            if ctx.adapter_names.is_some() && self.merged() && !self.disable_adapters {
                return Err(merged_routing_error());
            }
            return self.base.forward(x, ctx);
        }
        if let Some(names) = &ctx.adapter_names {
            return self.mixed_batch_forward(x, names, ctx);
        }

        match &self.base {
            BaseLayer::Embedding(embedding) => self.embedding_forward(embedding, x, ctx),
            BaseLayer::Attention(_) => self.forward_attention(x, None, None, ctx),
            BaseLayer::Linear(_) | BaseLayer::Conv2d(_) => {
                let mut input_scale: Option<Tensor> = None;
                let mut output_scale: Option<Tensor> = None;
                let mut is_conv = false;
                for (_, adapter) in self.live_adapters() {
                    if let LayerAdapter::Ia3(ia3) = adapter {
                        is_conv = ia3.is_conv();
                        let slot = if ia3.is_feedforward() {
                            &mut input_scale
                        } else {
                            &mut output_scale
                        };
                        *slot = Some(match slot.take() {
                            Some(s) => s.mul(ia3.vector())?,
                            None => ia3.vector().clone(),
                        });
                    }
                }
                let base_out = match &input_scale {
                    Some(scale) => {
                        self.base.forward(&Ia3Adapter::apply_scale(x, scale, is_conv)?, ctx)?
                    }
                    None => self.base.forward(x, ctx)?,
                };
                let mut result = match &output_scale {
                    Some(scale) => Ia3Adapter::apply_scale(&base_out, scale, is_conv)?,
                    None => base_out,
                };
                for (_, adapter) in self.live_adapters() {
                    match adapter {
                        LayerAdapter::Lora(lora) => result = lora.forward(x, Some(&result), ctx)?,
                        LayerAdapter::Miss(miss) => result = miss.forward(x, Some(&result), ctx)?,
                        _ => {}
                    }
                }
                Ok(result)
            }
        }
    }

    /// Embedding lookup through the effective table plus LoRA deltas.
    fn embedding_forward(
        &self,
        embedding: &Embedding,
        x: &Tensor,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let mut table: Option<Tensor> = None;
        for (_, adapter) in self.live_adapters() {
            if let LayerAdapter::TrainableTokens(tokens) = adapter {
                let base = table.unwrap_or_else(|| embedding.embeddings().clone());
                table = Some(tokens.merge(&base)?);
            }
        }
        let mut result = match table {
            Some(table) => {
                let dim = table.dim(1)?;
                Embedding::new(table, dim).forward(x)?
            }
            None => embedding.forward(x)?,
        };
        for (_, adapter) in self.live_adapters() {
            if let LayerAdapter::Lora(lora) = adapter {
                result = lora.forward(x, Some(&result), ctx)?;
            }
        }
        Ok(result)
    }

    /// Attention forward plus gated prompt attention of active adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the wrapped layer is not an attention module.
    pub fn forward_attention(
        &self,
        x: &Tensor,
        past: Option<&KeyValue>,
        mask: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let BaseLayer::Attention(attention) = &self.base else {
            return Err(PeftError::InvalidConfig(format!(
                "{} is not an attention module",
                self.base.kind()
            )));
        };
        let mut out = attention.forward(x, past, mask, ctx)?;
        if self.disable_adapters {
            return Ok(out);
        }
        for (_, adapter) in self.live_adapters() {
            if let LayerAdapter::AdaptionPrompt(prompt) = adapter {
                out = (out + prompt.forward(attention, x, ctx)?)?;
            }
        }
        Ok(out)
    }

    /// Route each batch row through its own LoRA adapter.
    fn mixed_batch_forward(
        &self,
        x: &Tensor,
        names: &[String],
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let batch = x.dim(0)?;
        if names.len() != batch {
            return Err(PeftError::InvalidConfig(format!(
                "length of adapter_names ({}) must match the batch size ({batch})",
                names.len()
            )));
        }
        let mut result = self.base.forward(x, ctx)?;
        let mut unique: Vec<&String> = names.iter().collect();
        unique.sort();
        unique.dedup();
        for name in unique {
            if name == BASE_ADAPTER_NAME {
                continue;
            }
            let Some(adapter) = self.adapters.get(name) else {
                continue;
            };
            let LayerAdapter::Lora(lora) = adapter else {
                return Err(PeftError::Unsupported {
                    peft_type: adapter.peft_type(),
                    operation: "per-sample adapter routing",
                });
            };
            let rows: Vec<u32> = names
                .iter()
                .enumerate()
                .filter(|(_, n)| *n == name)
                .map(|(i, _)| u32::try_from(i))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| PeftError::InvalidConfig(format!("batch too large: {e}")))?;
            let rows = Tensor::new(rows.as_slice(), x.device())?;
            let sub_batch = x.index_select(&rows, 0)?;
            let delta = lora.forward(&sub_batch, None, ctx)?.to_dtype(result.dtype())?;
            result = result.index_add(&rows, &delta, 0)?;
        }
        Ok(result)
    }

    /// Load stored tensors into the adapter `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is missing, a key is missing, or a
    /// shape differs.
    pub fn load_adapter_state(&mut self, name: &str, state: HashMap<String, Tensor>) -> Result<()> {
        let adapter = self
            .adapters
            .get_mut(name)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: name.to_string(),
            })?;
        adapter.load_state_dict(state)
    }

    pub(crate) fn adapter_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        for (name, adapter) in &self.adapters {
            let Ok(state) = adapter.state_dict() else {
                continue;
            };
            let mut entries: Vec<_> = state.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (local, tensor) in entries {
                out.push(NamedParameter::new(
                    join(prefix, &local),
                    &tensor,
                    ParamRole::Adapter {
                        adapter: name.clone(),
                        trainable: self.trainable.contains(name),
                    },
                ));
            }
        }
    }
}

impl Trainable for TunerLayer {
    fn set_requires_grad(&mut self, adapter: &str, requires_grad: bool) {
        if requires_grad && self.adapters.contains_key(adapter) {
            self.trainable.insert(adapter.to_string());
        } else {
            self.trainable.remove(adapter);
        }
    }

    fn requires_grad(&self, adapter: &str) -> bool {
        self.trainable.contains(adapter)
    }

    fn freeze(&mut self) {
        self.trainable.clear();
    }
}

pub(crate) fn merged_routing_error() -> PeftError {
    PeftError::InvalidConfig(
        "cannot pass adapter_names when there are merged adapters, call unmerge_adapter first"
            .into(),
    )
}

/// Whether every element of `t` is finite.
pub(crate) fn all_finite(t: &Tensor) -> Result<bool> {
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ia3::Ia3Config;
    use crate::adapters::lora::{LoraConfig, LoraInitialization};
    use candle_core::Device;
    use candle_nn::Linear;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    fn lora_config(r: usize) -> LoraConfig {
        LoraConfig {
            r,
            init_lora_weights: LoraInitialization::Random,
            ..Default::default()
        }
    }

    fn layer_with(names: &[&str]) -> Result<TunerLayer> {
        let w = Tensor::randn(0f32, 1.0, (6, 4), &Device::Cpu)?;
        let mut layer = TunerLayer::new(BaseLayer::Linear(Linear::new(w, None)));
        for (i, name) in names.iter().enumerate() {
            let adapter = LoraAdapter::new(layer.base_layer(), "proj", &lora_config(i + 1))?;
            layer.update_layer(name, LayerAdapter::Lora(adapter))?;
        }
        layer.set_adapter(&[names[0].to_string()]);
        Ok(layer)
    }

    #[test]
    fn test_merge_unmerge_round_trip() -> Result<()> {
        let mut layer = layer_with(&["default"])?;
        let x = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        let original = layer.base_layer().weight().unwrap().clone();
        let unmerged_out = layer.forward(&x, &ctx)?;

        layer.merge(None, true)?;
        assert_eq!(layer.merged_adapters(), ["default".to_string()]);
        assert!(max_abs_diff(&unmerged_out, &layer.forward(&x, &ctx)?)? < 1e-4);

        layer.unmerge()?;
        assert!(!layer.merged());
        assert!(max_abs_diff(&original, layer.base_layer().weight().unwrap())? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_double_merge_is_skipped() -> Result<()> {
        let mut layer = layer_with(&["default"])?;
        layer.merge(None, false)?;
        let once = layer.base_layer().weight().unwrap().clone();
        layer.merge(None, false)?;
        assert!(max_abs_diff(&once, layer.base_layer().weight().unwrap())? < 1e-7);
        assert_eq!(layer.merged_adapters().len(), 1);
        Ok(())
    }

    #[test]
    fn test_unmerge_without_merge_is_noop() -> Result<()> {
        let mut layer = layer_with(&["default"])?;
        layer.unmerge()?;
        assert!(!layer.merged());
        Ok(())
    }

    #[test]
    fn test_safe_merge_rejects_nan_and_keeps_weight() -> Result<()> {
        let mut layer = layer_with(&["default"])?;
        let original = layer.base_layer().weight().unwrap().to_vec2::<f32>()?;
        let adapter = layer.adapter_mut("default").unwrap();
        let mut state = adapter.state_dict()?;
        let a = state["lora_A.weight"].clone();
        state.insert("lora_A.weight".into(), (a * f64::NAN)?);
        adapter.load_state_dict(state)?;

        let err = layer.merge(None, true).unwrap_err();
        assert!(err.to_string().contains("NaNs detected"));
        assert!(err.to_string().contains("default"));
        assert!(!layer.merged());
        let after = layer.base_layer().weight().unwrap().to_vec2::<f32>()?;
        for (r0, r1) in original.iter().zip(after.iter()) {
            for (v0, v1) in r0.iter().zip(r1.iter()) {
                assert_eq!(v0.to_bits(), v1.to_bits());
            }
        }

        layer.merge(None, false)?;
        assert!(!all_finite(layer.base_layer().weight().unwrap())?);
        Ok(())
    }

    #[test]
    fn test_disabled_layer_uses_base() -> Result<()> {
        let mut layer = layer_with(&["default"])?;
        let x = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        let base_out = layer.base_layer().forward(&x, &ctx)?;
        assert!(max_abs_diff(&base_out, &layer.forward(&x, &ctx)?)? > 1e-4);

        layer.enable_adapters(false);
        assert!(max_abs_diff(&base_out, &layer.forward(&x, &ctx)?)? < 1e-7);
        layer.enable_adapters(true);
        layer.set_adapter_enabled("default", false);
        assert!(max_abs_diff(&base_out, &layer.forward(&x, &ctx)?)? < 1e-7);
        Ok(())
    }

    #[test]
    fn test_mixed_batch_routes_rows() -> Result<()> {
        let mut layer = layer_with(&["a", "b"])?;
        let x = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let eval = ForwardContext::eval();

        let out_a = layer.forward(&x, &eval)?;
        layer.set_adapter(&["b".to_string()]);
        let out_b = layer.forward(&x, &eval)?;
        let out_base = layer.base_layer().forward(&x, &eval)?;

        let routed = layer.forward(
            &x,
            &ForwardContext::eval().with_adapter_names(vec![
                "a".into(),
                "b".into(),
                BASE_ADAPTER_NAME.into(),
            ]),
        )?;
        assert!(max_abs_diff(&routed.get(0)?, &out_a.get(0)?)? < 1e-5);
        assert!(max_abs_diff(&routed.get(1)?, &out_b.get(1)?)? < 1e-5);
        assert!(max_abs_diff(&routed.get(2)?, &out_base.get(2)?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_mixed_batch_length_checked() -> Result<()> {
        let layer = layer_with(&["a"])?;
        let x = Tensor::randn(0f32, 1.0, (3, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval().with_adapter_names(vec!["a".into()]);
        assert!(layer.forward(&x, &ctx).is_err());
        Ok(())
    }

    #[test]
    fn test_mixed_batch_rejected_when_merged() -> Result<()> {
        let mut layer = layer_with(&["a"])?;
        layer.merge(None, false)?;
        let x = Tensor::randn(0f32, 1.0, (1, 4), &Device::Cpu)?;
        let ctx = ForwardContext::eval().with_adapter_names(vec!["a".into()]);
        assert!(layer.forward(&x, &ctx).is_err());
        Ok(())
    }

    #[test]
    fn test_family_mixing_rejected() -> Result<()> {
        let mut layer = layer_with(&["default"])?;
        let ia3 = Ia3Adapter::new(layer.base_layer(), false, &Ia3Config::default())?;
        assert!(matches!(
            layer.update_layer("other", LayerAdapter::Ia3(ia3)),
            Err(PeftError::IncompatibleAdapterType { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_delete_clears_tracking() -> Result<()> {
        let mut layer = layer_with(&["a", "b"])?;
        layer.set_adapter_enabled("a", false);
        assert!(layer.delete_adapter("a"));
        assert!(!layer.contains("a"));
        assert!(layer.active_adapters().is_empty());
        assert!(!layer.is_adapter_disabled("a"));
        assert!(!layer.requires_grad("a"));
        assert!(!layer.delete_adapter("a"));
        Ok(())
    }

    #[test]
    fn test_set_adapter_controls_trainability() -> Result<()> {
        let mut layer = layer_with(&["a", "b"])?;
        assert!(layer.requires_grad("a"));
        assert!(!layer.requires_grad("b"));
        layer.set_adapter(&["b".to_string()]);
        assert!(!layer.requires_grad("a"));
        assert!(layer.requires_grad("b"));
        Ok(())
    }
}
