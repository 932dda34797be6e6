//! Fully trainable per-adapter copies of selected modules.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use candle_core::Tensor;
use tracing::warn;

use crate::error::{PeftError, Result};
use crate::io::take_tensor;
use crate::layers::{join, BaseLayer, ForwardContext, NamedParameter, ParamRole};
use crate::traits::Trainable;

/// Keeps the original module plus one trainable copy per adapter.
///
/// The forward pass runs the active adapter's copy, or the original when
/// no adapter is active or adapters are disabled.
#[derive(Debug, Clone)]
pub struct ModulesToSaveWrapper {
    original: BaseLayer,
    copies: BTreeMap<String, BaseLayer>,
    active: Option<String>,
    disabled: bool,
    trainable: BTreeSet<String>,
}

impl ModulesToSaveWrapper {
    /// Wrap `original` with a first copy for `adapter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the module has no weight to copy.
    pub fn new(original: BaseLayer, adapter: &str) -> Result<Self> {
        if original.weight().is_none() {
            return Err(PeftError::InvalidConfig(format!(
                "modules_to_save does not support {} modules",
                original.kind()
            )));
        }
        let mut wrapper = Self {
            original,
            copies: BTreeMap::new(),
            active: None,
            disabled: false,
            trainable: BTreeSet::new(),
        };
        wrapper.add_adapter(adapter);
        Ok(wrapper)
    }

    /// The untouched module.
    #[must_use]
    pub fn original(&self) -> &BaseLayer {
        &self.original
    }

    /// Copy kept for `adapter`.
    #[must_use]
    pub fn copy(&self, adapter: &str) -> Option<&BaseLayer> {
        self.copies.get(adapter)
    }

    /// Adapter whose copy runs in the forward pass.
    #[must_use]
    pub fn active_adapter(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Names with a copy.
    pub fn adapter_names(&self) -> impl Iterator<Item = &str> {
        self.copies.keys().map(String::as_str)
    }

    /// Add a fresh copy of the original for `adapter` and make it active.
    pub fn add_adapter(&mut self, adapter: &str) {
        if self.copies.contains_key(adapter) {
            warn!(adapter, "modules_to_save copy already exists, keeping it");
        } else {
            self.copies.insert(adapter.to_string(), self.original.clone());
            self.trainable.insert(adapter.to_string());
        }
        if self.active.is_none() {
            self.active = Some(adapter.to_string());
        }
    }

    /// Switch the copy used by the forward pass. Unknown names deactivate the wrapper.
    pub fn set_adapter(&mut self, adapter: Option<&str>) {
        self.active = adapter
            .filter(|a| self.copies.contains_key(*a))
            .map(str::to_string);
        self.trainable.clear();
        if let Some(a) = &self.active {
            self.trainable.insert(a.clone());
        }
    }

    /// Switch the copy used by the forward pass, leaving trainability alone.
    pub fn set_active(&mut self, adapter: Option<&str>) {
        self.active = adapter
            .filter(|a| self.copies.contains_key(*a))
            .map(str::to_string);
    }

    /// Route the forward pass through the original module while disabled.
    pub fn enable_adapters(&mut self, enabled: bool) {
        self.disabled = !enabled;
    }

    /// Drop the copy kept for `adapter`. Returns whether one existed.
    pub fn delete_adapter(&mut self, adapter: &str) -> bool {
        let removed = self.copies.remove(adapter).is_some();
        self.trainable.remove(adapter);
        if self.active.as_deref() == Some(adapter) {
            self.active = None;
        }
        removed
    }

    /// Replace the copy of `adapter` with stored `weight`/`bias` tensors.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is missing or has the wrong shape.
    pub fn load_adapter_state(
        &mut self,
        adapter: &str,
        mut state: HashMap<String, Tensor>,
    ) -> Result<()> {
        let copy = self
            .copies
            .get_mut(adapter)
            .ok_or_else(|| PeftError::AdapterNotFound {
                name: adapter.to_string(),
            })?;
        let weight = match copy.weight() {
            Some(w) => take_tensor(&mut state, "weight", w)?,
            None => return Ok(()),
        };
        let bias = match copy.bias() {
            Some(b) => Some(take_tensor(&mut state, "bias", b)?),
            None => None,
        };
        *copy = copy.with_parameters(weight, bias)?;
        Ok(())
    }

    /// The module an unloaded model keeps: the active copy, else the original.
    #[must_use]
    pub fn into_active_layer(mut self) -> BaseLayer {
        self.active
            .as_ref()
            .and_then(|a| self.copies.remove(a))
            .unwrap_or(self.original)
    }

    /// Tensors of the copy kept for `adapter`, keyed `weight`/`bias`.
    #[must_use]
    pub fn adapter_state(&self, adapter: &str) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        if let Some(copy) = self.copies.get(adapter) {
            if let Some(w) = copy.weight() {
                state.insert("weight".to_string(), w.clone());
            }
            if let Some(b) = copy.bias() {
                state.insert("bias".to_string(), b.clone());
            }
        }
        state
    }

    fn current(&self) -> &BaseLayer {
        if self.disabled {
            return &self.original;
        }
        self.active
            .as_ref()
            .and_then(|a| self.copies.get(a))
            .unwrap_or(&self.original)
    }

    /// Forward pass through the active copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying layer fails.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.current().forward(x, ctx)
    }

    pub(crate) fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>) {
        self.original
            .named_parameters(&join(prefix, "original_module"), out);
        for (adapter, copy) in &self.copies {
            let start = out.len();
            copy.named_parameters(&join(prefix, &format!("modules_to_save.{adapter}")), out);
            for p in &mut out[start..] {
                p.role = ParamRole::ModulesToSave {
                    adapter: adapter.clone(),
                    trainable: self.trainable.contains(adapter),
                };
            }
        }
    }
}

impl Trainable for ModulesToSaveWrapper {
    fn set_requires_grad(&mut self, adapter: &str, requires_grad: bool) {
        if requires_grad && self.copies.contains_key(adapter) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Linear;

    fn head() -> Result<BaseLayer> {
        Ok(BaseLayer::Linear(Linear::new(
            Tensor::ones((2, 3), DType::F32, &Device::Cpu)?,
            Some(Tensor::zeros(2, DType::F32, &Device::Cpu)?),
        )))
    }

    #[test]
    fn test_copy_routing() -> Result<()> {
        let mut wrapper = ModulesToSaveWrapper::new(head()?, "a")?;
        wrapper.add_adapter("b");
        let state = HashMap::from([
            ("weight".to_string(), Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?),
            ("bias".to_string(), Tensor::ones(2, DType::F32, &Device::Cpu)?),
        ]);
        wrapper.load_adapter_state("b", state)?;

        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;
        let ctx = ForwardContext::eval();
        assert_eq!(wrapper.forward(&x, &ctx)?.to_vec2::<f32>()?, vec![vec![3.0, 3.0]]);

        wrapper.set_adapter(Some("b"));
        assert_eq!(wrapper.forward(&x, &ctx)?.to_vec2::<f32>()?, vec![vec![1.0, 1.0]]);
        assert!(wrapper.requires_grad("b"));
        assert!(!wrapper.requires_grad("a"));

        wrapper.enable_adapters(false);
        assert_eq!(wrapper.forward(&x, &ctx)?.to_vec2::<f32>()?, vec![vec![3.0, 3.0]]);
        Ok(())
    }

    #[test]
    fn test_parameter_names() -> Result<()> {
        let wrapper = ModulesToSaveWrapper::new(head()?, "default")?;
        let mut params = Vec::new();
        wrapper.collect_parameters("lm_head", &mut params);
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "lm_head.original_module.weight",
                "lm_head.original_module.bias",
                "lm_head.modules_to_save.default.weight",
                "lm_head.modules_to_save.default.bias",
            ]
        );
        assert!(matches!(
            params[2].role,
            ParamRole::ModulesToSave { trainable: true, .. }
        ));
        Ok(())
    }

    #[test]
    fn test_delete_active_copy() -> Result<()> {
        let mut wrapper = ModulesToSaveWrapper::new(head()?, "default")?;
        assert!(wrapper.delete_adapter("default"));
        assert!(wrapper.active_adapter().is_none());
        assert!(!wrapper.delete_adapter("default"));
        Ok(())
    }
}
