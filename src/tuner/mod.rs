//! Adapter injection and the multi-adapter lifecycle of a wrapped model.
//!
//! [`TunerModel`] owns the base model and rewrites its module tree:
//! matching modules are replaced by [`TunerLayer`]s, `modules_to_save` by
//! [`ModulesToSaveWrapper`]s. Every mutating operation first prepares all of
//! its changes and only then commits them, so a failure leaves the tree and
//! the registry as they were.

pub mod combine;
pub mod layer;
pub mod matching;
pub mod modules_to_save;

use std::collections::HashMap;

use candle_core::Tensor;
use tracing::{debug, warn};

use crate::adapters::adaption_prompt::AdaptionPromptAdapter;
use crate::adapters::ia3::Ia3Adapter;
use crate::adapters::lora::LoraAdapter;
use crate::adapters::miss::MissAdapter;
use crate::adapters::trainable_tokens::TrainableTokensAdapter;
use crate::config::{default_target_modules, Bias, PeftConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::SaveLoad;
use crate::layers::{join, BaseLayer, ForwardContext, Module, ModuleKind, ParamRole};
use crate::model::{BaseModel, ModelInput, ModelOutput};
use crate::registry::AdapterRegistry;
use crate::traits::{AdapterConfig, Trainable};

pub use layer::{LayerAdapter, StagedMerge, TunerLayer, BASE_ADAPTER_NAME};
pub use matching::{ModuleMatcher, ModulePattern};
pub use modules_to_save::ModulesToSaveWrapper;

/// A module change prepared by injection.
#[derive(Debug)]
enum Planned {
    /// Attach an adapter, wrapping the module if needed.
    Adapter { path: String, adapter: LayerAdapter },
    /// Give the adapter its own trainable copy of the module.
    SaveCopy { path: String },
}

/// Adapters merged per layer, used to restore a merge after disabling.
pub type MergedState = Vec<(String, Vec<String>)>;

/// Base model plus the named adapters injected into it.
#[derive(Debug, Clone)]
pub struct TunerModel<M: BaseModel> {
    model: M,
    registry: AdapterRegistry,
    adapters_disabled: bool,
}

impl<M: BaseModel> TunerModel<M> {
    /// Take ownership of a base model without adapters.
    pub fn new(model: M) -> Self {
        Self {
            model,
            registry: AdapterRegistry::new(),
            adapters_disabled: false,
        }
    }

    /// The (possibly rewritten) base model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable base model.
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    /// Give the base model back as it currently is.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Registered adapter configs.
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Family of the registered adapters.
    pub fn peft_type(&self) -> Option<PeftType> {
        self.registry.peft_type()
    }

    /// Names of the active adapters.
    pub fn active_adapters(&self) -> &[String] {
        self.registry.active_adapters()
    }

    /// Whether adapter layers are switched off.
    pub fn adapters_disabled(&self) -> bool {
        self.adapters_disabled
    }

    /// Adapter wrapper at `path`, if the module there is one.
    pub fn tuner_layer(&self, path: &str) -> Option<&TunerLayer> {
        self.model.modules().get(path)?.as_tuner_layer()
    }

    /// Mutable adapter wrapper at `path`.
    pub fn tuner_layer_mut(&mut self, path: &str) -> Option<&mut TunerLayer> {
        self.model.modules_mut().get_mut(path)?.as_tuner_layer_mut()
    }

    /// Qualified names of every adapter wrapper.
    pub fn tuner_layer_names(&self) -> Vec<String> {
        self.paths_of(ModuleKind::Adapted)
    }

    /// Register `config` under `name` and inject it into the module tree.
    ///
    /// Prompt-injection families only register the config and their
    /// `modules_to_save` copies; the facade owns their encoders.
    ///
    /// # Errors
    ///
    /// Fails before any mutation if the config is invalid, the name exists,
    /// another family is attached, nothing matches, or a matched module kind
    /// is unsupported.
    pub fn inject_adapter(&mut self, name: &str, config: PeftConfig) -> Result<()> {
        config.validate()?;
        if self.registry.contains_adapter(name) {
            return Err(PeftError::AdapterExists {
                name: name.to_string(),
            });
        }
        if let Some(existing) = self.registry.peft_type() {
            if existing != config.peft_type() {
                return Err(PeftError::IncompatibleAdapterType {
                    existing,
                    requested: config.peft_type(),
                });
            }
        }
        self.check_bias_policy(&config)?;
        let config = self.resolve_targets(config)?;
        let plan = self.plan(&config)?;
        self.commit(name, config, plan)
    }

    fn check_bias_policy(&self, config: &PeftConfig) -> Result<()> {
        if self.registry.is_empty() {
            return Ok(());
        }
        let with_bias = self
            .registry
            .iter()
            .map(|(_, c)| c.bias())
            .chain(std::iter::once(config.bias()))
            .any(|b| b != Bias::None);
        if with_bias {
            return Err(PeftError::InvalidConfig(format!(
                "{} supports only 1 adapter with bias. When using multiple adapters, set bias to 'none' for all adapters.",
                config.peft_type()
            )));
        }
        Ok(())
    }

    /// Fill unset `target_modules` from the architecture defaults.
    fn resolve_targets(&self, mut config: PeftConfig) -> Result<PeftConfig> {
        let peft_type = config.peft_type();
        let tuner = match &mut config {
            PeftConfig::Lora(c) => Some(&mut c.tuner),
            PeftConfig::Ia3(c) => Some(&mut c.tuner),
            PeftConfig::Miss(c) => Some(&mut c.tuner),
            PeftConfig::TrainableTokens(c) => Some(&mut c.tuner),
            _ => None,
        };
        if let Some(tuner) = tuner {
            if tuner.target_modules.is_none() {
                let defaults = default_target_modules(peft_type, &self.model.config().model_type)
                    .ok_or_else(|| {
                        PeftError::InvalidConfig(
                            "Please specify `target_modules` in `peft_config`".into(),
                        )
                    })?;
                tuner.target_modules = Some(defaults);
            }
        }
        Ok(config)
    }

    /// Build every adapter the config asks for without touching the tree.
    fn plan(&self, config: &PeftConfig) -> Result<Vec<Planned>> {
        let peft_type = config.peft_type();
        let output_layer = &self.model.config().output_layer_name;
        let save = config.modules_to_save();
        let modules = self.model.modules().named_modules();
        let mut plan = Vec::new();

        match config {
            PeftConfig::AdaptionPrompt(c) => {
                let attention: Vec<_> = modules
                    .iter()
                    .filter(|(path, m)| {
                        m.layer_kind() == ModuleKind::Attention
                            && matching::name_matches(path, &c.target_modules)
                    })
                    .collect();
                if attention.is_empty() {
                    return Err(PeftError::NoTargetModules {
                        selector: c.selector().to_string(),
                    });
                }
                if attention.len() < c.adapter_layers {
                    return Err(PeftError::InvalidConfig(format!(
                        "config specifies more adapter layers '{}' than the model has '{}'",
                        c.adapter_layers,
                        attention.len()
                    )));
                }
                let skip = attention.len() - c.adapter_layers;
                for (path, module) in attention.into_iter().skip(skip) {
                    let base = base_layer_of(module).ok_or_else(|| unsupported(path, module, peft_type))?;
                    plan.push(Planned::Adapter {
                        path: path.clone(),
                        adapter: build_layer_adapter(config, &base, path, false)?,
                    });
                }
            }
            PeftConfig::Lora(_)
            | PeftConfig::Ia3(_)
            | PeftConfig::Miss(_)
            | PeftConfig::TrainableTokens(_) => {
                let Some(tuner) = config.tuner() else {
                    return Ok(plan);
                };
                let targets = tuner.target_modules.as_ref().ok_or_else(|| {
                    PeftError::InvalidConfig("Please specify `target_modules` in `peft_config`".into())
                })?;
                let matcher = ModuleMatcher::new(tuner, targets, output_layer)?;
                let feedforward = match config {
                    PeftConfig::Ia3(c) => c
                        .feedforward_modules
                        .as_ref()
                        .map(|f| ModulePattern::compile(f, output_layer))
                        .transpose()?,
                    _ => None,
                };
                for (path, module) in &modules {
                    if module.kind() == ModuleKind::ModulesToSave
                        || save.iter().any(|s| matching::name_matches(path, s))
                    {
                        continue;
                    }
                    let kind = module.layer_kind();
                    if !matcher.matches(path, kind) {
                        continue;
                    }
                    let base = base_layer_of(module)
                        .filter(|b| supports(peft_type, b.kind()))
                        .ok_or_else(|| unsupported(path, module, peft_type))?;
                    let is_feedforward = feedforward.as_ref().is_some_and(|f| f.matches(path, kind));
                    plan.push(Planned::Adapter {
                        path: path.clone(),
                        adapter: build_layer_adapter(config, &base, path, is_feedforward)?,
                    });
                }
                if plan.is_empty() {
                    return Err(PeftError::NoTargetModules {
                        selector: targets.to_string(),
                    });
                }
            }
            PeftConfig::PromptTuning(_) | PeftConfig::PTuning(_) | PeftConfig::PrefixTuning(_) => {}
        }

        for target in save {
            let mut found = false;
            for (path, module) in &modules {
                if !matching::name_matches(path, target) {
                    continue;
                }
                match module {
                    Module::Linear(_)
                    | Module::Embedding(_)
                    | Module::Conv2d(_)
                    | Module::ModulesToSave(_) => {
                        plan.push(Planned::SaveCopy { path: path.clone() });
                        found = true;
                    }
                    other => return Err(unsupported(path, other, peft_type)),
                }
            }
            if !found {
                warn!(module = %target, "modules_to_save entry did not match any module");
            }
        }
        Ok(plan)
    }

    fn commit(&mut self, name: &str, config: PeftConfig, plan: Vec<Planned>) -> Result<()> {
        let inference_mode = config.inference_mode();
        self.registry.register_adapter(name, config)?;
        let active = self.registry.active_adapters().to_vec();
        for change in plan {
            if let Err(e) = self.apply(name, change, &active, inference_mode) {
                self.purge(name);
                self.registry.remove_adapter(name);
                return Err(e);
            }
        }
        debug!(adapter = name, "adapter injected");
        Ok(())
    }

    fn apply(
        &mut self,
        name: &str,
        change: Planned,
        active: &[String],
        inference_mode: bool,
    ) -> Result<()> {
        let is_active = active.iter().any(|a| a == name);
        match change {
            Planned::Adapter { path, adapter } => {
                let slot = self.slot_mut(&path)?;
                if !matches!(slot, Module::Adapted(_)) {
                    let module = std::mem::take(slot);
                    match module.into_base_layer() {
                        Ok(base) => *slot = Module::Adapted(Box::new(TunerLayer::new(base))),
                        Err(module) => {
                            let err = unsupported(&path, &module, adapter.peft_type());
                            *slot = module;
                            return Err(err);
                        }
                    }
                }
                if let Module::Adapted(layer) = slot {
                    layer.update_layer(name, adapter)?;
                    layer.set_active(active);
                    if inference_mode || !is_active {
                        layer.set_requires_grad(name, false);
                    }
                }
                debug!(adapter = name, module = %path, "wrapped module");
            }
            Planned::SaveCopy { path } => {
                let single = active.first().map(String::as_str);
                let slot = self.slot_mut(&path)?;
                if !matches!(slot, Module::ModulesToSave(_)) {
                    let module = std::mem::take(slot);
                    let base = match module.into_base_layer() {
                        Ok(base) => base,
                        Err(module) => {
                            let err = PeftError::InvalidConfig(format!(
                                "{path} is a {}, which cannot be kept in modules_to_save",
                                module.kind()
                            ));
                            *slot = module;
                            return Err(err);
                        }
                    };
                    match ModulesToSaveWrapper::new(base.clone(), name) {
                        Ok(wrapper) => *slot = Module::ModulesToSave(Box::new(wrapper)),
                        Err(e) => {
                            *slot = base.into_module();
                            return Err(e);
                        }
                    }
                }
                if let Module::ModulesToSave(wrapper) = slot {
                    wrapper.add_adapter(name);
                    wrapper.set_active(single);
                    if inference_mode || !is_active {
                        wrapper.set_requires_grad(name, false);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove every per-module trace of `name` and unwrap emptied wrappers.
    fn purge(&mut self, name: &str) {
        for path in self.paths_of(ModuleKind::Adapted) {
            let Ok(slot) = self.slot_mut(&path) else {
                continue;
            };
            let empty = match slot {
                Module::Adapted(layer) => {
                    layer.delete_adapter(name);
                    layer.adapter_names().next().is_none()
                }
                _ => false,
            };
            if empty {
                if let Module::Adapted(layer) = std::mem::take(slot) {
                    *slot = layer.into_base_layer().into_module();
                }
            }
        }
        for path in self.paths_of(ModuleKind::ModulesToSave) {
            let Ok(slot) = self.slot_mut(&path) else {
                continue;
            };
            let empty = match slot {
                Module::ModulesToSave(wrapper) => {
                    wrapper.delete_adapter(name);
                    wrapper.adapter_names().next().is_none()
                }
                _ => false,
            };
            if empty {
                if let Module::ModulesToSave(wrapper) = std::mem::take(slot) {
                    *slot = wrapper.original().clone().into_module();
                }
            }
        }
    }

    /// Delete an adapter from the registry and every module.
    ///
    /// Layers that merged it are unmerged first and the other adapters merged
    /// there are folded back in. A deleted active adapter leaves the active
    /// selection without it.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn delete_adapter(&mut self, name: &str) -> Result<()> {
        if !self.registry.contains_adapter(name) {
            return Err(PeftError::AdapterNotFound {
                name: name.to_string(),
            });
        }
        self.for_each_layer_mut(|path, layer| {
            if !layer.merged_adapters().iter().any(|n| n == name) {
                return Ok(());
            }
            warn!(adapter = name, module = path, "unmerging adapter before deleting it");
            let keep: Vec<String> = layer
                .merged_adapters()
                .iter()
                .filter(|n| n.as_str() != name)
                .cloned()
                .collect();
            layer.unmerge()?;
            if !keep.is_empty() {
                layer.merge(Some(keep.as_slice()), false)?;
            }
            Ok(())
        })?;
        self.purge(name);
        self.registry.remove_adapter(name);
        debug!(adapter = name, "adapter deleted");
        Ok(())
    }

    fn check_known(&self, names: &[String]) -> Result<()> {
        match names.iter().find(|n| !self.registry.contains_adapter(n)) {
            Some(missing) => Err(PeftError::AdapterNotFound {
                name: missing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Make `names` the active adapters and the only trainable ones.
    ///
    /// Merged layers are unmerged first.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] if a name is not registered.
    pub fn set_adapter(&mut self, names: &[String]) -> Result<()> {
        self.activate(names, true)
    }

    /// Make `names` the active adapters without changing trainability.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] if a name is not registered.
    pub fn set_adapter_inference(&mut self, names: &[String]) -> Result<()> {
        self.activate(names, false)
    }

    fn activate(&mut self, names: &[String], trainable: bool) -> Result<()> {
        self.check_known(names)?;
        self.for_each_layer_mut(|_, layer| {
            if layer.merged() {
                warn!("Adapter cannot be set when the model is merged. Unmerging the model first.");
                layer.unmerge()?;
            }
            if trainable {
                layer.set_adapter(names);
            } else {
                layer.set_active(names);
            }
            Ok(())
        })?;
        let single = names.first().map(String::as_str);
        self.for_each_saved_mut(|wrapper| {
            let was_trainable: Vec<String> = wrapper
                .adapter_names()
                .filter(|a| wrapper.requires_grad(a))
                .map(str::to_string)
                .collect();
            wrapper.set_adapter(single);
            if !trainable {
                wrapper.freeze();
                for a in &was_trainable {
                    wrapper.set_requires_grad(a, true);
                }
            }
        });
        self.registry.set_active_adapters(names)
    }

    /// Switch one adapter on or off in every layer.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn set_adapter_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        self.check_known(&[name.to_string()])?;
        self.for_each_layer_mut(|_, layer| {
            layer.set_adapter_enabled(name, enabled);
            Ok(())
        })
    }

    /// Switch adapter layers back on.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible like its counterpart.
    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        self.set_adapter_layers(true)
    }

    /// Route every wrapped module through its base layer, unmerging first.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        for name in self.registry.active_adapters() {
            let bias = self.registry.get_config(name).map(PeftConfig::bias);
            if let Ok(bias) = bias {
                if bias != Bias::None {
                    warn!(
                        ?bias,
                        "Careful, disabling adapter layers with bias configured does not produce the same output as the base model would without adaption."
                    );
                }
            }
        }
        self.set_adapter_layers(false)
    }

    fn set_adapter_layers(&mut self, enabled: bool) -> Result<()> {
        self.for_each_layer_mut(|_, layer| {
            if !enabled && layer.merged() {
                layer.unmerge()?;
            }
            layer.enable_adapters(enabled);
            Ok(())
        })?;
        self.for_each_saved_mut(|wrapper| wrapper.enable_adapters(enabled));
        self.adapters_disabled = !enabled;
        Ok(())
    }

    /// Merge adapters into the base weights of every wrapped layer.
    ///
    /// Every layer is staged before any is committed.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::Unsupported`] for families without merge
    /// semantics and [`PeftError::MergeNotFinite`] from a safe merge; the
    /// model is unchanged on error.
    pub fn merge_adapter(&mut self, adapter_names: Option<&[String]>, safe_merge: bool) -> Result<()> {
        if let Some(peft_type) = self.registry.peft_type() {
            if !peft_type.supports_merge() {
                return Err(PeftError::Unsupported {
                    peft_type,
                    operation: "merging",
                });
            }
        }
        if let Some(names) = adapter_names {
            self.check_known(names)?;
        }
        let mut staged = Vec::new();
        for (path, module) in self.model.modules().named_modules() {
            if let Module::Adapted(layer) = module {
                if let Some(s) = layer.prepare_merge(adapter_names, safe_merge)? {
                    staged.push((path, s));
                }
            }
        }
        for (path, s) in staged {
            if let Some(layer) = self.tuner_layer_mut(&path) {
                layer.apply_merge(s);
            }
        }
        Ok(())
    }

    /// Unmerge every merged layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor operations fail.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        if self.merged_state().is_empty() {
            warn!("Already unmerged. Nothing to do.");
            return Ok(());
        }
        self.for_each_layer_mut(|_, layer| {
            if layer.merged() {
                layer.unmerge()?;
            }
            Ok(())
        })
    }

    /// Adapters currently merged, per layer.
    pub fn merged_state(&self) -> MergedState {
        self.model
            .modules()
            .named_modules()
            .into_iter()
            .filter_map(|(path, m)| {
                let layer = m.as_tuner_layer()?;
                layer.merged().then(|| (path, layer.merged_adapters().to_vec()))
            })
            .collect()
    }

    /// Merge again what [`TunerModel::merged_state`] recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if a merge fails.
    pub fn restore_merged(&mut self, state: &MergedState) -> Result<()> {
        for (path, names) in state {
            if let Some(layer) = self.tuner_layer_mut(path) {
                layer.merge(Some(names.as_slice()), false)?;
            }
        }
        Ok(())
    }

    /// Merge adapters (default: all registered) and strip every wrapper.
    ///
    /// # Errors
    ///
    /// See [`TunerModel::merge_adapter`]; the model is unchanged on error.
    pub fn merge_and_unload(&mut self, adapter_names: Option<&[String]>, safe_merge: bool) -> Result<()> {
        let names: Vec<String> = match adapter_names {
            Some(names) => names.to_vec(),
            None => self.registry.adapter_names().into_iter().map(str::to_string).collect(),
        };
        self.merge_adapter(Some(names.as_slice()), safe_merge)?;
        self.unload();
        Ok(())
    }

    /// Strip every wrapper without merging.
    ///
    /// Adapter wrappers give back their base layer, modules-to-save wrappers
    /// their active copy. The registry is emptied.
    pub fn unload(&mut self) {
        for path in self.paths_of(ModuleKind::Adapted) {
            if let Ok(slot) = self.slot_mut(&path) {
                if let Module::Adapted(layer) = std::mem::take(slot) {
                    *slot = layer.into_base_layer().into_module();
                }
            }
        }
        for path in self.paths_of(ModuleKind::ModulesToSave) {
            if let Ok(slot) = self.slot_mut(&path) {
                if let Module::ModulesToSave(wrapper) = std::mem::take(slot) {
                    *slot = wrapper.into_active_layer().into_module();
                }
            }
        }
        self.registry = AdapterRegistry::new();
        self.adapters_disabled = false;
    }

    /// Forward pass of the rewritten base model.
    ///
    /// # Errors
    ///
    /// Returns an error if the base model fails.
    pub fn forward(&self, input: &ModelInput, ctx: &ForwardContext) -> Result<ModelOutput> {
        self.model.forward(input, ctx)
    }

    fn bias_policy(&self) -> Bias {
        let policies: Vec<Bias> = self
            .registry
            .active_adapters()
            .iter()
            .filter_map(|n| self.registry.get_config(n).ok().map(PeftConfig::bias))
            .collect();
        if policies.contains(&Bias::All) {
            Bias::All
        } else if policies.contains(&Bias::LoraOnly) {
            Bias::LoraOnly
        } else {
            Bias::None
        }
    }

    /// `(trainable, total)` parameter counts of the tree.
    pub fn parameter_counts(&self) -> (usize, usize) {
        let bias = self.bias_policy();
        let mut trainable = 0;
        let mut total = 0;
        for p in self.model.modules().named_parameters() {
            let n = p.tensor.elem_count();
            total += n;
            let is_trainable = match &p.role {
                ParamRole::Adapter { trainable, .. } | ParamRole::ModulesToSave { trainable, .. } => {
                    *trainable
                }
                ParamRole::Bias => bias == Bias::All,
                ParamRole::AdaptedBias => bias != Bias::None,
                ParamRole::Weight => false,
            };
            if is_trainable {
                trainable += n;
            }
        }
        (trainable, total)
    }

    /// Tensors that make up adapter `name`, keyed by qualified name.
    ///
    /// Includes its modules-to-save copies and, depending on the bias
    /// policy, the trained biases.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn adapter_state_dict(&self, name: &str) -> Result<HashMap<String, Tensor>> {
        let bias = self.registry.get_config(name)?.bias();
        let copy_infix = format!(".modules_to_save.{name}");
        let mut state = HashMap::new();
        for p in self.model.modules().named_parameters() {
            match &p.role {
                ParamRole::Adapter { adapter, .. } if adapter == name => {
                    state.insert(p.name, p.tensor);
                }
                ParamRole::ModulesToSave { adapter, .. } if adapter == name => {
                    state.insert(p.name.replace(&copy_infix, ""), p.tensor);
                }
                ParamRole::Bias if bias == Bias::All && !p.name.contains(".original_module.") => {
                    state.insert(p.name, p.tensor);
                }
                ParamRole::AdaptedBias if bias != Bias::None => {
                    state.insert(p.name, p.tensor);
                }
                _ => {}
            }
        }
        Ok(state)
    }

    /// Load tensors saved by [`TunerModel::adapter_state_dict`] into adapter `name`.
    ///
    /// Unexpected keys are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if a key is missing or a shape differs.
    pub fn load_adapter_state(&mut self, name: &str, mut state: HashMap<String, Tensor>) -> Result<()> {
        let bias = self.registry.get_config(name)?.bias();
        for path in self.paths_of(ModuleKind::Adapted) {
            let Some(layer) = self.tuner_layer_mut(&path) else {
                continue;
            };
            let Some(adapter) = layer.adapter(name) else {
                continue;
            };
            let keys: Vec<String> = adapter.state_dict()?.into_keys().collect();
            let local = take_prefixed(&mut state, &path, keys)?;
            layer.load_adapter_state(name, local)?;
        }
        for path in self.paths_of(ModuleKind::ModulesToSave) {
            let Ok(Module::ModulesToSave(wrapper)) = self.slot_mut(&path) else {
                continue;
            };
            if wrapper.copy(name).is_none() {
                continue;
            }
            let keys: Vec<String> = wrapper.adapter_state(name).into_keys().collect();
            let local = take_prefixed(&mut state, &path, keys)?;
            wrapper.load_adapter_state(name, local)?;
        }
        if bias != Bias::None {
            let bias_keys: Vec<String> = state.keys().filter(|k| k.ends_with(".bias")).cloned().collect();
            for key in bias_keys {
                if let Some(tensor) = state.remove(&key) {
                    self.set_bias(&key[..key.len() - ".bias".len()], tensor)?;
                }
            }
        }
        for key in state.keys() {
            warn!(adapter = name, key = %key, "unexpected key in adapter weights, ignoring");
        }
        Ok(())
    }

    fn set_bias(&mut self, path: &str, bias: Tensor) -> Result<()> {
        let slot = self.slot_mut(path)?;
        if let Module::Adapted(layer) = slot {
            let updated = with_bias(layer.base_layer(), path, bias)?;
            *layer.base_layer_mut() = updated;
            return Ok(());
        }
        let base = match std::mem::take(slot).into_base_layer() {
            Ok(base) => base,
            Err(module) => {
                *slot = module;
                return Err(PeftError::WeightLoad(format!("{path} has no bias")));
            }
        };
        match with_bias(&base, path, bias) {
            Ok(updated) => {
                *slot = updated.into_module();
                Ok(())
            }
            Err(e) => {
                *slot = base.into_module();
                Err(e)
            }
        }
    }

    fn paths_of(&self, kind: ModuleKind) -> Vec<String> {
        self.model
            .modules()
            .named_modules()
            .into_iter()
            .filter(|(_, m)| m.kind() == kind)
            .map(|(p, _)| p)
            .collect()
    }

    fn slot_mut(&mut self, path: &str) -> Result<&mut Module> {
        self.model
            .modules_mut()
            .get_mut(path)
            .ok_or_else(|| PeftError::ModuleNotFound {
                path: path.to_string(),
            })
    }

    fn for_each_layer_mut(
        &mut self,
        mut f: impl FnMut(&str, &mut TunerLayer) -> Result<()>,
    ) -> Result<()> {
        for path in self.paths_of(ModuleKind::Adapted) {
            if let Some(layer) = self.tuner_layer_mut(&path) {
                f(&path, layer)?;
            }
        }
        Ok(())
    }

    fn for_each_saved_mut(&mut self, mut f: impl FnMut(&mut ModulesToSaveWrapper)) {
        for path in self.paths_of(ModuleKind::ModulesToSave) {
            if let Ok(Module::ModulesToSave(wrapper)) = self.slot_mut(&path) {
                f(wrapper);
            }
        }
    }
}

fn take_prefixed(
    state: &mut HashMap<String, Tensor>,
    prefix: &str,
    keys: Vec<String>,
) -> Result<HashMap<String, Tensor>> {
    let mut local = HashMap::new();
    for key in keys {
        let full = join(prefix, &key);
        let tensor = state
            .remove(&full)
            .ok_or_else(|| PeftError::WeightLoad(format!("missing key '{full}'")))?;
        local.insert(key, tensor);
    }
    Ok(local)
}

fn with_bias(base: &BaseLayer, path: &str, bias: Tensor) -> Result<BaseLayer> {
    let (Some(weight), Some(current)) = (base.weight(), base.bias()) else {
        return Err(PeftError::WeightLoad(format!("{path} has no bias")));
    };
    if current.dims() != bias.dims() {
        return Err(PeftError::ShapeMismatch {
            expected: current.dims().to_vec(),
            actual: bias.dims().to_vec(),
        });
    }
    let bias = bias.to_device(current.device())?.to_dtype(current.dtype())?;
    base.with_parameters(weight.clone(), Some(bias))
}

/// A wrappable layer for `module`, cloning tensor handles only.
fn base_layer_of(module: &Module) -> Option<BaseLayer> {
    match module {
        Module::Linear(l) => Some(BaseLayer::Linear(l.clone())),
        Module::Embedding(e) => Some(BaseLayer::Embedding(e.clone())),
        Module::Conv2d(c) => Some(BaseLayer::Conv2d(c.clone())),
        Module::Attention(a) => Some(BaseLayer::Attention(a.clone())),
        Module::Adapted(t) => Some(t.base_layer().clone()),
        Module::Container(_) | Module::ModulesToSave(_) => None,
    }
}

/// Layer kinds each family can wrap.
fn supports(peft_type: PeftType, kind: ModuleKind) -> bool {
    match peft_type {
        PeftType::Lora => matches!(
            kind,
            ModuleKind::Linear | ModuleKind::Embedding | ModuleKind::Conv2d
        ),
        PeftType::Ia3 => matches!(kind, ModuleKind::Linear | ModuleKind::Conv2d),
        PeftType::Miss => kind == ModuleKind::Linear,
        PeftType::TrainableTokens => kind == ModuleKind::Embedding,
        PeftType::AdaptionPrompt => kind == ModuleKind::Attention,
        PeftType::PromptTuning | PeftType::PTuning | PeftType::PrefixTuning => false,
    }
}

fn unsupported(path: &str, module: &Module, peft_type: PeftType) -> PeftError {
    PeftError::UnsupportedModule {
        name: path.to_string(),
        kind: module.layer_kind().to_string(),
        peft_type,
    }
}

fn build_layer_adapter(
    config: &PeftConfig,
    base: &BaseLayer,
    path: &str,
    is_feedforward: bool,
) -> Result<LayerAdapter> {
    Ok(match (config, base) {
        (PeftConfig::Lora(c), _) => LayerAdapter::Lora(LoraAdapter::new(base, path, c)?),
        (PeftConfig::Ia3(c), _) => LayerAdapter::Ia3(Ia3Adapter::new(base, is_feedforward, c)?),
        (PeftConfig::Miss(c), _) => LayerAdapter::Miss(MissAdapter::new(base, c)?),
        (PeftConfig::TrainableTokens(c), _) => {
            LayerAdapter::TrainableTokens(TrainableTokensAdapter::new(base, c)?)
        }
        (PeftConfig::AdaptionPrompt(c), BaseLayer::Attention(attention)) => {
            LayerAdapter::AdaptionPrompt(AdaptionPromptAdapter::new(attention, c)?)
        }
        (other, _) => {
            return Err(PeftError::UnsupportedModule {
                name: path.to_string(),
                kind: base.kind().to_string(),
                peft_type: other.peft_type(),
            })
        }
    })
}
