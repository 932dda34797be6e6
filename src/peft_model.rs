//! The outward-facing handle around an adapted base model.
//!
//! [`PeftModel`] owns the [`TunerModel`] (which owns the base model) plus the
//! prompt encoders of prompt-injection families. It dispatches the forward
//! pass per family, scopes adapter disabling with a guard and persists
//! adapters without the base weights.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::{info, warn};

use crate::adapters::prefix_tuning::PrefixEncoder;
use crate::adapters::prompt_encoder::PromptEncoder;
use crate::adapters::prompt_tuning::PromptEmbedding;
use crate::config::{PeftConfig, PeftType};
use crate::error::{PeftError, Result};
use crate::io::{
    load_adapter_config, load_adapter_weights, save_adapter_config, save_adapter_weights, SaveLoad,
    ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
use crate::layers::ForwardContext;
use crate::model::{BaseModel, ModelInput, ModelOutput};
use crate::tuner::combine::CombinationType;
use crate::traits::AdapterConfig;
use crate::tuner::{MergedState, TunerModel, BASE_ADAPTER_NAME};

/// Name given to the first adapter by convention; saved at the top level.
pub const DEFAULT_ADAPTER_NAME: &str = "default";

/// Key of the encoded virtual tokens in a saved prompt adapter.
const PROMPT_EMBEDDINGS_KEY: &str = "prompt_embeddings";

/// Label value ignored by the loss.
const IGNORE_INDEX: i64 = -100;

/// Virtual-token module of one prompt-injection adapter.
#[derive(Debug, Clone)]
enum PromptModule {
    Tuning(PromptEmbedding),
    Encoder(PromptEncoder),
    Prefix(PrefixEncoder),
}

impl PromptModule {
    fn new(config: &PeftConfig, word_embeddings: Option<&candle_nn::Embedding>, device: &Device) -> Result<Option<Self>> {
        Ok(match config {
            PeftConfig::PromptTuning(c) => Some(Self::Tuning(PromptEmbedding::new(c, word_embeddings, device)?)),
            PeftConfig::PTuning(c) => Some(Self::Encoder(PromptEncoder::new(c, device)?)),
            PeftConfig::PrefixTuning(c) => Some(Self::Prefix(PrefixEncoder::new(c, device)?)),
            _ => None,
        })
    }

    fn weight(&self) -> &Tensor {
        match self {
            Self::Tuning(p) => p.weight(),
            Self::Encoder(p) => p.weight(),
            Self::Prefix(p) => p.weight(),
        }
    }

    fn num_virtual_tokens(&self) -> Result<usize> {
        Ok(self.weight().dim(0)?)
    }

    fn num_parameters(&self) -> usize {
        match self {
            Self::Tuning(p) => p.num_parameters(),
            Self::Encoder(p) => p.num_parameters(),
            Self::Prefix(p) => p.num_parameters(),
        }
    }

    /// Encoded virtual tokens, `[num_virtual_tokens, width]`.
    fn encode(&self, ctx: &ForwardContext) -> Result<Tensor> {
        let indices = Tensor::arange(0u32, self.num_virtual_tokens()? as u32, self.weight().device())?;
        match self {
            Self::Tuning(p) => p.forward(&indices),
            Self::Encoder(p) => p.forward(&indices, ctx),
            Self::Prefix(p) => p.forward(&indices),
        }
    }

    /// Encoded virtual tokens repeated over the batch.
    fn encode_batch(&self, batch: usize, ctx: &ForwardContext) -> Result<Tensor> {
        let prompts = self.encode(ctx)?;
        let (tokens, width) = prompts.dims2()?;
        Ok(prompts
            .unsqueeze(0)?
            .broadcast_as((batch, tokens, width))?
            .contiguous()?)
    }

    /// Replace the table with already encoded virtual tokens.
    fn load_prompt_embeddings(&mut self, embeddings: Tensor) -> Result<()> {
        let state = HashMap::from([("embedding.weight".to_string(), embeddings)]);
        match self {
            Self::Tuning(p) => p.load_state_dict(state),
            Self::Encoder(p) => p.load_state_dict(state),
            Self::Prefix(p) => p.load_state_dict(state),
        }
    }
}

/// A base model with named adapters attached.
#[derive(Debug, Clone)]
pub struct PeftModel<M: BaseModel> {
    tuner: TunerModel<M>,
    prompts: BTreeMap<String, PromptModule>,
    frozen_prompts: BTreeSet<String>,
    prompt_disabled: bool,
    training: bool,
}

impl<M: BaseModel> PeftModel<M> {
    /// Wrap `model` and attach its first adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or cannot be injected.
    pub fn new(model: M, config: impl Into<PeftConfig>, adapter_name: &str) -> Result<Self> {
        let mut peft = Self::bare(model);
        peft.add_adapter(adapter_name, config)?;
        Ok(peft)
    }

    fn bare(model: M) -> Self {
        Self {
            tuner: TunerModel::new(model),
            prompts: BTreeMap::new(),
            frozen_prompts: BTreeSet::new(),
            prompt_disabled: false,
            training: false,
        }
    }

    /// Wrap `model` with an adapter saved by [`PeftModel::save_pretrained`].
    ///
    /// # Errors
    ///
    /// See [`PeftModel::load_adapter`].
    pub fn from_pretrained(
        model: M,
        dir: impl AsRef<Path>,
        adapter_name: &str,
        is_trainable: bool,
    ) -> Result<Self> {
        let mut peft = Self::bare(model);
        peft.load_adapter(dir, adapter_name, is_trainable)?;
        Ok(peft)
    }

    /// The adapted base model.
    pub fn get_base_model(&self) -> &M {
        self.tuner.model()
    }

    /// The adapted base model, mutably.
    pub fn get_base_model_mut(&mut self) -> &mut M {
        self.tuner.model_mut()
    }

    /// The injection engine.
    pub fn tuner(&self) -> &TunerModel<M> {
        &self.tuner
    }

    /// The injection engine, mutably.
    pub fn tuner_mut(&mut self) -> &mut TunerModel<M> {
        &mut self.tuner
    }

    /// Family of the attached adapters.
    pub fn peft_type(&self) -> Option<PeftType> {
        self.tuner.peft_type()
    }

    /// Config of adapter `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn peft_config(&self, name: &str) -> Result<&PeftConfig> {
        self.tuner.registry().get_config(name)
    }

    /// The single active adapter.
    pub fn active_adapter(&self) -> Option<&str> {
        self.tuner.registry().active_adapter_name()
    }

    /// All active adapters.
    pub fn active_adapters(&self) -> &[String] {
        self.tuner.active_adapters()
    }

    /// Switch dropout on or off for subsequent forward passes.
    pub fn train(&mut self, training: bool) {
        self.training = training;
    }

    /// Whether forward passes run in training mode.
    pub fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> Device {
        self.tuner
            .model()
            .modules()
            .named_parameters()
            .first()
            .map_or(Device::Cpu, |p| p.tensor.device().clone())
    }

    /// Attach another adapter of the same family. It is not activated.
    ///
    /// Prompt-learning hints left unset are filled from the base model.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterExists`] for a used name,
    /// [`PeftError::IncompatibleAdapterType`] for another family, or any
    /// injection error; the model is unchanged on error.
    pub fn add_adapter(&mut self, adapter_name: &str, config: impl Into<PeftConfig>) -> Result<()> {
        self.add_adapter_with(adapter_name, config.into(), false)
    }

    fn add_adapter_with(&mut self, name: &str, mut config: PeftConfig, encoded_prompts: bool) -> Result<()> {
        if self.tuner.registry().contains_adapter(name) {
            return Err(PeftError::AdapterExists {
                name: name.to_string(),
            });
        }
        let model_config = self.tuner.model().config().clone();
        if let Some(prompt) = config.prompt_mut() {
            prompt.fill_from_model(&model_config);
        }
        if config.meta().base_model_name_or_path.is_none() {
            config.meta_mut().base_model_name_or_path = model_config.name_or_path.clone();
        }
        config.validate()?;

        let prompt = if config.is_prompt_learning() {
            // loaded prompt adapters hold encoded tokens, so only the table is built
            let mut build = config.clone();
            if encoded_prompts {
                build.meta_mut().inference_mode = true;
            }
            let words = self.tuner.model().word_embeddings().ok();
            PromptModule::new(&build, words, &self.device())?
        } else {
            None
        };

        let frozen = config.inference_mode();
        self.tuner.inject_adapter(name, config)?;
        if let Some(prompt) = prompt {
            self.prompts.insert(name.to_string(), prompt);
            if frozen {
                self.frozen_prompts.insert(name.to_string());
            }
        }
        info!(adapter = name, "added adapter");
        Ok(())
    }

    /// Make `name` the sole active adapter and mark it trainable.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn set_adapter(&mut self, name: &str) -> Result<()> {
        self.tuner.set_adapter(&[name.to_string()])
    }

    /// Make `name` the sole active adapter without changing trainability.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn set_adapter_inference(&mut self, name: &str) -> Result<()> {
        self.tuner.set_adapter_inference(&[name.to_string()])
    }

    /// Remove adapter `name` everywhere.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn delete_adapter(&mut self, name: &str) -> Result<()> {
        self.tuner.delete_adapter(name)?;
        self.prompts.remove(name);
        self.frozen_prompts.remove(name);
        info!(adapter = name, "deleted adapter");
        Ok(())
    }

    /// Register a weighted combination of LoRA adapters as `new_name`.
    ///
    /// # Errors
    ///
    /// See [`TunerModel::add_weighted_adapter`].
    pub fn add_weighted_adapter(
        &mut self,
        adapters: &[String],
        weights: &[f64],
        new_name: &str,
        combination: CombinationType,
    ) -> Result<()> {
        self.tuner
            .add_weighted_adapter(adapters, weights, new_name, combination)
    }

    /// Run the model with every adapter bypassed until the guard drops.
    ///
    /// Merged layers are unmerged while disabled and merged again on
    /// restore.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    pub fn disable_adapter(&mut self) -> Result<DisabledAdapters<'_, M>> {
        let restore = Restore {
            prompt_disabled: self.prompt_disabled,
            layers_disabled: self.tuner.adapters_disabled(),
            merged: self.tuner.merged_state(),
        };
        self.tuner.disable_adapter_layers()?;
        if self.peft_type().is_some_and(PeftType::is_prompt_learning) {
            self.prompt_disabled = true;
        }
        Ok(DisabledAdapters {
            model: self,
            restore: Some(restore),
        })
    }

    /// Call `f` with every adapter bypassed.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapters cannot be disabled.
    pub fn with_adapter_disabled<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> Result<R> {
        let mut guard = self.disable_adapter()?;
        Ok(f(&mut guard))
    }

    fn restore(&mut self, restore: Restore) -> Result<()> {
        self.prompt_disabled = restore.prompt_disabled;
        if !restore.layers_disabled {
            self.tuner.enable_adapter_layers()?;
        }
        self.tuner.restore_merged(&restore.merged)
    }

    /// Merge adapters into the base weights.
    ///
    /// # Errors
    ///
    /// See [`TunerModel::merge_adapter`].
    pub fn merge_adapter(&mut self, adapter_names: Option<&[String]>, safe_merge: bool) -> Result<()> {
        self.tuner.merge_adapter(adapter_names, safe_merge)
    }

    /// Undo every merge.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor operations fail.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        self.tuner.unmerge_adapter()
    }

    /// Merge adapters (default: all) and return the plain base model.
    ///
    /// # Errors
    ///
    /// See [`TunerModel::merge_adapter`]. On error nothing is merged and the
    /// untouched wrapper is handed back next to the error.
    pub fn merge_and_unload(
        mut self,
        adapter_names: Option<&[String]>,
        safe_merge: bool,
    ) -> std::result::Result<M, (Box<Self>, PeftError)> {
        match self.tuner.merge_and_unload(adapter_names, safe_merge) {
            Ok(()) => Ok(self.tuner.into_model()),
            Err(e) => Err((Box::new(self), e)),
        }
    }

    /// Strip every adapter without merging and return the base model.
    pub fn unload(mut self) -> M {
        self.tuner.unload();
        self.tuner.into_model()
    }

    /// Forward pass through the active adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are inconsistent or a layer fails.
    pub fn forward(&self, input: &ModelInput) -> Result<ModelOutput> {
        let ctx = ForwardContext {
            training: self.training,
            adapter_names: None,
        };
        self.forward_with(input, &ctx)
    }

    /// Forward pass routing each batch row through its own LoRA adapter.
    ///
    /// `adapter_names[i]` names the adapter of row `i`; [`BASE_ADAPTER_NAME`]
    /// selects the bare base model.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, non-LoRA families or a length
    /// that differs from the batch size.
    pub fn forward_with_adapters(&self, input: &ModelInput, adapter_names: &[String]) -> Result<ModelOutput> {
        if let Some(peft_type) = self.peft_type() {
            if peft_type != PeftType::Lora {
                return Err(PeftError::Unsupported {
                    peft_type,
                    operation: "per-sample adapter routing",
                });
            }
        }
        if let Some(unknown) = adapter_names
            .iter()
            .find(|n| n.as_str() != BASE_ADAPTER_NAME && !self.tuner.registry().contains_adapter(n))
        {
            return Err(PeftError::AdapterNotFound {
                name: unknown.clone(),
            });
        }
        let batch = input.batch_size()?;
        if adapter_names.len() != batch {
            return Err(PeftError::InvalidConfig(format!(
                "length of adapter_names ({}) should be the same as the batch size ({batch})",
                adapter_names.len()
            )));
        }
        let ctx = ForwardContext {
            training: self.training,
            adapter_names: Some(adapter_names.to_vec()),
        };
        self.forward_with(input, &ctx)
    }

    fn forward_with(&self, input: &ModelInput, ctx: &ForwardContext) -> Result<ModelOutput> {
        let is_prompt = self.peft_type().is_some_and(PeftType::is_prompt_learning);
        if !is_prompt || self.prompt_disabled {
            return self.tuner.forward(input, ctx);
        }
        let input = self.prepare_prompt_inputs(input, ctx)?;
        self.tuner.forward(&input, ctx)
    }

    /// Extend the inputs with the active adapter's virtual tokens.
    fn prepare_prompt_inputs(&self, input: &ModelInput, ctx: &ForwardContext) -> Result<ModelInput> {
        let name = self.active_adapter().ok_or_else(|| {
            PeftError::InvalidConfig("prompt learning needs exactly one active adapter".into())
        })?;
        let prompt = self.prompts.get(name).ok_or_else(|| PeftError::AdapterNotFound {
            name: name.to_string(),
        })?;
        let batch = input.batch_size()?;
        let tokens = prompt.num_virtual_tokens()?;
        let mut input = input.clone();
        if input.position_ids.take().is_some() {
            warn!("Position ids are not supported for parameter efficient tuning. Ignoring position ids.");
        }
        if input.token_type_ids.take().is_some() {
            warn!("Token type ids are not supported for parameter efficient tuning. Ignoring token type ids.");
        }
        if let Some(mask) = input.attention_mask.take() {
            let prefix = Tensor::ones((batch, tokens), mask.dtype(), mask.device())?;
            input.attention_mask = Some(Tensor::cat(&[&prefix, &mask], 1)?);
        }

        if let PromptModule::Prefix(encoder) = prompt {
            if input.past_key_values.is_some() {
                return Err(PeftError::InvalidConfig(
                    "past_key_values cannot be combined with prefix tuning".into(),
                ));
            }
            let flat = prompt.encode_batch(batch, ctx)?;
            input.past_key_values = Some(encoder.past_key_values(&flat)?);
            return Ok(input);
        }

        let embeds = match input.inputs_embeds.take() {
            Some(embeds) => embeds,
            None => {
                let ids = input.input_ids.as_ref().ok_or_else(|| {
                    PeftError::InvalidConfig("either input_ids or inputs_embeds must be provided".into())
                })?;
                self.tuner.model().embed(ids, ctx)?
            }
        };
        let prompts = prompt.encode_batch(batch, ctx)?.to_dtype(embeds.dtype())?;
        input.inputs_embeds = Some(Tensor::cat(&[&prompts, &embeds], 1)?);
        input.input_ids = None;
        if let Some(labels) = input.labels.take() {
            let ignored = Tensor::full(IGNORE_INDEX, (batch, tokens), labels.device())?
                .to_dtype(labels.dtype())?;
            input.labels = Some(Tensor::cat(&[&ignored, &labels], 1)?);
        }
        Ok(input)
    }

    /// `(trainable, total)` parameter counts, prompt encoders included.
    pub fn get_nb_trainable_parameters(&self) -> (usize, usize) {
        let (mut trainable, mut total) = self.tuner.parameter_counts();
        for (name, prompt) in &self.prompts {
            let n = prompt.num_parameters();
            total += n;
            if !self.frozen_prompts.contains(name) {
                trainable += n;
            }
        }
        (trainable, total)
    }

    /// Log the trainable parameter summary.
    pub fn print_trainable_parameters(&self) {
        let (trainable, total) = self.get_nb_trainable_parameters();
        #[allow(clippy::cast_precision_loss)]
        let percent = if total == 0 {
            0.0
        } else {
            100.0 * trainable as f64 / total as f64
        };
        info!(
            "trainable params: {} || all params: {} || trainable%: {percent:.4}",
            format_parameter_count(trainable),
            format_parameter_count(total)
        );
    }

    /// Tensors that make up adapter `name`, as written by `save_pretrained`.
    ///
    /// # Errors
    ///
    /// Returns [`PeftError::AdapterNotFound`] for unknown names.
    pub fn adapter_state_dict(&self, name: &str) -> Result<HashMap<String, Tensor>> {
        let mut state = self.tuner.adapter_state_dict(name)?;
        if let Some(prompt) = self.prompts.get(name) {
            state.insert(
                PROMPT_EMBEDDINGS_KEY.to_string(),
                prompt.encode(&ForwardContext::eval())?,
            );
        }
        Ok(state)
    }

    /// Write adapters (default: all) below `dir`.
    ///
    /// The `default` adapter goes to `dir` itself, others to `dir/<name>`.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` is a file, a name is unknown, or writing fails.
    pub fn save_pretrained(&self, dir: impl AsRef<Path>, selected_adapters: Option<&[String]>) -> Result<()> {
        let dir = dir.as_ref();
        if dir.is_file() {
            return Err(PeftError::Io(format!(
                "provided path ({}) should be a directory, not a file",
                dir.display()
            )));
        }
        let names: Vec<String> = match selected_adapters {
            Some(selected) => {
                let registered = self.tuner.registry().adapter_names();
                if let Some(unknown) = selected.iter().find(|n| !registered.contains(&n.as_str())) {
                    return Err(PeftError::InvalidConfig(format!(
                        "cannot save unknown adapter '{unknown}', available adapters are {registered:?}"
                    )));
                }
                selected.to_vec()
            }
            None => self
                .tuner
                .registry()
                .adapter_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        for name in &names {
            let out = if name == DEFAULT_ADAPTER_NAME {
                dir.to_path_buf()
            } else {
                dir.join(name)
            };
            std::fs::create_dir_all(&out)
                .map_err(|e| PeftError::Io(format!("Failed to create {}: {e}", out.display())))?;

            save_adapter_weights(&self.adapter_state_dict(name)?, out.join(ADAPTER_WEIGHTS_FILENAME))?;

            let mut config = self.peft_config(name)?.clone();
            config.meta_mut().inference_mode = true;
            if config.meta().base_model_name_or_path.is_none() {
                config.meta_mut().base_model_name_or_path =
                    self.tuner.model().config().name_or_path.clone();
            }
            save_adapter_config(&config, out.join(ADAPTER_CONFIG_FILENAME))?;
            info!(adapter = %name, path = %out.display(), "saved adapter");
        }
        Ok(())
    }

    /// Attach an adapter saved in `dir` under `adapter_name`.
    ///
    /// The adapter stays frozen unless `is_trainable`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is missing, the config cannot be attached,
    /// or a tensor is missing or mis-shaped; the model is unchanged on error.
    pub fn load_adapter(&mut self, dir: impl AsRef<Path>, adapter_name: &str, is_trainable: bool) -> Result<()> {
        let dir = dir.as_ref();
        let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILENAME);
        for path in [&config_path, &weights_path] {
            if !path.is_file() {
                return Err(PeftError::Io(format!("{} not found", path.display())));
            }
        }
        let mut config: PeftConfig = load_adapter_config(&config_path)?;
        config.meta_mut().inference_mode = !is_trainable;
        let state = load_adapter_weights(&weights_path, &self.device())?;

        self.add_adapter_with(adapter_name, config, true)?;
        if let Err(e) = self.load_adapter_state(adapter_name, state) {
            self.delete_adapter(adapter_name)?;
            return Err(e);
        }
        info!(adapter = adapter_name, path = %dir.display(), is_trainable, "loaded adapter");
        Ok(())
    }

    fn load_adapter_state(&mut self, name: &str, mut state: HashMap<String, Tensor>) -> Result<()> {
        if let Some(prompt) = self.prompts.get_mut(name) {
            let embeddings = state.remove(PROMPT_EMBEDDINGS_KEY).ok_or_else(|| {
                PeftError::WeightLoad(format!("missing key '{PROMPT_EMBEDDINGS_KEY}'"))
            })?;
            prompt.load_prompt_embeddings(embeddings)?;
        }
        self.tuner.load_adapter_state(name, state)
    }
}

/// State put back when a [`DisabledAdapters`] guard drops.
#[derive(Debug)]
struct Restore {
    prompt_disabled: bool,
    layers_disabled: bool,
    merged: MergedState,
}

/// Scope in which every adapter of a [`PeftModel`] is bypassed.
///
/// Dereferences to the model; the previous state, merges included, is
/// restored on drop.
#[derive(Debug)]
pub struct DisabledAdapters<'a, M: BaseModel> {
    model: &'a mut PeftModel<M>,
    restore: Option<Restore>,
}

impl<M: BaseModel> Deref for DisabledAdapters<'_, M> {
    type Target = PeftModel<M>;

    fn deref(&self) -> &Self::Target {
        &*self.model
    }
}

impl<M: BaseModel> DerefMut for DisabledAdapters<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.model
    }
}

impl<M: BaseModel> Drop for DisabledAdapters<'_, M> {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            if let Err(e) = self.model.restore(restore) {
                warn!(error = %e, "failed to restore adapters after disabling them");
            }
        }
    }
}

/// Human-readable parameter count, e.g. `1.20M`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}
