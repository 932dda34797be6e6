//! # peft-tuners
//!
//! Adapter injection and multi-adapter lifecycle for PEFT (Parameter-Efficient
//! Fine-Tuning) on candle models.
//!
//! A base model exposes its layers as a typed module tree ([`BaseModel`]).
//! Injection rewrites matching modules in place, wrapping them in
//! [`tuner::TunerLayer`]s that can hold any number of named adapters of one
//! family:
//! - **`LoRA`** (Low-Rank Adaptation), with weighted combination of adapters
//! - **IA³** (Infused Adapter by Inhibiting and Amplifying Inner Activations)
//! - **MiSS** (Matrix Shard Sharing)
//! - **Trainable tokens** (sparse embedding-row updates)
//! - **Adaption prompt** (gated attention prompts)
//! - **Prompt tuning**, **P-tuning** and **Prefix tuning**
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use peft_tuners::{LoraConfig, PeftModel, TargetModules, TunerConfig};
//!
//! let config = LoraConfig {
//!     r: 8,
//!     lora_alpha: 16.0,
//!     tuner: TunerConfig {
//!         target_modules: Some(TargetModules::names(["q_proj", "v_proj"])),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! let mut model = PeftModel::new(base_model, config, "default")?;
//! model.print_trainable_parameters();
//!
//! let output = model.forward(&ModelInput::from_ids(input_ids))?;
//! model.save_pretrained("out/", None)?;
//! let merged = model.merge_and_unload(None, true).map_err(|(_, e)| e)?;
//! ```
//!
//! ## Architecture
//!
//! [`PeftModel`] is the user-facing handle. It delegates module rewriting,
//! activation and merging to [`TunerModel`], which keeps the adapter configs
//! in an [`AdapterRegistry`]. Every operation that rewrites the tree either
//! completes or leaves the model as it was.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod io;
pub mod layers;
pub mod linalg;
pub mod model;
pub mod peft_model;
pub mod registry;
pub mod traits;
pub mod tuner;

#[cfg(test)]
mod testing;

pub use adapters::adaption_prompt::AdaptionPromptConfig;
pub use adapters::ia3::Ia3Config;
pub use adapters::lora::{LoraConfig, LoraInitialization};
pub use adapters::miss::{MissConfig, MissInitialization};
pub use adapters::prefix_tuning::PrefixTuningConfig;
pub use adapters::prompt_encoder::PromptEncoderConfig;
pub use adapters::prompt_tuning::{PromptTuningConfig, PromptTuningInit};
pub use adapters::trainable_tokens::TrainableTokensConfig;
pub use config::{
    Bias, PeftConfig, PeftMeta, PeftType, PromptLearningConfig, TargetModules, TaskType,
    TunerConfig,
};
pub use error::{PeftError, Result};
pub use io::{
    load_adapter_config, load_adapter_weights, save_adapter_config, save_adapter_weights,
    SaveLoad, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use layers::{Attention, Container, ForwardContext, KeyValue, Module};
pub use model::{BaseModel, ModelConfig, ModelInput, ModelOutput};
pub use peft_model::{format_parameter_count, DisabledAdapters, PeftModel, DEFAULT_ADAPTER_NAME};
pub use registry::AdapterRegistry;
pub use traits::{Adapter, AdapterConfig, Mergeable, Trainable};
pub use tuner::combine::CombinationType;
pub use tuner::{TunerModel, BASE_ADAPTER_NAME};
