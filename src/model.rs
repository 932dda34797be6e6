//! Interface between the adapter engine and the wrapped base network.
//!
//! The engine never inspects a network's code, only:
//! - its typed module tree, which injection rewrites in place
//! - a handful of structural hints ([`ModelConfig`])
//! - a forward pass taking [`ModelInput`] and returning [`ModelOutput`]

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{PeftError, Result};
use crate::layers::{BaseLayer, Container, ForwardContext, KeyValue, Module};

/// Structural hints of a base model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture family, used to pick default target modules.
    pub model_type: String,

    /// Identifier the weights were loaded from.
    #[serde(default)]
    pub name_or_path: Option<String>,

    /// Hidden size.
    pub hidden_size: usize,

    /// Attention heads per layer.
    pub num_attention_heads: usize,

    /// Transformer layers.
    pub num_hidden_layers: usize,

    /// Vocabulary size.
    pub vocab_size: usize,

    /// Qualified name of the output projection, never targeted by `all-linear`.
    #[serde(default = "default_output_layer")]
    pub output_layer_name: String,

    /// Qualified name of the input token embedding.
    #[serde(default = "default_word_embeddings")]
    pub word_embeddings_name: String,
}

fn default_output_layer() -> String {
    "lm_head".into()
}

fn default_word_embeddings() -> String {
    "model.embed_tokens".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: "llama".into(),
            name_or_path: None,
            hidden_size: 768,
            num_attention_heads: 12,
            num_hidden_layers: 12,
            vocab_size: 32000,
            output_layer_name: default_output_layer(),
            word_embeddings_name: default_word_embeddings(),
        }
    }
}

/// Inputs of one forward call.
#[derive(Debug, Clone, Default)]
pub struct ModelInput {
    /// Token ids, `[batch, seq]`.
    pub input_ids: Option<Tensor>,
    /// Precomputed input embeddings, `[batch, seq, hidden]`.
    pub inputs_embeds: Option<Tensor>,
    /// `1` for positions to attend to, `[batch, past + seq]`.
    pub attention_mask: Option<Tensor>,
    /// Target ids; `-100` marks ignored positions.
    pub labels: Option<Tensor>,
    /// Per-layer cached keys and values.
    pub past_key_values: Option<Vec<KeyValue>>,
    /// Explicit positions.
    pub position_ids: Option<Tensor>,
    /// Segment ids.
    pub token_type_ids: Option<Tensor>,
}

impl ModelInput {
    /// Input consisting of token ids only.
    #[must_use]
    pub fn from_ids(input_ids: Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Default::default()
        }
    }

    /// Attach an attention mask.
    #[must_use]
    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    /// Attach labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    /// Batch size, from ids or embeddings.
    ///
    /// # Errors
    /// Returns an error if neither ids nor embeddings are set.
    pub fn batch_size(&self) -> Result<usize> {
        match (&self.input_ids, &self.inputs_embeds) {
            (Some(ids), _) => Ok(ids.dim(0)?),
            (None, Some(embeds)) => Ok(embeds.dim(0)?),
            (None, None) => Err(PeftError::InvalidConfig(
                "either input_ids or inputs_embeds must be provided".into(),
            )),
        }
    }
}

/// Outputs of one forward call.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Unnormalized scores, `[batch, seq, vocab]`.
    pub logits: Tensor,
    /// Loss, when labels were given and the model computes one.
    pub loss: Option<Tensor>,
}

/// A network adapters can be injected into.
pub trait BaseModel {
    /// Structural hints.
    fn config(&self) -> &ModelConfig;

    /// The module tree.
    fn modules(&self) -> &Container;

    /// The mutable module tree.
    fn modules_mut(&mut self) -> &mut Container;

    /// Forward pass reading every layer from [`BaseModel::modules`].
    ///
    /// # Errors
    /// Returns an error if the inputs are inconsistent or a layer fails.
    fn forward(&self, input: &ModelInput, ctx: &ForwardContext) -> Result<ModelOutput>;

    /// The input token embedding, looking through adapter wrappers.
    ///
    /// # Errors
    /// Returns an error if the module is missing or is not an embedding.
    fn word_embeddings(&self) -> Result<&candle_nn::Embedding> {
        let name = &self.config().word_embeddings_name;
        match self.modules().module(name)? {
            Module::Embedding(e) => Ok(e),
            Module::Adapted(t) => match t.base_layer() {
                BaseLayer::Embedding(e) => Ok(e),
                other => Err(not_an_embedding(name, &other.kind().to_string())),
            },
            other => Err(not_an_embedding(name, &other.kind().to_string())),
        }
    }

    /// Embed `input_ids` through the (possibly adapted) embedding module.
    ///
    /// # Errors
    /// Returns an error if the module is missing or the lookup fails.
    fn embed(&self, input_ids: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.modules()
            .module(&self.config().word_embeddings_name)?
            .forward(input_ids, ctx)
    }
}

fn not_an_embedding(name: &str, kind: &str) -> PeftError {
    PeftError::InvalidConfig(format!("{name} is a {kind}, not an embedding"))
}
