//! Prompt Tuning implementation.
//!
//! Prompt tuning prepends learnable soft prompts to the input embeddings.
//! Unlike prefix tuning, it only affects the input layer.
//!
//! Reference: <https://arxiv.org/abs/2104.08691>

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use serde::{Deserialize, Serialize};

use crate::config::{PeftMeta, PromptLearningConfig};
use crate::error::{PeftError, Result};
use crate::io::{take_tensor, SaveLoad};
use crate::traits::AdapterConfig;

/// Initialization strategy for the virtual-token embeddings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptTuningInit {
    /// Random initialization.
    #[default]
    Random,
    /// Copy rows of randomly chosen vocabulary tokens.
    SampleVocab,
    /// Copy rows of the tokens in `prompt_tuning_init_token_ids`.
    Text,
}

/// Configuration for prompt tuning.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PromptTuningConfig {
    /// Shared bookkeeping fields.
    #[serde(flatten)]
    pub meta: PeftMeta,

    /// Virtual-token fields.
    #[serde(flatten)]
    pub prompt: PromptLearningConfig,

    /// Initialization method.
    #[serde(default)]
    pub prompt_tuning_init: PromptTuningInit,

    /// Token ids of the initialization text, required for [`PromptTuningInit::Text`].
    #[serde(default)]
    pub prompt_tuning_init_token_ids: Option<Vec<u32>>,
}

impl AdapterConfig for PromptTuningConfig {
    fn validate(&self) -> Result<()> {
        self.prompt.validate()?;
        if self.prompt_tuning_init == PromptTuningInit::Text
            && self
                .prompt_tuning_init_token_ids
                .as_ref()
                .map_or(true, Vec::is_empty)
        {
            return Err(PeftError::InvalidConfig(
                "prompt_tuning_init TEXT requires prompt_tuning_init_token_ids".into(),
            ));
        }
        Ok(())
    }
}

/// Learned virtual-token table `[num_virtual_tokens, token_dim]`.
#[derive(Debug, Clone)]
pub struct PromptEmbedding {
    embedding: Embedding,
}

impl PromptEmbedding {
    /// Create the table, optionally seeded from the model's word embeddings.
    ///
    /// # Errors
    /// Returns error if the configuration is unresolved or a seed token id is
    /// outside the vocabulary.
    pub fn new(
        config: &PromptTuningConfig,
        word_embeddings: Option<&Embedding>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let total = config.prompt.num_virtual_tokens
            * config.prompt.num_transformer_submodules.unwrap_or(1);
        let dim = config.prompt.token_dim()?;

        let seed_ids: Option<Vec<u32>> = match (config.prompt_tuning_init, word_embeddings) {
            (PromptTuningInit::Random, _) | (_, None) => None,
            (PromptTuningInit::SampleVocab, Some(words)) => {
                let vocab = words.embeddings().dim(0)?;
                let picks = Tensor::rand(0f32, vocab as f32, total, device)?
                    .floor()?
                    .clamp(0f32, (vocab - 1) as f32)?
                    .to_dtype(DType::U32)?;
                Some(picks.to_vec1::<u32>()?)
            }
            (PromptTuningInit::Text, Some(_)) => {
                let ids = config.prompt_tuning_init_token_ids.clone().unwrap_or_default();
                // repeat the text until it covers every virtual token
                Some(ids.iter().copied().cycle().take(total).collect())
            }
        };

        let table = match seed_ids {
            Some(ids) => {
                let words = word_embeddings.ok_or_else(|| {
                    PeftError::InvalidConfig("word embeddings required for seeding".into())
                })?;
                let vocab = words.embeddings().dim(0)?;
                if let Some(bad) = ids.iter().find(|&&i| i as usize >= vocab) {
                    return Err(PeftError::InvalidConfig(format!(
                        "init token id {bad} is outside the vocabulary of {vocab}"
                    )));
                }
                let ids = Tensor::new(ids.as_slice(), device)?;
                words.embeddings().index_select(&ids, 0)?.contiguous()?
            }
            None => Tensor::randn(0f32, 1.0, (total, dim), device)?,
        };
        if table.dims() != [total, dim].as_slice() {
            return Err(PeftError::ShapeMismatch {
                expected: vec![total, dim],
                actual: table.dims().to_vec(),
            });
        }
        Ok(Self {
            embedding: Embedding::new(table, dim),
        })
    }

    /// Embeddings of the given virtual-token indices.
    ///
    /// # Errors
    /// Returns error if an index is out of range.
    pub fn forward(&self, indices: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(indices)?)
    }

    /// The raw table.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.weight().elem_count()
    }
}

impl SaveLoad for PromptEmbedding {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([(
            "embedding.weight".to_string(),
            self.weight().clone(),
        )]))
    }

    fn load_state_dict(&mut self, mut state_dict: HashMap<String, Tensor>) -> Result<()> {
        let weight = take_tensor(&mut state_dict, "embedding.weight", self.weight())?;
        let dim = weight.dim(1)?;
        self.embedding = Embedding::new(weight, dim);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(init: PromptTuningInit) -> PromptTuningConfig {
        PromptTuningConfig {
            prompt: PromptLearningConfig {
                num_virtual_tokens: 5,
                token_dim: Some(4),
                ..Default::default()
            },
            prompt_tuning_init: init,
            prompt_tuning_init_token_ids: Some(vec![2, 7]),
            ..Default::default()
        }
    }

    fn words() -> Result<Embedding> {
        let table = Tensor::arange(0f32, 40.0, &Device::Cpu)?.reshape((10, 4))?;
        Ok(Embedding::new(table, 4))
    }

    #[test]
    fn test_prompt_tuning_config_default() {
        let config = PromptTuningConfig::default();
        assert_eq!(config.prompt.num_virtual_tokens, 20);
        assert_eq!(config.prompt_tuning_init, PromptTuningInit::Random);
    }

    #[test]
    fn test_text_init_requires_ids() {
        let mut config = config(PromptTuningInit::Text);
        config.prompt_tuning_init_token_ids = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_init_shape() -> Result<()> {
        let prompt = PromptEmbedding::new(&config(PromptTuningInit::Random), None, &Device::Cpu)?;
        assert_eq!(prompt.weight().dims(), &[5, 4]);
        assert_eq!(prompt.num_parameters(), 20);
        Ok(())
    }

    #[test]
    fn test_text_init_repeats_token_rows() -> Result<()> {
        let words = words()?;
        let prompt = PromptEmbedding::new(
            &config(PromptTuningInit::Text),
            Some(&words),
            &Device::Cpu,
        )?;
        let rows = prompt.weight().to_vec2::<f32>()?;
        // ids 2, 7, 2, 7, 2
        assert_eq!(rows[0], vec![8.0, 9.0, 10.0, 11.0]);
        assert_eq!(rows[1], vec![28.0, 29.0, 30.0, 31.0]);
        assert_eq!(rows[4], rows[0]);
        Ok(())
    }

    #[test]
    fn test_sample_vocab_rows_come_from_vocab() -> Result<()> {
        let words = words()?;
        let prompt = PromptEmbedding::new(
            &config(PromptTuningInit::SampleVocab),
            Some(&words),
            &Device::Cpu,
        )?;
        for row in prompt.weight().to_vec2::<f32>()? {
            // every vocab row starts at a multiple of 4
            assert!((row[0] % 4.0).abs() < f32::EPSILON);
        }
        Ok(())
    }
}
