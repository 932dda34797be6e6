//! Configuration types for PEFT adapters.
//!
//! Every adapter is declared by a [`PeftConfig`], a tagged union over the
//! supported families. The tag is persisted as `peft_type` so a saved
//! `adapter_config.json` carries everything needed to re-inject the adapter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::adapters::adaption_prompt::AdaptionPromptConfig;
use crate::adapters::ia3::Ia3Config;
use crate::adapters::lora::LoraConfig;
use crate::adapters::miss::MissConfig;
use crate::adapters::prefix_tuning::PrefixTuningConfig;
use crate::adapters::prompt_encoder::PromptEncoderConfig;
use crate::adapters::prompt_tuning::PromptTuningConfig;
use crate::adapters::trainable_tokens::TrainableTokensConfig;
use crate::error::{PeftError, Result};
use crate::model::ModelConfig;
use crate::traits::AdapterConfig;

/// Adapter family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeftType {
    /// Low-rank adaptation.
    #[serde(rename = "LORA")]
    Lora,
    /// Learned rescaling vectors.
    #[serde(rename = "IA3")]
    Ia3,
    /// Shared shard blocks.
    #[serde(rename = "MISS")]
    Miss,
    /// Sparse deltas on selected embedding rows.
    #[serde(rename = "TRAINABLE_TOKENS")]
    TrainableTokens,
    /// Gated attention over a learned prompt inside attention modules.
    #[serde(rename = "ADAPTION_PROMPT")]
    AdaptionPrompt,
    /// Learned virtual-token embeddings.
    #[serde(rename = "PROMPT_TUNING")]
    PromptTuning,
    /// Virtual tokens produced by an MLP prompt encoder.
    #[serde(rename = "P_TUNING")]
    PTuning,
    /// Learned key/value prefixes for every attention layer.
    #[serde(rename = "PREFIX_TUNING")]
    PrefixTuning,
}

impl PeftType {
    /// Whether the family operates on the input stream rather than on weights.
    #[must_use]
    pub fn is_prompt_learning(self) -> bool {
        matches!(self, Self::PromptTuning | Self::PTuning | Self::PrefixTuning)
    }

    /// Whether adapters of this family can be folded into the base weights.
    #[must_use]
    pub fn supports_merge(self) -> bool {
        matches!(
            self,
            Self::Lora | Self::Ia3 | Self::Miss | Self::TrainableTokens
        )
    }
}

impl fmt::Display for PeftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Lora => "LORA",
            Self::Ia3 => "IA3",
            Self::Miss => "MISS",
            Self::TrainableTokens => "TRAINABLE_TOKENS",
            Self::AdaptionPrompt => "ADAPTION_PROMPT",
            Self::PromptTuning => "PROMPT_TUNING",
            Self::PTuning => "P_TUNING",
            Self::PrefixTuning => "PREFIX_TUNING",
        };
        f.write_str(tag)
    }
}

/// Downstream task the adapter was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Decoder-only language modeling.
    CausalLm,
    /// Encoder-decoder language modeling.
    #[serde(rename = "SEQ_2_SEQ_LM")]
    Seq2SeqLm,
    /// Sequence classification.
    SeqCls,
    /// Token classification.
    TokenCls,
    /// Extractive question answering.
    QuestionAns,
    /// Embedding extraction.
    FeatureExtraction,
}

/// Which bias parameters stay trainable next to the adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    /// No bias is trained.
    #[default]
    None,
    /// Every bias of the model is trained.
    All,
    /// Only biases of adapter-wrapped modules are trained.
    LoraOnly,
}

/// Module selector for `target_modules` / `exclude_modules`.
///
/// A list matches a module whose qualified name equals an entry or ends with
/// `.` followed by an entry. A single string is a regex that must match the
/// whole name, except for the special value `all-linear`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SelectorRepr", into = "SelectorRepr")]
pub enum TargetModules {
    /// Exact or suffix names.
    Names(Vec<String>),
    /// Full-match regular expression.
    Regex(String),
    /// Every linear module except the output layer.
    AllLinear,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SelectorRepr {
    Pattern(String),
    Names(Vec<String>),
}

const ALL_LINEAR: &str = "all-linear";

impl From<SelectorRepr> for TargetModules {
    fn from(repr: SelectorRepr) -> Self {
        match repr {
            SelectorRepr::Pattern(p) if p == ALL_LINEAR => Self::AllLinear,
            SelectorRepr::Pattern(p) => Self::Regex(p),
            SelectorRepr::Names(names) => Self::Names(names),
        }
    }
}

impl From<TargetModules> for SelectorRepr {
    fn from(selector: TargetModules) -> Self {
        match selector {
            TargetModules::Names(names) => Self::Names(names),
            TargetModules::Regex(p) => Self::Pattern(p),
            TargetModules::AllLinear => Self::Pattern(ALL_LINEAR.into()),
        }
    }
}

impl TargetModules {
    /// Build a name-list selector.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// Build a regex selector.
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::Regex(pattern.into())
    }

    /// Whether this selector is a free-form regex.
    #[must_use]
    pub fn is_regex(&self) -> bool {
        matches!(self, Self::Regex(_))
    }

    /// Merge two selectors into one that matches the union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::AllLinear, _) | (_, Self::AllLinear) => Self::AllLinear,
            (Self::Names(a), Self::Names(b)) => {
                let mut names = a.clone();
                for name in b {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                Self::Names(names)
            }
            (a, b) => Self::Regex(format!("(?:{})|(?:{})", a.as_regex(), b.as_regex())),
        }
    }

    fn as_regex(&self) -> String {
        match self {
            Self::Regex(p) => p.clone(),
            Self::Names(names) => {
                let alts: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
                format!("(?:.*\\.)?(?:{})", alts.join("|"))
            }
            Self::AllLinear => ".*".into(),
        }
    }
}

impl fmt::Display for TargetModules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Names(names) => write!(f, "{names:?}"),
            Self::Regex(p) => write!(f, "'{p}'"),
            Self::AllLinear => f.write_str(ALL_LINEAR),
        }
    }
}

/// Bookkeeping fields shared by every adapter family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeftMeta {
    /// Identifier of the base model the adapter was created for.
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,

    /// Revision of the base model.
    #[serde(default)]
    pub revision: Option<String>,

    /// Task the adapter targets.
    #[serde(default)]
    pub task_type: Option<TaskType>,

    /// Adapters loaded in inference mode are frozen.
    #[serde(default)]
    pub inference_mode: bool,
}

/// Injection fields shared by the reparameterization families.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Modules to wrap; `None` uses the architecture defaults.
    #[serde(default)]
    pub target_modules: Option<TargetModules>,

    /// Modules never wrapped, even if targeted.
    #[serde(default)]
    pub exclude_modules: Option<TargetModules>,

    /// Only wrap modules inside these layer indices.
    #[serde(default)]
    pub layers_to_transform: Option<Vec<usize>>,

    /// Name of the layer container used to find layer indices.
    #[serde(default)]
    pub layers_pattern: Option<String>,

    /// Modules kept fully trainable and saved with the adapter.
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,

    /// Bias training policy.
    #[serde(default)]
    pub bias: Bias,
}

impl AdapterConfig for TunerConfig {
    fn validate(&self) -> Result<()> {
        if let Some(TargetModules::Names(names)) = &self.target_modules {
            if names.is_empty() {
                return Err(PeftError::InvalidConfig(
                    "target_modules cannot be empty".into(),
                ));
            }
        }
        if let Some(TargetModules::Regex(pattern)) = &self.target_modules {
            if self.layers_to_transform.is_some() {
                return Err(PeftError::InvalidConfig(
                    "`layers_to_transform` cannot be used when `target_modules` is a str".into(),
                ));
            }
            if self.layers_pattern.is_some() {
                return Err(PeftError::InvalidConfig(
                    "`layers_pattern` cannot be used when `target_modules` is a str".into(),
                ));
            }
            regex::Regex::new(pattern).map_err(|e| {
                PeftError::InvalidConfig(format!("target_modules is not a valid regex: {e}"))
            })?;
        }
        match &self.exclude_modules {
            Some(TargetModules::AllLinear) => {
                return Err(PeftError::InvalidConfig(
                    "exclude_modules cannot be 'all-linear'".into(),
                ));
            }
            Some(TargetModules::Regex(pattern)) => {
                regex::Regex::new(pattern).map_err(|e| {
                    PeftError::InvalidConfig(format!("exclude_modules is not a valid regex: {e}"))
                })?;
            }
            _ => {}
        }
        if self.layers_pattern.is_some() && self.layers_to_transform.is_none() {
            return Err(PeftError::InvalidConfig(
                "when `layers_pattern` is specified, `layers_to_transform` must also be specified"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Fields shared by the prompt-injection families.
///
/// Structural hints left as `None` are filled from the base model when the
/// adapter is added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptLearningConfig {
    /// Number of virtual tokens.
    pub num_virtual_tokens: usize,

    /// Hidden size of the base model embeddings.
    #[serde(default)]
    pub token_dim: Option<usize>,

    /// Number of transformer stacks the prompt feeds (1 for decoder-only).
    #[serde(default)]
    pub num_transformer_submodules: Option<usize>,

    /// Attention heads of the base model.
    #[serde(default)]
    pub num_attention_heads: Option<usize>,

    /// Transformer layers of the base model.
    #[serde(default)]
    pub num_layers: Option<usize>,

    /// Modules kept fully trainable and saved with the adapter.
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
}

impl Default for PromptLearningConfig {
    fn default() -> Self {
        Self {
            num_virtual_tokens: 20,
            token_dim: None,
            num_transformer_submodules: None,
            num_attention_heads: None,
            num_layers: None,
            modules_to_save: None,
        }
    }
}

impl PromptLearningConfig {
    /// Fill unset structural hints from the base model.
    pub fn fill_from_model(&mut self, model: &ModelConfig) {
        self.token_dim.get_or_insert(model.hidden_size);
        self.num_attention_heads.get_or_insert(model.num_attention_heads);
        self.num_layers.get_or_insert(model.num_hidden_layers);
        self.num_transformer_submodules.get_or_insert(1);
    }

    /// Hidden size, once resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if `token_dim` has not been resolved yet.
    pub fn token_dim(&self) -> Result<usize> {
        self.token_dim
            .ok_or_else(|| PeftError::InvalidConfig("token_dim is not set".into()))
    }

    /// Attention head count, once resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_attention_heads` has not been resolved yet.
    pub fn num_attention_heads(&self) -> Result<usize> {
        self.num_attention_heads
            .ok_or_else(|| PeftError::InvalidConfig("num_attention_heads is not set".into()))
    }

    /// Layer count, once resolved.
    ///
    /// # Errors
    ///
    /// Returns an error if `num_layers` has not been resolved yet.
    pub fn num_layers(&self) -> Result<usize> {
        self.num_layers
            .ok_or_else(|| PeftError::InvalidConfig("num_layers is not set".into()))
    }
}

impl AdapterConfig for PromptLearningConfig {
    fn validate(&self) -> Result<()> {
        if self.num_virtual_tokens == 0 {
            return Err(PeftError::InvalidConfig(
                "num_virtual_tokens must be > 0".into(),
            ));
        }
        if matches!(self.token_dim, Some(0)) {
            return Err(PeftError::InvalidConfig("token_dim must be > 0".into()));
        }
        if let (Some(dim), Some(heads)) = (self.token_dim, self.num_attention_heads) {
            if heads == 0 || dim % heads != 0 {
                return Err(PeftError::InvalidConfig(format!(
                    "token_dim {dim} must be divisible by num_attention_heads {heads}"
                )));
            }
        }
        if matches!(self.num_transformer_submodules, Some(n) if n != 1) {
            return Err(PeftError::InvalidConfig(
                "only decoder-only prompt learning (num_transformer_submodules = 1) is supported"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Declarative adapter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "peft_type")]
pub enum PeftConfig {
    /// Low-rank adaptation.
    #[serde(rename = "LORA")]
    Lora(LoraConfig),
    /// Learned rescaling vectors.
    #[serde(rename = "IA3")]
    Ia3(Ia3Config),
    /// Shared shard blocks.
    #[serde(rename = "MISS")]
    Miss(MissConfig),
    /// Sparse embedding-row deltas.
    #[serde(rename = "TRAINABLE_TOKENS")]
    TrainableTokens(TrainableTokensConfig),
    /// Attention-prompt injection.
    #[serde(rename = "ADAPTION_PROMPT")]
    AdaptionPrompt(AdaptionPromptConfig),
    /// Prompt tuning.
    #[serde(rename = "PROMPT_TUNING")]
    PromptTuning(PromptTuningConfig),
    /// P-tuning with an MLP prompt encoder.
    #[serde(rename = "P_TUNING")]
    PTuning(PromptEncoderConfig),
    /// Prefix tuning.
    #[serde(rename = "PREFIX_TUNING")]
    PrefixTuning(PrefixTuningConfig),
}

impl PeftConfig {
    /// Family tag.
    #[must_use]
    pub fn peft_type(&self) -> PeftType {
        match self {
            Self::Lora(_) => PeftType::Lora,
            Self::Ia3(_) => PeftType::Ia3,
            Self::Miss(_) => PeftType::Miss,
            Self::TrainableTokens(_) => PeftType::TrainableTokens,
            Self::AdaptionPrompt(_) => PeftType::AdaptionPrompt,
            Self::PromptTuning(_) => PeftType::PromptTuning,
            Self::PTuning(_) => PeftType::PTuning,
            Self::PrefixTuning(_) => PeftType::PrefixTuning,
        }
    }

    /// Whether this is a prompt-injection family.
    #[must_use]
    pub fn is_prompt_learning(&self) -> bool {
        self.peft_type().is_prompt_learning()
    }

    /// Shared bookkeeping fields.
    #[must_use]
    pub fn meta(&self) -> &PeftMeta {
        match self {
            Self::Lora(c) => &c.meta,
            Self::Ia3(c) => &c.meta,
            Self::Miss(c) => &c.meta,
            Self::TrainableTokens(c) => &c.meta,
            Self::AdaptionPrompt(c) => &c.meta,
            Self::PromptTuning(c) => &c.meta,
            Self::PTuning(c) => &c.meta,
            Self::PrefixTuning(c) => &c.meta,
        }
    }

    /// Mutable shared bookkeeping fields.
    pub fn meta_mut(&mut self) -> &mut PeftMeta {
        match self {
            Self::Lora(c) => &mut c.meta,
            Self::Ia3(c) => &mut c.meta,
            Self::Miss(c) => &mut c.meta,
            Self::TrainableTokens(c) => &mut c.meta,
            Self::AdaptionPrompt(c) => &mut c.meta,
            Self::PromptTuning(c) => &mut c.meta,
            Self::PTuning(c) => &mut c.meta,
            Self::PrefixTuning(c) => &mut c.meta,
        }
    }

    /// Injection fields, for families that wrap individual modules.
    #[must_use]
    pub fn tuner(&self) -> Option<&TunerConfig> {
        match self {
            Self::Lora(c) => Some(&c.tuner),
            Self::Ia3(c) => Some(&c.tuner),
            Self::Miss(c) => Some(&c.tuner),
            Self::TrainableTokens(c) => Some(&c.tuner),
            _ => None,
        }
    }

    /// Prompt fields, for prompt-injection families.
    #[must_use]
    pub fn prompt(&self) -> Option<&PromptLearningConfig> {
        match self {
            Self::PromptTuning(c) => Some(&c.prompt),
            Self::PTuning(c) => Some(&c.prompt),
            Self::PrefixTuning(c) => Some(&c.prompt),
            _ => None,
        }
    }

    /// Mutable prompt fields.
    pub fn prompt_mut(&mut self) -> Option<&mut PromptLearningConfig> {
        match self {
            Self::PromptTuning(c) => Some(&mut c.prompt),
            Self::PTuning(c) => Some(&mut c.prompt),
            Self::PrefixTuning(c) => Some(&mut c.prompt),
            _ => None,
        }
    }

    /// Modules kept trainable next to the adapter.
    #[must_use]
    pub fn modules_to_save(&self) -> &[String] {
        let modules = match self {
            Self::AdaptionPrompt(_) => None,
            _ => self
                .tuner()
                .map(|t| t.modules_to_save.as_ref())
                .or_else(|| self.prompt().map(|p| p.modules_to_save.as_ref()))
                .flatten(),
        };
        modules.map_or(&[], Vec::as_slice)
    }

    /// Bias policy; prompt families never train biases.
    #[must_use]
    pub fn bias(&self) -> Bias {
        self.tuner().map_or(Bias::None, |t| t.bias)
    }

    /// Whether the adapter is frozen for inference.
    #[must_use]
    pub fn inference_mode(&self) -> bool {
        self.meta().inference_mode
    }
}

impl AdapterConfig for PeftConfig {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Lora(c) => c.validate(),
            Self::Ia3(c) => c.validate(),
            Self::Miss(c) => c.validate(),
            Self::TrainableTokens(c) => c.validate(),
            Self::AdaptionPrompt(c) => c.validate(),
            Self::PromptTuning(c) => c.validate(),
            Self::PTuning(c) => c.validate(),
            Self::PrefixTuning(c) => c.validate(),
        }
    }
}

impl From<LoraConfig> for PeftConfig {
    fn from(c: LoraConfig) -> Self {
        Self::Lora(c)
    }
}

impl From<Ia3Config> for PeftConfig {
    fn from(c: Ia3Config) -> Self {
        Self::Ia3(c)
    }
}

impl From<MissConfig> for PeftConfig {
    fn from(c: MissConfig) -> Self {
        Self::Miss(c)
    }
}

impl From<TrainableTokensConfig> for PeftConfig {
    fn from(c: TrainableTokensConfig) -> Self {
        Self::TrainableTokens(c)
    }
}

impl From<AdaptionPromptConfig> for PeftConfig {
    fn from(c: AdaptionPromptConfig) -> Self {
        Self::AdaptionPrompt(c)
    }
}

impl From<PromptTuningConfig> for PeftConfig {
    fn from(c: PromptTuningConfig) -> Self {
        Self::PromptTuning(c)
    }
}

impl From<PromptEncoderConfig> for PeftConfig {
    fn from(c: PromptEncoderConfig) -> Self {
        Self::PTuning(c)
    }
}

impl From<PrefixTuningConfig> for PeftConfig {
    fn from(c: PrefixTuningConfig) -> Self {
        Self::PrefixTuning(c)
    }
}

/// Default targets per architecture when a config leaves `target_modules` unset.
#[must_use]
pub fn default_target_modules(peft_type: PeftType, model_type: &str) -> Option<TargetModules> {
    let names: &[&str] = match (peft_type, model_type) {
        (PeftType::Lora | PeftType::Miss, "llama" | "mistral" | "qwen2" | "gemma") => {
            &["q_proj", "v_proj"]
        }
        (PeftType::Lora, "gpt2") => &["c_attn"],
        (PeftType::Lora | PeftType::Miss, "bert" | "roberta") => &["query", "value"],
        (PeftType::Ia3, "llama" | "mistral" | "qwen2" | "gemma") => {
            &["k_proj", "v_proj", "down_proj"]
        }
        (PeftType::Ia3, "bert" | "roberta") => &["key", "value", "output.dense"],
        (PeftType::TrainableTokens, _) => &["embed_tokens"],
        _ => return None,
    };
    Some(TargetModules::names(names.iter().copied()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_serde_forms() {
        let names: TargetModules = serde_json::from_str(r#"["q_proj", "v_proj"]"#).unwrap();
        assert_eq!(names, TargetModules::names(["q_proj", "v_proj"]));

        let regex: TargetModules = serde_json::from_str(r#"".*\\.q_proj""#).unwrap();
        assert!(regex.is_regex());

        let all: TargetModules = serde_json::from_str(r#""all-linear""#).unwrap();
        assert_eq!(all, TargetModules::AllLinear);
        assert_eq!(serde_json::to_string(&all).unwrap(), r#""all-linear""#);
    }

    #[test]
    fn test_regex_with_layers_to_transform_rejected() {
        let config = TunerConfig {
            target_modules: Some(TargetModules::regex(".*q_proj")),
            layers_to_transform: Some(vec![0]),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("layers_to_transform"));
    }

    #[test]
    fn test_layers_pattern_requires_layers() {
        let config = TunerConfig {
            target_modules: Some(TargetModules::names(["q_proj"])),
            layers_pattern: Some("layers".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_union_of_name_lists() {
        let a = TargetModules::names(["q_proj", "v_proj"]);
        let b = TargetModules::names(["v_proj", "k_proj"]);
        assert_eq!(a.union(&b), TargetModules::names(["q_proj", "v_proj", "k_proj"]));
    }

    #[test]
    fn test_union_with_regex_matches_both() {
        let a = TargetModules::names(["q_proj"]);
        let b = TargetModules::regex(r".*\.up_proj");
        let TargetModules::Regex(pattern) = a.union(&b) else {
            panic!("expected regex union");
        };
        let re = regex::Regex::new(&format!("^(?:{pattern})$")).unwrap();
        assert!(re.is_match("layers.0.self_attn.q_proj"));
        assert!(re.is_match("layers.1.mlp.up_proj"));
        assert!(!re.is_match("layers.1.mlp.down_proj"));
    }

    #[test]
    fn test_peft_config_round_trip_keeps_tag() {
        let config = PeftConfig::from(LoraConfig::default());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""peft_type":"LORA""#));
        let back: PeftConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_prompt_learning_flag() {
        assert!(PeftType::PrefixTuning.is_prompt_learning());
        assert!(!PeftType::Lora.is_prompt_learning());
        assert!(!PeftType::AdaptionPrompt.supports_merge());
    }
}
