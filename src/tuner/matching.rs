//! Target-module matching.
//!
//! Decides, from a qualified module name, whether an adapter config applies:
//! - name lists match exactly or by `.`-separated suffix
//! - a regex selector must match the whole name
//! - `all-linear` selects every linear module but the output layer
//! - `layers_to_transform` restricts matches to selected layer indices

use regex::Regex;

use crate::config::{TargetModules, TunerConfig};
use crate::error::{PeftError, Result};
use crate::layers::ModuleKind;

/// Layer containers tried when `layers_pattern` is not set.
pub const DEFAULT_LAYERS_PATTERNS: [&str; 5] = ["layers", "h", "block", "blocks", "layer"];

/// Pattern for matching module names.
#[derive(Debug, Clone)]
pub enum ModulePattern {
    /// Match `name == t` or a name ending with `.t`.
    Names(Vec<String>),
    /// Match the whole name against a regex.
    Regex(Regex),
    /// Match every linear module except the output layer.
    AllLinear {
        /// Name of the output layer
        output_layer: String,
    },
}

impl ModulePattern {
    /// Compile a selector.
    ///
    /// # Errors
    /// Returns an error if a regex selector does not compile.
    pub fn compile(selector: &TargetModules, output_layer: &str) -> Result<Self> {
        Ok(match selector {
            TargetModules::Names(names) => Self::Names(names.clone()),
            TargetModules::Regex(pattern) => Self::Regex(full_match(pattern)?),
            TargetModules::AllLinear => Self::AllLinear {
                output_layer: output_layer.to_string(),
            },
        })
    }

    /// Check if a module matches this pattern.
    #[must_use]
    pub fn matches(&self, module_name: &str, kind: ModuleKind) -> bool {
        match self {
            Self::Names(names) => names.iter().any(|t| name_matches(module_name, t)),
            Self::Regex(re) => re.is_match(module_name),
            Self::AllLinear { output_layer } => {
                kind == ModuleKind::Linear && !name_matches(module_name, output_layer)
            }
        }
    }
}

/// `name == target` or `name` ends with `.target`.
#[must_use]
pub fn name_matches(name: &str, target: &str) -> bool {
    name == target
        || name
            .strip_suffix(target)
            .is_some_and(|head| head.ends_with('.'))
}

fn full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| PeftError::InvalidConfig(format!("invalid module regex '{pattern}': {e}")))
}

/// Index of the transformer layer a module lives in.
///
/// Looks for `<pattern>.<index>.` in the name, trying `patterns` in order.
#[must_use]
pub fn layer_index(module_name: &str, patterns: &[&str]) -> Option<usize> {
    patterns.iter().find_map(|pattern| {
        let re = Regex::new(&format!(r"^(?:.*\.)?{}\.(\d+)\.", regex::escape(pattern))).ok()?;
        re.captures(module_name)?.get(1)?.as_str().parse().ok()
    })
}

/// Compiled target, exclusion and layer filters of one adapter config.
#[derive(Debug, Clone)]
pub struct ModuleMatcher {
    targets: ModulePattern,
    exclude: Option<ModulePattern>,
    layers_to_transform: Option<Vec<usize>>,
    layers_pattern: Option<String>,
}

impl ModuleMatcher {
    /// Compile the matching rules of a tuner config.
    ///
    /// # Errors
    /// Returns an error if a selector is invalid.
    pub fn new(config: &TunerConfig, targets: &TargetModules, output_layer: &str) -> Result<Self> {
        if targets.is_regex()
            && (config.layers_to_transform.is_some() || config.layers_pattern.is_some())
        {
            return Err(PeftError::InvalidConfig(
                "`layers_to_transform` and `layers_pattern` cannot be used when `target_modules` is a str"
                    .into(),
            ));
        }
        let exclude = config
            .exclude_modules
            .as_ref()
            .map(|e| ModulePattern::compile(e, output_layer))
            .transpose()?;
        Ok(Self {
            targets: ModulePattern::compile(targets, output_layer)?,
            exclude,
            layers_to_transform: config.layers_to_transform.clone(),
            layers_pattern: config.layers_pattern.clone(),
        })
    }

    /// Whether the module is excluded explicitly.
    #[must_use]
    pub fn is_excluded(&self, module_name: &str, kind: ModuleKind) -> bool {
        self.exclude
            .as_ref()
            .is_some_and(|e| e.matches(module_name, kind))
    }

    /// Whether the module should be wrapped.
    #[must_use]
    pub fn matches(&self, module_name: &str, kind: ModuleKind) -> bool {
        if self.is_excluded(module_name, kind) || !self.targets.matches(module_name, kind) {
            return false;
        }
        let Some(layers) = &self.layers_to_transform else {
            return true;
        };
        let index = match &self.layers_pattern {
            Some(pattern) => layer_index(module_name, &[pattern.as_str()]),
            None => layer_index(module_name, &DEFAULT_LAYERS_PATTERNS),
        };
        index.is_some_and(|i| layers.contains(&i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_suffix_matching() {
        assert!(name_matches("model.layers.0.self_attn.q_proj", "q_proj"));
        assert!(name_matches("q_proj", "q_proj"));
        assert!(name_matches("model.layers.0.self_attn.q_proj", "self_attn.q_proj"));
        assert!(!name_matches("model.layers.0.self_attn.xq_proj", "q_proj"));
    }

    #[test]
    fn test_regex_must_match_whole_name() -> Result<()> {
        let pattern = ModulePattern::compile(&TargetModules::regex(r".*\.q_proj"), "lm_head")?;
        assert!(pattern.matches("model.layers.0.self_attn.q_proj", ModuleKind::Linear));
        assert!(!pattern.matches("model.layers.0.self_attn.q_proj.extra", ModuleKind::Linear));

        let partial = ModulePattern::compile(&TargetModules::regex("q_proj"), "lm_head")?;
        assert!(!partial.matches("model.layers.0.self_attn.q_proj", ModuleKind::Linear));
        Ok(())
    }

    #[test]
    fn test_all_linear_skips_output_layer() -> Result<()> {
        let pattern = ModulePattern::compile(&TargetModules::AllLinear, "lm_head")?;
        assert!(pattern.matches("model.layers.0.mlp.up_proj", ModuleKind::Linear));
        assert!(!pattern.matches("lm_head", ModuleKind::Linear));
        assert!(!pattern.matches("model.embed_tokens", ModuleKind::Embedding));
        Ok(())
    }

    #[test]
    fn test_layer_index_patterns() {
        assert_eq!(layer_index("model.layers.3.mlp.up_proj", &DEFAULT_LAYERS_PATTERNS), Some(3));
        assert_eq!(layer_index("transformer.h.11.attn.c_attn", &DEFAULT_LAYERS_PATTERNS), Some(11));
        assert_eq!(layer_index("lm_head", &DEFAULT_LAYERS_PATTERNS), None);
        assert_eq!(layer_index("model.layers.3.mlp.up_proj", &["blocks"]), None);
    }

    #[test]
    fn test_layers_to_transform_filter() -> Result<()> {
        let config = TunerConfig {
            layers_to_transform: Some(vec![1]),
            ..Default::default()
        };
        let matcher = ModuleMatcher::new(&config, &TargetModules::names(["q_proj"]), "lm_head")?;
        assert!(!matcher.matches("model.layers.0.self_attn.q_proj", ModuleKind::Linear));
        assert!(matcher.matches("model.layers.1.self_attn.q_proj", ModuleKind::Linear));
        Ok(())
    }

    #[test]
    fn test_exclude_wins() -> Result<()> {
        let config = TunerConfig {
            exclude_modules: Some(TargetModules::names(["layers.0.self_attn.q_proj"])),
            ..Default::default()
        };
        let matcher = ModuleMatcher::new(&config, &TargetModules::names(["q_proj"]), "lm_head")?;
        assert!(!matcher.matches("model.layers.0.self_attn.q_proj", ModuleKind::Linear));
        assert!(matcher.matches("model.layers.1.self_attn.q_proj", ModuleKind::Linear));
        Ok(())
    }

    #[test]
    fn test_regex_with_layers_rejected() {
        let config = TunerConfig {
            layers_to_transform: Some(vec![0]),
            ..Default::default()
        };
        assert!(ModuleMatcher::new(&config, &TargetModules::regex(".*"), "lm_head").is_err());
    }
}
