//! Building a new LoRA adapter from a weighted combination of existing ones.
//!
//! Three policies are available:
//! - [`CombinationType::Linear`]: sources share a rank, factors are summed
//!   with the square root of each weight on both sides.
//! - [`CombinationType::Cat`]: factors are stacked along the rank dimension,
//!   which reproduces the weighted sum of deltas exactly.
//! - [`CombinationType::Svd`]: the weighted sum of deltas is rebuilt and
//!   re-factored with a truncated SVD.

use std::collections::BTreeSet;

use candle_core::Tensor;
use tracing::{debug, warn};

use super::{LayerAdapter, TunerModel};
use crate::adapters::lora::{LoraAdapter, LoraConfig, LoraInitialization};
use crate::config::{Bias, PeftConfig, TargetModules};
use crate::error::{PeftError, Result};
use crate::linalg::{quantile, truncated_svd};
use crate::model::BaseModel;

/// How source adapters are combined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CombinationType {
    /// Weighted sum inside the shared low-rank space. Needs equal ranks.
    Linear,
    /// Concatenate the weighted factors; the new rank is the sum of ranks.
    Cat,
    /// Re-factor the weighted sum of full deltas.
    Svd {
        /// Target rank; defaults to the largest source rank.
        rank: Option<usize>,
        /// Quantile at which factor entries are clamped, e.g. `0.99`.
        clamp: Option<f64>,
    },
}

impl Default for CombinationType {
    fn default() -> Self {
        Self::Svd {
            rank: None,
            clamp: None,
        }
    }
}

/// Combined factors of one layer, laid out like the layer's LoRA factors.
#[derive(Debug)]
struct Factors {
    a: Tensor,
    b: Tensor,
}

impl<M: BaseModel> TunerModel<M> {
    /// Register `new_name` as a weighted combination of LoRA `adapters`.
    ///
    /// The new adapter uses a scaling of one, targets the union of the
    /// sources' targets and is not activated. Layers that carry none of the
    /// sources get a zero delta.
    ///
    /// # Errors
    ///
    /// Fails before any state change if a source is unknown or not LoRA,
    /// `weights` does not match `adapters`, `new_name` exists, or the ranks
    /// differ for [`CombinationType::Linear`].
    pub fn add_weighted_adapter(
        &mut self,
        adapters: &[String],
        weights: &[f64],
        new_name: &str,
        combination: CombinationType,
    ) -> Result<()> {
        let sources = self.lora_sources(adapters, weights, new_name)?;
        if let CombinationType::Svd {
            clamp: Some(clamp), ..
        } = combination
        {
            if !(0.0..=1.0).contains(&clamp) {
                return Err(PeftError::InvalidConfig(format!(
                    "svd clamp must be a quantile in [0, 1], got {clamp}"
                )));
            }
        }

        let nominal_rank = match combination {
            CombinationType::Linear => {
                let distinct: BTreeSet<usize> = self.layer_ranks(adapters).into_iter().collect();
                if distinct.len() > 1 {
                    return Err(PeftError::RankMismatch {
                        ranks: distinct.into_iter().collect(),
                    });
                }
                distinct.into_iter().next().unwrap_or(sources[0].r)
            }
            CombinationType::Cat => sources.iter().map(|c| c.r).sum(),
            CombinationType::Svd { rank, .. } => {
                rank.unwrap_or_else(|| sources.iter().map(|c| c.r).max().unwrap_or(1))
            }
        };
        if nominal_rank == 0 {
            return Err(PeftError::InvalidConfig("combined rank must be > 0".into()));
        }

        let mut plan = Vec::new();
        for path in self.tuner_layer_names() {
            let Some(layer) = self.tuner_layer(&path) else {
                continue;
            };
            let present: Vec<(&LoraAdapter, f64)> = adapters
                .iter()
                .zip(weights)
                .filter_map(|(name, w)| Some((layer.adapter(name)?.as_lora()?, *w)))
                .collect();
            if present.is_empty() {
                continue;
            }
            let factors = match combination {
                CombinationType::Linear => linear_factors(&present)?,
                CombinationType::Cat => cat_factors(&present)?,
                CombinationType::Svd { rank, clamp } => {
                    let rank = rank
                        .unwrap_or_else(|| present.iter().map(|(a, _)| a.rank()).max().unwrap_or(1));
                    svd_factors(&present, rank, clamp)?
                }
            };
            plan.push((path, factors));
        }

        let config = combined_config(&sources, nominal_rank, &plan)?;
        self.inject_adapter(new_name, config.clone().into())?;
        if let Err(e) = self.install_factors(new_name, &config, plan) {
            warn!(adapter = new_name, error = %e, "removing partially combined adapter");
            self.delete_adapter(new_name)?;
            return Err(e);
        }
        debug!(adapter = new_name, sources = ?adapters, ?combination, "added weighted adapter");
        Ok(())
    }

    fn lora_sources(
        &self,
        adapters: &[String],
        weights: &[f64],
        new_name: &str,
    ) -> Result<Vec<&LoraConfig>> {
        if adapters.is_empty() {
            return Err(PeftError::InvalidConfig(
                "at least one adapter is needed for a weighted combination".into(),
            ));
        }
        if adapters.len() != weights.len() {
            return Err(PeftError::InvalidConfig(format!(
                "got {} adapters but {} weights",
                adapters.len(),
                weights.len()
            )));
        }
        if self.registry.contains_adapter(new_name) {
            return Err(PeftError::AdapterExists {
                name: new_name.to_string(),
            });
        }
        adapters
            .iter()
            .map(|name| match self.registry.get_config(name)? {
                PeftConfig::Lora(c) => Ok(c),
                other => Err(PeftError::Unsupported {
                    peft_type: other.peft_type(),
                    operation: "weighted adapter combination",
                }),
            })
            .collect()
    }

    /// Every per-layer rank of the given adapters.
    fn layer_ranks(&self, adapters: &[String]) -> Vec<usize> {
        let mut ranks = Vec::new();
        for path in self.tuner_layer_names() {
            if let Some(layer) = self.tuner_layer(&path) {
                ranks.extend(
                    adapters
                        .iter()
                        .filter_map(|n| layer.adapter(n)?.as_lora())
                        .map(LoraAdapter::rank),
                );
            }
        }
        ranks
    }

    fn install_factors(
        &mut self,
        name: &str,
        config: &LoraConfig,
        plan: Vec<(String, Factors)>,
    ) -> Result<()> {
        let planned: BTreeSet<String> = plan.iter().map(|(p, _)| p.clone()).collect();
        for (path, factors) in plan {
            let layer = self
                .tuner_layer_mut(&path)
                .ok_or_else(|| PeftError::ModuleNotFound { path: path.clone() })?;
            let adapter = LoraAdapter::from_factors(layer.base_layer(), config, factors.a, factors.b, 1.0)?;
            let slot = layer
                .adapter_mut(name)
                .ok_or_else(|| PeftError::ModuleNotFound { path: path.clone() })?;
            *slot = LayerAdapter::Lora(adapter);
        }
        for path in self.tuner_layer_names() {
            if planned.contains(&path) {
                continue;
            }
            let Some(layer) = self.tuner_layer_mut(&path) else {
                continue;
            };
            let Some(LayerAdapter::Lora(current)) = layer.adapter(name) else {
                continue;
            };
            let a = current.lora_a().zeros_like()?;
            let b = current.lora_b().zeros_like()?;
            let adapter = LoraAdapter::from_factors(layer.base_layer(), config, a, b, 1.0)?;
            if let Some(slot) = layer.adapter_mut(name) {
                *slot = LayerAdapter::Lora(adapter);
            }
        }
        Ok(())
    }
}

/// Config of the combined adapter: scaling one, union of the source targets.
fn combined_config(
    sources: &[&LoraConfig],
    rank: usize,
    plan: &[(String, Factors)],
) -> Result<LoraConfig> {
    let first = sources[0];
    let mut config = first.clone();
    config.r = rank;
    #[allow(clippy::cast_precision_loss)]
    let alpha = rank as f64;
    config.lora_alpha = alpha;
    config.use_rslora = false;
    config.init_lora_weights = LoraInitialization::Standard;
    config.rank_pattern.clear();
    config.alpha_pattern.clear();
    config.tuner.bias = Bias::None;
    config.tuner.modules_to_save = None;

    let mut targets = first.tuner.target_modules.clone();
    for source in &sources[1..] {
        targets = match (targets, &source.tuner.target_modules) {
            (Some(a), Some(b)) => Some(a.union(b)),
            (a, b) => a.or_else(|| b.clone()),
        };
    }
    let agree = sources.iter().all(|s| {
        s.tuner.layers_to_transform == first.tuner.layers_to_transform
            && s.tuner.layers_pattern == first.tuner.layers_pattern
            && s.tuner.exclude_modules == first.tuner.exclude_modules
    });
    if !agree || targets.as_ref().is_some_and(TargetModules::is_regex) {
        config.tuner.layers_to_transform = None;
        config.tuner.layers_pattern = None;
    }
    if !agree {
        config.tuner.exclude_modules = None;
    }
    config.tuner.target_modules = targets;

    for (path, factors) in plan {
        let r = factors.a.dim(0)?;
        if r != rank {
            let key = regex::escape(path);
            #[allow(clippy::cast_precision_loss)]
            let alpha = r as f64;
            config.alpha_pattern.insert(key.clone(), alpha);
            config.rank_pattern.insert(key, r);
        }
    }
    Ok(config)
}

fn linear_factors(present: &[(&LoraAdapter, f64)]) -> Result<Factors> {
    let mut a: Option<Tensor> = None;
    let mut b: Option<Tensor> = None;
    for (adapter, weight) in present {
        let scaled = weight * adapter.scaling();
        let root = scaled.abs().sqrt();
        let term_a = adapter.lora_a().affine(scaled.signum() * root, 0.0)?;
        let term_b = adapter.lora_b().affine(root, 0.0)?;
        a = Some(match a {
            Some(acc) => (acc + term_a)?,
            None => term_a,
        });
        b = Some(match b {
            Some(acc) => (acc + term_b)?,
            None => term_b,
        });
    }
    match (a, b) {
        (Some(a), Some(b)) => Ok(Factors { a, b }),
        _ => Err(PeftError::InvalidConfig("no source factors to combine".into())),
    }
}

fn cat_factors(present: &[(&LoraAdapter, f64)]) -> Result<Factors> {
    let a_parts = present
        .iter()
        .map(|(adapter, weight)| adapter.lora_a().affine(weight * adapter.scaling(), 0.0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let b_parts: Vec<&Tensor> = present.iter().map(|(adapter, _)| adapter.lora_b()).collect();
    Ok(Factors {
        a: Tensor::cat(&a_parts, 0)?,
        b: Tensor::cat(&b_parts, 1)?,
    })
}

fn svd_factors(present: &[(&LoraAdapter, f64)], rank: usize, clamp: Option<f64>) -> Result<Factors> {
    let a_dims = present[0].0.lora_a().dims().to_vec();
    let b_dims = present[0].0.lora_b().dims().to_vec();
    let out_dim = b_dims[0];
    let in_tail: Vec<usize> = a_dims[1..].to_vec();
    let in_flat: usize = in_tail.iter().product();

    let mut delta: Option<Tensor> = None;
    for (adapter, weight) in present {
        let r = adapter.rank();
        let b = adapter.lora_b().reshape((out_dim, r))?;
        let a = adapter.lora_a().reshape((r, in_flat))?;
        let term = b.matmul(&a)?.affine(weight * adapter.scaling(), 0.0)?;
        delta = Some(match delta {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    let Some(delta) = delta else {
        return Err(PeftError::InvalidConfig("no source factors to combine".into()));
    };

    let svd = truncated_svd(&delta, rank)?;
    let mut b = svd.u.broadcast_mul(&svd.s.unsqueeze(0)?)?;
    let mut a = svd.vt;
    if let Some(q) = clamp {
        let all = Tensor::cat(&[b.flatten_all()?, a.flatten_all()?], 0)?;
        let hi = quantile(&all, q)?;
        b = b.clamp(-hi, hi)?;
        a = a.clamp(-hi, hi)?;
    }
    let k = a.dim(0)?;

    let mut a_shape = vec![k];
    a_shape.extend(&in_tail);
    let mut b_shape = vec![out_dim, k];
    b_shape.extend(&b_dims[2..]);
    Ok(Factors {
        a: a.reshape(a_shape)?.contiguous()?,
        b: b.reshape(b_shape)?.contiguous()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeftType, TunerConfig};
    use crate::layers::ForwardContext;
    use crate::testing::{max_abs_diff, sample_input, ToyTransformer};

    const PATH: &str = "model.layers.0.self_attn.q_proj";

    fn lora(r: usize) -> PeftConfig {
        LoraConfig {
            r,
            lora_alpha: 2.0,
            init_lora_weights: LoraInitialization::Random,
            tuner: TunerConfig {
                target_modules: Some(TargetModules::names(["q_proj"])),
                ..Default::default()
            },
            ..Default::default()
        }
        .into()
    }

    fn delta(tuner: &TunerModel<ToyTransformer>, name: &str) -> Result<Tensor> {
        let layer = tuner.tuner_layer(PATH).unwrap();
        let lora = layer.adapter(name).and_then(LayerAdapter::as_lora).unwrap();
        Ok(lora.delta_weight()?)
    }

    fn two_sources(r1: usize, r2: usize) -> Result<TunerModel<ToyTransformer>> {
        let mut tuner = TunerModel::new(ToyTransformer::new()?);
        tuner.inject_adapter("a", lora(r1))?;
        tuner.inject_adapter("b", lora(r2))?;
        Ok(tuner)
    }

    fn names() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_cat_is_exact() -> Result<()> {
        let mut tuner = two_sources(2, 3)?;
        tuner.add_weighted_adapter(&names(), &[0.7, -1.5], "cat", CombinationType::Cat)?;

        let layer = tuner.tuner_layer(PATH).unwrap();
        let combined = layer.adapter("cat").and_then(LayerAdapter::as_lora).unwrap();
        assert_eq!(combined.rank(), 5);
        assert!((combined.scaling() - 1.0).abs() < 1e-12);

        let expected = ((delta(&tuner, "a")? * 0.7)? + (delta(&tuner, "b")? * -1.5)?)?;
        assert!(max_abs_diff(&expected, &delta(&tuner, "cat")?)? < 1e-5);
        assert_eq!(tuner.active_adapters(), ["a".to_string()]);
        Ok(())
    }

    #[test]
    fn test_linear_single_source_is_exact() -> Result<()> {
        let mut tuner = two_sources(2, 2)?;
        tuner.add_weighted_adapter(&["b".to_string()], &[-0.5], "half", CombinationType::Linear)?;
        let expected = (delta(&tuner, "b")? * -0.5)?;
        assert!(max_abs_diff(&expected, &delta(&tuner, "half")?)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_linear_rank_mismatch_leaves_model_untouched() -> Result<()> {
        let mut tuner = two_sources(2, 3)?;
        let err = tuner
            .add_weighted_adapter(&names(), &[1.0, 1.0], "mix", CombinationType::Linear)
            .unwrap_err();
        assert!(matches!(err, PeftError::RankMismatch { .. }));
        assert!(!tuner.registry().contains_adapter("mix"));
        assert!(tuner.tuner_layer(PATH).unwrap().adapter("mix").is_none());
        Ok(())
    }

    #[test]
    fn test_svd_full_rank_reproduces_sum() -> Result<()> {
        let mut tuner = two_sources(2, 3)?;
        let combination = CombinationType::Svd {
            rank: Some(5),
            clamp: None,
        };
        tuner.add_weighted_adapter(&names(), &[1.0, 0.5], "svd", combination)?;
        let expected = (delta(&tuner, "a")? + (delta(&tuner, "b")? * 0.5)?)?;
        assert!(max_abs_diff(&expected, &delta(&tuner, "svd")?)? < 1e-4);

        // and the combined adapter drives the forward pass once selected
        tuner.set_adapter(&["svd".to_string()])?;
        let out = tuner.forward(&sample_input()?, &ForwardContext::eval())?;
        assert_eq!(out.logits.dims(), &[2, 5, 16]);
        Ok(())
    }

    #[test]
    fn test_svd_default_rank_and_clamp() -> Result<()> {
        let mut tuner = two_sources(2, 3)?;
        let combination = CombinationType::Svd {
            rank: None,
            clamp: Some(0.9),
        };
        tuner.add_weighted_adapter(&names(), &[1.0, 1.0], "svd", combination)?;
        let layer = tuner.tuner_layer(PATH).unwrap();
        let combined = layer.adapter("svd").and_then(LayerAdapter::as_lora).unwrap();
        assert_eq!(combined.rank(), 3);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_requests() -> Result<()> {
        let mut tuner = two_sources(2, 2)?;
        assert!(matches!(
            tuner.add_weighted_adapter(&names(), &[1.0], "x", CombinationType::Cat),
            Err(PeftError::InvalidConfig(_))
        ));
        assert!(matches!(
            tuner.add_weighted_adapter(&names(), &[1.0, 1.0], "a", CombinationType::Cat),
            Err(PeftError::AdapterExists { .. })
        ));
        assert!(matches!(
            tuner.add_weighted_adapter(&["zzz".to_string()], &[1.0], "x", CombinationType::Cat),
            Err(PeftError::AdapterNotFound { .. })
        ));
        assert_eq!(tuner.registry().len(), 2);
        Ok(())
    }

    #[test]
    fn test_non_lora_sources_unsupported() -> Result<()> {
        let mut tuner = TunerModel::new(ToyTransformer::new()?);
        tuner.inject_adapter("ia3", crate::adapters::ia3::Ia3Config::default().into())?;
        let err = tuner
            .add_weighted_adapter(&["ia3".to_string()], &[1.0], "x", CombinationType::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PeftError::Unsupported {
                peft_type: PeftType::Ia3,
                ..
            }
        ));
        Ok(())
    }
}
