//! Core traits for PEFT adapters.

use candle_core::Tensor;

use crate::layers::ForwardContext;
use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Per-layer parameters of one named adapter.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass applying the adapter transformation.
    ///
    /// # Arguments
    /// * `input` - Input of the wrapped layer
    /// * `base_output` - Output of the wrapped layer (for residual adapters)
    /// * `ctx` - Per-call state; dropout only runs while training
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(
        &self,
        input: &Tensor,
        base_output: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable: Adapter {
    /// Merge adapter weights into base model weights.
    ///
    /// # Arguments
    /// * `base_weight` - The weight tensor to merge into
    ///
    /// # Returns
    /// New tensor with adapter weights merged
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Arguments
    /// * `merged_weight` - Weight tensor with adapter already merged
    ///
    /// # Returns
    /// Weight tensor without this adapter's contribution
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Modules holding per-adapter trainable state.
pub trait Trainable {
    /// Mark one adapter's parameters trainable or frozen.
    fn set_requires_grad(&mut self, adapter: &str, requires_grad: bool);

    /// Whether an adapter's parameters are trainable.
    #[must_use]
    fn requires_grad(&self, adapter: &str) -> bool;

    /// Freeze every adapter.
    fn freeze(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Trait object safety check
    fn _assert_adapter_object_safe(_: &dyn Adapter<Config = crate::LoraConfig>) {}
    fn _assert_trainable_object_safe(_: &dyn Trainable) {}
}
