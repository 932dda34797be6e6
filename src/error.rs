//! Error types for peft-tuners.

use thiserror::Error;

use crate::config::PeftType;

/// Result type alias for peft-tuners operations.
pub type Result<T> = std::result::Result<T, PeftError>;

/// Errors that can occur in peft-tuners operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PeftError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two adapter families that cannot live on the same model.
    #[error("cannot combine adapters with different peft types: found {existing} and {requested}")]
    IncompatibleAdapterType {
        /// Family already attached to the model
        existing: PeftType,
        /// Family of the adapter being added
        requested: PeftType,
    },

    /// Linear combination of adapters with different ranks.
    #[error("all adapters must have the same rank for linear combination, got {ranks:?}")]
    RankMismatch {
        /// Ranks of the source adapters
        ranks: Vec<usize>,
    },

    /// The target selector did not match any module of the base model.
    #[error("target modules {selector} not found in the base model, please check the target modules and try again")]
    NoTargetModules {
        /// Rendered target selector
        selector: String,
    },

    /// A matched module has a kind the adapter family cannot wrap.
    #[error("target module {name} ({kind}) is not supported by {peft_type}")]
    UnsupportedModule {
        /// Qualified module name
        name: String,
        /// Module kind
        kind: String,
        /// Adapter family
        peft_type: PeftType,
    },

    /// Safe merge found non-finite values.
    #[error("NaNs detected in the merged weights. The adapter {adapter} seems to be broken")]
    MergeNotFinite {
        /// Name of the offending adapter
        adapter: String,
    },

    /// Operation the adapter family has no semantics for.
    #[error("{operation} is not supported for {peft_type} adapters")]
    Unsupported {
        /// Adapter family
        peft_type: PeftType,
        /// Requested operation
        operation: &'static str,
    },

    /// Shape mismatch in tensor operation.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Adapter not found.
    #[error("adapter not found: {name}")]
    AdapterNotFound {
        /// Name of the missing adapter
        name: String,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// Module path not present in the module tree.
    #[error("module not found: {path}")]
    ModuleNotFound {
        /// Qualified module name
        path: String,
    },

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Filesystem or serialization error.
    #[error("io error: {0}")]
    Io(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
