//! Adapter families.
//!
//! Reparameterization families ([`lora`], [`ia3`], [`miss`],
//! [`trainable_tokens`], [`adaption_prompt`]) attach per-layer state to wrapped modules. Prompt
//! families ([`prompt_tuning`], [`prompt_encoder`], [`prefix_tuning`]) own a
//! virtual-token encoder and leave the module tree alone.

pub mod adaption_prompt;
pub mod ia3;
pub mod lora;
pub mod miss;
pub mod prefix_tuning;
pub mod prompt_encoder;
pub mod prompt_tuning;
pub mod trainable_tokens;
