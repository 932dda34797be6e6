//! On-disk adapter format.
//!
//! An adapter directory holds `adapter_config.json` (the serialized
//! [`crate::PeftConfig`]) and `adapter_model.safetensors` (that adapter's
//! tensors keyed by qualified parameter name).

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{PeftError, Result};

/// Default filename for adapter weights in safetensors format.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Default filename for adapter configuration.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Trait for adapters that can be saved and loaded.
pub trait SaveLoad {
    /// Get all adapter tensors as a map of name -> tensor.
    ///
    /// # Errors
    /// Returns an error if a tensor cannot be produced.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    /// Load adapter tensors from a state dict.
    ///
    /// # Errors
    /// Returns an error if a key is missing or a shape does not match.
    fn load_state_dict(&mut self, state_dict: HashMap<String, Tensor>) -> Result<()>;
}

/// Remove `key` from `state_dict`, checking it against the current value.
///
/// The returned tensor is moved to the device and dtype of `like`.
///
/// # Errors
/// Returns [`PeftError::WeightLoad`] if the key is missing and
/// [`PeftError::ShapeMismatch`] if the shapes differ.
pub fn take_tensor(
    state_dict: &mut HashMap<String, Tensor>,
    key: &str,
    like: &Tensor,
) -> Result<Tensor> {
    let tensor = state_dict
        .remove(key)
        .ok_or_else(|| PeftError::WeightLoad(format!("missing key '{key}'")))?;
    if tensor.dims() != like.dims() {
        return Err(PeftError::ShapeMismatch {
            expected: like.dims().to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    Ok(tensor.to_device(like.device())?.to_dtype(like.dtype())?)
}

/// Save named tensors to a safetensors file.
///
/// # Arguments
/// * `tensors` - Map of qualified name -> tensor
/// * `path` - Path to save the safetensors file
///
/// # Errors
/// Returns an error if:
/// - Failed to serialize tensors to safetensors format
/// - Failed to write file to disk
pub fn save_adapter_weights<P: AsRef<Path>>(
    tensors: &HashMap<String, Tensor>,
    path: P,
) -> Result<()> {
    let mut entries: Vec<(&str, Tensor)> = tensors
        .iter()
        .map(|(name, tensor)| Ok((name.as_str(), tensor.contiguous()?)))
        .collect::<Result<_>>()?;
    entries.sort_by(|a, b| a.0.cmp(b.0));

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    safetensors::tensor::serialize_to_file(entries, &metadata, path.as_ref())
        .map_err(|e| PeftError::Io(format!("Failed to save safetensors: {e}")))?;

    Ok(())
}

/// Load named tensors from a safetensors file.
///
/// # Arguments
/// * `path` - Path to the safetensors file
/// * `device` - Device to load tensors on
///
/// # Errors
/// Returns an error if:
/// - Failed to read file from disk
/// - Failed to parse safetensors format
pub fn load_adapter_weights<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(PeftError::Io(format!(
            "weights file {} does not exist",
            path.display()
        )));
    }
    candle_core::safetensors::load(path, device)
        .map_err(|e| PeftError::WeightLoad(format!("{}: {e}", path.display())))
}

/// Save adapter configuration to a JSON file.
///
/// # Arguments
/// * `config` - The configuration to save
/// * `path` - Path to save the JSON file
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_adapter_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| PeftError::Io(format!("Failed to serialize config: {e}")))?;

    fs::write(path, json)
        .map_err(|e| PeftError::Io(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// Load adapter configuration from a JSON file.
///
/// # Arguments
/// * `path` - Path to the JSON file
///
/// # Errors
/// Returns an error if file reading or deserialization fails
pub fn load_adapter_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| PeftError::Io(format!("Failed to read config file: {e}")))?;

    let config = serde_json::from_str(&json)
        .map_err(|e| PeftError::Io(format!("Failed to parse config: {e}")))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::LoraConfig;
    use crate::config::PeftConfig;
    use candle_core::{DType, Device};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_adapter_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let weights_path = temp_dir.path().join(ADAPTER_WEIGHTS_FILENAME);

        let mut weights = HashMap::new();
        weights.insert(
            "q_proj.lora_A.weight".to_string(),
            Tensor::randn(0f32, 1f32, (8, 64), &device)?,
        );
        weights.insert(
            "q_proj.lora_B.weight".to_string(),
            Tensor::randn(0f32, 1f32, (64, 8), &device)?,
        );

        save_adapter_weights(&weights, &weights_path)?;
        assert!(weights_path.exists());

        let loaded = load_adapter_weights(&weights_path, &device)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["q_proj.lora_A.weight"].dims(), &[8, 64]);

        Ok(())
    }

    #[test]
    fn test_missing_weights_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = load_adapter_weights(temp_dir.path().join("nope.safetensors"), &Device::Cpu);
        assert!(matches!(err, Err(PeftError::Io(_))));
    }

    #[test]
    fn test_save_load_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join(ADAPTER_CONFIG_FILENAME);

        let config = PeftConfig::from(LoraConfig {
            r: 4,
            lora_alpha: 16.0,
            lora_dropout: 0.1,
            ..Default::default()
        });

        save_adapter_config(&config, &config_path)?;
        assert!(config_path.exists());

        let loaded_config: PeftConfig = load_adapter_config(&config_path)?;
        assert_eq!(config, loaded_config);

        Ok(())
    }

    #[test]
    fn test_take_tensor_checks() -> Result<()> {
        let like = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let mut state = HashMap::from([("w".to_string(), Tensor::ones((3, 2), DType::F32, &Device::Cpu)?)]);
        assert!(matches!(
            take_tensor(&mut state, "w", &like),
            Err(PeftError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            take_tensor(&mut state, "w", &like),
            Err(PeftError::WeightLoad(_))
        ));
        Ok(())
    }
}
