//! Multi-adapter lifecycle example.
//!
//! This example demonstrates:
//! - Injecting two LoRA adapters into a small network
//! - Switching the active adapter
//! - Combining both into a weighted adapter
//! - Saving and reloading an adapter
//! - Merging and unloading

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::Linear;
use peft_tuners::{
    BaseModel, CombinationType, Container, ForwardContext, LoraConfig, LoraInitialization,
    ModelConfig, ModelInput, ModelOutput, PeftError, PeftModel, TargetModules, TunerConfig,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

const HIDDEN: usize = 64;

#[derive(Debug, Clone)]
struct TwoLayerNet {
    config: ModelConfig,
    modules: Container,
}

impl TwoLayerNet {
    fn new(device: &Device) -> Result<Self> {
        let layer = |seed: f64| -> Result<Linear> {
            let w = Tensor::arange(0f32, (HIDDEN * HIDDEN) as f32, device)?
                .affine(0.37, seed)?
                .sin()?
                .affine(0.1, 0.0)?
                .reshape((HIDDEN, HIDDEN))?;
            Ok(Linear::new(w, None))
        };
        let modules = Container::new()
            .with("fc1", layer(1.0)?)
            .with("fc2", layer(2.0)?);
        let config = ModelConfig {
            model_type: "mlp".into(),
            name_or_path: Some("demo/two-layer".into()),
            hidden_size: HIDDEN,
            num_attention_heads: 1,
            num_hidden_layers: 2,
            vocab_size: HIDDEN,
            output_layer_name: "head".into(),
            ..Default::default()
        };
        Ok(Self { config, modules })
    }
}

impl BaseModel for TwoLayerNet {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn modules(&self) -> &Container {
        &self.modules
    }

    fn modules_mut(&mut self) -> &mut Container {
        &mut self.modules
    }

    fn forward(&self, input: &ModelInput, ctx: &ForwardContext) -> peft_tuners::Result<ModelOutput> {
        let x = input
            .inputs_embeds
            .as_ref()
            .ok_or_else(|| PeftError::InvalidConfig("inputs_embeds required".into()))?;
        let h = self.modules.module("fc1")?.forward(x, ctx)?.relu()?;
        let logits = self.modules.module("fc2")?.forward(&h, ctx)?;
        Ok(ModelOutput { logits, loss: None })
    }
}

fn lora(r: usize, targets: &[&str]) -> LoraConfig {
    LoraConfig {
        r,
        lora_alpha: 2.0 * r as f64,
        init_lora_weights: LoraInitialization::Random,
        tuner: TunerConfig {
            target_modules: Some(TargetModules::names(targets.iter().copied())),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn sample(output: &ModelOutput) -> Result<f32> {
    Ok(output.logits.flatten_all()?.get(0)?.to_scalar::<f32>()?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("peft_tuners=info".parse()?))
        .init();

    let device = Device::Cpu;
    let input = ModelInput {
        inputs_embeds: Some(Tensor::randn(0f32, 1.0, (2, 4, HIDDEN), &device)?),
        ..Default::default()
    };

    println!("Step 1: injecting adapters");
    let mut model = PeftModel::new(TwoLayerNet::new(&device)?, lora(8, &["fc1", "fc2"]), "default")?;
    model.add_adapter("second", lora(4, &["fc1", "fc2"]))?;
    model.print_trainable_parameters();
    println!("  default: {:.6}", sample(&model.forward(&input)?)?);

    println!("\nStep 2: switching adapters");
    model.set_adapter("second")?;
    println!("  second: {:.6}", sample(&model.forward(&input)?)?);
    {
        let base = model.disable_adapter()?;
        println!("  base: {:.6}", sample(&base.forward(&input)?)?);
    }

    println!("\nStep 3: combining adapters");
    let sources = vec!["default".to_string(), "second".to_string()];
    model.add_weighted_adapter(&sources, &[0.5, 0.5], "blend", CombinationType::Cat)?;
    model.set_adapter("blend")?;
    println!("  blend: {:.6}", sample(&model.forward(&input)?)?);

    println!("\nStep 4: saving and reloading");
    let dir = TempDir::new()?;
    let selected = vec!["blend".to_string()];
    model.save_pretrained(dir.path(), Some(&selected))?;
    let reloaded = PeftModel::from_pretrained(
        TwoLayerNet::new(&device)?,
        dir.path().join("blend"),
        "blend",
        false,
    )?;
    println!("  reloaded: {:.6}", sample(&reloaded.forward(&input)?)?);

    println!("\nStep 5: merging");
    let merged = reloaded.merge_and_unload(None, true).map_err(|(_, e)| e)?;
    let output = merged.forward(&input, &ForwardContext::eval())?;
    println!("  merged: {:.6}", sample(&output)?);

    Ok(())
}
