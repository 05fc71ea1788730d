// LoRA (Low-Rank Adaptation)
//
// Frozen base projection plus a trainable low-rank update:
//   y = W x + (B A dropout(x)) * alpha / r
// A is Kaiming-initialised and B starts at zero, so a fresh adapter leaves
// the base model unchanged. Adapter weights live in their own VarMap and are
// always kept in F32, whatever the base precision.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::FineTuneConfig;

/// Safetensors file holding the adapter weights
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// JSON file holding the [`LoraConfig`]
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Precision of the trainable adapter matrices
const ADAPTER_DTYPE: DType = DType::F32;

fn default_bias() -> String {
    "none".to_string()
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

/// Adapter hyperparameters, serialised next to the weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self::from_finetune(&FineTuneConfig::default())
    }
}

impl LoraConfig {
    pub fn from_finetune(config: &FineTuneConfig) -> Self {
        Self {
            r: config.lora_r,
            lora_alpha: config.lora_alpha,
            lora_dropout: config.lora_dropout,
            target_modules: config.target_modules.clone(),
            bias: default_bias(),
            task_type: default_task_type(),
            base_model_name_or_path: Some(config.model_checkpoint.clone()),
        }
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    /// Whether the projection called `module` (e.g. `q_proj`) gets an adapter
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }
}

/// Low-rank update path of one projection
#[derive(Debug, Clone)]
struct LoraPath {
    /// A: rank × in
    lora_a: Linear,
    /// B: out × rank
    lora_b: Linear,
    scaling: f64,
    dropout: f32,
}

impl LoraPath {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut xs = xs.to_dtype(ADAPTER_DTYPE)?;
        if train && self.dropout > 0.0 {
            xs = candle_nn::ops::dropout(&xs, self.dropout)?;
        }
        let update = self.lora_b.forward(&self.lora_a.forward(&xs)?)?;
        update * self.scaling
    }
}

/// Linear layer with an optional LoRA update
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    lora: Option<LoraPath>,
}

impl LoraLinear {
    /// Plain frozen projection
    pub fn frozen(base: Linear) -> Self {
        Self { base, lora: None }
    }

    /// Frozen projection with A/B matrices created (or fetched) under `vb`
    pub fn with_adapter(base: Linear, config: &LoraConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (out_dim, in_dim) = base.weight().dims2()?;
        let a = vb.get_with_hints(
            (config.r, in_dim),
            "lora_A.weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let b = vb.get_with_hints((out_dim, config.r), "lora_B.weight", Init::Const(0.))?;

        Ok(Self {
            base,
            lora: Some(LoraPath {
                lora_a: Linear::new(a, None),
                lora_b: Linear::new(b, None),
                scaling: config.scaling(),
                dropout: config.lora_dropout,
            }),
        })
    }

    pub fn has_adapter(&self) -> bool {
        self.lora.is_some()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let base_out = self.base.forward(xs)?;
        match &self.lora {
            Some(lora) => {
                let update = lora.forward_t(xs, train)?.to_dtype(base_out.dtype())?;
                base_out + update
            }
            None => Ok(base_out),
        }
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_t(xs, false)
    }
}

/// Trainable adapter weights for a whole model
pub struct LoraAdapter {
    config: LoraConfig,
    varmap: VarMap,
    device: Device,
}

impl std::fmt::Debug for LoraAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraAdapter")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("varmap", &"<VarMap>")
            .finish()
    }
}

impl LoraAdapter {
    /// Empty adapter; the A/B variables are created when a model is built
    /// through [`LoraAdapter::var_builder`]
    pub fn new(config: LoraConfig, device: Device) -> Self {
        Self {
            config,
            varmap: VarMap::new(),
            device,
        }
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn var_builder(&self) -> VarBuilder<'_> {
        VarBuilder::from_varmap(&self.varmap, ADAPTER_DTYPE, &self.device)
    }

    /// Variables handed to the optimizer
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn trainable_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create adapter directory {:?}", dir))?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        self.varmap
            .save(&weights_path)
            .with_context(|| format!("Failed to save LoRA adapter to {:?}", weights_path))?;

        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let config_json = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(&config_path, config_json)
            .with_context(|| format!("Failed to save adapter config to {:?}", config_path))?;

        tracing::info!("Saved LoRA adapter to {:?}", dir);
        Ok(())
    }

    /// Read `adapter_config.json` from `dir`
    pub fn read_config(dir: &Path) -> Result<LoraConfig> {
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        let config_json = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read adapter config from {:?}", config_path))?;
        serde_json::from_str(&config_json)
            .with_context(|| format!("Invalid adapter config in {:?}", config_path))
    }

    /// Whether `dir` holds a saved adapter
    pub fn exists(dir: &Path) -> bool {
        dir.join(ADAPTER_WEIGHTS_FILE).is_file() && dir.join(ADAPTER_CONFIG_FILE).is_file()
    }

    /// Overwrite the adapter variables with the weights saved in `dir`.
    ///
    /// The model must already have been built with [`LoraAdapter::var_builder`]
    /// so every variable exists.
    pub fn load_weights(&mut self, dir: &Path) -> Result<()> {
        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        self.varmap
            .load(&weights_path)
            .with_context(|| format!("Failed to load LoRA weights from {:?}", weights_path))?;
        tracing::info!("Loaded LoRA adapter from {:?}", dir);
        Ok(())
    }
}
