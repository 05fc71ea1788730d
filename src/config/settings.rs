// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::constants::*;

/// Compute device requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    /// CUDA when compiled in and present, Metal on macOS, otherwise CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl DeviceChoice {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceChoice::Auto => "auto",
            DeviceChoice::Cpu => "cpu",
            DeviceChoice::Cuda => "cuda",
            DeviceChoice::Metal => "metal",
        }
    }
}

impl std::str::FromStr for DeviceChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DeviceChoice::Auto),
            "cpu" => Ok(DeviceChoice::Cpu),
            "cuda" | "gpu" => Ok(DeviceChoice::Cuda),
            "metal" => Ok(DeviceChoice::Metal),
            other => anyhow::bail!("Unknown device '{}' (expected auto, cpu, cuda or metal)", other),
        }
    }
}

/// Floating point precision for model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DTypeChoice {
    /// F16 on accelerators, F32 on CPU
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

/// Paths used by the `analyze` pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub raw_csv: PathBuf,
    pub training_csv: PathBuf,
    pub questions_json: PathBuf,
    /// Number of sample questions to emit
    pub sample_questions: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            raw_csv: PathBuf::from(DEFAULT_RAW_CSV),
            training_csv: PathBuf::from(DEFAULT_TRAINING_CSV),
            questions_json: PathBuf::from(DEFAULT_QUESTIONS_JSON),
            sample_questions: 50,
        }
    }
}

/// Fine-tuning hyperparameters, sized for a single 8 GB card by default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuneConfig {
    // Model
    pub model_checkpoint: String,
    pub output_dir: PathBuf,
    pub dataset_path: PathBuf,

    // Memory
    /// Process memory above which the monitor warns
    pub max_memory_gb: f64,

    // Training
    pub num_train_epochs: usize,
    pub batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub warmup_steps: usize,
    /// Rows kept from the training table before stratified down-sampling
    pub max_samples: usize,
    pub max_grad_norm: f64,
    pub max_seq_len: usize,
    pub eval_fraction: f64,
    pub seed: u64,

    // LoRA
    pub lora_r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,

    // Logging / checkpoints
    pub logging_steps: usize,
    pub save_steps: usize,
    pub eval_steps: usize,
    pub save_total_limit: usize,

    // Runtime
    pub device: DeviceChoice,
    pub dtype: DTypeChoice,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            model_checkpoint: DEFAULT_BASE_MODEL.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            dataset_path: PathBuf::from(DEFAULT_TRAINING_CSV),
            max_memory_gb: 7.5,
            num_train_epochs: 2,
            batch_size: 1,
            gradient_accumulation_steps: 16,
            learning_rate: 1e-4,
            warmup_steps: 50,
            max_samples: 800,
            max_grad_norm: 1.0,
            max_seq_len: 1024,
            eval_fraction: 0.1,
            seed: SAMPLING_SEED,
            lora_r: 8,
            lora_alpha: 16.0,
            lora_dropout: 0.05,
            target_modules: ["q_proj", "k_proj", "v_proj", "o_proj"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            logging_steps: 5,
            save_steps: 200,
            eval_steps: 200,
            save_total_limit: 2,
            device: DeviceChoice::Auto,
            dtype: DTypeChoice::Auto,
        }
    }
}

/// Where the inference wrapper finds its models
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_model: String,
    /// Directory holding `adapter_model.safetensors` and the tokenizer
    pub model_path: PathBuf,
    pub device: DeviceChoice,
    pub dtype: DTypeChoice,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_BASE_MODEL.to_string(),
            model_path: PathBuf::from(DEFAULT_OUTPUT_DIR),
            device: DeviceChoice::Auto,
            dtype: DTypeChoice::Auto,
        }
    }
}

/// Sampling parameters for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// Prompt is truncated to this many tokens before generation
    pub max_input_tokens: usize,
    /// 0.0 selects greedy decoding
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub repetition_penalty: f32,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 150,
            max_input_tokens: 300,
            temperature: 0.7,
            top_p: Some(0.9),
            repetition_penalty: 1.1,
            seed: SAMPLING_SEED,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub finetune: FineTuneConfig,
    pub inference: InferenceConfig,
    pub generation: GenerationConfig,
    /// HuggingFace API token for gated model downloads (optional)
    pub huggingface_token: Option<String>,
}

impl Config {
    /// Parse a TOML document; missing sections and fields take their defaults
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse configuration: {}", e))?;
        Ok(config)
    }

    /// Reject values that would make training or generation meaningless
    pub fn validate(&self) -> anyhow::Result<()> {
        let ft = &self.finetune;

        if ft.batch_size == 0 {
            anyhow::bail!("finetune.batch_size must be at least 1");
        }
        if ft.gradient_accumulation_steps == 0 {
            anyhow::bail!("finetune.gradient_accumulation_steps must be at least 1");
        }
        if ft.num_train_epochs == 0 {
            anyhow::bail!("finetune.num_train_epochs must be at least 1");
        }
        if ft.lora_r == 0 {
            anyhow::bail!("finetune.lora_r must be at least 1");
        }
        if ft.learning_rate <= 0.0 || !ft.learning_rate.is_finite() {
            anyhow::bail!("finetune.learning_rate must be positive (got {})", ft.learning_rate);
        }
        if !(0.0..1.0).contains(&ft.lora_dropout) {
            anyhow::bail!("finetune.lora_dropout must be in [0, 1) (got {})", ft.lora_dropout);
        }
        if !(ft.eval_fraction > 0.0 && ft.eval_fraction < 1.0) {
            anyhow::bail!("finetune.eval_fraction must be in (0, 1) (got {})", ft.eval_fraction);
        }
        if ft.max_seq_len < 2 {
            anyhow::bail!("finetune.max_seq_len must be at least 2");
        }
        if ft.target_modules.is_empty() {
            anyhow::bail!("finetune.target_modules must name at least one projection");
        }
        if ft.max_samples < 4 {
            anyhow::bail!("finetune.max_samples must be at least 4 (one row per ESG bin)");
        }

        if self.generation.max_new_tokens == 0 {
            anyhow::bail!("generation.max_new_tokens must be at least 1");
        }
        if let Some(p) = self.generation.top_p {
            if !(p > 0.0 && p <= 1.0) {
                anyhow::bail!("generation.top_p must be in (0, 1] (got {})", p);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_training_budget() {
        let config = Config::default();
        assert_eq!(config.finetune.batch_size, 1);
        assert_eq!(config.finetune.gradient_accumulation_steps, 16);
        assert_eq!(config.finetune.lora_r, 8);
        assert_eq!(config.finetune.target_modules.len(), 4);
        assert_eq!(config.generation.max_new_tokens, 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [finetune]
            num_train_epochs = 3
            device = "cpu"

            [generation]
            temperature = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.finetune.num_train_epochs, 3);
        assert_eq!(config.finetune.device, DeviceChoice::Cpu);
        assert_eq!(config.finetune.learning_rate, 1e-4);
        assert_eq!(config.generation.temperature, 0.0);
        assert_eq!(config.generation.max_input_tokens, 300);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.finetune.lora_dropout = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.finetune.eval_fraction = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.generation.top_p = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_choice_parse() {
        assert_eq!("CUDA".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda);
        assert_eq!("gpu".parse::<DeviceChoice>().unwrap(), DeviceChoice::Cuda);
        assert!("tpu".parse::<DeviceChoice>().is_err());
    }
}
