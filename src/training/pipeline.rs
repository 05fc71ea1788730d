// Fine-tuning pipeline
// dataset -> base model + LoRA -> train -> save artifacts -> smoke test

use anyhow::{Context, Result};
use candle_core::Device;
use std::path::Path;

use super::callbacks::MemoryMonitor;
use super::checkpoint::TrainingRecord;
use super::trainer::{tokenize_corpus, SftTrainer, TrainingSummary};
use crate::config::{FineTuneConfig, GenerationConfig};
use crate::dataset::EsgDataProcessor;
use crate::models::{
    device_label, get_device, get_dtype, AdapterMode, CandleGenerator, GraniteEsgAdapter,
    LoraConfig, MemoryUsage, ModelLoader, TextGeneration,
};

/// Free memory below which loading an 8B model is likely to fail
const LOW_FREE_MEMORY_GB: f64 = 6.0;

/// Prompts run against the saved adapter after training
const SMOKE_TESTS: [(&str, &str); 2] = [
    (
        "Apple şirketinin ESG performansını analiz et",
        "Şirket: Apple Inc (AAPL)\nSektör: Technology\nÜlke: USA",
    ),
    (
        "Tesla için ESG iyileştirme stratejisi öner",
        "Mevcut ESG: 65/100\nZayıf alan: Çevresel",
    ),
];

/// Generation settings of the post-training smoke test
pub fn smoke_test_generation() -> GenerationConfig {
    GenerationConfig {
        max_new_tokens: 150,
        max_input_tokens: 256,
        temperature: 0.7,
        top_p: None,
        repetition_penalty: 1.0,
        ..Default::default()
    }
}

/// Answer (or error) for one smoke-test prompt
#[derive(Debug)]
pub struct SmokeTestResult {
    pub instruction: String,
    pub response: Result<String>,
}

/// Run the fixed smoke-test prompts through `generator`; failures are kept
/// per prompt rather than aborting
pub fn run_smoke_tests(generator: &mut dyn TextGeneration) -> Vec<SmokeTestResult> {
    let adapter = GraniteEsgAdapter;
    let params = smoke_test_generation();

    SMOKE_TESTS
        .iter()
        .enumerate()
        .map(|(i, (instruction, input))| {
            tracing::info!("Smoke test {}: {}", i + 1, instruction);
            let prompt = adapter.format_instruction(instruction, input);
            let response = generator.generate_text(&prompt, &params);
            match &response {
                Ok(text) => tracing::info!("Response: {}", text),
                Err(e) => tracing::error!("Smoke test failed: {:#}", e),
            }
            SmokeTestResult {
                instruction: instruction.to_string(),
                response,
            }
        })
        .collect()
}

/// Wrap CUDA/Metal allocation failures with remediation hints
fn explain_oom(err: anyhow::Error) -> anyhow::Error {
    if format!("{:#}", err).to_lowercase().contains("out of memory") {
        tracing::error!("Not enough GPU memory for training");
        tracing::error!("  - close other programs using the GPU");
        tracing::error!("  - raise gradient_accumulation_steps (e.g. 32) and keep batch_size at 1");
        tracing::error!("  - lower num_train_epochs to 1");
        return err.context("Out of memory during training");
    }
    err
}

/// Everything a finished run produced
#[derive(Debug)]
pub struct FineTuneOutcome {
    pub summary: TrainingSummary,
    pub record: TrainingRecord,
    pub smoke_tests: Vec<SmokeTestResult>,
}

pub struct GraniteFineTuner {
    config: FineTuneConfig,
    hf_token: Option<String>,
}

impl GraniteFineTuner {
    pub fn new(config: FineTuneConfig, hf_token: Option<String>) -> Self {
        Self { config, hf_token }
    }

    pub fn config(&self) -> &FineTuneConfig {
        &self.config
    }

    /// Checks that fail fast before any model download
    pub fn preflight(&self) -> Result<Device> {
        if !self.config.dataset_path.is_file() {
            anyhow::bail!(
                "Dataset not found: {:?} (run the `analyze` command first)",
                self.config.dataset_path
            );
        }

        if self.hf_token.is_none() {
            tracing::warn!("HF_TOKEN is not set; gated checkpoints will fail to download");
        }

        let device = get_device(self.config.device)?;
        if device.is_cpu() {
            tracing::warn!("Training on CPU; an 8B model will be very slow");
        }

        let memory = MemoryUsage::current();
        tracing::info!("{}", memory);
        if memory.free_gb < LOW_FREE_MEMORY_GB {
            tracing::warn!(
                "Only {:.1} GB free; close other programs before loading the model",
                memory.free_gb
            );
        }
        Ok(device)
    }

    /// Complete training pipeline
    pub fn run_training(&self) -> Result<FineTuneOutcome> {
        let device = self.preflight()?;
        let dtype = get_dtype(self.config.dtype, &device);
        let output_dir = self.config.output_dir.as_path();

        tracing::info!("[1/4] Preparing dataset");
        let split = EsgDataProcessor::new(self.config.clone()).load_and_process_data()?;

        tracing::info!("[2/4] Loading model");
        let loader = ModelLoader::new(device.clone(), dtype, self.hf_token.clone());
        let mut loaded = loader.load(
            &self.config.model_checkpoint,
            AdapterMode::Fresh(LoraConfig::from_finetune(&self.config)),
            None,
        )?;
        let pad_token_id = loaded
            .pad_token_id()
            .context("Tokenizer has no end-of-text token to pad with")?;

        tracing::info!("[3/4] Training");
        let train = tokenize_corpus(&loaded.tokenizer, &split.train, self.config.max_seq_len)?;
        let eval = tokenize_corpus(&loaded.tokenizer, &split.eval, self.config.max_seq_len)?;

        let adapter = loaded
            .adapter
            .as_mut()
            .context("Model was built without a LoRA adapter")?;
        tracing::info!(
            "{}",
            loaded.model.parameter_summary(adapter.trainable_parameters())
        );

        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;

        let summary = {
            let mut trainer = SftTrainer::new(&loaded.model, adapter, self.config.clone(), pad_token_id);
            trainer.add_callback(Box::new(MemoryMonitor::new(self.config.max_memory_gb)));
            trainer.train(&train, &eval).map_err(explain_oom)?
        };
        tracing::info!("Training finished in {:.1}s", summary.training_time.as_secs_f64());

        adapter.save(output_dir)?;
        self.save_tokenizer(&loaded.tokenizer, output_dir)?;
        let record = TrainingRecord::new(
            &self.config,
            summary.training_time,
            split.train.len(),
            device_label(&device),
        );
        record.save(output_dir)?;
        tracing::info!("{}", MemoryUsage::current());

        // Release the training graph before reloading from disk
        drop(loaded);

        tracing::info!("[4/4] Testing saved model");
        let smoke_tests = match self.reload(&loader) {
            Ok(mut generator) => run_smoke_tests(&mut generator),
            Err(e) => {
                tracing::error!("Could not reload the fine-tuned model: {:#}", e);
                Vec::new()
            }
        };

        Ok(FineTuneOutcome {
            summary,
            record,
            smoke_tests,
        })
    }

    fn save_tokenizer(&self, tokenizer: &tokenizers::Tokenizer, dir: &Path) -> Result<()> {
        let path = dir.join("tokenizer.json");
        tokenizer
            .save(&path, false)
            .map_err(|e| anyhow::anyhow!("Failed to save tokenizer to {:?}: {}", path, e))
    }

    fn reload(&self, loader: &ModelLoader) -> Result<CandleGenerator> {
        let output_dir = self.config.output_dir.as_path();
        let loaded = loader.load(
            &self.config.model_checkpoint,
            AdapterMode::Restore(output_dir.to_path_buf()),
            Some(output_dir),
        )?;
        Ok(CandleGenerator::from_loaded(loaded, "granite-esg"))
    }
}
