// Checkpoints and training metadata

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::FineTuneConfig;

/// Prefix of periodic checkpoint directories (`checkpoint-200`, ...)
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Metadata file written next to the final adapter
pub const TRAINING_CONFIG_FILE: &str = "training_config.json";

/// Per-checkpoint trainer state
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
}

/// Step number of a `checkpoint-{step}` directory name
pub fn checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// Checkpoint directories under `output_dir`, oldest first
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<PathBuf>> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(output_dir)
        .with_context(|| format!("Failed to list {:?}", output_dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .filter_map(|path| checkpoint_step(&path).map(|step| (step, path)))
        .collect();
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints.into_iter().map(|(_, path)| path).collect())
}

/// Delete the oldest checkpoints beyond `limit`, never the `best` one.
///
/// Returns the removed directories. A limit of 0 keeps everything.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize, best: Option<&Path>) -> Result<Vec<PathBuf>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let checkpoints = list_checkpoints(output_dir)?;
    let mut excess = checkpoints.len().saturating_sub(limit);
    let mut removed = Vec::new();

    for path in checkpoints {
        if excess == 0 {
            break;
        }
        if best.is_some_and(|b| b == path) {
            continue;
        }
        tracing::debug!("Deleting old checkpoint {:?}", path);
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to delete checkpoint {:?}", path))?;
        removed.push(path);
        excess -= 1;
    }
    Ok(removed)
}

/// State stored in each checkpoint directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub global_step: usize,
    pub epoch: f64,
    pub eval_loss: Option<f64>,
}

impl CheckpointState {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(TRAINER_STATE_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TRAINER_STATE_FILE);
        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&contents).with_context(|| format!("Invalid trainer state in {:?}", path))
    }
}

/// Hyperparameters echoed into [`TrainingRecord`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecordConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub max_samples: usize,
}

/// Summary of a finished fine-tuning run, saved as `training_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub base_model: String,
    pub output_dir: PathBuf,
    pub training_time: String,
    pub dataset_size: usize,
    pub device: String,
    pub optimizations: Vec<String>,
    pub completion_date: String,
    pub config: TrainingRecordConfig,
}

/// `H:MM:SS.ffffff`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_micros()
    )
}

impl TrainingRecord {
    pub fn new(config: &FineTuneConfig, training_time: Duration, dataset_size: usize, device: &str) -> Self {
        Self {
            base_model: config.model_checkpoint.clone(),
            output_dir: config.output_dir.clone(),
            training_time: format_duration(training_time),
            dataset_size,
            device: device.to_string(),
            optimizations: vec![
                format!("LoRA r={}", config.lora_r),
                format!("batch_size={}", config.batch_size),
                format!("gradient_accumulation={}", config.gradient_accumulation_steps),
                "minimal_sft_trainer".to_string(),
            ],
            completion_date: Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            config: TrainingRecordConfig {
                epochs: config.num_train_epochs,
                learning_rate: config.learning_rate,
                max_samples: config.max_samples,
            },
        }
    }

    /// Write `training_config.json` into `dir`
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let path = dir.join(TRAINING_CONFIG_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write training config to {:?}", path))?;
        tracing::info!("Training config saved to {:?}", path);
        Ok(path)
    }
}
