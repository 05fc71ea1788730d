// Model loader - resolves a checkpoint (local directory or HuggingFace repo),
// downloads what is missing with progress tracking, and builds the Granite
// model with an optional LoRA adapter.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokenizers::{PaddingParams, Tokenizer};

use super::granite::{GraniteConfig, GraniteModel};
use super::lora::{LoraAdapter, LoraConfig};
use crate::config::constants::END_OF_TEXT;

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Where a checkpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

impl ModelSource {
    /// An existing directory is local; anything else is a Hub repo id
    pub fn parse(checkpoint: &str) -> Self {
        let path = Path::new(checkpoint);
        if path.is_dir() {
            ModelSource::Local(path.to_path_buf())
        } else {
            ModelSource::Hub(checkpoint.to_string())
        }
    }
}

/// Resolved paths of a checkpoint's files
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// What to do about adapters when building the model
#[derive(Debug, Clone)]
pub enum AdapterMode {
    /// Base model only
    None,
    /// Fresh trainable adapter
    Fresh(LoraConfig),
    /// Adapter saved in this directory
    Restore(PathBuf),
}

/// A model ready for generation or training
pub struct LoadedModel {
    pub model: GraniteModel,
    pub tokenizer: Tokenizer,
    pub adapter: Option<LoraAdapter>,
    /// Token ids that end generation
    pub eos_token_ids: Vec<u32>,
}

impl LoadedModel {
    /// First end-of-sequence id; also used as the padding id
    pub fn pad_token_id(&self) -> Option<u32> {
        self.eos_token_ids.first().copied()
    }
}

/// Shard file names listed in a `model.safetensors.index.json`
pub fn shard_files(index_json: &str) -> Result<Vec<String>> {
    let index: serde_json::Value =
        serde_json::from_str(index_json).context("Invalid safetensors index")?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .context("Safetensors index has no weight_map")?;

    let files: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(files.into_iter().collect())
}

/// Load a tokenizer and make sure it pads with the end-of-text token
pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {:?}: {}", path, e))?;

    if tokenizer.get_padding().is_none() {
        if let Some(pad_id) = tokenizer.token_to_id(END_OF_TEXT) {
            tokenizer.with_padding(Some(PaddingParams {
                pad_id,
                pad_token: END_OF_TEXT.to_string(),
                ..Default::default()
            }));
        }
    }

    Ok(tokenizer)
}

pub struct ModelLoader {
    device: Device,
    dtype: DType,
    hf_token: Option<String>,
}

impl ModelLoader {
    pub fn new(device: Device, dtype: DType, hf_token: Option<String>) -> Self {
        Self {
            device,
            dtype,
            hf_token,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Locate (downloading if needed) config, tokenizer and weight files
    pub fn resolve(&self, checkpoint: &str) -> Result<ModelFiles> {
        match ModelSource::parse(checkpoint) {
            ModelSource::Local(dir) => Self::resolve_local(&dir),
            ModelSource::Hub(repo_id) => self.download(&repo_id),
        }
    }

    fn resolve_local(dir: &Path) -> Result<ModelFiles> {
        let config = dir.join(CONFIG_FILE);
        let tokenizer = dir.join(TOKENIZER_FILE);
        if !config.is_file() {
            anyhow::bail!("{:?} has no {}", dir, CONFIG_FILE);
        }

        let single = dir.join(SINGLE_WEIGHTS_FILE);
        let index = dir.join(WEIGHTS_INDEX_FILE);
        let weights = if single.is_file() {
            vec![single]
        } else if index.is_file() {
            let index_json = std::fs::read_to_string(&index)
                .with_context(|| format!("Failed to read {:?}", index))?;
            shard_files(&index_json)?
                .into_iter()
                .map(|f| dir.join(f))
                .collect()
        } else {
            anyhow::bail!("{:?} has no safetensors weights", dir);
        };

        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }

    fn download(&self, repo_id: &str) -> Result<ModelFiles> {
        let api = ApiBuilder::new()
            .with_token(self.hf_token.clone())
            .with_progress(false)
            .build()
            .context("Failed to initialise HuggingFace Hub client")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        tracing::info!("Fetching {} from HuggingFace Hub (cached files are reused)", repo_id);

        let config = Self::fetch(&repo, CONFIG_FILE)?;
        let tokenizer = Self::fetch(&repo, TOKENIZER_FILE)?;

        let weight_names = match repo.get(WEIGHTS_INDEX_FILE) {
            Ok(index) => {
                let index_json = std::fs::read_to_string(&index)
                    .with_context(|| format!("Failed to read {:?}", index))?;
                shard_files(&index_json)?
            }
            Err(e) => {
                tracing::debug!("No sharded index ({}), expecting {}", e, SINGLE_WEIGHTS_FILE);
                vec![SINGLE_WEIGHTS_FILE.to_string()]
            }
        };

        let pb = ProgressBar::new(weight_names.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );

        let mut weights = Vec::with_capacity(weight_names.len());
        for name in &weight_names {
            pb.set_message(format!("Downloading {}", name));
            weights.push(Self::fetch(&repo, name)?);
            pb.inc(1);
        }
        pb.finish_with_message("Download complete");

        Ok(ModelFiles {
            config,
            tokenizer,
            weights,
        })
    }

    fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
        let path = repo.get(file).with_context(|| {
            format!(
                "Failed to download {} (gated models need HF_TOKEN, check network access)",
                file
            )
        })?;
        tracing::debug!("Resolved {} to {:?}", file, path);
        Ok(path)
    }

    /// Build the model from `checkpoint`.
    ///
    /// `tokenizer_dir` overrides where the tokenizer is read from (the
    /// fine-tuned output directory carries its own copy).
    pub fn load(
        &self,
        checkpoint: &str,
        adapter_mode: AdapterMode,
        tokenizer_dir: Option<&Path>,
    ) -> Result<LoadedModel> {
        let files = self.resolve(checkpoint)?;

        let config_str = std::fs::read_to_string(&files.config)
            .with_context(|| format!("Failed to read {:?}", files.config))?;
        let config: GraniteConfig =
            serde_json::from_str(&config_str).context("Failed to parse config.json")?;

        let tokenizer_path = tokenizer_dir
            .map(|dir| dir.join(TOKENIZER_FILE))
            .filter(|p| p.is_file())
            .unwrap_or_else(|| files.tokenizer.clone());
        let tokenizer = load_tokenizer(&tokenizer_path)?;

        tracing::info!(
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            shards = files.weights.len(),
            dtype = ?self.dtype,
            "Loading base model weights"
        );
        // SAFETY: the safetensors files are memory-mapped read-only and are not
        // modified while the model is alive.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files.weights, self.dtype, &self.device)
                .context("Failed to load model weights")?
        };

        let (model, adapter) = match adapter_mode {
            AdapterMode::None => (
                GraniteModel::load(&config, vb, None).context("Failed to build Granite model")?,
                None,
            ),
            AdapterMode::Fresh(lora_config) => {
                let adapter = LoraAdapter::new(lora_config, self.device.clone());
                let model = GraniteModel::load(&config, vb, Some((adapter.config(), adapter.var_builder())))
                    .context("Failed to build Granite model with LoRA")?;
                (model, Some(adapter))
            }
            AdapterMode::Restore(dir) => {
                let lora_config = LoraAdapter::read_config(&dir)?;
                let mut adapter = LoraAdapter::new(lora_config, self.device.clone());
                let model = GraniteModel::load(&config, vb, Some((adapter.config(), adapter.var_builder())))
                    .context("Failed to build Granite model with LoRA")?;
                adapter.load_weights(&dir)?;
                (model, Some(adapter))
            }
        };

        let mut eos_token_ids: Vec<u32> = tokenizer.token_to_id(END_OF_TEXT).into_iter().collect();
        if let Some(ids) = &config.eos_token_id {
            for id in ids.ids() {
                if !eos_token_ids.contains(&id) {
                    eos_token_ids.push(id);
                }
            }
        }
        if eos_token_ids.is_empty() {
            tracing::warn!("No end-of-text token found; generation stops only at max_new_tokens");
        }

        Ok(LoadedModel {
            model,
            tokenizer,
            adapter,
            eos_token_ids,
        })
    }
}
