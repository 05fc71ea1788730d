// Supervised fine-tuning loop
//
// Causal LM objective over the full example text. Only the LoRA variables are
// handed to the optimizer; the base weights stay frozen.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokenizers::Tokenizer;

use super::callbacks::{TrainerCallback, TrainerState};
use super::checkpoint::{checkpoint_dir, rotate_checkpoints, CheckpointState};
use super::schedule::LinearWarmup;
use crate::config::FineTuneConfig;
use crate::dataset::TrainingExample;
use crate::models::{GraniteModel, LoraAdapter};

/// Tokenise example texts, truncating each to `max_seq_len` tokens.
///
/// Sequences shorter than two tokens carry no next-token target and are
/// dropped.
pub fn tokenize_corpus(
    tokenizer: &Tokenizer,
    examples: &[TrainingExample],
    max_seq_len: usize,
) -> Result<Vec<Vec<u32>>> {
    let mut sequences = Vec::with_capacity(examples.len());
    let mut truncated = 0;

    for example in examples {
        let encoding = tokenizer
            .encode(example.text.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        let mut ids = encoding.get_ids().to_vec();
        if max_seq_len > 0 && ids.len() > max_seq_len {
            ids.truncate(max_seq_len);
            truncated += 1;
        }
        if ids.len() >= 2 {
            sequences.push(ids);
        }
    }

    if truncated > 0 {
        tracing::debug!("{} examples truncated to {} tokens", truncated, max_seq_len);
    }
    if sequences.len() < examples.len() {
        tracing::warn!(
            "{} examples were too short to train on",
            examples.len() - sequences.len()
        );
    }
    Ok(sequences)
}

/// One padded micro-batch, shifted for next-token prediction
#[derive(Debug)]
pub struct Batch {
    /// (batch, width) u32
    pub inputs: Tensor,
    /// (batch, width) u32
    pub targets: Tensor,
    /// (batch, width) f32, 0 on padding
    pub mask: Tensor,
}

/// Right-pad `sequences` with `pad_id` and build inputs, targets and mask
pub fn collate(sequences: &[&[u32]], pad_id: u32, device: &Device) -> Result<Batch> {
    let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    if max_len < 2 {
        anyhow::bail!("Batch has no sequence with at least two tokens");
    }
    let width = max_len - 1;
    let rows = sequences.len();

    let mut inputs = Vec::with_capacity(rows * width);
    let mut targets = Vec::with_capacity(rows * width);
    let mut mask = Vec::with_capacity(rows * width);
    for seq in sequences {
        for i in 0..width {
            inputs.push(seq.get(i).copied().unwrap_or(pad_id));
            match seq.get(i + 1) {
                Some(&t) => {
                    targets.push(t);
                    mask.push(1f32);
                }
                None => {
                    targets.push(pad_id);
                    mask.push(0f32);
                }
            }
        }
    }

    Ok(Batch {
        inputs: Tensor::from_vec(inputs, (rows, width), device)?,
        targets: Tensor::from_vec(targets, (rows, width), device)?,
        mask: Tensor::from_vec(mask, (rows, width), device)?,
    })
}

/// Mean cross-entropy over unmasked positions.
///
/// `logits`: (batch, seq, vocab) f32, `targets`: (batch, seq) u32,
/// `mask`: (batch, seq) f32.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let count = mask.sum_all()?;
    (picked * mask)?.sum_all()?.neg()?.broadcast_div(&count)
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64)
}

/// Scale gradients in place so their global L2 norm is at most `max_norm`;
/// returns the norm before clipping
pub fn clip_grad_norm(grads: &mut [Option<Tensor>], max_norm: f64) -> Result<f64> {
    let mut total = 0.0;
    for grad in grads.iter().flatten() {
        total += scalar(&grad.sqr()?.sum_all()?)?;
    }
    let norm = total.sqrt();

    if max_norm > 0.0 && norm > max_norm {
        let coef = max_norm / (norm + 1e-6);
        for grad in grads.iter_mut().flatten() {
            *grad = grad.affine(coef, 0.0)?;
        }
    }
    Ok(norm)
}

/// Outcome of [`SftTrainer::train`]
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub global_steps: usize,
    pub epochs: usize,
    pub train_examples: usize,
    /// Mean micro-batch loss over the whole run
    pub train_loss: f64,
    /// Eval loss of the final weights
    pub eval_loss: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub training_time: Duration,
}

impl fmt::Display for TrainingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Training summary:")?;
        writeln!(f, "  Steps: {} over {} epochs", self.global_steps, self.epochs)?;
        writeln!(f, "  Examples: {}", self.train_examples)?;
        writeln!(f, "  Train loss: {:.4}", self.train_loss)?;
        if let Some(loss) = self.eval_loss {
            writeln!(f, "  Eval loss: {:.4}", loss)?;
        }
        if let Some(best) = &self.best_checkpoint {
            writeln!(f, "  Best checkpoint: {}", best.display())?;
        }
        write!(f, "  Time: {:.1}s", self.training_time.as_secs_f64())
    }
}

/// Trains the LoRA adapter of `model`
pub struct SftTrainer<'a> {
    model: &'a GraniteModel,
    adapter: &'a mut LoraAdapter,
    config: FineTuneConfig,
    pad_token_id: u32,
    callbacks: Vec<Box<dyn TrainerCallback>>,
    show_progress: bool,
}

impl<'a> SftTrainer<'a> {
    pub fn new(
        model: &'a GraniteModel,
        adapter: &'a mut LoraAdapter,
        config: FineTuneConfig,
        pad_token_id: u32,
    ) -> Self {
        Self {
            model,
            adapter,
            config,
            pad_token_id,
            callbacks: Vec::new(),
            show_progress: true,
        }
    }

    pub fn add_callback(&mut self, callback: Box<dyn TrainerCallback>) {
        self.callbacks.push(callback);
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Mean masked cross-entropy over `eval` in batches; `None` when empty
    pub fn evaluate(&self, eval: &[Vec<u32>]) -> Result<Option<f64>> {
        if eval.is_empty() {
            return Ok(None);
        }
        let mut total = 0.0;
        let mut batches = 0;
        for chunk in eval.chunks(self.batch_size()) {
            let seqs: Vec<&[u32]> = chunk.iter().map(|s| s.as_slice()).collect();
            let batch = collate(&seqs, self.pad_token_id, self.model.device())?;
            let logits = self.model.forward_all(&batch.inputs, false)?;
            total += scalar(&masked_cross_entropy(&logits, &batch.targets, &batch.mask)?)?;
            batches += 1;
        }
        Ok(Some(total / batches as f64))
    }

    fn progress_bar(&self, max_steps: usize) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(max_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} steps {msg}")?
                .progress_chars("=>-"),
        );
        Ok(pb)
    }

    /// Run the full training loop over pre-tokenised sequences
    pub fn train(&mut self, train: &[Vec<u32>], eval: &[Vec<u32>]) -> Result<TrainingSummary> {
        let started = Instant::now();
        let batch_size = self.batch_size();
        let accum = self.config.gradient_accumulation_steps.max(1);
        let epochs = self.config.num_train_epochs;

        let batches_per_epoch = train.len() / batch_size;
        if batches_per_epoch == 0 {
            anyhow::bail!(
                "{} training examples cannot fill a single batch of {}",
                train.len(),
                batch_size
            );
        }
        let steps_per_epoch = batches_per_epoch.div_ceil(accum);
        let max_steps = steps_per_epoch * epochs;
        let schedule = LinearWarmup::new(self.config.learning_rate, self.config.warmup_steps, max_steps);

        let vars = self.adapter.vars();
        if vars.is_empty() {
            anyhow::bail!("The model has no trainable adapter parameters");
        }
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: schedule.lr_at(0),
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        tracing::info!(
            examples = train.len(),
            epochs,
            batch_size,
            gradient_accumulation = accum,
            max_steps,
            "Starting training"
        );

        let device = self.model.device().clone();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let pb = self.progress_bar(max_steps)?;

        let mut state = TrainerState {
            max_steps,
            ..Default::default()
        };
        let mut accumulated: Vec<Option<Tensor>> = vec![None; vars.len()];
        let mut pending = 0usize;
        let mut pending_loss = 0.0;
        let mut loss_sum = 0.0;
        let mut loss_count = 0usize;
        let mut last_eval: Option<f64> = None;
        let mut best: Option<(f64, PathBuf)> = None;

        for epoch in 0..epochs {
            order.shuffle(&mut rng);

            for (batch_idx, chunk) in order.chunks_exact(batch_size).enumerate() {
                let seqs: Vec<&[u32]> = chunk.iter().map(|&i| train[i].as_slice()).collect();
                let batch = collate(&seqs, self.pad_token_id, &device)?;

                let logits = self.model.forward_all(&batch.inputs, true)?;
                let loss = masked_cross_entropy(&logits, &batch.targets, &batch.mask)?;
                let loss_value = scalar(&loss)?;
                let grads = (loss / accum as f64)?.backward()?;

                for (slot, var) in accumulated.iter_mut().zip(&vars) {
                    if let Some(grad) = grads.get(var.as_tensor()) {
                        *slot = Some(match slot.take() {
                            Some(acc) => (acc + grad)?,
                            None => grad.clone(),
                        });
                    }
                }
                pending += 1;
                pending_loss += loss_value;
                loss_sum += loss_value;
                loss_count += 1;

                let epoch_end = batch_idx + 1 == batches_per_epoch;
                if pending < accum && !epoch_end {
                    continue;
                }

                // Optimizer step; the last micro-batch's store carries the
                // accumulated gradients
                let grad_norm = clip_grad_norm(&mut accumulated, self.config.max_grad_norm)?;
                let mut store: GradStore = grads;
                for (slot, var) in accumulated.iter_mut().zip(&vars) {
                    if let Some(grad) = slot.take() {
                        store.insert(var.as_tensor(), grad);
                    }
                }
                let lr = schedule.lr_at(state.global_step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&store)?;

                state.global_step += 1;
                state.epoch = epoch as f64 + (batch_idx + 1) as f64 / batches_per_epoch as f64;
                state.loss = pending_loss / pending as f64;
                state.learning_rate = lr;
                pending = 0;
                pending_loss = 0.0;

                pb.set_position(state.global_step as u64);
                pb.set_message(format!("loss {:.4}", state.loss));

                if self.config.logging_steps > 0 && state.global_step % self.config.logging_steps == 0 {
                    tracing::info!(
                        step = state.global_step,
                        epoch = format!("{:.2}", state.epoch),
                        loss = format!("{:.4}", state.loss),
                        learning_rate = lr,
                        grad_norm = format!("{:.4}", grad_norm),
                        "Training progress"
                    );
                }
                for callback in &mut self.callbacks {
                    callback.on_step_end(&state);
                }

                if self.config.eval_steps > 0 && state.global_step % self.config.eval_steps == 0 {
                    if let Some(eval_loss) = self.evaluate(eval)? {
                        tracing::info!(step = state.global_step, eval_loss = format!("{:.4}", eval_loss), "Evaluation");
                        last_eval = Some(eval_loss);
                        for callback in &mut self.callbacks {
                            callback.on_evaluate(&state, eval_loss);
                        }
                    }
                }

                if self.config.save_steps > 0 && state.global_step % self.config.save_steps == 0 {
                    let dir = checkpoint_dir(&self.config.output_dir, state.global_step);
                    self.adapter.save(&dir)?;
                    CheckpointState {
                        global_step: state.global_step,
                        epoch: state.epoch,
                        eval_loss: last_eval,
                    }
                    .save(&dir)?;

                    if let Some(eval_loss) = last_eval {
                        if best.as_ref().map_or(true, |(b, _)| eval_loss < *b) {
                            best = Some((eval_loss, dir.clone()));
                            state.best_eval_loss = Some(eval_loss);
                        }
                    }
                    rotate_checkpoints(
                        &self.config.output_dir,
                        self.config.save_total_limit,
                        best.as_ref().map(|(_, p)| p.as_path()),
                    )?;
                }
            }
        }
        pb.finish_with_message("training complete");

        if let Some((loss, dir)) = &best {
            tracing::info!("Loading best checkpoint {:?} (eval loss {:.4})", dir, loss);
            self.adapter.load_weights(dir)?;
        }
        let eval_loss = self.evaluate(eval)?;

        Ok(TrainingSummary {
            global_steps: state.global_step,
            epochs,
            train_examples: train.len(),
            train_loss: if loss_count > 0 { loss_sum / loss_count as f64 } else { 0.0 },
            eval_loss,
            best_checkpoint: best.map(|(_, dir)| dir),
            training_time: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::granite::tests::{tiny_config, tiny_lora_config};
    use crate::training::checkpoint::list_checkpoints;
    use candle_nn::{VarBuilder, VarMap};
    use std::str::FromStr;

    fn word_tokenizer() -> Tokenizer {
        Tokenizer::from_str(
            r#"{
                "version": "1.0",
                "truncation": null,
                "padding": null,
                "added_tokens": [],
                "normalizer": null,
                "pre_tokenizer": {"type": "Whitespace"},
                "post_processor": null,
                "decoder": null,
                "model": {
                    "type": "WordLevel",
                    "vocab": {"[UNK]": 0, "esg": 1, "skoru": 2, "yüksek": 3, "düşük": 4},
                    "unk_token": "[UNK]"
                }
            }"#,
        )
        .unwrap()
    }

    fn example(text: &str) -> TrainingExample {
        TrainingExample { text: text.to_string() }
    }

    fn train_config(dir: &std::path::Path) -> FineTuneConfig {
        FineTuneConfig {
            output_dir: dir.to_path_buf(),
            num_train_epochs: 8,
            batch_size: 2,
            gradient_accumulation_steps: 1,
            learning_rate: 0.02,
            warmup_steps: 0,
            logging_steps: 0,
            save_steps: 0,
            eval_steps: 0,
            ..Default::default()
        }
    }

    fn corpus() -> Vec<Vec<u32>> {
        vec![vec![1, 2, 3, 4, 5, 6], vec![1, 2, 3, 4, 5, 6], vec![7, 8, 9, 10], vec![7, 8, 9, 10]]
    }

    #[test]
    fn test_tokenize_corpus_truncates_and_drops_short() {
        let tokenizer = word_tokenizer();
        let examples = vec![example("esg skoru yüksek düşük esg"), example("esg")];
        let ids = tokenize_corpus(&tokenizer, &examples, 3).unwrap();
        assert_eq!(ids, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_collate_pads_and_masks() {
        let batch = collate(&[&[1, 2, 3], &[4, 5]], 0, &Device::Cpu).unwrap();
        assert_eq!(batch.inputs.to_vec2::<u32>().unwrap(), vec![vec![1, 2], vec![4, 5]]);
        assert_eq!(batch.targets.to_vec2::<u32>().unwrap(), vec![vec![2, 3], vec![5, 0]]);
        assert_eq!(batch.mask.to_vec2::<f32>().unwrap(), vec![vec![1.0, 1.0], vec![1.0, 0.0]]);
        assert!(collate(&[&[1]], 0, &Device::Cpu).is_err());
    }

    #[test]
    fn test_masked_cross_entropy_uniform_logits() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1, 2]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 0.]], &Device::Cpu).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &mask)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_masked_positions_do_not_count() {
        let logits = Tensor::new(&[[[5f32, 0.], [0., 5.]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 0]], &Device::Cpu).unwrap();
        let only_first = Tensor::new(&[[1f32, 0.]], &Device::Cpu).unwrap();
        let both = Tensor::new(&[[1f32, 1.]], &Device::Cpu).unwrap();

        let a = scalar(&masked_cross_entropy(&logits, &targets, &only_first).unwrap()).unwrap();
        let b = scalar(&masked_cross_entropy(&logits, &targets, &both).unwrap()).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut grads = vec![
            Some(Tensor::new(&[3f32], &Device::Cpu).unwrap()),
            None,
            Some(Tensor::new(&[4f32], &Device::Cpu).unwrap()),
        ];
        let norm = clip_grad_norm(&mut grads, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);

        let clipped = clip_grad_norm(&mut grads, 10.0).unwrap();
        assert!((clipped - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_training_reduces_loss() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &Device::Cpu);
        let mut adapter = LoraAdapter::new(tiny_lora_config(), Device::Cpu);
        let model = GraniteModel::load(&tiny_config(), vb, Some((adapter.config(), adapter.var_builder())))?;

        let data = corpus();
        let mut trainer = SftTrainer::new(&model, &mut adapter, train_config(dir.path()), 0).with_progress(false);
        let before = trainer.evaluate(&data)?.unwrap();
        let summary = trainer.train(&data, &data)?;
        let after = summary.eval_loss.unwrap();

        assert_eq!(summary.global_steps, 16);
        assert!(after < before, "before {} after {}", before, after);
        Ok(())
    }

    #[test]
    fn test_accumulated_steps_flush_at_epoch_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &Device::Cpu);
        let mut adapter = LoraAdapter::new(tiny_lora_config(), Device::Cpu);
        let model = GraniteModel::load(&tiny_config(), vb, Some((adapter.config(), adapter.var_builder())))?;

        // 4 micro-batches per epoch: one step after 3, one for the remainder
        let config = FineTuneConfig {
            num_train_epochs: 2,
            batch_size: 1,
            gradient_accumulation_steps: 3,
            ..train_config(dir.path())
        };
        let weights = |adapter: &LoraAdapter| -> Result<Vec<Vec<f32>>> {
            let mut all = Vec::new();
            for var in adapter.vars() {
                all.push(var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
            }
            Ok(all)
        };
        let before = weights(&adapter)?;

        let data = corpus();
        let summary = SftTrainer::new(&model, &mut adapter, config, 0)
            .with_progress(false)
            .train(&data, &data)?;
        assert_eq!(summary.global_steps, 4);
        assert_ne!(weights(&adapter)?, before);
        Ok(())
    }

    #[test]
    fn test_checkpoints_rotate_and_keep_best() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &Device::Cpu);
        let mut adapter = LoraAdapter::new(tiny_lora_config(), Device::Cpu);
        let model = GraniteModel::load(&tiny_config(), vb, Some((adapter.config(), adapter.var_builder())))?;

        let config = FineTuneConfig {
            num_train_epochs: 3,
            save_steps: 2,
            eval_steps: 2,
            save_total_limit: 1,
            ..train_config(dir.path())
        };
        let data = corpus();
        let summary = SftTrainer::new(&model, &mut adapter, config, 0)
            .with_progress(false)
            .train(&data, &data)?;

        let best = summary.best_checkpoint.expect("a checkpoint was saved");
        let left = list_checkpoints(dir.path())?;
        assert!(left.contains(&best));
        assert!(left.len() <= 2);
        assert!(CheckpointState::load(&best)?.eval_loss.is_some());
        Ok(())
    }
}
