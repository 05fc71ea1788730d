// Text generation - backend-agnostic trait and the candle implementation

use anyhow::{Context, Result};
use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tokenizers::Tokenizer;

use super::adapters::{GraniteEsgAdapter, LocalModelAdapter};
use super::granite::GraniteModel;
use super::loader::LoadedModel;
use crate::config::GenerationConfig;

/// Text generation over a prompt string.
///
/// The inference layer only sees this trait, so tests can swap in a canned
/// backend without loading weights.
pub trait TextGeneration: Send {
    /// Generate a completion for `prompt`; returns only the new, cleaned text
    fn generate_text(&mut self, prompt: &str, params: &GenerationConfig) -> Result<String>;

    /// Model name/description
    fn name(&self) -> &str;
}

/// Sampling strategy for `params`; greedy when temperature is not positive
pub fn sampling_for(params: &GenerationConfig) -> Sampling {
    if params.temperature <= 0.0 {
        Sampling::ArgMax
    } else {
        match params.top_p {
            Some(p) if p < 1.0 => Sampling::TopP {
                p,
                temperature: params.temperature,
            },
            _ => Sampling::All {
                temperature: params.temperature,
            },
        }
    }
}

/// Keep the first `max_tokens` ids
fn truncate_prompt(mut ids: Vec<u32>, max_tokens: usize) -> Vec<u32> {
    if max_tokens > 0 && ids.len() > max_tokens {
        tracing::debug!(from = ids.len(), to = max_tokens, "Truncating prompt");
        ids.truncate(max_tokens);
    }
    ids
}

/// Granite model driven by candle with KV-cache decoding
pub struct CandleGenerator {
    model: GraniteModel,
    tokenizer: Tokenizer,
    eos_token_ids: Vec<u32>,
    name: String,
    adapter: Box<dyn LocalModelAdapter>,
}

impl CandleGenerator {
    pub fn new(model: GraniteModel, tokenizer: Tokenizer, eos_token_ids: Vec<u32>, name: impl Into<String>) -> Self {
        Self {
            model,
            tokenizer,
            eos_token_ids,
            name: name.into(),
            adapter: Box::new(GraniteEsgAdapter),
        }
    }

    /// Use another family's output cleanup
    pub fn with_adapter(mut self, adapter: Box<dyn LocalModelAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn from_loaded(loaded: LoadedModel, name: impl Into<String>) -> Self {
        Self::new(loaded.model, loaded.tokenizer, loaded.eos_token_ids, name)
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode_tokens(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow::anyhow!("Decode failed: {}", e))
    }

    /// Decode generated ids and strip any chat markers the model produced
    pub fn finish_text(&self, tokens: &[u32]) -> Result<String> {
        Ok(self.adapter.clean_output(&self.decode_tokens(tokens)?))
    }

    /// Autoregressive decoding; returns only the generated ids
    pub fn generate(&mut self, input_ids: &[u32], params: &GenerationConfig) -> Result<Vec<u32>> {
        if input_ids.is_empty() {
            anyhow::bail!("Cannot generate from an empty prompt");
        }

        let device = self.model.device().clone();
        let mut logits_processor = LogitsProcessor::from_sampling(params.seed, sampling_for(params));
        let mut context = input_ids.to_vec();
        let mut generated = Vec::with_capacity(params.max_new_tokens);

        self.model.clear_kv_cache();

        let mut step_input = input_ids.to_vec();
        let mut offset = 0;

        for _ in 0..params.max_new_tokens {
            let input = Tensor::new(step_input.as_slice(), &device)?.unsqueeze(0)?;
            let logits = self
                .model
                .forward(&input, offset)
                .context("Forward pass failed")?
                .squeeze(0)?;
            offset += step_input.len();

            let logits = if params.repetition_penalty != 1.0 {
                candle_transformers::utils::apply_repeat_penalty(
                    &logits,
                    params.repetition_penalty,
                    &context,
                )?
            } else {
                logits
            };

            let next_token = logits_processor.sample(&logits).context("Sampling failed")?;
            if self.eos_token_ids.contains(&next_token) {
                break;
            }

            generated.push(next_token);
            context.push(next_token);
            step_input = vec![next_token];
        }

        Ok(generated)
    }
}

impl TextGeneration for CandleGenerator {
    fn generate_text(&mut self, prompt: &str, params: &GenerationConfig) -> Result<String> {
        let input_ids = truncate_prompt(self.tokenize(prompt)?, params.max_input_tokens);
        let output_ids = self.generate(&input_ids, params)?;
        tracing::debug!(prompt_tokens = input_ids.len(), new_tokens = output_ids.len(), "Generation finished");
        self.finish_text(&output_ids)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::granite::tests::tiny_config;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn tiny_generator(eos: Vec<u32>) -> CandleGenerator {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = GraniteModel::load(&tiny_config(), vb, None).unwrap();
        let tokenizer = Tokenizer::new(tokenizers::models::bpe::BPE::default());
        CandleGenerator::new(model, tokenizer, eos, "tiny")
    }

    fn greedy(max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens,
            temperature: 0.0,
            repetition_penalty: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_sampling_selection() {
        assert!(matches!(sampling_for(&greedy(1)), Sampling::ArgMax));
        assert!(matches!(
            sampling_for(&GenerationConfig::default()),
            Sampling::TopP { .. }
        ));
        let no_top_p = GenerationConfig {
            top_p: None,
            ..Default::default()
        };
        assert!(matches!(sampling_for(&no_top_p), Sampling::All { .. }));
    }

    #[test]
    fn test_truncate_prompt_keeps_head() {
        assert_eq!(truncate_prompt(vec![1, 2, 3, 4], 2), vec![1, 2]);
        assert_eq!(truncate_prompt(vec![1, 2], 5), vec![1, 2]);
    }

    #[test]
    fn test_generate_respects_max_new_tokens() {
        let mut generator = tiny_generator(vec![]);
        let out = generator.generate(&[1, 2, 3], &greedy(5)).unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|t| *t < 32));
    }

    #[test]
    fn test_greedy_generation_is_deterministic() {
        let mut generator = tiny_generator(vec![]);
        let a = generator.generate(&[4, 5, 6], &greedy(4)).unwrap();
        let b = generator.generate(&[4, 5, 6], &greedy(4)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generation_stops_at_eos() {
        let mut generator = tiny_generator(vec![]);
        let first = generator.generate(&[7, 8], &greedy(1)).unwrap()[0];

        let mut stopping = CandleGenerator {
            eos_token_ids: vec![first],
            ..generator
        };
        assert!(stopping.generate(&[7, 8], &greedy(5)).unwrap().is_empty());
    }

    #[test]
    fn test_finish_text_cuts_at_next_turn() {
        let tokenizer: Tokenizer = r#"{
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
                "vocab": {"[UNK]": 0, "yanıt": 1, "<|user|>": 2, "soru": 3},
                "unk_token": "[UNK]"
            }
        }"#
        .parse()
        .unwrap();
        let generator = CandleGenerator {
            tokenizer,
            ..tiny_generator(vec![])
        };

        assert_eq!(generator.finish_text(&[1, 2, 3]).unwrap(), "yanıt");
        assert_eq!(generator.finish_text(&[1, 3]).unwrap(), "yanıt soru");
    }

    #[test]
    fn test_empty_prompt_is_rejected() {
        let mut generator = tiny_generator(vec![]);
        assert!(generator.generate(&[], &greedy(3)).is_err());
    }
}
