// ESG inference engine
//
// Fixed-template analysis prompts over one shared generation routine. The
// backend is any `TextGeneration`, normally the fine-tuned Granite model.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::batch::{BatchResult, CompanyQuery};
use crate::config::{Config, GenerationConfig};
use crate::models::{
    get_device, get_dtype, AdapterMode, CandleGenerator, GraniteEsgAdapter, LoraAdapter,
    MemoryUsage, ModelLoader, TextGeneration,
};

/// A titled answer from the demo or the model self-test
#[derive(Debug)]
pub struct LabeledResponse {
    pub label: String,
    pub response: Result<String>,
}

/// Generation limits of the model self-test
pub fn model_test_generation() -> GenerationConfig {
    GenerationConfig {
        max_new_tokens: 100,
        max_input_tokens: 200,
        temperature: 0.7,
        top_p: None,
        repetition_penalty: 1.1,
        ..Default::default()
    }
}

/// (name, instruction, input) of the model self-test
const MODEL_TESTS: [(&str, &str, &str); 3] = [
    (
        "ESG Analizi",
        "Microsoft şirketinin ESG performansını analiz et",
        "Şirket: Microsoft Corporation (MSFT)\nSektör: Technology\nÜlke: USA",
    ),
    (
        "İyileştirme Stratejisi",
        "Tesla için ESG iyileştirme stratejisi öner",
        "Mevcut ESG: 45/100\nZayıf alan: Sosyal",
    ),
    (
        "Çevresel Değerlendirme",
        "Apple şirketinin çevresel performansını değerlendir",
        "Şirket: Apple Inc (AAPL)\nÇevresel skor: 75/100",
    ),
];

pub struct EsgInference {
    backend: Box<dyn TextGeneration>,
    generation: GenerationConfig,
    model_path: PathBuf,
    prompt_format: GraniteEsgAdapter,
}

impl EsgInference {
    pub fn new(backend: Box<dyn TextGeneration>, generation: GenerationConfig, model_path: PathBuf) -> Self {
        Self {
            backend,
            generation,
            model_path,
            prompt_format: GraniteEsgAdapter,
        }
    }

    /// Load `base_model` with the adapter and tokenizer saved in `model_path`
    pub fn load(model_path: &Path, base_model: &str, config: &Config) -> Result<Self> {
        if !LoraAdapter::exists(model_path) {
            anyhow::bail!(
                "No fine-tuned adapter in {:?} (run the `finetune` command first)",
                model_path
            );
        }

        let device = get_device(config.inference.device)?;
        let dtype = get_dtype(config.inference.dtype, &device);
        tracing::info!("Loading ESG model from {:?} on {:?}", model_path, device);

        let loader = ModelLoader::new(device, dtype, config.huggingface_token.clone());
        let loaded = loader
            .load(
                base_model,
                AdapterMode::Restore(model_path.to_path_buf()),
                Some(model_path),
            )
            .context("Model loading failed")?;
        tracing::info!("Model loaded");

        let backend = CandleGenerator::from_loaded(loaded, format!("{} + {}", base_model, model_path.display()));
        Ok(Self::new(Box::new(backend), config.generation.clone(), model_path.to_path_buf()))
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Shared generation routine with the configured sampling settings
    pub fn generate_response(&mut self, prompt: &str, max_tokens: usize) -> Result<String> {
        let params = GenerationConfig {
            max_new_tokens: max_tokens,
            ..self.generation.clone()
        };
        self.generate_with(prompt, &params)
    }

    pub fn generate_with(&mut self, prompt: &str, params: &GenerationConfig) -> Result<String> {
        self.backend.generate_text(prompt, params)
    }

    fn ask(&mut self, instruction: &str, input: &str) -> Result<String> {
        let prompt = self.prompt_format.format_instruction(instruction, input);
        let max_tokens = self.generation.max_new_tokens;
        self.generate_response(&prompt, max_tokens)
    }

    pub fn analyze_company_esg(&mut self, company: &str, ticker: &str, sector: &str, country: &str) -> Result<String> {
        self.ask(
            &format!("{} şirketinin ESG performansını analiz et", company),
            &format!(
                "Şirket: {} ({})\nSektör: {}\nÜlke: {}",
                company, ticker, sector, country
            ),
        )
    }

    pub fn suggest_esg_improvements(&mut self, company: &str, current_score: f64, weak_area: &str) -> Result<String> {
        self.ask(
            &format!("{} için ESG iyileştirme stratejisi öner", company),
            &format!("Mevcut ESG: {}/100\nZayıf alan: {}", current_score, weak_area),
        )
    }

    pub fn evaluate_environmental_performance(&mut self, company: &str, env_score: f64) -> Result<String> {
        self.ask(
            &format!("{} şirketinin çevresel performansını değerlendir", company),
            &format!("Çevresel skor: {}/100", env_score),
        )
    }

    pub fn assess_social_responsibility(&mut self, company: &str, social_score: f64) -> Result<String> {
        self.ask(
            &format!("{} şirketinin sosyal sorumluluk performansını değerlendir", company),
            &format!("Sosyal skor: {}/100", social_score),
        )
    }

    pub fn evaluate_governance(&mut self, company: &str, gov_score: f64) -> Result<String> {
        self.ask(
            &format!("{} şirketinin kurumsal yönetim kalitesini değerlendir", company),
            &format!("Yönetim skoru: {}/100", gov_score),
        )
    }

    pub fn compare_companies(&mut self, company1: &str, company2: &str, score1: f64, score2: f64) -> Result<String> {
        self.ask(
            &format!(
                "{} ve {} şirketlerini ESG performansı açısından karşılaştır",
                company1, company2
            ),
            &format!(
                "{} ESG skoru: {}/100\n{} ESG skoru: {}/100",
                company1, score1, company2, score2
            ),
        )
    }

    /// Company analysis for every query; one failure does not stop the rest
    pub fn batch_analyze(&mut self, companies: &[CompanyQuery]) -> Vec<BatchResult> {
        companies
            .iter()
            .map(|query| {
                let outcome =
                    self.analyze_company_esg(&query.company, &query.ticker, &query.sector, &query.country);
                if let Err(e) = &outcome {
                    tracing::warn!("Analysis of {} failed: {:#}", query.company, e);
                } else {
                    tracing::info!("{} analysis complete", query.company);
                }
                BatchResult::from_outcome(query, outcome)
            })
            .collect()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::current()
    }

    /// Three fixed demo analyses
    pub fn run_demo(&mut self) -> Vec<LabeledResponse> {
        vec![
            LabeledResponse {
                label: "Şirket ESG Analizi".to_string(),
                response: self.analyze_company_esg("Microsoft Corporation", "MSFT", "Technology", "USA"),
            },
            LabeledResponse {
                label: "İyileştirme Önerileri".to_string(),
                response: self.suggest_esg_improvements("Tesla Inc", 45.0, "Sosyal"),
            },
            LabeledResponse {
                label: "Çevresel Değerlendirme".to_string(),
                response: self.evaluate_environmental_performance("Apple Inc", 78.0),
            },
        ]
    }

    /// Fixed self-test prompts with short input and output limits
    pub fn run_model_tests(&mut self) -> Vec<LabeledResponse> {
        let params = model_test_generation();
        MODEL_TESTS
            .iter()
            .enumerate()
            .map(|(i, (name, instruction, input))| {
                tracing::info!("Test {}: {}", i + 1, name);
                let prompt = self.prompt_format.format_instruction(instruction, input);
                let response = self.generate_with(&prompt, &params);
                tracing::debug!("{}", self.memory_usage());
                LabeledResponse {
                    label: name.to_string(),
                    response,
                }
            })
            .collect()
    }
}
