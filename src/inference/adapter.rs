// CLI adapter over the inference engine
//
// Routes free-text prompts to the fixed analyses by keyword and reports the
// outcome as a single JSON object for callers such as agent frameworks.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use super::engine::EsgInference;
use crate::config::{Config, GenerationConfig};

const ANALYSIS_KEYWORDS: [&str; 3] = ["analiz", "performans", "değerlendir"];
const ROUTED_COMPANIES: [&str; 4] = ["tesla", "apple", "microsoft", "google"];
const IMPROVEMENT_KEYWORDS: [&str; 4] = ["iyileştir", "öneri", "strateji", "geliştir"];
const ENVIRONMENT_KEYWORDS: [&str; 4] = ["çevre", "environmental", "karbon", "emisyon"];

/// Known companies in match order
const COMMON_COMPANIES: [(&str, &str); 7] = [
    ("tesla", "Tesla Inc"),
    ("apple", "Apple Inc"),
    ("microsoft", "Microsoft Corporation"),
    ("google", "Google LLC"),
    ("amazon", "Amazon.com Inc"),
    ("meta", "Meta Platforms Inc"),
    ("netflix", "Netflix Inc"),
];

pub const UNKNOWN_COMPANY: &str = "Unknown Company";

/// Score assumed when routing to improvement suggestions
const DEFAULT_CURRENT_SCORE: f64 = 60.0;
const DEFAULT_WEAK_AREA: &str = "Genel";
/// Score assumed when routing to the environmental evaluation
const DEFAULT_ENV_SCORE: f64 = 70.0;

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Canonical name of the first known company mentioned in `prompt`
pub fn extract_company_name(prompt: &str) -> &'static str {
    let lower = prompt.to_lowercase();
    COMMON_COMPANIES
        .iter()
        .find(|(key, _)| lower.contains(key))
        .map(|(_, name)| *name)
        .unwrap_or(UNKNOWN_COMPANY)
}

/// Which analysis a free-text prompt maps to
#[derive(Debug, Clone, PartialEq)]
pub enum SmartRoute {
    CompanyAnalysis { company: &'static str },
    Improvements { company: &'static str },
    Environmental { company: &'static str },
    Generic,
}

impl SmartRoute {
    pub fn from_prompt(prompt: &str) -> Self {
        let lower = prompt.to_lowercase();

        if contains_any(&lower, &ANALYSIS_KEYWORDS) && contains_any(&lower, &ROUTED_COMPANIES) {
            return SmartRoute::CompanyAnalysis {
                company: extract_company_name(prompt),
            };
        }
        if contains_any(&lower, &IMPROVEMENT_KEYWORDS) {
            return SmartRoute::Improvements {
                company: extract_company_name(prompt),
            };
        }
        if contains_any(&lower, &ENVIRONMENT_KEYWORDS) {
            return SmartRoute::Environmental {
                company: extract_company_name(prompt),
            };
        }
        SmartRoute::Generic
    }
}

/// Arguments of one `ask` invocation
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub prompt: String,
    pub model_path: PathBuf,
    pub max_tokens: usize,
    pub temperature: f64,
    pub smart_mode: bool,
}

/// JSON printed by `ask`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AskOutcome {
    Success {
        success: bool,
        response: String,
        model_path: PathBuf,
        prompt: String,
        smart_mode: bool,
    },
    Failure {
        success: bool,
        error: String,
        model_path: PathBuf,
        prompt: String,
    },
}

impl AskOutcome {
    pub fn success(request: &AskRequest, response: String) -> Self {
        AskOutcome::Success {
            success: true,
            response,
            model_path: request.model_path.clone(),
            prompt: request.prompt.clone(),
            smart_mode: request.smart_mode,
        }
    }

    pub fn failure(request: &AskRequest, error: &anyhow::Error) -> Self {
        AskOutcome::Failure {
            success: false,
            error: format!("{:#}", error),
            model_path: request.model_path.clone(),
            prompt: request.prompt.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AskOutcome::Success { .. })
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub struct GraniteCliAdapter {
    engine: EsgInference,
}

impl GraniteCliAdapter {
    pub fn new(engine: EsgInference) -> Self {
        Self { engine }
    }

    pub fn load(model_path: &std::path::Path, config: &Config) -> Result<Self> {
        let engine = EsgInference::load(model_path, &config.inference.base_model, config)?;
        Ok(Self::new(engine))
    }

    pub fn engine(&mut self) -> &mut EsgInference {
        &mut self.engine
    }

    /// Plain generation for an arbitrary prompt
    pub fn generate_response(&mut self, prompt: &str, max_tokens: usize, temperature: f64) -> Result<String> {
        let params = GenerationConfig {
            max_new_tokens: max_tokens,
            temperature,
            ..self.engine.generation().clone()
        };
        self.engine
            .generate_with(prompt, &params)
            .context("Response generation error")
    }

    /// Route `prompt` to the matching fixed analysis, or generate freely
    pub fn smart_esg_analysis(&mut self, prompt: &str) -> Result<String> {
        let route = SmartRoute::from_prompt(prompt);
        tracing::debug!(?route, "Smart routing");

        match route {
            SmartRoute::CompanyAnalysis { company } => {
                self.engine.analyze_company_esg(company, "", "Technology", "USA")
            }
            SmartRoute::Improvements { company } => {
                self.engine
                    .suggest_esg_improvements(company, DEFAULT_CURRENT_SCORE, DEFAULT_WEAK_AREA)
            }
            SmartRoute::Environmental { company } => {
                self.engine.evaluate_environmental_performance(company, DEFAULT_ENV_SCORE)
            }
            SmartRoute::Generic => {
                let defaults = self.engine.generation().clone();
                self.generate_response(prompt, defaults.max_new_tokens, defaults.temperature)
            }
        }
    }

    pub fn ask(&mut self, request: &AskRequest) -> AskOutcome {
        let result = if request.smart_mode {
            self.smart_esg_analysis(&request.prompt)
        } else {
            self.generate_response(&request.prompt, request.max_tokens, request.temperature)
        };
        match result {
            Ok(response) => AskOutcome::success(request, response),
            Err(e) => AskOutcome::failure(request, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TextGeneration;
    use std::sync::{Arc, Mutex};

    struct Canned {
        seen: Arc<Mutex<Vec<(String, GenerationConfig)>>>,
        fail: bool,
    }

    impl TextGeneration for Canned {
        fn generate_text(&mut self, prompt: &str, params: &GenerationConfig) -> Result<String> {
            self.seen.lock().unwrap().push((prompt.to_string(), params.clone()));
            if self.fail {
                anyhow::bail!("CUDA error");
            }
            Ok("tamam".to_string())
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn scripted_adapter(fail: bool) -> (GraniteCliAdapter, Arc<Mutex<Vec<(String, GenerationConfig)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = EsgInference::new(
            Box::new(Canned {
                seen: seen.clone(),
                fail,
            }),
            GenerationConfig::default(),
            PathBuf::from("./models/granite-esg"),
        );
        (GraniteCliAdapter::new(engine), seen)
    }

    fn request(prompt: &str, smart_mode: bool) -> AskRequest {
        AskRequest {
            prompt: prompt.to_string(),
            model_path: PathBuf::from("./models/granite-esg"),
            max_tokens: 80,
            temperature: 0.2,
            smart_mode,
        }
    }

    #[test]
    fn test_extract_company_name() {
        assert_eq!(extract_company_name("TESLA ve Apple"), "Tesla Inc");
        assert_eq!(extract_company_name("netflix hakkında"), "Netflix Inc");
        assert_eq!(extract_company_name("Bir banka"), UNKNOWN_COMPANY);
    }

    #[test]
    fn test_routing_order() {
        assert_eq!(
            SmartRoute::from_prompt("Microsoft ESG performansını analiz et"),
            SmartRoute::CompanyAnalysis {
                company: "Microsoft Corporation"
            }
        );
        // analysis keyword without a routed company falls through
        assert_eq!(
            SmartRoute::from_prompt("Amazon için analiz ve strateji"),
            SmartRoute::Improvements {
                company: "Amazon.com Inc"
            }
        );
        assert_eq!(
            SmartRoute::from_prompt("Karbon emisyonu yüksek mi?"),
            SmartRoute::Environmental {
                company: UNKNOWN_COMPANY
            }
        );
        assert_eq!(SmartRoute::from_prompt("Merhaba"), SmartRoute::Generic);
    }

    #[test]
    fn test_smart_mode_uses_fixed_prompt() {
        let (mut adapter, seen) = scripted_adapter(false);
        let outcome = adapter.ask(&request("Tesla için öneri ver", true));
        assert!(outcome.is_success());

        let prompt = seen.lock().unwrap()[0].0.clone();
        assert!(prompt.contains("Tesla Inc için ESG iyileştirme stratejisi öner\nMevcut ESG: 60/100\nZayıf alan: Genel"));
    }

    #[test]
    fn test_plain_mode_passes_limits() {
        let (mut adapter, seen) = scripted_adapter(false);
        adapter.ask(&request("Merhaba", false));

        let (prompt, params) = seen.lock().unwrap()[0].clone();
        assert_eq!(prompt, "Merhaba");
        assert_eq!(params.max_new_tokens, 80);
        assert_eq!(params.temperature, 0.2);
    }

    #[test]
    fn test_outcome_json() {
        let (mut ok_adapter, _) = scripted_adapter(false);
        let ok: serde_json::Value =
            serde_json::from_str(&ok_adapter.ask(&request("Merhaba", true)).to_json().unwrap()).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["response"], "tamam");
        assert_eq!(ok["smart_mode"], true);
        assert_eq!(ok["model_path"], "./models/granite-esg");

        let (mut failing, _) = scripted_adapter(true);
        let outcome = failing.ask(&request("Merhaba", false));
        assert_eq!(outcome.exit_code(), 1);
        let err: serde_json::Value = serde_json::from_str(&outcome.to_json().unwrap()).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "Response generation error: CUDA error");
        assert!(err.get("smart_mode").is_none());
    }
}
