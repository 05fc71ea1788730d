// Project-wide constants
//
// Column names, prompt markers and default paths live here so the data
// analyzer, the corpus builder and the inference engine agree on them.
// Import via `use crate::config::constants::*;`.

/// Default Hugging Face checkpoint used as the frozen base model.
pub const DEFAULT_BASE_MODEL: &str = "ibm-granite/granite-3.0-8b-instruct";

/// Where fine-tuned adapters, tokenizer and training metadata are written.
pub const DEFAULT_OUTPUT_DIR: &str = "./models/granite-esg";

/// Raw ESG scores exported from the data provider.
pub const DEFAULT_RAW_CSV: &str = "./data/carbon-data/esg_scores.csv";

/// Cleaned, stratified training table produced by `analyze`.
pub const DEFAULT_TRAINING_CSV: &str = "./data/esg_training_data.csv";

/// Sample questions produced by `analyze`.
pub const DEFAULT_QUESTIONS_JSON: &str = "./data/sample_questions.json";

/// Config directory under the user's home.
pub const CONFIG_DIR_NAME: &str = ".esg-granite";

/// Config file name inside [`CONFIG_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.toml";

// --- CSV columns ---

pub const COL_DATE: &str = "Date";
pub const COL_COMPANY: &str = "Company";
pub const COL_TICKER: &str = "Ticker";
pub const COL_COUNTRY: &str = "Country";
pub const COL_REGION: &str = "Region";
pub const COL_PEER_GROUP: &str = "Peer_group_root";

/// Derived category columns appended to the training table.
pub const COL_ESG_CATEGORY: &str = "esg_category";
pub const COL_ENV_CATEGORY: &str = "env_category";
pub const COL_SOCIAL_CATEGORY: &str = "social_category";
pub const COL_GOV_CATEGORY: &str = "gov_category";

/// Upper bound of a valid ESG score.
pub const MAX_SCORE: f64 = 100.0;

/// Maximum rows drawn per ESG category when building the training table.
pub const TRAINING_ROWS_PER_CATEGORY: usize = 500;

/// Seed shared by every sampling step so repeated runs pick the same rows.
pub const SAMPLING_SEED: u64 = 42;

// --- Prompt format ---

/// System instruction prepended to every ESG prompt.
pub const ESG_SYSTEM_PROMPT: &str = "ESG uzmanısın. Kısa ve net yanıt ver.";

pub const SYSTEM_MARKER: &str = "<|system|>";
pub const USER_MARKER: &str = "<|user|>";
pub const ASSISTANT_MARKER: &str = "<|assistant|>";
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Memory check cadence for the training monitor (optimizer steps).
pub const MEMORY_CHECK_INTERVAL: usize = 10;
