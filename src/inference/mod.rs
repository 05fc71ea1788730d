// Inference over the fine-tuned ESG model

pub mod adapter;
pub mod batch;
pub mod engine;

pub use adapter::{extract_company_name, AskOutcome, AskRequest, GraniteCliAdapter, SmartRoute};
pub use batch::{load_queries, save_results, BatchResult, BatchStatus, CompanyQuery};
pub use engine::{EsgInference, LabeledResponse};
