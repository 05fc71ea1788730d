// ESG data pipeline
// Loads the raw scores export, reports on it, cleans it and samples the
// fine-tuning table plus a set of review questions.

mod analyzer;
mod cleaning;
mod questions;
mod record;
pub mod stats;
mod training_set;

pub use analyzer::{
    run_analysis, AnalysisSummary, AnomalyEntry, AnomalyReport, EsgDataAnalyzer, MissingColumn,
    QualityReport,
};
pub use cleaning::{clean, CleaningReport};
pub use questions::{generate_sample_questions, save_questions, SampleQuestion, SAMPLE_CONTEXT};
pub use record::{DerivedColumn, EsgRecord, EsgTable, ScoreColumn, TextColumn};
pub use training_set::{
    create_training_dataset, latest_per_company, RowCategories, ScoreCategory, TrainingSet,
};

pub(crate) use training_set::sample_without_replacement;

use thiserror::Error;

/// Failures of the data layer that callers may want to match on
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Required column '{0}' is missing from the data")]
    MissingColumn(String),

    #[error("The data set is empty")]
    Empty,

    #[error("No data loaded; call load_data() first")]
    NotLoaded,

    #[error("Only {0} training examples were produced; at least 2 are needed for a train/eval split")]
    TooFewExamples(usize),
}
