// Fine-tuning corpus
//
// Turns the training table written by `analyze` into instruction examples
// and splits them into train and eval sets.

mod templates;

pub use templates::{
    assessment, create_training_examples, esg_analysis, improvement_plan, improvement_target,
    priority_area, quick_actions, recommendation, score_level, weakest_area, CompanyScores,
    TrainingExample, IMPROVEMENT_THRESHOLD,
};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::FineTuneConfig;
use crate::data::{sample_without_replacement, DataError, EsgRecord, EsgTable};

/// Score bins for down-sampling, upper bound inclusive: (0,40] (40,60] (60,80] (80,100]
const STRATA: [(&str, f64, f64); 4] = [
    ("Poor", 0.0, 40.0),
    ("Average", 40.0, 60.0),
    ("Good", 60.0, 80.0),
    ("Excellent", 80.0, 100.0),
];

/// Train and eval examples
#[derive(Debug, Clone, Default)]
pub struct DatasetSplit {
    pub train: Vec<TrainingExample>,
    pub eval: Vec<TrainingExample>,
}

impl DatasetSplit {
    pub fn len(&self) -> usize {
        self.train.len() + self.eval.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.eval.is_empty()
    }
}

pub struct EsgDataProcessor {
    config: FineTuneConfig,
}

impl EsgDataProcessor {
    pub fn new(config: FineTuneConfig) -> Self {
        Self { config }
    }

    /// Read the training CSV, down-sample, build examples and split them
    pub fn load_and_process_data(&self) -> Result<DatasetSplit> {
        tracing::info!("Loading ESG training data from {:?}", self.config.dataset_path);
        let table = EsgTable::from_path(&self.config.dataset_path)
            .context("Failed to load fine-tuning dataset")?;
        tracing::info!(rows = table.len(), "Training table loaded");

        if table.is_empty() {
            return Err(DataError::Empty.into());
        }

        let records = if table.len() > self.config.max_samples {
            let sampled = stratified_sample(table.records(), self.config.max_samples, self.config.seed);
            tracing::info!(rows = sampled.len(), "Down-sampled by ESG band");
            sampled
        } else {
            table.records().to_vec()
        };

        let examples: Vec<TrainingExample> =
            records.iter().flat_map(create_training_examples).collect();
        tracing::info!(examples = examples.len(), "Training examples created");

        split_examples(examples, self.config.eval_fraction, self.config.seed)
    }
}

/// `max_samples / 4` rows per score bin; rows outside every bin are dropped
pub fn stratified_sample(records: &[EsgRecord], max_samples: usize, seed: u64) -> Vec<EsgRecord> {
    let per_bin = max_samples / STRATA.len();

    STRATA
        .iter()
        .flat_map(|(name, lower, upper)| {
            let members: Vec<EsgRecord> = records
                .iter()
                .filter(|r| r.total_score().is_some_and(|s| s > *lower && s <= *upper))
                .cloned()
                .collect();
            tracing::debug!(band = *name, rows = members.len(), "ESG band");
            sample_without_replacement(&members, per_bin, seed)
        })
        .collect()
}

/// Shuffle with `seed` and hold out `ceil(len * eval_fraction)` examples
pub fn split_examples(
    mut examples: Vec<TrainingExample>,
    eval_fraction: f64,
    seed: u64,
) -> Result<DatasetSplit> {
    if examples.len() < 2 {
        return Err(DataError::TooFewExamples(examples.len()).into());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    examples.shuffle(&mut rng);

    let eval_len = ((examples.len() as f64 * eval_fraction).ceil() as usize)
        .clamp(1, examples.len() - 1);
    let train = examples.split_off(eval_len);

    Ok(DatasetSplit {
        train,
        eval: examples,
    })
}
