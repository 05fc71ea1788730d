// LoRA fine-tuning

pub mod callbacks;
pub mod checkpoint;
pub mod pipeline;
pub mod schedule;
pub mod trainer;

pub use callbacks::{MemoryMonitor, TrainerCallback, TrainerState};
pub use checkpoint::{TrainingRecord, TRAINING_CONFIG_FILE};
pub use pipeline::{FineTuneOutcome, GraniteFineTuner, SmokeTestResult};
pub use schedule::LinearWarmup;
pub use trainer::{SftTrainer, TrainingSummary};
