// Command-line interface
//
//   esg-granite analyze --input data/carbon-data/esg_scores.csv
//   esg-granite finetune --epochs 1
//   esg-granite infer
//   esg-granite batch --input companies.json --output results.json
//   esg-granite test-model
//   esg-granite ask --prompt "Tesla için öneri" --smart-mode

pub mod commands;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "esg-granite", version, about = "ESG data preparation, Granite LoRA fine-tuning and inference")]
pub struct Cli {
    /// Configuration file (default: ~/.esg-granite/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Default tracing filter when RUST_LOG is not set
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "warn",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze and clean the raw ESG scores, then build the training table
    Analyze(AnalyzeArgs),
    /// Fine-tune the base model with LoRA on the training table
    Finetune(FinetuneArgs),
    /// Run the demo analyses with the fine-tuned model
    Infer(ModelArgs),
    /// Analyze a JSON list of companies
    Batch(BatchArgs),
    /// Run the fixed model self-test prompts
    TestModel(ModelArgs),
    /// Answer one prompt and print the result as JSON
    Ask(AskArgs),
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Raw ESG scores CSV
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// Training table CSV to write
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Sample questions JSON to write
    #[arg(long)]
    pub questions: Option<PathBuf>,
    /// Number of sample questions
    #[arg(long)]
    pub samples: Option<usize>,
}

#[derive(Debug, Args)]
pub struct FinetuneArgs {
    /// Training table CSV
    #[arg(long)]
    pub dataset: Option<PathBuf>,
    /// Directory for the adapter, tokenizer and checkpoints
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub epochs: Option<usize>,
    #[arg(long)]
    pub max_samples: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ModelArgs {
    /// Fine-tuned model directory
    #[arg(long)]
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// JSON array of {company, ticker, sector, country}
    #[arg(long)]
    pub input: PathBuf,
    /// Where to write the results (stdout if omitted)
    #[arg(long)]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AskArgs {
    #[arg(long)]
    pub prompt: String,
    #[arg(long)]
    pub model_path: Option<PathBuf>,
    #[arg(long, default_value_t = 150)]
    pub max_tokens: usize,
    #[arg(long, default_value_t = 0.7)]
    pub temperature: f64,
    /// Route the prompt to a fixed ESG analysis by keyword
    #[arg(long)]
    pub smart_mode: bool,
}

/// Parse arguments without exiting on error
pub fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

/// Fold subcommand flags into the loaded configuration
pub fn apply_overrides(config: &mut Config, command: &Command) {
    match command {
        Command::Analyze(args) => {
            if let Some(input) = &args.input {
                config.data.raw_csv = input.clone();
            }
            if let Some(output) = &args.output {
                config.data.training_csv = output.clone();
            }
            if let Some(questions) = &args.questions {
                config.data.questions_json = questions.clone();
            }
            if let Some(samples) = args.samples {
                config.data.sample_questions = samples;
            }
        }
        Command::Finetune(args) => {
            if let Some(dataset) = &args.dataset {
                config.finetune.dataset_path = dataset.clone();
            }
            if let Some(output) = &args.output {
                config.finetune.output_dir = output.clone();
            }
            if let Some(epochs) = args.epochs {
                config.finetune.num_train_epochs = epochs;
            }
            if let Some(max_samples) = args.max_samples {
                config.finetune.max_samples = max_samples;
            }
        }
        Command::Infer(ModelArgs { model_path })
        | Command::TestModel(ModelArgs { model_path })
        | Command::Batch(BatchArgs { model_path, .. })
        | Command::Ask(AskArgs { model_path, .. }) => {
            if let Some(path) = model_path {
                config.inference.model_path = path.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyze_overrides() {
        let cli = parse_args(["esg-granite", "analyze", "--input", "raw.csv", "--samples", "10"]).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.data.raw_csv, PathBuf::from("raw.csv"));
        assert_eq!(config.data.sample_questions, 10);
        assert_eq!(config.data.training_csv, Config::default().data.training_csv);
    }

    #[test]
    fn test_parse_finetune_overrides() {
        let cli = parse_args([
            "esg-granite",
            "finetune",
            "--epochs",
            "1",
            "--max-samples",
            "200",
            "--output",
            "out",
        ])
        .unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.finetune.num_train_epochs, 1);
        assert_eq!(config.finetune.max_samples, 200);
        assert_eq!(config.finetune.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_parse_ask() {
        let cli = parse_args([
            "esg-granite",
            "ask",
            "--prompt",
            "Tesla analiz",
            "--smart-mode",
            "--model-path",
            "m",
        ])
        .unwrap();
        match &cli.command {
            Command::Ask(args) => {
                assert_eq!(args.prompt, "Tesla analiz");
                assert!(args.smart_mode);
                assert_eq!(args.max_tokens, 150);
                assert_eq!(args.temperature, 0.7);
            }
            other => panic!("Expected Ask, got {:?}", other),
        }
        let mut config = Config::default();
        apply_overrides(&mut config, &cli.command);
        assert_eq!(config.inference.model_path, PathBuf::from("m"));
    }

    #[test]
    fn test_ask_requires_prompt() {
        assert!(parse_args(["esg-granite", "ask"]).is_err());
    }

    #[test]
    fn test_global_flags_and_log_filter() {
        let cli = parse_args(["esg-granite", "test-model", "-vv"]).unwrap();
        assert_eq!(cli.log_filter(), "trace");
        let cli = parse_args(["esg-granite", "--quiet", "infer"]).unwrap();
        assert_eq!(cli.log_filter(), "warn");
        let cli = parse_args(["esg-granite", "infer", "--config", "c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert_eq!(cli.log_filter(), "info");
    }
}
