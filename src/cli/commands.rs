// Subcommand handlers
// Reports go to stdout; `ask` prints exactly one JSON object there.

use anyhow::{Context, Result};

use super::{apply_overrides, AskArgs, BatchArgs, Cli, Command};
use crate::config::constants::DEFAULT_OUTPUT_DIR;
use crate::config::{load_config, Config};
use crate::data::run_analysis;
use crate::inference::{
    load_queries, save_results, AskOutcome, AskRequest, EsgInference, GraniteCliAdapter,
    LabeledResponse,
};
use crate::training::GraniteFineTuner;

/// Run the parsed command; returns the process exit code
pub fn run(cli: Cli) -> Result<i32> {
    if let Command::Ask(args) = &cli.command {
        return Ok(run_ask(&cli, args));
    }

    let mut config = load_config(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli.command);

    match &cli.command {
        Command::Analyze(_) => run_analyze(&config)?,
        Command::Finetune(_) => run_finetune(&config)?,
        Command::Infer(_) => run_infer(&config)?,
        Command::Batch(args) => run_batch(&config, args)?,
        Command::TestModel(_) => run_test_model(&config)?,
        // answered before config loading so failures still produce JSON
        Command::Ask(_) => {}
    }
    Ok(0)
}

fn separator() -> String {
    "=".repeat(50)
}

fn print_responses(responses: &[LabeledResponse]) {
    for (i, item) in responses.iter().enumerate() {
        println!("\n{}. {}", i + 1, item.label);
        println!("{}", "-".repeat(40));
        match &item.response {
            Ok(text) => println!("{}", text),
            Err(e) => println!("Response generation error: {:#}", e),
        }
    }
}

fn load_engine(config: &Config) -> Result<EsgInference> {
    EsgInference::load(
        &config.inference.model_path,
        &config.inference.base_model,
        config,
    )
}

fn run_analyze(config: &Config) -> Result<()> {
    println!("ESG DATA ANALYSIS");
    println!("{}", separator());

    let summary = run_analysis(&config.data)?;
    println!("{}", summary.quality);
    println!("{}", summary.anomalies);
    println!("{}", summary.cleaning);
    println!("{}", summary.training);
    println!(
        "{} sample questions saved to {}",
        summary.questions.len(),
        config.data.questions_json.display()
    );
    println!("\nNext step: esg-granite finetune");
    Ok(())
}

fn run_finetune(config: &Config) -> Result<()> {
    println!("GRANITE ESG FINE-TUNING");
    println!("{}", separator());

    let tuner = GraniteFineTuner::new(config.finetune.clone(), config.huggingface_token.clone());
    let outcome = tuner.run_training().context("Fine-tuning failed")?;

    println!("{}", outcome.summary);
    println!("Model saved to {}", config.finetune.output_dir.display());
    for test in &outcome.smoke_tests {
        println!("\nQ: {}", test.instruction);
        match &test.response {
            Ok(text) => println!("A: {}", text),
            Err(e) => println!("Test error: {:#}", e),
        }
    }
    Ok(())
}

fn run_infer(config: &Config) -> Result<()> {
    println!("ESG GRANITE INFERENCE DEMO");
    println!("{}", separator());

    let mut engine = load_engine(config)?;
    print_responses(&engine.run_demo());
    println!("\n{}", engine.memory_usage());
    Ok(())
}

fn run_batch(config: &Config, args: &BatchArgs) -> Result<()> {
    let queries = load_queries(&args.input)?;
    tracing::info!("Analyzing {} companies", queries.len());

    let mut engine = load_engine(config)?;
    let results = engine.batch_analyze(&queries);

    match &args.output {
        Some(path) => {
            save_results(path, &results)?;
            println!("{} results saved to {}", results.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&results)?),
    }
    Ok(())
}

fn run_test_model(config: &Config) -> Result<()> {
    println!("GRANITE ESG MODEL TEST");
    println!("{}", separator());

    let mut engine = match load_engine(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Model test failed: {:#}", e);
            tracing::error!("  - close other programs using the GPU");
            tracing::error!("  - check the model files in {:?}", config.inference.model_path);
            return Err(e);
        }
    };
    let results = engine.run_model_tests();
    print_responses(&results);

    let failures = results.iter().filter(|r| r.response.is_err()).count();
    if failures > 0 {
        anyhow::bail!("{} of {} model tests failed", failures, results.len());
    }
    println!("\nModel test complete");
    Ok(())
}

/// Request as given on the command line; the adapter path defaults to the
/// fine-tuning output directory
fn ask_request(args: &AskArgs) -> AskRequest {
    AskRequest {
        prompt: args.prompt.clone(),
        model_path: args
            .model_path
            .clone()
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.into()),
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        smart_mode: args.smart_mode,
    }
}

fn run_ask(cli: &Cli, args: &AskArgs) -> i32 {
    let mut request = ask_request(args);

    let outcome = match load_config(cli.config.as_deref()) {
        Ok(mut config) => {
            apply_overrides(&mut config, &cli.command);
            request.model_path = config.inference.model_path.clone();
            match GraniteCliAdapter::load(&request.model_path, &config) {
                Ok(mut adapter) => adapter.ask(&request),
                Err(e) => AskOutcome::failure(&request, &e),
            }
        }
        Err(e) => AskOutcome::failure(&request, &e),
    };

    match outcome.to_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            tracing::error!("Failed to serialize result: {:#}", e);
            return 1;
        }
    }
    outcome.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::parse_args;
    use std::path::PathBuf;

    fn ask_args(argv: &[&str]) -> AskArgs {
        match parse_args(argv).unwrap().command {
            Command::Ask(args) => args,
            other => panic!("expected ask, got {:?}", other),
        }
    }

    #[test]
    fn test_ask_request_defaults_model_path() {
        let request = ask_request(&ask_args(&["esg-granite", "ask", "--prompt", "Merhaba"]));
        assert_eq!(request.model_path, PathBuf::from("./models/granite-esg"));

        let config_error = AskOutcome::failure(&request, &anyhow::anyhow!("bad config"));
        let json: serde_json::Value = serde_json::from_str(&config_error.to_json().unwrap()).unwrap();
        assert_eq!(json["model_path"], "./models/granite-esg");
    }

    #[test]
    fn test_ask_request_keeps_given_model_path() {
        let request = ask_request(&ask_args(&["esg-granite", "ask", "--prompt", "Merhaba", "--model-path", "m"]));
        assert_eq!(request.model_path, PathBuf::from("m"));
        assert_eq!(request.max_tokens, 150);
    }
}
