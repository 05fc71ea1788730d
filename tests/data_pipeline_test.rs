// End-to-end data preparation: raw CSV -> training table -> fine-tuning corpus

use anyhow::Result;
use esg_granite::config::{DataConfig, FineTuneConfig};
use esg_granite::data::{run_analysis, EsgTable, SampleQuestion, ScoreCategory, SAMPLE_CONTEXT};
use esg_granite::dataset::EsgDataProcessor;
use std::fs;

const RAW: &str = "\
Date,Company,Ticker,Country,Region,Peer_group_root,total_esg_score,environment_score,social_score,governance_score
2021-06-30,Alpha Corp,ALP,USA,Americas,Technology,20,15,25,20
2022-06-30,Alpha Corp,ALP,USA,Americas,Technology,25,20,30,25
2022-06-30,Alpha Corp,ALP,USA,Americas,Technology,25,20,30,25
2022-06-30,Beta AG,BET,Germany,Europe,Industrials,55,50,60,50
2022-06-30,Zeta Co,ZET,Japan,Asia,Energy,60,,60,60
2022-06-30,Gamma SA,GAM,,Europe,Retail,72,70,75,71
2022-06-30,Delta Ltd,DLT,UK,Europe,,88,90,85,89
2022-06-30,Epsilon Inc,EPS,USA,Americas,Energy,-3,10,10,10
2022-06-30,,ZZZ,USA,Americas,Energy,50,50,50,50
";

#[test]
fn test_analysis_then_corpus() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let raw_csv = dir.path().join("esg_scores.csv");
    fs::write(&raw_csv, RAW)?;

    let data = DataConfig {
        raw_csv,
        training_csv: dir.path().join("out/esg_training_data.csv"),
        questions_json: dir.path().join("out/sample_questions.json"),
        sample_questions: 50,
    };
    let summary = run_analysis(&data)?;

    // 9 rows: missing company, negative score, missing environment score and
    // duplicate removed
    assert_eq!(summary.cleaning.final_count, 5);
    assert_eq!(summary.training.len(), 4);
    assert_eq!(
        summary.training.distribution(),
        vec![
            (ScoreCategory::Excellent, 1),
            (ScoreCategory::Good, 1),
            (ScoreCategory::Average, 1),
            (ScoreCategory::Poor, 1),
        ]
    );

    let written = EsgTable::from_path(&data.training_csv)?;
    assert_eq!(written.len(), 4);
    assert!(written.has_column("esg_category"));
    assert!(written.has_column("gov_category"));

    let questions: Vec<SampleQuestion> =
        serde_json::from_str(&fs::read_to_string(&data.questions_json)?)?;
    assert_eq!(questions.len(), 4);
    assert!(questions.iter().all(|q| q.context == SAMPLE_CONTEXT));

    // Alpha (25) and Beta (55) are below 70 and get an improvement plan too
    let split = EsgDataProcessor::new(FineTuneConfig {
        dataset_path: data.training_csv.clone(),
        ..Default::default()
    })
    .load_and_process_data()?;
    assert_eq!(split.len(), 6);
    assert_eq!(split.eval.len(), 1);
    assert!(split
        .train
        .iter()
        .chain(&split.eval)
        .all(|e| e.text.starts_with("<|system|>ESG uzmanısın.")));
    Ok(())
}

#[test]
fn test_missing_input_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let data = DataConfig {
        raw_csv: dir.path().join("missing.csv"),
        training_csv: dir.path().join("t.csv"),
        questions_json: dir.path().join("q.json"),
        sample_questions: 5,
    };
    assert!(run_analysis(&data).is_err());
    assert!(!data.training_csv.exists());
}
