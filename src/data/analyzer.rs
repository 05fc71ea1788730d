// ESG Data Analyzer - quality statistics, anomaly detection and the
// end-to-end `analyze` pipeline (load → report → clean → sample → questions)

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use super::cleaning::{clean, CleaningReport};
use super::questions::{generate_sample_questions, save_questions, SampleQuestion};
use super::record::{EsgTable, ScoreColumn, TextColumn};
use super::stats::{Describe, IqrBounds};
use super::training_set::{create_training_dataset, TrainingSet};
use super::DataError;
use crate::config::constants::{MAX_SCORE, SAMPLING_SEED, TRAINING_ROWS_PER_CATEGORY};
use crate::config::DataConfig;

/// Missing-value count for one column
#[derive(Debug, Clone, PartialEq)]
pub struct MissingColumn {
    pub name: String,
    pub count: usize,
    pub percent: f64,
}

/// Output of [`EsgDataAnalyzer::analyze_data_quality`]
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub total_records: usize,
    pub column_count: usize,
    pub date_range: Option<(String, String)>,
    /// Only columns with at least one missing cell
    pub missing: Vec<MissingColumn>,
    /// Distinct non-missing values per identity column
    pub unique_counts: Vec<(&'static str, usize)>,
    pub score_stats: Vec<(ScoreColumn, Describe)>,
}

impl QualityReport {
    pub fn unique_count(&self, column: TextColumn) -> Option<usize> {
        self.unique_counts
            .iter()
            .find(|(name, _)| *name == column.name())
            .map(|(_, n)| *n)
    }
}

impl fmt::Display for QualityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DATA QUALITY")?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "Total records: {}", self.total_records)?;
        writeln!(f, "Columns: {}", self.column_count)?;
        if let Some((min, max)) = &self.date_range {
            writeln!(f, "Date range: {} - {}", min, max)?;
        }

        writeln!(f, "\nMissing values:")?;
        if self.missing.is_empty() {
            writeln!(f, "  none")?;
        }
        for m in &self.missing {
            writeln!(f, "  {}: {} ({:.1}%)", m.name, m.count, m.percent)?;
        }

        writeln!(f, "\nUnique values:")?;
        for (name, count) in &self.unique_counts {
            writeln!(f, "  {}: {}", name, count)?;
        }

        writeln!(f, "\nScore statistics:")?;
        for (column, describe) in &self.score_stats {
            writeln!(f, "  {}:", column.name())?;
            writeln!(f, "{}", describe)?;
        }
        Ok(())
    }
}

/// One anomaly counter, keyed like `total_esg_score_negative` or `duplicates`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalyEntry {
    pub key: String,
    pub count: usize,
}

/// Output of [`EsgDataAnalyzer::detect_anomalies`]; zero counts are omitted
#[derive(Debug, Clone, Default)]
pub struct AnomalyReport {
    pub entries: Vec<AnomalyEntry>,
}

impl AnomalyReport {
    pub fn get(&self, key: &str) -> Option<usize> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.count)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, key: String, count: usize) {
        if count > 0 {
            self.entries.push(AnomalyEntry { key, count });
        }
    }
}

impl fmt::Display for AnomalyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ANOMALIES")?;
        writeln!(f, "{}", "=".repeat(50))?;
        if self.entries.is_empty() {
            writeln!(f, "  none detected")?;
        }
        for entry in &self.entries {
            writeln!(f, "  {}: {}", entry.key, entry.count)?;
        }
        Ok(())
    }
}

/// Analyzer over one CSV export
pub struct EsgDataAnalyzer {
    csv_path: PathBuf,
    table: Option<EsgTable>,
}

impl EsgDataAnalyzer {
    pub fn new(csv_path: impl Into<PathBuf>) -> Self {
        Self {
            csv_path: csv_path.into(),
            table: None,
        }
    }

    /// Analyzer over an already-parsed table
    pub fn from_table(table: EsgTable) -> Self {
        Self {
            csv_path: PathBuf::new(),
            table: Some(table),
        }
    }

    /// Load the CSV file
    pub fn load_data(&mut self) -> Result<&EsgTable> {
        tracing::info!("Loading ESG data from {:?}", self.csv_path);
        let table = EsgTable::from_path(&self.csv_path)?;
        tracing::info!(
            rows = table.len(),
            columns = table.column_count(),
            "ESG data loaded"
        );
        Ok(&*self.table.insert(table))
    }

    pub fn table(&self) -> Result<&EsgTable, DataError> {
        self.table.as_ref().ok_or(DataError::NotLoaded)
    }

    /// Record counts, missing values, distinct identities and score spreads
    pub fn analyze_data_quality(&self) -> Result<QualityReport, DataError> {
        let table = self.table()?;
        let total = table.len();

        let dates: Vec<&str> = table.records().iter().filter_map(|r| r.date()).collect();
        let date_range = match (dates.iter().min(), dates.iter().max()) {
            (Some(min), Some(max)) => Some((min.to_string(), max.to_string())),
            _ => None,
        };

        let missing = table
            .headers()
            .iter()
            .filter_map(|header| {
                let count = table
                    .records()
                    .iter()
                    .filter(|r| !r.has_value(header))
                    .count();
                (count > 0).then(|| MissingColumn {
                    name: header.clone(),
                    count,
                    percent: count as f64 / total.max(1) as f64 * 100.0,
                })
            })
            .collect();

        let unique_counts = [
            TextColumn::Company,
            TextColumn::Ticker,
            TextColumn::Country,
            TextColumn::Region,
            TextColumn::PeerGroup,
        ]
        .iter()
        .filter(|col| table.has_column(col.name()))
        .map(|col| {
            let distinct: HashSet<&str> =
                table.records().iter().filter_map(|r| r.text(*col)).collect();
            (col.name(), distinct.len())
        })
        .collect();

        let score_stats = ScoreColumn::PRIMARY
            .iter()
            .filter(|col| table.has_score(**col))
            .filter_map(|col| Describe::of(&table.score_values(*col)).map(|d| (*col, d)))
            .collect();

        Ok(QualityReport {
            total_records: total,
            column_count: table.column_count(),
            date_range,
            missing,
            unique_counts,
            score_stats,
        })
    }

    /// Negative scores, scores above 100, IQR outliers and duplicate (Company, Date) rows
    pub fn detect_anomalies(&self) -> Result<AnomalyReport, DataError> {
        let table = self.table()?;
        let mut report = AnomalyReport::default();

        for column in ScoreColumn::PRIMARY {
            if !table.has_score(column) {
                continue;
            }
            let values = table.score_values(column);

            let negative = values.iter().filter(|v| **v < 0.0).count();
            report.record(format!("{}_negative", column.name()), negative);

            let over = values.iter().filter(|v| **v > MAX_SCORE).count();
            report.record(format!("{}_over_100", column.name()), over);

            if let Some(bounds) = IqrBounds::of(&values) {
                let outliers = values.iter().filter(|v| !bounds.contains(**v)).count();
                report.record(format!("{}_outliers", column.name()), outliers);
            }
        }

        let mut seen = HashSet::new();
        let duplicates = table
            .records()
            .iter()
            .filter(|r| !seen.insert((r.company(), r.date())))
            .count();
        report.record("duplicates".to_string(), duplicates);

        Ok(report)
    }

    /// Clean the loaded table; see [`clean`] for the step order
    pub fn clean_data(&self) -> Result<(EsgTable, CleaningReport)> {
        clean(self.table()?)
    }

    /// Latest row per company, categorised and stratified, written to `output_path`
    pub fn create_training_dataset(
        &self,
        cleaned: &EsgTable,
        output_path: &Path,
    ) -> Result<TrainingSet> {
        create_training_dataset(cleaned, output_path, TRAINING_ROWS_PER_CATEGORY, SAMPLING_SEED)
    }

    pub fn generate_sample_questions(&self, table: &EsgTable, n_samples: usize) -> Vec<SampleQuestion> {
        generate_sample_questions(table, n_samples, SAMPLING_SEED)
    }
}

/// Everything the `analyze` pipeline produced
#[derive(Debug)]
pub struct AnalysisSummary {
    pub quality: QualityReport,
    pub anomalies: AnomalyReport,
    pub cleaning: CleaningReport,
    pub training: TrainingSet,
    pub questions: Vec<SampleQuestion>,
}

/// Run the full analysis pipeline described by `config`
pub fn run_analysis(config: &DataConfig) -> Result<AnalysisSummary> {
    let mut analyzer = EsgDataAnalyzer::new(&config.raw_csv);
    analyzer.load_data()?;

    let quality = analyzer.analyze_data_quality()?;
    let anomalies = analyzer.detect_anomalies()?;
    let (cleaned, cleaning) = analyzer.clean_data()?;

    let training = analyzer
        .create_training_dataset(&cleaned, &config.training_csv)
        .context("Failed to build fine-tuning dataset")?;

    let questions = analyzer.generate_sample_questions(&training.table, config.sample_questions);
    save_questions(&config.questions_json, &questions)?;

    tracing::info!(
        training_csv = ?config.training_csv,
        questions_json = ?config.questions_json,
        "Analysis complete"
    );

    Ok(AnalysisSummary {
        quality,
        anomalies,
        cleaning,
        training,
        questions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &str = "\
Date,Company,Ticker,Country,Region,Peer_group_root,total_esg_score,environment_score,social_score,governance_score
2022-01-01,Acme,ACM,USA,Americas,Industrials,50,40,60,50
2023-01-01,Acme,ACM,USA,Americas,Industrials,52,42,61,53
2023-01-01,Acme,ACM,USA,Americas,Industrials,52,42,61,53
2023-01-01,Beta,BET,,Europe,Retail,-5,30,30,30
2023-01-01,Gamma,GAM,Germany,Europe,,120,90,95,99
2023-01-01,Delta,DLT,France,Europe,Energy,51,45,50,55
";

    fn analyzer() -> EsgDataAnalyzer {
        EsgDataAnalyzer::from_table(EsgTable::from_reader(DATA.as_bytes()).unwrap())
    }

    #[test]
    fn test_quality_report() {
        let report = analyzer().analyze_data_quality().unwrap();

        assert_eq!(report.total_records, 6);
        assert_eq!(report.column_count, 10);
        assert_eq!(
            report.date_range,
            Some(("2022-01-01".to_string(), "2023-01-01".to_string()))
        );
        assert_eq!(report.unique_count(TextColumn::Company), Some(4));

        let country = report.missing.iter().find(|m| m.name == "Country").unwrap();
        assert_eq!(country.count, 1);
        assert!((country.percent - 16.666).abs() < 0.01);

        let total = report
            .score_stats
            .iter()
            .find(|(c, _)| *c == ScoreColumn::Total)
            .unwrap();
        assert_eq!(total.1.min, -5.0);
        assert_eq!(total.1.max, 120.0);
    }

    #[test]
    fn test_detect_anomalies() {
        let report = analyzer().detect_anomalies().unwrap();

        assert_eq!(report.get("total_esg_score_negative"), Some(1));
        assert_eq!(report.get("total_esg_score_over_100"), Some(1));
        assert_eq!(report.get("duplicates"), Some(1));
        assert_eq!(report.get("social_score_negative"), None);
    }

    #[test]
    fn test_unloaded_analyzer_errors() {
        let analyzer = EsgDataAnalyzer::new("/nonexistent.csv");
        assert!(matches!(
            analyzer.analyze_data_quality(),
            Err(DataError::NotLoaded)
        ));
    }
}
