// Training table - latest row per company, categorised and stratified

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::record::{DerivedColumn, EsgRecord, EsgTable, ScoreColumn};
use crate::config::constants::*;

/// Coarse score band used for stratification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreCategory {
    Excellent,
    Good,
    Average,
    Poor,
}

impl ScoreCategory {
    /// Sampling order
    pub const ORDER: [ScoreCategory; 4] = [
        ScoreCategory::Excellent,
        ScoreCategory::Good,
        ScoreCategory::Average,
        ScoreCategory::Poor,
    ];

    /// ≥80 Excellent, ≥60 Good, ≥40 Average, otherwise (including missing) Poor
    pub fn from_score(score: Option<f64>) -> Self {
        match score {
            Some(s) if s >= 80.0 => ScoreCategory::Excellent,
            Some(s) if s >= 60.0 => ScoreCategory::Good,
            Some(s) if s >= 40.0 => ScoreCategory::Average,
            _ => ScoreCategory::Poor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreCategory::Excellent => "Excellent",
            ScoreCategory::Good => "Good",
            ScoreCategory::Average => "Average",
            ScoreCategory::Poor => "Poor",
        }
    }
}

impl fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categories of one row: total, environment, social, governance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCategories {
    pub esg: ScoreCategory,
    pub environment: ScoreCategory,
    pub social: ScoreCategory,
    pub governance: ScoreCategory,
}

impl RowCategories {
    pub fn of(record: &EsgRecord) -> Self {
        Self {
            esg: ScoreCategory::from_score(record.score(ScoreColumn::Total)),
            environment: ScoreCategory::from_score(record.score(ScoreColumn::Environment)),
            social: ScoreCategory::from_score(record.score(ScoreColumn::Social)),
            governance: ScoreCategory::from_score(record.score(ScoreColumn::Governance)),
        }
    }
}

/// The sampled fine-tuning table
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub table: EsgTable,
    pub categories: Vec<RowCategories>,
    pub output_path: PathBuf,
}

impl TrainingSet {
    /// Row count per ESG category, in sampling order, omitting empty ones
    pub fn distribution(&self) -> Vec<(ScoreCategory, usize)> {
        ScoreCategory::ORDER
            .iter()
            .map(|cat| (*cat, self.categories.iter().filter(|c| c.esg == *cat).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Display for TrainingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FINE-TUNING DATASET")?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "  File: {}", self.output_path.display())?;
        writeln!(f, "  Total samples: {}", self.len())?;
        write!(f, "  Category distribution:")?;
        for (category, count) in self.distribution() {
            write!(f, "\n    {}: {}", category, count)?;
        }
        Ok(())
    }
}

/// Keep the most recent row (by Date) of each company, in date order
pub fn latest_per_company(table: &EsgTable) -> Vec<EsgRecord> {
    let mut ordered: Vec<&EsgRecord> = table.records().iter().collect();
    // Missing dates sort last
    ordered.sort_by(|a, b| match (a.date(), b.date()) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });

    let mut last_position: HashMap<&str, usize> = HashMap::new();
    for (pos, record) in ordered.iter().enumerate() {
        if let Some(company) = record.company() {
            last_position.insert(company, pos);
        }
    }

    ordered
        .iter()
        .enumerate()
        .filter(|(pos, record)| {
            record
                .company()
                .and_then(|c| last_position.get(c))
                .is_some_and(|last| last == pos)
        })
        .map(|(_, record)| (**record).clone())
        .collect()
}

/// Draw up to `amount` items without replacement, in random order
pub(crate) fn sample_without_replacement<T: Clone>(items: &[T], amount: usize, seed: u64) -> Vec<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    let amount = amount.min(items.len());
    rand::seq::index::sample(&mut rng, items.len(), amount)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}

/// Build the stratified training table and write it to `output_path`
pub fn create_training_dataset(
    cleaned: &EsgTable,
    output_path: &Path,
    rows_per_category: usize,
    seed: u64,
) -> Result<TrainingSet> {
    let latest = latest_per_company(cleaned);
    tracing::debug!(companies = latest.len(), "Selected latest record per company");

    let mut records = Vec::new();
    let mut categories = Vec::new();

    for category in ScoreCategory::ORDER {
        let members: Vec<(EsgRecord, RowCategories)> = latest
            .iter()
            .map(|r| (r.clone(), RowCategories::of(r)))
            .filter(|(_, cats)| cats.esg == category)
            .collect();
        if members.is_empty() {
            continue;
        }

        for (record, cats) in sample_without_replacement(&members, rows_per_category, seed) {
            records.push(record);
            categories.push(cats);
        }
    }

    let table = cleaned.with_records(records);

    let derived = vec![
        derived_column(COL_ESG_CATEGORY, &categories, |c| c.esg),
        derived_column(COL_ENV_CATEGORY, &categories, |c| c.environment),
        derived_column(COL_SOCIAL_CATEGORY, &categories, |c| c.social),
        derived_column(COL_GOV_CATEGORY, &categories, |c| c.governance),
    ];
    table.write_csv(output_path, &derived)?;

    let set = TrainingSet {
        table,
        categories,
        output_path: output_path.to_path_buf(),
    };
    tracing::info!(samples = set.len(), path = ?output_path, "Fine-tuning dataset written");

    Ok(set)
}

fn derived_column(
    name: &'static str,
    categories: &[RowCategories],
    pick: impl Fn(&RowCategories) -> ScoreCategory,
) -> DerivedColumn {
    DerivedColumn {
        name,
        values: categories.iter().map(|c| pick(c).as_str().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_bands() {
        assert_eq!(ScoreCategory::from_score(Some(80.0)), ScoreCategory::Excellent);
        assert_eq!(ScoreCategory::from_score(Some(79.9)), ScoreCategory::Good);
        assert_eq!(ScoreCategory::from_score(Some(40.0)), ScoreCategory::Average);
        assert_eq!(ScoreCategory::from_score(Some(39.9)), ScoreCategory::Poor);
        assert_eq!(ScoreCategory::from_score(None), ScoreCategory::Poor);
    }

    #[test]
    fn test_latest_per_company() {
        let table = EsgTable::from_reader(
            "Date,Company,total_esg_score\n\
             2023-01-01,Acme,50\n\
             2021-01-01,Beta,30\n\
             2022-01-01,Acme,45\n\
             2022-06-01,Beta,35\n"
                .as_bytes(),
        )
        .unwrap();

        let latest = latest_per_company(&table);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].company(), Some("Beta"));
        assert_eq!(latest[0].total_score(), Some(35.0));
        assert_eq!(latest[1].company(), Some("Acme"));
        assert_eq!(latest[1].total_score(), Some(50.0));
    }

    #[test]
    fn test_sampling_is_capped_and_deterministic() {
        let items: Vec<usize> = (0..20).collect();
        let a = sample_without_replacement(&items, 5, 42);
        let b = sample_without_replacement(&items, 5, 42);
        assert_eq!(a.len(), 5);
        assert_eq!(a, b);

        let all = sample_without_replacement(&items, 100, 42);
        assert_eq!(all.len(), 20);
    }

    #[test]
    fn test_create_training_dataset_caps_categories() {
        let mut csv = String::from("Date,Company,Ticker,total_esg_score,environment_score\n");
        for i in 0..6 {
            csv.push_str(&format!("2023-01-01,High{},H{},{},90\n", i, i, 85 + i));
        }
        for i in 0..2 {
            csv.push_str(&format!("2023-01-01,Low{},L{},{},\n", i, i, 10 + i));
        }
        let table = EsgTable::from_reader(csv.as_bytes()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.csv");
        let set = create_training_dataset(&table, &path, 4, 42).unwrap();

        assert_eq!(set.len(), 6);
        assert_eq!(
            set.distribution(),
            vec![(ScoreCategory::Excellent, 4), (ScoreCategory::Poor, 2)]
        );

        let written = std::fs::read_to_string(&path).unwrap();
        let header = written.lines().next().unwrap();
        assert!(header.ends_with("esg_category,env_category,social_category,gov_category"));
        assert_eq!(written.lines().count(), 7);
    }
}
