// Cleaning pass over the raw ESG export

use anyhow::Result;
use std::collections::HashSet;
use std::fmt;

use super::record::{EsgRecord, EsgTable, ScoreColumn, TextColumn};
use super::stats::median;
use super::DataError;
use crate::config::constants::MAX_SCORE;

/// Columns a row cannot be used without
const ESSENTIAL: [&str; 3] = ["Company", "Ticker", "total_esg_score"];

/// Fill values for categorical gaps
const CATEGORICAL_FILLS: [(TextColumn, &str); 3] = [
    (TextColumn::Country, "Unknown"),
    (TextColumn::Region, "Unknown"),
    (TextColumn::PeerGroup, "Other"),
];

/// What each cleaning step did
#[derive(Debug, Clone, Default)]
pub struct CleaningReport {
    pub original_count: usize,
    pub removed_missing_essential: usize,
    pub removed_negative: Vec<(ScoreColumn, usize)>,
    pub clipped: Vec<(ScoreColumn, usize)>,
    pub removed_duplicates: usize,
    pub filled_categorical: Vec<(TextColumn, usize, &'static str)>,
    pub filled_median: Vec<(ScoreColumn, usize, f64)>,
    pub final_count: usize,
}

impl CleaningReport {
    pub fn removed_total(&self) -> usize {
        self.original_count - self.final_count
    }

    pub fn removed_percent(&self) -> f64 {
        if self.original_count == 0 {
            0.0
        } else {
            self.removed_total() as f64 / self.original_count as f64 * 100.0
        }
    }
}

impl fmt::Display for CleaningReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DATA CLEANING")?;
        writeln!(f, "{}", "=".repeat(50))?;
        if self.removed_missing_essential > 0 {
            writeln!(
                f,
                "  Removed {} rows missing Company, Ticker or total_esg_score",
                self.removed_missing_essential
            )?;
        }
        for (column, count) in &self.removed_negative {
            writeln!(f, "  Removed {} rows with negative or missing {}", count, column.name())?;
        }
        for (column, count) in &self.clipped {
            writeln!(f, "  Clipped {} {} values to 100", count, column.name())?;
        }
        if self.removed_duplicates > 0 {
            writeln!(f, "  Removed {} duplicate rows", self.removed_duplicates)?;
        }
        for (column, count, value) in &self.filled_categorical {
            writeln!(f, "  Filled {} missing {} with '{}'", count, column.name(), value)?;
        }
        for (column, count, value) in &self.filled_median {
            writeln!(
                f,
                "  Filled {} missing {} with median ({:.2})",
                count,
                column.name(),
                value
            )?;
        }
        writeln!(f, "\nCleaning complete:")?;
        writeln!(f, "  Start: {} rows", self.original_count)?;
        writeln!(f, "  End: {} rows", self.final_count)?;
        write!(
            f,
            "  Removed: {} rows ({:.1}%)",
            self.removed_total(),
            self.removed_percent()
        )
    }
}

/// Clean a table. Steps run in this order:
///
/// 1. drop rows missing Company, Ticker or total_esg_score
/// 2. drop rows whose headline score is negative or missing, for every
///    headline column the table has
/// 3. clip headline scores above 100
/// 4. drop repeated (Company, Date) rows, keeping the first
/// 5. fill categorical gaps with fixed labels and sub-score gaps with medians
pub fn clean(table: &EsgTable) -> Result<(EsgTable, CleaningReport)> {
    for column in ESSENTIAL {
        if !table.has_column(column) {
            return Err(DataError::MissingColumn(column.to_string()).into());
        }
    }

    let mut report = CleaningReport {
        original_count: table.len(),
        ..Default::default()
    };

    let mut rows: Vec<EsgRecord> = table
        .records()
        .iter()
        .filter(|r| ESSENTIAL.iter().all(|c| r.has_value(c)))
        .cloned()
        .collect();
    report.removed_missing_essential = table.len() - rows.len();

    let present: Vec<ScoreColumn> = ScoreColumn::PRIMARY
        .iter()
        .copied()
        .filter(|c| table.has_score(*c))
        .collect();

    // A missing value fails the comparison too, so only the scl_/wght_
    // columns reach the median fill with gaps
    for column in &present {
        let before = rows.len();
        rows.retain(|r| r.score(*column).is_some_and(|v| v >= 0.0));
        let removed = before - rows.len();
        if removed > 0 {
            report.removed_negative.push((*column, removed));
        }
    }

    for column in &present {
        let mut clipped = 0;
        for row in rows.iter_mut() {
            if let Some(v) = row.score(*column) {
                if v > MAX_SCORE {
                    row.set_score(*column, Some(MAX_SCORE));
                    clipped += 1;
                }
            }
        }
        if clipped > 0 {
            report.clipped.push((*column, clipped));
        }
    }

    let before = rows.len();
    let mut seen = HashSet::new();
    rows.retain(|r| {
        seen.insert((
            r.company().map(str::to_string),
            r.date().map(str::to_string),
        ))
    });
    report.removed_duplicates = before - rows.len();

    for (column, fill) in CATEGORICAL_FILLS {
        if !table.has_column(column.name()) {
            continue;
        }
        let mut filled = 0;
        for row in rows.iter_mut().filter(|r| r.text(column).is_none()) {
            row.set_text(column, Some(fill.to_string()));
            filled += 1;
        }
        if filled > 0 {
            report.filled_categorical.push((column, filled, fill));
        }
    }

    for column in ScoreColumn::IMPUTED {
        if !table.has_score(column) {
            continue;
        }
        let values: Vec<f64> = rows.iter().filter_map(|r| r.score(column)).collect();
        let Some(fill) = median(&values) else {
            continue;
        };
        let mut filled = 0;
        for row in rows.iter_mut().filter(|r| r.score(column).is_none()) {
            row.set_score(column, Some(fill));
            filled += 1;
        }
        if filled > 0 {
            report.filled_median.push((column, filled, fill));
        }
    }

    report.final_count = rows.len();
    tracing::info!(
        start = report.original_count,
        end = report.final_count,
        removed = report.removed_total(),
        "Cleaning complete"
    );

    Ok((table.with_records(rows), report))
}
