// ESG table - header-driven CSV model of the scores export
//
// Known columns are typed; anything else is carried through verbatim so the
// cleaned table can be written back with its original shape.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;

use crate::config::constants::*;

/// Cells read as missing values
const NA_VALUES: &[&str] = &["", "NA", "N/A", "n/a", "NaN", "nan", "null", "NULL", "None", "#N/A", "<NA>"];

pub(crate) fn is_na(raw: &str) -> bool {
    NA_VALUES.contains(&raw.trim())
}

/// Text columns the pipelines read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextColumn {
    Date,
    Company,
    Ticker,
    Country,
    Region,
    PeerGroup,
}

impl TextColumn {
    pub const ALL: [TextColumn; 6] = [
        TextColumn::Date,
        TextColumn::Company,
        TextColumn::Ticker,
        TextColumn::Country,
        TextColumn::Region,
        TextColumn::PeerGroup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TextColumn::Date => COL_DATE,
            TextColumn::Company => COL_COMPANY,
            TextColumn::Ticker => COL_TICKER,
            TextColumn::Country => COL_COUNTRY,
            TextColumn::Region => COL_REGION,
            TextColumn::PeerGroup => COL_PEER_GROUP,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Numeric score columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreColumn {
    Total,
    Environment,
    Social,
    Governance,
    SclEnvironment,
    SclSocial,
    SclGovernance,
    WghtEnvironment,
    WghtSocial,
    WghtGovernance,
}

impl ScoreColumn {
    pub const ALL: [ScoreColumn; 10] = [
        ScoreColumn::Total,
        ScoreColumn::Environment,
        ScoreColumn::Social,
        ScoreColumn::Governance,
        ScoreColumn::SclEnvironment,
        ScoreColumn::SclSocial,
        ScoreColumn::SclGovernance,
        ScoreColumn::WghtEnvironment,
        ScoreColumn::WghtSocial,
        ScoreColumn::WghtGovernance,
    ];

    /// Headline scores checked for range anomalies and clipped to 0..=100
    pub const PRIMARY: [ScoreColumn; 4] = [
        ScoreColumn::Total,
        ScoreColumn::Environment,
        ScoreColumn::Social,
        ScoreColumn::Governance,
    ];

    /// Sub-scores whose gaps are filled with the column median
    pub const IMPUTED: [ScoreColumn; 9] = [
        ScoreColumn::Environment,
        ScoreColumn::Social,
        ScoreColumn::Governance,
        ScoreColumn::SclEnvironment,
        ScoreColumn::SclSocial,
        ScoreColumn::SclGovernance,
        ScoreColumn::WghtEnvironment,
        ScoreColumn::WghtSocial,
        ScoreColumn::WghtGovernance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScoreColumn::Total => "total_esg_score",
            ScoreColumn::Environment => "environment_score",
            ScoreColumn::Social => "social_score",
            ScoreColumn::Governance => "governance_score",
            ScoreColumn::SclEnvironment => "scl_environment_score",
            ScoreColumn::SclSocial => "scl_social_score",
            ScoreColumn::SclGovernance => "scl_governance_score",
            ScoreColumn::WghtEnvironment => "wght_environment_score",
            ScoreColumn::WghtSocial => "wght_social_score",
            ScoreColumn::WghtGovernance => "wght_governance_score",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One row of the ESG export
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EsgRecord {
    text: [Option<String>; 6],
    scores: [Option<f64>; 10],
    /// Unknown columns, raw cell text keyed by header
    extra: BTreeMap<String, String>,
}

impl EsgRecord {
    pub fn text(&self, column: TextColumn) -> Option<&str> {
        self.text[column.index()].as_deref()
    }

    pub fn set_text(&mut self, column: TextColumn, value: Option<String>) {
        self.text[column.index()] = value;
    }

    pub fn score(&self, column: ScoreColumn) -> Option<f64> {
        self.scores[column.index()]
    }

    pub fn set_score(&mut self, column: ScoreColumn, value: Option<f64>) {
        self.scores[column.index()] = value;
    }

    pub fn company(&self) -> Option<&str> {
        self.text(TextColumn::Company)
    }

    pub fn date(&self) -> Option<&str> {
        self.text(TextColumn::Date)
    }

    pub fn total_score(&self) -> Option<f64> {
        self.score(ScoreColumn::Total)
    }

    /// Whether the cell under `header` holds a value
    pub fn has_value(&self, header: &str) -> bool {
        if let Some(col) = TextColumn::from_name(header) {
            self.text(col).is_some()
        } else if let Some(col) = ScoreColumn::from_name(header) {
            self.score(col).is_some()
        } else {
            self.extra.get(header).map(|v| !is_na(v)).unwrap_or(false)
        }
    }

    /// Render the cell under `header` the way it is written back to CSV
    pub fn cell(&self, header: &str) -> String {
        if let Some(col) = TextColumn::from_name(header) {
            self.text(col).unwrap_or_default().to_string()
        } else if let Some(col) = ScoreColumn::from_name(header) {
            self.score(col).map(format_score).unwrap_or_default()
        } else {
            self.extra.get(header).cloned().unwrap_or_default()
        }
    }
}

fn format_score(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// Extra column appended when writing a derived table
#[derive(Debug, Clone)]
pub struct DerivedColumn {
    pub name: &'static str,
    pub values: Vec<String>,
}

/// ESG table with the original header order
#[derive(Debug, Clone, Default)]
pub struct EsgTable {
    headers: Vec<String>,
    records: Vec<EsgRecord>,
}

impl EsgTable {
    pub fn new(headers: Vec<String>, records: Vec<EsgRecord>) -> Self {
        Self { headers, records }
    }

    /// Load a CSV file from disk
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open ESG data file {:?}", path))?;
        Self::from_reader(file).with_context(|| format!("Failed to parse ESG data file {:?}", path))
    }

    /// Parse CSV from any reader; the first row is the header
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut records = Vec::new();
        let mut unparsable = 0usize;

        for (line, row) in csv_reader.records().enumerate() {
            let row = row.with_context(|| format!("Malformed CSV row {}", line + 2))?;
            let mut record = EsgRecord::default();

            for (header, raw) in headers.iter().zip(row.iter()) {
                if let Some(col) = TextColumn::from_name(header) {
                    let value = (!is_na(raw)).then(|| raw.trim().to_string());
                    record.set_text(col, value);
                } else if let Some(col) = ScoreColumn::from_name(header) {
                    if is_na(raw) {
                        continue;
                    }
                    match raw.trim().parse::<f64>() {
                        Ok(v) if v.is_finite() => record.set_score(col, Some(v)),
                        _ => unparsable += 1,
                    }
                } else {
                    record.extra.insert(header.clone(), raw.to_string());
                }
            }

            records.push(record);
        }

        if unparsable > 0 {
            tracing::warn!(cells = unparsable, "Non-numeric score cells treated as missing");
        }

        Ok(Self { headers, records })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn records(&self) -> &[EsgRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [EsgRecord] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn has_score(&self, column: ScoreColumn) -> bool {
        self.has_column(column.name())
    }

    /// Same headers, different rows
    pub fn with_records(&self, records: Vec<EsgRecord>) -> Self {
        Self {
            headers: self.headers.clone(),
            records,
        }
    }

    /// Present (non-missing) values of a score column
    pub fn score_values(&self, column: ScoreColumn) -> Vec<f64> {
        self.records.iter().filter_map(|r| r.score(column)).collect()
    }

    /// Write the table, followed by any derived columns, as CSV
    pub fn write_csv(&self, path: &Path, derived: &[DerivedColumn]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {:?}", path))?;
        self.to_writer(file, derived)
    }

    pub fn to_writer<W: Write>(&self, writer: W, derived: &[DerivedColumn]) -> Result<()> {
        for column in derived {
            if column.values.len() != self.records.len() {
                anyhow::bail!(
                    "Derived column '{}' has {} values for {} rows",
                    column.name,
                    column.values.len(),
                    self.records.len()
                );
            }
        }

        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header_row: Vec<&str> = self.headers.iter().map(String::as_str).collect();
        header_row.extend(derived.iter().map(|c| c.name));
        csv_writer.write_record(&header_row)?;

        for (idx, record) in self.records.iter().enumerate() {
            let mut row: Vec<String> = self.headers.iter().map(|h| record.cell(h)).collect();
            row.extend(derived.iter().map(|c| c.values[idx].clone()));
            csv_writer.write_record(&row)?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Date,Company,Ticker,total_esg_score,environment_score,industry
2023-01-01,Acme,ACM,55.5,,Manufacturing
2023-02-01,Beta,,NaN,40,Retail
";

    #[test]
    fn test_parse_typed_and_extra_columns() {
        let table = EsgTable::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column_count(), 6);

        let acme = &table.records()[0];
        assert_eq!(acme.company(), Some("Acme"));
        assert_eq!(acme.total_score(), Some(55.5));
        assert_eq!(acme.score(ScoreColumn::Environment), None);
        assert_eq!(acme.cell("industry"), "Manufacturing");

        let beta = &table.records()[1];
        assert_eq!(beta.text(TextColumn::Ticker), None);
        assert_eq!(beta.total_score(), None);
        assert!(!beta.has_value("Ticker"));
    }

    #[test]
    fn test_write_keeps_header_order_and_appends_derived() {
        let table = EsgTable::from_reader(SAMPLE.as_bytes()).unwrap();
        let derived = vec![DerivedColumn {
            name: "esg_category",
            values: vec!["Average".into(), "Poor".into()],
        }];

        let mut out = Vec::new();
        table.to_writer(&mut out, &derived).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();

        assert_eq!(
            lines.next().unwrap(),
            "Date,Company,Ticker,total_esg_score,environment_score,industry,esg_category"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2023-01-01,Acme,ACM,55.5,,Manufacturing,Average"
        );
        assert_eq!(lines.next().unwrap(), "2023-02-01,Beta,,,40.0,Retail,Poor");
    }

    #[test]
    fn test_derived_length_mismatch_is_rejected() {
        let table = EsgTable::from_reader(SAMPLE.as_bytes()).unwrap();
        let derived = vec![DerivedColumn {
            name: "esg_category",
            values: vec!["Average".into()],
        }];
        assert!(table.to_writer(Vec::new(), &derived).is_err());
    }
}
