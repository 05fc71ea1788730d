// Batch analysis input and output

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One company to analyze; missing fields are empty
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyQuery {
    pub company: String,
    pub ticker: String,
    pub sector: String,
    pub country: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub company: String,
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub analysis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// RFC 3339 local time
    pub timestamp: String,
    pub status: BatchStatus,
}

impl BatchResult {
    pub fn from_outcome(query: &CompanyQuery, outcome: Result<String>) -> Self {
        let (analysis, error, status) = match outcome {
            Ok(text) => (Some(text), None, BatchStatus::Success),
            Err(e) => (None, Some(format!("{:#}", e)), BatchStatus::Error),
        };
        Self {
            company: query.company.clone(),
            ticker: query.ticker.clone(),
            analysis,
            error,
            timestamp: Local::now().to_rfc3339(),
            status,
        }
    }
}

/// Read a JSON array of [`CompanyQuery`]
pub fn load_queries(path: &Path) -> Result<Vec<CompanyQuery>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch input {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid batch input in {:?}", path))
}

/// Write results as pretty JSON, creating parent directories
pub fn save_results(path: &Path, results: &[BatchResult]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(results)?)
        .with_context(|| format!("Failed to write batch results to {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_allow_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.json");
        std::fs::write(&path, r#"[{"company": "Tesla Inc", "ticker": "TSLA"}, {}]"#).unwrap();

        let queries = load_queries(&path).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].ticker, "TSLA");
        assert_eq!(queries[0].sector, "");
        assert_eq!(queries[1], CompanyQuery::default());
    }

    #[test]
    fn test_result_json_shape() {
        let query = CompanyQuery {
            company: "Apple Inc".into(),
            ..Default::default()
        };
        let ok = serde_json::to_value(BatchResult::from_outcome(&query, Ok("iyi".into()))).unwrap();
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["analysis"], "iyi");
        assert!(ok.get("error").is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(ok["timestamp"].as_str().unwrap()).is_ok());

        let failed = BatchResult::from_outcome(&query, Err(anyhow::anyhow!("no model")));
        let failed = serde_json::to_value(failed).unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["error"], "no model");
        assert!(failed.get("analysis").is_none());
    }

    #[test]
    fn test_save_results_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.json");
        save_results(&path, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "[]");
    }
}
