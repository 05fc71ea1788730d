// Sample question generation for manual review of the fine-tuning corpus

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::record::{EsgRecord, EsgTable, TextColumn};

/// Which row field a template is filled from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subject {
    Company,
    Region,
    Country,
    PeerGroup,
}

impl Subject {
    fn placeholder(&self) -> &'static str {
        match self {
            Subject::Company => "{company}",
            Subject::Region => "{region}",
            Subject::Country => "{country}",
            Subject::PeerGroup => "{peer_group}",
        }
    }

    fn column(&self) -> TextColumn {
        match self {
            Subject::Company => TextColumn::Company,
            Subject::Region => TextColumn::Region,
            Subject::Country => TextColumn::Country,
            Subject::PeerGroup => TextColumn::PeerGroup,
        }
    }
}

const QUESTION_TEMPLATES: [(Subject, &str); 8] = [
    (Subject::Company, "{company} şirketinin ESG performansını analiz eder misin?"),
    (Subject::Company, "{company} için ESG iyileştirme stratejisi önerir misin?"),
    (Subject::Company, "{company} şirketinin çevresel performansı nasıl?"),
    (Subject::Company, "{company} şirketinin sosyal sorumluluk skoru hakkında bilgi verir misin?"),
    (Subject::Company, "{company} şirketinin kurumsal yönetim kalitesi nasıl?"),
    (Subject::Region, "{region} bölgesindeki ESG performansı nasıl?"),
    (Subject::Country, "{country} ülkesindeki şirketlerin ESG durumu hakkında bilgi verir misin?"),
    (Subject::PeerGroup, "{peer_group} sektöründe ESG liderleri kimler?"),
];

/// Context tag attached to every generated question
pub const SAMPLE_CONTEXT: &str = "fine_tuning_sample";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleQuestion {
    pub question: String,
    pub company: Option<String>,
    pub ticker: Option<String>,
    pub total_esg_score: Option<f64>,
    pub context: String,
}

fn fill_template(subject: Subject, template: &str, record: &EsgRecord) -> String {
    let value = record.text(subject.column()).unwrap_or("Unknown");
    template.replace(subject.placeholder(), value)
}

/// Sample `min(n_samples, len)` rows and phrase one random question per row
pub fn generate_sample_questions(table: &EsgTable, n_samples: usize, seed: u64) -> Vec<SampleQuestion> {
    let mut rng = StdRng::seed_from_u64(seed);
    let amount = n_samples.min(table.len());

    rand::seq::index::sample(&mut rng, table.len(), amount)
        .into_iter()
        .map(|idx| &table.records()[idx])
        .collect::<Vec<_>>()
        .into_iter()
        .filter_map(|record| {
            let (subject, template) = QUESTION_TEMPLATES.choose(&mut rng)?;
            Some(SampleQuestion {
                question: fill_template(*subject, template, record),
                company: record.company().map(str::to_string),
                ticker: record.text(TextColumn::Ticker).map(str::to_string),
                total_esg_score: record.total_score(),
                context: SAMPLE_CONTEXT.to_string(),
            })
        })
        .collect()
}

/// Write questions as pretty-printed UTF-8 JSON
pub fn save_questions(path: &Path, questions: &[SampleQuestion]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    let json = serde_json::to_string_pretty(questions)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to save sample questions to {:?}", path))?;
    tracing::info!(count = questions.len(), path = ?path, "Saved sample questions");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EsgTable {
        EsgTable::from_reader(
            "Company,Ticker,Country,Region,Peer_group_root,total_esg_score\n\
             Acme,ACM,USA,Americas,Industrials,55\n\
             Beta,BET,Germany,Europe,Retail,71\n\
             Gamma,GAM,France,Europe,Energy,30\n"
                .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_question_count_is_capped() {
        let questions = generate_sample_questions(&table(), 50, 42);
        assert_eq!(questions.len(), 3);
        assert!(questions.iter().all(|q| q.context == SAMPLE_CONTEXT));
        assert!(questions.iter().all(|q| !q.question.contains('{')));
    }

    #[test]
    fn test_questions_are_deterministic() {
        assert_eq!(
            generate_sample_questions(&table(), 2, 7),
            generate_sample_questions(&table(), 2, 7)
        );
    }

    #[test]
    fn test_fill_template() {
        let table = table();
        let record = &table.records()[0];
        assert_eq!(
            fill_template(Subject::PeerGroup, QUESTION_TEMPLATES[7].1, record),
            "Industrials sektöründe ESG liderleri kimler?"
        );
    }

    #[test]
    fn test_save_questions_writes_utf8_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/questions.json");
        let questions = generate_sample_questions(&table(), 1, 42);
        save_questions(&path, &questions).unwrap();

        let loaded: Vec<SampleQuestion> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, questions);
    }
}
