// Answer templates for the ESG instruction corpus
//
// Pure functions: every label and sentence the model is taught to produce
// comes from here.

use serde::{Deserialize, Serialize};

use crate::data::{EsgRecord, ScoreColumn, TextColumn};
use crate::models::adapters::GraniteEsgAdapter;

/// Total score below which an improvement-plan example is added
pub const IMPROVEMENT_THRESHOLD: f64 = 70.0;

/// Sub-score below which a quick action is suggested
const QUICK_ACTION_THRESHOLD: f64 = 60.0;

/// Ceiling of the improvement target
const TARGET_CAP: f64 = 85.0;

/// One supervised example in the `text` format consumed by the trainer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub text: String,
}

/// Fields of one training-table row. Text gaps get fallbacks; score gaps
/// stay `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyScores {
    pub company: String,
    pub ticker: String,
    pub peer_group: String,
    pub country: String,
    pub total: Option<f64>,
    pub environment: Option<f64>,
    pub social: Option<f64>,
    pub governance: Option<f64>,
}

impl CompanyScores {
    pub fn from_record(record: &EsgRecord) -> Self {
        let text = |col: TextColumn, fallback: &str| {
            record.text(col).unwrap_or(fallback).to_string()
        };
        let score = |col: ScoreColumn| record.score(col);

        Self {
            company: text(TextColumn::Company, "Unknown Company"),
            ticker: text(TextColumn::Ticker, "N/A"),
            peer_group: text(TextColumn::PeerGroup, "Unknown"),
            country: text(TextColumn::Country, "Unknown"),
            total: score(ScoreColumn::Total),
            environment: score(ScoreColumn::Environment),
            social: score(ScoreColumn::Social),
            governance: score(ScoreColumn::Governance),
        }
    }

    /// Environment, social and governance scores when all three are known
    pub fn pillars(&self) -> Option<(f64, f64, f64)> {
        Some((self.environment?, self.social?, self.governance?))
    }
}

fn score_detail(score: Option<f64>) -> String {
    match score {
        Some(v) => format!("{:.1}/100 ({})", v, score_level(v)),
        None => "N/A".to_string(),
    }
}

pub fn score_level(score: f64) -> &'static str {
    if score >= 80.0 {
        "Mükemmel"
    } else if score >= 60.0 {
        "İyi"
    } else if score >= 40.0 {
        "Orta"
    } else {
        "Zayıf"
    }
}

pub fn assessment(total: f64) -> &'static str {
    if total >= 80.0 {
        "ESG lideri"
    } else if total >= 60.0 {
        "Güçlü performans"
    } else if total >= 40.0 {
        "Gelişim gerekli"
    } else {
        "Acil aksiyon"
    }
}

/// Advice for the lowest pillar; ties resolve environment, then social
pub fn recommendation(env: f64, social: f64, gov: f64) -> &'static str {
    let lowest = env.min(social).min(gov);
    if lowest == env {
        "Çevresel etki azaltımına odaklanın"
    } else if lowest == social {
        "Sosyal sorumluluk artırın"
    } else {
        "Kurumsal şeffaflığı geliştirin"
    }
}

/// Name of the lowest pillar; the first one wins a tie
pub fn weakest_area(env: f64, social: f64, gov: f64) -> &'static str {
    let mut weakest = ("Çevresel", env);
    for candidate in [("Sosyal", social), ("Yönetim", gov)] {
        if candidate.1 < weakest.1 {
            weakest = candidate;
        }
    }
    weakest.0
}

pub fn priority_area(env: f64, social: f64, gov: f64) -> String {
    format!("{} alanda iyileştirme", weakest_area(env, social, gov))
}

/// Up to two bullet points for pillars below 60
pub fn quick_actions(env: f64, social: f64, gov: f64) -> String {
    [
        (env, "• Enerji verimliliği artırın"),
        (social, "• Çalışan memnuniyeti ölçün"),
        (gov, "• Etik politikalar oluşturun"),
    ]
    .iter()
    .filter(|(score, _)| *score < QUICK_ACTION_THRESHOLD)
    .map(|(_, action)| *action)
    .take(2)
    .collect::<Vec<_>>()
    .join("\n")
}

pub fn improvement_target(total: f64) -> f64 {
    (total + 20.0).min(TARGET_CAP)
}

/// Score breakdown; the assessment and recommendation lines need the
/// scores they are derived from
pub fn esg_analysis(s: &CompanyScores) -> String {
    let total = s
        .total
        .map_or_else(|| "N/A".to_string(), |v| format!("{:.1}/100", v));
    let mut text = format!(
        "{company} ESG Skoru: {total}\n\n\
         🔍 Detay Skorlar:\n\
         • Çevresel: {env}\n\
         • Sosyal: {social}\n\
         • Yönetim: {gov}",
        company = s.company,
        env = score_detail(s.environment),
        social = score_detail(s.social),
        gov = score_detail(s.governance),
    );
    if let Some(total) = s.total {
        text.push_str(&format!("\n\n📊 Değerlendirme: {}", assessment(total)));
    }
    if let Some((env, social, gov)) = s.pillars() {
        text.push_str(&format!("\n💡 Öneri: {}", recommendation(env, social, gov)));
    }
    text
}

/// Improvement plan; `None` unless the total and all three pillars are known
pub fn improvement_plan(s: &CompanyScores) -> Option<String> {
    let total = s.total?;
    let (env, social, gov) = s.pillars()?;
    Some(format!(
        "{company} İyileştirme Planı:\n\n\
         🎯 Öncelik: {priority}\n\
         ⚡ Hızlı Adımlar:\n\
         {actions}\n\
         📈 Hedef: {target:.1}/100 (12-18 ay)",
        company = s.company,
        priority = priority_area(env, social, gov),
        actions = quick_actions(env, social, gov),
        target = improvement_target(total),
    ))
}

/// Analysis example for every row, plus an improvement plan when the total
/// is known and below 70
pub fn create_training_examples(record: &EsgRecord) -> Vec<TrainingExample> {
    let adapter = GraniteEsgAdapter;
    let s = CompanyScores::from_record(record);
    let mut examples = Vec::with_capacity(2);

    let instruction = format!("{} şirketinin ESG performansını analiz et", s.company);
    let input = format!(
        "Şirket: {} ({})\nSektör: {}\nÜlke: {}",
        s.company, s.ticker, s.peer_group, s.country
    );
    examples.push(TrainingExample {
        text: adapter.format_training_text(&instruction, &input, &esg_analysis(&s)),
    });

    let low_total = s.total.filter(|t| *t < IMPROVEMENT_THRESHOLD);
    if let (Some(total), Some((env, social, gov)), Some(plan)) =
        (low_total, s.pillars(), improvement_plan(&s))
    {
        let instruction = format!("{} için ESG iyileştirme stratejisi öner", s.company);
        let input = format!(
            "Mevcut ESG: {:.1}/100\nZayıf alan: {}",
            total,
            weakest_area(env, social, gov)
        );
        examples.push(TrainingExample {
            text: adapter.format_training_text(&instruction, &input, &plan),
        });
    }

    examples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EsgTable;

    fn record(total: &str, env: &str, social: &str, gov: &str) -> EsgRecord {
        let csv = format!(
            "Company,Ticker,Peer_group_root,Country,total_esg_score,environment_score,social_score,governance_score\n\
             Acme Corp,ACM,Industrials,USA,{},{},{},{}\n",
            total, env, social, gov
        );
        EsgTable::from_reader(csv.as_bytes()).unwrap().records()[0].clone()
    }

    #[test]
    fn test_levels_and_assessments() {
        assert_eq!(score_level(80.0), "Mükemmel");
        assert_eq!(score_level(60.0), "İyi");
        assert_eq!(score_level(59.9), "Orta");
        assert_eq!(score_level(10.0), "Zayıf");
        assert_eq!(assessment(85.0), "ESG lideri");
        assert_eq!(assessment(30.0), "Acil aksiyon");
    }

    #[test]
    fn test_weakest_area_and_recommendation_ties() {
        assert_eq!(weakest_area(50.0, 50.0, 70.0), "Çevresel");
        assert_eq!(weakest_area(70.0, 40.0, 40.0), "Sosyal");
        assert_eq!(weakest_area(70.0, 60.0, 20.0), "Yönetim");
        assert_eq!(recommendation(50.0, 50.0, 50.0), "Çevresel etki azaltımına odaklanın");
        assert_eq!(recommendation(70.0, 30.0, 50.0), "Sosyal sorumluluk artırın");
        assert_eq!(recommendation(70.0, 60.0, 20.0), "Kurumsal şeffaflığı geliştirin");
    }

    #[test]
    fn test_quick_actions_capped_at_two() {
        assert_eq!(
            quick_actions(10.0, 10.0, 10.0),
            "• Enerji verimliliği artırın\n• Çalışan memnuniyeti ölçün"
        );
        assert_eq!(quick_actions(90.0, 90.0, 10.0), "• Etik politikalar oluşturun");
        assert_eq!(quick_actions(90.0, 90.0, 90.0), "");
    }

    #[test]
    fn test_improvement_target_is_capped() {
        assert_eq!(improvement_target(50.0), 70.0);
        assert_eq!(improvement_target(69.0), 85.0);
    }

    #[test]
    fn test_high_score_yields_one_example() {
        let examples = create_training_examples(&record("75", "80", "70", "72"));
        assert_eq!(examples.len(), 1);

        let text = &examples[0].text;
        assert!(text.starts_with("<|system|>ESG uzmanısın. Kısa ve net yanıt ver.<|user|>\n"));
        assert!(text.contains("Acme Corp şirketinin ESG performansını analiz et\n"));
        assert!(text.contains("Şirket: Acme Corp (ACM)\nSektör: Industrials\nÜlke: USA<|assistant|>\n"));
        assert!(text.contains("Acme Corp ESG Skoru: 75.0/100"));
        assert!(text.contains("• Çevresel: 80.0/100 (Mükemmel)"));
        assert!(text.contains("📊 Değerlendirme: Güçlü performans"));
        assert!(text.ends_with("💡 Öneri: Sosyal sorumluluk artırın<|endoftext|>"));
    }

    #[test]
    fn test_low_score_adds_improvement_plan() {
        let examples = create_training_examples(&record("45", "30", "50", "55"));
        assert_eq!(examples.len(), 2);

        let plan = &examples[1].text;
        assert!(plan.contains("Acme Corp için ESG iyileştirme stratejisi öner\nMevcut ESG: 45.0/100\nZayıf alan: Çevresel<|assistant|>\n"));
        assert!(plan.contains("🎯 Öncelik: Çevresel alanda iyileştirme"));
        assert!(plan.contains("⚡ Hızlı Adımlar:\n• Enerji verimliliği artırın\n• Çalışan memnuniyeti ölçün\n"));
        assert!(plan.ends_with("📈 Hedef: 65.0/100 (12-18 ay)<|endoftext|>"));
    }

    #[test]
    fn test_missing_fields_use_fallbacks() {
        let table = EsgTable::from_reader("Company,total_esg_score\n,80\n".as_bytes()).unwrap();
        let scores = CompanyScores::from_record(&table.records()[0]);
        assert_eq!(scores.company, "Unknown Company");
        assert_eq!(scores.ticker, "N/A");
        assert_eq!(scores.total, Some(80.0));
        assert_eq!(scores.environment, None);
        assert_eq!(scores.pillars(), None);
    }

    #[test]
    fn test_missing_scores_skip_improvement_plan() {
        // Low total but no environment score: nothing to rank
        let examples = create_training_examples(&record("45", "", "50", "55"));
        assert_eq!(examples.len(), 1);
        let text = &examples[0].text;
        assert!(text.contains("• Çevresel: N/A\n"));
        assert!(text.contains("• Sosyal: 50.0/100 (Orta)"));
        assert!(text.contains("📊 Değerlendirme: Gelişim gerekli"));
        assert!(!text.contains("💡 Öneri"));

        // No total: no improvement plan either
        let examples = create_training_examples(&record("", "30", "50", "55"));
        assert_eq!(examples.len(), 1);
        assert!(examples[0].text.contains("Acme Corp ESG Skoru: N/A\n"));
        assert!(!examples[0].text.contains("📊 Değerlendirme"));
    }
}
