//! Diagnosis over the evaluation history.
//!
//! [`DiagnosisAnalyzer`] is a pure function of a window of records, a
//! baseline window, and configured thresholds: the same input always yields
//! the same alerts, issues and suggestions. [`DiagnosisService`] loads the
//! windows from the store and optionally asks a [`Narrator`] for free text.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::Narrator;
use crate::config::DiagnosisConfig;
use crate::error::{Result, ValidationError};
use crate::store::EvaluationStore;
use crate::types::EvaluationRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(ValidationError::invalid(
                "severity",
                format!("expected high, medium or low, got '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ScoreDrop,
    CategoryConcentration,
    IntentConcentration,
    VolumeFloor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub severity: Severity,
    pub affected_count: usize,
    /// The category or intent a concentration alert is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Aggregate for one category or intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub name: String,
    pub avg_score: f64,
    pub count: usize,
    pub low_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowScoringQuery {
    pub evaluation_id: Uuid,
    pub query_id: Uuid,
    pub query: String,
    pub overall_score: f64,
    pub category: Option<String>,
    pub intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisSummary {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub period_days: u32,
    pub total_evaluations: usize,
    /// Records carrying an overall score; retrieval-only records are excluded.
    pub scored_evaluations: usize,
    pub avg_score: Option<f64>,
    pub baseline_avg_score: Option<f64>,
    pub high_score_count: usize,
    pub low_score_count: usize,
    pub by_category: Vec<GroupStats>,
    pub by_intent: Vec<GroupStats>,
    pub score_distribution: Vec<ScoreBucket>,
    pub lowest_scoring: Vec<LowScoringQuery>,
    pub alerts: Vec<Alert>,
    pub top_issues: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Retrieval,
    Generation,
    KnowledgeGap,
    Monitoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Parameter change that can be applied without review.
    AutoSafe,
    NeedsApproval,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub category: IssueCategory,
    pub severity: Severity,
    pub description: String,
    pub affected_count: usize,
    pub example_queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub issue_id: String,
    pub action_type: ActionType,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_changes: Option<serde_json::Value>,
    pub expected_improvement: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub generated_at: DateTime<Utc>,
    pub headline: String,
    pub summary: DiagnosisSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    pub issues: Vec<Issue>,
    pub actions: Vec<Action>,
}

/// Longest window a diagnosis may cover; the baseline doubles the lookback.
pub const MAX_PERIOD_DAYS: u32 = 3650;

const BUCKET_LABELS: [&str; 5] = ["0.0-0.2", "0.2-0.4", "0.4-0.6", "0.6-0.8", "0.8-1.0"];

fn bucket_index(score: f64) -> usize {
    ((score.clamp(0.0, 1.0) * 5.0).floor() as usize).min(BUCKET_LABELS.len() - 1)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub struct DiagnosisAnalyzer {
    config: DiagnosisConfig,
    current_top_k: usize,
}

impl DiagnosisAnalyzer {
    pub fn new(config: DiagnosisConfig) -> Self {
        Self {
            config,
            current_top_k: 5,
        }
    }

    /// The retrieval depth currently in use, for top_k change suggestions.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.current_top_k = top_k;
        self
    }

    pub fn config(&self) -> &DiagnosisConfig {
        &self.config
    }

    fn group_stats<'a>(
        &self,
        scored: &[(&'a EvaluationRecord, f64)],
        key: impl Fn(&'a EvaluationRecord) -> Option<&'a str>,
    ) -> Vec<GroupStats> {
        let mut groups: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for (record, score) in scored {
            groups.entry(key(*record).unwrap_or("unknown")).or_default().push(*score);
        }
        let mut stats: Vec<GroupStats> = groups
            .into_iter()
            .map(|(name, scores)| GroupStats {
                name: name.to_string(),
                avg_score: mean(&scores).unwrap_or(0.0),
                count: scores.len(),
                low_count: scores
                    .iter()
                    .filter(|s| **s < self.config.low_score_threshold)
                    .count(),
            })
            .collect();
        stats.sort_by(|a, b| a.avg_score.total_cmp(&b.avg_score).then_with(|| a.name.cmp(&b.name)));
        stats
    }

    fn concentration_alerts(
        &self,
        groups: &[GroupStats],
        alert_type: AlertType,
        label: &str,
        scored_total: usize,
        low_total: usize,
    ) -> Vec<Alert> {
        if scored_total == 0 || low_total == 0 {
            return Vec::new();
        }
        groups
            .iter()
            .filter(|g| g.low_count >= self.config.concentration_min_low)
            .filter_map(|g| {
                let low_share = g.low_count as f64 / low_total as f64;
                let volume_share = g.count as f64 / scored_total as f64;
                (low_share >= self.config.concentration_factor * volume_share).then(|| Alert {
                    alert_type,
                    message: format!(
                        "{label} '{}' accounts for {:.0}% of low-scoring answers but only {:.0}% of traffic",
                        g.name,
                        low_share * 100.0,
                        volume_share * 100.0
                    ),
                    severity: Severity::Medium,
                    affected_count: g.low_count,
                    subject: Some(g.name.clone()),
                })
            })
            .collect()
    }

    fn suggestion(alert: &Alert) -> String {
        let subject = alert.subject.as_deref().unwrap_or("unknown");
        match alert.alert_type {
            AlertType::ScoreDrop => "Review recent prompt, model and knowledge-base changes; answer quality fell below the trailing baseline.".to_string(),
            AlertType::CategoryConcentration => format!(
                "Add or improve knowledge-base content for category '{subject}' and check that retrieval returns it."
            ),
            AlertType::IntentConcentration => format!(
                "Review how intent '{subject}' is answered; add examples or documents covering it."
            ),
            AlertType::VolumeFloor => "Collect more evaluations (raise the sampling rate or run a golden set) before acting on these statistics.".to_string(),
        }
    }

    /// Compute statistics and alerts for `window`, comparing against `baseline`.
    pub fn analyze(
        &self,
        period_days: u32,
        period_end: DateTime<Utc>,
        window: &[EvaluationRecord],
        baseline: &[EvaluationRecord],
    ) -> DiagnosisSummary {
        let cfg = &self.config;
        let period_start = period_end
            .checked_sub_signed(Duration::days(i64::from(period_days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let scored: Vec<(&EvaluationRecord, f64)> = window
            .iter()
            .filter_map(|r| r.overall_score().map(|s| (r, s)))
            .collect();
        let scores: Vec<f64> = scored.iter().map(|(_, s)| *s).collect();
        let avg_score = mean(&scores);
        let baseline_scores: Vec<f64> = baseline.iter().filter_map(|r| r.overall_score()).collect();
        let baseline_avg_score = mean(&baseline_scores);

        let high_score_count = scores.iter().filter(|s| **s >= cfg.high_score_threshold).count();
        let low_score_count = scores.iter().filter(|s| **s < cfg.low_score_threshold).count();

        let mut distribution = [0usize; BUCKET_LABELS.len()];
        for score in &scores {
            distribution[bucket_index(*score)] += 1;
        }
        let score_distribution = BUCKET_LABELS
            .iter()
            .zip(distribution)
            .map(|(label, count)| ScoreBucket {
                label: label.to_string(),
                count,
            })
            .collect();

        let by_category = self.group_stats(&scored, |r| r.category());
        let by_intent = self.group_stats(&scored, |r| r.intent());

        let mut lowest: Vec<&(&EvaluationRecord, f64)> = scored
            .iter()
            .filter(|(_, s)| *s < cfg.low_score_threshold)
            .collect();
        lowest.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.timestamp.cmp(&b.0.timestamp)));
        let lowest_scoring = lowest
            .into_iter()
            .take(cfg.top_low_scoring)
            .map(|(r, s)| LowScoringQuery {
                evaluation_id: r.id,
                query_id: r.query_id,
                query: r.metadata.query_text.clone().unwrap_or_default(),
                overall_score: *s,
                category: r.category().map(str::to_string),
                intent: r.intent().map(str::to_string),
            })
            .collect();

        let mut alerts = Vec::new();
        if let (Some(avg), Some(base)) = (avg_score, baseline_avg_score)
            && base > 0.0
            && base - avg > cfg.score_drop_fraction * base
        {
            alerts.push(Alert {
                alert_type: AlertType::ScoreDrop,
                message: format!(
                    "Average score dropped {:.1}% from {:.2} to {:.2} compared with the previous {} days",
                    (base - avg) / base * 100.0,
                    base,
                    avg,
                    period_days
                ),
                severity: Severity::High,
                affected_count: low_score_count,
                subject: None,
            });
        }
        alerts.extend(self.concentration_alerts(
            &by_category,
            AlertType::CategoryConcentration,
            "Category",
            scores.len(),
            low_score_count,
        ));
        alerts.extend(self.concentration_alerts(
            &by_intent,
            AlertType::IntentConcentration,
            "Intent",
            scores.len(),
            low_score_count,
        ));
        if window.len() < cfg.min_evaluations {
            alerts.push(Alert {
                alert_type: AlertType::VolumeFloor,
                message: format!(
                    "Only {} evaluations in the last {} days; at least {} are needed for reliable statistics",
                    window.len(),
                    period_days,
                    cfg.min_evaluations
                ),
                severity: Severity::Low,
                affected_count: window.len(),
                subject: None,
            });
        }
        alerts.sort_by(|a, b| {
            a.severity
                .rank()
                .cmp(&b.severity.rank())
                .then_with(|| b.affected_count.cmp(&a.affected_count))
                .then_with(|| a.message.cmp(&b.message))
        });

        let top_issues = alerts.iter().map(|a| a.message.clone()).collect();
        let mut suggestions: Vec<String> = Vec::new();
        for alert in &alerts {
            let suggestion = Self::suggestion(alert);
            if !suggestions.contains(&suggestion) {
                suggestions.push(suggestion);
            }
        }

        DiagnosisSummary {
            period_start,
            period_end,
            period_days,
            total_evaluations: window.len(),
            scored_evaluations: scores.len(),
            avg_score,
            baseline_avg_score,
            high_score_count,
            low_score_count,
            by_category,
            by_intent,
            score_distribution,
            lowest_scoring,
            alerts,
            top_issues,
            suggestions,
        }
    }

    /// Map each alert to an issue and its rule-based remediation actions.
    pub fn issues_and_actions(&self, summary: &DiagnosisSummary) -> (Vec<Issue>, Vec<Action>) {
        let mut issues = Vec::new();
        let mut actions = Vec::new();

        for (i, alert) in summary.alerts.iter().enumerate() {
            let issue_id = format!("issue_{}", i + 1);
            let examples: Vec<String> = summary
                .lowest_scoring
                .iter()
                .filter(|q| match (alert.alert_type, alert.subject.as_deref()) {
                    (AlertType::CategoryConcentration, Some(s)) => q.category.as_deref().unwrap_or("unknown") == s,
                    (AlertType::IntentConcentration, Some(s)) => q.intent.as_deref().unwrap_or("unknown") == s,
                    _ => true,
                })
                .filter(|q| !q.query.is_empty())
                .take(3)
                .map(|q| q.query.clone())
                .collect();

            let category = match alert.alert_type {
                AlertType::ScoreDrop => IssueCategory::Generation,
                AlertType::CategoryConcentration => IssueCategory::Retrieval,
                AlertType::IntentConcentration => IssueCategory::KnowledgeGap,
                AlertType::VolumeFloor => IssueCategory::Monitoring,
            };
            let action = |suffix: &str,
                          action_type: ActionType,
                          description: String,
                          changes: Option<serde_json::Value>,
                          improvement: &str| Action {
                id: format!("action_{issue_id}_{suffix}"),
                issue_id: issue_id.clone(),
                action_type,
                description,
                parameter_changes: changes,
                expected_improvement: improvement.to_string(),
            };

            match alert.alert_type {
                AlertType::ScoreDrop => actions.push(action(
                    "1",
                    ActionType::NeedsApproval,
                    "Update system prompt for better response quality".to_string(),
                    None,
                    "May improve response accuracy and tone",
                )),
                AlertType::CategoryConcentration | AlertType::IntentConcentration => {
                    let to = self.current_top_k + 2;
                    actions.push(action(
                        "1",
                        ActionType::AutoSafe,
                        "Increase top_k retrieval parameter".to_string(),
                        Some(serde_json::json!({ "top_k": { "from": self.current_top_k, "to": to } })),
                        "May improve recall by retrieving more relevant documents",
                    ));
                    actions.push(action(
                        "2",
                        ActionType::Manual,
                        format!(
                            "Add more knowledge-base content for: {}",
                            alert.subject.as_deref().unwrap_or("identified gap")
                        ),
                        None,
                        "Will enable the chatbot to answer currently unsupported queries",
                    ));
                }
                AlertType::VolumeFloor => actions.push(action(
                    "1",
                    ActionType::Manual,
                    "Raise the evaluation sampling rate or run a golden set".to_string(),
                    None,
                    "Makes the health statistics meaningful",
                )),
            }

            issues.push(Issue {
                id: issue_id.clone(),
                category,
                severity: alert.severity,
                description: alert.message.clone(),
                affected_count: alert.affected_count,
                example_queries: examples,
            });
        }

        (issues, actions)
    }

    pub fn headline(&self, summary: &DiagnosisSummary) -> String {
        if summary.total_evaluations < self.config.min_evaluations {
            return format!(
                "Insufficient data: only {} evaluations found, need at least {}.",
                summary.total_evaluations, self.config.min_evaluations
            );
        }
        match summary.avg_score {
            Some(avg) => format!(
                "{} evaluations, average score {:.2}, {} alert(s).",
                summary.total_evaluations,
                avg,
                summary.alerts.len()
            ),
            None => format!(
                "{} evaluations without an overall score, {} alert(s).",
                summary.total_evaluations,
                summary.alerts.len()
            ),
        }
    }
}

/// Loads windows from the store and produces summaries, reports and alerts.
pub struct DiagnosisService {
    store: Arc<dyn EvaluationStore>,
    analyzer: DiagnosisAnalyzer,
    narrator: Option<Arc<dyn Narrator>>,
}

impl DiagnosisService {
    pub fn new(store: Arc<dyn EvaluationStore>, analyzer: DiagnosisAnalyzer) -> Self {
        Self {
            store,
            analyzer,
            narrator: None,
        }
    }

    pub fn with_narrator(mut self, narrator: Arc<dyn Narrator>) -> Self {
        self.narrator = Some(narrator);
        self
    }

    pub fn default_period_days(&self) -> u32 {
        self.analyzer.config().default_period_days
    }

    pub async fn summary_at(&self, days: Option<u32>, now: DateTime<Utc>) -> Result<DiagnosisSummary> {
        let days = days.unwrap_or(self.default_period_days());
        if !(1..=MAX_PERIOD_DAYS).contains(&days) {
            return Err(ValidationError::invalid("days", format!("must be between 1 and {MAX_PERIOD_DAYS}")).into());
        }
        let span = Duration::days(i64::from(days));
        let out_of_range = || ValidationError::invalid("days", "window reaches before the representable range");
        let window_start = now.checked_sub_signed(span).ok_or_else(out_of_range)?;
        let baseline_start = window_start.checked_sub_signed(span).ok_or_else(out_of_range)?;
        let records = self.store.evaluations_between(baseline_start, now).await?;
        let (window, baseline): (Vec<EvaluationRecord>, Vec<EvaluationRecord>) = records
            .into_iter()
            .partition(|r| r.timestamp >= window_start);

        let summary = self.analyzer.analyze(days, now, &window, &baseline);
        info!(
            days,
            total = summary.total_evaluations,
            alerts = summary.alerts.len(),
            "Diagnosis summary computed"
        );
        Ok(summary)
    }

    pub async fn summary(&self, days: Option<u32>) -> Result<DiagnosisSummary> {
        self.summary_at(days, Utc::now()).await
    }

    pub async fn alerts(&self, days: Option<u32>, severity: Option<Severity>) -> Result<Vec<Alert>> {
        let summary = self.summary(days).await?;
        Ok(summary
            .alerts
            .into_iter()
            .filter(|a| severity.is_none_or(|s| a.severity == s))
            .collect())
    }

    /// Structured summary plus issues and actions. The narrative is best-effort.
    pub async fn report(&self, days: Option<u32>) -> Result<DiagnosisReport> {
        let summary = self.summary(days).await?;
        let (issues, actions) = self.analyzer.issues_and_actions(&summary);
        let enough_data = summary.total_evaluations >= self.analyzer.config().min_evaluations;

        let narrative = match &self.narrator {
            Some(narrator) if enough_data => match narrator.narrate(&summary).await {
                Ok(text) if !text.is_empty() => Some(text),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "Diagnosis narrative unavailable");
                    None
                }
            },
            _ => None,
        };

        Ok(DiagnosisReport {
            generated_at: Utc::now(),
            headline: self.analyzer.headline(&summary),
            summary,
            narrative,
            issues,
            actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CriterionScores, EvaluationMetadata, EvaluationScores, EvaluationType, EvaluatorIdentity,
    };
    use pretty_assertions::assert_eq;

    /// A record whose overall score is `total / 30`.
    fn record(total: u8, category: &str, intent: &str) -> EvaluationRecord {
        let mut values = [0u8; 6];
        let mut remaining = total;
        for v in values.iter_mut() {
            *v = remaining.min(5);
            remaining -= *v;
        }
        let scores = EvaluationScores::from_criteria(CriterionScores {
            accuracy: values[0],
            completeness: values[1],
            faithfulness: values[2],
            tone: values[3],
            relevance: values[4],
            clarity: values[5],
        });
        EvaluationRecord::new(
            Uuid::new_v4(),
            EvaluationType::LlmJudge,
            scores,
            EvaluatorIdentity::new("mock", "mock-model"),
            EvaluationMetadata {
                category: Some(category.into()),
                intent: Some(intent.into()),
                query_text: Some(format!("query in {category}")),
                ..Default::default()
            },
        )
    }

    fn analyzer() -> DiagnosisAnalyzer {
        DiagnosisAnalyzer::new(DiagnosisConfig::default())
    }

    #[test]
    fn test_bucket_index_edges() {
        assert_eq!(bucket_index(0.0), 0);
        assert_eq!(bucket_index(0.2), 1);
        assert_eq!(bucket_index(0.79), 3);
        assert_eq!(bucket_index(1.0), 4);
    }

    #[test]
    fn test_empty_window() {
        let summary = analyzer().analyze(7, Utc::now(), &[], &[]);
        assert_eq!(summary.total_evaluations, 0);
        assert_eq!(summary.avg_score, None);
        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.alerts[0].alert_type, AlertType::VolumeFloor);
        assert_eq!(summary.alerts[0].severity, Severity::Low);
        assert!(analyzer().headline(&summary).starts_with("Insufficient data"));
    }

    #[test]
    fn test_no_drop_alert_within_threshold() {
        let window: Vec<_> = (0..12).map(|_| record(24, "ORDER", "track")).collect();
        let baseline: Vec<_> = (0..12).map(|_| record(25, "ORDER", "track")).collect();
        let summary = analyzer().analyze(7, Utc::now(), &window, &baseline);
        assert!(summary.alerts.is_empty());
        assert_eq!(summary.high_score_count, 12);
        assert_eq!(summary.score_distribution[4].count, 12);
    }

    #[test]
    fn test_concentration_alert() {
        // 10 healthy ORDER records, 4 poor REFUND records.
        let mut window: Vec<_> = (0..10).map(|_| record(27, "ORDER", "track")).collect();
        window.extend((0..4).map(|_| record(9, "REFUND", "track")));
        let summary = analyzer().analyze(7, Utc::now(), &window, &[]);

        let concentration: Vec<_> = summary
            .alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::CategoryConcentration)
            .collect();
        assert_eq!(concentration.len(), 1);
        assert_eq!(concentration[0].subject.as_deref(), Some("REFUND"));
        assert_eq!(concentration[0].affected_count, 4);
        // A single intent holds all traffic, so it cannot be over-represented.
        assert!(!summary.alerts.iter().any(|a| a.alert_type == AlertType::IntentConcentration));
        assert_eq!(summary.by_category[0].name, "REFUND");
        assert_eq!(summary.lowest_scoring.len(), 4);
    }

    #[test]
    fn test_analysis_is_reproducible() {
        let mut window: Vec<_> = (0..6).map(|_| record(27, "ORDER", "track")).collect();
        window.extend((0..5).map(|_| record(6, "REFUND", "refund")));
        let baseline: Vec<_> = (0..8).map(|_| record(27, "ORDER", "track")).collect();
        let now = Utc::now();
        let a = analyzer().analyze(7, now, &window, &baseline);
        let b = analyzer().analyze(7, now, &window, &baseline);
        assert_eq!(a, b);
        assert_eq!(a.top_issues.len(), a.alerts.len());
        assert_eq!(a.alerts[0].severity, Severity::High);
    }

    #[test]
    fn test_issues_and_actions_catalogue() {
        let mut window: Vec<_> = (0..10).map(|_| record(27, "ORDER", "track")).collect();
        window.extend((0..4).map(|_| record(9, "REFUND", "track")));
        let summary = analyzer().analyze(7, Utc::now(), &window, &[]);
        let (issues, actions) = analyzer().with_top_k(5).issues_and_actions(&summary);

        assert_eq!(issues.len(), summary.alerts.len());
        assert_eq!(issues[0].category, IssueCategory::Retrieval);
        assert_eq!(issues[0].example_queries[0], "query in REFUND");
        let auto = actions
            .iter()
            .find(|a| a.action_type == ActionType::AutoSafe)
            .unwrap();
        assert_eq!(auto.parameter_changes.as_ref().unwrap()["top_k"]["to"], 7);
        assert!(actions.iter().any(|a| a.action_type == ActionType::Manual));
    }

    #[test]
    fn test_severity_from_str() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert!("urgent".parse::<Severity>().is_err());
    }
}
