//! Threshold rule evaluation producing alerts and insights.
//!
//! Rules are evaluated independently per entry. Rules that need history
//! receive a time-ordered window slice built here; they never look beyond
//! it. Output order is `timestamp` descending, then source entry id
//! ascending, then rule order, so repeated runs yield identical output.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::model::{Alert, EntryStatus, Finding, Insight, MetricEntry, MetricFilter, Severity};

type EntryPredicate = Arc<dyn Fn(&MetricEntry) -> bool + Send + Sync>;
type WindowPredicate = Arc<dyn Fn(&MetricEntry, &[&MetricEntry]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    #[default]
    Alert,
    Insight,
}

#[derive(Clone)]
pub enum Predicate {
    Entry(EntryPredicate),
    /// `check(entry, window)` where `window` holds the in-scope entries
    /// recorded within `span` up to and including the entry's timestamp.
    Window { span: Duration, check: WindowPredicate },
}

#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub metric_type: MetricFilter,
    pub kind: RuleKind,
    pub severity: Severity,
    pub title: String,
    pub message_template: String,
    predicate: Predicate,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("metric_type", &self.metric_type)
            .field("kind", &self.kind)
            .field("severity", &self.severity)
            .field("windowed", &matches!(self.predicate, Predicate::Window { .. }))
            .finish()
    }
}

impl Rule {
    pub fn new<F>(
        id: impl Into<String>,
        metric_type: MetricFilter,
        severity: Severity,
        title: impl Into<String>,
        message_template: impl Into<String>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&MetricEntry) -> bool + Send + Sync + 'static,
    {
        Rule {
            id: id.into(),
            metric_type,
            kind: RuleKind::Alert,
            severity,
            title: title.into(),
            message_template: message_template.into(),
            predicate: Predicate::Entry(Arc::new(predicate)),
        }
    }

    /// A negative `span` is treated as zero.
    pub fn windowed<F>(
        id: impl Into<String>,
        metric_type: MetricFilter,
        severity: Severity,
        title: impl Into<String>,
        message_template: impl Into<String>,
        span: Duration,
        check: F,
    ) -> Self
    where
        F: Fn(&MetricEntry, &[&MetricEntry]) -> bool + Send + Sync + 'static,
    {
        Rule {
            id: id.into(),
            metric_type,
            kind: RuleKind::Alert,
            severity,
            title: title.into(),
            message_template: message_template.into(),
            predicate: Predicate::Window {
                span: span.max(Duration::zero()),
                check: Arc::new(check),
            },
        }
    }

    /// Fires on a matching entry once at least `count` matching entries
    /// (itself included) fall within `span`.
    pub fn occurrences<F>(
        id: impl Into<String>,
        metric_type: MetricFilter,
        severity: Severity,
        title: impl Into<String>,
        message_template: impl Into<String>,
        count: usize,
        span: Duration,
        matcher: F,
    ) -> Self
    where
        F: Fn(&MetricEntry) -> bool + Send + Sync + 'static,
    {
        let matcher = Arc::new(matcher);
        Rule::windowed(id, metric_type, severity, title, message_template, span, move |entry, window| {
            matcher(entry) && window.iter().filter(|e| matcher(e)).count() >= count
        })
    }

    pub fn with_kind(mut self, kind: RuleKind) -> Self {
        self.kind = kind;
        self
    }

    fn finding(&self, entry: &MetricEntry) -> Finding {
        Finding {
            id: format!("{}:{}", self.id, entry.id),
            source_entry_id: entry.id.clone(),
            severity: self.severity,
            title: render_template(&self.title, entry),
            description: render_template(&self.message_template, entry),
            timestamp: entry.recorded_at,
        }
    }
}

/// Substitute entry fields into a message template.
pub fn render_template(template: &str, entry: &MetricEntry) -> String {
    template
        .replace("{value}", &entry.value.to_string())
        .replace("{metricType}", &entry.metric_type)
        .replace("{status}", entry.status.as_str())
        .replace("{recordedAt}", &entry.recorded_at.to_rfc3339())
        .replace("{deviceType}", entry.device_type.as_deref().unwrap_or("unknown device"))
        .replace("{patientId}", &entry.patient_id)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub alerts: Vec<Alert>,
    pub insights: Vec<Insight>,
}

pub fn evaluate(entries: &[MetricEntry], rules: &[Rule]) -> Evaluation {
    let mut ordered: Vec<&MetricEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.id.cmp(&b.id)));

    let mut alerts = Vec::new();
    let mut insights = Vec::new();

    for (rule_index, rule) in rules.iter().enumerate() {
        let scoped: Vec<&MetricEntry> = ordered
            .iter()
            .copied()
            .filter(|e| rule.metric_type.matches(&e.metric_type))
            .collect();

        let output = match rule.kind {
            RuleKind::Alert => &mut alerts,
            RuleKind::Insight => &mut insights,
        };

        match &rule.predicate {
            Predicate::Entry(predicate) => {
                for entry in &scoped {
                    if predicate(entry) {
                        output.push((rule_index, rule.finding(entry)));
                    }
                }
            }
            Predicate::Window { span, check } => {
                let mut start = 0;
                for (i, entry) in scoped.iter().enumerate() {
                    let earliest = entry
                        .recorded_at
                        .checked_sub_signed(*span)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    while start < i && scoped[start].recorded_at < earliest {
                        start += 1;
                    }
                    let end = i + scoped[i + 1..]
                        .iter()
                        .take_while(|e| e.recorded_at == entry.recorded_at)
                        .count();

                    if check(entry, &scoped[start..=end]) {
                        output.push((rule_index, rule.finding(entry)));
                    }
                }
            }
        }
    }

    Evaluation {
        alerts: into_display_order(alerts),
        insights: into_display_order(insights),
    }
}

fn into_display_order(mut findings: Vec<(usize, Finding)>) -> Vec<Finding> {
    findings.sort_by(|(rule_a, a), (rule_b, b)| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.source_entry_id.cmp(&b.source_entry_id))
            .then_with(|| rule_a.cmp(rule_b))
    });
    findings.into_iter().map(|(_, finding)| finding).collect()
}

/// Declarative condition used by configured rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Above { threshold: f64 },
    Below { threshold: f64 },
    Outside { min: f64, max: f64 },
    Status { status: EntryStatus },
}

impl Condition {
    pub fn matches(&self, entry: &MetricEntry) -> bool {
        match self {
            Condition::Above { threshold } => entry.value > *threshold,
            Condition::Below { threshold } => entry.value < *threshold,
            Condition::Outside { min, max } => entry.value < *min || entry.value > *max,
            Condition::Status { status } => entry.status == *status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccurrenceWindow {
    pub count: usize,
    pub within_days: i64,
}

/// Rule as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub id: String,
    #[serde(default)]
    pub metric_type: MetricFilter,
    #[serde(default)]
    pub kind: RuleKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub condition: Condition,
    #[serde(default)]
    pub occurrences: Option<OccurrenceWindow>,
}

impl ThresholdRule {
    pub fn compile(&self) -> Rule {
        let condition = self.condition.clone();
        let rule = match &self.occurrences {
            Some(window) => Rule::occurrences(
                self.id.clone(),
                self.metric_type.clone(),
                self.severity,
                self.title.clone(),
                self.message.clone(),
                window.count,
                Duration::try_days(window.within_days).unwrap_or(Duration::MAX),
                move |entry| condition.matches(entry),
            ),
            None => Rule::new(
                self.id.clone(),
                self.metric_type.clone(),
                self.severity,
                self.title.clone(),
                self.message.clone(),
                move |entry| condition.matches(entry),
            ),
        };
        rule.with_kind(self.kind)
    }
}
