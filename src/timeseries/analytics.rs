//! Aggregate analytics over one metric stream.
//!
//! `compute_analytics` is pure: it never mutates its input and is total
//! over any entry list, including the empty one.

use serde::{Deserialize, Serialize};

use super::functions::{TimeSeriesFunctions, TrendPoint};
use crate::model::{BucketGranularity, EntryStatus, MetricEntry, TimeRange};

/// Whether a rising value is an improvement for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    HigherIsBetter,
    LowerIsBetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendLabel {
    Improved,
    Declined,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyticsConfig {
    pub bucket_granularity: BucketGranularity,
    /// Magnitude of change, in percent, beyond which a trend is not stable.
    pub comparison_threshold_pct: f64,
    pub polarity: Polarity,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        AnalyticsConfig {
            bucket_granularity: BucketGranularity::Day,
            comparison_threshold_pct: 5.0,
            polarity: Polarity::HigherIsBetter,
        }
    }
}

impl AnalyticsConfig {
    pub fn for_range(time_range: TimeRange) -> Self {
        AnalyticsConfig {
            bucket_granularity: time_range.bucket_granularity(),
            ..AnalyticsConfig::default()
        }
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_threshold(mut self, comparison_threshold_pct: f64) -> Self {
        self.comparison_threshold_pct = comparison_threshold_pct;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub normal: usize,
    pub warning: usize,
    pub critical: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.normal + self.warning + self.critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub previous_avg: f64,
    pub current_avg: f64,
    pub change_pct: f64,
    pub label: TrendLabel,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsSnapshot {
    pub total_entries: usize,
    pub avg_value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub status_counts: StatusCounts,
    pub trend: Vec<TrendPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Comparison>,
}

pub fn compute_analytics(entries: &[MetricEntry], config: &AnalyticsConfig) -> AnalyticsSnapshot {
    let stats = TimeSeriesFunctions::calculate_stats(entries);

    let mut status_counts = StatusCounts::default();
    for entry in entries {
        match entry.status {
            EntryStatus::Normal => status_counts.normal += 1,
            EntryStatus::Warning => status_counts.warning += 1,
            EntryStatus::Critical => status_counts.critical += 1,
        }
    }

    AnalyticsSnapshot {
        total_entries: entries.len(),
        avg_value: stats.mean,
        min_value: stats.min,
        max_value: stats.max,
        status_counts,
        trend: TimeSeriesFunctions::bucket_means(entries, config.bucket_granularity),
        comparison: compare_halves(entries, config),
    }
}

/// Split the time-ordered entries at `n / 2` and compare the older half's
/// mean with the newer half's.
pub fn compare_halves(entries: &[MetricEntry], config: &AnalyticsConfig) -> Option<Comparison> {
    let ordered = TimeSeriesFunctions::sorted_by_time(entries);
    let (previous, current) = ordered.split_at(ordered.len() / 2);

    let previous_avg = TimeSeriesFunctions::mean(previous.iter().map(|e| e.value))?;
    let current_avg = TimeSeriesFunctions::mean(current.iter().map(|e| e.value))?;

    if previous_avg == 0.0 {
        return None;
    }

    let change_pct = (current_avg - previous_avg) / previous_avg * 100.0;
    if !change_pct.is_finite() {
        return None;
    }

    Some(Comparison {
        previous_avg,
        current_avg,
        change_pct,
        label: label_for(change_pct, config),
    })
}

fn label_for(change_pct: f64, config: &AnalyticsConfig) -> TrendLabel {
    let directed = match config.polarity {
        Polarity::HigherIsBetter => change_pct,
        Polarity::LowerIsBetter => -change_pct,
    };

    if directed > config.comparison_threshold_pct {
        TrendLabel::Improved
    } else if directed < -config.comparison_threshold_pct {
        TrendLabel::Declined
    } else {
        TrendLabel::Stable
    }
}
