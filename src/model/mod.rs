//! Data model shared by the synchronization and analytics layers.
//!
//! Everything here mirrors the JSON shapes served by the upstream read
//! endpoints (camelCase field names, lowercase enum tags).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Clinical status attached to a single reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[serde(alias = "Normal")]
    Normal,
    #[serde(alias = "Warning")]
    Warning,
    #[serde(alias = "Critical")]
    Critical,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Normal => "normal",
            EntryStatus::Warning => "warning",
            EntryStatus::Critical => "critical",
        }
    }

    /// Sort rank, most severe first.
    pub fn severity_rank(&self) -> u8 {
        match self {
            EntryStatus::Critical => 0,
            EntryStatus::Warning => 1,
            EntryStatus::Normal => 2,
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(EntryStatus::Normal),
            "warning" => Ok(EntryStatus::Warning),
            "critical" => Ok(EntryStatus::Critical),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// A single time-stamped measurement. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEntry {
    pub id: String,
    pub patient_id: String,
    pub metric_type: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
    pub status: EntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Metric-type selector: a single metric type or every type ("all").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricFilter {
    #[default]
    All,
    Only(String),
}

impl MetricFilter {
    pub fn only(metric_type: impl Into<String>) -> Self {
        MetricFilter::Only(metric_type.into())
    }

    pub fn matches(&self, metric_type: &str) -> bool {
        match self {
            MetricFilter::All => true,
            MetricFilter::Only(wanted) => wanted == metric_type,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MetricFilter::All => "all",
            MetricFilter::Only(metric_type) => metric_type,
        }
    }
}

impl From<String> for MetricFilter {
    fn from(value: String) -> Self {
        if value.is_empty() || value == "all" {
            MetricFilter::All
        } else {
            MetricFilter::Only(value)
        }
    }
}

impl From<&str> for MetricFilter {
    fn from(value: &str) -> Self {
        MetricFilter::from(value.to_string())
    }
}

impl From<MetricFilter> for String {
    fn from(filter: MetricFilter) -> Self {
        filter.as_str().to_string()
    }
}

impl fmt::Display for MetricFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Granularity of trend buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketGranularity {
    Hour,
    Day,
    Week,
}

impl BucketGranularity {
    pub fn seconds(&self) -> i64 {
        match self {
            BucketGranularity::Hour => 3600,
            BucketGranularity::Day => 86_400,
            BucketGranularity::Week => 7 * 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "24h")]
    Last24Hours,
    #[default]
    #[serde(rename = "7d")]
    Last7Days,
    #[serde(rename = "30d")]
    Last30Days,
    #[serde(rename = "90d")]
    Last90Days,
}

impl TimeRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Last24Hours => "24h",
            TimeRange::Last7Days => "7d",
            TimeRange::Last30Days => "30d",
            TimeRange::Last90Days => "90d",
        }
    }

    /// Trend bucket size used when charting this range.
    pub fn bucket_granularity(&self) -> BucketGranularity {
        match self {
            TimeRange::Last24Hours => BucketGranularity::Hour,
            TimeRange::Last7Days | TimeRange::Last30Days => BucketGranularity::Day,
            TimeRange::Last90Days => BucketGranularity::Week,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "24h" => Ok(TimeRange::Last24Hours),
            "7d" => Ok(TimeRange::Last7Days),
            "30d" => Ok(TimeRange::Last30Days),
            "90d" => Ok(TimeRange::Last90Days),
            other => Err(format!("unknown time range '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Date,
    Value,
    Status,
}

/// UI parameters for one dashboard query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub patient_id: String,
    #[serde(default)]
    pub metric_type: MetricFilter,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub sort_key: SortKey,
    #[serde(default)]
    pub search_text: String,
}

impl QueryParams {
    pub fn new(patient_id: impl Into<String>, metric_type: MetricFilter, time_range: TimeRange) -> Self {
        QueryParams {
            patient_id: patient_id.into(),
            metric_type,
            time_range,
            sort_key: SortKey::default(),
            search_text: String::new(),
        }
    }

    /// The part of the parameters that selects what is fetched.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            patient_id: self.patient_id.clone(),
            metric_type: self.metric_type.clone(),
            time_range: self.time_range,
        }
    }
}

/// Identity of one metric stream in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesKey {
    pub patient_id: String,
    pub metric_type: MetricFilter,
    pub time_range: TimeRange,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.patient_id, self.metric_type, self.time_range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A derived notice about one entry. Alerts and insights share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub source_entry_id: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

pub type Alert = Finding;
pub type Insight = Finding;
