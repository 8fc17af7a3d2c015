use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{Alert, Insight, MetricEntry, SeriesKey};
use crate::timeseries::analytics::AnalyticsSnapshot;

/// Payloads fetched alongside the entries when the upstream serves them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<AnalyticsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<Vec<Insight>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alerts: Option<Vec<Alert>>,
}

impl RemoteResources {
    pub fn is_empty(&self) -> bool {
        self.analytics.is_none() && self.insights.is_none() && self.alerts.is_none()
    }
}

/// Wholesale capture of one metric stream, in the order the upstream sent it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesSnapshot {
    pub key: SeriesKey,
    pub sequence: u64,
    pub fetched_at: DateTime<Utc>,
    pub entries: Vec<MetricEntry>,
    #[serde(skip_serializing_if = "RemoteResources::is_empty")]
    pub remote: RemoteResources,
}

impl SeriesSnapshot {
    pub fn new(key: SeriesKey, sequence: u64, entries: Vec<MetricEntry>) -> Self {
        SeriesSnapshot {
            key,
            sequence,
            fetched_at: Utc::now(),
            entries,
            remote: RemoteResources::default(),
        }
    }

    pub fn with_remote(mut self, remote: RemoteResources) -> Self {
        self.remote = remote;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
