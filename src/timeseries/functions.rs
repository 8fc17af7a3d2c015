use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{BucketGranularity, MetricEntry};

/// 1970-01-05 was a Monday; week buckets are aligned to it.
const WEEK_ALIGNMENT_OFFSET: i64 = 4 * 86_400;

/// Summary statistics over entry values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SeriesStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

/// Mean value of one trend bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub bucket: DateTime<Utc>,
    pub value: f64,
}

/// Collection of time series functions
pub struct TimeSeriesFunctions;

impl TimeSeriesFunctions {
    /// Arithmetic mean, `None` for an empty input.
    pub fn mean<I>(values: I) -> Option<f64>
    where
        I: IntoIterator<Item = f64>,
    {
        let (sum, count) = values
            .into_iter()
            .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));

        if count == 0 {
            None
        } else {
            Some(sum / count as f64)
        }
    }

    /// Calculate statistics for a set of entries. All fields are zero when
    /// the input is empty.
    pub fn calculate_stats(entries: &[MetricEntry]) -> SeriesStats {
        if entries.is_empty() {
            return SeriesStats::default();
        }

        let min = entries.iter().fold(f64::INFINITY, |a, e| a.min(e.value));
        let max = entries.iter().fold(f64::NEG_INFINITY, |a, e| a.max(e.value));

        SeriesStats {
            count: entries.len(),
            mean: Self::mean(entries.iter().map(|e| e.value)).unwrap_or(0.0),
            min,
            max,
        }
    }

    /// Start of the bucket `timestamp` falls into.
    pub fn bucket_start(timestamp: DateTime<Utc>, granularity: BucketGranularity) -> DateTime<Utc> {
        let secs = timestamp.timestamp();
        let width = granularity.seconds();

        let start = match granularity {
            BucketGranularity::Week => secs - (secs - WEEK_ALIGNMENT_OFFSET).rem_euclid(width),
            _ => secs - secs.rem_euclid(width),
        };

        DateTime::from_timestamp(start, 0).unwrap_or(timestamp)
    }

    /// Group entries into fixed buckets and average each one. Buckets come
    /// back in ascending time order; empty buckets are not emitted.
    pub fn bucket_means(entries: &[MetricEntry], granularity: BucketGranularity) -> Vec<TrendPoint> {
        let mut grouped: BTreeMap<DateTime<Utc>, (f64, usize)> = BTreeMap::new();

        for entry in entries {
            let bucket = Self::bucket_start(entry.recorded_at, granularity);
            let slot = grouped.entry(bucket).or_insert((0.0, 0));
            slot.0 += entry.value;
            slot.1 += 1;
        }

        grouped
            .into_iter()
            .map(|(bucket, (sum, count))| TrendPoint {
                bucket,
                value: sum / count as f64,
            })
            .collect()
    }

    /// Entries in ascending `recorded_at` order; ties keep their input order.
    pub fn sorted_by_time(entries: &[MetricEntry]) -> Vec<&MetricEntry> {
        let mut ordered: Vec<&MetricEntry> = entries.iter().collect();
        ordered.sort_by_key(|e| e.recorded_at);
        ordered
    }
}
