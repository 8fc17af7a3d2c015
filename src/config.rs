//! YAML configuration.
//!
//! Every section has defaults, so an empty file yields a working setup
//! against a local upstream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::{MetricFilter, SeriesKey};
use crate::sync::{Resource, RetryPolicy, SchedulerConfig};
use crate::timeseries::{AnalyticsConfig, Polarity, ThresholdRule};

/// Longest occurrence window a configured rule may use (100 years).
pub const MAX_WINDOW_DAYS: i64 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub upstream: UpstreamConfig,
    pub fetch: FetchConfig,
    pub polling: PollingConfig,
    pub analytics: AnalyticsSettings,
    /// Per metric type overrides, keyed by metric type.
    pub metrics: HashMap<String, MetricProfile>,
    pub rules: Vec<ThresholdRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::invalid("api.host", format!("{}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            base_url: "http://127.0.0.1:3000/api".to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            timeout_ms: 10_000,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            max_attempts: 3,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.timeout_ms),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    /// Resources fetched alongside `entries`: any of analytics, insights, alerts.
    pub auxiliary: Vec<Resource>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval_secs: 30,
            auxiliary: Vec::new(),
        }
    }
}

impl PollingConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_secs(self.interval_secs),
            auxiliary: self.auxiliary.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub comparison_threshold_pct: f64,
    /// Polarity for metric types without a profile, and for "all".
    pub default_polarity: Polarity,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        AnalyticsSettings {
            comparison_threshold_pct: 5.0,
            default_polarity: Polarity::HigherIsBetter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricProfile {
    pub polarity: Polarity,
    #[serde(default)]
    pub comparison_threshold_pct: Option<f64>,
}

impl Config {
    /// Analytics parameters for one series, applying the metric profile
    /// when the key selects a single metric type.
    pub fn analytics_for(&self, key: &SeriesKey) -> AnalyticsConfig {
        let base = AnalyticsConfig::for_range(key.time_range)
            .with_polarity(self.analytics.default_polarity)
            .with_threshold(self.analytics.comparison_threshold_pct);

        let profile = match &key.metric_type {
            MetricFilter::All => None,
            MetricFilter::Only(metric_type) => self.metrics.get(metric_type),
        };

        match profile {
            Some(profile) => {
                let threshold = profile
                    .comparison_threshold_pct
                    .unwrap_or(self.analytics.comparison_threshold_pct);
                base.with_polarity(profile.polarity).with_threshold(threshold)
            }
            None => base,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.max_attempts < 1 {
            return Err(ConfigError::invalid("fetch.max_attempts", "must be >= 1"));
        }
        if self.fetch.timeout_ms == 0 {
            return Err(ConfigError::invalid("fetch.timeout_ms", "must be > 0"));
        }
        if self.fetch.base_delay_ms > self.fetch.max_delay_ms {
            return Err(ConfigError::invalid(
                "fetch.base_delay_ms",
                format!("must not exceed max_delay_ms ({})", self.fetch.max_delay_ms),
            ));
        }
        if self.polling.interval_secs < 1 {
            return Err(ConfigError::invalid("polling.interval_secs", "must be >= 1"));
        }
        if self.polling.auxiliary.contains(&Resource::Entries) {
            return Err(ConfigError::invalid(
                "polling.auxiliary",
                "entries are always fetched and cannot be listed",
            ));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("upstream.base_url", "must not be empty"));
        }
        check_threshold("analytics.comparison_threshold_pct", self.analytics.comparison_threshold_pct)?;
        for (metric_type, profile) in &self.metrics {
            if let Some(threshold) = profile.comparison_threshold_pct {
                check_threshold(&format!("metrics.{}.comparison_threshold_pct", metric_type), threshold)?;
            }
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::invalid("rules", format!("duplicate rule id '{}'", rule.id)));
            }
            if let Some(window) = &rule.occurrences {
                if window.count == 0 || window.within_days <= 0 {
                    return Err(ConfigError::invalid(
                        format!("rules.{}.occurrences", rule.id),
                        "count and within_days must be positive",
                    ));
                }
                if window.within_days > MAX_WINDOW_DAYS {
                    return Err(ConfigError::invalid(
                        format!("rules.{}.occurrences.within_days", rule.id),
                        format!("must be <= {}", MAX_WINDOW_DAYS),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_threshold(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(field, "must be a finite value >= 0"));
    }
    Ok(())
}

pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    // An empty document parses as null rather than an empty mapping.
    let config: Config = if text.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(text)?
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimeRange;
    use crate::timeseries::rules::Condition;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
api:
  port: 9090
upstream:
  base_url: "http://upstream.local/api"
fetch:
  max_attempts: 5
polling:
  interval_secs: 10
  auxiliary: [alerts, insights]
analytics:
  comparison_threshold_pct: 2.5
metrics:
  stress:
    polarity: lower_is_better
  sleep:
    polarity: higher_is_better
    comparison_threshold_pct: 10
rules:
  - id: hr-high
    metric_type: heart_rate
    severity: critical
    title: High heart rate
    message: "Heart rate {value} at {recordedAt}"
    condition: { type: above, threshold: 120 }
"#;

    fn key(metric_type: MetricFilter) -> SeriesKey {
        SeriesKey {
            patient_id: "p1".to_string(),
            metric_type,
            time_range: TimeRange::Last90Days,
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.fetch.retry_policy(), RetryPolicy::default());
        assert_eq!(config.polling.scheduler_config(), SchedulerConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.host, "127.0.0.1");
        assert_eq!(config.fetch.max_attempts, 5);
        assert_eq!(config.fetch.timeout_ms, 10_000);
        assert_eq!(config.polling.auxiliary, vec![Resource::Alerts, Resource::Insights]);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].condition, Condition::Above { threshold: 120.0 });
        assert_eq!(config.api.socket_addr().unwrap().port(), 9090);
    }

    #[test]
    fn test_metric_profiles() {
        let config = parse_config(SAMPLE).unwrap();

        let stress = config.analytics_for(&key(MetricFilter::only("stress")));
        assert_eq!(stress.polarity, Polarity::LowerIsBetter);
        assert_eq!(stress.comparison_threshold_pct, 2.5);

        let sleep = config.analytics_for(&key(MetricFilter::only("sleep")));
        assert_eq!(sleep.comparison_threshold_pct, 10.0);

        let all = config.analytics_for(&key(MetricFilter::All));
        assert_eq!(all.polarity, Polarity::HigherIsBetter);
        assert_eq!(all.bucket_granularity, TimeRange::Last90Days.bucket_granularity());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = parse_config("fetch:\n  max_attempts: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "fetch.max_attempts"));

        let err = parse_config("fetch:\n  base_delay_ms: 9000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "fetch.base_delay_ms"));

        let err = parse_config("polling:\n  interval_secs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "polling.interval_secs"));

        let err = parse_config("analytics:\n  comparison_threshold_pct: -1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_occurrence_window_bounds() {
        let rule = |within_days: i64| {
            format!(
                "rules:\n  - id: streak\n    severity: info\n    title: t\n    message: m\n    condition: {{ type: above, threshold: 1 }}\n    occurrences: {{ count: 2, within_days: {} }}\n",
                within_days
            )
        };

        assert!(parse_config(&rule(MAX_WINDOW_DAYS)).is_ok());

        let err = parse_config(&rule(100_000_000)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "rules.streak.occurrences.within_days"));

        let err = parse_config(&rule(0)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "rules.streak.occurrences"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = parse_config("polling: [unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/clinisync.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
