//! Time-series analytics
//!
//! Pure functions over a snapshot's entries:
//! - Aggregates, trend buckets and split-period comparison
//! - Threshold rules producing alerts and insights
//! - Filtered, sorted and searched projections for display

pub mod analytics;
pub mod functions;
pub mod query;
pub mod rules;

pub use analytics::{compute_analytics, AnalyticsConfig, AnalyticsSnapshot, Polarity, TrendLabel};
pub use query::{project, QueryView, ViewParams};
pub use rules::{evaluate, Evaluation, Rule, RuleKind, ThresholdRule};
