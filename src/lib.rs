//! Clinisync: synchronization and analytics for clinical monitoring dashboards
//!
//! Clinisync keeps per-patient metric streams in sync with an upstream read
//! API and derives what a dashboard shows from them: aggregates and trends,
//! rule-based alerts and insights, and filtered, sorted entry lists.
//!
//! Fetch cycles are cancellable and sequence-numbered, so a stale response
//! never overwrites newer data and a superseded query never writes at all.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;
pub mod timeseries;

pub use config::{load_config, Config};
pub use engine::{Dashboard, MonitoringEngine};
pub use error::{EngineError, EngineResult};
