//! Single-resource reads with timeout, retry and exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::FetchError;
use super::transport::{FetchRequest, Resource, Transport};
use crate::model::{Alert, Insight, MetricEntry};
use crate::timeseries::analytics::AnalyticsSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Ceiling for one attempt; exceeding it counts as a failed attempt.
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: Duration::from_secs(10),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry - 1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Decoded response of one resource read.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Entries(Vec<MetricEntry>),
    Analytics(AnalyticsSnapshot),
    Insights(Vec<Insight>),
    Alerts(Vec<Alert>),
}

impl Payload {
    pub fn decode(resource: Resource, body: &str) -> Result<Self, FetchError> {
        let payload = match resource {
            Resource::Entries => {
                let entries: Vec<MetricEntry> = serde_json::from_str(body).map_err(FetchError::from_json)?;
                ensure_unique_ids(&entries)?;
                Payload::Entries(entries)
            }
            Resource::Analytics => Payload::Analytics(serde_json::from_str(body).map_err(FetchError::from_json)?),
            Resource::Insights => Payload::Insights(serde_json::from_str(body).map_err(FetchError::from_json)?),
            Resource::Alerts => Payload::Alerts(serde_json::from_str(body).map_err(FetchError::from_json)?),
        };
        Ok(payload)
    }
}

fn ensure_unique_ids(entries: &[MetricEntry]) -> Result<(), FetchError> {
    let mut seen = HashSet::with_capacity(entries.len());
    for entry in entries {
        if !seen.insert(entry.id.as_str()) {
            return Err(FetchError::Schema {
                message: format!("duplicate entry id '{}'", entry.id),
            });
        }
    }
    Ok(())
}

pub struct Fetcher<T> {
    transport: Arc<T>,
    policy: RetryPolicy,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Fetcher { transport, policy }
    }

    pub async fn fetch(&self, request: &FetchRequest, token: &CancellationToken) -> Result<Payload, FetchError> {
        self.fetch_observed(request, token, &|_: u32, _: &FetchError| {}).await
    }

    /// Like [`Fetcher::fetch`], calling `on_retry(next_attempt, &error)`
    /// each time a retry is scheduled.
    ///
    /// Returns `FetchError::Cancelled` as soon as `token` is cancelled; no
    /// further attempts or backoff sleeps happen after that.
    pub async fn fetch_observed(
        &self,
        request: &FetchRequest,
        token: &CancellationToken,
        on_retry: &(dyn Fn(u32, &FetchError) + Send + Sync),
    ) -> Result<Payload, FetchError> {
        let mut attempt = 0;

        loop {
            if token.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                result = self.attempt(request) => result,
            };

            let error = match result {
                Ok(payload) => return Ok(payload),
                Err(error) => error,
            };

            if !error.is_transient() {
                warn!(
                    resource = request.resource.path(),
                    key = %request.key,
                    error = %error,
                    "Fetch failed permanently"
                );
                return Err(error);
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    resource = request.resource.path(),
                    key = %request.key,
                    attempts = attempt,
                    error = %error,
                    "Fetch retries exhausted"
                );
                return Err(error);
            }

            let delay = self.policy.backoff(attempt);
            debug!(
                resource = request.resource.path(),
                key = %request.key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying fetch"
            );
            on_retry(attempt + 1, &error);

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&self, request: &FetchRequest) -> Result<Payload, FetchError> {
        let body = match tokio::time::timeout(self.policy.timeout, self.transport.get(request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    after_ms: self.policy.timeout.as_millis() as u64,
                })
            }
        };

        Payload::decode(request.resource, &body)
    }
}
