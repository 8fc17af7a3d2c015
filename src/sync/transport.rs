//! Network boundary of the engine.
//!
//! A [`Transport`] performs a single read for one resource and returns the
//! raw response body. Timeouts, retries and decoding live in the fetcher.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use super::error::FetchError;
use crate::config::UpstreamConfig;
use crate::model::SeriesKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Entries,
    Analytics,
    Insights,
    Alerts,
}

impl Resource {
    pub fn path(&self) -> &'static str {
        match self {
            Resource::Entries => "entries",
            Resource::Analytics => "analytics",
            Resource::Insights => "insights",
            Resource::Alerts => "alerts",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub resource: Resource,
    pub key: SeriesKey,
}

impl FetchRequest {
    pub fn new(resource: Resource, key: SeriesKey) -> Self {
        FetchRequest { resource, key }
    }

    pub fn query_pairs(&self) -> [(&'static str, String); 3] {
        [
            ("patientId", self.key.patient_id.clone()),
            ("metricType", self.key.metric_type.to_string()),
            ("timeRange", self.key.time_range.to_string()),
        ]
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Body of a 2xx response, or the failure that prevented one.
    fn get(&self, request: &FetchRequest) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// JSON-over-HTTP transport for `GET /{resource}?patientId=..&metricType=..&timeRange=..`
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;

        Ok(HttpTransport {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn url_for(&self, resource: Resource) -> String {
        format!("{}/{}", self.base_url, resource.path())
    }
}

impl Transport for HttpTransport {
    async fn get(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let url = self.url_for(request.resource);
        debug!(%url, key = %request.key, "Requesting upstream resource");

        let response = self
            .client
            .get(&url)
            .query(&request.query_pairs())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    FetchError::Connection { message: format!("could not reach {}: {}", self.base_url, e) }
                } else {
                    FetchError::Connection { message: e.to_string() }
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Connection { message: format!("failed to read body: {}", e) })?;

        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16(), &body));
        }

        Ok(body)
    }
}
