//! Scripted transport used by the engine's tests.

use chrono::{Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::error::FetchError;
use super::transport::{FetchRequest, Resource, Transport};
use crate::model::{EntryStatus, MetricEntry};

pub(crate) enum Step {
    Reply(Result<String, FetchError>),
    /// Block until the sender side delivers a response.
    Wait(oneshot::Receiver<Result<String, FetchError>>),
    Hang,
}

/// Replays scripted steps in call order, then answers with the fallback.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    fallback: Result<String, FetchError>,
    calls: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        ScriptedTransport {
            script: Mutex::new(steps.into()),
            fallback: Ok("[]".to_string()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_fallback(mut self, fallback: Result<String, FetchError>) -> Self {
        self.fallback = fallback;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, resource: Resource) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.resource == resource)
            .count()
    }

    pub(crate) fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    async fn get(&self, request: &FetchRequest) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();

        match step {
            Some(Step::Reply(result)) => result,
            Some(Step::Wait(rx)) => rx.await.unwrap_or_else(|_| {
                Err(FetchError::Connection { message: "response sender dropped".to_string() })
            }),
            Some(Step::Hang) => std::future::pending().await,
            None => self.fallback.clone(),
        }
    }
}

pub(crate) fn entry(id: &str, value: f64) -> MetricEntry {
    MetricEntry {
        id: id.to_string(),
        patient_id: "p1".to_string(),
        metric_type: "heart_rate".to_string(),
        value,
        recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(value as i64),
        status: if value > 150.0 { EntryStatus::Critical } else { EntryStatus::Normal },
        device_type: None,
        notes: None,
    }
}

pub(crate) fn entries_json(items: &[(&str, f64)]) -> String {
    let entries: Vec<MetricEntry> = items.iter().map(|(id, value)| entry(id, *value)).collect();
    serde_json::to_string(&entries).unwrap()
}
