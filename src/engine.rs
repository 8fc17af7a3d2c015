//! Monitoring engine
//!
//! Wires the scheduler and store to the derived analytics, rule findings
//! and per-subscription query views that a dashboard renders.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::config::Config;
use crate::model::{Alert, Insight, MetricEntry, QueryParams, SeriesKey};
use crate::storage::{RemoteResources, SeriesSnapshot, SeriesStore};
use crate::sync::{FetchState, Fetcher, Notifier, Scheduler, Subscription, SubscriptionId, Transport};
use crate::timeseries::{compute_analytics, evaluate, AnalyticsSnapshot, QueryView, Rule, ViewParams};

/// Analytics and findings computed from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Derived {
    pub sequence: u64,
    pub analytics: AnalyticsSnapshot,
    pub alerts: Vec<Alert>,
    pub insights: Vec<Insight>,
}

/// Everything a dashboard renders for one subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub subscription: SubscriptionId,
    pub params: QueryParams,
    pub view: ViewParams,
    pub state: FetchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    pub entries: Arc<Vec<MetricEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<AnalyticsSnapshot>,
    pub alerts: Vec<Alert>,
    pub insights: Vec<Insight>,
    #[serde(skip_serializing_if = "RemoteResources::is_empty")]
    pub remote: RemoteResources,
}

pub struct MonitoringEngine<T: Transport> {
    scheduler: Scheduler<T>,
    config: Config,
    rules: Vec<Rule>,
    derived: Mutex<HashMap<SeriesKey, Arc<Derived>>>,
    views: Mutex<HashMap<SubscriptionId, Arc<QueryView>>>,
}

impl<T: Transport> MonitoringEngine<T> {
    pub fn new(config: &Config, transport: Arc<T>, notifier: Arc<dyn Notifier>) -> Self {
        let fetcher = Fetcher::new(transport, config.fetch.retry_policy());
        let scheduler = Scheduler::new(
            fetcher,
            Arc::new(SeriesStore::new()),
            notifier,
            config.polling.scheduler_config(),
        );
        let rules = config.rules.iter().map(|rule| rule.compile()).collect();

        MonitoringEngine {
            scheduler,
            config: config.clone(),
            rules,
            derived: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Add rules evaluated after the configured ones.
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        self.scheduler.store()
    }

    pub fn start(&self, params: QueryParams) -> Subscription {
        let subscription = self.scheduler.start(params);
        self.views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription.id(), Arc::new(QueryView::new()));
        info!(subscription = subscription.id(), key = %subscription.key(), "Dashboard subscribed");
        subscription
    }

    pub async fn stop(&self, subscription: Subscription) {
        let id = subscription.id();
        let key = subscription.key();
        self.scheduler.stop(subscription).await;

        self.views.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        if self.store().get(&key).is_none() {
            self.derived.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
        }
        info!(subscription = id, key = %key, "Dashboard unsubscribed");
    }

    /// Analytics and findings for the snapshot stored under `key`,
    /// recomputed only when its sequence number changed. Entries for keys
    /// the store no longer holds are dropped on the way.
    pub fn derived(&self, key: &SeriesKey) -> Option<Arc<Derived>> {
        let live: HashSet<SeriesKey> = self.store().keys().into_iter().collect();
        let snapshot = self.store().get(key);
        let mut cache = self.derived.lock().unwrap_or_else(PoisonError::into_inner);
        cache.retain(|cached, _| live.contains(cached));

        let snapshot = snapshot?;

        if let Some(hit) = cache.get(key) {
            if hit.sequence == snapshot.sequence {
                return Some(Arc::clone(hit));
            }
        }

        let derived = Arc::new(self.compute(&snapshot));
        cache.insert(key.clone(), Arc::clone(&derived));
        Some(derived)
    }

    fn compute(&self, snapshot: &SeriesSnapshot) -> Derived {
        let analytics = compute_analytics(&snapshot.entries, &self.config.analytics_for(&snapshot.key));
        let evaluation = evaluate(&snapshot.entries, &self.rules);
        debug!(
            key = %snapshot.key,
            sequence = snapshot.sequence,
            alerts = evaluation.alerts.len(),
            insights = evaluation.insights.len(),
            "Derived data recomputed"
        );

        Derived {
            sequence: snapshot.sequence,
            analytics,
            alerts: evaluation.alerts,
            insights: evaluation.insights,
        }
    }

    pub fn dashboard(&self, subscription: &Subscription, view: &ViewParams) -> Dashboard {
        let params = subscription.params();
        let key = params.series_key();
        let state = subscription.state();

        let Some(snapshot) = self.store().get(&key) else {
            return Dashboard {
                subscription: subscription.id(),
                params,
                view: view.clone(),
                state,
                sequence: None,
                fetched_at: None,
                entries: Arc::new(Vec::new()),
                analytics: None,
                alerts: Vec::new(),
                insights: Vec::new(),
                remote: RemoteResources::default(),
            };
        };

        let query_view = self
            .views
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subscription.id())
            .or_insert_with(|| Arc::new(QueryView::new()))
            .clone();
        let entries = query_view.project(&snapshot, view);
        let derived = self.derived(&key);

        Dashboard {
            subscription: subscription.id(),
            params,
            view: view.clone(),
            state,
            sequence: Some(snapshot.sequence),
            fetched_at: Some(snapshot.fetched_at),
            entries,
            analytics: derived.as_ref().map(|d| d.analytics.clone()),
            alerts: derived.as_ref().map(|d| d.alerts.clone()).unwrap_or_default(),
            insights: derived.as_ref().map(|d| d.insights.clone()).unwrap_or_default(),
            remote: snapshot.remote.clone(),
        }
    }
}
