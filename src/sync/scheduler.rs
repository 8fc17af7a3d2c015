//! Refresh lifecycle for dashboard queries.
//!
//! Each subscription runs one task: fetch, settle, wait for the poll
//! interval, repeat. A change of the fetch key cancels the cycle in flight
//! and starts a new one with a higher sequence number. The task is the only
//! writer of the subscription's [`FetchState`] and the only caller of
//! [`SeriesStore::insert`] for its cycles.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::FetchError;
use super::fetcher::{Fetcher, Payload};
use super::transport::{FetchRequest, Resource, Transport};
use crate::model::{QueryParams, SeriesKey};
use crate::storage::{RemoteResources, SeriesSnapshot, SeriesStore};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum FetchState {
    #[default]
    Idle,
    Loading,
    Success,
    /// `attempt` is the attempt about to run after the backoff delay.
    Retrying { attempt: u32 },
    Failed { error: FetchError },
}

/// Receives refresh and error events, in place of a global toast.
pub trait Notifier: Send + Sync {
    fn on_refresh(&self, _key: &SeriesKey, _snapshot: &SeriesSnapshot) {}

    fn on_error(&self, _key: &SeriesKey, _resource: Resource, _error: &FetchError) {}
}

/// Notifier that reports through `tracing`.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn on_refresh(&self, key: &SeriesKey, snapshot: &SeriesSnapshot) {
        debug!(key = %key, sequence = snapshot.sequence, entries = snapshot.len(), "Snapshot refreshed");
    }

    fn on_error(&self, key: &SeriesKey, resource: Resource, error: &FetchError) {
        warn!(key = %key, resource = resource.path(), error = %error, "Refresh failed");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Resources fetched alongside `entries` on every cycle.
    pub auxiliary: Vec<Resource>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            poll_interval: Duration::from_secs(30),
            auxiliary: Vec::new(),
        }
    }
}

/// Handle to a running query. Dropping it stops the polling task.
pub struct Subscription {
    id: SubscriptionId,
    params: watch::Sender<QueryParams>,
    state: watch::Receiver<FetchState>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn params(&self) -> QueryParams {
        self.params.borrow().clone()
    }

    pub fn key(&self) -> SeriesKey {
        self.params.borrow().series_key()
    }

    pub fn state(&self) -> FetchState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<FetchState> {
        self.state.clone()
    }

    /// Replace the query parameters. A different fetch key cancels the
    /// cycle in flight and starts a new one immediately.
    pub fn update(&self, params: QueryParams) {
        self.params.send_replace(params);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum CycleOutcome {
    Accepted(Arc<SeriesSnapshot>),
    Stale,
    Failed(FetchError),
    Cancelled,
}

enum Step {
    Settled(CycleOutcome),
    Restart(SeriesKey),
    Stop,
}

pub struct Scheduler<T: Transport> {
    inner: Arc<Inner<T>>,
    next_id: AtomicU64,
}

struct Inner<T: Transport> {
    fetcher: Fetcher<T>,
    store: Arc<SeriesStore>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    sequences: Mutex<HashMap<SeriesKey, u64>>,
    leases: Mutex<HashMap<SeriesKey, usize>>,
}

impl<T: Transport> Scheduler<T> {
    pub fn new(
        fetcher: Fetcher<T>,
        store: Arc<SeriesStore>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                fetcher,
                store,
                notifier,
                config,
                sequences: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.inner.store
    }

    /// Start polling for `params`. Must be called within a tokio runtime.
    pub fn start(&self, params: QueryParams) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (params_tx, params_rx) = watch::channel(params);
        let (state_tx, state_rx) = watch::channel(FetchState::Idle);
        let stop = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&self.inner).run(id, params_rx, state_tx, stop.clone()));

        Subscription {
            id,
            params: params_tx,
            state: state_rx,
            stop,
            task: Some(task),
        }
    }

    /// Stop polling and wait for the task to wind down. No snapshot is
    /// written for this subscription once this returns.
    pub async fn stop(&self, mut subscription: Subscription) {
        subscription.stop.cancel();
        if let Some(task) = subscription.task.take() {
            if let Err(e) = task.await {
                warn!(subscription = subscription.id, error = %e, "Subscription task ended abnormally");
            }
        }
    }
}

impl<T: Transport> Inner<T> {
    async fn run(
        self: Arc<Self>,
        id: SubscriptionId,
        mut params_rx: watch::Receiver<QueryParams>,
        state_tx: watch::Sender<FetchState>,
        stop: CancellationToken,
    ) {
        let mut key = params_rx.borrow_and_update().series_key();
        self.acquire(&key);
        info!(subscription = id, key = %key, "Subscription started");

        'cycles: loop {
            let sequence = self.next_sequence(&key);
            let token = CancellationToken::new();
            state_tx.send_replace(FetchState::Loading);
            debug!(subscription = id, key = %key, sequence, "Cycle started");

            let step = {
                let cycle = self.run_cycle(&key, sequence, &token, &state_tx);
                tokio::pin!(cycle);

                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break Step::Stop,
                        changed = params_rx.changed() => {
                            if changed.is_err() {
                                break Step::Stop;
                            }
                            let next = params_rx.borrow_and_update().series_key();
                            if next != key {
                                break Step::Restart(next);
                            }
                        }
                        outcome = &mut cycle => break Step::Settled(outcome),
                    }
                }
            };

            match step {
                Step::Stop => {
                    token.cancel();
                    break 'cycles;
                }
                Step::Restart(next) => {
                    token.cancel();
                    debug!(subscription = id, from = %key, to = %next, sequence, "Cycle superseded");
                    self.switch_key(&mut key, next);
                    continue 'cycles;
                }
                Step::Settled(outcome) => self.settle(&key, outcome, &state_tx),
            }

            let poll = tokio::time::sleep(self.config.poll_interval);
            tokio::pin!(poll);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break 'cycles,
                    changed = params_rx.changed() => {
                        if changed.is_err() {
                            break 'cycles;
                        }
                        let next = params_rx.borrow_and_update().series_key();
                        if next != key {
                            self.switch_key(&mut key, next);
                            continue 'cycles;
                        }
                    }
                    _ = &mut poll => continue 'cycles,
                }
            }
        }

        self.release(&key);
        info!(subscription = id, key = %key, "Subscription stopped");
    }

    async fn run_cycle(
        &self,
        key: &SeriesKey,
        sequence: u64,
        token: &CancellationToken,
        state_tx: &watch::Sender<FetchState>,
    ) -> CycleOutcome {
        let on_retry = |attempt: u32, _: &FetchError| {
            state_tx.send_replace(FetchState::Retrying { attempt });
        };

        let (entries, analytics, insights, alerts) = tokio::join!(
            self.fetch_resource(Resource::Entries, key, token, &on_retry),
            self.fetch_auxiliary(Resource::Analytics, key, token),
            self.fetch_auxiliary(Resource::Insights, key, token),
            self.fetch_auxiliary(Resource::Alerts, key, token),
        );

        if token.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let entries = match entries {
            Ok(Payload::Entries(entries)) => entries,
            Ok(_) => {
                return CycleOutcome::Failed(FetchError::Schema {
                    message: "entries request decoded to another resource".to_string(),
                })
            }
            Err(FetchError::Cancelled) => return CycleOutcome::Cancelled,
            Err(error) => return CycleOutcome::Failed(error),
        };

        let mut remote = RemoteResources::default();
        let auxiliary = [
            (Resource::Analytics, analytics),
            (Resource::Insights, insights),
            (Resource::Alerts, alerts),
        ];
        for (resource, result) in auxiliary {
            match result {
                None => {}
                Some(Ok(Payload::Analytics(payload))) => remote.analytics = Some(payload),
                Some(Ok(Payload::Insights(payload))) => remote.insights = Some(payload),
                Some(Ok(Payload::Alerts(payload))) => remote.alerts = Some(payload),
                Some(Ok(Payload::Entries(_))) => {}
                Some(Err(FetchError::Cancelled)) => return CycleOutcome::Cancelled,
                Some(Err(error)) => self.notifier.on_error(key, resource, &error),
            }
        }

        if token.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        let snapshot = SeriesSnapshot::new(key.clone(), sequence, entries).with_remote(remote);
        if !self.store.insert(snapshot) {
            return CycleOutcome::Stale;
        }
        match self.store.get(key) {
            Some(snapshot) => CycleOutcome::Accepted(snapshot),
            None => CycleOutcome::Stale,
        }
    }

    async fn fetch_resource(
        &self,
        resource: Resource,
        key: &SeriesKey,
        token: &CancellationToken,
        on_retry: &(dyn Fn(u32, &FetchError) + Send + Sync),
    ) -> Result<Payload, FetchError> {
        let request = FetchRequest::new(resource, key.clone());
        self.fetcher.fetch_observed(&request, token, on_retry).await
    }

    async fn fetch_auxiliary(
        &self,
        resource: Resource,
        key: &SeriesKey,
        token: &CancellationToken,
    ) -> Option<Result<Payload, FetchError>> {
        if !self.config.auxiliary.contains(&resource) {
            return None;
        }
        // Retries here do not put the subscription into `Retrying`.
        Some(self.fetch_resource(resource, key, token, &|_: u32, _: &FetchError| {}).await)
    }

    fn settle(&self, key: &SeriesKey, outcome: CycleOutcome, state_tx: &watch::Sender<FetchState>) {
        match outcome {
            CycleOutcome::Accepted(snapshot) => {
                self.notifier.on_refresh(key, &snapshot);
                state_tx.send_replace(FetchState::Success);
            }
            CycleOutcome::Stale => {
                debug!(key = %key, "Cycle result superseded by a newer snapshot");
                state_tx.send_replace(FetchState::Success);
            }
            CycleOutcome::Failed(error) => {
                self.notifier.on_error(key, Resource::Entries, &error);
                state_tx.send_replace(FetchState::Failed { error });
            }
            CycleOutcome::Cancelled => {}
        }
    }

    fn next_sequence(&self, key: &SeriesKey) -> u64 {
        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let counter = sequences.entry(key.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn switch_key(&self, key: &mut SeriesKey, next: SeriesKey) {
        self.acquire(&next);
        self.release(key);
        *key = next;
    }

    fn acquire(&self, key: &SeriesKey) {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        *leases.entry(key.clone()).or_insert(0) += 1;
    }

    /// Drop one lease on `key`; the last one out discards the snapshot.
    fn release(&self, key: &SeriesKey) {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let remaining = match leases.get_mut(key) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };

        if remaining == 0 {
            leases.remove(key);
            self.sequences.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
            if self.store.remove(key).is_some() {
                debug!(key = %key, "Snapshot discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricFilter, TimeRange};
    use crate::sync::fetcher::RetryPolicy;
    use crate::sync::testing::{entries_json, ScriptedTransport, Step as Scripted};
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn on_refresh(&self, key: &SeriesKey, snapshot: &SeriesSnapshot) {
            self.events
                .lock()
                .unwrap()
                .push(format!("refresh {} #{}", key.patient_id, snapshot.sequence));
        }

        fn on_error(&self, key: &SeriesKey, resource: Resource, _error: &FetchError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("error {} {}", key.patient_id, resource.path()));
        }
    }

    struct Harness {
        transport: Arc<ScriptedTransport>,
        notifier: Arc<RecordingNotifier>,
        scheduler: Scheduler<ScriptedTransport>,
    }

    fn harness(steps: Vec<Scripted>, auxiliary: Vec<Resource>) -> Harness {
        let transport = Arc::new(ScriptedTransport::new(steps).with_fallback(Ok(entries_json(&[("f1", 60.0)]))));
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = Scheduler::new(
            Fetcher::new(Arc::clone(&transport), RetryPolicy::default()),
            Arc::new(SeriesStore::new()),
            notifier.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_secs(30),
                auxiliary,
            },
        );
        Harness { transport, notifier, scheduler }
    }

    fn params(patient: &str) -> QueryParams {
        QueryParams::new(patient, MetricFilter::only("heart_rate"), TimeRange::Last7Days)
    }

    async fn wait_for_state(subscription: &Subscription, wanted: fn(&FetchState) -> bool) {
        let mut rx = subscription.watch_state();
        rx.wait_for(|state| wanted(state)).await.unwrap();
    }

    async fn wait_for_events(notifier: &RecordingNotifier, count: usize) {
        while notifier.events().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_cycle_populates_store() {
        let h = harness(vec![Scripted::Reply(Ok(entries_json(&[("e1", 72.0), ("e2", 75.0)])))], vec![]);
        let subscription = h.scheduler.start(params("p1"));

        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        let snapshot = h.scheduler.store().get(&subscription.key()).unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(h.notifier.events(), vec!["refresh p1 #1"]);

        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_after_interval() {
        let h = harness(vec![], vec![]);
        let subscription = h.scheduler.start(params("p1"));

        wait_for_events(&h.notifier, 3).await;

        assert_eq!(h.notifier.events(), vec!["refresh p1 #1", "refresh p1 #2", "refresh p1 #3"]);
        assert_eq!(h.scheduler.store().sequence(&subscription.key()), Some(3));
        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_surfaces_and_polling_recovers() {
        let h = harness(
            vec![
                Scripted::Reply(Ok(entries_json(&[("e1", 70.0)]))),
                Scripted::Reply(Err(FetchError::Status { status: 500, message: "boom".to_string() })),
                Scripted::Reply(Err(FetchError::Status { status: 500, message: "boom".to_string() })),
                Scripted::Reply(Err(FetchError::Status { status: 500, message: "boom".to_string() })),
            ],
            vec![],
        );
        let subscription = h.scheduler.start(params("p1"));

        wait_for_state(&subscription, |s| matches!(s, FetchState::Failed { .. })).await;
        assert_eq!(
            subscription.state(),
            FetchState::Failed { error: FetchError::Status { status: 500, message: "boom".to_string() } }
        );
        // The last good snapshot stays available.
        let snapshot = h.scheduler.store().get(&subscription.key()).unwrap();
        assert_eq!(snapshot.entries[0].id, "e1");

        wait_for_events(&h.notifier, 3).await;
        assert_eq!(h.notifier.events(), vec!["refresh p1 #1", "error p1 entries", "refresh p1 #3"]);
        assert_eq!(h.transport.calls(), 5);

        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_change_cancels_in_flight_cycle() {
        let (late_tx, late_rx) = oneshot::channel();
        let h = harness(
            vec![
                Scripted::Wait(late_rx),
                Scripted::Reply(Ok(entries_json(&[("b1", 80.0)]))),
            ],
            vec![],
        );
        let subscription = h.scheduler.start(params("a"));
        let old_key = subscription.key();

        while h.transport.calls() == 0 {
            tokio::task::yield_now().await;
        }
        subscription.update(params("b"));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        // The cancelled cycle's response arrives late and must go nowhere.
        let _ = late_tx.send(Ok(entries_json(&[("a1", 99.0)])));
        tokio::task::yield_now().await;

        assert!(h.scheduler.store().get(&old_key).is_none());
        let snapshot = h.scheduler.store().get(&subscription.key()).unwrap();
        assert_eq!(snapshot.entries[0].id, "b1");
        assert_eq!(h.notifier.events(), vec!["refresh b #1"]);

        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_only_change_does_not_refetch() {
        let h = harness(vec![], vec![]);
        let subscription = h.scheduler.start(params("p1"));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        let mut sorted = params("p1");
        sorted.search_text = "night".to_string();
        subscription.update(sorted);
        tokio::task::yield_now().await;

        assert_eq!(h.transport.calls(), 1);
        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_snapshot() {
        let h = harness(vec![], vec![]);
        let subscription = h.scheduler.start(params("p1"));
        let key = subscription.key();
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;
        assert!(h.scheduler.store().get(&key).is_some());

        h.scheduler.stop(subscription).await;
        assert!(h.scheduler.store().get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_key_forgets_sequence() {
        let h = harness(vec![], vec![]);
        let subscription = h.scheduler.start(params("a"));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        for patient in ["b", "c"] {
            subscription.update(params(patient));
            while h.scheduler.store().get(&subscription.key()).is_none() {
                tokio::task::yield_now().await;
            }
        }
        let sequences: Vec<SeriesKey> = h.scheduler.inner.sequences.lock().unwrap().keys().cloned().collect();
        assert_eq!(sequences, vec![subscription.key()]);

        h.scheduler.stop(subscription).await;
        assert!(h.scheduler.inner.sequences.lock().unwrap().is_empty());
        assert!(h.scheduler.inner.leases.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auxiliary_retry_keeps_loading_state() {
        let (late_tx, late_rx) = oneshot::channel();
        let h = harness(
            vec![
                Scripted::Reply(Ok(entries_json(&[("e1", 70.0)]))),
                Scripted::Reply(Err(FetchError::Status { status: 503, message: "busy".to_string() })),
                Scripted::Wait(late_rx),
            ],
            vec![Resource::Alerts],
        );
        let subscription = h.scheduler.start(params("p1"));

        // The alerts fetch has failed once, backed off and is retrying.
        while h.transport.calls() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subscription.state(), FetchState::Loading);

        let _ = late_tx.send(Ok("[]".to_string()));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;
        assert_eq!(h.scheduler.store().get(&subscription.key()).unwrap().remote.alerts, Some(vec![]));

        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_key_survives_one_stop() {
        let h = harness(vec![], vec![]);
        let first = h.scheduler.start(params("p1"));
        let second = h.scheduler.start(params("p1"));
        wait_for_state(&first, |s| *s == FetchState::Success).await;
        wait_for_state(&second, |s| *s == FetchState::Success).await;
        let key = first.key();

        h.scheduler.stop(first).await;
        assert!(h.scheduler.store().get(&key).is_some());

        h.scheduler.stop(second).await;
        assert!(h.scheduler.store().get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrying_state_is_reported() {
        let (slow_tx, slow_rx) = oneshot::channel();
        let h = harness(
            vec![
                Scripted::Reply(Err(FetchError::Timeout { after_ms: 1 })),
                Scripted::Wait(slow_rx),
            ],
            vec![],
        );
        let subscription = h.scheduler.start(params("p1"));

        wait_for_state(&subscription, |s| *s == FetchState::Retrying { attempt: 2 }).await;
        let _ = slow_tx.send(Ok(entries_json(&[("e1", 1.0)])));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auxiliary_resources_fetched_with_entries() {
        let h = harness(vec![], vec![Resource::Alerts]);
        let subscription = h.scheduler.start(params("p1"));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        assert_eq!(h.transport.calls_for(Resource::Entries), 1);
        assert_eq!(h.transport.calls_for(Resource::Alerts), 1);
        assert_eq!(h.transport.calls_for(Resource::Insights), 0);
        assert!(h.transport.requests().iter().all(|r| r.key == subscription.key()));

        h.scheduler.stop(subscription).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auxiliary_failure_does_not_fail_cycle() {
        // join! polls entries first, so the script answers entries then analytics.
        let h = harness(
            vec![
                Scripted::Reply(Ok(entries_json(&[("e1", 70.0)]))),
                Scripted::Reply(Err(FetchError::Status { status: 404, message: "no analytics".to_string() })),
            ],
            vec![Resource::Analytics],
        );
        let subscription = h.scheduler.start(params("p1"));
        wait_for_state(&subscription, |s| *s == FetchState::Success).await;

        let snapshot = h.scheduler.store().get(&subscription.key()).unwrap();
        assert!(snapshot.remote.analytics.is_none());
        assert_eq!(h.notifier.events(), vec!["error p1 analytics", "refresh p1 #1"]);

        h.scheduler.stop(subscription).await;
    }
}
