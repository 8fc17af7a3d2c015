use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

use crate::engine::MonitoringEngine;
use crate::model::{EntryStatus, MetricFilter, QueryParams, SortKey};
use crate::sync::{FetchState, Subscription, SubscriptionId, Transport};
use crate::timeseries::ViewParams;

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Display overrides for `GET /subscriptions/{id}`; unset fields fall back
/// to the subscription's own parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardQuery {
    pub metric_type: Option<MetricFilter>,
    pub status_filter: Option<EntryStatus>,
    pub search: Option<String>,
    pub sort_key: Option<SortKey>,
}

impl DashboardQuery {
    fn view_for(self, params: &QueryParams) -> ViewParams {
        let defaults = ViewParams::from(params);
        ViewParams {
            metric_type: self.metric_type.unwrap_or(defaults.metric_type),
            status_filter: self.status_filter,
            search_text: self.search.unwrap_or(defaults.search_text),
            sort_key: self.sort_key.unwrap_or(defaults.sort_key),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionSummary {
    id: SubscriptionId,
    params: QueryParams,
    state: FetchState,
}

impl SubscriptionSummary {
    fn of(subscription: &Subscription) -> Self {
        SubscriptionSummary {
            id: subscription.id(),
            params: subscription.params(),
            state: subscription.state(),
        }
    }
}

type Subscriptions = Arc<Mutex<HashMap<SubscriptionId, Subscription>>>;

pub struct RestApi<T: Transport> {
    engine: Arc<MonitoringEngine<T>>,
    subscriptions: Subscriptions,
}

impl<T: Transport> RestApi<T> {
    pub fn new(engine: Arc<MonitoringEngine<T>>) -> Self {
        RestApi {
            engine,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        self.create_subscription()
            .or(self.list_subscriptions())
            .or(self.get_dashboard())
            .or(self.update_subscription())
            .or(self.delete_subscription())
            .with(warp::trace::request())
    }

    /// Stop every subscription. Called once the server has drained.
    pub async fn shutdown(&self) {
        let drained: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions.drain().map(|(_, subscription)| subscription).collect()
        };

        info!(count = drained.len(), "Stopping subscriptions");
        for subscription in drained {
            self.engine.stop(subscription).await;
        }
    }

    fn create_subscription(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let engine = Arc::clone(&self.engine);
        let subscriptions = Arc::clone(&self.subscriptions);

        warp::path!("subscriptions")
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |params: QueryParams| {
                let engine = Arc::clone(&engine);
                let subscriptions = Arc::clone(&subscriptions);
                async move {
                    if let Err(message) = check_params(&params) {
                        return Ok::<_, Infallible>(error(StatusCode::BAD_REQUEST, message));
                    }

                    let subscription = engine.start(params);
                    let id = subscription.id();
                    subscriptions.lock().await.insert(id, subscription);

                    Ok(success(
                        StatusCode::CREATED,
                        "Subscription started",
                        &serde_json::json!({ "id": id }),
                    ))
                }
            })
    }

    fn list_subscriptions(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let subscriptions = Arc::clone(&self.subscriptions);

        warp::path!("subscriptions")
            .and(warp::get())
            .and_then(move || {
                let subscriptions = Arc::clone(&subscriptions);
                async move {
                    let subscriptions = subscriptions.lock().await;
                    let mut summaries: Vec<SubscriptionSummary> =
                        subscriptions.values().map(SubscriptionSummary::of).collect();
                    summaries.sort_by_key(|s| s.id);

                    Ok::<_, Infallible>(success(StatusCode::OK, "Subscriptions listed", &summaries))
                }
            })
    }

    fn get_dashboard(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let engine = Arc::clone(&self.engine);
        let subscriptions = Arc::clone(&self.subscriptions);

        warp::path!("subscriptions" / SubscriptionId)
            .and(warp::get())
            .and(warp::query::<DashboardQuery>())
            .and_then(move |id: SubscriptionId, query: DashboardQuery| {
                let engine = Arc::clone(&engine);
                let subscriptions = Arc::clone(&subscriptions);
                async move {
                    let subscriptions = subscriptions.lock().await;
                    let Some(subscription) = subscriptions.get(&id) else {
                        return Ok::<_, Infallible>(not_found(id));
                    };

                    let view = query.view_for(&subscription.params());
                    let dashboard = engine.dashboard(subscription, &view);
                    Ok(success(StatusCode::OK, "Dashboard rendered", &dashboard))
                }
            })
    }

    fn update_subscription(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let subscriptions = Arc::clone(&self.subscriptions);

        warp::path!("subscriptions" / SubscriptionId)
            .and(warp::put())
            .and(warp::body::json())
            .and_then(move |id: SubscriptionId, params: QueryParams| {
                let subscriptions = Arc::clone(&subscriptions);
                async move {
                    if let Err(message) = check_params(&params) {
                        return Ok::<_, Infallible>(error(StatusCode::BAD_REQUEST, message));
                    }

                    let subscriptions = subscriptions.lock().await;
                    let Some(subscription) = subscriptions.get(&id) else {
                        return Ok(not_found(id));
                    };

                    subscription.update(params);
                    Ok(success(
                        StatusCode::OK,
                        "Subscription updated",
                        &SubscriptionSummary::of(subscription),
                    ))
                }
            })
    }

    fn delete_subscription(&self) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let engine = Arc::clone(&self.engine);
        let subscriptions = Arc::clone(&self.subscriptions);

        warp::path!("subscriptions" / SubscriptionId)
            .and(warp::delete())
            .and_then(move |id: SubscriptionId| {
                let engine = Arc::clone(&engine);
                let subscriptions = Arc::clone(&subscriptions);
                async move {
                    let removed = subscriptions.lock().await.remove(&id);
                    let Some(subscription) = removed else {
                        return Ok::<_, Infallible>(not_found(id));
                    };

                    engine.stop(subscription).await;
                    Ok(respond(StatusCode::OK, "success", "Subscription stopped", None))
                }
            })
    }
}

fn check_params(params: &QueryParams) -> Result<(), String> {
    if params.patient_id.trim().is_empty() {
        return Err("patientId must not be empty".to_string());
    }
    Ok(())
}

fn respond(code: StatusCode, status: &str, message: impl Into<String>, data: Option<serde_json::Value>) -> WithStatus<Json> {
    let response = ApiResponse {
        status: status.to_string(),
        message: message.into(),
        data,
    };
    warp::reply::with_status(warp::reply::json(&response), code)
}

fn success<D: Serialize>(code: StatusCode, message: &str, data: &D) -> WithStatus<Json> {
    match serde_json::to_value(data) {
        Ok(value) => respond(code, "success", message, Some(value)),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode response: {}", e)),
    }
}

fn error(code: StatusCode, message: impl Into<String>) -> WithStatus<Json> {
    respond(code, "error", message, None)
}

fn not_found(id: SubscriptionId) -> WithStatus<Json> {
    error(StatusCode::NOT_FOUND, format!("Subscription {} not found", id))
}
