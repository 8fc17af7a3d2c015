use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

use crate::model::{EntryStatus, MetricEntry, MetricFilter, QueryParams, SeriesKey, SortKey};
use crate::storage::SeriesSnapshot;

/// Display-side parameters for projecting a snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewParams {
    #[serde(default)]
    pub metric_type: MetricFilter,
    #[serde(default)]
    pub status_filter: Option<EntryStatus>,
    #[serde(default)]
    pub search_text: String,
    #[serde(default)]
    pub sort_key: SortKey,
}

impl From<&QueryParams> for ViewParams {
    fn from(params: &QueryParams) -> Self {
        ViewParams {
            metric_type: params.metric_type.clone(),
            status_filter: None,
            search_text: params.search_text.clone(),
            sort_key: params.sort_key,
        }
    }
}

/// Filter (metric type, then status, then search text) and sort the
/// snapshot's entries. The result is always a subset of the snapshot.
pub fn project(snapshot: &SeriesSnapshot, params: &ViewParams) -> Vec<MetricEntry> {
    project_entries(&snapshot.entries, params)
}

pub fn project_entries(entries: &[MetricEntry], params: &ViewParams) -> Vec<MetricEntry> {
    let needle = params.search_text.trim().to_lowercase();

    let mut projected: Vec<MetricEntry> = entries
        .iter()
        .filter(|e| params.metric_type.matches(&e.metric_type))
        .filter(|e| params.status_filter.map_or(true, |status| e.status == status))
        .filter(|e| needle.is_empty() || matches_search(e, &needle))
        .cloned()
        .collect();

    sort_entries(&mut projected, params.sort_key);
    projected
}

/// Case-insensitive substring match over the searchable fields.
fn matches_search(entry: &MetricEntry, needle: &str) -> bool {
    let fields = [
        Some(entry.metric_type.as_str()),
        Some(entry.status.as_str()),
        entry.device_type.as_deref(),
        entry.notes.as_deref(),
    ];

    fields
        .iter()
        .flatten()
        .any(|field| field.to_lowercase().contains(needle))
}

/// Stable sort; entries equal under `key` keep their relative order.
pub fn sort_entries(entries: &mut [MetricEntry], key: SortKey) {
    match key {
        SortKey::Date => entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at)),
        SortKey::Value => entries.sort_by(|a, b| b.value.total_cmp(&a.value)),
        SortKey::Status => entries.sort_by_key(|e| e.status.severity_rank()),
    }
}

#[derive(Debug)]
struct CachedProjection {
    key: SeriesKey,
    sequence: u64,
    params: ViewParams,
    entries: Arc<Vec<MetricEntry>>,
}

/// Projection that is only recomputed when the snapshot or the parameters
/// change.
#[derive(Debug, Default)]
pub struct QueryView {
    cached: Mutex<Option<CachedProjection>>,
}

impl QueryView {
    pub fn new() -> Self {
        QueryView::default()
    }

    pub fn project(&self, snapshot: &SeriesSnapshot, params: &ViewParams) -> Arc<Vec<MetricEntry>> {
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(hit) = cached.as_ref() {
            if hit.sequence == snapshot.sequence && hit.key == snapshot.key && &hit.params == params {
                return Arc::clone(&hit.entries);
            }
        }

        let entries = Arc::new(project(snapshot, params));
        *cached = Some(CachedProjection {
            key: snapshot.key.clone(),
            sequence: snapshot.sequence,
            params: params.clone(),
            entries: Arc::clone(&entries),
        });
        entries
    }
}
