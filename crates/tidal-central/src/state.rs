//! Shared application state for the central controller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use tidal_common::alerts::AlertJournal;
use tidal_common::models::PathSelectionDocument;

/// Reply channel for a manual resync request.
pub type SyncReply = oneshot::Sender<anyhow::Result<()>>;

/// State shared across the API handlers and both control loops.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    journal: Arc<AlertJournal>,
    /// Latest published path-selection document; readers get an
    /// atomic snapshot.
    weights: ArcSwapOption<PathSelectionDocument>,
    total_pushes: AtomicU64,
    successful_pushes: AtomicU64,
    last_push_time: Mutex<Option<DateTime<Utc>>>,
    last_collection: Mutex<Option<DateTime<Utc>>>,
    /// Per-path prediction accuracy (mean relative error, smoothed).
    accuracies: Mutex<BTreeMap<String, f64>>,
    force_sync_tx: mpsc::Sender<SyncReply>,
}

impl AppState {
    pub fn new(journal: Arc<AlertJournal>, force_sync_tx: mpsc::Sender<SyncReply>) -> Self {
        Self {
            inner: Arc::new(Inner {
                journal,
                weights: ArcSwapOption::empty(),
                total_pushes: AtomicU64::new(0),
                successful_pushes: AtomicU64::new(0),
                last_push_time: Mutex::new(None),
                last_collection: Mutex::new(None),
                accuracies: Mutex::new(BTreeMap::new()),
                force_sync_tx,
            }),
        }
    }

    pub fn journal(&self) -> &AlertJournal {
        &self.inner.journal
    }

    pub fn store_weights(&self, doc: PathSelectionDocument) {
        self.inner.weights.store(Some(Arc::new(doc)));
    }

    pub fn weights(&self) -> Option<Arc<PathSelectionDocument>> {
        self.inner.weights.load_full()
    }

    pub fn record_collection(&self, at: DateTime<Utc>) {
        *self.inner.last_collection.lock().unwrap() = Some(at);
    }

    pub fn record_push(&self, at: DateTime<Utc>, ok: bool) {
        self.inner.total_pushes.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.inner.successful_pushes.fetch_add(1, Ordering::Relaxed);
            *self.inner.last_push_time.lock().unwrap() = Some(at);
        }
    }

    pub fn set_accuracies(&self, accuracies: BTreeMap<String, f64>) {
        *self.inner.accuracies.lock().unwrap() = accuracies;
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_pushes: self.inner.total_pushes.load(Ordering::Relaxed),
            successful_pushes: self.inner.successful_pushes.load(Ordering::Relaxed),
            last_push_time: *self.inner.last_push_time.lock().unwrap(),
            last_collection: *self.inner.last_collection.lock().unwrap(),
            model_accuracy: self.inner.accuracies.lock().unwrap().clone(),
        }
    }

    /// Ask the path loop for an immediate re-ship of the current
    /// weight document.
    pub async fn request_force_sync(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .force_sync_tx
            .send(tx)
            .await
            .map_err(|_| anyhow::anyhow!("path loop is not running"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("path loop dropped the request"))?
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub total_pushes: u64,
    pub successful_pushes: u64,
    pub last_push_time: Option<DateTime<Utc>>,
    pub last_collection: Option<DateTime<Utc>>,
    pub model_accuracy: BTreeMap<String, f64>,
}
