//! Weight-document watcher.
//!
//! The central controller ships the path-selection document to this
//! host as a file. The watcher polls its modification time on a short
//! interval and applies the document when it changes. Applying resets
//! the SWRR accumulators (so new flows follow the new ratios at once)
//! while established flows keep their spine until their rules expire.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{watch, Mutex};

use tidal_common::alerts::AlertJournal;
use tidal_common::docstore;
use tidal_common::models::PathSelectionDocument;

use crate::rules::RuleInstaller;
use crate::selector::PathSelector;

/// Read the document if its mtime moved past `last_seen`. Returns the
/// parsed document and the new mtime, or `None` when unchanged.
pub fn try_reload(
    path: &Path,
    last_seen: Option<SystemTime>,
) -> anyhow::Result<Option<(PathSelectionDocument, SystemTime)>> {
    let mtime = std::fs::metadata(path)?.modified()?;
    if last_seen.is_some_and(|seen| mtime <= seen) {
        return Ok(None);
    }
    let doc = docstore::read_json_retry(path)?;
    Ok(Some((doc, mtime)))
}

/// Poll the document until shutdown.
pub async fn watch_weights<I: RuleInstaller>(
    path: PathBuf,
    check_interval: Duration,
    selector: Arc<Mutex<PathSelector<I>>>,
    journal: Arc<AlertJournal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(check_interval);
    let mut last_seen: Option<SystemTime> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        match try_reload(&path, last_seen) {
            Ok(Some((doc, mtime))) => {
                last_seen = Some(mtime);
                let iteration = doc.metadata.iteration;
                if selector.lock().await.apply_document(doc) {
                    journal.info(
                        "fabric",
                        "Weights Reloaded",
                        &format!("applied path-selection document, iteration {iteration}"),
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Missing file before the first publication is the
                // normal cold-start condition; anything after a
                // successful load is worth a warning.
                if last_seen.is_some() {
                    journal.warning(
                        "fabric",
                        "Weight Document Unreadable",
                        &format!("keeping current weights: {e}"),
                    );
                } else {
                    tracing::debug!(error = %e, "weight document not yet available");
                }
            }
        }
    }
}
