//! Alert journal — bounded, categorised, acknowledgeable event log.
//!
//! Both control loops append through a shared journal handle; appends
//! are thread-safe. The journal persists itself to disk on every
//! mutation (atomic rename) and survives process restarts. Oldest
//! entries are evicted beyond the size cap.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::docstore;

/// Severity class of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Critical,
    Warning,
    Success,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: AlertType,
    pub category: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// On-disk journal format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    alerts: Vec<Alert>,
    last_cleanup: Option<DateTime<Utc>>,
}

struct Inner {
    alerts: VecDeque<Alert>,
    next_id: u64,
    last_cleanup: Option<DateTime<Utc>>,
}

/// Thread-safe, size-bounded alert journal.
pub struct AlertJournal {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
    cap: usize,
}

impl AlertJournal {
    /// Journal without persistence (tests, ephemeral tooling).
    pub fn in_memory(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                alerts: VecDeque::new(),
                next_id: 1,
                last_cleanup: None,
            }),
            path: None,
            cap,
        }
    }

    /// Open a journal backed by `path`, rehydrating any persisted
    /// entries. A missing or unreadable file starts an empty journal.
    pub fn open(path: &Path, cap: usize) -> Self {
        let file: JournalFile = docstore::read_json(path).unwrap_or_default();
        let next_id = file.alerts.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        let mut alerts: VecDeque<Alert> = file.alerts.into();
        while alerts.len() > cap {
            alerts.pop_front();
        }
        Self {
            inner: Mutex::new(Inner {
                alerts,
                next_id,
                last_cleanup: file.last_cleanup,
            }),
            path: Some(path.to_path_buf()),
            cap,
        }
    }

    /// Append an alert, evicting the oldest entries beyond the cap.
    /// Returns the stable id of the new entry.
    pub fn push(&self, kind: AlertType, category: &str, title: &str, message: &str) -> u64 {
        self.push_with_extra(kind, category, title, message, BTreeMap::new())
    }

    pub fn push_with_extra(
        &self,
        kind: AlertType,
        category: &str,
        title: &str,
        message: &str,
        extra: BTreeMap<String, serde_json::Value>,
    ) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.alerts.push_back(Alert {
            id,
            kind,
            category: category.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
            extra,
        });
        if inner.alerts.len() > self.cap {
            let evicted = inner.alerts.len() - self.cap;
            inner.alerts.drain(..evicted);
            inner.last_cleanup = Some(Utc::now());
        }
        match kind {
            AlertType::Critical => {
                tracing::error!(category, title, message, "alert")
            }
            AlertType::Warning => tracing::warn!(category, title, message, "alert"),
            _ => tracing::info!(category, title, message, "alert"),
        }
        self.persist(&inner);
        id
    }

    pub fn critical(&self, category: &str, title: &str, message: &str) -> u64 {
        self.push(AlertType::Critical, category, title, message)
    }

    pub fn warning(&self, category: &str, title: &str, message: &str) -> u64 {
        self.push(AlertType::Warning, category, title, message)
    }

    pub fn success(&self, category: &str, title: &str, message: &str) -> u64 {
        self.push(AlertType::Success, category, title, message)
    }

    pub fn info(&self, category: &str, title: &str, message: &str) -> u64 {
        self.push(AlertType::Info, category, title, message)
    }

    /// Mark an alert as read. Returns false for unknown ids.
    pub fn acknowledge(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let found = match inner.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        };
        if found {
            self.persist(&inner);
        }
        found
    }

    /// Remove an alert entirely. Returns false for unknown ids.
    pub fn dismiss(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.alerts.len();
        inner.alerts.retain(|a| a.id != id);
        let removed = inner.alerts.len() != before;
        if removed {
            self.persist(&inner);
        }
        removed
    }

    /// Copy of the current journal contents, oldest first.
    pub fn snapshot(&self) -> Vec<Alert> {
        self.inner.lock().unwrap().alerts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.path else { return };
        let file = JournalFile {
            alerts: inner.alerts.iter().cloned().collect(),
            last_cleanup: inner.last_cleanup,
        };
        if let Err(e) = docstore::write_json_atomic(path, &file) {
            tracing::warn!(error = %e, path = %path.display(), "failed to persist alert journal");
        }
    }
}
