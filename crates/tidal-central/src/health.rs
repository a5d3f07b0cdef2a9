//! Health checking and the persisted blacklist.
//!
//! Every capacity tick issues a synthetic HTTP GET against each `On`
//! backend. Three consecutive failures flip the backend unhealthy and
//! hand it to the replacement logic; a blacklisted backend earns its
//! way back with two consecutive successes after its hard reset. The
//! blacklist outlives process restarts and is always consulted before
//! replacement duty.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tidal_common::docstore;

pub const FAILURE_THRESHOLD: u32 = 3;
pub const RECOVERY_THRESHOLD: u32 = 2;

/// What a probe-result record means for the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    NoChange,
    /// Failure streak reached the threshold.
    BecameUnhealthy,
    /// Blacklisted backend produced its second consecutive success.
    Recovered,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlacklistFile {
    blacklist: Vec<String>,
}

/// The probing half: cheap to clone into a spawned task so probes
/// run concurrently with the capacity loop and report through a
/// channel.
#[derive(Clone)]
pub struct Prober {
    http: reqwest::Client,
    probe_port: u16,
}

impl Prober {
    /// Probe one backend. Success is any HTTP response with a
    /// non-server-error status inside the timeout.
    pub async fn probe(&self, address: &str) -> bool {
        let url = format!("http://{}:{}/", address, self.probe_port);
        match self.http.get(&url).send().await {
            Ok(resp) => !resp.status().is_server_error(),
            Err(_) => false,
        }
    }

    /// Probe all targets concurrently. Targets are `(id, address)`.
    pub async fn probe_all(&self, targets: Vec<(String, String)>) -> Vec<(String, bool)> {
        let futures = targets.into_iter().map(|(id, address)| async move {
            let ok = self.probe(&address).await;
            (id, ok)
        });
        futures::future::join_all(futures).await
    }
}

pub struct HealthChecker {
    prober: Prober,
    failure_streaks: HashMap<String, u32>,
    success_streaks: HashMap<String, u32>,
    blacklist: HashSet<String>,
    blacklist_path: PathBuf,
}

impl HealthChecker {
    /// Build a checker, rehydrating the persisted blacklist. The
    /// startup blacklist is unioned with anything recorded later.
    pub fn new(
        blacklist_path: PathBuf,
        probe_port: u16,
        probe_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let persisted: BlacklistFile = docstore::read_json(&blacklist_path).unwrap_or_default();
        let blacklist: HashSet<String> = persisted.blacklist.into_iter().collect();
        if !blacklist.is_empty() {
            tracing::info!(count = blacklist.len(), "rehydrated blacklist");
        }
        Ok(Self {
            prober: Prober {
                http: reqwest::Client::builder().timeout(probe_timeout).build()?,
                probe_port,
            },
            failure_streaks: HashMap::new(),
            success_streaks: HashMap::new(),
            blacklist,
            blacklist_path,
        })
    }

    pub fn prober(&self) -> Prober {
        self.prober.clone()
    }

    pub fn blacklist(&self) -> &HashSet<String> {
        &self.blacklist
    }

    pub fn is_blacklisted(&self, id: &str) -> bool {
        self.blacklist.contains(id)
    }

    pub fn add_to_blacklist(&mut self, id: &str) {
        if self.blacklist.insert(id.to_string()) {
            self.success_streaks.remove(id);
            self.persist();
        }
    }

    fn remove_from_blacklist(&mut self, id: &str) {
        if self.blacklist.remove(id) {
            self.persist();
        }
    }

    fn persist(&self) {
        let file = BlacklistFile {
            blacklist: self.blacklist.iter().cloned().collect(),
        };
        if let Err(e) = docstore::write_json_atomic(&self.blacklist_path, &file) {
            tracing::warn!(error = %e, "failed to persist blacklist");
        }
    }

    /// Fold one probe result into the streak bookkeeping.
    pub fn record(&mut self, id: &str, ok: bool) -> HealthEvent {
        if ok {
            self.failure_streaks.remove(id);
            if self.is_blacklisted(id) {
                let streak = self.success_streaks.entry(id.to_string()).or_insert(0);
                *streak += 1;
                if *streak >= RECOVERY_THRESHOLD {
                    self.success_streaks.remove(id);
                    self.remove_from_blacklist(id);
                    tracing::info!(backend = %id, "blacklisted backend recovered");
                    return HealthEvent::Recovered;
                }
            }
            return HealthEvent::NoChange;
        }

        self.success_streaks.remove(id);
        let streak = self.failure_streaks.entry(id.to_string()).or_insert(0);
        *streak += 1;
        if *streak == FAILURE_THRESHOLD {
            return HealthEvent::BecameUnhealthy;
        }
        HealthEvent::NoChange
    }
}
