//! Keeps subscriber sets in step with subscription actions.
//!
//! Every operation is expressed as set-add / set-remove calls so that a
//! retried or concurrent call cannot corrupt membership. A failing key is
//! logged and skipped; the authoritative subscription state lives with the
//! caller, so the worst outcome is a missed real-time update.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::cdcrelay::store::{log_store_error, SetStore};
use crate::cdcrelay::types::{set_key, UserId};

/// A subscription action, as posted to the lifecycle endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Subscribe {
        user: UserId,
        namespace: String,
        keys: Vec<String>,
    },
    Unsubscribe {
        user: UserId,
        namespace: String,
        keys: Vec<String>,
    },
    ConfigChanged {
        user: UserId,
        namespace: String,
        #[serde(default)]
        old_keys: Vec<String>,
        #[serde(default)]
        new_keys: Vec<String>,
    },
    Reconcile {
        user: UserId,
        namespace: String,
        keys: Vec<String>,
    },
}

impl LifecycleEvent {
    pub fn user(&self) -> &str {
        match self {
            Self::Subscribe { user, .. }
            | Self::Unsubscribe { user, .. }
            | Self::ConfigChanged { user, .. }
            | Self::Reconcile { user, .. } => user,
        }
    }
}

/// Outcome of one lifecycle operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleReport {
    /// Keys whose membership changed
    pub applied: usize,
    /// Keys already in the requested state
    pub unchanged: usize,
    /// Set keys the store failed on
    pub failed: Vec<String>,
}

impl LifecycleReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: LifecycleReport) {
        self.applied += other.applied;
        self.unchanged += other.unchanged;
        self.failed.extend(other.failed);
    }
}

#[derive(Clone, Copy, Debug)]
enum Membership {
    Add,
    Remove,
}

pub struct LifecycleManager {
    store: Arc<dyn SetStore>,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn SetStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SetStore> {
        &self.store
    }

    /// Adds the user to every key's set
    pub fn on_subscribe(&self, user: &str, namespace: &str, keys: &[String]) -> LifecycleReport {
        info!("User {} subscribing to {} keys in {}", user, keys.len(), namespace);
        self.apply_each(user, namespace, dedup(keys), Membership::Add)
    }

    /// Removes the user from every key's set
    pub fn on_unsubscribe(&self, user: &str, namespace: &str, keys: &[String]) -> LifecycleReport {
        info!("User {} unsubscribing from {} keys in {}", user, keys.len(), namespace);
        self.apply_each(user, namespace, dedup(keys), Membership::Remove)
    }

    /// Applies only the delta between two key lists.
    ///
    /// Additions run before removals so a key present in both lists is never
    /// touched and the user is never briefly out of every set.
    pub fn on_config_changed(
        &self,
        user: &str,
        namespace: &str,
        old_keys: &[String],
        new_keys: &[String],
    ) -> LifecycleReport {
        let (added, removed) = key_delta(old_keys, new_keys);
        info!(
            "User {} config changed in {}: +{} -{}",
            user,
            namespace,
            added.len(),
            removed.len()
        );

        let mut report = self.apply_each(user, namespace, added, Membership::Add);
        report.merge(self.apply_each(user, namespace, removed, Membership::Remove));
        report
    }

    /// Adds the user to all authoritative keys; unrelated keys are left alone
    pub fn reconcile(&self, user: &str, namespace: &str, keys: &[String]) -> LifecycleReport {
        info!("Reconciling user {} against {} keys in {}", user, keys.len(), namespace);
        self.apply_each(user, namespace, dedup(keys), Membership::Add)
    }

    pub fn apply(&self, event: &LifecycleEvent) -> LifecycleReport {
        match event {
            LifecycleEvent::Subscribe { user, namespace, keys } => self.on_subscribe(user, namespace, keys),
            LifecycleEvent::Unsubscribe { user, namespace, keys } => self.on_unsubscribe(user, namespace, keys),
            LifecycleEvent::ConfigChanged { user, namespace, old_keys, new_keys } => {
                self.on_config_changed(user, namespace, old_keys, new_keys)
            }
            LifecycleEvent::Reconcile { user, namespace, keys } => self.reconcile(user, namespace, keys),
        }
    }

    fn apply_each(&self, user: &str, namespace: &str, keys: Vec<&str>, op: Membership) -> LifecycleReport {
        let mut report = LifecycleReport::default();
        for key in keys {
            if key.is_empty() {
                warn!("Skipping empty routing key for user {} in {}", user, namespace);
                continue;
            }
            let set = set_key(namespace, key);
            let result = match op {
                Membership::Add => self.store.add_member(&set, user),
                Membership::Remove => self.store.remove_member(&set, user),
            };
            match result {
                Ok(true) => report.applied += 1,
                Ok(false) => {
                    debug!("{} already in requested state for {:?}", set, op);
                    report.unchanged += 1;
                }
                Err(e) => {
                    log_store_error(if matches!(op, Membership::Add) { "add" } else { "remove" }, &set, &e);
                    report.failed.push(set);
                }
            }
        }
        report
    }
}

/// Run a lifecycle event as an observed background task.
///
/// Events are idempotent, so a partially failed event is simply re-run, up to
/// `retries` more times. The final report is returned through the handle.
pub fn spawn_lifecycle(
    manager: Arc<LifecycleManager>,
    event: LifecycleEvent,
    retries: u32,
    retry_delay: Duration,
) -> JoinHandle<LifecycleReport> {
    tokio::spawn(async move {
        let mut attempt = 0;
        loop {
            let report = manager.apply(&event);
            if report.is_complete() {
                debug!("Background lifecycle event for {} done: {:?}", event.user(), report);
                return report;
            }
            if attempt >= retries {
                warn!(
                    "Background lifecycle event for {} gave up after {} attempts, {} keys failed",
                    event.user(),
                    attempt + 1,
                    report.failed.len()
                );
                return report;
            }
            attempt += 1;
            warn!(
                "Background lifecycle event for {} had {} failed keys, retrying ({}/{})",
                event.user(),
                report.failed.len(),
                attempt,
                retries
            );
            tokio::time::sleep(retry_delay).await;
        }
    })
}

/// `(new - old, old - new)`, each in first-seen order
pub fn key_delta<'a>(old_keys: &'a [String], new_keys: &'a [String]) -> (Vec<&'a str>, Vec<&'a str>) {
    let old: HashSet<&str> = old_keys.iter().map(String::as_str).collect();
    let new: HashSet<&str> = new_keys.iter().map(String::as_str).collect();

    let added = dedup(new_keys).into_iter().filter(|k| !old.contains(k)).collect();
    let removed = dedup(old_keys).into_iter().filter(|k| !new.contains(k)).collect();
    (added, removed)
}

fn dedup(keys: &[String]) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter()
        .map(String::as_str)
        .filter(|k| seen.insert(*k))
        .collect()
}
