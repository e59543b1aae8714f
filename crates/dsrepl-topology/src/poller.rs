//! Initialization poller.
//!
//! One background task per in-flight total update. Each task probes the
//! update status on a fixed interval until a terminal marker shows up, then
//! deregisters itself, runs its completion callback exactly once and hands
//! the outcome to whoever holds the [`PollTicket`].
//!
//! Pollers are keyed by `(kind, suffix, name)`. Starting a poller for a key
//! that already has one cancels the old task. A key whose poll timed out is
//! not resumed by [`PollerRegistry::ensure`] until it is started explicitly,
//! cancelled or released.

use crate::lifecycle::AgreementKind;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Identifies one poller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollKey {
    /// Agreement flavor.
    pub kind: AgreementKind,
    /// Owning suffix.
    pub suffix: String,
    /// Agreement name.
    pub name: String,
}

impl PollKey {
    /// Build a key.
    pub fn new(kind: AgreementKind, suffix: &str, name: &str) -> Self {
        Self {
            kind,
            suffix: suffix.to_string(),
            name: name.to_string(),
        }
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Terminal success; carries the status text.
    Initialized(String),
    /// Terminal failure; carries the status text.
    Failed(String),
    /// Gave up after this many non-terminal checks.
    TimedOut(u32),
}

/// Progress of a total update as reported by a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProgress {
    /// Keep polling.
    InProgress,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
}

/// Classify a status probe answer. Matching is case-insensitive.
pub fn classify_init_progress(status: &str) -> InitProgress {
    let lower = status.to_ascii_lowercase();
    if lower.contains("successfully initialized") {
        InitProgress::Succeeded
    } else if lower.contains("initialization failed") {
        InitProgress::Failed
    } else {
        InitProgress::InProgress
    }
}

/// Receives the outcome of one poll.
#[derive(Debug)]
pub struct PollTicket {
    key: PollKey,
    outcome: oneshot::Receiver<PollOutcome>,
}

impl PollTicket {
    /// The polled key.
    pub fn key(&self) -> &PollKey {
        &self.key
    }

    /// Wait for the outcome. `None` when the poll was cancelled or replaced.
    pub async fn wait(self) -> Option<PollOutcome> {
        self.outcome.await.ok()
    }
}

struct ActivePoll {
    id: u64,
    cancel: CancellationToken,
}

struct Registry {
    active: DashMap<PollKey, ActivePoll>,
    timed_out: DashSet<PollKey>,
    next_id: AtomicU64,
    interval: Duration,
    max_attempts: Option<u32>,
}

/// Owns every running poller.
#[derive(Clone)]
pub struct PollerRegistry {
    inner: Arc<Registry>,
}

impl PollerRegistry {
    /// Registry probing every `interval`, optionally giving up after
    /// `max_attempts` non-terminal checks.
    pub fn new(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            inner: Arc::new(Registry {
                active: DashMap::new(),
                timed_out: DashSet::new(),
                next_id: AtomicU64::new(1),
                interval,
                max_attempts,
            }),
        }
    }

    /// Start polling `key`, cancelling any poller already running for it.
    ///
    /// `probe` is called once per tick and returns the status text or an
    /// error message; errors count as still in progress. `on_terminal` runs
    /// once, after the poller deregistered itself.
    pub fn start<P, PF, C, CF>(&self, key: PollKey, probe: P, on_terminal: C) -> PollTicket
    where
        P: FnMut() -> PF + Send + 'static,
        PF: Future<Output = Result<String, String>> + Send + 'static,
        C: FnOnce(PollOutcome) -> CF + Send + 'static,
        CF: Future<Output = ()> + Send + 'static,
    {
        let (id, cancel) = self.register();
        self.inner.timed_out.remove(&key);
        if let Some(old) = self.inner.active.insert(
            key.clone(),
            ActivePoll {
                id,
                cancel: cancel.clone(),
            },
        ) {
            old.cancel.cancel();
            info!(suffix = %key.suffix, name = %key.name, "replaced running poller");
        }
        self.spawn(key, id, cancel, probe, on_terminal)
    }

    /// Start polling `key` unless a poller is already running for it or its
    /// last poll timed out.
    pub fn ensure<P, PF, C, CF>(&self, key: PollKey, probe: P, on_terminal: C) -> Option<PollTicket>
    where
        P: FnMut() -> PF + Send + 'static,
        PF: Future<Output = Result<String, String>> + Send + 'static,
        C: FnOnce(PollOutcome) -> CF + Send + 'static,
        CF: Future<Output = ()> + Send + 'static,
    {
        if self.inner.timed_out.contains(&key) {
            debug!(suffix = %key.suffix, name = %key.name, "poll timed out earlier, not resumed");
            return None;
        }
        let (id, cancel) = match self.inner.active.entry(key.clone()) {
            MapEntry::Occupied(_) => return None,
            MapEntry::Vacant(slot) => {
                let (id, cancel) = self.register();
                slot.insert(ActivePoll {
                    id,
                    cancel: cancel.clone(),
                });
                (id, cancel)
            }
        };
        Some(self.spawn(key, id, cancel, probe, on_terminal))
    }

    /// Stop polling `key`. Returns whether a poller was running.
    pub fn cancel(&self, key: &PollKey) -> bool {
        self.inner.timed_out.remove(key);
        match self.inner.active.remove(key) {
            Some((_, poll)) => {
                poll.cancel.cancel();
                debug!(suffix = %key.suffix, name = %key.name, "poller cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop every poller of `suffix`.
    pub fn cancel_suffix(&self, suffix: &str) -> usize {
        self.inner.timed_out.retain(|key| key.suffix != suffix);
        let mut cancelled = 0;
        self.inner.active.retain(|key, poll| {
            if key.suffix == suffix {
                poll.cancel.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Stop every poller.
    pub fn cancel_all(&self) {
        self.inner.timed_out.clear();
        self.inner.active.retain(|_, poll| {
            poll.cancel.cancel();
            false
        });
    }

    /// Forget that the poll of `key` timed out, so `ensure` may resume it.
    pub fn release(&self, key: &PollKey) {
        if self.inner.timed_out.remove(key).is_some() {
            debug!(suffix = %key.suffix, name = %key.name, "timed out poll released");
        }
    }

    /// Whether a poller is running for `key`.
    pub fn is_active(&self, key: &PollKey) -> bool {
        self.inner.active.contains_key(key)
    }

    /// Number of running pollers.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    fn register(&self) -> (u64, CancellationToken) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        (id, CancellationToken::new())
    }

    fn spawn<P, PF, C, CF>(
        &self,
        key: PollKey,
        id: u64,
        cancel: CancellationToken,
        mut probe: P,
        on_terminal: C,
    ) -> PollTicket
    where
        P: FnMut() -> PF + Send + 'static,
        PF: Future<Output = Result<String, String>> + Send + 'static,
        C: FnOnce(PollOutcome) -> CF + Send + 'static,
        CF: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let registry = Arc::clone(&self.inner);
        let task_key = key.clone();
        let interval = registry.interval;
        let max_attempts = registry.max_attempts;
        debug!(suffix = %key.suffix, name = %key.name, ?interval, "poller started");

        tokio::spawn(async move {
            let key = task_key;
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut attempts: u32 = 0;

            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                attempts += 1;

                let status = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    status = probe() => status,
                };
                match status {
                    Ok(text) => match classify_init_progress(&text) {
                        InitProgress::Succeeded => break PollOutcome::Initialized(text),
                        InitProgress::Failed => break PollOutcome::Failed(text),
                        InitProgress::InProgress => {
                            debug!(suffix = %key.suffix, name = %key.name, attempts, status = %text, "still initializing")
                        }
                    },
                    Err(message) => {
                        warn!(suffix = %key.suffix, name = %key.name, attempts, %message, "status probe failed")
                    }
                }
                if max_attempts.map_or(false, |max| attempts >= max) {
                    break PollOutcome::TimedOut(attempts);
                }
            };

            if matches!(outcome, PollOutcome::TimedOut(_)) {
                registry.timed_out.insert(key.clone());
            }
            registry.active.remove_if(&key, |_, poll| poll.id == id);
            info!(suffix = %key.suffix, name = %key.name, attempts, ?outcome, "poller finished");
            on_terminal(outcome.clone()).await;
            // The ticket may have been dropped.
            let _ = tx.send(outcome);
        });

        PollTicket { key, outcome: rx }
    }
}
