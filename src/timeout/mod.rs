//! Per-session timeout monitoring
//!
//! One lightweight poll task per live session recomputes [`TimeoutState`]
//! from the cached session record on a fixed interval. The recompute is
//! level-triggered, so a missed or delayed poll cannot desynchronize
//! anything: each tick derives the full picture from scratch. Transitions
//! are published on a broadcast channel; Monitoring subscribes, nothing is
//! called back directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::models::{SessionEventKind, TimeoutBudgets, TimeoutState};
use crate::session::store::SessionStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Transition kinds published by the poll tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEventKind {
    /// Remaining time dropped inside the warning threshold
    Warning,
    /// Remaining time dropped inside the refresh threshold
    RefreshDue,
    /// A budget ran out; the session has been invalidated
    Expired,
}

#[derive(Debug, Clone)]
pub struct TimeoutEvent {
    pub kind: TimeoutEventKind,
    pub session_id: String,
    pub subject_id: String,
    pub state: TimeoutState,
    pub timestamp: DateTime<Utc>,
}

struct MonitorHandle {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct TimeoutManager {
    store: Arc<SessionStore>,
    budgets: TimeoutBudgets,
    refresh_threshold: chrono::Duration,
    poll_interval: Duration,
    monitors: Arc<Mutex<HashMap<String, MonitorHandle>>>,
    generations: AtomicU64,
    events: broadcast::Sender<TimeoutEvent>,
}

impl TimeoutManager {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        budgets: TimeoutBudgets,
        refresh_threshold: chrono::Duration,
        poll_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            budgets,
            refresh_threshold,
            poll_interval,
            monitors: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribe to timeout transitions
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimeoutEvent> {
        self.events.subscribe()
    }

    /// Start (or restart) the poll task for a session
    ///
    /// Idempotent under concurrency: a prior monitor for the same id is
    /// aborted and replaced, so two handlers racing to start end up with
    /// exactly one task.
    pub fn start_monitoring(&self, session_id: &str, subject_id: &str) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(Self::poll_loop(
            Arc::clone(&self.store),
            self.budgets,
            self.refresh_threshold,
            self.poll_interval,
            Arc::clone(&self.monitors),
            self.events.clone(),
            session_id.to_string(),
            subject_id.to_string(),
            generation,
        ));

        let mut monitors = match self.monitors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) =
            monitors.insert(session_id.to_string(), MonitorHandle { generation, handle })
        {
            previous.handle.abort();
        }
        log::debug!("Timeout monitor started for session {session_id}");
    }

    /// Stop the poll task for a session; no-op when none exists
    pub fn stop_monitoring(&self, session_id: &str) {
        let mut monitors = match self.monitors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(monitor) = monitors.remove(session_id) {
            monitor.handle.abort();
            log::debug!("Timeout monitor stopped for session {session_id}");
        }
    }

    /// Number of live monitors
    #[must_use]
    pub fn active_monitors(&self) -> usize {
        self.monitors.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Abort every monitor; used at shutdown
    pub fn shutdown(&self) {
        let mut monitors = match self.monitors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, monitor) in monitors.drain() {
            monitor.handle.abort();
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll_loop(
        store: Arc<SessionStore>,
        budgets: TimeoutBudgets,
        refresh_threshold: chrono::Duration,
        poll_interval: Duration,
        monitors: Arc<Mutex<HashMap<String, MonitorHandle>>>,
        events: broadcast::Sender<TimeoutEvent>,
        session_id: String,
        subject_id: String,
        generation: u64,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // One-shot flags, re-armed when the session leaves the zone again
        // (a refresh pushes remaining time back out)
        let mut warned = false;
        let mut refresh_notified = false;

        loop {
            interval.tick().await;
            let now = Utc::now();

            // Session gone from the cache means it was invalidated elsewhere;
            // a late poll is a no-op and the monitor retires quietly
            let Some(session) = store.cached_stale(&session_id) else {
                break;
            };

            let state = TimeoutState::compute(&session, &budgets, now);

            if !state.is_active {
                let _ = events.send(TimeoutEvent {
                    kind: TimeoutEventKind::Expired,
                    session_id: session_id.clone(),
                    subject_id: subject_id.clone(),
                    state,
                    timestamp: now,
                });
                store.invalidate_local(&session_id, &subject_id, SessionEventKind::Timeout);
                log::info!("Session {session_id} expired under timeout monitoring");
                break;
            }

            let in_warning_zone =
                state.time_remaining_secs <= budgets.warning_threshold.num_seconds();
            if in_warning_zone && !warned {
                warned = true;
                let _ = events.send(TimeoutEvent {
                    kind: TimeoutEventKind::Warning,
                    session_id: session_id.clone(),
                    subject_id: subject_id.clone(),
                    state,
                    timestamp: now,
                });
            } else if !in_warning_zone {
                warned = false;
            }

            let in_refresh_zone = session.needs_refresh(now, refresh_threshold);
            if in_refresh_zone && !refresh_notified {
                refresh_notified = true;
                let _ = events.send(TimeoutEvent {
                    kind: TimeoutEventKind::RefreshDue,
                    session_id: session_id.clone(),
                    subject_id: subject_id.clone(),
                    state,
                    timestamp: now,
                });
            } else if !in_refresh_zone {
                refresh_notified = false;
            }
        }

        // Retire the registry entry, but only our own generation; a restart
        // may have replaced it already
        let mut monitors = match monitors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if monitors
            .get(&session_id)
            .is_some_and(|m| m.generation == generation)
        {
            monitors.remove(&session_id);
        }
    }
}
