//! Lifecycle observation and health reporting
//!
//! [`Monitoring`] consumes the store and timeout broadcast channels into a
//! bounded event ring and derives rolling metrics from it. It observes
//! only; nothing here ever influences an authorization decision.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{SessionEvent, SessionEventKind};
use crate::timeout::TimeoutEvent;

/// Default event ring capacity
pub const DEFAULT_EVENT_CAP: usize = 1000;

/// Rolling metric window
const METRIC_WINDOW_SECS: i64 = 300;

/// Error-rate thresholds for the health verdict
const DEGRADED_ERROR_RATE: f64 = 0.2;
const UNHEALTHY_ERROR_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthVerdict {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time metrics derived from the event ring
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringSnapshot {
    pub health: HealthVerdict,
    /// Sessions currently held by the store
    pub active_sessions: usize,
    /// Events currently held in the ring
    pub events_retained: usize,
    /// Events inside the rolling window
    pub events_in_window: usize,
    pub errors_in_window: usize,
    pub timeouts_in_window: usize,
    pub error_rate: f64,
}

pub struct Monitoring {
    events: Mutex<VecDeque<SessionEvent>>,
    cap: usize,
    window: Duration,
}

impl Monitoring {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
            window: Duration::seconds(METRIC_WINDOW_SECS),
        }
    }

    /// Append one event, evicting the oldest when the ring is full
    pub fn record(&self, event: SessionEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.cap {
                events.pop_front();
            }
            events.push_back(event);
        }
    }

    /// Derive the rolling metrics and health verdict
    ///
    /// The active session count is a gauge owned by the store; callers pass
    /// the current reading in.
    #[must_use]
    pub fn snapshot(&self, active_sessions: usize) -> MonitoringSnapshot {
        let horizon = Utc::now() - self.window;
        let Ok(events) = self.events.lock() else {
            return MonitoringSnapshot {
                health: HealthVerdict::Unhealthy,
                active_sessions,
                events_retained: 0,
                events_in_window: 0,
                errors_in_window: 0,
                timeouts_in_window: 0,
                error_rate: 0.0,
            };
        };

        let mut in_window = 0usize;
        let mut errors = 0usize;
        let mut timeouts = 0usize;
        for event in events.iter().rev() {
            if event.timestamp <= horizon {
                break;
            }
            in_window += 1;
            match event.kind {
                SessionEventKind::Error => errors += 1,
                SessionEventKind::Timeout => timeouts += 1,
                _ => {}
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let error_rate = if in_window == 0 {
            0.0
        } else {
            errors as f64 / in_window as f64
        };

        let health = if error_rate > UNHEALTHY_ERROR_RATE {
            HealthVerdict::Unhealthy
        } else if error_rate > DEGRADED_ERROR_RATE {
            HealthVerdict::Degraded
        } else {
            HealthVerdict::Healthy
        };

        MonitoringSnapshot {
            health,
            active_sessions,
            events_retained: events.len(),
            events_in_window: in_window,
            errors_in_window: errors,
            timeouts_in_window: timeouts,
            error_rate,
        }
    }

    /// Attach collector tasks to the store and timeout channels
    ///
    /// Lagged receivers skip dropped events and keep going; a closed channel
    /// retires its collector.
    pub fn spawn_collectors(
        self: &Arc<Self>,
        mut store_events: broadcast::Receiver<SessionEvent>,
        mut timeout_events: broadcast::Receiver<TimeoutEvent>,
    ) {
        let monitoring = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match store_events.recv().await {
                    Ok(event) => monitoring.record(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Monitoring lagged, {skipped} session events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let monitoring = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match timeout_events.recv().await {
                    Ok(event) => monitoring.record(
                        SessionEvent::new(
                            SessionEventKind::Timeout,
                            &event.session_id,
                            &event.subject_id,
                        )
                        .with_metadata(serde_json::json!({
                            "transition": format!("{:?}", event.kind),
                            "time_remaining_secs": event.state.time_remaining_secs,
                        })),
                    ),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Monitoring lagged, {skipped} timeout events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at(kind: SessionEventKind, mins_ago: i64) -> SessionEvent {
        let mut event = SessionEvent::new(kind, "sess-1", "user-1");
        event.timestamp = Utc::now() - Duration::minutes(mins_ago);
        event
    }

    #[test]
    fn test_ring_is_bounded() {
        let monitoring = Monitoring::new(10);
        for _ in 0..50 {
            monitoring.record(event_at(SessionEventKind::Validated, 0));
        }
        assert_eq!(monitoring.snapshot(0).events_retained, 10);
    }

    #[test]
    fn test_health_follows_error_rate() {
        let monitoring = Monitoring::default();
        for _ in 0..9 {
            monitoring.record(event_at(SessionEventKind::Validated, 0));
        }
        monitoring.record(event_at(SessionEventKind::Error, 0));
        // 1 error in 10: healthy
        assert_eq!(monitoring.snapshot(0).health, HealthVerdict::Healthy);

        for _ in 0..3 {
            monitoring.record(event_at(SessionEventKind::Error, 0));
        }
        // 4 errors in 13: degraded
        assert_eq!(monitoring.snapshot(0).health, HealthVerdict::Degraded);

        for _ in 0..12 {
            monitoring.record(event_at(SessionEventKind::Error, 0));
        }
        // 16 errors in 25: unhealthy
        assert_eq!(monitoring.snapshot(0).health, HealthVerdict::Unhealthy);
    }

    #[test]
    fn test_snapshot_carries_active_session_gauge() {
        let monitoring = Monitoring::default();
        monitoring.record(event_at(SessionEventKind::Validated, 0));
        assert_eq!(monitoring.snapshot(3).active_sessions, 3);
        assert_eq!(monitoring.snapshot(0).active_sessions, 0);
    }

    #[test]
    fn test_window_excludes_old_events() {
        let monitoring = Monitoring::default();
        for _ in 0..5 {
            monitoring.record(event_at(SessionEventKind::Error, 10));
        }
        monitoring.record(event_at(SessionEventKind::Validated, 0));

        let snapshot = monitoring.snapshot(0);
        assert_eq!(snapshot.events_in_window, 1);
        assert_eq!(snapshot.errors_in_window, 0);
        assert_eq!(snapshot.health, HealthVerdict::Healthy);
    }

    #[test]
    fn test_timeouts_counted_separately() {
        let monitoring = Monitoring::default();
        monitoring.record(event_at(SessionEventKind::Timeout, 0));
        monitoring.record(event_at(SessionEventKind::Validated, 0));

        let snapshot = monitoring.snapshot(0);
        assert_eq!(snapshot.timeouts_in_window, 1);
        assert_eq!(snapshot.errors_in_window, 0);
    }
}
