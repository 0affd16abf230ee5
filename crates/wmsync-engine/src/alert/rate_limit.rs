//! Per-type sliding-window rate limiting with suppressed-count follow-ups.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use wmsync_types::alert::{Alert, Severity};
use wmsync_types::state::CorrelationId;

/// Decision for one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Whether the alert itself should be delivered.
    pub deliver: bool,
    /// Summary of alerts suppressed in a window that has since drained.
    /// Delivered before the alert, and never rate-limited itself.
    pub follow_up: Option<Alert>,
}

#[derive(Debug, Default)]
struct TypeWindow {
    delivered: VecDeque<Instant>,
    suppressed: u64,
    worst: Option<Severity>,
    correlation_id: Option<CorrelationId>,
}

impl TypeWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.delivered.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.delivered.pop_front();
            } else {
                break;
            }
        }
    }

    fn take_summary(&mut self, kind: &str) -> Option<Alert> {
        if self.suppressed == 0 {
            return None;
        }
        let count = self.suppressed;
        let severity = self.worst.unwrap_or(Severity::Warning);
        self.suppressed = 0;
        self.worst = None;
        Some(
            Alert::new(
                severity,
                kind,
                "Alerts suppressed",
                format!("{count} alerts of type {kind} suppressed"),
            )
            .with_context("suppressed", count)
            .with_context("alert_type", kind)
            .with_correlation(self.correlation_id.take()),
        )
    }
}

/// Sliding window per alert `type`: at most `max_per_window` deliveries in
/// any `window`. Owned by one dispatcher instance.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_per_window: usize,
    types: HashMap<String, TypeWindow>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(window: Duration, max_per_window: usize) -> Self {
        Self {
            window,
            max_per_window: max_per_window.max(1),
            types: HashMap::new(),
        }
    }

    /// Decide whether `alert` may be delivered at `now`.
    pub fn admit(&mut self, alert: &Alert, now: Instant) -> Admission {
        let state = self.types.entry(alert.kind.clone()).or_default();
        state.prune(now, self.window);

        let follow_up = if state.delivered.is_empty() {
            state.take_summary(&alert.kind)
        } else {
            None
        };

        if state.delivered.len() < self.max_per_window {
            state.delivered.push_back(now);
            Admission {
                deliver: true,
                follow_up,
            }
        } else {
            state.suppressed += 1;
            state.worst = Some(state.worst.map_or(alert.severity, |w| w.max(alert.severity)));
            if alert.correlation_id.is_some() {
                state.correlation_id.clone_from(&alert.correlation_id);
            }
            Admission {
                deliver: false,
                follow_up,
            }
        }
    }

    /// Summaries for every type with pending suppressed alerts, regardless
    /// of window state. Resets the suppressed counters.
    pub fn drain_suppressed(&mut self) -> Vec<Alert> {
        let mut summaries = Vec::new();
        let mut kinds: Vec<&String> = self.types.keys().collect();
        kinds.sort();
        let kinds: Vec<String> = kinds.into_iter().cloned().collect();
        for kind in kinds {
            if let Some(summary) = self
                .types
                .get_mut(&kind)
                .and_then(|state| state.take_summary(&kind))
            {
                summaries.push(summary);
            }
        }
        summaries
    }
}
