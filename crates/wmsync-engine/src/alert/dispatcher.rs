//! Alert routing, rate limiting and best-effort delivery.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::task::TaskTracker;
use wmsync_types::alert::{Alert, Severity};

use super::channels::{channels_from_config, LogChannel};
use super::rate_limit::{Admission, RateLimiter};
use super::{AlertChannel, LOG_CHANNEL};
use crate::config::AlertConfig;
use crate::error::{compute_backoff, ConfigurationError};

const MAX_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Result of delivering one alert to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub channel: String,
    pub attempts: u32,
    /// Last error, when every attempt failed.
    pub error: Option<String>,
}

impl ChannelOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// What happened to one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub alert_type: String,
    pub severity: Severity,
    /// Dropped by the rate limiter; no channel was tried.
    pub suppressed: bool,
    pub outcomes: Vec<ChannelOutcome>,
    /// Every channel failed a CRITICAL alert and the fallback log was used.
    pub degraded: bool,
}

impl DeliveryReport {
    fn suppressed(alert: &Alert) -> Self {
        Self {
            alert_type: alert.kind.clone(),
            severity: alert.severity,
            suppressed: true,
            outcomes: Vec::new(),
            degraded: false,
        }
    }

    /// Whether at least one channel accepted the alert.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.outcomes.iter().any(ChannelOutcome::succeeded)
    }

    #[must_use]
    pub fn delivered_to(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.succeeded())
            .map(|o| o.channel.as_str())
            .collect()
    }
}

struct DeliveryCore {
    channels: BTreeMap<String, Arc<dyn AlertChannel>>,
    routing: BTreeMap<Severity, Vec<String>>,
    max_attempts: u32,
    retry_base: Duration,
}

impl DeliveryCore {
    async fn deliver(&self, alert: &Alert) -> DeliveryReport {
        let route = self
            .routing
            .get(&alert.severity)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut outcomes = Vec::with_capacity(route.len());
        for name in route {
            let outcome = match self.channels.get(name) {
                Some(channel) => self.deliver_with_retry(channel.as_ref(), alert).await,
                None => ChannelOutcome {
                    channel: name.clone(),
                    attempts: 0,
                    error: Some("channel not registered".to_string()),
                },
            };
            if let Some(error) = &outcome.error {
                tracing::warn!(
                    channel = %outcome.channel,
                    alert_type = %alert.kind,
                    attempts = outcome.attempts,
                    error = %error,
                    "Alert delivery failed"
                );
            }
            outcomes.push(outcome);
        }

        let all_failed = !outcomes.is_empty() && outcomes.iter().all(|o| !o.succeeded());
        let degraded = alert.severity == Severity::Critical && all_failed;
        if degraded {
            let failed: Vec<&str> = outcomes.iter().map(|o| o.channel.as_str()).collect();
            LogChannel::write(
                &Alert::critical(
                    "alerting_degraded",
                    "Alerting degraded",
                    format!(
                        "every channel failed to deliver critical alert '{}': {}",
                        alert.title, alert.message
                    ),
                )
                .with_context("failed_channels", failed.join(","))
                .with_context("original_type", alert.kind.as_str())
                .with_correlation(alert.correlation_id.clone()),
            );
        }

        DeliveryReport {
            alert_type: alert.kind.clone(),
            severity: alert.severity,
            suppressed: false,
            outcomes,
            degraded,
        }
    }

    async fn deliver_with_retry(&self, channel: &dyn AlertChannel, alert: &Alert) -> ChannelOutcome {
        let mut last_error = None;
        let mut attempts = 0;
        while attempts < self.max_attempts {
            match channel.deliver(alert).await {
                Ok(()) => {
                    return ChannelOutcome {
                        channel: channel.name().to_string(),
                        attempts: attempts + 1,
                        error: None,
                    };
                }
                Err(e) => {
                    tracing::debug!(
                        channel = channel.name(),
                        attempt = attempts + 1,
                        error = %e,
                        "Alert channel attempt failed"
                    );
                    last_error = Some(e.to_string());
                }
            }
            attempts += 1;
            if attempts < self.max_attempts {
                tokio::time::sleep(compute_backoff(
                    self.retry_base,
                    2.0,
                    attempts - 1,
                    MAX_RETRY_WAIT,
                ))
                .await;
            }
        }
        ChannelOutcome {
            channel: channel.name().to_string(),
            attempts,
            error: last_error,
        }
    }
}

/// Delivers alerts to severity-routed channels.
///
/// Delivery never fails from the caller's point of view: channel errors are
/// retried, logged and reported in the [`DeliveryReport`], never returned.
/// Rate-limit decisions are taken synchronously on the calling task so the
/// order of admissions matches the order of calls.
pub struct AlertDispatcher {
    core: Arc<DeliveryCore>,
    limiter: Mutex<RateLimiter>,
    tracker: TaskTracker,
}

impl AlertDispatcher {
    /// Dispatcher over `channels`. A [`LogChannel`] is added when no channel
    /// is named `log`.
    #[must_use]
    pub fn new(config: &AlertConfig, channels: Vec<Arc<dyn AlertChannel>>) -> Self {
        let mut registered: BTreeMap<String, Arc<dyn AlertChannel>> = channels
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();
        registered
            .entry(LOG_CHANNEL.to_string())
            .or_insert_with(|| Arc::new(LogChannel::new()));

        let all: Vec<String> = registered.keys().cloned().collect();
        let routing = Severity::ALL
            .iter()
            .map(|&severity| {
                let route = config.routing.get(&severity).cloned().unwrap_or_else(|| {
                    match severity {
                        Severity::Info | Severity::Warning => vec![LOG_CHANNEL.to_string()],
                        Severity::Error | Severity::Critical => all.clone(),
                    }
                });
                (severity, route)
            })
            .collect();

        Self {
            core: Arc::new(DeliveryCore {
                channels: registered,
                routing,
                max_attempts: config.retry.max_attempts.max(1),
                retry_base: Duration::from_millis(config.retry.retry_base_ms),
            }),
            limiter: Mutex::new(RateLimiter::new(
                config.rate_limit.window(),
                config.rate_limit.max_per_window,
            )),
            tracker: TaskTracker::new(),
        }
    }

    /// Dispatcher over the channels described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if a channel cannot be built.
    pub fn from_config(config: &AlertConfig) -> Result<Self, ConfigurationError> {
        Ok(Self::new(config, channels_from_config(config)?))
    }

    /// Channel names `severity` is routed to.
    #[must_use]
    pub fn route(&self, severity: Severity) -> &[String] {
        self.core
            .routing
            .get(&severity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn admit(&self, alert: &Alert) -> Admission {
        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(alert, Instant::now())
    }

    /// Deliver `alert` inline and report what happened.
    pub async fn send(&self, alert: Alert) -> DeliveryReport {
        let admission = self.admit(&alert);
        if let Some(follow_up) = admission.follow_up {
            self.core.deliver(&follow_up).await;
        }
        if !admission.deliver {
            tracing::debug!(alert_type = %alert.kind, "Alert suppressed by rate limit");
            return DeliveryReport::suppressed(&alert);
        }
        self.core.deliver(&alert).await
    }

    /// Deliver `alert` in the background. The rate-limit decision is taken
    /// now; use [`flush`](Self::flush) to wait for delivery.
    pub fn emit(&self, alert: Alert) {
        let admission = self.admit(&alert);
        if !admission.deliver && admission.follow_up.is_none() {
            tracing::debug!(alert_type = %alert.kind, "Alert suppressed by rate limit");
            return;
        }
        let core = Arc::clone(&self.core);
        self.tracker.spawn(async move {
            if let Some(follow_up) = admission.follow_up {
                core.deliver(&follow_up).await;
            }
            if admission.deliver {
                core.deliver(&alert).await;
            }
        });
    }

    /// Wait for every background delivery, then deliver pending
    /// "N suppressed" summaries.
    pub async fn flush(&self) -> Vec<DeliveryReport> {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();

        let summaries = self
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain_suppressed();
        let mut reports = Vec::with_capacity(summaries.len());
        for summary in summaries {
            reports.push(self.core.deliver(&summary).await);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::config::{AlertRetryConfig, RateLimitConfig};
    use crate::error::AlertDeliveryError;

    #[derive(Default)]
    struct Recording {
        name: String,
        seen: Mutex<Vec<Alert>>,
    }

    impl Recording {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Alert> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AlertChannel for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn deliver(&self, alert: &Alert) -> Result<(), AlertDeliveryError> {
            self.seen.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AlertChannel for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), AlertDeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(AlertDeliveryError::Status { status: 503 });
            }
            Ok(())
        }
    }

    fn config() -> AlertConfig {
        AlertConfig {
            rate_limit: RateLimitConfig {
                window_secs: 60,
                max_per_window: 1,
            },
            retry: AlertRetryConfig {
                max_attempts: 3,
                retry_base_ms: 1,
            },
            ..AlertConfig::default()
        }
    }

    #[test]
    fn default_routing_sends_low_severity_to_log_only() {
        let pager = Recording::named("pager");
        let dispatcher = AlertDispatcher::new(&config(), vec![pager]);
        assert_eq!(dispatcher.route(Severity::Info), ["log"]);
        assert_eq!(dispatcher.route(Severity::Warning), ["log"]);
        assert_eq!(dispatcher.route(Severity::Critical), ["log", "pager"]);
    }

    #[tokio::test]
    async fn critical_reaches_every_channel() {
        let pager = Recording::named("pager");
        let dispatcher = AlertDispatcher::new(&config(), vec![pager.clone()]);
        let report = dispatcher
            .send(Alert::critical("sync_failed", "Sync failed", "boom"))
            .await;
        assert_eq!(report.delivered_to(), vec!["log", "pager"]);
        assert_eq!(pager.seen().len(), 1);
    }

    #[tokio::test]
    async fn flaky_channel_is_retried() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let mut cfg = config();
        cfg.routing.insert(Severity::Warning, vec!["flaky".into()]);
        let dispatcher = AlertDispatcher::new(&cfg, vec![flaky.clone()]);

        let report = dispatcher.send(Alert::warning("t", "x", "y")).await;
        assert!(report.is_delivered());
        assert_eq!(report.outcomes[0].attempts, 3);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn critical_with_all_channels_failing_is_degraded() {
        let flaky = Arc::new(Flaky {
            failures_left: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        });
        let mut cfg = config();
        cfg.routing.insert(Severity::Critical, vec!["flaky".into()]);
        let dispatcher = AlertDispatcher::new(&cfg, vec![flaky.clone()]);

        let report = dispatcher.send(Alert::critical("t", "x", "y")).await;
        assert!(!report.is_delivered());
        assert!(report.degraded);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn suppressed_alert_reports_without_trying_channels() {
        let pager = Recording::named("pager");
        let mut cfg = config();
        cfg.routing.insert(Severity::Warning, vec!["pager".into()]);
        let dispatcher = AlertDispatcher::new(&cfg, vec![pager.clone()]);

        assert!(!dispatcher.send(Alert::warning("t", "a", "b")).await.suppressed);
        assert!(dispatcher.send(Alert::warning("t", "a", "b")).await.suppressed);
        assert_eq!(pager.seen().len(), 1);

        let reports = dispatcher.flush().await;
        assert_eq!(reports.len(), 1);
        let seen = pager.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].message, "1 alerts of type t suppressed");
    }

    #[tokio::test]
    async fn emit_is_delivered_by_flush() {
        let pager = Recording::named("pager");
        let dispatcher = AlertDispatcher::new(&config(), vec![pager.clone()]);
        dispatcher.emit(Alert::critical("a", "x", "y"));
        dispatcher.emit(Alert::critical("b", "x", "y"));
        dispatcher.flush().await;
        assert_eq!(pager.seen().len(), 2);

        // The tracker is reusable after a flush.
        dispatcher.emit(Alert::critical("c", "x", "y"));
        dispatcher.flush().await;
        assert_eq!(pager.seen().len(), 3);
    }
}
