//! Severity-routed, rate-limited alert delivery.
//!
//! Channels implement [`AlertChannel`]; the [`AlertDispatcher`] owns the
//! routing table, the per-type rate limiter and per-channel retry.

mod channels;
mod dispatcher;
mod rate_limit;

use async_trait::async_trait;
use wmsync_types::alert::Alert;

use crate::error::AlertDeliveryError;

pub use channels::{channels_from_config, ChatWebhookChannel, LogChannel, WebhookChannel};
pub use dispatcher::{AlertDispatcher, ChannelOutcome, DeliveryReport};
pub use rate_limit::{Admission, RateLimiter};

/// Name of the always-registered structured-logging channel.
pub const LOG_CHANNEL: &str = "log";

/// One delivery target. Implementations must not panic; failures are
/// returned and retried by the dispatcher.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertDeliveryError>;
}
