// Periodic publication of aggregate presence.
//
// Every interval the publisher reads a copy of the store, builds the three
// projections and publishes each one as a `presence-update` message. Failures
// are logged and counted; they never feed back into the engine.

pub mod projection;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use presence_common::protocol::rest::PublishMessage;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::control::RunSwitch;
use crate::engine::store::StoreView;
use crate::engine::EngineHandle;
use crate::error::RestError;
use crate::metrics::EngineMetrics;

pub use self::projection::Projections;

/// Default interval between publications.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

/// Sink for aggregate messages.
pub trait AggregatePublisher: Send + Sync + 'static {
    fn publish(
        &self,
        channel: &str,
        message: &PublishMessage,
    ) -> impl Future<Output = Result<(), RestError>> + Send;
}

/// Publisher that only logs what it would send.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

impl AggregatePublisher for LogPublisher {
    async fn publish(&self, channel: &str, message: &PublishMessage) -> Result<(), RestError> {
        let entries = message.data.as_object().map_or(0, |map| map.len());
        debug!(channel = %channel, event = %message.name, entries, "aggregate (log only)");
        Ok(())
    }
}

/// Destination channels for the three projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTargets {
    pub by_channel: String,
    pub by_client_id: String,
    pub by_connection_id: String,
}

impl PublishTargets {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            by_channel: format!("{prefix}:by-channel"),
            by_client_id: format!("{prefix}:by-clientId"),
            by_connection_id: format!("{prefix}:by-connectionId"),
        }
    }
}

/// Result of one publication cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub generated_at: DateTime<Utc>,
    pub channels: usize,
    pub published: usize,
    pub failed: usize,
}

/// Publish all three projections of `view`. Each target is attempted even
/// if an earlier one fails.
pub async fn publish_view<P: AggregatePublisher>(
    publisher: &P,
    targets: &PublishTargets,
    view: &StoreView,
    metrics: &EngineMetrics,
) -> PublishReport {
    let generated_at = Utc::now();
    let projections = Projections::from_view(view);
    let channels = projections.channel_count();

    let batches: [(&str, Result<Value, serde_json::Error>); 3] = [
        (&targets.by_channel, serde_json::to_value(&projections.by_channel)),
        (&targets.by_client_id, serde_json::to_value(&projections.by_client_id)),
        (&targets.by_connection_id, serde_json::to_value(&projections.by_connection_id)),
    ];

    let mut report = PublishReport { generated_at, channels, published: 0, failed: 0 };
    for (target, data) in batches {
        let result = match data {
            Ok(data) => publisher.publish(target, &PublishMessage::presence_update(data)).await,
            Err(error) => {
                warn!(channel = %target, error = %error, "aggregate encoding failed");
                report.failed += 1;
                metrics.record_publish_failure();
                continue;
            }
        };
        match result {
            Ok(()) => report.published += 1,
            Err(error) => {
                report.failed += 1;
                metrics.record_publish_failure();
                warn!(channel = %target, error = %error, "aggregate publish failed");
            }
        }
    }

    debug!(
        generated_at = %report.generated_at.to_rfc3339(),
        channels = report.channels,
        published = report.published,
        failed = report.failed,
        "aggregate publication cycle"
    );
    report
}

/// Publish on a fixed interval until shutdown or until the engine stops.
/// The first publication happens one full interval after start. Ticks are
/// skipped while `switch` is stopped.
pub async fn run_publisher<P: AggregatePublisher>(
    engine: EngineHandle,
    publisher: P,
    targets: PublishTargets,
    period: Duration,
    switch: RunSwitch,
    metrics: Arc<EngineMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!(
        interval_ms = period.as_millis() as u64,
        target = %targets.by_channel,
        "aggregate publisher started"
    );

    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                info!("aggregate publisher shutting down");
                break;
            }

            _ = ticker.tick() => {
                if !switch.is_running() {
                    debug!("aggregate publication paused");
                    continue;
                }
                let view = match engine.view().await {
                    Ok(view) => view,
                    Err(error) => {
                        info!(error = %error, "engine stopped, aggregate publisher exiting");
                        break;
                    }
                };
                publish_view(&publisher, &targets, &view, &metrics).await;
            }
        }
    }
}
