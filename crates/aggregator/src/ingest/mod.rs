// Queue ingestion: delivery → decode → engine → ack.
//
// A delivery is acknowledged only after the engine reports it applied. If the
// engine has stopped, the delivery goes back to the queue instead.

pub mod amqp;
pub mod line_source;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use presence_common::protocol::queue::{decode_occupancy, decode_presence, DecodeError};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::control::{RunState, RunSwitch};
use crate::engine::{EngineError, EngineHandle};
use crate::error::SourceError;
use crate::metrics::EngineMetrics;

pub use self::amqp::{broker_uri, AmqpEventSource, QueueNames};
pub use self::line_source::{LineEventSource, QueueRouting};

/// Which queue a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Presence,
    Occupancy,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence => f.write_str("presence"),
            Self::Occupancy => f.write_str("occupancy"),
        }
    }
}

/// One message handed out by an [`EventSource`], pending ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub kind: QueueKind,
    pub payload: Vec<u8>,
}

/// An at-least-once message source with explicit settlement.
pub trait EventSource: Send {
    /// Next delivery, or `None` once the source is exhausted.
    fn next(&mut self) -> impl Future<Output = Option<Result<Delivery, SourceError>>> + Send;

    fn ack(&mut self, tag: u64) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn reject(
        &mut self,
        tag: u64,
        requeue: bool,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;
}

/// What to do with a delivery whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Log, count and acknowledge so the message is not redelivered.
    #[default]
    DropAndAck,
    /// Reject without requeue (dead-lettered if the broker is set up for it).
    Reject,
}

impl FromStr for MalformedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" | "drop-and-ack" | "ack" => Ok(Self::DropAndAck),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown malformed payload policy: {other}")),
        }
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Applied,
    /// Malformed and acknowledged.
    Dropped,
    /// Malformed and rejected without requeue.
    Rejected,
    /// The engine is gone; the delivery was requeued.
    Requeued,
}

pub struct IngestionAdapter<E> {
    source: E,
    engine: EngineHandle,
    policy: MalformedPolicy,
    metrics: Arc<EngineMetrics>,
    // Holds the state sender open for `run_state`.
    switch: RunSwitch,
    run_state: watch::Receiver<RunState>,
}

impl<E: EventSource> IngestionAdapter<E> {
    pub fn new(
        source: E,
        engine: EngineHandle,
        policy: MalformedPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let switch = RunSwitch::default();
        let run_state = switch.subscribe();
        Self { source, engine, policy, metrics, switch, run_state }
    }

    /// Pause consumption while `switch` is stopped.
    pub fn with_switch(mut self, switch: RunSwitch) -> Self {
        self.run_state = switch.subscribe();
        self.switch = switch;
        self
    }

    pub fn into_source(self) -> E {
        self.source
    }

    /// Consume deliveries until shutdown, source exhaustion or engine exit.
    /// Only unrecoverable source failures are returned as errors.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SourceError> {
        info!(policy = ?self.policy, "ingestion started");

        loop {
            if *self.run_state.borrow_and_update() == RunState::Stopped {
                info!("ingestion paused");
                tokio::select! {
                    biased;

                    _ = shutdown.recv() => {
                        info!("ingestion shutting down");
                        break;
                    }

                    _ = resumed(&mut self.run_state) => {
                        info!("ingestion resumed");
                    }
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("ingestion shutting down");
                    break;
                }

                Ok(()) = self.run_state.changed() => continue,

                maybe_delivery = self.source.next() => {
                    let delivery = match maybe_delivery {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(error)) if error.is_recoverable() => {
                            warn!(error = %error, "skipping unreadable delivery");
                            continue;
                        }
                        Some(Err(error)) => return Err(error),
                        None => {
                            info!("event source exhausted");
                            break;
                        }
                    };

                    match self.handle(delivery).await {
                        Ok(DeliveryOutcome::Requeued) => {
                            warn!("engine stopped, ingestion exiting");
                            break;
                        }
                        Ok(_) => {}
                        Err(error) if error.is_recoverable() => {
                            warn!(error = %error, "delivery settlement failed");
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }

        Ok(())
    }

    /// Decode, apply and settle one delivery.
    pub async fn handle(&mut self, delivery: Delivery) -> Result<DeliveryOutcome, SourceError> {
        let Delivery { tag, kind, payload } = delivery;

        let applied = match kind {
            QueueKind::Presence => match decode_presence(&payload) {
                Ok(envelope) => {
                    debug!(
                        tag,
                        channel = %envelope.channel,
                        events = envelope.presence.len(),
                        "presence delivery"
                    );
                    self.engine.apply_presence(envelope).await
                }
                Err(error) => return self.settle_malformed(tag, kind, error).await,
            },
            QueueKind::Occupancy => match decode_occupancy(&payload) {
                Ok(envelope) => {
                    debug!(tag, channel = %envelope.channel, "occupancy delivery");
                    self.engine.report_occupancy(envelope).await
                }
                Err(error) => return self.settle_malformed(tag, kind, error).await,
            },
        };

        match applied {
            Ok(()) => {
                self.source.ack(tag).await?;
                self.metrics.record_ack();
                Ok(DeliveryOutcome::Applied)
            }
            Err(EngineError::Closed) => {
                self.source.reject(tag, true).await?;
                self.metrics.record_reject();
                Ok(DeliveryOutcome::Requeued)
            }
        }
    }

    async fn settle_malformed(
        &mut self,
        tag: u64,
        kind: QueueKind,
        error: DecodeError,
    ) -> Result<DeliveryOutcome, SourceError> {
        self.metrics.record_malformed();
        warn!(tag, queue = %kind, error = %error, policy = ?self.policy, "malformed delivery");

        match self.policy {
            MalformedPolicy::DropAndAck => {
                self.source.ack(tag).await?;
                self.metrics.record_ack();
                Ok(DeliveryOutcome::Dropped)
            }
            MalformedPolicy::Reject => {
                self.source.reject(tag, false).await?;
                self.metrics.record_reject();
                Ok(DeliveryOutcome::Rejected)
            }
        }
    }
}

async fn resumed(run_state: &mut watch::Receiver<RunState>) -> Result<(), watch::error::RecvError> {
    run_state.wait_for(|state| *state == RunState::Running).await.map(|_| ())
}
