// Presence reconciliation engine.
//
// A single task owns the membership store. Queue deliveries, verification
// timer fires and snapshot completions all arrive as `EngineCommand`s on one
// mailbox, so every mutation is serialized without locks. Snapshot fetches
// run in spawned tasks and report back through the same mailbox.

pub mod applier;
pub mod monitor;
pub mod resync;
pub mod store;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use presence_common::protocol::queue::{OccupancyEnvelope, PresenceEnvelope};
use presence_common::types::{ChannelPresence, PresenceMessage};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::error::RestError;
use crate::metrics::EngineMetrics;

use self::applier::{ApplyOutcome, MemberUpdate};
use self::resync::{ResyncRequest, SnapshotSource};
use self::store::{MembershipStore, StoreView};

/// Default quiet period before an occupancy report is verified.
pub const DEFAULT_VERIFY_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Debounce delay between the last occupancy report (or membership
    /// change) for a channel and its count verification.
    pub verify_delay: Duration,
    pub mailbox_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { verify_delay: DEFAULT_VERIFY_DELAY, mailbox_capacity: DEFAULT_MAILBOX_CAPACITY }
    }
}

impl EngineConfig {
    pub fn with_verify_delay(verify_delay: Duration) -> Self {
        Self { verify_delay, ..Self::default() }
    }
}

/// Work items processed by the engine loop.
#[derive(Debug)]
pub enum EngineCommand {
    /// A batch of presence events for one channel. `reply` fires once every
    /// event has been applied.
    Presence { envelope: PresenceEnvelope, reply: Option<oneshot::Sender<()>> },
    /// Occupancy reports for one channel.
    Occupancy { envelope: OccupancyEnvelope, reply: Option<oneshot::Sender<()>> },
    /// A verification timer fired.
    Verify { channel: String, generation: u64 },
    /// Explicit resync request.
    Resync { channels: BTreeSet<String> },
    /// A snapshot fetch finished.
    SnapshotLoaded { request: ResyncRequest, result: Result<Vec<ChannelPresence>, RestError> },
    /// Read a copy of the current store.
    Inspect { reply: oneshot::Sender<StoreView> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("reconciliation engine is not running")]
    Closed,
}

/// Cloneable sender side of the engine mailbox.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Apply a presence envelope and wait until it has been applied locally.
    pub async fn apply_presence(&self, envelope: PresenceEnvelope) -> Result<(), EngineError> {
        let (reply, done) = oneshot::channel();
        self.send(EngineCommand::Presence { envelope, reply: Some(reply) }).await?;
        done.await.map_err(|_| EngineError::Closed)
    }

    /// Record occupancy reports and wait until they have been applied locally.
    pub async fn report_occupancy(&self, envelope: OccupancyEnvelope) -> Result<(), EngineError> {
        let (reply, done) = oneshot::channel();
        self.send(EngineCommand::Occupancy { envelope, reply: Some(reply) }).await?;
        done.await.map_err(|_| EngineError::Closed)
    }

    pub async fn resync(&self, channels: BTreeSet<String>) -> Result<(), EngineError> {
        self.send(EngineCommand::Resync { channels }).await
    }

    pub async fn view(&self) -> Result<StoreView, EngineError> {
        let (reply, view) = oneshot::channel();
        self.send(EngineCommand::Inspect { reply }).await?;
        view.await.map_err(|_| EngineError::Closed)
    }

    async fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.tx.send(command).await.map_err(|_| EngineError::Closed)
    }
}

pub struct Engine<S> {
    store: MembershipStore,
    config: EngineConfig,
    source: Arc<S>,
    metrics: Arc<EngineMetrics>,
    commands: mpsc::Receiver<EngineCommand>,
    // Weak so the mailbox closes once every external handle is gone.
    mailbox: mpsc::WeakSender<EngineCommand>,
    next_generation: u64,
    resyncs_in_flight: HashSet<String>,
}

impl<S: SnapshotSource> Engine<S> {
    pub fn new(
        config: EngineConfig,
        source: Arc<S>,
        metrics: Arc<EngineMetrics>,
    ) -> (Self, EngineHandle) {
        let (tx, commands) = mpsc::channel(config.mailbox_capacity.max(1));
        let engine = Self {
            store: MembershipStore::new(),
            config,
            source,
            metrics,
            commands,
            mailbox: tx.downgrade(),
            next_generation: 0,
            resyncs_in_flight: HashSet::new(),
        };
        (engine, EngineHandle { tx })
    }

    pub fn store(&self) -> &MembershipStore {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    /// Runs the engine loop until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("reconciliation engine started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("reconciliation engine shutting down");
                    break;
                }

                maybe_command = self.commands.recv() => {
                    match maybe_command {
                        Some(command) => self.handle(command),
                        None => {
                            info!("engine mailbox closed, engine exiting");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Process a single command. Returns false once the mailbox is closed.
    pub async fn step(&mut self) -> bool {
        match self.commands.recv().await {
            Some(command) => {
                self.handle(command);
                true
            }
            None => false,
        }
    }

    pub fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Presence { envelope, reply } => {
                for message in &envelope.presence {
                    self.apply_event(&envelope.channel, message);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            EngineCommand::Occupancy { envelope, reply } => {
                for expected in envelope.expected_counts() {
                    self.report_occupancy(&envelope.channel, expected);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            EngineCommand::Verify { channel, generation } => {
                self.verify(&channel, generation);
            }
            EngineCommand::Resync { channels } => {
                self.request_resync(channels);
            }
            EngineCommand::SnapshotLoaded { request, result } => {
                self.on_snapshot_loaded(request, result);
            }
            EngineCommand::Inspect { reply } => {
                let _ = reply.send(self.store.view());
            }
        }

        self.metrics.set_store_size(self.store.channel_count(), self.store.member_count());
    }

    /// Apply one queue event (non-authoritative) and re-arm verification for
    /// the channel when membership changed.
    pub fn apply_event(&mut self, channel: &str, message: &PresenceMessage) -> ApplyOutcome {
        let update = MemberUpdate::new(
            channel,
            message.member_key(),
            message.action,
            message.timestamp,
        );
        let outcome = self.store.apply(update, false);
        self.metrics.record_apply(outcome);

        match outcome {
            ApplyOutcome::Stale => {
                debug!(
                    channel = %channel,
                    client_id = %message.client_id,
                    connection_id = %message.connection_id,
                    timestamp = message.timestamp,
                    "discarding stale presence event"
                );
            }
            ApplyOutcome::Ignored => {
                debug!(channel = %channel, action = ?message.action, "ignoring presence action");
            }
            _ => {
                trace!(
                    channel = %channel,
                    action = %message.action,
                    timestamp = message.timestamp,
                    ?outcome,
                    "presence event applied"
                );
            }
        }

        if outcome.needs_verification() {
            self.arm_verification(channel);
        }
        outcome
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }
}
