// Occupancy monitor: debounced member-count verification per channel.
//
// Each occupancy report (and each accepted membership change) re-arms a
// single-shot timer for the channel; arming cancels the previous timer.
// When the timer fires the tracked member count is compared against the
// last reported occupancy and a mismatch triggers a resync of that channel.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::resync::SnapshotSource;
use super::{Engine, EngineCommand};

/// A scheduled verification. Dropping the timer cancels it.
#[derive(Debug)]
pub struct VerificationTimer {
    generation: u64,
    task: JoinHandle<()>,
}

impl VerificationTimer {
    pub(crate) fn spawn(
        channel: String,
        generation: u64,
        delay: Duration,
        mailbox: mpsc::WeakSender<EngineCommand>,
    ) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(EngineCommand::Verify { channel, generation }).await;
            }
        });
        Self { generation, task }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for VerificationTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Result of a verification timer firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Member count matches the last occupancy report.
    Consistent,
    /// Member count differs; a resync was requested.
    Drift { expected: u64, actual: u64 },
    /// The timer was replaced or cancelled after it fired.
    Superseded,
    /// The channel no longer exists.
    Untracked,
}

impl<S: SnapshotSource> Engine<S> {
    /// Record the expected member count for a tracked channel and schedule a
    /// verification. Reports for untracked channels are ignored.
    pub fn report_occupancy(&mut self, channel: &str, expected: u64) -> bool {
        let Some(state) = self.store.channel_mut(channel) else {
            trace!(channel = %channel, expected, "occupancy for untracked channel ignored");
            return false;
        };

        state.expected_member_count = expected;
        self.metrics.record_occupancy_report();
        debug!(
            channel = %channel,
            expected,
            actual = state.member_count(),
            "occupancy update"
        );
        self.arm_verification(channel);
        true
    }

    /// (Re)schedule verification for `channel`, cancelling any pending one.
    pub(crate) fn arm_verification(&mut self, channel: &str) {
        if !self.store.contains(channel) {
            return;
        }

        let generation = self.next_generation();
        let timer = VerificationTimer::spawn(
            channel.to_string(),
            generation,
            self.config.verify_delay,
            self.mailbox.clone(),
        );
        if let Some(state) = self.store.channel_mut(channel) {
            state.set_verification(timer);
        }
    }

    /// Timer callback: compare tracked and expected counts. Never mutates
    /// membership; only decides whether a resync is needed.
    pub fn verify(&mut self, channel: &str, generation: u64) -> VerifyOutcome {
        let Some(state) = self.store.channel_mut(channel) else {
            return VerifyOutcome::Untracked;
        };

        let current = state.pending_verification.as_ref().map(|timer| timer.generation());
        if current != Some(generation) {
            trace!(channel = %channel, generation, "superseded verification ignored");
            return VerifyOutcome::Superseded;
        }
        drop(state.clear_verification());

        if !state.is_drifted() {
            trace!(channel = %channel, "member count verified");
            return VerifyOutcome::Consistent;
        }

        let expected = state.expected_member_count();
        let actual = state.member_count() as u64;
        self.metrics.record_drift();
        info!(
            channel = %channel,
            expected,
            actual,
            "member count drift detected, resyncing"
        );
        self.request_resync(BTreeSet::from([channel.to_string()]));
        VerifyOutcome::Drift { expected, actual }
    }
}
