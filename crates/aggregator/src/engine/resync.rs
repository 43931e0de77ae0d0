// Resync coordinator: replace channel state from an authoritative snapshot.
//
// A snapshot is a full replace, not a merge: every snapshot member is applied
// as an authoritative add, then local members missing from the snapshot are
// pruned (their leave event may never have been delivered). A failed fetch
// leaves the store untouched; the next drift detection retries.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;

use presence_common::types::{ChannelPresence, MemberKey, PresenceAction, PresenceMessage};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::applier::{ApplyOutcome, MemberUpdate};
use super::{Engine, EngineCommand};
use crate::error::RestError;

/// Source of full presence sets. Implementations must drain every page
/// before returning.
pub trait SnapshotSource: Send + Sync + 'static {
    fn fetch_presence(
        &self,
        channels: &[String],
    ) -> impl Future<Output = Result<Vec<ChannelPresence>, RestError>> + Send;
}

/// An outstanding snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    pub id: Uuid,
    pub channels: BTreeSet<String>,
}

impl ResyncRequest {
    pub fn new(channels: BTreeSet<String>) -> Self {
        Self { id: Uuid::new_v4(), channels }
    }
}

/// What an applied snapshot changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub channels: usize,
    pub channels_removed: usize,
    pub members_applied: usize,
    pub members_pruned: usize,
}

impl<S: SnapshotSource> Engine<S> {
    /// Start an asynchronous snapshot fetch for `channels`. Channels that
    /// already have a fetch in flight are skipped. The result comes back as
    /// [`EngineCommand::SnapshotLoaded`].
    pub fn request_resync(&mut self, channels: BTreeSet<String>) -> Option<ResyncRequest> {
        let channels: BTreeSet<String> = channels
            .into_iter()
            .filter(|channel| !self.resyncs_in_flight.contains(channel))
            .collect();
        if channels.is_empty() {
            debug!("resync already in flight for every requested channel");
            return None;
        }

        let Some(tx) = self.mailbox.upgrade() else {
            warn!("engine mailbox closed, resync not started");
            return None;
        };

        let request = ResyncRequest::new(channels);
        self.resyncs_in_flight.extend(request.channels.iter().cloned());
        self.metrics.record_resync_request();
        info!(resync_id = %request.id, channels = request.channels.len(), "requesting presence snapshot");

        let source = Arc::clone(&self.source);
        let pending = request.clone();
        let span = info_span!("resync", resync_id = %request.id);
        tokio::spawn(
            async move {
                let names: Vec<String> = pending.channels.iter().cloned().collect();
                let result = source.fetch_presence(&names).await;
                let _ = tx.send(EngineCommand::SnapshotLoaded { request: pending, result }).await;
            }
            .instrument(span),
        );

        Some(request)
    }

    /// Fetch and apply a snapshot inline. Used at startup before the engine
    /// loop begins consuming events.
    pub async fn resync_now(
        &mut self,
        channels: BTreeSet<String>,
    ) -> Result<ResyncSummary, RestError> {
        if channels.is_empty() {
            return Ok(ResyncSummary::default());
        }

        let names: Vec<String> = channels.iter().cloned().collect();
        self.metrics.record_resync_request();
        let sets = match self.source.fetch_presence(&names).await {
            Ok(sets) => sets,
            Err(error) => {
                self.metrics.record_resync_failure();
                return Err(error);
            }
        };
        let summary = self.apply_snapshot(&channels, sets);
        self.metrics.set_store_size(self.store.channel_count(), self.store.member_count());
        Ok(summary)
    }

    pub(crate) fn on_snapshot_loaded(
        &mut self,
        request: ResyncRequest,
        result: Result<Vec<ChannelPresence>, RestError>,
    ) -> Option<ResyncSummary> {
        for channel in &request.channels {
            self.resyncs_in_flight.remove(channel);
        }

        match result {
            Ok(sets) => {
                let summary = self.apply_snapshot(&request.channels, sets);
                info!(
                    resync_id = %request.id,
                    channels = summary.channels,
                    removed = summary.channels_removed,
                    pruned = summary.members_pruned,
                    "presence snapshot applied"
                );
                Some(summary)
            }
            Err(error) => {
                self.metrics.record_resync_failure();
                warn!(
                    resync_id = %request.id,
                    error = %error,
                    transient = error.is_transient(),
                    "presence snapshot fetch failed, keeping current state"
                );
                None
            }
        }
    }

    /// Replace the state of every requested channel with the snapshot.
    /// Requested channels missing from the snapshot have no members.
    pub fn apply_snapshot(
        &mut self,
        requested: &BTreeSet<String>,
        sets: Vec<ChannelPresence>,
    ) -> ResyncSummary {
        let mut by_channel: BTreeMap<String, Vec<PresenceMessage>> =
            requested.iter().map(|channel| (channel.clone(), Vec::new())).collect();
        for set in sets {
            by_channel.entry(set.channel).or_default().extend(set.presence);
        }

        let mut summary = ResyncSummary::default();
        for (channel, members) in by_channel {
            self.replace_channel(&channel, members, &mut summary);
        }
        self.metrics.record_members_pruned(summary.members_pruned as u64);
        summary
    }

    fn replace_channel(
        &mut self,
        channel: &str,
        members: Vec<PresenceMessage>,
        summary: &mut ResyncSummary,
    ) {
        summary.channels += 1;
        let had_channel = self.store.contains(channel);
        let mut present: HashSet<MemberKey> = HashSet::with_capacity(members.len());

        for message in members {
            let key = message.member_key();
            present.insert(key.clone());
            let update = MemberUpdate::new(channel, key, PresenceAction::Present, message.timestamp);
            if self.store.apply(update, true) != ApplyOutcome::Stale {
                summary.members_applied += 1;
            }
        }

        summary.members_pruned += self.store.retain_members(channel, |key| present.contains(key));

        match self.store.channel_mut(channel) {
            Some(state) => {
                state.expected_member_count = state.member_count() as u64;
            }
            None => {
                if had_channel {
                    summary.channels_removed += 1;
                }
            }
        }
    }
}
