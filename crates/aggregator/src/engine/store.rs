// In-memory membership store: channel → members + expected occupancy.
//
// Owned exclusively by the engine. A channel only exists while it has at
// least one member; dropping a channel drops (and thereby cancels) its
// pending verification timer.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use presence_common::types::MemberKey;
use serde::Serialize;

use super::monitor::VerificationTimer;

/// A present member of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    /// Timestamp of the newest accepted event for this member. Never decreases.
    pub last_applied_timestamp: i64,
}

/// Per-channel membership and consistency state.
#[derive(Debug, Default)]
pub struct ChannelState {
    pub(crate) members: HashMap<MemberKey, Member>,
    pub(crate) expected_member_count: u64,
    pub(crate) pending_verification: Option<VerificationTimer>,
}

impl ChannelState {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn expected_member_count(&self) -> u64 {
        self.expected_member_count
    }

    pub fn member(&self, key: &MemberKey) -> Option<&Member> {
        self.members.get(key)
    }

    pub fn members(&self) -> impl Iterator<Item = (&MemberKey, &Member)> {
        self.members.iter()
    }

    pub fn has_pending_verification(&self) -> bool {
        self.pending_verification.is_some()
    }

    /// Count mismatch between tracked members and the last occupancy report.
    pub fn is_drifted(&self) -> bool {
        self.members.len() as u64 != self.expected_member_count
    }

    /// Replace any pending verification timer. The previous timer, if any, is
    /// cancelled when dropped here.
    pub(crate) fn set_verification(&mut self, timer: VerificationTimer) {
        self.pending_verification = Some(timer);
    }

    pub(crate) fn clear_verification(&mut self) -> Option<VerificationTimer> {
        self.pending_verification.take()
    }
}

#[derive(Debug, Default)]
pub struct MembershipStore {
    channels: HashMap<String, ChannelState>,
}

impl MembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, channel: &str) -> Option<&ChannelState> {
        self.channels.get(channel)
    }

    pub(crate) fn channel_mut(&mut self, channel: &str) -> Option<&mut ChannelState> {
        self.channels.get_mut(channel)
    }

    pub(crate) fn channel_or_create(&mut self, channel: &str) -> &mut ChannelState {
        match self.channels.entry(channel.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(ChannelState::default()),
        }
    }

    /// Remove a channel entry, cancelling its pending verification.
    pub(crate) fn remove_channel(&mut self, channel: &str) -> bool {
        match self.channels.remove(channel) {
            Some(mut state) => {
                drop(state.clear_verification());
                true
            }
            None => false,
        }
    }

    /// Drop members rejected by `keep`, removing the channel if it empties.
    /// Returns the number of members removed.
    pub(crate) fn retain_members<F>(&mut self, channel: &str, mut keep: F) -> usize
    where
        F: FnMut(&MemberKey) -> bool,
    {
        let Some(state) = self.channels.get_mut(channel) else {
            return 0;
        };
        let before = state.members.len();
        state.members.retain(|key, _| keep(key));
        let removed = before - state.members.len();
        if state.members.is_empty() {
            self.remove_channel(channel);
        }
        removed
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn member_count(&self) -> usize {
        self.channels.values().map(ChannelState::member_count).sum()
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Point-in-time copy of the store, sorted by channel and member.
    pub fn view(&self) -> StoreView {
        let mut channels: Vec<ChannelView> = self
            .channels
            .iter()
            .map(|(channel, state)| {
                let mut members: Vec<MemberView> = state
                    .members
                    .iter()
                    .map(|(key, member)| MemberView {
                        client_id: key.client_id.clone(),
                        connection_id: key.connection_id.clone(),
                        timestamp: member.last_applied_timestamp,
                    })
                    .collect();
                members.sort_by(|a, b| {
                    (&a.client_id, &a.connection_id).cmp(&(&b.client_id, &b.connection_id))
                });
                ChannelView {
                    channel: channel.clone(),
                    expected_member_count: state.expected_member_count,
                    members,
                }
            })
            .collect();
        channels.sort_by(|a, b| a.channel.cmp(&b.channel));
        StoreView { channels }
    }
}

/// Read-only copy of the store handed to observers (publisher, tests).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreView {
    pub channels: Vec<ChannelView>,
}

impl StoreView {
    pub fn channel(&self, channel: &str) -> Option<&ChannelView> {
        self.channels.iter().find(|view| view.channel == channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub channel: String,
    pub expected_member_count: u64,
    pub members: Vec<MemberView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub client_id: String,
    pub connection_id: String,
    pub timestamp: i64,
}
