// Update application: timestamp-ordered insert/refresh/remove of members.
//
// Events for the same member may arrive duplicated or out of order, so every
// add and remove is checked against the member's last applied timestamp.
// Ties are accepted: a repeated add is an idempotent refresh and a leave with
// the same timestamp as the last add removes the member.

use std::collections::hash_map::Entry;

use presence_common::types::{ActionClass, MemberKey, PresenceAction};

use super::store::{Member, MembershipStore};

/// A single membership change addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberUpdate<'a> {
    pub channel: &'a str,
    pub key: MemberKey,
    pub action: PresenceAction,
    pub timestamp: i64,
}

impl<'a> MemberUpdate<'a> {
    pub fn new(channel: &'a str, key: MemberKey, action: PresenceAction, timestamp: i64) -> Self {
        Self { channel, key, action, timestamp }
    }
}

/// What `apply` did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new member was added.
    Inserted,
    /// An existing member's timestamp was refreshed.
    Refreshed,
    /// A member was removed and the channel still has members.
    Removed,
    /// The last member was removed and the channel entry was dropped.
    ChannelRemoved,
    /// Older than the member's last applied event; discarded.
    Stale,
    /// Unrecognized action; ignored.
    Ignored,
    /// Leave for a member (or channel) that is not tracked.
    Absent,
}

impl ApplyOutcome {
    pub const fn mutated(self) -> bool {
        matches!(self, Self::Inserted | Self::Refreshed | Self::Removed | Self::ChannelRemoved)
    }

    /// True when the channel still exists after a mutation and may need
    /// re-verification.
    pub const fn needs_verification(self) -> bool {
        matches!(self, Self::Inserted | Self::Refreshed | Self::Removed)
    }
}

impl MembershipStore {
    /// Apply one membership change.
    ///
    /// `authoritative` marks changes coming from a presence snapshot: the
    /// channel's expected member count is then reset to its actual size.
    pub fn apply(&mut self, update: MemberUpdate<'_>, authoritative: bool) -> ApplyOutcome {
        let class = update.action.class();
        if class == ActionClass::Ignored {
            return ApplyOutcome::Ignored;
        }

        let stale = self
            .channel(update.channel)
            .and_then(|state| state.member(&update.key))
            .is_some_and(|member| update.timestamp < member.last_applied_timestamp);
        if stale {
            return ApplyOutcome::Stale;
        }

        match class {
            ActionClass::Add => {
                let state = self.channel_or_create(update.channel);
                let outcome = match state.members.entry(update.key) {
                    Entry::Occupied(entry) => {
                        entry.into_mut().last_applied_timestamp = update.timestamp;
                        ApplyOutcome::Refreshed
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(Member { last_applied_timestamp: update.timestamp });
                        ApplyOutcome::Inserted
                    }
                };
                if authoritative {
                    state.expected_member_count = state.members.len() as u64;
                }
                outcome
            }
            ActionClass::Remove => {
                let Some(state) = self.channel_mut(update.channel) else {
                    return ApplyOutcome::Absent;
                };
                if state.members.remove(&update.key).is_none() {
                    return ApplyOutcome::Absent;
                }
                if state.members.is_empty() {
                    self.remove_channel(update.channel);
                    return ApplyOutcome::ChannelRemoved;
                }
                if authoritative {
                    state.expected_member_count = state.members.len() as u64;
                }
                ApplyOutcome::Removed
            }
            ActionClass::Ignored => ApplyOutcome::Ignored,
        }
    }
}
