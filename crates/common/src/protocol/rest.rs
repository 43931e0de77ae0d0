// REST payloads for channel enumeration, presence snapshots and publishing.

use serde::{Deserialize, Serialize};

pub use crate::types::ChannelPresence as PresenceSetItem;

pub const PRESENCE_UPDATE_EVENT: &str = "presence-update";

/// One entry of a channel enumeration page.
///
/// Listing by id returns bare strings; the detailed listing returns objects
/// with an activity flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelListItem {
    Id(String),
    Detailed {
        #[serde(rename = "channelId")]
        channel_id: String,
        #[serde(default)]
        status: Option<ChannelStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub is_active: bool,
}

impl ChannelListItem {
    /// The channel id, or `None` when the listing marks it inactive.
    pub fn active_id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id),
            Self::Detailed { channel_id, status } => {
                if status.map_or(true, |s| s.is_active) {
                    Some(channel_id)
                } else {
                    None
                }
            }
        }
    }
}

/// Body of a message published to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMessage {
    pub name: String,
    pub data: serde_json::Value,
}

impl PublishMessage {
    pub fn presence_update(data: serde_json::Value) -> Self {
        Self { name: PRESENCE_UPDATE_EVENT.to_string(), data }
    }
}
