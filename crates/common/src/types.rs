// Core presence types shared across the aggregator crates.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identity of a presence member within a channel.
///
/// A member is uniquely identified by its client id and connection id. The
/// tuple itself is the map key, so no hashing scheme can collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberKey {
    pub client_id: String,
    pub connection_id: String,
}

impl MemberKey {
    pub fn new(client_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self { client_id: client_id.into(), connection_id: connection_id.into() }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.client_id, self.connection_id)
    }
}

/// How a presence action affects membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Insert or refresh the member.
    Add,
    /// Remove the member.
    Remove,
    /// Not understood; ignored for forward compatibility.
    Ignored,
}

/// A presence action as it appears on the wire.
///
/// Producers encode actions either by name (`"enter"`) or by numeric code
/// (`2`). Both forms decode to the same variant; anything else decodes to
/// [`PresenceAction::Unknown`] instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Absent,
    Present,
    Enter,
    Leave,
    Update,
    Unknown,
}

impl PresenceAction {
    pub const fn class(self) -> ActionClass {
        match self {
            Self::Present | Self::Enter | Self::Update => ActionClass::Add,
            Self::Leave => ActionClass::Remove,
            Self::Absent | Self::Unknown => ActionClass::Ignored,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Update => "update",
            Self::Unknown => "unknown",
        }
    }

    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Absent,
            1 => Self::Present,
            2 => Self::Enter,
            3 => Self::Leave,
            4 => Self::Update,
            _ => Self::Unknown,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "absent" => Self::Absent,
            "present" => Self::Present,
            "enter" => Self::Enter,
            "leave" => Self::Leave,
            "update" => Self::Update,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAction {
    Code(i64),
    Name(String),
    Other(serde_json::Value),
}

impl<'de> Deserialize<'de> for PresenceAction {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawAction::deserialize(deserializer)? {
            RawAction::Code(code) => Self::from_code(code),
            RawAction::Name(name) => Self::from_name(&name),
            RawAction::Other(_) => Self::Unknown,
        })
    }
}

impl Serialize for PresenceAction {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// A single presence message, either from the event queue or from a
/// presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub client_id: String,
    pub connection_id: String,
    pub action: PresenceAction,
    /// Event time in milliseconds since the epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PresenceMessage {
    pub fn new(
        client_id: impl Into<String>,
        connection_id: impl Into<String>,
        action: PresenceAction,
        timestamp: i64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            connection_id: connection_id.into(),
            action,
            timestamp,
            id: None,
            data: None,
        }
    }

    pub fn member_key(&self) -> MemberKey {
        MemberKey::new(self.client_id.clone(), self.connection_id.clone())
    }
}

/// The full presence set of one channel as reported by the snapshot source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPresence {
    pub channel: String,
    pub presence: Vec<PresenceMessage>,
}
