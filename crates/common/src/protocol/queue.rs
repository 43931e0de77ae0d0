// Envelopes delivered on the presence and occupancy queues.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PresenceMessage;

/// A batch of presence messages for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEnvelope {
    pub channel: String,
    pub presence: Vec<PresenceMessage>,
}

/// Channel occupancy metrics. Only `presence_members` drives reconciliation;
/// the rest are carried for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OccupancyMetrics {
    pub connections: u64,
    pub publishers: u64,
    pub subscribers: u64,
    pub presence_connections: u64,
    pub presence_members: u64,
    pub presence_subscribers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occupancy {
    pub metrics: OccupancyMetrics,
}

/// One or more occupancy reports for a channel, applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEnvelope {
    pub channel: String,
    pub occupancy: Vec<Occupancy>,
}

impl OccupancyEnvelope {
    pub fn single(channel: impl Into<String>, presence_members: u64) -> Self {
        Self {
            channel: channel.into(),
            occupancy: vec![Occupancy {
                metrics: OccupancyMetrics { presence_members, ..OccupancyMetrics::default() },
            }],
        }
    }

    /// Expected member counts in delivery order.
    pub fn expected_counts(&self) -> impl Iterator<Item = u64> + '_ {
        self.occupancy.iter().map(|entry| entry.metrics.presence_members)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has an empty channel name")]
    EmptyChannel,
}

pub fn decode_presence(payload: &[u8]) -> Result<PresenceEnvelope, DecodeError> {
    let envelope: PresenceEnvelope = serde_json::from_slice(payload)?;
    if envelope.channel.is_empty() {
        return Err(DecodeError::EmptyChannel);
    }
    Ok(envelope)
}

pub fn decode_occupancy(payload: &[u8]) -> Result<OccupancyEnvelope, DecodeError> {
    let envelope: OccupancyEnvelope = serde_json::from_slice(payload)?;
    if envelope.channel.is_empty() {
        return Err(DecodeError::EmptyChannel);
    }
    Ok(envelope)
}
