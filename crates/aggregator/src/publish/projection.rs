// Aggregate projections of the membership store.
//
// Each projection is a three-level map ending in the member's last applied
// timestamp, keyed in a different order so subscribers can look up presence
// by channel, by client or by connection.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::engine::store::StoreView;

/// `outer → middle → inner → timestamp`.
pub type Nested = BTreeMap<String, BTreeMap<String, BTreeMap<String, i64>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Projections {
    /// `channel → clientId → connectionId → timestamp`
    pub by_channel: Nested,
    /// `clientId → channel → connectionId → timestamp`
    pub by_client_id: Nested,
    /// `connectionId → clientId → channel → timestamp`
    pub by_connection_id: Nested,
}

impl Projections {
    pub fn from_view(view: &StoreView) -> Self {
        let mut projections = Self::default();
        for channel in &view.channels {
            for member in &channel.members {
                let (client, connection, ts) =
                    (&member.client_id, &member.connection_id, member.timestamp);
                insert(&mut projections.by_channel, &channel.channel, client, connection, ts);
                insert(&mut projections.by_client_id, client, &channel.channel, connection, ts);
                insert(&mut projections.by_connection_id, connection, client, &channel.channel, ts);
            }
        }
        projections
    }

    pub fn channel_count(&self) -> usize {
        self.by_channel.len()
    }
}

fn insert(map: &mut Nested, outer: &str, middle: &str, inner: &str, timestamp: i64) {
    map.entry(outer.to_string())
        .or_default()
        .entry(middle.to_string())
        .or_default()
        .insert(inner.to_string(), timestamp);
}
