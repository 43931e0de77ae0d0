// AMQP event source: the hosted presence and occupancy queues.
//
// Both queues are consumed on one broker channel with manual acknowledgement,
// so delivery tags are unique across them and settle on the same channel.

use futures_util::stream::{self, BoxStream, StreamExt};
use lapin::message::Delivery as BrokerDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};
use url::Url;

use super::{Delivery, EventSource, QueueKind};
use crate::config::ApiKey;
use crate::error::SourceError;

const CONSUMER_TAG: &str = "presence-aggregator";

/// Fully qualified queue names, `appId:name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub presence: String,
    pub occupancy: String,
}

impl QueueNames {
    pub fn for_app(app_id: &str, presence: &str, occupancy: &str) -> Self {
        Self {
            presence: format!("{app_id}:{presence}"),
            occupancy: format!("{app_id}:{occupancy}"),
        }
    }
}

/// Broker URI with the API key as credentials. `endpoint` is `host:port/vhost`
/// (TLS) or a complete `amqp://` / `amqps://` URI.
pub fn broker_uri(endpoint: &str, key: &ApiKey) -> Result<Url, SourceError> {
    let invalid = || SourceError::Endpoint { endpoint: endpoint.to_string() };
    let candidate = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("amqps://{endpoint}")
    };
    let mut uri = Url::parse(&candidate).map_err(|_| invalid())?;
    if uri.host_str().map_or(true, str::is_empty) {
        return Err(invalid());
    }
    uri.set_username(key.name()).map_err(|_| invalid())?;
    uri.set_password(Some(key.secret())).map_err(|_| invalid())?;
    Ok(uri)
}

type Deliveries = BoxStream<'static, (QueueKind, Result<BrokerDelivery, lapin::Error>)>;

pub struct AmqpEventSource {
    connection: Connection,
    channel: Channel,
    deliveries: Deliveries,
}

impl AmqpEventSource {
    /// Connect and start consuming both queues. At most `prefetch` deliveries
    /// are outstanding at once.
    pub async fn connect(
        uri: &Url,
        queues: &QueueNames,
        prefetch: u16,
    ) -> Result<Self, SourceError> {
        let connection = Connection::connect(uri.as_str(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;

        let presence = consume(&channel, &queues.presence, QueueKind::Presence).await?;
        let occupancy = consume(&channel, &queues.occupancy, QueueKind::Occupancy).await?;
        info!(
            host = uri.host_str().unwrap_or_default(),
            presence_queue = %queues.presence,
            occupancy_queue = %queues.occupancy,
            prefetch,
            "consuming from broker"
        );

        Ok(Self { connection, channel, deliveries: stream::select(presence, occupancy).boxed() })
    }

    /// Close the broker connection. Unsettled deliveries return to their queues.
    pub async fn close(self) {
        if let Err(error) = self.connection.close(200, "shutting down").await {
            warn!(error = %error, "broker connection did not close cleanly");
        }
    }
}

async fn consume(channel: &Channel, queue: &str, kind: QueueKind) -> Result<Deliveries, SourceError> {
    let consumer = channel
        .basic_consume(
            queue,
            &format!("{CONSUMER_TAG}:{kind}"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(consumer.map(move |item| (kind, item)).boxed())
}

impl EventSource for AmqpEventSource {
    async fn next(&mut self) -> Option<Result<Delivery, SourceError>> {
        let (kind, item) = self.deliveries.next().await?;
        Some(
            item.map(|delivery| Delivery { tag: delivery.delivery_tag, kind, payload: delivery.data })
                .map_err(SourceError::from),
        )
    }

    async fn ack(&mut self, tag: u64) -> Result<(), SourceError> {
        self.channel.basic_ack(tag, BasicAckOptions::default()).await?;
        debug!(tag, "delivery acked");
        Ok(())
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<(), SourceError> {
        self.channel.basic_reject(tag, BasicRejectOptions { requeue }).await?;
        warn!(tag, requeue, "delivery rejected");
        Ok(())
    }
}
