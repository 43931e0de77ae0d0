// Newline-delimited JSON event source.
//
// Each line is a frame `{"queue": "<name>", "body": <envelope>}`. The body may
// be the envelope object itself or a JSON string holding it, which is how queue
// consumers usually receive message bodies. Queue names match either bare or
// with an `appId:` prefix.

use std::collections::{HashMap, VecDeque};

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

use super::{Delivery, EventSource, QueueKind};
use crate::error::SourceError;

/// Maps queue names from frames to delivery kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRouting {
    presence: String,
    occupancy: String,
}

impl QueueRouting {
    pub fn new(presence: impl Into<String>, occupancy: impl Into<String>) -> Self {
        Self { presence: presence.into(), occupancy: occupancy.into() }
    }

    pub fn kind_of(&self, queue: &str) -> Option<QueueKind> {
        let name = queue.rsplit_once(':').map_or(queue, |(_, name)| name);
        if name == self.presence {
            Some(QueueKind::Presence)
        } else if name == self.occupancy {
            Some(QueueKind::Occupancy)
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    queue: String,
    body: Value,
}

/// Settlement totals kept by a [`LineEventSource`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettlementCounts {
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
}

pub struct LineEventSource<R> {
    reader: R,
    routing: QueueRouting,
    next_tag: u64,
    unsettled: HashMap<u64, Delivery>,
    redeliver: VecDeque<Delivery>,
    counts: SettlementCounts,
    line: Vec<u8>,
}

impl<R> LineEventSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R, routing: QueueRouting) -> Self {
        Self {
            reader,
            routing,
            next_tag: 0,
            unsettled: HashMap::new(),
            redeliver: VecDeque::new(),
            counts: SettlementCounts::default(),
            line: Vec::new(),
        }
    }

    pub fn counts(&self) -> SettlementCounts {
        self.counts
    }

    pub fn unsettled(&self) -> usize {
        self.unsettled.len()
    }

    fn issue(&mut self, kind: QueueKind, payload: Vec<u8>) -> Delivery {
        self.next_tag += 1;
        let delivery = Delivery { tag: self.next_tag, kind, payload };
        self.unsettled.insert(delivery.tag, delivery.clone());
        delivery
    }

    fn parse_frame(&self, line: &str) -> Result<(QueueKind, Vec<u8>), SourceError> {
        let frame: Frame = serde_json::from_str(line)
            .map_err(|error| SourceError::Frame { reason: error.to_string() })?;
        let kind = self.routing.kind_of(&frame.queue).ok_or_else(|| SourceError::Frame {
            reason: format!("unrouted queue {}", frame.queue),
        })?;
        let payload = match frame.body {
            Value::String(text) => text.into_bytes(),
            other => serde_json::to_vec(&other)
                .map_err(|error| SourceError::Frame { reason: error.to_string() })?,
        };
        Ok((kind, payload))
    }

    async fn read_delivery(&mut self) -> Option<Result<Delivery, SourceError>> {
        if let Some(requeued) = self.redeliver.pop_front() {
            return Some(Ok(self.issue(requeued.kind, requeued.payload)));
        }

        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(error) => return Some(Err(SourceError::Io(error))),
            }

            // A line that is not UTF-8 is one bad frame, not a broken stream.
            let parsed = match std::str::from_utf8(&self.line) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => self.parse_frame(text.trim()),
                Err(error) => Err(SourceError::Frame { reason: error.to_string() }),
            };
            return Some(parsed.map(|(kind, payload)| self.issue(kind, payload)));
        }
    }
}

impl<R> EventSource for LineEventSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next(&mut self) -> Option<Result<Delivery, SourceError>> {
        self.read_delivery().await
    }

    async fn ack(&mut self, tag: u64) -> Result<(), SourceError> {
        self.unsettled.remove(&tag).ok_or(SourceError::UnknownTag(tag))?;
        self.counts.acked += 1;
        debug!(tag, "delivery acked");
        Ok(())
    }

    async fn reject(&mut self, tag: u64, requeue: bool) -> Result<(), SourceError> {
        let delivery = self.unsettled.remove(&tag).ok_or(SourceError::UnknownTag(tag))?;
        warn!(tag, requeue, queue = %delivery.kind, "delivery rejected");
        if requeue {
            self.counts.requeued += 1;
            self.redeliver.push_back(delivery);
        } else {
            self.counts.rejected += 1;
        }
        Ok(())
    }
}
