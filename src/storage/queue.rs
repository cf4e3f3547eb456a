use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::debug;

use crate::cli::config::StreamSettings;

/// Name of the single field carrying a serialized task in a stream entry
pub const PAYLOAD_FIELD: &str = "data";

/// Read only entries never delivered to any consumer of the group
pub const NEW_ENTRIES: &str = ">";

/// Read this consumer's delivered but unacknowledged entries
pub const PENDING_ENTRIES: &str = "0";

/// One entry read from a stream through a consumer group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub id: String,
    pub payload: String,
}

/// Durable stream with consumer-group reads
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Create the consumer group if it does not exist yet, creating the stream as needed
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<()>;

    /// Read up to `count` entries for this consumer, blocking up to `block`.
    ///
    /// `start` is [`NEW_ENTRIES`] or [`PENDING_ENTRIES`].
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>>;

    /// Acknowledge an entry so it leaves the group's pending list
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()>;

    /// Append a payload to the stream
    async fn publish(&self, stream: &str, payload: &str) -> Result<()>;
}

/// Redis streams implementation of MessageBus
pub struct RedisStreamBus {
    /// Redis client
    client: Client,

    /// Consumer identity inside every group
    consumer_name: String,

    /// Connection for publishing, acknowledging and group management
    conn: MultiplexedConnection,

    /// One connection per consumed stream, blocking reads must not stall each other
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisStreamBus {
    /// Create a new stream bus
    pub async fn new(client: Client, settings: &StreamSettings) -> Result<Self> {
        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            client,
            consumer_name: settings.consumer_name.clone(),
            conn,
            readers: Mutex::new(HashMap::new()),
        })
    }

    async fn reader(&self, stream: &str) -> Result<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(stream) {
            return Ok(conn.clone());
        }

        let conn = self.client.get_multiplexed_async_connection().await
            .context(format!("Failed to get Redis connection for stream {}", stream))?;
        readers.insert(stream.to_string(), conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();

        match conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0").await {
            Ok(()) => {
                debug!("Created consumer group {} on stream {}", group, stream);
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e).context(format!(
                "Failed to create consumer group {} on stream {}",
                group, stream
            )),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusMessage>> {
        let mut conn = self.reader(stream).await?;

        let options = StreamReadOptions::default()
            .group(group, &self.consumer_name)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[start], &options)
            .await
            .context(format!("Failed to read from stream {}", stream))?;

        let mut messages = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                // Entries whose payload was trimmed come back without fields
                let payload = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default();
                messages.push(BusMessage { id: entry.id, payload });
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(stream, group, &[id])
            .await
            .context(format!("Failed to acknowledge {} on stream {}", id, stream))?;
        Ok(())
    }

    async fn publish(&self, stream: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .context(format!("Failed to publish to stream {}", stream))?;

        debug!("Published {} to stream {}", id, stream);
        Ok(())
    }
}
