use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::StreamSettings;
use crate::storage::queue::{MessageBus, NEW_ENTRIES, PENDING_ENTRIES};
use crate::stream::flow::{Flow, Sink};
use crate::stream::params::StageStream;

/// Pause after a failed read before trying again
const READ_ERROR_DELAY: Duration = Duration::from_secs(1);

/// An entry read from a stream, pending in its consumer group until processed
pub struct Delivery {
    id: String,
    payload: String,
    bus: Arc<dyn MessageBus>,
    stage: Arc<StageStream>,
}

impl Delivery {
    /// Run `handler` on the payload, then acknowledge the entry.
    ///
    /// If the process dies before `handler` returns the entry stays pending
    /// and is delivered again when the consumer restarts.
    pub async fn process<F, Fut, T>(self, handler: F) -> T
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = T>,
    {
        let Delivery { id, payload, bus, stage } = self;
        let output = handler(payload).await;

        if let Err(e) = bus.ack(&stage.stream, &stage.group, &id).await {
            warn!("Failed to acknowledge {} on {}: {:#}", id, stage.stream, e);
        }
        output
    }
}

/// Consumer-group reader of one stream, not yet started
pub struct StreamSource {
    bus: Arc<dyn MessageBus>,
    stage: StageStream,
    settings: StreamSettings,
}

impl StreamSource {
    /// Make sure the consumer group exists
    pub async fn open(bus: Arc<dyn MessageBus>, stage: &StageStream, settings: &StreamSettings) -> Result<Self> {
        bus.ensure_consumer_group(&stage.stream, &stage.group)
            .await
            .context(format!("Failed to open source on stream {}", stage.stream))?;

        Ok(Self {
            bus,
            stage: stage.clone(),
            settings: settings.clone(),
        })
    }

    /// Spawn the read loop and expose its entries as a flow.
    ///
    /// Entries left pending by a previous run of this consumer are delivered
    /// before new ones. Nothing is acknowledged here, see [`Delivery::process`].
    /// Cancelling `cancel` stops the loop and closes the flow.
    pub fn start(self, cancel: CancellationToken) -> Flow<Delivery> {
        let capacity = self.settings.channel_capacity;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(self.read_loop(tx, cancel));
        Flow::new(rx, capacity)
    }

    async fn read_loop(self, tx: mpsc::Sender<Delivery>, cancel: CancellationToken) {
        let stage = Arc::new(self.stage.clone());
        let StageStream { stream, group } = &self.stage;
        let block = Duration::from_millis(self.settings.block_millis);
        let mut cursor = PENDING_ENTRIES.to_string();

        info!("Consuming stream {} as group {}", stream, group);

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.bus.read_group(stream, group, &cursor, self.settings.read_count, block) => read,
            };

            let messages = match read {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Failed to read stream {}: {:#}", stream, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_DELAY) => continue,
                    }
                }
            };

            if cursor != NEW_ENTRIES {
                match messages.last() {
                    Some(last) => cursor = last.id.clone(),
                    None => {
                        debug!("Pending entries of {} drained", stream);
                        cursor = NEW_ENTRIES.to_string();
                        continue;
                    }
                }
            }

            for message in messages {
                let delivery = Delivery {
                    id: message.id,
                    payload: message.payload,
                    bus: self.bus.clone(),
                    stage: stage.clone(),
                };
                let handed_off = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = tx.send(delivery) => sent.is_ok(),
                };
                if !handed_off {
                    info!("Stopped consuming stream {}", stream);
                    return;
                }
            }
        }

        info!("Stopped consuming stream {}", stream);
    }
}

/// Publishes every item it receives, serialized as JSON, to a stream
pub struct StreamSink {
    bus: Arc<dyn MessageBus>,
    stream: String,
}

impl StreamSink {
    pub fn new(bus: Arc<dyn MessageBus>, stream: &str) -> Self {
        Self {
            bus,
            stream: stream.to_string(),
        }
    }
}

impl<T: Serialize + Send + 'static> Sink<T> for StreamSink {
    fn run(self, mut input: mpsc::Receiver<T>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                let payload = match serde_json::to_string(&item) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("Failed to serialize item for {}: {}", self.stream, e);
                        continue;
                    }
                };

                if let Err(e) = self.bus.publish(&self.stream, &payload).await {
                    error!("Failed to publish to {}: {:#}", self.stream, e);
                }
            }
            debug!("Sink for {} closed", self.stream);
        })
    }
}
