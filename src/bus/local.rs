use super::{BusError, BusMessage, MessageBus};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// In-process bus built on tokio broadcast channels.
///
/// Besides per-channel subscriptions it offers a firehose receiving every
/// message in publish order, like a `PSUBSCRIBE *`.
pub struct LocalBus {
    capacity: usize,
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
    firehose: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            capacity,
            channels: DashMap::new(),
            firehose,
        }
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<BusMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BusMessage> {
        self.firehose.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, BusError> {
        let message = BusMessage {
            channel: channel.to_string(),
            payload,
        };

        // A send error only means nobody is listening
        let direct = self
            .channels
            .get(channel)
            .and_then(|sender| sender.send(message.clone()).ok())
            .unwrap_or(0);
        let firehose = self.firehose.send(message).unwrap_or(0);

        Ok(direct + firehose)
    }
}
