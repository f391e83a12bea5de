use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::SinkError;

use super::{CacheMessage, CachePublisher};

#[derive(Default)]
struct Faults {
    unavailable: bool,
    failing_publishes: usize,
}

/// In-process pub/sub channel registry.
///
/// Subscribers get the raw JSON of every message published on their channel
/// after they subscribed. Clones share the same registry.
#[derive(Clone, Default)]
pub struct InMemoryPubSub {
    subscribers: Arc<Mutex<HashMap<String, Vec<Sender<String>>>>>,
    faults: Arc<Mutex<Faults>>,
    published: Arc<Mutex<Vec<(String, CacheMessage)>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel.
    pub fn subscribe(&self, channel_name: &str) -> Receiver<String> {
        let (tx, rx) = channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(channel_name.to_string())
                .or_default()
                .push(tx);
        }
        rx
    }

    /// Every message published so far, with its channel.
    pub fn published(&self) -> Vec<(String, CacheMessage)> {
        self.published.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Make every publish fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable = unavailable;
        }
    }

    pub fn fail_next_publishes(&self, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_publishes = count;
        }
    }

    fn check_faults(&self) -> Result<(), SinkError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        if faults.unavailable {
            return Err(SinkError::Unavailable("cache cluster is unreachable".into()));
        }
        if faults.failing_publishes > 0 {
            faults.failing_publishes -= 1;
            return Err(SinkError::Unavailable("injected publish failure".into()));
        }
        Ok(())
    }
}

impl CachePublisher for InMemoryPubSub {
    fn publish(
        &self,
        channel_name: &str,
        message: &CacheMessage,
        _timeout: Duration,
    ) -> Result<usize, SinkError> {
        self.check_faults()?;
        let raw = message.to_json()?;

        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        let receivers = subscribers.entry(channel_name.to_string()).or_default();
        // Subscribers that went away are dropped.
        receivers.retain(|tx| tx.send(raw.clone()).is_ok());
        let delivered = receivers.len();
        drop(subscribers);

        if let Ok(mut published) = self.published.lock() {
            published.push((channel_name.to_string(), message.clone()));
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fans_out_to_every_subscriber() {
        let pubsub = InMemoryPubSub::new();
        let a = pubsub.subscribe("channel1");
        let b = pubsub.subscribe("channel1");
        let other = pubsub.subscribe("other");

        let message = CacheMessage::new("A:1", json!({"status": "new"}), 1);
        let timeout = Duration::from_secs(1);
        assert_eq!(pubsub.publish("channel1", &message, timeout).unwrap(), 2);

        for rx in [&a, &b] {
            let raw = rx.try_recv().unwrap();
            assert_eq!(CacheMessage::from_json(&raw).unwrap(), message);
        }
        assert!(other.try_recv().is_err());
        assert_eq!(pubsub.published().len(), 1);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let pubsub = InMemoryPubSub::new();
        drop(pubsub.subscribe("channel1"));
        let message = CacheMessage::new("A:1", json!(null), 1);
        assert_eq!(
            pubsub.publish("channel1", &message, Duration::from_secs(1)).unwrap(),
            0
        );
    }

    #[test]
    fn unavailable_cluster_fails_transiently() {
        let pubsub = InMemoryPubSub::new();
        pubsub.set_unavailable(true);
        let message = CacheMessage::new("A:1", json!(null), 1);
        let err = pubsub
            .publish("channel1", &message, Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(pubsub.published().is_empty());
    }
}
