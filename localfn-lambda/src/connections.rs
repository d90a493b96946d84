//! Connection registry for bidirectional channels
//!
//! Tracks live WebSocket-style channels by connection id. The registry is the
//! only owner of channel handles; callers address connections by id and learn
//! from the return value whether the connection still existed, which is how
//! a stale (gone) connection is reported.

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
}

/// Write side of a live channel, supplied by the transport layer
pub trait Channel: Send + Sync {
    /// Write raw bytes to the peer
    fn write(&self, payload: Bytes) -> Result<(), ChannelError>;

    /// Close the channel
    fn close(&self);
}

/// Frames delivered to the transport task owning a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelItem {
    Data(Bytes),
    Close,
}

/// Channel backed by an mpsc queue drained by the transport task
pub struct QueueChannel {
    tx: mpsc::UnboundedSender<ChannelItem>,
}

impl QueueChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Channel for QueueChannel {
    fn write(&self, payload: Bytes) -> Result<(), ChannelError> {
        self.tx
            .send(ChannelItem::Data(payload))
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        let _ = self.tx.send(ChannelItem::Close);
    }
}

/// Live channels by connection id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Box<dyn Channel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing and closing any previous one for the id
    pub fn register(&self, connection_id: impl Into<String>, channel: impl Channel + 'static) {
        let connection_id = connection_id.into();
        debug!(connection_id = %connection_id, "Registered connection");
        if let Some(previous) = self.connections.insert(connection_id, Box::new(channel)) {
            previous.close();
        }
    }

    /// Send raw bytes to a connection.
    ///
    /// Returns `None` without touching the registry when there is nothing to
    /// send, otherwise whether the connection existed.
    pub fn send(&self, connection_id: &str, payload: Option<Bytes>) -> Option<bool> {
        let payload = payload.filter(|p| !p.is_empty())?;

        let Some(channel) = self.connections.get(connection_id) else {
            debug!(connection_id = %connection_id, "Send to unknown connection");
            return Some(false);
        };

        if let Err(e) = channel.write(payload) {
            warn!(connection_id = %connection_id, error = %e, "Failed to write to connection");
        }

        Some(true)
    }

    /// Close and forget a connection. Returns whether it existed.
    pub fn remove(&self, connection_id: &str) -> bool {
        match self.connections.remove(connection_id) {
            Some((_, channel)) => {
                channel.close();
                debug!(connection_id = %connection_id, "Removed connection");
                true
            }
            None => {
                debug!(connection_id = %connection_id, "Remove of unknown connection");
                false
            }
        }
    }

    /// Forget a connection whose peer already went away, without closing it
    pub fn forget(&self, connection_id: &str) -> bool {
        self.connections.remove(connection_id).is_some()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_send_to_unknown_connection() {
        let registry = ConnectionRegistry::new();
        assert_eq!(
            registry.send("unknown-id", Some(Bytes::from_static(b"payload"))),
            Some(false)
        );
    }

    #[test]
    fn test_remove_reports_existence() {
        let registry = ConnectionRegistry::new();
        let (channel, mut rx) = QueueChannel::new();
        registry.register("abc", channel);

        assert!(registry.remove("abc"));
        assert!(!registry.remove("abc"));
        assert_eq!(rx.try_recv(), Ok(ChannelItem::Close));
    }

    #[test]
    fn test_send_nothing_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let (channel, mut rx) = QueueChannel::new();
        registry.register("abc", channel);

        assert_eq!(registry.send("abc", None), None);
        assert_eq!(registry.send("abc", Some(Bytes::new())), None);
        assert_eq!(registry.send("missing", None), None);

        assert!(registry.contains("abc"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_writes_raw_bytes() {
        let registry = ConnectionRegistry::new();
        let (channel, mut rx) = QueueChannel::new();
        registry.register("abc", channel);

        assert_eq!(registry.send("abc", Some(Bytes::from_static(b"{\"a\":1}"))), Some(true));
        assert_eq!(
            rx.try_recv(),
            Ok(ChannelItem::Data(Bytes::from_static(b"{\"a\":1}")))
        );
    }

    #[test]
    fn test_send_to_closed_peer_still_reports_existence() {
        let registry = ConnectionRegistry::new();
        let (channel, rx) = QueueChannel::new();
        registry.register("abc", channel);
        drop(rx);

        assert_eq!(registry.send("abc", Some(Bytes::from_static(b"x"))), Some(true));
    }

    #[test]
    fn test_register_replaces_previous_channel() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = QueueChannel::new();
        let (second, _second_rx) = QueueChannel::new();

        registry.register("abc", first);
        registry.register("abc", second);

        assert_eq!(registry.len(), 1);
        assert_eq!(first_rx.try_recv(), Ok(ChannelItem::Close));
    }

    #[tokio::test]
    async fn test_concurrent_send_and_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut receivers = Vec::new();
        for i in 0..32 {
            let (channel, rx) = QueueChannel::new();
            registry.register(format!("c{}", i), channel);
            receivers.push(rx);
        }

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("c{}", i % 8);
                let sent = registry.send(&id, Some(Bytes::from_static(b"hi")));
                let removed = registry.remove(&id);
                (sent, removed)
            }));
        }

        let mut removed = 0;
        for task in tasks {
            let (sent, was_removed) = task.await.unwrap();
            assert!(sent.is_some());
            if was_removed {
                removed += 1;
            }
        }

        // Each of the eight targeted ids is removed exactly once.
        assert_eq!(removed, 8);
        assert_eq!(registry.len(), 24);
    }
}
