//! # Connection Registry
//!
//! Maps participant identities to their live outbound delivery sinks. A sink
//! is the sending half of an unbounded channel whose receiving half is owned
//! by the participant's WebSocket actor, which keeps the registry independent
//! of any particular transport.
//!
//! ## Key Features:
//! - **Last-registered wins**: a reconnect replaces the previous sink
//! - **Idempotent unregister**: safe to call from every teardown path
//! - **Best-effort send**: closed or absent sinks are reported, never retried

use crate::relay::protocol::ServerMessage;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound sink for one connected participant.
pub type MessageSink = mpsc::UnboundedSender<ServerMessage>;

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No sink registered for the identity
    NotConnected(String),
    /// Sink registered but its receiver has been dropped
    SinkClosed(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::NotConnected(id) => write!(f, "no connection for '{}'", id),
            DeliveryError::SinkClosed(id) => write!(f, "connection sink closed for '{}'", id),
        }
    }
}

/// Identity → sink table for all live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, MessageSink>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register `sink` as the delivery target for `identity`.
    ///
    /// If the identity already has a sink (stale connection, reconnect race),
    /// the new one replaces it.
    pub fn register(&self, identity: &str, sink: MessageSink) {
        let mut connections = self.connections.write().unwrap();
        if connections.insert(identity.to_string(), sink).is_some() {
            debug!(identity, "replaced existing connection sink");
        } else {
            debug!(identity, "registered connection sink");
        }
    }

    /// Remove the identity's sink. No-op if it was never registered.
    pub fn unregister(&self, identity: &str) {
        let mut connections = self.connections.write().unwrap();
        if connections.remove(identity).is_some() {
            debug!(identity, "unregistered connection sink");
        }
    }

    /// Deliver `message` to `identity`, best-effort.
    ///
    /// Never blocks and never retries. A failure means the recipient is
    /// unreachable and it is the caller's decision what to do about it.
    pub fn send(&self, identity: &str, message: ServerMessage) -> Result<(), DeliveryError> {
        let connections = self.connections.read().unwrap();
        match connections.get(identity) {
            None => Err(DeliveryError::NotConnected(identity.to_string())),
            Some(sink) => sink
                .send(message)
                .map_err(|_| DeliveryError::SinkClosed(identity.to_string())),
        }
    }

    pub fn is_connected(&self, identity: &str) -> bool {
        self.connections.read().unwrap().contains_key(identity)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (MessageSink, mpsc::UnboundedReceiver<ServerMessage>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn register_replaces_previous_sink() {
        let registry = ConnectionRegistry::new();
        let (old_tx, mut old_rx) = sink();
        let (new_tx, mut new_rx) = sink();

        registry.register("alice", old_tx);
        registry.register("alice", new_tx);
        assert_eq!(registry.connection_count(), 1);

        registry
            .send(
                "alice",
                ServerMessage::Pong { timestamp: 1 },
            )
            .unwrap();
        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.try_recv().is_ok());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = sink();
        registry.register("bob", tx);
        registry.unregister("bob");
        registry.unregister("bob");
        assert!(!registry.is_connected("bob"));
    }

    #[test]
    fn send_to_unknown_identity_fails() {
        let registry = ConnectionRegistry::new();
        let err = registry
            .send("ghost", ServerMessage::Pong { timestamp: 0 })
            .unwrap_err();
        assert_eq!(err, DeliveryError::NotConnected("ghost".to_string()));
    }

    #[test]
    fn send_to_dropped_receiver_fails() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = sink();
        registry.register("carol", tx);
        drop(rx);
        let err = registry
            .send("carol", ServerMessage::Pong { timestamp: 0 })
            .unwrap_err();
        assert_eq!(err, DeliveryError::SinkClosed("carol".to_string()));
    }
}
