//! Error definitions for the broker transport

use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`TransportClient`](super::transport::TransportClient)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Broker URL or client options could not be turned into a connection
    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),

    /// The shared connection never came up within the allowed wait
    #[error("Broker not connected after {0:?}")]
    NotConnected(Duration),

    /// The local client refused the outgoing publish
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The local client refused the subscribe request
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// The local client refused the unsubscribe request
    #[error("Unsubscribe from {topic} failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    /// The transport was shut down while the operation was pending
    #[error("Transport closed")]
    Closed,
}
