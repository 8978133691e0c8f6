//! # MQTT Integration Module
//!
//! Provides the broker side of the dashboard: one shared connection that
//! every device view multiplexes over, plus the naming scheme for device
//! topics.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and URL parsing
//! ├── error.rs            - Transport failures
//! ├── message_manager.rs  - Inbound messages and listener fan-out
//! ├── mqtt_handler.rs     - rumqttc connection, event loop, lazy provider
//! ├── topics.rs           - Device topic namer
//! └── transport.rs        - Contract the device bridge consumes
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Broker ──► EventLoop ──► MsgManager ──► broadcast ──► device listeners
//!   ▲                                                       │
//!   └──────────── AsyncClient ◄── TransportClient ◄─────────┘
//! ```
//!
//! The event loop is the only place that touches rumqttc's `EventLoop`.
//! Everything above it sees [`transport::TransportClient`], which keeps the
//! device bridge testable without a network.

pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topics;
pub mod transport;

pub use config::MqttConfig;
pub use error::TransportError;
pub use message_manager::MqttMessage;
pub use mqtt_handler::{MqttTransport, TransportProvider};
pub use topics::{DeviceTopics, TopicKind, TopicNamer};
pub use transport::{LinkState, TransportClient};
