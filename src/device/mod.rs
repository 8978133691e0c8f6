//! # Device Bridge Module
//!
//! Reconciles the device's pub/sub link with the connectivity, telemetry and
//! command state the dashboard displays.
//!
//! ## Module Architecture
//!
//! ```text
//! device/
//! ├── identity.rs    - Canonical device ids from stored shapes
//! ├── status.rs      - Connectivity and the tagged status decoder
//! ├── reconciler.rs  - Status topic -> connectivity observable
//! ├── telemetry.rs   - Telemetry topic -> latest sample observable
//! ├── command.rs     - Command envelope and publisher
//! ├── tracker.rs     - Optimistic connect/disconnect machine
//! ├── watch.rs       - Per-device subscription lifecycle (statum)
//! ├── bridge.rs      - Facade binding one device at a time
//! └── error.rs       - Bridge errors
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! request_connection ──► CommandTracker ──► CommandPublisher ──► cmd topic
//!                             ▲
//! status topic ──► StatusReconciler ──┴──► connectivity
//! telemetry topic ──► TelemetryListener ──► telemetry
//! ```
//!
//! Only the reconciler writes connectivity and only the tracker writes the
//! pending command.

pub mod bridge;
pub mod command;
pub mod error;
pub mod identity;
pub mod reconciler;
pub mod status;
pub mod telemetry;
pub mod tracker;
pub mod watch;

pub use bridge::{BridgeSettings, DeviceBridge};
pub use command::{Command, CommandPublisher, MeasurementControl};
pub use error::BridgeError;
pub use identity::{normalize, DeviceId};
pub use status::Connectivity;
pub use telemetry::{Channel, TelemetrySample};
pub use tracker::{CommandState, LinkPhase};
