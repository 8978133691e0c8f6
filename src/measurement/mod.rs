//! # Measurement Module
//!
//! Turns live telemetry into a saved CPO quality measurement: a display
//! buffer, a two-rule classifier (turbidity voltage and red ratio) and the
//! record written to the document store.

pub mod classifier;
pub mod history;
pub mod record;
pub mod session;
pub mod thresholds;

pub use classifier::{classify, Classification, Quality, SensorReading};
pub use record::{MeasurementRecord, SensorData};
pub use session::MeasurementSession;
pub use thresholds::Thresholds;
