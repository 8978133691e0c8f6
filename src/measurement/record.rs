use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::thresholds::Thresholds;
use crate::device::identity::DeviceId;

/// Channel values as saved with a measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    #[serde(rename = "Turbidity")]
    pub turbidity: f64,
    #[serde(rename = "R")]
    pub r: f64,
    #[serde(rename = "G")]
    pub g: f64,
    #[serde(rename = "B")]
    pub b: f64,
}

/// A row of the `measurements` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Id of the user who took the measurement
    pub owner: String,
    pub device_id: DeviceId,
    /// Per-owner sequence, starting at 1
    pub measurement_id: u64,
    /// Whether the user ran the analysis before saving
    pub analyzed: bool,
    pub result_analyze: bool,
    pub result_label: u8,
    pub r_ratio: f64,
    pub sensor_data: SensorData,
    pub thresholds_used: Thresholds,
    pub created_at: DateTime<Utc>,
}
