//! One measurement from start to save
//!
//! The session folds live telemetry into a display buffer, classifies it on
//! request and saves the result. Leaving the session by either path tells
//! the device to stop measuring.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classifier::{classify, Classification, Quality, SensorReading};
use super::record::{MeasurementRecord, SensorData};
use super::thresholds::Thresholds;
use crate::device::command::MeasurementControl;
use crate::device::identity::DeviceId;
use crate::device::telemetry::{Channel, TelemetrySample};
use crate::persistence::store::{DocumentStore, StoreError};

pub struct MeasurementSession {
    owner: String,
    device: DeviceId,
    store: Arc<dyn DocumentStore>,
    control: MeasurementControl,
    fallback: Thresholds,
    reading: SensorReading,
    analyzed: bool,
    quality: Option<Quality>,
    thresholds_used: Option<Thresholds>,
}

impl MeasurementSession {
    pub fn new(
        owner: impl Into<String>,
        control: MeasurementControl,
        store: Arc<dyn DocumentStore>,
        fallback: Thresholds,
    ) -> Self {
        Self {
            owner: owner.into(),
            device: control.device().clone(),
            store,
            control,
            fallback,
            reading: SensorReading::default(),
            analyzed: false,
            quality: None,
            thresholds_used: None,
        }
    }

    pub fn reading(&self) -> &SensorReading {
        &self.reading
    }

    pub fn quality(&self) -> Option<Quality> {
        self.quality
    }

    pub fn is_analyzed(&self) -> bool {
        self.analyzed
    }

    /// Folds one sample into the buffer
    ///
    /// Channels missing from the sample keep their previous value. Once
    /// analyzed, a device-reported result replaces the computed quality.
    pub fn observe(&mut self, sample: &TelemetrySample) {
        let keep = |current: Option<f64>, channel: Channel| sample.get(channel).or(current);
        self.reading = SensorReading {
            turbidity: keep(self.reading.turbidity, Channel::Turbidity),
            r: keep(self.reading.r, Channel::R),
            g: keep(self.reading.g, Channel::G),
            b: keep(self.reading.b, Channel::B),
        };

        if let (true, Some(result)) = (self.analyzed, sample.result) {
            let quality = Quality::from(result);
            if self.quality != Some(quality) {
                info!("Device reported {} for {}", quality, self.device);
            }
            self.quality = Some(quality);
        }
    }

    /// Classifies the current buffer against the stored thresholds
    pub async fn analyze(&mut self) -> Classification {
        let thresholds = self.load_thresholds().await;
        let classification = classify(&self.reading, &thresholds);

        info!(
            "Analyzed {}: {} (r_ratio {:.3})",
            self.device, classification.quality, classification.r_ratio
        );
        self.thresholds_used = Some(thresholds);
        self.analyzed = true;
        self.quality = Some(classification.quality);
        classification
    }

    /// Stores the measurement under the owner's next id, then stops the device
    pub async fn save(self) -> Result<MeasurementRecord, StoreError> {
        let result = self.insert_record().await;
        self.stop_device().await;
        result
    }

    /// Discards the measurement and stops the device
    pub async fn cancel(self) {
        info!("Measurement on {} cancelled", self.device);
        self.stop_device().await;
    }

    async fn insert_record(&self) -> Result<MeasurementRecord, StoreError> {
        let latest = self.store.latest_measurement_id(&self.owner).await?;
        let measurement_id = latest.map_or(1, |id| id + 1);

        let thresholds = self.thresholds_used.unwrap_or(self.fallback);
        let computed = classify(&self.reading, &thresholds);
        let quality = self.quality.unwrap_or(computed.quality);

        let record = MeasurementRecord {
            owner: self.owner.clone(),
            device_id: self.device.clone(),
            measurement_id,
            analyzed: self.analyzed,
            result_analyze: quality.is_good(),
            result_label: computed.quality.label(),
            r_ratio: computed.r_ratio,
            sensor_data: SensorData {
                turbidity: self.reading.turbidity.unwrap_or(0.0),
                r: self.reading.r.unwrap_or(0.0),
                g: self.reading.g.unwrap_or(0.0),
                b: self.reading.b.unwrap_or(0.0),
            },
            thresholds_used: thresholds,
            created_at: Utc::now(),
        };

        self.store.insert_measurement(record.clone()).await?;
        info!("Saved measurement {} for {}", measurement_id, self.owner);
        Ok(record)
    }

    async fn load_thresholds(&self) -> Thresholds {
        match self.store.get_thresholds().await {
            Ok(Some(document)) => Thresholds::from_document(&document, self.fallback),
            Ok(None) => {
                debug!("No stored thresholds, using fallback");
                self.fallback
            }
            Err(e) => {
                warn!("Could not load thresholds: {}", e);
                self.fallback
            }
        }
    }

    async fn stop_device(&self) {
        if let Err(e) = self.control.stop().await {
            warn!("Stop command for {} failed: {}", self.device, e);
        }
    }
}
