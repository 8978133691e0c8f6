//! Document store collaborator
//!
//! The dashboard's records (users, devices, measurements, threshold
//! configuration) live in an external document store. The bridge and the
//! measurement flow only need the handful of lookups below; [`MemoryStore`]
//! implements them in-process for the console binary and for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::device::identity::DeviceId;
use crate::measurement::record::MeasurementRecord;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("No {collection} record with id {id}")]
    NotFound { collection: &'static str, id: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A provisioned device as stored in the `devices` collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub status: Option<bool>,
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn provisioned(id: DeviceId) -> Self {
        Self {
            id,
            status: None,
            last_update: None,
        }
    }
}

/// A row of the `users` collection
///
/// `device_id` keeps the raw stored shape; it is normalized on sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<Value>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub device_id: Value,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError>;

    /// Writes the reconciled status; fails with `NotFound` for unprovisioned devices
    async fn update_device_status(
        &self,
        id: &DeviceId,
        connected: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, StoreError>;

    /// Raw threshold configuration document, if one was stored
    async fn get_thresholds(&self) -> Result<Option<Value>, StoreError>;

    /// Highest `measurement_id` recorded for `owner`
    async fn latest_measurement_id(&self, owner: &str) -> Result<Option<u64>, StoreError>;

    async fn insert_measurement(&self, record: MeasurementRecord) -> Result<(), StoreError>;

    /// Measurements of `owner` created within `[from, to)`, newest first
    async fn measurements_between(
        &self,
        owner: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRecord>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
    users: RwLock<Vec<UserRecord>>,
    thresholds: RwLock<Option<Value>>,
    measurements: RwLock<Vec<MeasurementRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, id: DeviceId) -> Self {
        self.devices
            .get_mut()
            .insert(id.clone(), DeviceRecord::provisioned(id));
        self
    }

    pub fn with_user(mut self, user: UserRecord) -> Self {
        self.users.get_mut().push(user);
        self
    }

    pub fn with_thresholds(mut self, thresholds: Value) -> Self {
        *self.thresholds.get_mut() = Some(thresholds);
        self
    }

    pub async fn insert_user(&self, user: UserRecord) {
        self.users.write().await.push(user);
    }

    pub async fn provision_device(&self, id: DeviceId) {
        self.devices
            .write()
            .await
            .entry(id.clone())
            .or_insert_with(|| DeviceRecord::provisioned(id));
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn update_device_status(
        &self,
        id: &DeviceId,
        connected: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(id).ok_or_else(|| StoreError::NotFound {
            collection: "devices",
            id: id.to_string(),
        })?;
        record.status = Some(connected);
        record.last_update = Some(at);
        debug!("Device {} status stored as {}", id, connected);
        Ok(())
    }

    async fn find_user_by_phone(&self, phone: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .find(|user| user.phone == phone)
            .cloned())
    }

    async fn get_thresholds(&self) -> Result<Option<Value>, StoreError> {
        Ok(self.thresholds.read().await.clone())
    }

    async fn latest_measurement_id(&self, owner: &str) -> Result<Option<u64>, StoreError> {
        Ok(self
            .measurements
            .read()
            .await
            .iter()
            .filter(|record| record.owner == owner)
            .map(|record| record.measurement_id)
            .max())
    }

    async fn insert_measurement(&self, record: MeasurementRecord) -> Result<(), StoreError> {
        self.measurements.write().await.push(record);
        Ok(())
    }

    async fn measurements_between(
        &self,
        owner: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MeasurementRecord>, StoreError> {
        let mut records: Vec<MeasurementRecord> = self
            .measurements
            .read()
            .await
            .iter()
            .filter(|record| {
                record.owner == owner && record.created_at >= from && record.created_at < to
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
