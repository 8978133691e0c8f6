//! Signed-in user and the stored session file
//!
//! Credentials are compared in plaintext against the user record, exactly
//! as the account data is provisioned. The signed-in user is kept as TOML
//! next to the dashboard config so the next start can bind its device.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::{DocumentStore, StoreError, UserRecord};
use crate::config::config_dir;
use crate::device::identity::{normalize, DeviceId};

const SESSION_FILE: &str = "session.toml";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Phone number is not registered")]
    UnknownPhone,

    #[error("Wrong password")]
    WrongPassword,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AppUser {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub company: Option<String>,
    pub device_id: Option<DeviceId>,
}

impl AppUser {
    fn from_record(record: UserRecord) -> Self {
        Self {
            device_id: normalize(&record.device_id),
            company: record.company.as_ref().and_then(company_name),
            id: record.id,
            name: record.name,
            phone: record.phone,
        }
    }
}

fn company_name(company: &Value) -> Option<String> {
    match company {
        Value::String(name) => Some(name.clone()),
        Value::Object(fields) => fields
            .get("name")
            .or_else(|| fields.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

pub async fn sign_in(
    store: &dyn DocumentStore,
    phone: &str,
    password: &str,
) -> Result<AppUser, SessionError> {
    let record = store
        .find_user_by_phone(phone)
        .await?
        .ok_or(SessionError::UnknownPhone)?;

    if record.password != password {
        return Err(SessionError::WrongPassword);
    }

    let user = AppUser::from_record(record);
    info!("Signed in {} ({})", user.name, user.id);
    Ok(user)
}

/// Location of the stored session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    path: PathBuf,
}

impl Default for SessionFile {
    fn default() -> Self {
        Self::at(config_dir().join(SESSION_FILE))
    }
}

impl SessionFile {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn store_user(&self, user: &AppUser) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
        }

        let content = toml::to_string_pretty(user)
            .map_err(|e| eyre!("Failed to serialize session: {}", e))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write session file: {}", e))?;

        debug!("Session stored at {}", self.path.display());
        Ok(())
    }

    /// The stored user, or `None` when missing or unreadable
    pub async fn load_stored_user(&self) -> Option<AppUser> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("No stored session at {}: {}", self.path.display(), e);
                return None;
            }
        };

        match toml::from_str(&content) {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Ignoring corrupt session file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub async fn sign_out(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check session file: {}", e))?
        {
            tokio::fs::remove_file(&self.path)
                .await
                .map_err(|e| eyre!("Failed to delete session file: {}", e))?;
            info!("Signed out");
        }
        Ok(())
    }
}
