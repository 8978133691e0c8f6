use thiserror::Error;

use crate::mqtt::error::TransportError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No device bound")]
    NoDevice,

    #[error("Device connectivity is not known yet")]
    ConnectivityUnknown,

    #[error("A command is already waiting for confirmation")]
    CommandInFlight,

    #[error("Device did not confirm within {0} seconds")]
    ConfirmationTimeout(u64),
}
