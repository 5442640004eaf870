/*!
 * Error types for the INKBT core
 * Bus command failures never surface here; they fold into bool/empty results
 */

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("failed to open input device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("input device {path} is already read for {address}")]
    NodeInUse { path: PathBuf, address: String },

    #[error("settings storage error: {0}")]
    Settings(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, BluetoothError>;
