/*!
 * IPC Protocol
 * Newline-delimited tagged JSON between inkbtd and its clients
 */

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bus::DeviceRecord;
use crate::controller::ControllerStatus;
use crate::error::{BluetoothError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Status,
    PowerOn,
    PowerOff,
    Scan {
        #[serde(default)]
        seconds: Option<u64>,
    },
    Devices,
    Connect { address: String },
    Disconnect { address: String },
    Toggle { address: String },
    Forget { address: String },
    Bindings { address: String },
    /// Binds the next button pressed on any Bluetooth device to `action`.
    Bind { address: String, action: String },
    CancelCapture,
    Unbind { address: String, key: String },
    ClearBindings { address: String },
    Actions,
    Suspend,
    Resume,
    DismissConfirmation,
    /// Keeps the connection open and streams [`HostEvent`]s.
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Status { status: ControllerStatus },
    Devices { devices: Vec<DeviceRecord> },
    Bindings {
        address: String,
        bindings: BTreeMap<String, String>,
    },
    Actions { actions: Vec<ActionEntry> },
    Success { message: String },
    Error { message: String },
    Event { event: HostEvent },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    /// `Success` or `Error` depending on how an operation went.
    pub fn outcome(ok: bool, done: impl Into<String>, failed: impl Into<String>) -> Self {
        if ok {
            Self::success(done)
        } else {
            Self::error(failed)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: String,
    pub title: String,
}

/// What the daemon-side host hooks emit to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HostEvent {
    Dispatch {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
    },
    InputActivity,
    Info { message: String },
    Error { message: String },
    CapturePrompt { device: String, action: String },
    CapturePromptClosed,
    Confirm { message: String },
    Standby { prevented: bool },
    Wifi { on: bool },
}

/// Serializes one message, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    let line = line.trim();
    if line.is_empty() {
        return Err(BluetoothError::Protocol("empty message".to_string()));
    }
    Ok(serde_json::from_str(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_tagged_by_type() {
        let line = encode(&Request::Connect {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"Connect\",\"address\":\"AA:BB:CC:DD:EE:FF\"}\n");
    }

    #[test]
    fn scan_seconds_are_optional() {
        let request: Request = decode(r#"{"type":"Scan"}"#).unwrap();
        assert_eq!(request, Request::Scan { seconds: None });
        let request: Request = decode(r#"{"type":"Scan","seconds":20}"#).unwrap();
        assert_eq!(request, Request::Scan { seconds: Some(20) });
    }

    #[test]
    fn dispatch_event_nests_under_response() {
        let response = Response::Event {
            event: HostEvent::Dispatch {
                event: "GotoViewRel".to_string(),
                args: Some(serde_json::json!(1)),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&response).unwrap()).unwrap();
        assert_eq!(value["type"], "Event");
        assert_eq!(value["event"]["kind"], "Dispatch");
        assert_eq!(value["event"]["args"], 1);
    }

    #[test]
    fn bad_lines_are_errors() {
        assert!(matches!(decode::<Request>("  \n"), Err(BluetoothError::Protocol(_))));
        assert!(matches!(decode::<Request>(r#"{"type":"Reboot"}"#), Err(BluetoothError::Serde(_))));
    }
}
