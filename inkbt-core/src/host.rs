/*!
 * Host Contracts
 * What the e-reader application provides to the Bluetooth subsystem
 */

use serde::{Deserialize, Serialize};

use crate::bindings::DeviceBindings;
use crate::error::Result;

/// Address and name of a paired device, as remembered between sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDeviceSummary {
    pub address: String,
    pub name: String,
}

/// Two independent slots; the host decides when storage is flushed.
pub trait SettingsStore {
    fn load_bindings(&self) -> DeviceBindings;
    fn save_bindings(&mut self, bindings: &DeviceBindings) -> Result<()>;
    fn load_paired_devices(&self) -> Vec<PairedDeviceSummary>;
    fn save_paired_devices(&mut self, devices: &[PairedDeviceSummary]) -> Result<()>;
}

pub trait ActionDispatcher {
    fn dispatch(&mut self, event: &str, args: Option<&serde_json::Value>);
    /// Resets the host's idle and auto-suspend timers.
    fn notify_input_activity(&mut self);
}

pub trait PlatformHooks {
    fn bluetooth_supported(&self) -> bool;
    fn prevent_standby(&mut self);
    fn allow_standby(&mut self);
    fn wifi_is_on(&self) -> bool;
    fn wifi_turn_on(&mut self);
    fn wifi_turn_off(&mut self);
    /// The host brings Wi-Fi back by itself after resume.
    fn wifi_restore_enabled(&self) -> bool;
}

/// Short-lived, dismissible user messages.
pub trait Notifier {
    fn info(&mut self, message: &str);
    fn error(&mut self, message: &str);
    /// Cancelable "press a button" prompt shown while capturing.
    fn capture_prompt(&mut self, device: &str, action: &str);
    fn close_capture_prompt(&mut self);
    /// Confirmation whose dismissal the host reports back to the controller.
    fn confirm(&mut self, message: &str);
}

pub struct Host {
    pub settings: Box<dyn SettingsStore>,
    pub dispatcher: Box<dyn ActionDispatcher>,
    pub platform: Box<dyn PlatformHooks>,
    pub notifier: Box<dyn Notifier>,
}
