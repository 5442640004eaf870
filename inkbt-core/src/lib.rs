/*!
 * INKBT Core
 * Bluetooth remotes and page turners for e-readers: bus control, isolated
 * input readers, per-device key bindings and power/suspend orchestration
 * Onyx Digital Intelligence Development LLC
 */

pub mod bindings;
pub mod bus;
pub mod controller;
pub mod devices;
pub mod error;
pub mod host;
pub mod input;
pub mod protocol;
pub mod reader;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use bindings::{ActionCatalog, DeviceBindings, KeyBindingsManager};
pub use bus::{BusAdapter, BusProfile, CommandRunner, DeviceRecord, SystemCommandRunner};
pub use controller::{BluetoothController, ControllerSettings, ControllerStatus, PowerState};
pub use devices::DeviceManager;
pub use error::{BluetoothError, Result};
pub use host::{ActionDispatcher, Host, Notifier, PairedDeviceSummary, PlatformHooks, SettingsStore};
pub use input::{InputDeviceHandler, SysfsDetector};
pub use reader::{BluetoothInputReader, InputEvent};
pub use scheduler::{Task, TaskQueue};
