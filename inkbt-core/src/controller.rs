/*!
 * Bluetooth Controller
 * Power state machine, standby and Wi-Fi coupling, suspend/resume recovery
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bindings::{ActionCatalog, CaptureCallback, KeyBindingsManager};
use crate::bus::{BusAdapter, DeviceRecord};
use crate::devices::{DeviceManager, ScanCallback};
use crate::host::Host;
use crate::input::{InputDeviceHandler, Resolution};
use crate::scheduler::{Task, TaskQueue};

pub const RESUME_POLL_ATTEMPTS: u32 = 20;
pub const RESUME_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    PoweringOn,
    On,
    TurningOff,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub auto_resume: bool,
    pub scan_duration: Duration,
    pub resume_attempts: u32,
    pub resume_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            auto_resume: true,
            scan_duration: DEFAULT_SCAN_DURATION,
            resume_attempts: RESUME_POLL_ATTEMPTS,
            resume_interval: RESUME_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub supported: bool,
    pub power: PowerState,
    pub standby_prevented: bool,
    pub scanning: bool,
    pub capturing: bool,
    pub polling: bool,
    pub open_readers: Vec<(String, String)>,
}

/// A connected device whose input node has not shown up yet.
struct PendingOpen {
    device: DeviceRecord,
    snapshot: Vec<PathBuf>,
    deadline: Instant,
}

pub struct BluetoothController {
    host: Host,
    devices: DeviceManager,
    input: InputDeviceHandler,
    bindings: KeyBindingsManager,
    queue: TaskQueue,
    settings: ControllerSettings,
    state: PowerState,
    standby_prevented: bool,
    on_before_suspend: bool,
    wifi_on_at_resume: bool,
    pending_opens: BTreeMap<String, PendingOpen>,
}

impl BluetoothController {
    pub fn new(
        host: Host,
        bus: BusAdapter,
        mut input: InputDeviceHandler,
        catalog: &ActionCatalog,
        settings: ControllerSettings,
        now: Instant,
    ) -> Self {
        let bindings = KeyBindingsManager::new(host.settings.load_bindings(), catalog);
        bindings.attach(&mut input);

        Self {
            host,
            devices: DeviceManager::new(bus),
            input,
            bindings,
            queue: TaskQueue::new(now),
            settings,
            state: PowerState::Off,
            standby_prevented: false,
            on_before_suspend: false,
            wifi_on_at_resume: false,
            pending_opens: BTreeMap::new(),
        }
    }

    /// Adopts an adapter that is already powered and reopens connected devices.
    pub fn start(&mut self) {
        if !self.gate(false) {
            return;
        }
        if self.devices.bus().is_enabled() {
            info!("Bluetooth already enabled at startup");
            self.powered_on();
            self.reopen_connected();
        }
    }

    fn gate(&mut self, explicit: bool) -> bool {
        if self.host.platform.bluetooth_supported() {
            return true;
        }
        if explicit {
            self.host.notifier.info("Bluetooth is not supported on this device.");
        }
        false
    }

    fn require_on(&mut self) -> bool {
        if !self.gate(true) {
            return false;
        }
        if self.state != PowerState::On {
            self.host.notifier.info("Turn on Bluetooth first.");
            return false;
        }
        true
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn is_on(&self) -> bool {
        self.state == PowerState::On
    }

    pub fn standby_prevented(&self) -> bool {
        self.standby_prevented
    }

    pub fn has_isolated_readers(&self) -> bool {
        self.input.has_isolated_readers()
    }

    pub fn input_mut(&mut self) -> &mut InputDeviceHandler {
        &mut self.input
    }

    pub fn key_bindings(&self) -> &KeyBindingsManager {
        &self.bindings
    }

    /// Swaps in a re-read action catalog; bindings keep their prefixed ids.
    pub fn set_action_catalog(&mut self, catalog: &ActionCatalog) {
        self.bindings.set_action_catalog(catalog);
        info!("Action catalog reloaded, {} actions", self.bindings.actions().len());
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            supported: self.host.platform.bluetooth_supported(),
            power: self.state,
            standby_prevented: self.standby_prevented,
            scanning: self.devices.is_scanning(),
            capturing: self.bindings.is_capturing(),
            polling: self.bindings.is_polling(),
            open_readers: self
                .input
                .isolated_device_paths()
                .into_iter()
                .map(|(address, path)| (address, path.display().to_string()))
                .collect(),
        }
    }

    /// Live cache while on, remembered summaries while off.
    pub fn known_devices(&self) -> Vec<DeviceRecord> {
        if self.is_on() {
            let mut devices = self.devices.paired_devices().to_vec();
            for found in self.devices.discovered_devices() {
                if !devices.iter().any(|d| d.address == found.address) {
                    devices.push(found.clone());
                }
            }
            return devices;
        }

        let adapter = self.devices.bus().adapter_path().to_string();
        self.host
            .settings
            .load_paired_devices()
            .into_iter()
            .map(|summary| {
                let mut record = DeviceRecord::new(&adapter, &summary.address, &summary.name);
                record.paired = true;
                record
            })
            .collect()
    }

    pub fn turn_on(&mut self) -> bool {
        if !self.gate(true) {
            return false;
        }
        if self.state == PowerState::On {
            return true;
        }

        self.state = PowerState::PoweringOn;
        self.ensure_wifi();
        if !self.devices.bus().turn_on() {
            self.state = PowerState::Off;
            self.host.notifier.error("Could not turn on Bluetooth.");
            return false;
        }

        self.powered_on();
        self.host.notifier.info("Bluetooth turned on.");
        true
    }

    pub fn turn_off(&mut self, show_popup: bool) -> bool {
        if !self.gate(show_popup) {
            return false;
        }
        if self.state == PowerState::Off {
            return true;
        }

        self.state = PowerState::TurningOff;
        self.bindings.stop_polling(&mut self.queue);
        self.bindings.cancel_key_capture(&mut self.host);
        self.devices.cancel_scan(&mut self.queue);
        self.cancel_resume();
        self.cancel_pending_opens();
        self.input.close_all_isolated_readers();

        if !self.devices.bus().turn_off() {
            self.state = if self.devices.bus().is_enabled() {
                PowerState::On
            } else {
                PowerState::Off
            };
            if show_popup {
                self.host.notifier.error("Could not turn off Bluetooth.");
            }
            return false;
        }

        self.state = PowerState::Off;
        if self.standby_prevented {
            self.host.platform.allow_standby();
            self.standby_prevented = false;
        }
        info!("Bluetooth turned off");
        if show_popup {
            self.host.notifier.info("Bluetooth turned off.");
        }
        true
    }

    fn ensure_wifi(&mut self) {
        if !self.host.platform.wifi_is_on() {
            info!("Turning on Wi-Fi before Bluetooth");
            self.host.platform.wifi_turn_on();
        }
    }

    fn powered_on(&mut self) {
        self.state = PowerState::On;
        if !self.standby_prevented {
            self.host.platform.prevent_standby();
            self.standby_prevented = true;
        }
        self.devices.load_paired_devices();
        self.devices.sync_paired_devices(self.host.settings.as_mut());
    }

    fn reopen_connected(&mut self) {
        let connected = self.devices.paired_devices().to_vec();
        let opened = self.input.auto_open_connected_devices(&connected);
        debug!(opened, "reopened connected devices");
        if self.input.has_isolated_readers() {
            self.bindings.start_polling(&mut self.queue);
        }
    }

    pub fn on_suspend(&mut self) {
        if !self.gate(false) {
            return;
        }
        let resuming = self.cancel_resume();
        let on = matches!(self.state, PowerState::On | PowerState::PoweringOn);
        self.on_before_suspend = on || resuming;
        if on {
            info!("Turning Bluetooth off for suspend");
            self.turn_off(false);
        }
    }

    pub fn on_resume(&mut self) {
        if !self.gate(false) {
            return;
        }
        if !self.settings.auto_resume || !self.on_before_suspend {
            return;
        }
        self.on_before_suspend = false;
        self.queue.next_tick(Task::ResumePowerOn);
    }

    /// Drops pending resume work and reports whether a resume was underway.
    ///
    /// Once the power-on has run, Wi-Fi may have been forced on and is
    /// handed back here.
    fn cancel_resume(&mut self) -> bool {
        let waiting = self
            .queue
            .cancel_where(|task| matches!(task, Task::ResumeWait { .. }));
        let queued = self.queue.cancel_where(|task| *task == Task::ResumePowerOn);
        if waiting > 0 {
            debug!("resume interrupted while waiting for the adapter");
            self.restore_wifi_after_resume();
        }
        waiting + queued > 0
    }

    fn resume_power_on(&mut self) {
        self.state = PowerState::PoweringOn;
        self.wifi_on_at_resume = self.host.platform.wifi_is_on();
        self.ensure_wifi();
        if self.devices.bus().turn_on() {
            self.finish_resume(true);
        } else {
            self.queue
                .schedule_in(self.settings.resume_interval, Task::ResumeWait { attempt: 1 });
        }
    }

    fn resume_wait(&mut self, attempt: u32) {
        if self.devices.bus().is_enabled() {
            self.finish_resume(true);
        } else if attempt >= self.settings.resume_attempts {
            warn!("Bluetooth did not come back after {} checks", attempt);
            self.finish_resume(false);
        } else {
            self.queue.schedule_in(
                self.settings.resume_interval,
                Task::ResumeWait { attempt: attempt + 1 },
            );
        }
    }

    fn finish_resume(&mut self, enabled: bool) {
        if enabled {
            info!("Bluetooth restored after resume");
            self.powered_on();
            self.reopen_connected();
        } else {
            self.state = PowerState::Off;
        }
        self.restore_wifi_after_resume();
    }

    fn restore_wifi_after_resume(&mut self) {
        if !self.wifi_on_at_resume && !self.host.platform.wifi_restore_enabled() {
            info!("Turning Wi-Fi back off after resume");
            self.host.platform.wifi_turn_off();
        }
    }

    pub fn scan(&mut self, duration: Option<Duration>, callback: Option<ScanCallback>) -> bool {
        if !self.require_on() {
            return false;
        }
        let duration = duration.unwrap_or(self.settings.scan_duration);
        let started = self.devices.scan_for_devices(duration, callback, &mut self.queue);
        if !started && !self.devices.is_scanning() {
            self.host.notifier.error("Could not start scanning for devices.");
        }
        started
    }

    fn device(&mut self, address: &str) -> Option<DeviceRecord> {
        let found = self.devices.find_device(address).cloned();
        if found.is_none() {
            self.host
                .notifier
                .error("Device not found. Scan for devices and try again.");
        }
        found
    }

    pub fn connect(&mut self, address: &str) -> bool {
        if !self.require_on() {
            return false;
        }
        let Some(device) = self.device(address) else {
            return false;
        };
        if device.connected {
            self.host.notifier.info(&format!(
                "{} is already connected. If it does not respond, scan for devices and connect again.",
                device.display_name()
            ));
            return false;
        }

        // The uhid node usually appears while Connect is still in flight.
        let snapshot = self.input.snapshot_bluetooth_nodes();
        if !self.devices.connect_device(&device, None) {
            self.host
                .notifier
                .error(&format!("Could not connect to {}.", device.display_name()));
            return false;
        }

        let connected = self.devices.find_device(&device.address).cloned().unwrap_or(device);
        self.devices.sync_paired_devices(self.host.settings.as_mut());
        let deadline = self.queue.now() + self.input.new_device_timeout();
        self.pending_opens.insert(
            connected.address.clone(),
            PendingOpen {
                device: connected,
                snapshot,
                deadline,
            },
        );
        self.check_pending_opens();
        true
    }

    /// Opens readers for connected devices whose node appeared, or whose
    /// wait ran out, and re-checks the rest after an interval.
    fn check_pending_opens(&mut self) {
        let now = self.queue.now();
        for address in self.pending_opens.keys().cloned().collect::<Vec<_>>() {
            let Some(pending) = self.pending_opens.remove(&address) else {
                continue;
            };
            match self.input.new_bluetooth_input_device(&pending.snapshot) {
                Some(node) => self.open_input(&pending.device, Some(node)),
                None if now >= pending.deadline => {
                    info!("No new input node for {}, guessing", pending.device.display_name());
                    self.open_input(&pending.device, None);
                }
                None => {
                    self.pending_opens.insert(address, pending);
                }
            }
        }

        if !self.pending_opens.is_empty() && !self.queue.contains(Task::AwaitInputNode) {
            self.queue
                .schedule_in(self.input.new_device_interval(), Task::AwaitInputNode);
        }
    }

    fn cancel_pending_opens(&mut self) {
        self.pending_opens.clear();
        self.queue.cancel_where(|task| *task == Task::AwaitInputNode);
    }

    fn open_input(&mut self, device: &DeviceRecord, new_node: Option<PathBuf>) {
        match self.input.open_isolated_input_device(device, new_node) {
            Ok(opened) => {
                if opened.resolution == Resolution::Ambiguous {
                    self.host.notifier.info(&format!(
                        "Several Bluetooth input devices found. If buttons on {} do nothing, reconnect it.",
                        device.display_name()
                    ));
                }
                self.bindings.start_polling(&mut self.queue);
            }
            Err(e) => {
                warn!("Could not open input for {}: {}", device.display_name(), e);
                self.host.notifier.error(&format!(
                    "Connected to {}, but its buttons could not be read.",
                    device.display_name()
                ));
            }
        }
    }

    pub fn disconnect(&mut self, address: &str) -> bool {
        if !self.require_on() {
            return false;
        }
        let Some(device) = self.device(address) else {
            return false;
        };

        self.pending_opens.remove(&device.address);
        self.input.close_isolated_input_device(&device.address);
        if !self.devices.disconnect_device(&device) {
            self.host
                .notifier
                .error(&format!("Could not disconnect {}.", device.display_name()));
            return false;
        }
        self.devices.sync_paired_devices(self.host.settings.as_mut());
        true
    }

    pub fn toggle(&mut self, address: &str) -> bool {
        if !self.require_on() {
            return false;
        }
        match self.devices.find_device(address).map(|d| d.connected) {
            Some(true) => self.disconnect(address),
            Some(false) => self.connect(address),
            None => {
                self.device(address);
                false
            }
        }
    }

    pub fn forget(&mut self, address: &str) -> bool {
        if !self.require_on() {
            return false;
        }
        let Some(device) = self.device(address) else {
            return false;
        };

        self.pending_opens.remove(&device.address);
        self.input.close_isolated_input_device(&device.address);
        if !self.devices.remove_device(&device) {
            self.host
                .notifier
                .error(&format!("Could not remove {}.", device.display_name()));
            return false;
        }
        self.devices.sync_paired_devices(self.host.settings.as_mut());
        true
    }

    pub fn start_key_capture(&mut self, address: &str, action: &str, callback: Option<CaptureCallback>) -> bool {
        if !self.gate(true) {
            return false;
        }
        if self.bindings.action_title(action).is_none() {
            self.host.notifier.error(&format!("Unknown action {}.", action));
            return false;
        }
        self.bindings.start_key_capture(
            address,
            action,
            callback,
            &self.input,
            &mut self.host,
            &mut self.queue,
        );
        true
    }

    pub fn cancel_key_capture(&mut self) -> bool {
        self.bindings.cancel_key_capture(&mut self.host)
    }

    pub fn confirmation_dismissed(&mut self) {
        self.bindings.confirmation_dismissed();
    }

    pub fn device_bindings(&self, address: &str) -> BTreeMap<String, String> {
        self.bindings.device_bindings(address)
    }

    pub fn remove_binding(&mut self, address: &str, key: &str) -> bool {
        self.bindings.remove_binding(address, key, &mut self.host)
    }

    pub fn clear_device_bindings(&mut self, address: &str) -> bool {
        self.bindings.clear_device_bindings(address, &mut self.host)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.next_deadline()
    }

    /// Runs every task due at `now`. Tasks scheduled meanwhile wait for the next tick.
    pub fn tick(&mut self, now: Instant) {
        self.queue.advance(now);
        for (_, task) in self.queue.take_due() {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::BindingPoll => {
                self.bindings
                    .run_poll(&mut self.input, &mut self.host, &mut self.queue)
            }
            Task::ScanStop => {
                let found = self.devices.finish_scan();
                self.host
                    .notifier
                    .info(&format!("Found {} Bluetooth devices.", found.len()));
            }
            Task::ResumePowerOn => self.resume_power_on(),
            Task::ResumeWait { attempt } => self.resume_wait(attempt),
            Task::AwaitInputNode => self.check_pending_opens(),
        }
    }
}
