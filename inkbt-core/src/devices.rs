/*!
 * Bluetooth Device Manager
 * Paired device cache plus the scan / pair / trust / connect lifecycle
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::{BusAdapter, DeviceRecord};
use crate::host::{PairedDeviceSummary, SettingsStore};
use crate::scheduler::{Task, TaskHandle, TaskQueue};

pub type ScanCallback = Box<dyn FnOnce(&[DeviceRecord])>;
pub type ConnectCallback = Box<dyn FnOnce(&DeviceRecord)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceState {
    Unknown,
    Discovered,
    Paired,
    Trusted,
    Connected,
}

impl DeviceState {
    pub fn of(record: &DeviceRecord) -> Self {
        if record.connected {
            DeviceState::Connected
        } else if record.paired && record.trusted {
            DeviceState::Trusted
        } else if record.paired {
            DeviceState::Paired
        } else {
            DeviceState::Discovered
        }
    }
}

struct PendingScan {
    task: TaskHandle,
    callback: Option<ScanCallback>,
}

pub struct DeviceManager {
    bus: BusAdapter,
    paired: Vec<DeviceRecord>,
    discovered: Vec<DeviceRecord>,
    scan: Option<PendingScan>,
}

impl DeviceManager {
    pub fn new(bus: BusAdapter) -> Self {
        Self {
            bus,
            paired: Vec::new(),
            discovered: Vec::new(),
            scan: None,
        }
    }

    pub fn bus(&self) -> &BusAdapter {
        &self.bus
    }

    /// Replaces the cache with the paired devices the bus knows about.
    pub fn load_paired_devices(&mut self) -> usize {
        self.paired = self
            .bus
            .list_managed_objects()
            .into_iter()
            .filter(|d| d.paired)
            .collect();
        debug!(count = self.paired.len(), "loaded paired devices");
        self.paired.len()
    }

    pub fn paired_devices(&self) -> &[DeviceRecord] {
        &self.paired
    }

    pub fn discovered_devices(&self) -> &[DeviceRecord] {
        &self.discovered
    }

    pub fn find_device(&self, address: &str) -> Option<&DeviceRecord> {
        let address = crate::bus::normalize_address(address);
        self.paired
            .iter()
            .chain(self.discovered.iter())
            .find(|d| d.address == address)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    pub fn scan_for_devices(
        &mut self,
        duration: Duration,
        callback: Option<ScanCallback>,
        queue: &mut TaskQueue,
    ) -> bool {
        if self.scan.is_some() {
            info!("Scan already running");
            return false;
        }
        if !self.bus.start_discovery() {
            warn!("Could not start Bluetooth discovery");
            return false;
        }

        info!("Scanning for Bluetooth devices for {}s", duration.as_secs());
        self.scan = Some(PendingScan {
            task: queue.schedule_in(duration, Task::ScanStop),
            callback,
        });
        true
    }

    pub fn cancel_scan(&mut self, queue: &mut TaskQueue) {
        if let Some(scan) = self.scan.take() {
            queue.cancel(scan.task);
            self.bus.stop_discovery();
        }
    }

    /// Ends discovery and reports every named device the bus now knows.
    pub fn finish_scan(&mut self) -> Vec<DeviceRecord> {
        let callback = self.scan.take().and_then(|scan| scan.callback);
        if !self.bus.stop_discovery() {
            debug!("StopDiscovery failed, continuing with results");
        }

        let all = self.bus.list_managed_objects();
        self.paired = all.iter().filter(|d| d.paired).cloned().collect();
        self.discovered = all.into_iter().filter(|d| !d.name.is_empty()).collect();
        info!("Scan found {} named devices", self.discovered.len());

        if let Some(callback) = callback {
            callback(&self.discovered);
        }
        self.discovered.clone()
    }

    /// Pair if needed, trust, connect, then confirm with a fresh read.
    pub fn connect_device(&mut self, device: &DeviceRecord, on_success: Option<ConnectCallback>) -> bool {
        if device.connected {
            info!("{} already connected, not reconnecting", device.display_name());
            return false;
        }

        if !device.paired && !self.bus.pair(&device.bus_path) {
            error!("Pairing with {} failed", device.display_name());
            return false;
        }
        if !device.trusted && !self.bus.trust(&device.bus_path) {
            warn!("Could not trust {}", device.display_name());
        }
        if !self.bus.connect(&device.bus_path) {
            error!("Connecting to {} failed", device.display_name());
            return false;
        }

        match self.confirm(device, |d| d.connected) {
            Some(record) => {
                info!("Connected to {}", record.display_name());
                self.upsert(record.clone());
                if let Some(callback) = on_success {
                    callback(&record);
                }
                true
            }
            None => {
                warn!("{} did not report a connection", device.display_name());
                false
            }
        }
    }

    pub fn disconnect_device(&mut self, device: &DeviceRecord) -> bool {
        if !self.bus.disconnect(&device.bus_path) {
            error!("Disconnecting {} failed", device.display_name());
            return false;
        }

        match self.confirm(device, |d| !d.connected) {
            Some(record) => {
                info!("Disconnected {}", record.display_name());
                self.upsert(record);
                true
            }
            None => false,
        }
    }

    pub fn toggle_connection(&mut self, device: &DeviceRecord, on_success: Option<ConnectCallback>) -> bool {
        if device.connected {
            self.disconnect_device(device)
        } else {
            self.connect_device(device, on_success)
        }
    }

    /// Forgets the device on the bus; confirmed once its object is gone.
    pub fn remove_device(&mut self, device: &DeviceRecord) -> bool {
        if !self.bus.remove(&device.bus_path) {
            error!("Removing {} failed", device.display_name());
            return false;
        }
        if self.bus.device_properties(&device.bus_path).is_some() {
            warn!("{} still present after removal", device.display_name());
            return false;
        }

        self.paired.retain(|d| d.address != device.address);
        self.discovered.retain(|d| d.address != device.address);
        info!("Removed {}", device.display_name());
        true
    }

    pub fn sync_paired_devices(&self, settings: &mut dyn SettingsStore) {
        let summaries: Vec<PairedDeviceSummary> = self
            .paired
            .iter()
            .map(|d| PairedDeviceSummary {
                address: d.address.clone(),
                name: d.name.clone(),
            })
            .collect();
        if let Err(e) = settings.save_paired_devices(&summaries) {
            error!("Failed to save paired devices: {}", e);
        }
    }

    fn confirm(&self, device: &DeviceRecord, expected: impl Fn(&DeviceRecord) -> bool) -> Option<DeviceRecord> {
        self.bus
            .device_properties(&device.bus_path)
            .filter(|record| expected(record))
    }

    fn upsert(&mut self, record: DeviceRecord) {
        if let Some(known) = self.discovered.iter_mut().find(|d| d.address == record.address) {
            *known = record.clone();
        }
        match self.paired.iter_mut().find(|d| d.address == record.address) {
            Some(known) => *known = record,
            None if record.paired => self.paired.push(record),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusProfile;
    use crate::testing::{fake_host, FakeBus};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    fn manager(bus: &FakeBus) -> DeviceManager {
        DeviceManager::new(bus.adapter(BusProfile::Vendor))
    }

    #[test]
    fn load_keeps_only_paired_in_dump_order() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, false);
        bus.add_device("AA:00:00:00:00:02", "Speaker", false, false);
        bus.add_device("AA:00:00:00:00:03", "Keyboard", true, false);

        let mut devices = manager(&bus);
        assert_eq!(devices.load_paired_devices(), 2);
        let names: Vec<&str> = devices.paired_devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Remote", "Keyboard"]);
    }

    #[test]
    fn connect_runs_pair_trust_connect_in_order() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", false, false);
        let mut devices = manager(&bus);
        let mut queue = TaskQueue::new(Instant::now());
        devices.scan_for_devices(Duration::from_secs(1), None, &mut queue);
        let target = devices.finish_scan().remove(0);

        let confirmed = Rc::new(RefCell::new(None));
        let sink = confirmed.clone();
        bus.clear_log();
        assert!(devices.connect_device(
            &target,
            Some(Box::new(move |d: &DeviceRecord| *sink.borrow_mut() = Some(d.clone())))
        ));

        let mutations = bus.mutations();
        assert_eq!(
            mutations,
            vec![
                "org.bluez.Device1.Pair".to_string(),
                "org.freedesktop.DBus.Properties.Set".to_string(),
                "org.bluez.Device1.Connect".to_string(),
            ]
        );
        let record = confirmed.borrow().clone().unwrap();
        assert_eq!(DeviceState::of(&record), DeviceState::Connected);
        assert_eq!(devices.paired_devices().len(), 1);
    }

    #[test]
    fn connect_on_connected_record_issues_nothing() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, true);
        let mut devices = manager(&bus);
        devices.load_paired_devices();
        let target = devices.paired_devices()[0].clone();
        assert!(target.connected);

        bus.clear_log();
        assert!(!devices.connect_device(&target, None));
        assert!(bus.mutations().is_empty());
    }

    #[test]
    fn unconfirmed_connect_is_a_failure() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, false);
        bus.state.borrow_mut().connect_sticks = false;
        let mut devices = manager(&bus);
        devices.load_paired_devices();
        let target = devices.paired_devices()[0].clone();

        let called = Rc::new(RefCell::new(false));
        let sink = called.clone();
        assert!(!devices.connect_device(&target, Some(Box::new(move |_: &DeviceRecord| *sink.borrow_mut() = true))));
        assert!(!*called.borrow());
    }

    #[test]
    fn disconnect_keeps_trust() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, true);
        let mut devices = manager(&bus);
        devices.load_paired_devices();
        let target = devices.paired_devices()[0].clone();

        assert!(devices.toggle_connection(&target, None));
        let after = devices.find_device("aa:00:00:00:00:01").unwrap();
        assert_eq!(DeviceState::of(after), DeviceState::Trusted);
    }

    #[test]
    fn remove_drops_cache_entry() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, false);
        let mut devices = manager(&bus);
        devices.load_paired_devices();
        let target = devices.paired_devices()[0].clone();

        assert!(devices.remove_device(&target));
        assert!(devices.find_device(&target.address).is_none());
        assert_eq!(devices.load_paired_devices(), 0);
    }

    #[test]
    fn scan_reports_named_devices_after_the_window() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, false);
        bus.add_device("AA:00:00:00:00:02", "", false, false);
        bus.add_device("AA:00:00:00:00:03", "Keyboard", false, false);
        let mut devices = manager(&bus);
        let start = Instant::now();
        let mut queue = TaskQueue::new(start);

        let found = Rc::new(RefCell::new(Vec::new()));
        let sink = found.clone();
        assert!(devices.scan_for_devices(
            Duration::from_secs(10),
            Some(Box::new(move |list: &[DeviceRecord]| sink.borrow_mut().extend_from_slice(list))),
            &mut queue,
        ));
        assert!(!devices.scan_for_devices(Duration::from_secs(10), None, &mut queue));
        assert!(bus.methods().contains(&"org.bluez.Adapter1.StartDiscovery".to_string()));

        queue.advance(start + Duration::from_secs(10));
        assert_eq!(queue.take_due().len(), 1);
        devices.finish_scan();

        assert!(bus.methods().contains(&"org.bluez.Adapter1.StopDiscovery".to_string()));
        let names: Vec<String> = found.borrow().iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["Remote".to_string(), "Keyboard".to_string()]);
        assert!(!devices.is_scanning());
    }

    #[test]
    fn sync_writes_address_and_name() {
        let bus = FakeBus::new();
        bus.add_device("AA:00:00:00:00:01", "Remote", true, false);
        let mut devices = manager(&bus);
        devices.load_paired_devices();
        let (mut host, log) = fake_host();

        devices.sync_paired_devices(host.settings.as_mut());
        let saved = log.borrow().saved_paired.last().cloned().unwrap();
        assert_eq!(
            saved,
            vec![PairedDeviceSummary {
                address: "AA:00:00:00:00:01".to_string(),
                name: "Remote".to_string()
            }]
        );
    }
}
