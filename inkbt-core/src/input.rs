/*!
 * Bluetooth Input Device Handler
 * Maps bus devices to /dev/input nodes and owns the isolated readers
 */

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::DeviceRecord;
use crate::error::{BluetoothError, Result};
use crate::reader::{BluetoothInputReader, InputEvent, KeyListener};

/// Resolved sysfs devices of HID-over-Bluetooth nodes live under uhid.
pub const BLUETOOTH_MARKER: &str = "/virtual/misc/uhid/";
/// Built-in touchscreen and buttons hang off the SoC platform bus.
pub const PLATFORM_MARKER: &str = "/platform/";
pub const DEFAULT_INPUT_PATH: &str = "/dev/input/event4";
pub const DEFAULT_DEV_INPUT_DIR: &str = "/dev/input";
pub const DEFAULT_SYS_CLASS_INPUT: &str = "/sys/class/input";

pub const NEW_DEVICE_TIMEOUT: Duration = Duration::from_secs(5);
pub const NEW_DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Fired with (address, device path) when a reader opens or closes.
pub type DeviceListener = Rc<dyn Fn(&str, &Path) -> anyhow::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Bluetooth,
    Platform,
    Other,
}

pub fn classify_target(resolved: &str) -> NodeKind {
    if resolved.contains(BLUETOOTH_MARKER) {
        NodeKind::Bluetooth
    } else if resolved.contains(PLATFORM_MARKER) {
        NodeKind::Platform
    } else {
        NodeKind::Other
    }
}

/// Source of truth for which input nodes belong to Bluetooth devices.
pub trait NodeDetector {
    fn bluetooth_nodes(&self) -> Vec<PathBuf>;
    fn node_name(&self, node: &Path) -> Option<String>;
}

pub struct SysfsDetector {
    dev_dir: PathBuf,
    sys_class_input: PathBuf,
}

impl SysfsDetector {
    pub fn new(dev_dir: impl Into<PathBuf>, sys_class_input: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            sys_class_input: sys_class_input.into(),
        }
    }

    fn device_link(&self, node: &Path) -> Option<PathBuf> {
        Some(self.sys_class_input.join(node.file_name()?).join("device"))
    }

    pub fn classify(&self, node: &Path) -> Option<NodeKind> {
        let link = self.device_link(node)?;
        let resolved = fs::canonicalize(&link)
            .or_else(|_| fs::read_link(&link))
            .ok()?;
        Some(classify_target(&resolved.to_string_lossy()))
    }
}

impl Default for SysfsDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DEV_INPUT_DIR, DEFAULT_SYS_CLASS_INPUT)
    }
}

impl NodeDetector for SysfsDetector {
    fn bluetooth_nodes(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dev_dir) else {
            return Vec::new();
        };

        let mut nodes: Vec<(u32, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let index = name.strip_prefix("event")?.parse().ok()?;
                Some((index, entry.path()))
            })
            .filter(|(_, path)| self.classify(path) == Some(NodeKind::Bluetooth))
            .collect();
        nodes.sort();

        nodes.into_iter().map(|(_, path)| path).collect()
    }

    fn node_name(&self, node: &Path) -> Option<String> {
        let name = fs::read_to_string(self.device_link(node)?.join("name")).ok()?;
        Some(name.trim().to_string())
    }
}

/// How the node for a device was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    NewNode,
    NameMatch,
    SingleNode,
    DefaultPath,
    /// Several Bluetooth nodes and no way to tell them apart.
    Ambiguous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedDevice {
    pub address: String,
    pub path: PathBuf,
    pub resolution: Resolution,
}

struct IsolatedReaderEntry {
    path: PathBuf,
    reader: BluetoothInputReader,
}

pub struct InputDeviceHandler {
    detector: Box<dyn NodeDetector>,
    default_path: PathBuf,
    new_device_timeout: Duration,
    new_device_interval: Duration,
    readers: BTreeMap<String, IsolatedReaderEntry>,
    key_listeners: Vec<KeyListener>,
    open_listeners: Vec<DeviceListener>,
    close_listeners: Vec<DeviceListener>,
}

impl InputDeviceHandler {
    pub fn new(detector: Box<dyn NodeDetector>, default_path: impl Into<PathBuf>) -> Self {
        Self {
            detector,
            default_path: default_path.into(),
            new_device_timeout: NEW_DEVICE_TIMEOUT,
            new_device_interval: NEW_DEVICE_POLL_INTERVAL,
            readers: BTreeMap::new(),
            key_listeners: Vec::new(),
            open_listeners: Vec::new(),
            close_listeners: Vec::new(),
        }
    }

    pub fn with_new_device_wait(mut self, timeout: Duration, interval: Duration) -> Self {
        self.new_device_timeout = timeout;
        self.new_device_interval = interval;
        self
    }

    pub fn add_key_listener(&mut self, listener: KeyListener) {
        for entry in self.readers.values_mut() {
            entry.reader.add_listener(listener.clone());
        }
        self.key_listeners.push(listener);
    }

    pub fn on_device_open(&mut self, listener: DeviceListener) {
        self.open_listeners.push(listener);
    }

    pub fn on_device_close(&mut self, listener: DeviceListener) {
        self.close_listeners.push(listener);
    }

    pub fn find_device_by_name(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }
        self.detector
            .bluetooth_nodes()
            .into_iter()
            .find(|node| self.detector.node_name(node).as_deref() == Some(name))
    }

    pub fn auto_detect_input_device(&self) -> (PathBuf, Resolution) {
        let mut nodes = self.detector.bluetooth_nodes();
        match nodes.len() {
            0 => (self.default_path.clone(), Resolution::DefaultPath),
            1 => (nodes.remove(0), Resolution::SingleNode),
            n => {
                warn!("{} Bluetooth input nodes present, falling back to {}", n, self.default_path.display());
                (self.default_path.clone(), Resolution::Ambiguous)
            }
        }
    }

    /// Bluetooth nodes present right now, taken before a connect.
    pub fn snapshot_bluetooth_nodes(&self) -> Vec<PathBuf> {
        self.detector.bluetooth_nodes()
    }

    /// A Bluetooth node missing from `snapshot` that no reader holds yet.
    ///
    /// Never waits; the caller re-checks on its own schedule.
    pub fn new_bluetooth_input_device(&self, snapshot: &[PathBuf]) -> Option<PathBuf> {
        let node = self
            .detector
            .bluetooth_nodes()
            .into_iter()
            .find(|node| !snapshot.contains(node) && self.holder_of(node).is_none())?;
        info!("New Bluetooth input node {}", node.display());
        Some(node)
    }

    pub fn new_device_timeout(&self) -> Duration {
        self.new_device_timeout
    }

    pub fn new_device_interval(&self) -> Duration {
        self.new_device_interval
    }

    fn holder_of(&self, path: &Path) -> Option<&str> {
        self.readers
            .iter()
            .find(|(_, entry)| entry.path == path)
            .map(|(address, _)| address.as_str())
    }

    fn resolve_path(&self, device: &DeviceRecord, new_node: Option<PathBuf>) -> (PathBuf, Resolution) {
        if let Some(path) = new_node {
            return (path, Resolution::NewNode);
        }
        if let Some(path) = self.find_device_by_name(&device.name) {
            return (path, Resolution::NameMatch);
        }
        self.auto_detect_input_device()
    }

    /// Opens a reader for `device`, preferring `new_node` when one was seen.
    ///
    /// A node already read on behalf of another address is refused.
    pub fn open_isolated_input_device(
        &mut self,
        device: &DeviceRecord,
        new_node: Option<PathBuf>,
    ) -> Result<OpenedDevice> {
        let (path, resolution) = self.resolve_path(device, new_node);
        if let Some(holder) = self.holder_of(&path) {
            if holder != device.address {
                return Err(BluetoothError::NodeInUse {
                    path,
                    address: holder.to_string(),
                });
            }
        }
        let mut reader = BluetoothInputReader::open(&path)?;

        if let Some(previous) = self.readers.remove(&device.address) {
            self.finish_close(&device.address, previous);
        }

        for listener in &self.key_listeners {
            reader.add_listener(listener.clone());
        }
        self.readers.insert(
            device.address.clone(),
            IsolatedReaderEntry {
                path: path.clone(),
                reader,
            },
        );
        info!(
            "Isolated reader for {} on {} ({:?})",
            device.display_name(),
            path.display(),
            resolution
        );
        fire(&self.open_listeners, &device.address, &path);

        Ok(OpenedDevice {
            address: device.address.clone(),
            path,
            resolution,
        })
    }

    pub fn close_isolated_input_device(&mut self, address: &str) -> bool {
        match self.readers.remove(address) {
            Some(entry) => {
                self.finish_close(address, entry);
                true
            }
            None => false,
        }
    }

    pub fn close_all_isolated_readers(&mut self) {
        let entries = std::mem::take(&mut self.readers);
        for (address, entry) in entries {
            self.finish_close(&address, entry);
        }
    }

    fn finish_close(&self, address: &str, mut entry: IsolatedReaderEntry) {
        entry.reader.close();
        fire(&self.close_listeners, address, &entry.path);
    }

    /// Opens readers for connected devices that do not have one yet.
    pub fn auto_open_connected_devices(&mut self, devices: &[DeviceRecord]) -> usize {
        let mut opened = 0;
        for device in devices.iter().filter(|d| d.connected) {
            if self.readers.contains_key(&device.address) {
                continue;
            }
            match self.open_isolated_input_device(device, None) {
                Ok(_) => opened += 1,
                Err(e) => warn!("Could not reopen {}: {}", device.display_name(), e),
            }
        }
        opened
    }

    pub fn poll_isolated_readers(&mut self, timeout_ms: u16) -> Vec<InputEvent> {
        let mut events = Vec::new();
        let mut gone = Vec::new();

        for (address, entry) in self.readers.iter_mut() {
            let polled = entry.reader.poll(timeout_ms);
            events.extend(polled.into_iter().map(|mut event| {
                event.address = Some(address.clone());
                event
            }));
            if !entry.reader.is_open() {
                gone.push(address.clone());
            }
        }

        for address in gone {
            if let Some(entry) = self.readers.remove(&address) {
                self.finish_close(&address, entry);
            }
        }
        events
    }

    pub fn has_isolated_readers(&self) -> bool {
        !self.readers.is_empty()
    }

    pub fn has_reader_for(&self, address: &str) -> bool {
        self.readers.contains_key(address)
    }

    pub fn isolated_device_paths(&self) -> Vec<(String, PathBuf)> {
        self.readers
            .iter()
            .map(|(address, entry)| (address.clone(), entry.path.clone()))
            .collect()
    }
}

fn fire(listeners: &[DeviceListener], address: &str, path: &Path) {
    for listener in listeners {
        if let Err(e) = listener(address, path) {
            warn!("Device listener failed for {}: {:#}", address, e);
        }
    }
}
