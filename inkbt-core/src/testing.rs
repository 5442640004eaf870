/*!
 * Test Fakes
 * Scripted bus, FIFO-backed event nodes, sysfs trees and a recording host
 */

use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::TempDir;

use crate::bindings::{ActionCatalog, DeviceBindings};
use crate::bus::{BusAdapter, BusProfile, CommandRunner, DeviceRecord, DEFAULT_ADAPTER_PATH};
use crate::error::Result;
use crate::host::{ActionDispatcher, Host, Notifier, PairedDeviceSummary, PlatformHooks, SettingsStore};
use crate::input::{NodeDetector, SysfsDetector};
use crate::reader::{InputEvent, EVENT_SIZE, EV_KEY, SOURCE_BLUETOOTH, TIME_FIELD_SIZE};

const READ_ONLY_METHODS: [&str; 5] = [
    "org.freedesktop.DBus.Properties.Get",
    "org.freedesktop.DBus.Properties.GetAll",
    "org.freedesktop.DBus.ObjectManager.GetManagedObjects",
    "org.freedesktop.DBus.ListNames",
    "org.freedesktop.DBus.ListActivatableNames",
];

pub type Timeline = Rc<RefCell<Vec<String>>>;

pub struct BusState {
    pub powered: bool,
    /// Set Powered true has no effect.
    pub power_sticks: bool,
    /// Powered queries that still answer false after a power change.
    pub power_latency: u32,
    pub connect_sticks: bool,
    pub fail_all: bool,
    pub vendor_registered: bool,
    pub devices: Vec<DeviceRecord>,
    pub log: Vec<Vec<String>>,
}

impl Default for BusState {
    fn default() -> Self {
        Self {
            powered: false,
            power_sticks: true,
            power_latency: 0,
            connect_sticks: true,
            fail_all: false,
            vendor_registered: false,
            devices: Vec::new(),
            log: Vec::new(),
        }
    }
}

/// In-memory Bluetooth daemon answering dbus-send argv the way the real one prints.
#[derive(Clone, Default)]
pub struct FakeBus {
    pub state: Rc<RefCell<BusState>>,
    timeline: Timeline,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(&self, profile: BusProfile) -> BusAdapter {
        BusAdapter::new(Box::new(self.clone()), profile, DEFAULT_ADAPTER_PATH)
    }

    /// Shared with the fake host so bus calls and platform hooks interleave.
    pub fn timeline(&self) -> Timeline {
        self.timeline.clone()
    }

    pub fn add_device(&self, address: &str, name: &str, paired: bool, connected: bool) {
        let mut record = DeviceRecord::new(DEFAULT_ADAPTER_PATH, address, name);
        record.paired = paired;
        record.trusted = paired;
        record.connected = connected;
        self.state.borrow_mut().devices.push(record);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().log.iter().map(|argv| argv.join(" ")).collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.state
            .borrow()
            .log
            .iter()
            .filter_map(|argv| split_call(argv).map(|(_, method, _)| method.to_string()))
            .collect()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.methods()
            .into_iter()
            .filter(|m| !READ_ONLY_METHODS.contains(&m.as_str()))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
        self.timeline.borrow_mut().clear();
    }
}

fn split_call(argv: &[String]) -> Option<(&str, &str, Vec<&str>)> {
    let mut positional = argv.iter().filter(|a| !a.starts_with("--")).map(String::as_str);
    let path = positional.next()?;
    let method = positional.next()?;
    Some((path, method, positional.collect()))
}

impl CommandRunner for FakeBus {
    fn run(&self, _program: &str, args: &[String]) -> Option<String> {
        let mut state = self.state.borrow_mut();
        state.log.push(args.to_vec());
        let (path, method, rest) = split_call(args)?;
        self.timeline.borrow_mut().push(method.to_string());
        if state.fail_all {
            return None;
        }

        let device = state.devices.iter().position(|d| d.bus_path == path);
        match method {
            "org.freedesktop.DBus.ListNames" | "org.freedesktop.DBus.ListActivatableNames" => {
                let mut names = String::from("   array [\n      string \"org.freedesktop.DBus\"\n");
                if state.vendor_registered {
                    names.push_str("      string \"com.kobo.mtk.bluedroid\"\n");
                }
                names.push_str("   ]\n");
                Some(names)
            }
            "org.freedesktop.DBus.Properties.Get" => {
                let powered = if state.power_latency > 0 {
                    state.power_latency -= 1;
                    false
                } else {
                    state.powered
                };
                Some(format!("   variant       boolean {}\n", powered))
            }
            "org.freedesktop.DBus.Properties.Set" => {
                let value = rest.get(2).map_or(false, |v| v.ends_with("true"));
                match (rest.first().copied(), rest.get(1).copied()) {
                    (Some("string:org.bluez.Adapter1"), Some("string:Powered")) => {
                        if !value || state.power_sticks {
                            state.powered = value;
                        }
                    }
                    (Some("string:org.bluez.Device1"), Some("string:Trusted")) => {
                        state.devices.get_mut(device?)?.trusted = value;
                    }
                    _ => return None,
                }
                Some(String::new())
            }
            "org.freedesktop.DBus.ObjectManager.GetManagedObjects" => {
                Some(render_managed_objects(&state.devices))
            }
            "org.freedesktop.DBus.Properties.GetAll" => {
                Some(render_properties(&state.devices[device?], "   "))
            }
            "org.bluez.Device1.Pair" => {
                state.devices.get_mut(device?)?.paired = true;
                Some(String::new())
            }
            "org.bluez.Device1.Connect" => {
                let sticks = state.connect_sticks;
                let record = state.devices.get_mut(device?)?;
                if sticks {
                    record.connected = true;
                }
                Some(String::new())
            }
            "org.bluez.Device1.Disconnect" => {
                state.devices.get_mut(device?)?.connected = false;
                Some(String::new())
            }
            "org.bluez.Adapter1.RemoveDevice" => {
                let target = rest.first()?.strip_prefix("objpath:")?.to_string();
                let before = state.devices.len();
                state.devices.retain(|d| d.bus_path != target);
                (state.devices.len() != before).then(String::new)
            }
            "org.bluez.Adapter1.StartDiscovery"
            | "org.bluez.Adapter1.StopDiscovery"
            | "com.kobo.bluetooth.BluedroidManager1.On"
            | "com.kobo.bluetooth.BluedroidManager1.Off" => Some(String::new()),
            _ => None,
        }
    }
}

fn render_properties(record: &DeviceRecord, indent: &str) -> String {
    let mut out = format!("{}array [\n", indent);
    let mut entry = |key: &str, value: String| {
        out.push_str(&format!(
            "{i}   dict entry(\n{i}      string \"{k}\"\n{i}      variant             {v}\n{i}   )\n",
            i = indent,
            k = key,
            v = value
        ));
    };
    entry("Address", format!("string \"{}\"", record.address));
    if !record.name.is_empty() {
        entry("Name", format!("string \"{}\"", record.name));
    }
    entry("Paired", format!("boolean {}", record.paired));
    entry("Connected", format!("boolean {}", record.connected));
    entry("Trusted", format!("boolean {}", record.trusted));
    out.push_str(&format!("{}]\n", indent));
    out
}

/// Prints records the way `GetManagedObjects --print-reply` does.
pub fn render_managed_objects(records: &[DeviceRecord]) -> String {
    let mut out = String::from("method return time=1700000000.1 sender=:1.4 -> destination=:1.9 serial=12 reply_serial=2\n   array [\n");
    for record in records {
        out.push_str("      dict entry(\n");
        out.push_str(&format!("         object path \"{}\"\n", record.bus_path));
        out.push_str("         array [\n            dict entry(\n               string \"org.bluez.Device1\"\n");
        out.push_str(&render_properties(record, "               "));
        out.push_str("            )\n         ]\n      )\n");
    }
    out.push_str("   ]\n");
    out
}

/// A named pipe standing in for `/dev/input/eventN`.
pub struct FakeEventDevice {
    _dir: TempDir,
    path: PathBuf,
}

impl FakeEventDevice {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("event4");
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Needs a reader on the other end, otherwise the open blocks.
    pub fn writer(&self) -> File {
        OpenOptions::new().write(true).open(&self.path).unwrap()
    }
}

pub fn write_events(writer: &mut File, events: &[(u16, u16, i32)]) {
    for &(event_type, code, value) in events {
        writer.write_all(&encode_event(event_type, code, value)).unwrap();
    }
    writer.flush().unwrap();
}

/// Lays out one `input_event` the way the kernel writes it on this target.
fn encode_event(event_type: u16, code: u16, value: i32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(EVENT_SIZE);
    for field in [1_700_000_000i64, 250_000] {
        if TIME_FIELD_SIZE == 4 {
            bytes.extend_from_slice(&(field as i32).to_ne_bytes());
        } else {
            bytes.extend_from_slice(&field.to_ne_bytes());
        }
    }
    bytes.extend_from_slice(&event_type.to_ne_bytes());
    bytes.extend_from_slice(&code.to_ne_bytes());
    bytes.extend_from_slice(&value.to_ne_bytes());
    assert_eq!(bytes.len(), EVENT_SIZE);
    bytes
}

/// Answers `bluetooth_nodes` from a script; the last list repeats forever.
pub struct ScriptedDetector {
    scans: Vec<Vec<PathBuf>>,
    next: Cell<usize>,
}

impl ScriptedDetector {
    pub fn fixed(nodes: Vec<&str>) -> Self {
        Self::sequence(vec![nodes])
    }

    pub fn sequence(scans: Vec<Vec<&str>>) -> Self {
        Self {
            scans: scans
                .into_iter()
                .map(|scan| scan.into_iter().map(PathBuf::from).collect())
                .collect(),
            next: Cell::new(0),
        }
    }
}

impl NodeDetector for ScriptedDetector {
    fn bluetooth_nodes(&self) -> Vec<PathBuf> {
        let index = self.next.get().min(self.scans.len().saturating_sub(1));
        self.next.set(self.next.get() + 1);
        self.scans.get(index).cloned().unwrap_or_default()
    }

    fn node_name(&self, _node: &Path) -> Option<String> {
        None
    }
}

/// Miniature `/dev/input` + `/sys/class/input` tree.
pub struct SysfsFixture {
    root: TempDir,
}

impl SysfsFixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("dev")).unwrap();
        fs::create_dir_all(root.path().join("sys")).unwrap();
        Self { root }
    }

    pub fn add_platform_node(&self, event: &str, name: &str) {
        let target = self
            .root
            .path()
            .join("devices/platform")
            .join(name)
            .join("input")
            .join(input_name(event));
        self.add_node(event, name, &target);
    }

    pub fn add_bluetooth_node(&self, event: &str, name: &str) {
        let target = self
            .root
            .path()
            .join("devices/virtual/misc/uhid")
            .join(format!("0005:2DC8:9021.{:04}", event_index(event)))
            .join("input")
            .join(input_name(event));
        self.add_node(event, name, &target);
    }

    fn add_node(&self, event: &str, name: &str, target: &Path) {
        fs::create_dir_all(target).unwrap();
        fs::write(target.join("name"), format!("{}\n", name)).unwrap();

        let class_dir = self.root.path().join("sys").join(event);
        fs::create_dir_all(&class_dir).unwrap();
        symlink(target, class_dir.join("device")).unwrap();
        File::create(self.node(event)).unwrap();
    }

    pub fn node(&self, event: &str) -> PathBuf {
        self.root.path().join("dev").join(event)
    }

    pub fn detector(&self) -> SysfsDetector {
        SysfsDetector::new(self.root.path().join("dev"), self.root.path().join("sys"))
    }
}

fn event_index(event: &str) -> u32 {
    event.trim_start_matches("event").parse().unwrap_or(0)
}

fn input_name(event: &str) -> String {
    format!("input{}", event_index(event))
}

#[derive(Debug)]
pub struct HostRecord {
    pub dispatched: Vec<(String, Option<Value>)>,
    pub activity: usize,
    pub prompts: usize,
    pub prompt_closes: usize,
    pub confirms: Vec<String>,
    pub infos: Vec<String>,
    pub errors: Vec<String>,
    pub saved_bindings: Vec<DeviceBindings>,
    pub saved_paired: Vec<Vec<PairedDeviceSummary>>,
    pub stored_bindings: DeviceBindings,
    pub stored_paired: Vec<PairedDeviceSummary>,
    pub standby_prevents: usize,
    pub standby_allows: usize,
    pub supported: bool,
    pub wifi_on: bool,
    pub wifi_restore: bool,
    pub wifi_on_requests: usize,
    pub wifi_off_requests: usize,
}

impl Default for HostRecord {
    fn default() -> Self {
        Self {
            dispatched: Vec::new(),
            activity: 0,
            prompts: 0,
            prompt_closes: 0,
            confirms: Vec::new(),
            infos: Vec::new(),
            errors: Vec::new(),
            saved_bindings: Vec::new(),
            saved_paired: Vec::new(),
            stored_bindings: DeviceBindings::default(),
            stored_paired: Vec::new(),
            standby_prevents: 0,
            standby_allows: 0,
            supported: true,
            wifi_on: true,
            wifi_restore: false,
            wifi_on_requests: 0,
            wifi_off_requests: 0,
        }
    }
}

pub type HostLog = Rc<RefCell<HostRecord>>;

#[derive(Clone)]
struct FakeHost {
    log: HostLog,
    timeline: Timeline,
}

impl FakeHost {
    fn mark(&self, what: &str) {
        self.timeline.borrow_mut().push(what.to_string());
    }
}

impl SettingsStore for FakeHost {
    fn load_bindings(&self) -> DeviceBindings {
        self.log.borrow().stored_bindings.clone()
    }

    fn save_bindings(&mut self, bindings: &DeviceBindings) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.stored_bindings = bindings.clone();
        log.saved_bindings.push(bindings.clone());
        Ok(())
    }

    fn load_paired_devices(&self) -> Vec<PairedDeviceSummary> {
        self.log.borrow().stored_paired.clone()
    }

    fn save_paired_devices(&mut self, devices: &[PairedDeviceSummary]) -> Result<()> {
        let mut log = self.log.borrow_mut();
        log.stored_paired = devices.to_vec();
        log.saved_paired.push(devices.to_vec());
        Ok(())
    }
}

impl ActionDispatcher for FakeHost {
    fn dispatch(&mut self, event: &str, args: Option<&Value>) {
        self.log
            .borrow_mut()
            .dispatched
            .push((event.to_string(), args.cloned()));
    }

    fn notify_input_activity(&mut self) {
        self.log.borrow_mut().activity += 1;
    }
}

impl PlatformHooks for FakeHost {
    fn bluetooth_supported(&self) -> bool {
        self.log.borrow().supported
    }

    fn prevent_standby(&mut self) {
        self.mark("prevent_standby");
        self.log.borrow_mut().standby_prevents += 1;
    }

    fn allow_standby(&mut self) {
        self.mark("allow_standby");
        self.log.borrow_mut().standby_allows += 1;
    }

    fn wifi_is_on(&self) -> bool {
        self.log.borrow().wifi_on
    }

    fn wifi_turn_on(&mut self) {
        self.mark("wifi_on");
        let mut log = self.log.borrow_mut();
        log.wifi_on = true;
        log.wifi_on_requests += 1;
    }

    fn wifi_turn_off(&mut self) {
        self.mark("wifi_off");
        let mut log = self.log.borrow_mut();
        log.wifi_on = false;
        log.wifi_off_requests += 1;
    }

    fn wifi_restore_enabled(&self) -> bool {
        self.log.borrow().wifi_restore
    }
}

impl Notifier for FakeHost {
    fn info(&mut self, message: &str) {
        self.log.borrow_mut().infos.push(message.to_string());
    }

    fn error(&mut self, message: &str) {
        self.log.borrow_mut().errors.push(message.to_string());
    }

    fn capture_prompt(&mut self, _device: &str, _action: &str) {
        self.log.borrow_mut().prompts += 1;
    }

    fn close_capture_prompt(&mut self) {
        self.log.borrow_mut().prompt_closes += 1;
    }

    fn confirm(&mut self, message: &str) {
        self.log.borrow_mut().confirms.push(message.to_string());
    }
}

pub fn fake_host() -> (Host, HostLog) {
    fake_host_with_timeline(Timeline::default())
}

pub fn fake_host_with_timeline(timeline: Timeline) -> (Host, HostLog) {
    let log = HostLog::default();
    let fake = FakeHost {
        log: log.clone(),
        timeline,
    };
    let host = Host {
        settings: Box::new(fake.clone()),
        dispatcher: Box::new(fake.clone()),
        platform: Box::new(fake.clone()),
        notifier: Box::new(fake),
    };
    (host, log)
}

pub fn key_event(path: &str, code: u16, value: i32) -> InputEvent {
    InputEvent {
        event_type: EV_KEY,
        code,
        value,
        time: chrono::Utc::now(),
        source: SOURCE_BLUETOOTH.to_string(),
        device_path: PathBuf::from(path),
        address: None,
    }
}

pub fn sample_catalog() -> ActionCatalog {
    serde_json::from_value(serde_json::json!({
        "category": [
            {
                "name": "reader",
                "action": [
                    { "id": "next_page", "title": "Next page", "event": "GotoViewRel", "args": 1 },
                    { "id": "prev_page", "title": "Previous page", "event": "GotoViewRel", "args": -1 }
                ]
            },
            {
                "name": "general",
                "action": [
                    { "id": "next_page", "title": "Next page (global)", "event": "NextPageGlobal" },
                    { "id": "back", "title": "Back", "event": "Back" }
                ]
            }
        ]
    }))
    .unwrap()
}
