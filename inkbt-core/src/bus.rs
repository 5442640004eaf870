/*!
 * Bluetooth Bus Adapter
 * Method calls issued through dbus-send, replies parsed from its text dump
 */

use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::{debug, warn};

const DBUS_SEND: &str = "dbus-send";
const VENDOR_SERVICE: &str = "com.kobo.mtk.bluedroid";
const STANDARD_SERVICE: &str = "org.bluez";
const VENDOR_MANAGER: &str = "com.kobo.bluetooth.BluedroidManager1";
pub const DEFAULT_ADAPTER_PATH: &str = "/org/bluez/hci0";

/// Upper bound for Pair/Connect, which block until the remote answers.
const SLOW_CALL_TIMEOUT_MS: u32 = 15_000;

/// Runs an external program and hands back its stdout.
///
/// `None` covers every failure: spawn error, non-zero exit, unreadable output.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Option<String>;
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Option<String> {
        debug!("exec: {} {}", program, args.join(" "));
        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                debug!(
                    status = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "bus command failed"
                );
                None
            }
            Err(e) => {
                warn!("Failed to spawn {}: {}", program, e);
                None
            }
        }
    }
}

/// Which service owns the Bluetooth objects on this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusProfile {
    /// MTK bluedroid stack shipped by the vendor, needs an explicit manager On/Off.
    Vendor,
    /// Plain BlueZ.
    Standard,
}

impl BusProfile {
    pub fn service(self) -> &'static str {
        match self {
            BusProfile::Vendor => VENDOR_SERVICE,
            BusProfile::Standard => STANDARD_SERVICE,
        }
    }

    /// Picks the vendor profile when its service is known to the bus daemon.
    pub fn detect(runner: &dyn CommandRunner) -> Self {
        let registered = ["ListNames", "ListActivatableNames"].iter().any(|method| {
            let args = vec![
                "--system".to_string(),
                "--print-reply".to_string(),
                "--dest=org.freedesktop.DBus".to_string(),
                "/org/freedesktop/DBus".to_string(),
                format!("org.freedesktop.DBus.{}", method),
            ];
            runner
                .run(DBUS_SEND, &args)
                .map_or(false, |out| out.contains(VENDOR_SERVICE))
        });

        if registered {
            BusProfile::Vendor
        } else {
            BusProfile::Standard
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub address: String,
    pub name: String,
    pub bus_path: String,
    pub paired: bool,
    pub connected: bool,
    pub trusted: bool,
}

impl DeviceRecord {
    pub fn new(adapter_path: &str, address: &str, name: &str) -> Self {
        let address = normalize_address(address);
        Self {
            bus_path: device_bus_path(adapter_path, &address),
            address,
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Label for user-facing messages.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.address
        } else {
            &self.name
        }
    }
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_uppercase()
}

/// `/org/bluez/hci0` + `aa:bb:..` -> `/org/bluez/hci0/dev_AA_BB_..`
pub fn device_bus_path(adapter_path: &str, address: &str) -> String {
    format!(
        "{}/dev_{}",
        adapter_path.trim_end_matches('/'),
        normalize_address(address).replace(':', "_")
    )
}

pub struct BusAdapter {
    runner: Box<dyn CommandRunner>,
    profile: BusProfile,
    adapter_path: String,
}

impl BusAdapter {
    pub fn new(runner: Box<dyn CommandRunner>, profile: BusProfile, adapter_path: &str) -> Self {
        Self {
            runner,
            profile,
            adapter_path: adapter_path.to_string(),
        }
    }

    pub fn profile(&self) -> BusProfile {
        self.profile
    }

    pub fn adapter_path(&self) -> &str {
        &self.adapter_path
    }

    pub fn is_enabled(&self) -> bool {
        self.call(
            &self.adapter_path,
            "org.freedesktop.DBus.Properties.Get",
            &["string:org.bluez.Adapter1", "string:Powered"],
            None,
        )
        .and_then(|reply| parse_boolean(&reply))
        .unwrap_or(false)
    }

    pub fn turn_on(&self) -> bool {
        if self.profile == BusProfile::Vendor
            && self.call("/", &format!("{}.On", VENDOR_MANAGER), &[], None).is_none()
        {
            warn!("Vendor Bluetooth manager refused to start");
        }
        self.set_powered(true);
        self.is_enabled()
    }

    pub fn turn_off(&self) -> bool {
        self.set_powered(false);
        if self.profile == BusProfile::Vendor
            && self.call("/", &format!("{}.Off", VENDOR_MANAGER), &[], None).is_none()
        {
            warn!("Vendor Bluetooth manager refused to stop");
        }
        !self.is_enabled()
    }

    fn set_powered(&self, on: bool) -> bool {
        let value = format!("variant:boolean:{}", on);
        self.call(
            &self.adapter_path,
            "org.freedesktop.DBus.Properties.Set",
            &["string:org.bluez.Adapter1", "string:Powered", &value],
            None,
        )
        .is_some()
    }

    pub fn list_managed_objects(&self) -> Vec<DeviceRecord> {
        self.call("/", "org.freedesktop.DBus.ObjectManager.GetManagedObjects", &[], None)
            .map(|reply| parse_managed_objects(&reply))
            .unwrap_or_default()
    }

    /// Re-reads one device, used to confirm a mutation took effect.
    pub fn device_properties(&self, bus_path: &str) -> Option<DeviceRecord> {
        let reply = self.call(
            bus_path,
            "org.freedesktop.DBus.Properties.GetAll",
            &["string:org.bluez.Device1"],
            None,
        )?;
        parse_property_dump(bus_path, &reply)
    }

    pub fn start_discovery(&self) -> bool {
        self.call(&self.adapter_path, "org.bluez.Adapter1.StartDiscovery", &[], None)
            .is_some()
    }

    pub fn stop_discovery(&self) -> bool {
        self.call(&self.adapter_path, "org.bluez.Adapter1.StopDiscovery", &[], None)
            .is_some()
    }

    pub fn pair(&self, bus_path: &str) -> bool {
        self.call(bus_path, "org.bluez.Device1.Pair", &[], Some(SLOW_CALL_TIMEOUT_MS))
            .is_some()
    }

    pub fn trust(&self, bus_path: &str) -> bool {
        self.call(
            bus_path,
            "org.freedesktop.DBus.Properties.Set",
            &["string:org.bluez.Device1", "string:Trusted", "variant:boolean:true"],
            None,
        )
        .is_some()
    }

    pub fn connect(&self, bus_path: &str) -> bool {
        self.call(bus_path, "org.bluez.Device1.Connect", &[], Some(SLOW_CALL_TIMEOUT_MS))
            .is_some()
    }

    pub fn disconnect(&self, bus_path: &str) -> bool {
        self.call(bus_path, "org.bluez.Device1.Disconnect", &[], None)
            .is_some()
    }

    pub fn remove(&self, bus_path: &str) -> bool {
        let target = format!("objpath:{}", bus_path);
        self.call(&self.adapter_path, "org.bluez.Adapter1.RemoveDevice", &[&target], None)
            .is_some()
    }

    fn call(
        &self,
        object_path: &str,
        method: &str,
        args: &[&str],
        reply_timeout_ms: Option<u32>,
    ) -> Option<String> {
        let mut argv = vec!["--system".to_string(), "--print-reply".to_string()];
        if let Some(timeout) = reply_timeout_ms {
            argv.push(format!("--reply-timeout={}", timeout));
        }
        argv.push(format!("--dest={}", self.profile.service()));
        argv.push(object_path.to_string());
        argv.push(method.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));

        let reply = self.runner.run(DBUS_SEND, &argv);
        if reply.is_none() {
            debug!(method, object_path, "bus call returned nothing");
        }
        reply
    }
}

/// Parses a GetManagedObjects dump. Only `dev_` objects carrying an Address survive.
pub fn parse_managed_objects(dump: &str) -> Vec<DeviceRecord> {
    let mut records = Vec::new();
    let mut current: Option<DeviceRecord> = None;
    let mut scanner = PropertyScanner::default();

    for line in dump.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("object path ") {
            flush(current.take(), &mut records);
            let path = unquote(rest);
            scanner = PropertyScanner::default();
            current = path.contains("/dev_").then(|| DeviceRecord {
                bus_path: path,
                ..Default::default()
            });
            continue;
        }

        if let Some(record) = current.as_mut() {
            scanner.feed(line, record);
        }
    }
    flush(current, &mut records);

    records
}

/// Parses a Properties.GetAll reply for a single device object.
pub fn parse_property_dump(bus_path: &str, dump: &str) -> Option<DeviceRecord> {
    let mut record = DeviceRecord {
        bus_path: bus_path.to_string(),
        ..Default::default()
    };
    let mut scanner = PropertyScanner::default();
    for line in dump.lines().map(str::trim) {
        scanner.feed(line, &mut record);
    }
    (!record.address.is_empty()).then_some(record)
}

/// Finds the first `boolean true|false` in a reply.
pub fn parse_boolean(reply: &str) -> Option<bool> {
    reply.lines().find_map(boolean_value)
}

fn flush(record: Option<DeviceRecord>, records: &mut Vec<DeviceRecord>) {
    if let Some(record) = record {
        if record.address.is_empty() {
            debug!(path = %record.bus_path, "dropping object without Address");
        } else {
            records.push(record);
        }
    }
}

/// Tracks `string "Key"` followed by its `variant ...` value line.
#[derive(Default)]
struct PropertyScanner {
    pending: Option<String>,
    value_on_next_line: bool,
}

impl PropertyScanner {
    fn feed(&mut self, line: &str, record: &mut DeviceRecord) {
        if let Some(key) = self.pending.take() {
            if let Some(rest) = line.strip_prefix("variant") {
                let rest = rest.trim();
                if rest.is_empty() {
                    self.pending = Some(key);
                    self.value_on_next_line = true;
                } else {
                    apply_property(record, &key, rest);
                }
                return;
            }
            if self.value_on_next_line {
                self.value_on_next_line = false;
                apply_property(record, &key, line);
                return;
            }
        }

        self.value_on_next_line = false;
        if let Some(rest) = line.strip_prefix("string ") {
            self.pending = Some(unquote(rest));
        }
    }
}

fn apply_property(record: &mut DeviceRecord, key: &str, value: &str) {
    match key {
        "Address" => record.address = normalize_address(&unquote(value)),
        "Name" => record.name = unquote(value),
        "Alias" if record.name.is_empty() => record.name = unquote(value),
        "Paired" => {
            if let Some(v) = boolean_value(value) {
                record.paired = v;
            }
        }
        "Connected" => {
            if let Some(v) = boolean_value(value) {
                record.connected = v;
            }
        }
        "Trusted" => {
            if let Some(v) = boolean_value(value) {
                record.trusted = v;
            }
        }
        _ => {}
    }
}

fn boolean_value(text: &str) -> Option<bool> {
    if text.contains("boolean true") {
        Some(true)
    } else if text.contains("boolean false") {
        Some(false)
    } else {
        None
    }
}

fn unquote(text: &str) -> String {
    let text = text.trim();
    match (text.find('"'), text.rfind('"')) {
        (Some(start), Some(end)) if end > start => text[start + 1..end].to_string(),
        _ => text.to_string(),
    }
}
