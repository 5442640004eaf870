/*!
 * Key Bindings
 * (device, key) -> action resolution, dispatch, polling and key capture
 */

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::bus::normalize_address;
use crate::host::Host;
use crate::input::{DeviceListener, InputDeviceHandler};
use crate::reader::{InputEvent, KEY_PRESS};
use crate::scheduler::{Task, TaskHandle, TaskQueue};

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_TIMEOUT_MS: u16 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: String,
    pub title: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toggle: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionCategory {
    pub name: String,
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionCatalog {
    #[serde(default, rename = "category")]
    pub categories: Vec<ActionCategory>,
}

/// Flat "category:id" lookup built once from a catalog.
#[derive(Debug, Default)]
pub struct ActionIndex {
    actions: HashMap<String, ActionDefinition>,
}

impl ActionIndex {
    pub fn build(catalog: &ActionCatalog) -> Self {
        let actions = catalog
            .categories
            .iter()
            .flat_map(|category| {
                category
                    .actions
                    .iter()
                    .map(move |action| (prefixed_id(&category.name, &action.id), action.clone()))
            })
            .collect();
        Self { actions }
    }

    /// Unprefixed ids never match, even if some category has that id.
    pub fn get(&self, prefixed: &str) -> Option<&ActionDefinition> {
        if !prefixed.contains(':') {
            return None;
        }
        self.actions.get(prefixed)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// (prefixed id, title), sorted by id.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .actions
            .iter()
            .map(|(id, action)| (id.clone(), action.title.clone()))
            .collect();
        entries.sort();
        entries
    }
}

pub fn prefixed_id(category: &str, id: &str) -> String {
    format!("{}:{}", category, id)
}

/// address -> key name -> prefixed action id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceBindings(BTreeMap<String, BTreeMap<String, String>>);

impl DeviceBindings {
    pub fn bind(&mut self, address: &str, key: &str, action: &str) {
        self.0
            .entry(normalize_address(address))
            .or_default()
            .insert(key.to_string(), action.to_string());
    }

    pub fn unbind(&mut self, address: &str, key: &str) -> bool {
        let address = normalize_address(address);
        let Some(keys) = self.0.get_mut(&address) else {
            return false;
        };
        let removed = keys.remove(key).is_some();
        if keys.is_empty() {
            self.0.remove(&address);
        }
        removed
    }

    pub fn clear(&mut self, address: &str) -> bool {
        self.0.remove(&normalize_address(address)).is_some()
    }

    pub fn action_for(&self, address: &str, key: &str) -> Option<&str> {
        self.0.get(address)?.get(key).map(String::as_str)
    }

    pub fn device(&self, address: &str) -> BTreeMap<String, String> {
        self.0
            .get(&normalize_address(address))
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedBinding {
    pub address: String,
    pub key: String,
    pub action: String,
}

pub type CaptureCallback = Box<dyn FnOnce(&CapturedBinding)>;

struct CaptureSession {
    address: String,
    action: String,
    callback: Option<CaptureCallback>,
}

pub struct KeyBindingsManager {
    bindings: DeviceBindings,
    actions: ActionIndex,
    paths: Rc<RefCell<HashMap<PathBuf, String>>>,
    capture: Option<CaptureSession>,
    awaiting_dismissal: Option<(CapturedBinding, Option<CaptureCallback>)>,
    poll_task: Option<TaskHandle>,
}

impl KeyBindingsManager {
    pub fn new(bindings: DeviceBindings, catalog: &ActionCatalog) -> Self {
        let actions = ActionIndex::build(catalog);
        info!("Loaded {} actions for Bluetooth key bindings", actions.len());
        Self {
            bindings,
            actions,
            paths: Rc::new(RefCell::new(HashMap::new())),
            capture: None,
            awaiting_dismissal: None,
            poll_task: None,
        }
    }

    /// Drops the cached action index and rebuilds it from `catalog`.
    pub fn set_action_catalog(&mut self, catalog: &ActionCatalog) {
        self.actions = ActionIndex::build(catalog);
    }

    pub fn actions(&self) -> &ActionIndex {
        &self.actions
    }

    pub fn action_title(&self, prefixed: &str) -> Option<&str> {
        self.actions.get(prefixed).map(|a| a.title.as_str())
    }

    /// Keeps the path -> address map in step with the input handler.
    pub fn attach(&self, input: &mut InputDeviceHandler) {
        let paths = self.paths.clone();
        let on_open: DeviceListener = Rc::new(move |address: &str, path: &Path| {
            paths
                .borrow_mut()
                .insert(path.to_path_buf(), address.to_string());
            Ok(())
        });
        let paths = self.paths.clone();
        let on_close: DeviceListener = Rc::new(move |address: &str, path: &Path| {
            let mut paths = paths.borrow_mut();
            if paths.get(path).map(String::as_str) == Some(address) {
                paths.remove(path);
            }
            Ok(())
        });
        input.on_device_open(on_open);
        input.on_device_close(on_close);
    }

    pub fn address_for_path(&self, path: &Path) -> Option<String> {
        self.paths.borrow().get(path).cloned()
    }

    pub fn bindings(&self) -> &DeviceBindings {
        &self.bindings
    }

    /// Empty map for devices that have nothing bound.
    pub fn device_bindings(&self, address: &str) -> BTreeMap<String, String> {
        self.bindings.device(address)
    }

    pub fn set_binding(&mut self, address: &str, key: &str, action: &str, host: &mut Host) {
        self.bindings.bind(address, key, action);
        self.persist(host);
    }

    pub fn remove_binding(&mut self, address: &str, key: &str, host: &mut Host) -> bool {
        let removed = self.bindings.unbind(address, key);
        if removed {
            self.persist(host);
        }
        removed
    }

    pub fn clear_device_bindings(&mut self, address: &str, host: &mut Host) -> bool {
        let cleared = self.bindings.clear(address);
        if cleared {
            self.persist(host);
        }
        cleared
    }

    fn persist(&self, host: &mut Host) {
        if let Err(e) = host.settings.save_bindings(&self.bindings) {
            error!("Failed to save Bluetooth key bindings: {}", e);
        }
    }

    /// Resolves path -> address -> key -> action. Every hop must succeed.
    pub fn resolve(&self, path: &Path, key: &str) -> Option<&ActionDefinition> {
        let address = self.address_for_path(path)?;
        let action = self.bindings.action_for(&address, key)?;
        self.actions.get(action)
    }

    pub fn on_bluetooth_key_event(&mut self, event: &InputEvent, host: &mut Host) {
        if event.value != KEY_PRESS {
            return;
        }
        host.dispatcher.notify_input_activity();

        let key = event.key_name();
        if self.capture.is_some() {
            self.capture_key(&key, host);
            return;
        }

        match self.resolve(&event.device_path, &key) {
            Some(action) => {
                debug!(key, action = %action.id, at = %event.time, "dispatching Bluetooth binding");
                host.dispatcher.dispatch(&action.event, action.args.as_ref());
            }
            None => debug!(key, path = %event.device_path.display(), "unbound Bluetooth key"),
        }
    }

    pub fn start_key_capture(
        &mut self,
        address: &str,
        action: &str,
        callback: Option<CaptureCallback>,
        input: &InputDeviceHandler,
        host: &mut Host,
        queue: &mut TaskQueue,
    ) {
        let address = normalize_address(address);
        let title = self.action_title(action).unwrap_or(action).to_string();
        host.notifier.capture_prompt(&address, &title);
        self.capture = Some(CaptureSession {
            address,
            action: action.to_string(),
            callback,
        });
        if input.has_isolated_readers() {
            self.start_polling(queue);
        }
    }

    pub fn cancel_key_capture(&mut self, host: &mut Host) -> bool {
        if self.capture.take().is_some() {
            host.notifier.close_capture_prompt();
            true
        } else {
            false
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Accepts any key token and binds it to the capture target.
    pub fn capture_key(&mut self, key: &str, host: &mut Host) {
        let Some(session) = self.capture.take() else {
            return;
        };
        host.notifier.close_capture_prompt();

        self.bindings.bind(&session.address, key, &session.action);
        self.persist(host);

        let captured = CapturedBinding {
            address: session.address,
            key: key.to_string(),
            action: session.action,
        };
        let title = self.action_title(&captured.action).unwrap_or(&captured.action);
        info!("Bound {} on {} to {}", captured.key, captured.address, captured.action);
        host.notifier
            .confirm(&format!("Button {} now triggers: {}", captured.key, title));
        self.awaiting_dismissal = Some((captured, session.callback));
    }

    /// The capture callback only runs once the confirmation is gone.
    pub fn confirmation_dismissed(&mut self) {
        if let Some((captured, callback)) = self.awaiting_dismissal.take() {
            if let Some(callback) = callback {
                callback(&captured);
            }
        }
    }

    pub fn start_polling(&mut self, queue: &mut TaskQueue) {
        if self.poll_task.map_or(false, |task| queue.is_scheduled(task)) {
            return;
        }
        self.poll_task = Some(queue.next_tick(Task::BindingPoll));
    }

    pub fn stop_polling(&mut self, queue: &mut TaskQueue) {
        if let Some(task) = self.poll_task.take() {
            queue.cancel(task);
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poll_task.is_some()
    }

    /// One pass of the polling loop; reschedules only while readers remain.
    pub fn run_poll(&mut self, input: &mut InputDeviceHandler, host: &mut Host, queue: &mut TaskQueue) {
        self.poll_task = None;
        if !input.has_isolated_readers() {
            debug!("No isolated readers left, binding poll stopped");
            return;
        }

        for event in input.poll_isolated_readers(POLL_TIMEOUT_MS) {
            if event.is_key() {
                self.on_bluetooth_key_event(&event, host);
            }
        }

        if input.has_isolated_readers() {
            self.poll_task = Some(queue.schedule_in(POLL_INTERVAL, Task::BindingPoll));
        } else {
            debug!("Last isolated reader closed, binding poll stopped");
        }
    }
}
