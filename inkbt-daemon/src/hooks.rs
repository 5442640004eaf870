/*!
 * Host hooks for the daemon
 * Shell commands for Wi-Fi and standby, host events broadcast to subscribers
 */

use serde_json::Value;
use std::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use inkbt_core::protocol::HostEvent;
use inkbt_core::{ActionDispatcher, Host, Notifier, PlatformHooks, SettingsStore};

use crate::config::HooksConfig;

/// Runs `command` through `sh -c`; an empty command counts as success.
fn run_hook(name: &str, command: &str) -> bool {
    if command.trim().is_empty() {
        return true;
    }
    debug!(hook = name, "exec: {}", command);
    match Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(hook = name, code = ?status.code(), "hook command failed");
            false
        }
        Err(e) => {
            warn!(hook = name, "could not spawn hook: {}", e);
            false
        }
    }
}

pub struct ShellPlatform {
    hooks: HooksConfig,
    supported: bool,
    events: broadcast::Sender<HostEvent>,
}

impl ShellPlatform {
    pub fn new(hooks: HooksConfig, supported: bool, events: broadcast::Sender<HostEvent>) -> Self {
        Self {
            hooks,
            supported,
            events,
        }
    }

    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }
}

impl PlatformHooks for ShellPlatform {
    fn bluetooth_supported(&self) -> bool {
        self.supported
    }

    fn prevent_standby(&mut self) {
        run_hook("prevent_standby", &self.hooks.prevent_standby);
        self.emit(HostEvent::Standby { prevented: true });
    }

    fn allow_standby(&mut self) {
        run_hook("allow_standby", &self.hooks.allow_standby);
        self.emit(HostEvent::Standby { prevented: false });
    }

    fn wifi_is_on(&self) -> bool {
        run_hook("wifi_status", &self.hooks.wifi_status)
    }

    fn wifi_turn_on(&mut self) {
        info!("Turning Wi-Fi on");
        if run_hook("wifi_on", &self.hooks.wifi_on) {
            self.emit(HostEvent::Wifi { on: true });
        }
    }

    fn wifi_turn_off(&mut self) {
        info!("Turning Wi-Fi off");
        if run_hook("wifi_off", &self.hooks.wifi_off) {
            self.emit(HostEvent::Wifi { on: false });
        }
    }

    fn wifi_restore_enabled(&self) -> bool {
        self.hooks.wifi_restore
    }
}

/// Dispatched actions and user messages, fanned out to subscribed clients.
#[derive(Clone)]
pub struct EventSink {
    events: broadcast::Sender<HostEvent>,
}

impl EventSink {
    pub fn new(events: broadcast::Sender<HostEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: HostEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscribers for host event");
        }
    }
}

impl ActionDispatcher for EventSink {
    fn dispatch(&mut self, event: &str, args: Option<&Value>) {
        info!(event, "dispatching action");
        self.emit(HostEvent::Dispatch {
            event: event.to_string(),
            args: args.cloned(),
        });
    }

    fn notify_input_activity(&mut self) {
        self.emit(HostEvent::InputActivity);
    }
}

impl Notifier for EventSink {
    fn info(&mut self, message: &str) {
        info!("{}", message);
        self.emit(HostEvent::Info {
            message: message.to_string(),
        });
    }

    fn error(&mut self, message: &str) {
        warn!("{}", message);
        self.emit(HostEvent::Error {
            message: message.to_string(),
        });
    }

    fn capture_prompt(&mut self, device: &str, action: &str) {
        self.emit(HostEvent::CapturePrompt {
            device: device.to_string(),
            action: action.to_string(),
        });
    }

    fn close_capture_prompt(&mut self) {
        self.emit(HostEvent::CapturePromptClosed);
    }

    fn confirm(&mut self, message: &str) {
        self.emit(HostEvent::Confirm {
            message: message.to_string(),
        });
    }
}

pub fn build_host(
    settings: Box<dyn SettingsStore>,
    hooks: HooksConfig,
    supported: bool,
    events: broadcast::Sender<HostEvent>,
) -> Host {
    let sink = EventSink::new(events.clone());
    Host {
        settings,
        dispatcher: Box::new(sink.clone()),
        platform: Box::new(ShellPlatform::new(hooks, supported, events)),
        notifier: Box::new(sink),
    }
}
