/*!
 * Controller service loop
 * Owns the controller on the daemon's thread; IPC talks to it over a channel
 */

use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use inkbt_core::bus::normalize_address;
use inkbt_core::protocol::{ActionEntry, Request, Response};
use inkbt_core::BluetoothController;

use crate::config::load_catalog;

pub struct Command {
    pub request: Request,
    pub reply: oneshot::Sender<Response>,
}

/// Runs until every command sender is gone or a shutdown signal arrives.
///
/// SIGHUP re-reads the action catalog from `actions_path`.
pub async fn run(
    mut controller: BluetoothController,
    mut commands: mpsc::Receiver<Command>,
    actions_path: &str,
) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        let deadline = controller.next_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command { request, reply }) => {
                    debug!(?request, "handling request");
                    let response = serve(&mut controller, request, Instant::now());
                    let _ = reply.send(response);
                }
                None => break,
            },
            _ = wait_for(deadline) => {}
            _ = hangup.recv() => reload_catalog(&mut controller, actions_path),
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
        }
        controller.tick(Instant::now());
    }

    info!("Controller loop stopping");
    controller.input_mut().close_all_isolated_readers();
    Ok(())
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Brings the queue clock up to `now` before the request schedules anything.
pub fn serve(controller: &mut BluetoothController, request: Request, now: Instant) -> Response {
    controller.tick(now);
    handle(controller, request)
}

/// Keeps the old catalog when the file no longer parses.
pub fn reload_catalog(controller: &mut BluetoothController, actions_path: &str) {
    match load_catalog(actions_path) {
        Ok(catalog) => controller.set_action_catalog(&catalog),
        Err(e) => warn!("Keeping current action catalog: {:#}", e),
    }
}

pub fn handle(controller: &mut BluetoothController, request: Request) -> Response {
    match request {
        Request::Status => Response::Status {
            status: controller.status(),
        },
        Request::PowerOn => Response::outcome(
            controller.turn_on(),
            "Bluetooth is on",
            "Could not turn on Bluetooth",
        ),
        Request::PowerOff => Response::outcome(
            controller.turn_off(true),
            "Bluetooth is off",
            "Could not turn off Bluetooth",
        ),
        Request::Scan { seconds } => Response::outcome(
            controller.scan(seconds.map(Duration::from_secs), None),
            "Scanning for devices",
            "Could not start a scan",
        ),
        Request::Devices => Response::Devices {
            devices: controller.known_devices(),
        },
        Request::Connect { address } => Response::outcome(
            controller.connect(&address),
            format!("Connected {}", address),
            format!("Could not connect {}", address),
        ),
        Request::Disconnect { address } => Response::outcome(
            controller.disconnect(&address),
            format!("Disconnected {}", address),
            format!("Could not disconnect {}", address),
        ),
        Request::Toggle { address } => Response::outcome(
            controller.toggle(&address),
            format!("Toggled {}", address),
            format!("Could not toggle {}", address),
        ),
        Request::Forget { address } => Response::outcome(
            controller.forget(&address),
            format!("Forgot {}", address),
            format!("Could not forget {}", address),
        ),
        Request::Bindings { address } => Response::Bindings {
            bindings: controller.device_bindings(&address),
            address: normalize_address(&address),
        },
        Request::Bind { address, action } => Response::outcome(
            controller.start_key_capture(&address, &action, None),
            "Press a button on the device",
            format!("Could not bind {}", action),
        ),
        Request::CancelCapture => Response::outcome(
            controller.cancel_key_capture(),
            "Capture cancelled",
            "No capture in progress",
        ),
        Request::Unbind { address, key } => Response::outcome(
            controller.remove_binding(&address, &key),
            format!("Removed {}", key),
            format!("{} is not bound", key),
        ),
        Request::ClearBindings { address } => Response::outcome(
            controller.clear_device_bindings(&address),
            "Bindings cleared",
            "Nothing was bound",
        ),
        Request::Actions => Response::Actions {
            actions: controller
                .key_bindings()
                .actions()
                .entries()
                .into_iter()
                .map(|(id, title)| ActionEntry { id, title })
                .collect(),
        },
        Request::Suspend => {
            controller.on_suspend();
            Response::success("Suspend handled")
        }
        Request::Resume => {
            controller.on_resume();
            Response::success("Resume handled")
        }
        Request::DismissConfirmation => {
            controller.confirmation_dismissed();
            Response::success("Dismissed")
        }
        Request::Subscribe => Response::error("Subscribe is served by the connection"),
    }
}
