/*!
 * INKBT Control Client
 * Command line front end for inkbtd
 * Onyx Digital Intelligence Development LLC
 */

use anyhow::Result;
use clap::{Parser, Subcommand};

mod client;

use client::InkbtClient;
use inkbt_core::protocol::{HostEvent, Request, Response};

#[derive(Parser)]
#[command(name = "inkbt")]
#[command(about = "INKBT Bluetooth remote control")]
struct Cli {
    /// Daemon socket path
    #[arg(short, long, default_value = "/run/inkbt/inkbt.sock")]
    socket: String,

    /// Print raw JSON responses
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Power state, readers and capture status
    Status,
    /// Turn Bluetooth on
    On,
    /// Turn Bluetooth off
    Off,
    /// Look for devices
    Scan {
        /// Discovery window in seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// Paired and discovered devices
    Devices,
    Connect { address: String },
    Disconnect { address: String },
    Toggle { address: String },
    /// Unpair and remove a device
    Forget { address: String },
    /// Show a device's button bindings
    Bindings { address: String },
    /// Bind the next button pressed to an action, e.g. reader:next_page
    Bind { address: String, action: String },
    /// Abandon a pending bind
    Cancel,
    Unbind { address: String, key: String },
    /// Remove every binding of a device
    Clear { address: String },
    /// List bindable actions
    Actions,
    /// Tell the daemon the system is about to sleep
    Suspend,
    /// Tell the daemon the system woke up
    Resume,
    /// Acknowledge the last confirmation
    Dismiss,
    /// Stream dispatched actions and notifications
    Watch,
}

impl Commands {
    fn into_request(self) -> Request {
        match self {
            Commands::Status => Request::Status,
            Commands::On => Request::PowerOn,
            Commands::Off => Request::PowerOff,
            Commands::Scan { seconds } => Request::Scan { seconds },
            Commands::Devices => Request::Devices,
            Commands::Connect { address } => Request::Connect { address },
            Commands::Disconnect { address } => Request::Disconnect { address },
            Commands::Toggle { address } => Request::Toggle { address },
            Commands::Forget { address } => Request::Forget { address },
            Commands::Bindings { address } => Request::Bindings { address },
            Commands::Bind { address, action } => Request::Bind { address, action },
            Commands::Cancel => Request::CancelCapture,
            Commands::Unbind { address, key } => Request::Unbind { address, key },
            Commands::Clear { address } => Request::ClearBindings { address },
            Commands::Actions => Request::Actions,
            Commands::Suspend => Request::Suspend,
            Commands::Resume => Request::Resume,
            Commands::Dismiss => Request::DismissConfirmation,
            Commands::Watch => Request::Subscribe,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = InkbtClient::new(cli.socket);
    let json = cli.json;

    let request = cli.command.into_request();
    if request == Request::Subscribe {
        return client
            .subscribe(|event| {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), describe(&event));
                }
                Ok(())
            })
            .await;
    }

    let response = client.send_request(&request).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    print_response(&response);
    if matches!(response, Response::Error { .. }) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_response(response: &Response) {
    match response {
        Response::Status { status } => {
            println!("supported: {}", status.supported);
            println!("power:     {:?}", status.power);
            println!("standby:   {}", if status.standby_prevented { "prevented" } else { "allowed" });
            println!("scanning:  {}", status.scanning);
            println!("capturing: {}", status.capturing);
            for (address, path) in &status.open_readers {
                println!("reader:    {} on {}", address, path);
            }
        }
        Response::Devices { devices } => {
            if devices.is_empty() {
                println!("No devices");
            }
            for device in devices {
                let state = if device.connected {
                    "connected"
                } else if device.paired {
                    "paired"
                } else {
                    "found"
                };
                println!("{}  {:<10} {}", device.address, state, device.name);
            }
        }
        Response::Bindings { address, bindings } => {
            if bindings.is_empty() {
                println!("Nothing bound on {}", address);
            }
            for (key, action) in bindings {
                println!("{:<12} {}", key, action);
            }
        }
        Response::Actions { actions } => {
            for action in actions {
                println!("{:<32} {}", action.id, action.title);
            }
        }
        Response::Success { message } => println!("{}", message),
        Response::Error { message } => eprintln!("error: {}", message),
        Response::Event { event } => println!("{}", describe(event)),
    }
}

fn describe(event: &HostEvent) -> String {
    match event {
        HostEvent::Dispatch { event, args: Some(args) } => format!("action {} {}", event, args),
        HostEvent::Dispatch { event, args: None } => format!("action {}", event),
        HostEvent::InputActivity => "input activity".to_string(),
        HostEvent::Info { message } => message.clone(),
        HostEvent::Error { message } => format!("error: {}", message),
        HostEvent::CapturePrompt { device, action } => {
            format!("press a button on {} for \"{}\"", device, action)
        }
        HostEvent::CapturePromptClosed => "capture closed".to_string(),
        HostEvent::Confirm { message } => message.clone(),
        HostEvent::Standby { prevented } => {
            format!("standby {}", if *prevented { "prevented" } else { "allowed" })
        }
        HostEvent::Wifi { on } => format!("wi-fi {}", if *on { "on" } else { "off" }),
    }
}
