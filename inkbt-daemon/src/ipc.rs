/*!
 * IPC Server for INKBT Daemon
 * JSON protocol over Unix socket
 */

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};

use inkbt_core::protocol::{self, HostEvent, Request, Response};

use crate::service::Command;

pub struct IpcServer {
    listener: UnixListener,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<HostEvent>,
}

impl IpcServer {
    pub fn new(
        listener: UnixListener,
        commands: mpsc::Sender<Command>,
        events: broadcast::Sender<HostEvent>,
    ) -> Self {
        Self {
            listener,
            commands,
            events,
        }
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("IPC server listening for connections...");

        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!("New client connected");
                    let commands = self.commands.clone();
                    let events = self.events.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, commands, events).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<HostEvent>,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        tracing::debug!("Received request: {}", line.trim());

        let request: Request = match protocol::decode(&line) {
            Ok(request) => request,
            Err(e) => {
                send(&mut write, &Response::error(e.to_string())).await?;
                continue;
            }
        };

        if request == Request::Subscribe {
            return stream_events(write, events.subscribe()).await;
        }

        let response = forward(&commands, request).await;
        send(&mut write, &response).await?;
    }

    Ok(())
}

async fn forward(commands: &mpsc::Sender<Command>, request: Request) -> Response {
    let (reply, answer) = oneshot::channel();
    if commands.send(Command { request, reply }).await.is_err() {
        return Response::error("daemon is shutting down");
    }
    answer
        .await
        .unwrap_or_else(|_| Response::error("controller dropped the request"))
}

async fn stream_events(
    mut write: OwnedWriteHalf,
    mut events: broadcast::Receiver<HostEvent>,
) -> Result<()> {
    send(&mut write, &Response::success("Subscribed")).await?;
    loop {
        match events.recv().await {
            Ok(event) => send(&mut write, &Response::Event { event }).await?,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Subscriber fell behind, {} events dropped", missed);
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn send(write: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    write.write_all(protocol::encode(response)?.as_bytes()).await?;
    Ok(())
}
