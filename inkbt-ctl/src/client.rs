/*!
 * INKBT Daemon Client
 * JSON IPC communication with inkbtd
 */

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use inkbt_core::protocol::{self, HostEvent, Request, Response};

pub struct InkbtClient {
    socket_path: String,
}

impl InkbtClient {
    pub fn new(socket_path: String) -> Self {
        Self { socket_path }
    }

    async fn connect(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| format!("cannot reach inkbtd on {}", self.socket_path))
    }

    pub async fn send_request(&self, request: &Request) -> Result<Response> {
        let (read, mut write) = self.connect().await?.into_split();
        write.write_all(protocol::encode(request)?.as_bytes()).await?;

        let mut lines = BufReader::new(read).lines();
        match lines.next_line().await? {
            Some(line) => Ok(protocol::decode(&line)?),
            None => bail!("daemon closed the connection without answering"),
        }
    }

    /// Streams host events until the daemon goes away or `on_event` fails.
    pub async fn subscribe<F>(&self, mut on_event: F) -> Result<()>
    where
        F: FnMut(HostEvent) -> Result<()>,
    {
        let (read, mut write) = self.connect().await?.into_split();
        write
            .write_all(protocol::encode(&Request::Subscribe)?.as_bytes())
            .await?;

        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await? {
            match protocol::decode::<Response>(&line)? {
                Response::Event { event } => on_event(event)?,
                Response::Error { message } => bail!(message),
                _ => {}
            }
        }
        Ok(())
    }
}
