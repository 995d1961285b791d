//! One outbound relay connection, one command in flight at a time.
//!
//! The socket sits behind a mutex held for the whole write-then-read
//! exchange, so commands issued by concurrent tasks through the same channel
//! are strictly serialized in lock acquisition order. This caps throughput at
//! one round trip at a time per channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tabrelay_core::protocol::ERR_CLIENT_TIMEOUT;
use tabrelay_core::{Command, Config, Error, Reply, Result};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::launcher::RelayLauncher;
use crate::transport::Transport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct CommandChannel {
    url: String,
    command_timeout: Duration,
    launcher: Option<RelayLauncher>,
    socket: Mutex<Option<WsStream>>,
    next_id: AtomicU64,
}

impl CommandChannel {
    pub fn new(url: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            command_timeout,
            launcher: None,
            socket: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Channel to the configured relay, starting it on demand when
    /// `client.autoStart` is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let channel = Self::new(config.relay.ws_url(), config.client.command_timeout());
        if config.client.auto_start {
            Ok(channel.with_launcher(RelayLauncher::from_config(config)?))
        } else {
            Ok(channel)
        }
    }

    pub fn with_launcher(mut self, launcher: RelayLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Open the connection if there is none yet.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    async fn open(&self) -> Result<WsStream> {
        if let Some(launcher) = &self.launcher {
            launcher.ensure_running().await?;
        }
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to relay at {}: {}", self.url, e)))?;
        debug!(url = %self.url, "Connected to relay");
        Ok(ws)
    }

    /// Drop the current connection; the next command reconnects.
    pub async fn close(&self) {
        if let Some(mut ws) = self.socket.lock().await.take() {
            let _ = ws.close(None).await;
        }
    }

    /// Write one command and wait for its reply.
    ///
    /// Gives up after the command timeout with a synthetic timeout reply.
    /// Frames carrying another request id are leftovers of earlier timed-out
    /// commands and are skipped. A reply addressed to this command that does
    /// not decode is a `Protocol` error.
    pub async fn send(&self, command: &Command) -> Result<Reply> {
        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(ws) = guard.as_mut() else {
            return Err(Error::Connection("relay connection unavailable".to_string()));
        };

        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let frame = command.to_frame(&request_id).to_string();
        if let Err(e) = ws.send(Message::Text(frame)).await {
            *guard = None;
            return Err(Error::Connection(format!("Failed to send {}: {}", command.name(), e)));
        }

        let deadline = tokio::time::Instant::now() + self.command_timeout;
        loop {
            let next = match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(command = %command.name(), request_id = %request_id, "No reply from relay in time");
                    return Ok(Reply::error(ERR_CLIENT_TIMEOUT, Some(&request_id)));
                }
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        debug!("Unparseable relay frame skipped");
                        continue;
                    };
                    if !value.is_object() {
                        debug!("Non-object relay frame skipped");
                        continue;
                    }
                    if let Some(id) = value.get("requestId").and_then(Value::as_str) {
                        if id != request_id {
                            debug!(stale = %id, expected = %request_id, "Stale reply skipped");
                            continue;
                        }
                    }
                    // The reply is ours; a frame that does not decode ends the exchange.
                    return Reply::from_value(value);
                }
                Some(Ok(Message::Close(_))) | None => {
                    *guard = None;
                    return Err(Error::Connection("relay closed the connection".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    *guard = None;
                    return Err(Error::Connection(format!("relay receive error: {}", e)));
                }
            }
        }
    }
}

#[async_trait]
impl Transport for CommandChannel {
    async fn request(&self, command: Command) -> Result<Reply> {
        self.send(&command).await
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.connect().await
    }
}
