//! WebSocket relay between one browser extension and any number of clients.
//!
//! Every connection is classified by its first frame: an
//! `extension_connected` handshake promotes it to the extension link (the most
//! recent handshake wins), anything else makes it a client whose command
//! frames are forwarded to the extension and answered in order.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tabrelay_core::config::RelayConfig;
use tabrelay_core::protocol::{
    request_id_of, InboundFrame, ERR_PEER_DISCONNECTED, ERR_PEER_NOT_CONNECTED, ERR_RELAY_TIMEOUT,
};
use tabrelay_core::{Error, Result};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::correlation::CorrelationTable;

struct ExtensionLink {
    id: u64,
    /// Feeds the link's writer task.
    tx: mpsc::Sender<String>,
}

/// Shared relay state. Pending requests live only in memory.
pub struct RelayState {
    config: RelayConfig,
    pending: CorrelationTable,
    extension: Mutex<Option<ExtensionLink>>,
    next_link_id: AtomicU64,
}

impl RelayState {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            pending: CorrelationTable::new(),
            extension: Mutex::new(None),
            next_link_id: AtomicU64::new(1),
        }
    }

    pub async fn has_extension(&self) -> bool {
        self.extension.lock().await.is_some()
    }

    /// Id of the current extension link, if any.
    pub async fn extension_link_id(&self) -> Option<u64> {
        self.extension.lock().await.as_ref().map(|l| l.id)
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.len().await
    }

    /// Forward one client command and wait for its correlated reply.
    ///
    /// Never queues: without an extension link the caller gets an immediate
    /// error frame.
    pub async fn dispatch(&self, mut frame: Map<String, Value>) -> Value {
        let client_id = request_id_of(&frame).map(str::to_string);
        let command = frame
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let link = self
            .extension
            .lock()
            .await
            .as_ref()
            .map(|l| (l.id, l.tx.clone()));
        let Some((link_id, link_tx)) = link else {
            debug!(command = %command, "No extension link, failing fast");
            return error_frame(ERR_PEER_NOT_CONNECTED, client_id.as_deref());
        };

        // A client-supplied id that is already in flight gets a private alias.
        let mut relay_id = client_id.clone().unwrap_or_else(fresh_request_id);
        let rx = loop {
            if let Some(rx) = self.pending.register(&relay_id, link_id).await {
                break rx;
            }
            debug!(request_id = %relay_id, "Request id in use, aliasing");
            relay_id = fresh_request_id();
        };
        let reply_id = client_id.unwrap_or_else(|| relay_id.clone());

        frame.insert("requestId".to_string(), json!(relay_id));
        if link_tx.send(Value::Object(frame).to_string()).await.is_err() {
            self.pending.release(&relay_id).await;
            return error_frame(ERR_PEER_NOT_CONNECTED, Some(&reply_id));
        }
        debug!(command = %command, request_id = %relay_id, link_id, "Forwarded command");

        match tokio::time::timeout(self.config.command_timeout(), rx).await {
            Ok(Ok(mut reply)) => {
                if let Some(obj) = reply.as_object_mut() {
                    obj.insert("requestId".to_string(), json!(reply_id));
                }
                reply
            }
            Ok(Err(_)) => error_frame(ERR_PEER_DISCONNECTED, Some(&reply_id)),
            Err(_) => {
                self.pending.release(&relay_id).await;
                warn!(
                    command = %command,
                    request_id = %relay_id,
                    timeout_secs = self.config.command_timeout_secs,
                    "Extension did not reply in time"
                );
                error_frame(ERR_RELAY_TIMEOUT, Some(&reply_id))
            }
        }
    }

    /// Route one frame received on an extension link.
    async fn route_reply(&self, text: &str) {
        match InboundFrame::parse(text) {
            Some(InboundFrame::Message(frame)) => {
                let Some(id) = request_id_of(&frame).map(str::to_string) else {
                    debug!("Extension frame without requestId, dropping");
                    return;
                };
                if !self.pending.resolve(&id, Value::Object(frame)).await {
                    debug!(request_id = %id, "No pending request for reply, dropping");
                }
            }
            Some(InboundFrame::Heartbeat) | Some(InboundFrame::Handshake) => {}
            None => debug!("Malformed extension frame ignored"),
        }
    }
}

fn fresh_request_id() -> String {
    format!("relay-{}", uuid::Uuid::new_v4())
}

fn error_frame(message: &str, request_id: Option<&str>) -> Value {
    match request_id {
        Some(id) => json!({ "error": message, "requestId": id }),
        None => json!({ "error": message }),
    }
}

pub struct RelayServer {
    state: Arc<RelayState>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            state: Arc::new(RelayState::new(config)),
        }
    }

    pub fn state(&self) -> Arc<RelayState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(handle_ws_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured loopback address and serve until the process exits.
    pub async fn run(self) -> Result<()> {
        if !self.state.config.is_loopback() {
            return Err(Error::Config(format!(
                "relay host must be a loopback address, got '{}'",
                self.state.config.host
            )));
        }
        let bind_addr = self.state.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| Error::Connection(format!("Failed to bind {}: {}", bind_addr, e)))?;
        info!(addr = %bind_addr, "Relay listening, waiting for extension");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn handle_ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(mut socket: WebSocket, state: Arc<RelayState>) {
    let first = match tokio::time::timeout(state.config.handshake_timeout(), next_text(&mut socket)).await {
        Ok(Some(text)) => text,
        Ok(None) => return,
        Err(_) => {
            debug!("Connection sent nothing before the handshake timeout");
            return;
        }
    };

    match InboundFrame::parse(&first) {
        Some(InboundFrame::Handshake) => run_extension_link(socket, state).await,
        Some(InboundFrame::Message(frame)) => run_client(socket, state, Some(frame)).await,
        Some(InboundFrame::Heartbeat) => run_client(socket, state, None).await,
        None => {
            debug!("Malformed first frame ignored");
            run_client(socket, state, None).await
        }
    }
}

async fn next_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(WsMessage::Text(text)) => return Some(text),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

async fn run_extension_link(socket: WebSocket, state: Arc<RelayState>) {
    let link_id = state.next_link_id.fetch_add(1, Ordering::SeqCst);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    if let Some(previous) = state.extension.lock().await.replace(ExtensionLink { id: link_id, tx }) {
        info!(link_id, previous = previous.id, "Extension link replaced");
    } else {
        info!(link_id, "Extension connected");
    }

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => state.route_reply(&text).await,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                warn!(link_id, error = %e, "Extension link receive error");
                break;
            }
            _ => {}
        }
    }

    {
        let mut guard = state.extension.lock().await;
        if guard.as_ref().map(|l| l.id) == Some(link_id) {
            *guard = None;
        }
    }
    let stranded = state.pending.fail_link(link_id, ERR_PEER_DISCONNECTED).await;
    writer.abort();
    info!(link_id, stranded, "Extension disconnected");
}

async fn run_client(socket: WebSocket, state: Arc<RelayState>, first: Option<Map<String, Value>>) {
    debug!("Client connected");
    let (mut ws_sender, mut ws_receiver) = socket.split();

    if let Some(frame) = first {
        let reply = state.dispatch(frame).await;
        if ws_sender.send(WsMessage::Text(reply.to_string())).await.is_err() {
            return;
        }
    }

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                debug!(error = %e, "Client receive error");
                break;
            }
            _ => continue,
        };

        let frame = match InboundFrame::parse(&text) {
            Some(InboundFrame::Message(frame)) => frame,
            Some(_) => continue,
            None => {
                debug!("Malformed client frame ignored");
                continue;
            }
        };

        let reply = state.dispatch(frame).await;
        if ws_sender.send(WsMessage::Text(reply.to_string())).await.is_err() {
            break;
        }
    }
    debug!("Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_relay(command_timeout_secs: u64) -> (SocketAddr, Arc<RelayState>) {
        let config = RelayConfig {
            port: 0,
            command_timeout_secs,
            ..RelayConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(config);
        let state = server.state();
        tokio::spawn(server.serve(listener));
        (addr, state)
    }

    async fn connect(addr: SocketAddr) -> Ws {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn connect_extension(addr: SocketAddr, state: &RelayState) -> Ws {
        let previous = state.extension_link_id().await;
        let mut ws = connect(addr).await;
        send(&mut ws, json!({"type": "extension_connected"})).await;
        for _ in 0..200 {
            let current = state.extension_link_id().await;
            if current.is_some() && current != previous {
                return ws;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("extension never registered");
    }

    async fn send(ws: &mut Ws, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn recv(ws: &mut Ws) -> Value {
        let next = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return serde_json::from_str::<Value>(&text).unwrap(),
                    Some(Ok(_)) => continue,
                    other => panic!("socket ended: {:?}", other),
                }
            }
        })
        .await;
        next.expect("no frame within 5s")
    }

    #[tokio::test]
    async fn test_non_loopback_host_is_refused() {
        let config = RelayConfig {
            host: "0.0.0.0".to_string(),
            port: 0,
            ..RelayConfig::default()
        };
        let err = RelayServer::new(config).run().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_without_extension_fails_fast() {
        let (addr, state) = spawn_relay(30).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"type": "get_tabs", "requestId": "r1"})).await;
        let reply = recv(&mut client).await;

        assert_eq!(reply["error"], ERR_PEER_NOT_CONNECTED);
        assert_eq!(reply["requestId"], "r1");
        assert_eq!(state.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_reply_routed_to_issuer_and_released() {
        let (addr, state) = spawn_relay(30).await;
        let mut extension = connect_extension(addr, &state).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"type": "get_tabs", "requestId": "r1"})).await;
        let forwarded = recv(&mut extension).await;
        assert_eq!(forwarded["type"], "get_tabs");
        assert_eq!(forwarded["requestId"], "r1");
        assert_eq!(state.pending_len().await, 1);

        send(&mut extension, json!({"type": "ping"})).await;
        send(&mut extension, json!({"requestId": "r1", "success": true, "tabs": [{"id": 5}]})).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply["requestId"], "r1");
        assert_eq!(reply["tabs"][0]["id"], 5);
        assert_eq!(state.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_reply_is_dropped() {
        let (addr, state) = spawn_relay(30).await;
        let mut extension = connect_extension(addr, &state).await;
        let mut client = connect(addr).await;

        send(&mut extension, json!({"requestId": "ghost", "success": true})).await;
        send(&mut extension, json!({"requestId": "ghost", "success": true})).await;

        send(&mut client, json!({"type": "get_tabs", "requestId": "r2"})).await;
        let forwarded = recv(&mut extension).await;
        assert_eq!(forwarded["requestId"], "r2");
        send(&mut extension, json!({"requestId": "r2", "success": true, "tabs": []})).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply["requestId"], "r2");
        assert_eq!(state.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let (addr, state) = spawn_relay(1).await;
        let mut extension = connect_extension(addr, &state).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"type": "chatgpt_is_generating", "requestId": "r3", "tabId": 1})).await;
        let _ = recv(&mut extension).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply["error"], ERR_RELAY_TIMEOUT);
        assert_eq!(reply["requestId"], "r3");
        assert_eq!(state.pending_len().await, 0);

        // A late reply after the timeout goes nowhere.
        send(&mut extension, json!({"requestId": "r3", "success": true})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_missing_request_id_is_assigned() {
        let (addr, state) = spawn_relay(30).await;
        let mut extension = connect_extension(addr, &state).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"type": "get_tabs"})).await;
        let forwarded = recv(&mut extension).await;
        let assigned = forwarded["requestId"].as_str().unwrap().to_string();
        assert!(!assigned.is_empty());

        send(&mut extension, json!({"requestId": assigned, "success": true})).await;
        let reply = recv(&mut client).await;
        assert_eq!(reply["requestId"], assigned.as_str());
    }

    #[tokio::test]
    async fn test_colliding_client_ids_are_kept_apart() {
        let (addr, state) = spawn_relay(30).await;
        let mut extension = connect_extension(addr, &state).await;
        let mut first = connect(addr).await;
        let mut second = connect(addr).await;

        send(&mut first, json!({"type": "get_text", "selector": "a", "requestId": "r1"})).await;
        let a = recv(&mut extension).await;
        send(&mut second, json!({"type": "get_text", "selector": "b", "requestId": "r1"})).await;
        let b = recv(&mut extension).await;
        assert_ne!(a["requestId"], b["requestId"]);

        send(&mut extension, json!({"requestId": b["requestId"], "success": true, "text": b["selector"]})).await;
        send(&mut extension, json!({"requestId": a["requestId"], "success": true, "text": a["selector"]})).await;

        let reply_first = recv(&mut first).await;
        let reply_second = recv(&mut second).await;
        assert_eq!(reply_first["requestId"], "r1");
        assert_eq!(reply_first["text"], "a");
        assert_eq!(reply_second["requestId"], "r1");
        assert_eq!(reply_second["text"], "b");
        assert_eq!(state.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_extension_disconnect_fails_pending() {
        let (addr, state) = spawn_relay(30).await;
        let mut extension = connect_extension(addr, &state).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"type": "get_tabs", "requestId": "r4"})).await;
        let _ = recv(&mut extension).await;
        extension.close(None).await.unwrap();

        let reply = recv(&mut client).await;
        assert_eq!(reply["error"], ERR_PEER_DISCONNECTED);
        assert_eq!(reply["requestId"], "r4");
        assert_eq!(state.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_latest_handshake_wins() {
        let (addr, state) = spawn_relay(30).await;
        let mut old = connect_extension(addr, &state).await;
        let mut new = connect_extension(addr, &state).await;
        let mut client = connect(addr).await;

        send(&mut client, json!({"type": "get_tabs", "requestId": "r5"})).await;
        let forwarded = recv(&mut new).await;
        assert_eq!(forwarded["requestId"], "r5");
        send(&mut new, json!({"requestId": "r5", "success": true})).await;
        assert_eq!(recv(&mut client).await["success"], true);

        // The replaced link closing must not unregister the live one.
        old.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.has_extension().await);
    }

    #[tokio::test]
    async fn test_malformed_client_frame_is_ignored() {
        let (addr, _state) = spawn_relay(30).await;
        let mut client = connect(addr).await;

        client.send(Message::Text("{not json".to_string())).await.unwrap();
        send(&mut client, json!({"type": "get_tabs", "requestId": "r6"})).await;

        let reply = recv(&mut client).await;
        assert_eq!(reply["requestId"], "r6");
        assert_eq!(reply["error"], ERR_PEER_NOT_CONNECTED);
    }
}
