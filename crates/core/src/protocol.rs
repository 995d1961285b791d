//! Wire protocol shared by the relay, its clients and the browser extension.
//!
//! Every frame is one JSON object. The extension announces itself with
//! `{"type": "extension_connected"}` and keeps the link alive with
//! `{"type": "ping"}`. Commands travel as `{"type": <name>, "requestId": ..,
//! ..fields, "tabId"?: ..}` and come back as `{"requestId": .., "success": ..,
//! ..payload}` or `{"error": .., "requestId"?: ..}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;

use crate::error::Error;

pub const HANDSHAKE_TYPE: &str = "extension_connected";
pub const HEARTBEAT_TYPE: &str = "ping";

/// Relay reply when no extension link is registered.
pub const ERR_PEER_NOT_CONNECTED: &str = "Extension not connected";
/// Relay reply when the extension did not answer in time.
pub const ERR_RELAY_TIMEOUT: &str = "Timeout";
/// Reply synthesized by a client that gave up waiting on the relay.
pub const ERR_CLIENT_TIMEOUT: &str = "Timeout waiting for response";
/// Relay reply for requests stranded by an extension disconnect.
pub const ERR_PEER_DISCONNECTED: &str = "Extension disconnected";

/// The chat product driven inside the browser tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Product {
    #[serde(rename = "chatgpt")]
    ChatGpt,
    Grok,
}

impl Product {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatGpt => "chatgpt",
            Self::Grok => "grok",
        }
    }

    pub fn home_url(&self) -> &'static str {
        match self {
            Self::ChatGpt => "https://chatgpt.com/",
            Self::Grok => "https://grok.com/",
        }
    }

    /// Product-scoped command name, e.g. `chatgpt_send_message`.
    pub fn command(&self, op: &str) -> String {
        format!("{}_{}", self.name(), op)
    }

    pub fn attach_command(&self) -> String {
        match self {
            Self::ChatGpt => self.command("attach_file"),
            Self::Grok => "attach_file".to_string(),
        }
    }

    /// Grok exposes modes but no separate reasoning-intensity control.
    pub fn supports_thinking(&self) -> bool {
        matches!(self, Self::ChatGpt)
    }

    /// Selectors tried, in order, when the product's own response command
    /// returns nothing.
    pub fn assistant_selectors(&self) -> &'static [&'static str] {
        match self {
            Self::ChatGpt => &[
                r#"[data-message-author-role="assistant"] .markdown"#,
                r#"[data-message-author-role="assistant"]"#,
            ],
            Self::Grok => &[
                r#"[data-testid="messageText"]"#,
                r#"[data-testid="tweetText"]"#,
                "article",
            ],
        }
    }

    /// Selectors for the prompt input box.
    pub fn input_selectors(&self) -> &'static [&'static str] {
        match self {
            Self::ChatGpt => &[
                "#prompt-textarea",
                r#"div[contenteditable="true"][data-placeholder]"#,
                r#"div[contenteditable="true"]"#,
            ],
            Self::Grok => &["textarea", r#"div[contenteditable="true"]"#],
        }
    }
}

impl Default for Product {
    fn default() -> Self {
        Self::ChatGpt
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Product {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chatgpt" | "gpt" | "openai" => Ok(Self::ChatGpt),
            "grok" | "xai" => Ok(Self::Grok),
            other => Err(Error::Validation(format!("unknown product '{}'", other))),
        }
    }
}

/// The closed set of commands a client may issue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetTabs,
    NewTab { url: String },
    CloseTab { tab_id: i64 },
    SwitchTab { tab_id: i64 },
    Click { selector: String, tab_id: Option<i64> },
    Type { text: String, selector: String, tab_id: Option<i64> },
    GetText { selector: String, tab_id: Option<i64> },
    GetElements { tab_id: Option<i64> },
    InspectDom {
        selector: Option<String>,
        mode: String,
        text: Option<String>,
        tab_id: Option<i64>,
    },
    Screenshot { tab_id: Option<i64> },
    SendMessage { product: Product, message: String, tab_id: Option<i64> },
    GetResponse { product: Product, tab_id: Option<i64> },
    IsGenerating { product: Product, tab_id: Option<i64> },
    GetModels { product: Product, tab_id: Option<i64> },
    SelectModel { product: Product, model: String, tab_id: Option<i64> },
    SetMode { product: Product, mode: String, tab_id: Option<i64> },
    SetThinking { product: Product, level: String, tab_id: Option<i64> },
    AttachFile {
        product: Product,
        file_name: String,
        mime_type: String,
        /// Base64-encoded file content.
        file_data: String,
        tab_id: Option<i64>,
    },
}

impl Command {
    /// Wire name carried in the frame's `type` field.
    pub fn name(&self) -> String {
        match self {
            Command::GetTabs => "get_tabs".to_string(),
            Command::NewTab { .. } => "new_tab".to_string(),
            Command::CloseTab { .. } => "close_tab".to_string(),
            Command::SwitchTab { .. } => "switch_tab".to_string(),
            Command::Click { .. } => "click".to_string(),
            Command::Type { .. } => "type".to_string(),
            Command::GetText { .. } => "get_text".to_string(),
            Command::GetElements { .. } => "get_elements".to_string(),
            Command::InspectDom { .. } => "inspect_dom".to_string(),
            Command::Screenshot { .. } => "screenshot".to_string(),
            Command::SendMessage { product, .. } => product.command("send_message"),
            Command::GetResponse { product, .. } => product.command("get_response"),
            Command::IsGenerating { product, .. } => product.command("is_generating"),
            Command::GetModels { product, .. } => product.command("get_models"),
            Command::SelectModel { product, .. } => product.command("select_model"),
            Command::SetMode { product, .. } => product.command("set_mode"),
            Command::SetThinking { product, .. } => product.command("set_thinking"),
            Command::AttachFile { product, .. } => product.attach_command(),
        }
    }

    pub fn tab_id(&self) -> Option<i64> {
        match self {
            Command::GetTabs | Command::NewTab { .. } => None,
            Command::CloseTab { tab_id } | Command::SwitchTab { tab_id } => Some(*tab_id),
            Command::Click { tab_id, .. }
            | Command::Type { tab_id, .. }
            | Command::GetText { tab_id, .. }
            | Command::GetElements { tab_id }
            | Command::InspectDom { tab_id, .. }
            | Command::Screenshot { tab_id }
            | Command::SendMessage { tab_id, .. }
            | Command::GetResponse { tab_id, .. }
            | Command::IsGenerating { tab_id, .. }
            | Command::GetModels { tab_id, .. }
            | Command::SelectModel { tab_id, .. }
            | Command::SetMode { tab_id, .. }
            | Command::SetThinking { tab_id, .. }
            | Command::AttachFile { tab_id, .. } => *tab_id,
        }
    }

    /// Serialize into a command frame tagged with `request_id`.
    pub fn to_frame(&self, request_id: &str) -> Value {
        let mut frame = match self {
            Command::GetTabs
            | Command::CloseTab { .. }
            | Command::SwitchTab { .. }
            | Command::GetElements { .. }
            | Command::Screenshot { .. }
            | Command::GetResponse { .. }
            | Command::IsGenerating { .. }
            | Command::GetModels { .. } => json!({}),
            Command::NewTab { url } => json!({ "url": url }),
            Command::Click { selector, .. } | Command::GetText { selector, .. } => {
                json!({ "selector": selector })
            }
            Command::Type { text, selector, .. } => json!({ "text": text, "selector": selector }),
            Command::InspectDom { selector, mode, text, .. } => {
                let mut options = json!({ "mode": mode });
                if let Some(text) = text {
                    options["text"] = json!(text);
                }
                let mut frame = json!({ "options": options });
                if let Some(selector) = selector {
                    frame["selector"] = json!(selector);
                }
                frame
            }
            Command::SendMessage { message, .. } => json!({ "message": message }),
            Command::SelectModel { model, .. } => json!({ "model": model }),
            Command::SetMode { mode, .. } => json!({ "mode": mode }),
            Command::SetThinking { level, .. } => json!({ "level": level }),
            Command::AttachFile { file_name, mime_type, file_data, .. } => json!({
                "fileName": file_name,
                "mimeType": mime_type,
                "fileData": file_data,
            }),
        };
        frame["type"] = json!(self.name());
        frame["requestId"] = json!(request_id);
        if let Some(tab_id) = self.tab_id() {
            frame["tabId"] = json!(tab_id);
        }
        frame
    }
}

/// An open browser tab as reported by `get_tabs` / `new_tab`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub active: bool,
}

/// A reply frame. Known payload fields are typed; anything else lands in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generating: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tabs: Option<Vec<TabInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    pub fn from_value(value: Value) -> crate::Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Protocol(format!("invalid reply frame: {}", e)))
    }

    pub fn error(message: &str, request_id: Option<&str>) -> Self {
        Self {
            request_id: request_id.map(str::to_string),
            error: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.success == Some(true)
    }

    /// Convert into a `Result`, classifying relay and peer failures.
    pub fn into_result(self, command: &str) -> crate::Result<Self> {
        if let Some(err) = self.error.as_deref() {
            return Err(classify_error(err, command));
        }
        if self.success != Some(true) {
            return Err(Error::Peer(format!("{} reported no success", command)));
        }
        Ok(self)
    }
}

fn classify_error(message: &str, command: &str) -> Error {
    match message {
        ERR_PEER_NOT_CONNECTED | ERR_PEER_DISCONNECTED => Error::PeerNotConnected,
        ERR_RELAY_TIMEOUT | ERR_CLIENT_TIMEOUT => Error::Timeout(format!("{} timed out", command)),
        other => Error::Peer(format!("{}: {}", command, other)),
    }
}

/// A frame received by the relay, classified by its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Handshake,
    Heartbeat,
    Message(Map<String, Value>),
}

impl InboundFrame {
    /// `None` for anything that is not a JSON object.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let Value::Object(map) = value else {
            return None;
        };
        match map.get("type").and_then(|v| v.as_str()) {
            Some(HANDSHAKE_TYPE) => Some(Self::Handshake),
            Some(HEARTBEAT_TYPE) => Some(Self::Heartbeat),
            _ => Some(Self::Message(map)),
        }
    }
}

pub fn request_id_of(frame: &Map<String, Value>) -> Option<&str> {
    frame
        .get("requestId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}
