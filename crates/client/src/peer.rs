//! Typed operations on the browser extension, for one chat product.

use base64::Engine;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabrelay_core::config::SupervisorConfig;
use tabrelay_core::{Command, Error, Product, Reply, Result, TabInfo};
use tracing::{debug, warn};

use crate::transport::Transport;

const INPUT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ATTACH_GAP: Duration = Duration::from_millis(500);

/// How hard `send_message` tries before giving up.
#[derive(Debug, Clone)]
pub struct SendPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
    pub input_ready_timeout: Duration,
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

impl SendPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            retries: config.send_retries,
            retry_delay: config.send_retry_delay(),
            input_ready_timeout: config.input_ready_timeout(),
        }
    }
}

/// The answer currently shown in a tab.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSnapshot {
    pub text: String,
    /// Number of assistant messages in the conversation, when reported.
    pub response_count: Option<u64>,
}

#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn Transport>,
    product: Product,
    policy: SendPolicy,
}

impl PeerClient {
    pub fn new(transport: Arc<dyn Transport>, product: Product) -> Self {
        Self {
            transport,
            product,
            policy: SendPolicy::default(),
        }
    }

    pub fn with_send_policy(mut self, policy: SendPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn product(&self) -> Product {
        self.product
    }

    pub async fn ensure_ready(&self) -> Result<()> {
        self.transport.ensure_ready().await
    }

    /// Issue `command`; anything but a `success: true` reply is an error.
    pub async fn call(&self, command: Command) -> Result<Reply> {
        let name = command.name();
        self.transport.request(command).await?.into_result(&name)
    }

    // ---- tabs ----

    pub async fn get_tabs(&self) -> Result<Vec<TabInfo>> {
        Ok(self.call(Command::GetTabs).await?.tabs.unwrap_or_default())
    }

    pub async fn new_tab(&self, url: &str) -> Result<TabInfo> {
        let reply = self.call(Command::NewTab { url: url.to_string() }).await?;
        match reply.tab {
            Some(tab) if tab.id != 0 => Ok(tab),
            _ => Err(Error::Peer("new_tab returned no tab id".to_string())),
        }
    }

    pub async fn close_tab(&self, tab_id: i64) -> Result<()> {
        self.call(Command::CloseTab { tab_id }).await.map(|_| ())
    }

    pub async fn switch_tab(&self, tab_id: i64) -> Result<()> {
        self.call(Command::SwitchTab { tab_id }).await.map(|_| ())
    }

    /// Current url of an open tab, `None` when the tab is not open.
    pub async fn tab_url(&self, tab_id: i64) -> Result<Option<String>> {
        let tabs = self.get_tabs().await?;
        Ok(tabs.into_iter().find(|t| t.id == tab_id).and_then(|t| t.url))
    }

    // ---- generic DOM ----

    pub async fn click(&self, selector: &str, tab_id: Option<i64>) -> Result<()> {
        self.call(Command::Click {
            selector: selector.to_string(),
            tab_id,
        })
        .await
        .map(|_| ())
    }

    pub async fn type_text(&self, selector: &str, text: &str, tab_id: Option<i64>) -> Result<()> {
        self.call(Command::Type {
            text: text.to_string(),
            selector: selector.to_string(),
            tab_id,
        })
        .await
        .map(|_| ())
    }

    /// Texts of every element matching `selector`.
    pub async fn get_text(&self, selector: &str, tab_id: Option<i64>) -> Result<Vec<String>> {
        let reply = self
            .call(Command::GetText {
                selector: selector.to_string(),
                tab_id,
            })
            .await?;
        Ok(match (reply.texts, reply.text) {
            (Some(texts), _) => texts,
            (None, Some(text)) => vec![text],
            (None, None) => Vec::new(),
        })
    }

    pub async fn get_elements(&self, tab_id: Option<i64>) -> Result<Vec<Value>> {
        Ok(self.call(Command::GetElements { tab_id }).await?.elements.unwrap_or_default())
    }

    /// Elements whose text, selector or type contains `query`, ignoring case.
    /// Each match carries its position in the full list as `index`.
    pub async fn search_elements(&self, query: &str, tab_id: Option<i64>) -> Result<Vec<Value>> {
        let query = query.to_lowercase();
        let elements = self.get_elements(tab_id).await?;
        Ok(elements
            .into_iter()
            .enumerate()
            .filter(|(_, el)| {
                ["text", "selector", "type"].iter().any(|field| {
                    el.get(*field)
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_lowercase().contains(&query))
                        .unwrap_or(false)
                })
            })
            .map(|(i, mut el)| {
                if let Some(obj) = el.as_object_mut() {
                    obj.insert("index".to_string(), Value::from(i));
                }
                el
            })
            .collect())
    }

    pub async fn inspect_dom(
        &self,
        selector: Option<&str>,
        mode: &str,
        text: Option<&str>,
        tab_id: Option<i64>,
    ) -> Result<Reply> {
        self.call(Command::InspectDom {
            selector: selector.map(str::to_string),
            mode: mode.to_string(),
            text: text.map(str::to_string),
            tab_id,
        })
        .await
    }

    /// Capture the tab as a data url, optionally decoding it into `save_to`.
    pub async fn screenshot(&self, tab_id: Option<i64>, save_to: Option<&Path>) -> Result<String> {
        let reply = self.call(Command::Screenshot { tab_id }).await?;
        let data_url = reply
            .data_url
            .ok_or_else(|| Error::Peer("screenshot returned no image".to_string()))?;

        if let Some(path) = save_to {
            let (_, encoded) = data_url
                .split_once(',')
                .ok_or_else(|| Error::Protocol("screenshot is not a data url".to_string()))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::Protocol(format!("invalid screenshot data: {}", e)))?;
            tokio::fs::write(path, bytes).await?;
            debug!(path = %path.display(), "Screenshot saved");
        }
        Ok(data_url)
    }

    // ---- product ----

    /// Models offered by the product's model picker, as reported.
    pub async fn get_models(&self, tab_id: Option<i64>) -> Result<Vec<Value>> {
        let reply = self
            .call(Command::GetModels {
                product: self.product,
                tab_id,
            })
            .await?;
        Ok(match reply.extra.get("models") {
            Some(Value::Array(models)) => models.clone(),
            _ => Vec::new(),
        })
    }

    pub async fn select_model(&self, model: &str, tab_id: Option<i64>) -> Result<()> {
        self.call(Command::SelectModel {
            product: self.product,
            model: model.to_string(),
            tab_id,
        })
        .await
        .map(|_| ())
    }

    pub async fn set_mode(&self, mode: &str, tab_id: Option<i64>) -> Result<()> {
        self.call(Command::SetMode {
            product: self.product,
            mode: mode.to_string(),
            tab_id,
        })
        .await
        .map(|_| ())
    }

    pub async fn set_thinking(&self, level: &str, tab_id: Option<i64>) -> Result<()> {
        if !self.product.supports_thinking() {
            return Err(Error::Validation(format!(
                "{} has no thinking level, use a mode instead",
                self.product
            )));
        }
        self.call(Command::SetThinking {
            product: self.product,
            level: level.to_string(),
            tab_id,
        })
        .await
        .map(|_| ())
    }

    pub async fn is_generating(&self, tab_id: Option<i64>) -> Result<bool> {
        let reply = self
            .call(Command::IsGenerating {
                product: self.product,
                tab_id,
            })
            .await?;
        Ok(reply.generating.unwrap_or(false))
    }

    /// The latest answer in the tab.
    ///
    /// Falls back to reading the product's assistant message selectors when
    /// the dedicated command comes back empty or fails on the page.
    pub async fn get_response(&self, tab_id: Option<i64>) -> Result<ResponseSnapshot> {
        let mut snapshot = ResponseSnapshot::default();
        match self
            .call(Command::GetResponse {
                product: self.product,
                tab_id,
            })
            .await
        {
            Ok(reply) => {
                snapshot.response_count = reply.response_count;
                if let Some(text) = reply.response.filter(|t| !t.is_empty()) {
                    snapshot.text = text;
                    return Ok(snapshot);
                }
            }
            Err(e @ (Error::PeerNotConnected | Error::Timeout(_) | Error::Connection(_))) => return Err(e),
            Err(e) => debug!(error = %e, "get_response failed, trying assistant selectors"),
        }

        for selector in self.product.assistant_selectors() {
            match self.get_text(selector, tab_id).await {
                Ok(texts) => {
                    if let Some(last) = texts.into_iter().filter(|t| !t.is_empty()).last() {
                        snapshot.text = last;
                        break;
                    }
                }
                Err(e) => debug!(selector, error = %e, "Assistant selector read failed"),
            }
        }
        Ok(snapshot)
    }

    /// Poll until one of the product's input selectors matches a visible
    /// element. Returns false when the wait ran out.
    pub async fn wait_for_input(&self, tab_id: Option<i64>) -> bool {
        let deadline = tokio::time::Instant::now() + self.policy.input_ready_timeout;
        loop {
            for selector in self.product.input_selectors() {
                let command = Command::InspectDom {
                    selector: Some(selector.to_string()),
                    mode: "summary".to_string(),
                    text: None,
                    tab_id,
                };
                match self.transport.request(command).await {
                    Ok(reply) if input_visible(&reply) => return true,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Input check failed");
                        return false;
                    }
                }
            }
            if tokio::time::Instant::now() + INPUT_POLL_INTERVAL > deadline {
                return false;
            }
            tokio::time::sleep(INPUT_POLL_INTERVAL).await;
        }
    }

    /// Deliver `message` to the tab's prompt box, retrying a bounded number
    /// of times. Does not wait for the answer.
    pub async fn send_message(&self, message: &str, tab_id: Option<i64>) -> Result<()> {
        if !self.wait_for_input(tab_id).await {
            debug!(?tab_id, "Input box not confirmed, sending anyway");
        }

        let retries = self.policy.retries.max(1);
        let mut last_error = None;
        for attempt in 1..=retries {
            let command = Command::SendMessage {
                product: self.product,
                message: message.to_string(),
                tab_id,
            };
            match self.call(command).await {
                Ok(_) => return Ok(()),
                Err(Error::PeerNotConnected) => return Err(Error::PeerNotConnected),
                Err(e) => {
                    debug!(?tab_id, attempt, error = %e, "Send attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < retries {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Peer("failed to send message".to_string())))
    }

    pub async fn attach_file(&self, path: &Path, tab_id: Option<i64>) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Validation(format!("cannot read {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        let mime_type = mime_guess::from_path(path).first_or_octet_stream().to_string();

        debug!(file = %file_name, mime = %mime_type, size = bytes.len(), "Attaching file");
        self.call(Command::AttachFile {
            product: self.product,
            file_name,
            mime_type,
            file_data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            tab_id,
        })
        .await
        .map(|_| ())
    }

    /// Attach each file in turn. One failed attachment does not stop the rest.
    pub async fn attach_files(&self, paths: &[PathBuf], tab_id: Option<i64>) -> Vec<(PathBuf, Result<()>)> {
        let mut results = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(ATTACH_GAP).await;
            }
            let result = self.attach_file(path, tab_id).await;
            if let Err(e) = &result {
                warn!(?tab_id, file = %path.display(), error = %e, "Attachment failed");
            }
            results.push((path.clone(), result));
        }
        results
    }
}

fn input_visible(reply: &Reply) -> bool {
    if reply.error.is_some() || reply.match_count.unwrap_or(0) == 0 {
        return false;
    }
    match &reply.elements {
        Some(elements) if !elements.is_empty() => elements
            .iter()
            .any(|el| el.get("visible").and_then(|v| v.as_bool()).unwrap_or(false)),
        _ => true,
    }
}
