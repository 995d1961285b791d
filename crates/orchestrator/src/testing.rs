//! In-memory browser used by the supervisor and conversation tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tabrelay_client::{PeerClient, Transport};
use tabrelay_core::protocol::ERR_PEER_NOT_CONNECTED;
use tabrelay_core::{Command, Product, Reply, Result};

#[derive(Debug, Clone, Default)]
pub(crate) struct TabState {
    pub url: String,
    pub answer: String,
    pub count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct BrowserState {
    pub next_id: i64,
    pub tabs: Vec<(i64, TabState)>,
    /// Tabs whose answer never stops generating.
    pub stuck: HashSet<i64>,
    /// Tabs that refuse every message.
    pub refuse_send: HashSet<i64>,
    /// `new_tab` calls (0-based) that fail.
    pub fail_open: HashSet<usize>,
    pub open_calls: usize,
    pub connected: bool,
    pub log: Vec<String>,
    pub sent: HashMap<i64, Vec<String>>,
}

pub(crate) struct FakeBrowser {
    pub state: Mutex<BrowserState>,
}

pub(crate) fn long_answer(message: &str) -> String {
    format!("Answer to {}: {}", message, ["lorem ipsum"; 12].join(" "))
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrowserState {
                next_id: 101,
                connected: true,
                ..Default::default()
            }),
        })
    }

    pub fn peer(self: &Arc<Self>, product: Product) -> PeerClient {
        PeerClient::new(self.clone(), product)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut BrowserState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Put an already-open tab into the browser.
    pub fn open_tab(&self, id: i64, url: &str, answer: &str, count: u64) {
        self.with(|s| {
            s.tabs.push((
                id,
                TabState {
                    url: url.to_string(),
                    answer: answer.to_string(),
                    count,
                },
            ))
        });
    }

    pub fn is_open(&self, id: i64) -> bool {
        self.with(|s| s.tabs.iter().any(|(t, _)| *t == id))
    }

    pub fn count(&self, name: &str) -> usize {
        self.with(|s| s.log.iter().filter(|n| n.as_str() == name).count())
    }

    fn handle(&self, command: &Command) -> Value {
        let mut s = self.state.lock().unwrap();
        s.log.push(command.name());
        if !s.connected {
            return json!({ "error": ERR_PEER_NOT_CONNECTED });
        }

        let tab_id = command.tab_id();
        match command {
            Command::GetTabs => {
                let tabs: Vec<Value> = s
                    .tabs
                    .iter()
                    .map(|(id, t)| json!({"id": id, "url": t.url, "title": "chat"}))
                    .collect();
                json!({"success": true, "tabs": tabs})
            }
            Command::NewTab { url } => {
                let call = s.open_calls;
                s.open_calls += 1;
                if s.fail_open.contains(&call) {
                    return json!({"error": "Failed to create tab"});
                }
                let id = s.next_id;
                s.next_id += 1;
                s.tabs.push((
                    id,
                    TabState {
                        url: url.clone(),
                        ..Default::default()
                    },
                ));
                json!({"success": true, "tab": {"id": id, "url": url}})
            }
            Command::CloseTab { tab_id } => {
                s.tabs.retain(|(id, _)| id != tab_id);
                json!({"success": true})
            }
            Command::SendMessage { message, .. } => {
                let Some(id) = tab_id else {
                    return json!({"error": "No tab"});
                };
                if s.refuse_send.contains(&id) {
                    return json!({"error": "Input not found"});
                }
                s.sent.entry(id).or_default().push(message.clone());
                let Some((_, tab)) = s.tabs.iter_mut().find(|(t, _)| *t == id) else {
                    return json!({"error": "No tab with id"});
                };
                tab.answer = long_answer(message);
                tab.count += 1;
                if !tab.url.contains("/c/") {
                    tab.url = format!("{}c/conv-{}", tab.url, id);
                }
                json!({"success": true})
            }
            Command::IsGenerating { .. } => {
                let generating = tab_id.map(|id| s.stuck.contains(&id)).unwrap_or(false);
                json!({"success": true, "generating": generating})
            }
            Command::GetResponse { .. } => {
                let tab = tab_id.and_then(|id| s.tabs.iter().find(|(t, _)| *t == id));
                match tab {
                    Some((id, t)) => {
                        // A stuck tab keeps streaming.
                        let text = if s.stuck.contains(id) {
                            format!("{} {}", t.answer, s.log.len())
                        } else {
                            t.answer.clone()
                        };
                        json!({"success": true, "response": text, "responseCount": t.count})
                    }
                    None => json!({"error": "No tab with id"}),
                }
            }
            Command::InspectDom { .. } => json!({"success": true, "matchCount": 1, "elements": [{"visible": true}]}),
            Command::GetText { .. } => json!({"success": true, "texts": []}),
            _ => json!({"success": true}),
        }
    }
}

#[async_trait]
impl Transport for FakeBrowser {
    async fn request(&self, command: Command) -> Result<Reply> {
        let value = self.handle(&command);
        Reply::from_value(value)
    }
}
