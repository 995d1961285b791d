//! Durable tab bookkeeping so a later invocation can pick a conversation
//! back up.
//!
//! One JSON document per product (`sessions/<product>.json`), rewritten
//! wholesale on every save. There is no file locking: two processes saving
//! at once lose one of the updates. The rewrite goes through a temporary
//! file and a rename so a reader never sees a half-written document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabrelay_client::PeerClient;
use tabrelay_core::{Error, Result};
use tracing::{debug, info, warn};

/// Last known address and label of one conversation tab.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionTab {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionTab {
    pub fn new(id: i64, url: Option<String>, topic: Option<String>) -> Self {
        Self {
            id,
            url,
            topic,
            updated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionStore {
    version: u32,
    tabs: Vec<SessionTab>,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    path: PathBuf,
    tabs: Vec<SessionTab>,
}

impl SessionRegistry {
    pub fn empty(path: PathBuf) -> Self {
        Self { path, tabs: Vec::new() }
    }

    /// Read the registry at `path`. A missing or unreadable document yields
    /// an empty registry.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::empty(path));
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let tabs = match serde_json::from_str::<Value>(&content) {
            Ok(doc) => normalize(doc.get("tabs").unwrap_or(&Value::Null)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Session file is not valid JSON, starting empty");
                Vec::new()
            }
        };
        debug!(count = tabs.len(), "Loaded session tabs");
        Ok(Self { path, tabs })
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let store = SessionStore {
            version: 1,
            tabs: dedupe(self.tabs.clone()),
        };
        let content = serde_json::to_string_pretty(&store)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), count = store.tabs.len(), "Saved session tabs");
        Ok(())
    }

    /// Save, logging instead of failing. Registry writes never fail a task.
    pub async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!(path = %self.path.display(), error = %e, "Failed to save session tabs");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tabs(&self) -> &[SessionTab] {
        &self.tabs
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn get(&self, tab_id: i64) -> Option<&SessionTab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }

    pub fn url_of(&self, tab_id: i64) -> Option<&str> {
        self.get(tab_id).and_then(|t| t.url.as_deref())
    }

    pub fn topic_of(&self, tab_id: i64) -> Option<&str> {
        self.get(tab_id).and_then(|t| t.topic.as_deref())
    }

    /// First entry, in registry order, labelled with `topic`.
    pub fn find_by_topic(&self, topic: &str) -> Option<&SessionTab> {
        self.tabs.iter().find(|t| t.topic.as_deref() == Some(topic))
    }

    pub fn replace_all(&mut self, tabs: Vec<SessionTab>) {
        self.tabs = dedupe(tabs.into_iter().filter(|t| t.id > 0).collect());
    }

    /// Append `tab`, dropping entries that share its id or its url.
    pub fn register(&mut self, tab: SessionTab) {
        self.tabs
            .retain(|t| t.id != tab.id && (tab.url.is_none() || t.url != tab.url));
        self.tabs.push(tab);
    }

    /// Record an observed url. Returns whether anything changed.
    pub fn update_url(&mut self, tab_id: i64, url: &str) -> bool {
        match self.tabs.iter_mut().find(|t| t.id == tab_id) {
            Some(entry) if entry.url.as_deref() != Some(url) => {
                entry.url = Some(url.to_string());
                entry.updated_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn set_topic(&mut self, tab_id: i64, topic: &str) -> bool {
        match self.tabs.iter_mut().find(|t| t.id == tab_id) {
            Some(entry) => {
                entry.topic = Some(topic.to_string());
                entry.updated_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Point the entry for `old_id` at a reopened tab. Any other entry that
    /// already claimed `new_id` is dropped so ids stay unique.
    pub fn retarget(&mut self, old_id: i64, new_id: i64, url: Option<String>) -> bool {
        let Some(pos) = self.tabs.iter().position(|t| t.id == old_id) else {
            return false;
        };
        let mut entry = self.tabs.remove(pos);
        entry.id = new_id;
        if url.is_some() {
            entry.url = url;
        }
        entry.updated_at = Some(Utc::now());

        self.tabs.retain(|t| t.id != new_id);
        let pos = pos.min(self.tabs.len());
        self.tabs.insert(pos, entry);
        true
    }

    /// The tab to continue the conversation in.
    ///
    /// The first registered tab that is still open wins, with its url
    /// refreshed from the live tab. Failing that, the first entry with a
    /// stored url is reopened and retargeted. `None` when nothing is open
    /// and nothing can be reopened.
    pub async fn get_active_session_tab(
        &mut self,
        peer: &PeerClient,
        reopen_wait: Duration,
    ) -> Result<Option<SessionTab>> {
        let open = peer.get_tabs().await?;

        let live = self.tabs.iter().find_map(|entry| {
            open.iter()
                .find(|t| t.id == entry.id)
                .map(|t| (entry.id, t.url.clone()))
        });
        if let Some((tab_id, live_url)) = live {
            if let Some(url) = live_url.filter(|u| !u.is_empty()) {
                if self.update_url(tab_id, &url) {
                    self.persist().await;
                }
            }
            return Ok(self.get(tab_id).cloned());
        }

        let candidates: Vec<(i64, String)> = self
            .tabs
            .iter()
            .filter_map(|t| t.url.clone().filter(|u| !u.is_empty()).map(|u| (t.id, u)))
            .collect();
        for (old_id, url) in candidates {
            info!(tab_id = old_id, url = %url, "Session tab closed, reopening from stored url");
            let tab = match peer.new_tab(&url).await {
                Ok(tab) => tab,
                Err(Error::PeerNotConnected) => return Err(Error::PeerNotConnected),
                Err(e) => {
                    warn!(tab_id = old_id, error = %e, "Reopen failed");
                    continue;
                }
            };
            tokio::time::sleep(reopen_wait).await;
            let current = peer.tab_url(tab.id).await.ok().flatten().unwrap_or(url);
            self.retarget(old_id, tab.id, Some(current));
            self.persist().await;
            return Ok(self.get(tab.id).cloned());
        }

        Ok(None)
    }
}

/// Turn a persisted `tabs` array into records. Bare integers are legacy
/// entries; anything without a positive integer id is dropped.
fn normalize(raw: &Value) -> Vec<SessionTab> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    let tabs = items
        .iter()
        .filter_map(|item| match item {
            Value::Number(n) => n.as_i64().filter(|id| *id > 0).map(|id| SessionTab {
                id,
                url: None,
                topic: None,
                updated_at: None,
            }),
            Value::Object(_) => serde_json::from_value::<SessionTab>(item.clone())
                .ok()
                .filter(|t| t.id > 0),
            _ => None,
        })
        .collect();
    dedupe(tabs)
}

/// Keep the first entry for each tab id.
fn dedupe(tabs: Vec<SessionTab>) -> Vec<SessionTab> {
    let mut seen = HashSet::new();
    tabs.into_iter().filter(|t| seen.insert(t.id)).collect()
}

/// File-name-safe label derived from free text, at most `max_len` chars.
pub fn sanitize_topic(text: &str, max_len: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let replaced: String = collapsed
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();
    let topic: String = replaced
        .trim_matches(|c| c == ' ' || c == '.' || c == '_')
        .replace(' ', "_")
        .chars()
        .take(max_len)
        .collect();
    if topic.is_empty() {
        "untitled".to_string()
    } else {
        topic
    }
}
