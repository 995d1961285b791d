//! Follow-up work in tabs a previous run left open: multi-turn chat and
//! one-shot recovery of an answer that was never collected.

use std::path::PathBuf;
use tabrelay_core::{Error, FailureKind, Result, TaskResult};
use tracing::{debug, info, warn};

use crate::citations::clean_citations;
use crate::registry::{sanitize_topic, SessionRegistry, SessionTab};
use crate::supervisor::{failure, skipped, Supervisor, TaskOptions, TOPIC_MAX_LEN};

const PARTIAL_CAPTURE_WARNING: &str = "Response is still generating. This is a partial capture.";
const NO_WAIT_WARNING: &str = "Sent without waiting for the answer";

#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// Wait for each answer before sending the next message.
    pub wait: bool,
    /// Attached once, before the first message.
    pub attachments: Vec<PathBuf>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            wait: true,
            attachments: Vec::new(),
        }
    }
}

/// Which tab `recover` reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoverTarget {
    /// A tab id, reopened from the registry when it was closed.
    Tab(i64),
    /// A conversation url, opened in a new tab.
    Url(String),
}

impl Supervisor {
    /// Continue a conversation with one or more messages, sent in order.
    ///
    /// The tab is `tab_id` when given, otherwise the registry's active
    /// session tab. A closed tab is reopened from its stored url. Every
    /// message yields one result; after the first failure the rest are
    /// reported as not sent.
    pub async fn chat(
        &self,
        messages: &[String],
        tab_id: Option<i64>,
        opts: &ChatOptions,
        registry: &mut SessionRegistry,
    ) -> Result<Vec<TaskResult>> {
        if messages.is_empty() {
            return Err(Error::Validation("no messages given".to_string()));
        }

        let tab = match self.resolve_chat_tab(tab_id, registry).await {
            Ok(tab) => tab,
            Err(e) => {
                warn!(?tab_id, error = %e, "No tab to chat in");
                return Ok(messages
                    .iter()
                    .enumerate()
                    .map(|(i, m)| failure(i, m, &e, FailureKind::NoSession).with_tab(tab_id))
                    .collect());
            }
        };

        let topic = match tab.topic.clone() {
            Some(topic) => topic,
            None => {
                let topic = sanitize_topic(&messages[0], TOPIC_MAX_LEN);
                registry.set_topic(tab.id, &topic);
                topic
            }
        };
        info!(tab_id = tab.id, topic = %topic, count = messages.len(), "Continuing conversation");

        if !opts.attachments.is_empty() {
            let setup = TaskOptions {
                attachments: opts.attachments.clone(),
                ..Default::default()
            };
            self.configure_tab(tab.id, &setup).await;
        }

        let mut results = Vec::with_capacity(messages.len());
        let mut blocked: Option<TaskResult> = None;
        for (index, message) in messages.iter().enumerate() {
            if let Some(cause) = &blocked {
                results.push(skipped(index, message, cause));
                continue;
            }

            let result = if opts.wait {
                self.ask_in_tab(index, message, tab.id, &opts.attachments).await
            } else {
                self.send_only(index, message, tab.id).await
            };
            let result = result.with_topic(Some(topic.clone()));
            if let Some(url) = &result.url {
                registry.update_url(tab.id, url);
            }
            if !result.success {
                blocked = Some(result.clone());
            }
            results.push(result);
        }

        registry.persist().await;
        Ok(results)
    }

    async fn send_only(&self, index: usize, message: &str, tab_id: i64) -> TaskResult {
        let started = tokio::time::Instant::now();
        let sent = self.peer.send_message(message, Some(tab_id)).await;
        let url = self.peer.tab_url(tab_id).await.ok().flatten();
        match sent {
            Ok(()) => TaskResult::succeeded(index, message, String::new(), Some(tab_id), started.elapsed())
                .with_url(url)
                .with_warning(NO_WAIT_WARNING),
            Err(e) => failure(index, message, &e, FailureKind::SendFailed)
                .with_tab(Some(tab_id))
                .with_url(url),
        }
    }

    async fn resolve_chat_tab(&self, tab_id: Option<i64>, registry: &mut SessionRegistry) -> Result<SessionTab> {
        let Some(tab_id) = tab_id else {
            return registry
                .get_active_session_tab(&self.peer, self.config.reopen_load_delay())
                .await?
                .ok_or_else(|| Error::NoSession("no session tab is open or reopenable; run a search first".to_string()));
        };

        let open = self.peer.get_tabs().await?;
        if let Some(live) = open.into_iter().find(|t| t.id == tab_id) {
            match registry.get(tab_id) {
                Some(_) => {
                    if let Some(url) = live.url.as_deref().filter(|u| !u.is_empty()) {
                        registry.update_url(tab_id, url);
                    }
                }
                None => registry.register(SessionTab::new(tab_id, live.url, None)),
            }
            return registry
                .get(tab_id)
                .cloned()
                .ok_or_else(|| Error::NoSession(format!("tab {} is not registered", tab_id)));
        }

        self.reopen(tab_id, registry).await
    }

    /// Reopen a closed registry tab from its stored url and point the entry
    /// at the new tab.
    async fn reopen(&self, tab_id: i64, registry: &mut SessionRegistry) -> Result<SessionTab> {
        let url = registry
            .url_of(tab_id)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::NoSession(format!("tab {} is closed and has no stored url", tab_id)))?;

        info!(tab_id, url = %url, "Reopening closed tab");
        let tab = self.peer.new_tab(&url).await?;
        tokio::time::sleep(self.config.reopen_load_delay()).await;
        let current = self.peer.tab_url(tab.id).await.ok().flatten().unwrap_or(url);
        registry.retarget(tab_id, tab.id, Some(current));
        registry.persist().await;
        registry
            .get(tab.id)
            .cloned()
            .ok_or_else(|| Error::NoSession(format!("tab {} vanished from the registry", tab.id)))
    }

    /// Read the current answer of a tab once, without sending anything.
    ///
    /// A tab that is still generating gives a success carrying a warning.
    pub async fn recover(
        &self,
        target: RecoverTarget,
        attachments: &[PathBuf],
        registry: &mut SessionRegistry,
    ) -> TaskResult {
        let label = match &target {
            RecoverTarget::Tab(id) => format!("tab {}", id),
            RecoverTarget::Url(url) => url.clone(),
        };

        let (tab_id, topic) = match target {
            RecoverTarget::Url(url) => {
                let tab = match self.peer.new_tab(&url).await {
                    Ok(tab) => tab,
                    Err(e) => return failure(0, &label, &e, FailureKind::TabOpenFailed),
                };
                tokio::time::sleep(self.config.reopen_load_delay()).await;
                let live = self.peer.tab_url(tab.id).await.ok().flatten().unwrap_or_else(|| url.clone());
                let topic = sanitize_topic(&url, TOPIC_MAX_LEN);
                registry.register(SessionTab::new(tab.id, Some(live), Some(topic.clone())));
                registry.persist().await;
                (tab.id, topic)
            }
            RecoverTarget::Tab(tab_id) => {
                let open = match self.peer.get_tabs().await {
                    Ok(open) => open,
                    Err(e) => return failure(0, &label, &e, FailureKind::Transport).with_tab(Some(tab_id)),
                };
                let tab_id = if open.iter().any(|t| t.id == tab_id) {
                    tab_id
                } else {
                    match self.reopen(tab_id, registry).await {
                        Ok(tab) => tab.id,
                        Err(e) => return failure(0, &label, &e, FailureKind::NoSession).with_tab(Some(tab_id)),
                    }
                };
                let topic = registry.topic_of(tab_id).unwrap_or("recover").to_string();
                (tab_id, topic)
            }
        };

        let started = tokio::time::Instant::now();
        let generating = match self.peer.is_generating(Some(tab_id)).await {
            Ok(generating) => generating,
            Err(e) => {
                debug!(tab_id, error = %e, "Generation state unknown");
                false
            }
        };
        let snapshot = match self.peer.get_response(Some(tab_id)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return failure(0, &label, &e, FailureKind::PeerError)
                    .with_tab(Some(tab_id))
                    .with_topic(Some(topic))
            }
        };
        let url = self.peer.tab_url(tab_id).await.ok().flatten();
        if let Some(url) = &url {
            if registry.update_url(tab_id, url) {
                registry.persist().await;
            }
        }

        let text = clean_citations(&snapshot.text, attachments);
        if text.is_empty() {
            return TaskResult::failed(0, &label, FailureKind::EmptyResponse, "tab holds no answer text")
                .with_tab(Some(tab_id))
                .with_url(url)
                .with_topic(Some(topic));
        }

        info!(tab_id, len = text.len(), generating, "Recovered answer");
        let result = TaskResult::succeeded(0, &label, text, Some(tab_id), started.elapsed())
            .with_url(url)
            .with_topic(Some(topic));
        if generating {
            result.with_warning(PARTIAL_CAPTURE_WARNING)
        } else {
            result
        }
    }
}
