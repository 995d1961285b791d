//! Fans questions out over browser tabs and collects one result per question.
//!
//! Tabs are opened and prepared one after another. The answers are then
//! awaited concurrently, one completion detector per tab, all sharing the
//! same peer client. A batch of N questions always yields N results in
//! question order. A failure in one tab never aborts its siblings.

use futures::future::join_all;
use std::path::PathBuf;
use tabrelay_client::PeerClient;
use tabrelay_core::config::{DetectorConfig, SupervisorConfig};
use tabrelay_core::protocol::ERR_PEER_NOT_CONNECTED;
use tabrelay_core::{Config, Error, FailureKind, Result, TaskResult};
use tracing::{debug, info, warn};

use crate::detector::{CompletionDetector, Detection, Phase, TabAnswer};
use crate::registry::{sanitize_topic, SessionRegistry, SessionTab};

pub(crate) const TOPIC_MAX_LEN: usize = 60;

/// Per-tab setup applied before the question is sent.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub model: Option<String>,
    pub thinking: Option<String>,
    pub mode: Option<String>,
    pub attachments: Vec<PathBuf>,
    /// Close the tabs afterwards instead of keeping them for follow-ups.
    pub close_tabs: bool,
}

pub struct Supervisor {
    pub(crate) peer: PeerClient,
    pub(crate) home_url: String,
    pub(crate) config: SupervisorConfig,
    pub(crate) detector: DetectorConfig,
}

/// A question that reached its tab and now awaits an answer.
struct InFlight {
    index: usize,
    question: String,
    tab_id: i64,
    detector: CompletionDetector,
}

impl Supervisor {
    pub fn new(peer: PeerClient, home_url: impl Into<String>, config: SupervisorConfig, detector: DetectorConfig) -> Self {
        Self {
            peer,
            home_url: home_url.into(),
            config,
            detector,
        }
    }

    pub fn from_config(peer: PeerClient, config: &Config) -> Self {
        let home_url = config.home_url(peer.product());
        Self::new(peer, home_url, config.supervisor.clone(), config.detector.clone())
    }

    pub fn peer(&self) -> &PeerClient {
        &self.peer
    }

    /// Ask every question in its own new tab, concurrently.
    ///
    /// Fewer than `min_parallel` questions is a usage error; more than
    /// `max_parallel` are dropped from the end with a warning.
    pub async fn parallel_search(
        &self,
        questions: &[String],
        opts: &TaskOptions,
        registry: &mut SessionRegistry,
    ) -> Result<Vec<TaskResult>> {
        if questions.len() < self.config.min_parallel {
            return Err(Error::Validation(format!(
                "parallel search needs at least {} questions, got {}; use single-session search instead",
                self.config.min_parallel,
                questions.len()
            )));
        }
        let questions = self.truncate(questions);
        let topic = topic_for(questions);
        info!(count = questions.len(), product = %self.peer.product(), "Starting parallel search");

        // Open tabs sequentially.
        let mut slots: Vec<std::result::Result<i64, TaskResult>> = Vec::with_capacity(questions.len());
        for (index, question) in questions.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.tab_open_delay()).await;
            }
            match self.peer.new_tab(&self.home_url).await {
                Ok(tab) => {
                    debug!(index, tab_id = tab.id, "Tab opened");
                    slots.push(Ok(tab.id));
                }
                Err(e) => {
                    warn!(index, error = %e, "Failed to open tab");
                    slots.push(Err(failure(index, question, &e, FailureKind::TabOpenFailed)));
                }
            }
        }
        let tab_ids: Vec<i64> = slots.iter().filter_map(|s| s.as_ref().ok().copied()).collect();
        if !tab_ids.is_empty() {
            tokio::time::sleep(self.config.page_load_delay()).await;
        }

        for tab_id in &tab_ids {
            self.configure_tab(*tab_id, opts).await;
        }

        // Send, starting each detector's clock as its question goes out.
        let mut results: Vec<Option<TaskResult>> = vec![None; questions.len()];
        let mut in_flight = Vec::new();
        for (index, slot) in slots.into_iter().enumerate() {
            let question = &questions[index];
            let tab_id = match slot {
                Ok(tab_id) => tab_id,
                Err(result) => {
                    results[index] = Some(result);
                    continue;
                }
            };

            let mut detector = CompletionDetector::new(self.detector.clone());
            match self.peer.send_message(question, Some(tab_id)).await {
                Ok(()) => {
                    detector.mark_sent();
                    in_flight.push(InFlight {
                        index,
                        question: question.clone(),
                        tab_id,
                        detector,
                    });
                }
                Err(e) => {
                    warn!(index, tab_id, error = %e, "Failed to send question");
                    let url = self.peer.tab_url(tab_id).await.ok().flatten();
                    results[index] =
                        Some(failure(index, question, &e, FailureKind::SendFailed).with_tab(Some(tab_id)).with_url(url));
                }
            }
            tokio::time::sleep(self.config.send_delay()).await;
        }

        info!(waiting = in_flight.len(), timeout_secs = self.detector.timeout_secs, "Waiting for answers");
        let finished = join_all(in_flight.into_iter().map(|task| self.await_answer(task, &opts.attachments))).await;
        for result in finished {
            let index = result.index;
            results[index] = Some(result);
        }

        let results: Vec<TaskResult> = results
            .into_iter()
            .enumerate()
            .map(|(index, r)| {
                r.unwrap_or_else(|| TaskResult::failed(index, &questions[index], FailureKind::PeerError, "no result"))
                    .with_topic(Some(topic.clone()))
            })
            .collect();

        self.finish_batch(&tab_ids, &topic, opts.close_tabs, registry).await;
        log_summary(&results);
        Ok(results)
    }

    /// Ask the questions one after another in a single tab.
    ///
    /// Uses `tab_id` when given, otherwise opens a new tab. After the first
    /// message that cannot be delivered, the remaining questions are not
    /// sent and are reported as failed.
    pub async fn single_session_search(
        &self,
        questions: &[String],
        opts: &TaskOptions,
        tab_id: Option<i64>,
        registry: &mut SessionRegistry,
    ) -> Result<Vec<TaskResult>> {
        if questions.is_empty() {
            return Err(Error::Validation("no questions given".to_string()));
        }
        let questions = self.truncate(questions);
        let topic = topic_for(questions);

        let tab_id = match tab_id {
            Some(id) => id,
            None => match self.peer.new_tab(&self.home_url).await {
                Ok(tab) => {
                    tokio::time::sleep(self.config.page_load_delay()).await;
                    tab.id
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open tab");
                    let kind = FailureKind::TabOpenFailed;
                    return Ok(questions
                        .iter()
                        .enumerate()
                        .map(|(i, q)| failure(i, q, &e, kind).with_topic(Some(topic.clone())))
                        .collect());
                }
            },
        };
        self.configure_tab(tab_id, opts).await;

        let mut results = Vec::with_capacity(questions.len());
        let mut blocked: Option<TaskResult> = None;
        for (index, question) in questions.iter().enumerate() {
            if let Some(cause) = &blocked {
                results.push(skipped(index, question, cause));
                continue;
            }
            let result = self
                .ask_in_tab(index, question, tab_id, &opts.attachments)
                .await
                .with_topic(Some(topic.clone()));
            if matches!(result.error, Some(FailureKind::SendFailed | FailureKind::PeerNotConnected)) {
                blocked = Some(result.clone());
            }
            results.push(result);
        }

        self.finish_batch(&[tab_id], &topic, opts.close_tabs, registry).await;
        log_summary(&results);
        Ok(results)
    }

    /// Send one message to a tab that may already hold earlier answers, and
    /// wait for the new answer.
    pub(crate) async fn ask_in_tab(&self, index: usize, message: &str, tab_id: i64, attachments: &[PathBuf]) -> TaskResult {
        let baseline = match self.peer.get_response(Some(tab_id)).await {
            Ok(snapshot) => snapshot.response_count,
            Err(e) => {
                debug!(tab_id, error = %e, "Could not read answer count before sending");
                None
            }
        };

        let mut detector = CompletionDetector::new(self.detector.clone()).with_baseline(baseline);
        if let Err(e) = self.peer.send_message(message, Some(tab_id)).await {
            warn!(index, tab_id, error = %e, "Failed to send message");
            let url = self.peer.tab_url(tab_id).await.ok().flatten();
            return failure(index, message, &e, FailureKind::SendFailed)
                .with_tab(Some(tab_id))
                .with_url(url);
        }
        detector.mark_sent();

        self.await_answer(
            InFlight {
                index,
                question: message.to_string(),
                tab_id,
                detector,
            },
            attachments,
        )
        .await
    }

    async fn await_answer(&self, task: InFlight, attachments: &[PathBuf]) -> TaskResult {
        let source = TabAnswer::new(self.peer.clone(), task.tab_id, attachments.to_vec());
        let detection = task.detector.run(&source).await;
        let url = self.peer.tab_url(task.tab_id).await.ok().flatten();
        detection_result(task.index, &task.question, task.tab_id, detection, url)
    }

    /// Apply model, reasoning level, mode and attachments. Failures are
    /// logged and the tab is used as it is.
    pub(crate) async fn configure_tab(&self, tab_id: i64, opts: &TaskOptions) {
        if let Some(model) = &opts.model {
            if let Err(e) = self.peer.select_model(model, Some(tab_id)).await {
                warn!(tab_id, model = %model, error = %e, "Model selection failed");
            }
            tokio::time::sleep(self.config.configure_delay()).await;
        }
        if let Some(level) = &opts.thinking {
            if let Err(e) = self.peer.set_thinking(level, Some(tab_id)).await {
                warn!(tab_id, level = %level, error = %e, "Thinking level not applied");
            }
            tokio::time::sleep(self.config.configure_delay()).await;
        }
        if let Some(mode) = &opts.mode {
            if let Err(e) = self.peer.set_mode(mode, Some(tab_id)).await {
                warn!(tab_id, mode = %mode, error = %e, "Mode not applied");
            }
            tokio::time::sleep(self.config.configure_delay()).await;
        }
        if !opts.attachments.is_empty() {
            let attached = self.peer.attach_files(&opts.attachments, Some(tab_id)).await;
            let failed = attached.iter().filter(|(_, r)| r.is_err()).count();
            debug!(tab_id, total = attached.len(), failed, "Attachments sent");
            tokio::time::sleep(self.config.attach_settle()).await;
        }
    }

    /// Keep the batch's tabs for follow-up chats, or close them.
    async fn finish_batch(&self, tab_ids: &[i64], topic: &str, close_tabs: bool, registry: &mut SessionRegistry) {
        if tab_ids.is_empty() {
            return;
        }
        if close_tabs {
            for tab_id in tab_ids {
                if let Err(e) = self.peer.close_tab(*tab_id).await {
                    debug!(tab_id, error = %e, "Close failed");
                }
            }
            info!(count = tab_ids.len(), "Closed tabs");
            return;
        }

        let open = self.peer.get_tabs().await.unwrap_or_default();
        let entries = tab_ids
            .iter()
            .map(|id| {
                let url = open.iter().find(|t| t.id == *id).and_then(|t| t.url.clone());
                SessionTab::new(*id, url, Some(topic.to_string()))
            })
            .collect();
        registry.replace_all(entries);
        registry.persist().await;
        info!(count = tab_ids.len(), "Saved session tabs for follow-up chats");
    }

    fn truncate<'q>(&self, questions: &'q [String]) -> &'q [String] {
        if questions.len() > self.config.max_parallel {
            warn!(
                given = questions.len(),
                max = self.config.max_parallel,
                "Too many questions, extra ones are dropped"
            );
            &questions[..self.config.max_parallel]
        } else {
            questions
        }
    }
}

pub(crate) fn topic_for(questions: &[String]) -> String {
    questions
        .first()
        .map(|q| sanitize_topic(q, TOPIC_MAX_LEN))
        .unwrap_or_else(|| "untitled".to_string())
}

/// Failed result for `err`, keeping its classification unless it is a
/// generic peer or transport failure, which becomes `fallback`.
pub(crate) fn failure(index: usize, question: &str, err: &Error, fallback: FailureKind) -> TaskResult {
    let kind = match err.failure_kind() {
        FailureKind::PeerNotConnected => FailureKind::PeerNotConnected,
        FailureKind::Timeout => FailureKind::Timeout,
        _ => fallback,
    };
    TaskResult::failed(index, question, kind, err.to_string())
}

pub(crate) fn skipped(index: usize, question: &str, cause: &TaskResult) -> TaskResult {
    let kind = cause.error.unwrap_or(FailureKind::SendFailed);
    TaskResult::failed(
        index,
        question,
        kind,
        format!("not sent: message {} in this session failed", cause.index + 1),
    )
    .with_tab(cause.tab_id)
    .with_url(cause.url.clone())
}

pub(crate) fn detection_result(
    index: usize,
    question: &str,
    tab_id: i64,
    detection: Detection,
    url: Option<String>,
) -> TaskResult {
    let result = match detection.phase {
        Phase::Done => TaskResult::succeeded(index, question, detection.text, Some(tab_id), detection.elapsed),
        Phase::TimedOut => TaskResult::failed(
            index,
            question,
            FailureKind::Timeout,
            format!("no complete answer after {:.0}s", detection.elapsed.as_secs_f64()),
        )
        .with_tab(Some(tab_id))
        .with_response(detection.text)
        .with_elapsed(detection.elapsed),
        Phase::Lost => TaskResult::failed(index, question, FailureKind::PeerNotConnected, ERR_PEER_NOT_CONNECTED)
            .with_tab(Some(tab_id))
            .with_response(detection.text)
            .with_elapsed(detection.elapsed),
        other => TaskResult::failed(
            index,
            question,
            FailureKind::PeerError,
            format!("detector stopped in {:?}", other),
        )
        .with_tab(Some(tab_id)),
    };
    result.with_url(url)
}

fn log_summary(results: &[TaskResult]) {
    for r in results {
        info!(
            index = r.index + 1,
            status = r.status(),
            elapsed_secs = r.elapsed_secs,
            tab_id = ?r.tab_id,
            "Result"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{long_answer, FakeBrowser};
    use std::time::Duration;
    use tabrelay_core::Product;
    use tempfile::TempDir;
    use tokio::time::Instant;

    fn supervisor(browser: &std::sync::Arc<FakeBrowser>, timeout_secs: u64) -> Supervisor {
        let mut config = Config::default();
        config.detector.timeout_secs = timeout_secs;
        Supervisor::from_config(browser.peer(Product::ChatGpt), &config)
    }

    fn questions(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("Question number {}", i)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_stuck_tab_does_not_block_siblings() {
        let browser = FakeBrowser::new();
        // Third tab to open is id 103; its answer never stops generating.
        browser.with(|s| {
            s.stuck.insert(103);
        });
        let sup = supervisor(&browser, 120);
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::empty(dir.path().join("chatgpt.json"));

        let started = Instant::now();
        let results = sup
            .parallel_search(&questions(5), &TaskOptions::default(), &mut registry)
            .await
            .unwrap();

        let statuses: Vec<&str> = results.iter().map(|r| r.status()).collect();
        assert_eq!(statuses, vec!["ok", "ok", "timeout", "ok", "ok"]);
        assert!(started.elapsed() > Duration::from_secs(120));
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.index, i);
            assert_eq!(r.tab_id, Some(101 + i as i64));
        }
        assert_eq!(results[0].response, long_answer("Question number 1"));
        assert!(results[0].elapsed_secs < 120.0);
        assert!(results[2].elapsed_secs > 120.0);
        assert!(!results[2].response.is_empty());
        assert_eq!(results[1].url.as_deref(), Some("https://chatgpt.com/c/conv-102"));
        assert_eq!(results[4].topic.as_deref(), Some("Question_number_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_saves_registry_with_live_urls() {
        let browser = FakeBrowser::new();
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatgpt.json");
        let mut registry = SessionRegistry::empty(path.clone());

        sup.parallel_search(&questions(3), &TaskOptions::default(), &mut registry)
            .await
            .unwrap();

        let reloaded = SessionRegistry::load(path).await.unwrap();
        let ids: Vec<i64> = reloaded.tabs().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![101, 102, 103]);
        assert_eq!(reloaded.url_of(101), Some("https://chatgpt.com/c/conv-101"));
        assert_eq!(reloaded.topic_of(103), Some("Question_number_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_tabs_skips_registry() {
        let browser = FakeBrowser::new();
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatgpt.json");
        let mut registry = SessionRegistry::empty(path.clone());
        let opts = TaskOptions {
            close_tabs: true,
            ..Default::default()
        };

        let results = sup.parallel_search(&questions(3), &opts, &mut registry).await.unwrap();
        assert!(results.iter().all(|r| r.success));
        assert!(!browser.is_open(101));
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tab_open_and_send_are_classified() {
        let browser = FakeBrowser::new();
        browser.with(|s| {
            s.fail_open.insert(1);
            // Tab 103 holds the fourth question and rejects input.
            s.refuse_send.insert(103);
        });
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::empty(dir.path().join("chatgpt.json"));

        let results = sup
            .parallel_search(&questions(4), &TaskOptions::default(), &mut registry)
            .await
            .unwrap();
        let statuses: Vec<&str> = results.iter().map(|r| r.status()).collect();
        assert_eq!(statuses, vec!["ok", "tab_open_failed", "ok", "send_failed"]);
        assert_eq!(results[1].tab_id, None);
        assert_eq!(results[3].tab_id, Some(103));
        // Five attempts per refused send.
        assert_eq!(browser.count("chatgpt_send_message"), 2 + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_and_too_many_questions() {
        let browser = FakeBrowser::new();
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::empty(dir.path().join("chatgpt.json"));

        let err = sup
            .parallel_search(&questions(2), &TaskOptions::default(), &mut registry)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.failure_kind(), FailureKind::Usage);
        assert_eq!(browser.count("new_tab"), 0);

        let results = sup
            .parallel_search(&questions(12), &TaskOptions::default(), &mut registry)
            .await
            .unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(browser.count("new_tab"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_missing_yields_classified_results() {
        let browser = FakeBrowser::new();
        browser.with(|s| s.connected = false);
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::empty(dir.path().join("chatgpt.json"));

        let results = sup
            .parallel_search(&questions(3), &TaskOptions::default(), &mut registry)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status() == "peer_not_connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_session_sequential_answers() {
        let browser = FakeBrowser::new();
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::empty(dir.path().join("chatgpt.json"));

        let results = sup
            .single_session_search(&questions(2), &TaskOptions::default(), None, &mut registry)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success && r.tab_id == Some(101)));
        assert_eq!(results[1].response, long_answer("Question number 2"));
        assert_eq!(registry.tabs().len(), 1);
        assert_eq!(browser.with(|s| s.sent[&101].clone()), questions(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_session_stops_after_send_failure() {
        let browser = FakeBrowser::new();
        browser.open_tab(55, "https://chatgpt.com/c/x", "", 0);
        browser.with(|s| {
            s.refuse_send.insert(55);
        });
        let sup = supervisor(&browser, 600);
        let dir = TempDir::new().unwrap();
        let mut registry = SessionRegistry::empty(dir.path().join("chatgpt.json"));

        let results = sup
            .single_session_search(&questions(3), &TaskOptions::default(), Some(55), &mut registry)
            .await
            .unwrap();
        let statuses: Vec<&str> = results.iter().map(|r| r.status()).collect();
        assert_eq!(statuses, vec!["send_failed", "send_failed", "send_failed"]);
        assert_eq!(browser.count("chatgpt_send_message"), 5);
        assert!(results[2].error_message.as_deref().unwrap().starts_with("not sent"));
    }
}
