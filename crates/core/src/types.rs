use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a unit of work did not produce a finished answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No extension link was registered at the relay.
    PeerNotConnected,
    /// A command or the whole task exceeded its time budget.
    Timeout,
    /// No open tab and no stored url to reattach to.
    NoSession,
    /// The prompt could not be delivered to the tab.
    SendFailed,
    /// The browser refused to open a tab for this unit of work.
    TabOpenFailed,
    /// The relay connection itself failed.
    Transport,
    /// The tab was reachable but held no answer text.
    EmptyResponse,
    /// The extension reported an error for a command.
    PeerError,
    /// Rejected before any work was dispatched.
    Usage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PeerNotConnected => "peer_not_connected",
            FailureKind::Timeout => "timeout",
            FailureKind::NoSession => "no_session",
            FailureKind::SendFailed => "send_failed",
            FailureKind::TabOpenFailed => "tab_open_failed",
            FailureKind::Transport => "transport",
            FailureKind::EmptyResponse => "empty_response",
            FailureKind::PeerError => "peer_error",
            FailureKind::Usage => "usage",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one unit of work. Built once, never mutated by consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub index: usize,
    pub question: String,
    pub success: bool,
    pub response: String,
    pub tab_id: Option<i64>,
    pub elapsed_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl TaskResult {
    pub fn succeeded(index: usize, question: &str, response: String, tab_id: Option<i64>, elapsed: Duration) -> Self {
        Self {
            index,
            question: question.to_string(),
            success: true,
            response,
            tab_id,
            elapsed_secs: elapsed.as_secs_f64(),
            error: None,
            error_message: None,
            url: None,
            topic: None,
            warning: None,
        }
    }

    pub fn failed(index: usize, question: &str, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            index,
            question: question.to_string(),
            success: false,
            response: String::new(),
            tab_id: None,
            elapsed_secs: 0.0,
            error: Some(kind),
            error_message: Some(message.into()),
            url: None,
            topic: None,
            warning: None,
        }
    }

    pub fn with_tab(mut self, tab_id: Option<i64>) -> Self {
        self.tab_id = tab_id;
        self
    }

    pub fn with_response(mut self, response: String) -> Self {
        self.response = response;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed_secs = elapsed.as_secs_f64();
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_topic(mut self, topic: Option<String>) -> Self {
        self.topic = topic;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// Classification string, `"ok"` for successes.
    pub fn status(&self) -> &'static str {
        match self.error {
            Some(kind) if !self.success => kind.as_str(),
            _ => "ok",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_result_serializes_classification() {
        let result = TaskResult::failed(2, "q", FailureKind::PeerNotConnected, "Extension not connected")
            .with_tab(Some(7));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "peer_not_connected");
        assert_eq!(json["tabId"], 7);
        assert_eq!(json["success"], false);
        assert_eq!(result.status(), "peer_not_connected");
    }

    #[test]
    fn test_success_status_is_ok() {
        let result = TaskResult::succeeded(0, "q", "answer".into(), Some(1), Duration::from_secs(3));
        assert_eq!(result.status(), "ok");
        assert_eq!(result.elapsed_secs, 3.0);
        assert!(serde_json::to_value(&result).unwrap().get("error").is_none());
    }
}
