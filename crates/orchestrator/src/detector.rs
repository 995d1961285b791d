//! Decides when a streaming answer is finished by watching it stop changing.
//!
//! The extension cannot push a "done" event, so the detector polls the tab
//! and requires the text to hold still, with the product reporting it is not
//! generating, for `stable_threshold` consecutive polls. A stable answer
//! shorter than `min_response_len` is assumed to be a UI fragment and keeps
//! the detector polling. Once stable, one more read after `settle_delay`
//! catches trailing re-renders.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tabrelay_client::PeerClient;
use tabrelay_core::config::DetectorConfig;
use tabrelay_core::{Error, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::citations::clean_citations;

/// Consecutive "extension not connected" polls before a task is given up.
const LOST_AFTER_DISCONNECTED_POLLS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sending,
    AwaitingFirstContent,
    Generating,
    CandidateStable,
    Finalizing,
    Done,
    TimedOut,
    /// The extension went away and did not come back.
    Lost,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::TimedOut | Phase::Lost)
    }
}

/// One sample of the tab.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub text: String,
    pub generating: bool,
    pub response_count: Option<u64>,
}

/// Where a detector reads its samples from.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    async fn observe(&self) -> Result<Observation>;

    /// Read only the answer text, used for the settle re-check.
    async fn reread(&self) -> Result<String>;
}

/// The answer in one tab, read through the extension.
pub struct TabAnswer {
    peer: PeerClient,
    tab_id: i64,
    attachments: Vec<PathBuf>,
}

impl TabAnswer {
    pub fn new(peer: PeerClient, tab_id: i64, attachments: Vec<PathBuf>) -> Self {
        Self {
            peer,
            tab_id,
            attachments,
        }
    }
}

#[async_trait]
impl AnswerSource for TabAnswer {
    async fn observe(&self) -> Result<Observation> {
        let generating = self.peer.is_generating(Some(self.tab_id)).await?;
        let snapshot = self.peer.get_response(Some(self.tab_id)).await?;
        Ok(Observation {
            text: clean_citations(&snapshot.text, &self.attachments),
            generating,
            response_count: snapshot.response_count,
        })
    }

    async fn reread(&self) -> Result<String> {
        let snapshot = self.peer.get_response(Some(self.tab_id)).await?;
        Ok(clean_citations(&snapshot.text, &self.attachments))
    }
}

/// Terminal outcome of a detector run.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// `Done`, `TimedOut` or `Lost`.
    pub phase: Phase,
    /// The finished answer, or the last observed text for partial results.
    pub text: String,
    pub elapsed: Duration,
    pub polls: u32,
}

pub struct CompletionDetector {
    config: DetectorConfig,
    baseline: Option<u64>,
    phase: Phase,
    last_text: String,
    stable_count: u32,
    started: Instant,
}

impl CompletionDetector {
    /// A detector for a message that is about to be sent. The task timeout
    /// counts from here.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            baseline: None,
            phase: Phase::Sending,
            last_text: String::new(),
            stable_count: 0,
            started: Instant::now(),
        }
    }

    /// Only count content once the tab reports more answers than `count`.
    /// Used when earlier answers are already on the page.
    pub fn with_baseline(mut self, count: Option<u64>) -> Self {
        self.baseline = count;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_text(&self) -> &str {
        &self.last_text
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn mark_sent(&mut self) {
        if self.phase == Phase::Sending {
            self.phase = Phase::AwaitingFirstContent;
        }
    }

    /// Feed one poll result. Returns the phase after it.
    ///
    /// Samples with too little text, or taken before the tab shows a new
    /// answer, leave the state untouched.
    pub fn observe(&mut self, obs: Observation) -> Phase {
        if self.phase.is_terminal() || self.phase == Phase::Finalizing {
            return self.phase;
        }
        self.mark_sent();

        if !self.counts(&obs) {
            return self.phase;
        }

        if obs.generating {
            self.stable_count = 0;
            self.last_text = obs.text;
            self.phase = Phase::Generating;
            return self.phase;
        }

        if obs.text != self.last_text {
            self.stable_count = 0;
            self.last_text = obs.text;
            self.phase = Phase::Generating;
            return self.phase;
        }

        self.stable_count += 1;
        self.phase = Phase::CandidateStable;
        if self.stable_count >= self.config.stable_threshold {
            if self.last_text.chars().count() < self.config.min_response_len {
                debug!(
                    len = self.last_text.chars().count(),
                    "Stable text too short, still waiting"
                );
                self.stable_count = 0;
                self.phase = Phase::Generating;
            } else {
                self.phase = Phase::Finalizing;
            }
        }
        self.phase
    }

    /// Apply the settle re-check taken after `Finalizing`.
    ///
    /// A changed, non-empty read becomes the new baseline and counting
    /// restarts. Otherwise the longer of the two texts is the answer.
    pub fn settle(&mut self, reread: String) -> Phase {
        if self.phase != Phase::Finalizing {
            return self.phase;
        }
        if !reread.is_empty() && reread != self.last_text {
            debug!("Answer changed during settle, restarting stabilization");
            self.last_text = reread;
            self.stable_count = 0;
            self.phase = Phase::Generating;
        } else {
            if reread.chars().count() >= self.last_text.chars().count() {
                self.last_text = reread;
            }
            self.phase = Phase::Done;
        }
        self.phase
    }

    fn counts(&self, obs: &Observation) -> bool {
        if obs.text.chars().count() <= self.config.min_content_len {
            return false;
        }
        match (self.baseline, obs.response_count) {
            (None, _) => true,
            (Some(base), Some(count)) => count > base,
            (Some(_), None) => false,
        }
    }

    fn finish(self, polls: u32) -> Detection {
        Detection {
            phase: self.phase,
            elapsed: self.started.elapsed(),
            text: self.last_text,
            polls,
        }
    }

    /// Poll `source` until the answer is done, the extension is lost, or
    /// the task timeout runs out. Poll errors count as empty samples.
    pub async fn run<S: AnswerSource + ?Sized>(mut self, source: &S) -> Detection {
        self.mark_sent();
        let timeout = self.config.timeout();
        let mut polls = 0u32;
        let mut disconnected = 0u32;

        loop {
            if self.started.elapsed() > timeout {
                warn!(
                    elapsed_secs = self.started.elapsed().as_secs_f64(),
                    partial_len = self.last_text.len(),
                    "Answer did not complete in time"
                );
                self.phase = Phase::TimedOut;
                return self.finish(polls);
            }

            polls += 1;
            let obs = match source.observe().await {
                Ok(obs) => {
                    disconnected = 0;
                    obs
                }
                Err(Error::PeerNotConnected) => {
                    disconnected += 1;
                    if disconnected >= LOST_AFTER_DISCONNECTED_POLLS {
                        warn!(polls, "Extension gone, abandoning answer");
                        self.phase = Phase::Lost;
                        return self.finish(polls);
                    }
                    Observation::default()
                }
                Err(e) => {
                    debug!(error = %e, "Poll failed");
                    Observation::default()
                }
            };

            if self.observe(obs) == Phase::Finalizing {
                debug!("Answer stable, settling");
                tokio::time::sleep(self.config.settle_delay()).await;
                let reread = match source.reread().await {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(error = %e, "Settle re-read failed");
                        String::new()
                    }
                };
                if self.settle(reread) == Phase::Done {
                    info!(
                        elapsed_secs = self.started.elapsed().as_secs_f64(),
                        len = self.last_text.len(),
                        polls,
                        "Answer complete"
                    );
                    return self.finish(polls);
                }
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn config() -> DetectorConfig {
        DetectorConfig {
            poll_interval_secs: 5,
            stable_threshold: 4,
            min_response_len: 100,
            min_content_len: 5,
            settle_delay_secs: 3,
            timeout_secs: 1800,
        }
    }

    fn idle(text: &str) -> Observation {
        Observation {
            text: text.to_string(),
            generating: false,
            response_count: None,
        }
    }

    /// Plays back samples in order, repeating the last one forever.
    struct Script {
        samples: Mutex<VecDeque<Observation>>,
        rereads: Mutex<VecDeque<String>>,
    }

    impl Script {
        fn new(samples: Vec<Observation>, rereads: Vec<&str>) -> Self {
            Self {
                samples: Mutex::new(samples.into()),
                rereads: Mutex::new(rereads.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl AnswerSource for Script {
        async fn observe(&self) -> Result<Observation> {
            let mut samples = self.samples.lock().unwrap();
            if samples.len() > 1 {
                Ok(samples.pop_front().unwrap())
            } else {
                Ok(samples.front().cloned().unwrap_or_default())
            }
        }

        async fn reread(&self) -> Result<String> {
            let mut rereads = self.rereads.lock().unwrap();
            Ok(rereads.pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn test_five_identical_samples_finalize_on_the_fifth() {
        let a = "a".repeat(120);
        let mut detector = CompletionDetector::new(config());
        detector.mark_sent();
        assert_eq!(detector.phase(), Phase::AwaitingFirstContent);

        assert_eq!(detector.observe(idle(&a)), Phase::Generating);
        for expected in 1..=3 {
            assert_eq!(detector.observe(idle(&a)), Phase::CandidateStable);
            assert_eq!(detector.stable_count(), expected);
        }
        assert_eq!(detector.observe(idle(&a)), Phase::Finalizing);
        assert_eq!(detector.settle(a.clone()), Phase::Done);
        assert_eq!(detector.last_text(), a);
    }

    #[test]
    fn test_late_change_after_stabilizing_restarts_count() {
        let a = "a".repeat(120);
        let b = "b".repeat(130);
        let mut detector = CompletionDetector::new(config());
        for _ in 0..4 {
            detector.observe(idle(&a));
        }
        assert_eq!(detector.stable_count(), 3);

        assert_eq!(detector.observe(idle(&b)), Phase::Generating);
        assert_eq!(detector.stable_count(), 0);
        assert_eq!(detector.last_text(), b);
    }

    #[test]
    fn test_settle_change_discards_stabilization() {
        let a = "a".repeat(120);
        let b = format!("{}b", a);
        let mut detector = CompletionDetector::new(config());
        for _ in 0..5 {
            detector.observe(idle(&a));
        }
        assert_eq!(detector.phase(), Phase::Finalizing);

        assert_eq!(detector.settle(b.clone()), Phase::Generating);
        assert_eq!(detector.stable_count(), 0);
        assert_eq!(detector.last_text(), b);
    }

    #[test]
    fn test_empty_settle_read_keeps_stable_text() {
        let a = "a".repeat(120);
        let mut detector = CompletionDetector::new(config());
        for _ in 0..5 {
            detector.observe(idle(&a));
        }
        assert_eq!(detector.settle(String::new()), Phase::Done);
        assert_eq!(detector.last_text(), a);
    }

    #[test]
    fn test_generating_resets_counter() {
        let a = "a".repeat(120);
        let mut detector = CompletionDetector::new(config());
        detector.observe(idle(&a));
        detector.observe(idle(&a));
        assert_eq!(detector.stable_count(), 1);

        let busy = Observation {
            text: a.clone(),
            generating: true,
            response_count: None,
        };
        assert_eq!(detector.observe(busy), Phase::Generating);
        assert_eq!(detector.stable_count(), 0);
    }

    #[test]
    fn test_baseline_hides_previous_answer() {
        let old = "o".repeat(120);
        let mut detector = CompletionDetector::new(config()).with_baseline(Some(2));
        let stale = Observation {
            text: old.clone(),
            generating: false,
            response_count: Some(2),
        };
        for _ in 0..10 {
            assert_eq!(detector.observe(stale.clone()), Phase::AwaitingFirstContent);
        }
        assert_eq!(detector.last_text(), "");

        let fresh = Observation {
            text: "new answer".to_string(),
            generating: true,
            response_count: Some(3),
        };
        assert_eq!(detector.observe(fresh), Phase::Generating);
    }

    #[test]
    fn test_tiny_text_is_not_content() {
        let mut detector = CompletionDetector::new(config());
        assert_eq!(detector.observe(idle("hi")), Phase::AwaitingFirstContent);
        assert_eq!(detector.observe(idle("")), Phase::AwaitingFirstContent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_after_threshold_and_settle() {
        let a = "a".repeat(150);
        let script = Script::new(vec![idle(&a)], vec![&a]);

        let detection = CompletionDetector::new(config()).run(&script).await;
        assert_eq!(detection.phase, Phase::Done);
        assert_eq!(detection.text, a);
        assert_eq!(detection.polls, 5);
        // Four poll gaps between five samples, then the settle delay.
        assert!(detection.elapsed >= Duration::from_secs(4 * 5 + 3));
        assert!(detection.elapsed < Duration::from_secs(4 * 5 + 3 + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_short_answer_times_out() {
        let short = "x".repeat(40);
        let script = Script::new(vec![idle(&short)], vec![]);
        let mut cfg = config();
        cfg.timeout_secs = 120;

        let detection = CompletionDetector::new(cfg).run(&script).await;
        assert_eq!(detection.phase, Phase::TimedOut);
        assert_eq!(detection.text, short);
        assert!(detection.elapsed > Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_restarts_when_settle_sees_change() {
        let a = "a".repeat(120);
        let b = "b".repeat(140);
        let mut samples: Vec<Observation> = (0..5).map(|_| idle(&a)).collect();
        samples.push(idle(&b));
        let script = Script::new(samples, vec![&b, &b]);

        let detection = CompletionDetector::new(config()).run(&script).await;
        assert_eq!(detection.phase, Phase::Done);
        assert_eq!(detection.text, b);
        // Five samples of A, the settle read swaps in B, then four matching samples of B.
        assert_eq!(detection.polls, 9);
    }

    struct Gone;

    #[async_trait]
    impl AnswerSource for Gone {
        async fn observe(&self) -> Result<Observation> {
            Err(Error::PeerNotConnected)
        }

        async fn reread(&self) -> Result<String> {
            Err(Error::PeerNotConnected)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_when_extension_gone() {
        let detection = CompletionDetector::new(config()).run(&Gone).await;
        assert_eq!(detection.phase, Phase::Lost);
        assert_eq!(detection.polls, LOST_AFTER_DISCONNECTED_POLLS);
    }
}
