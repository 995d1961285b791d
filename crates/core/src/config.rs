use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;
use crate::protocol::Product;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Loopback address the relay binds to.
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    /// How long a forwarded command may wait for the extension's reply.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// How long a fresh connection has to send its first frame.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    9224
}

fn default_command_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    5
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            command_timeout_secs: default_command_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether `host` names a loopback interface.
    pub fn is_loopback(&self) -> bool {
        let host = self.host.trim().trim_start_matches('[').trim_end_matches(']');
        host.eq_ignore_ascii_case("localhost")
            || host
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Start the relay in the background when it is not reachable.
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,
    #[serde(default = "default_startup_interval_ms")]
    pub startup_interval_ms: u64,
    /// Pause between a fresh relay start and the first connect attempt.
    #[serde(default = "default_connect_settle_ms")]
    pub connect_settle_ms: u64,
    /// Executable used to start the relay. Defaults to the current binary.
    #[serde(default)]
    pub relay_program: Option<String>,
}

fn default_auto_start() -> bool {
    true
}

fn default_startup_retries() -> u32 {
    30
}

fn default_startup_interval_ms() -> u64 {
    100
}

fn default_connect_settle_ms() -> u64 {
    500
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            auto_start: default_auto_start(),
            startup_retries: default_startup_retries(),
            startup_interval_ms: default_startup_interval_ms(),
            connect_settle_ms: default_connect_settle_ms(),
            relay_program: None,
        }
    }
}

impl ClientConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.startup_interval_ms)
    }

    pub fn connect_settle(&self) -> Duration {
        Duration::from_millis(self.connect_settle_ms)
    }
}

/// Completion detection thresholds. These trade latency against
/// declaring a still-streaming answer finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Consecutive unchanged polls required before finalizing.
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: u32,
    /// Stable answers shorter than this are treated as UI fragments.
    #[serde(default = "default_min_response_len")]
    pub min_response_len: usize,
    /// Text at or below this length does not count as content at all.
    #[serde(default = "default_min_content_len")]
    pub min_content_len: usize,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_stable_threshold() -> u32 {
    4
}

fn default_min_response_len() -> usize {
    100
}

fn default_min_content_len() -> usize {
    5
}

fn default_settle_delay() -> u64 {
    3
}

fn default_task_timeout() -> u64 {
    1800
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            stable_threshold: default_stable_threshold(),
            min_response_len: default_min_response_len(),
            min_content_len: default_min_content_len(),
            settle_delay_secs: default_settle_delay(),
            timeout_secs: default_task_timeout(),
        }
    }
}

impl DetectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    #[serde(default = "default_min_parallel")]
    pub min_parallel: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_tab_open_delay_ms")]
    pub tab_open_delay_ms: u64,
    #[serde(default = "default_page_load_delay")]
    pub page_load_delay_secs: u64,
    #[serde(default = "default_step_delay_ms")]
    pub configure_delay_ms: u64,
    #[serde(default = "default_step_delay_ms")]
    pub send_delay_ms: u64,
    /// Wait after reopening a closed tab from its stored url.
    #[serde(default = "default_page_load_delay")]
    pub reopen_load_delay_secs: u64,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_send_retry_delay_ms")]
    pub send_retry_delay_ms: u64,
    #[serde(default = "default_input_ready_timeout")]
    pub input_ready_timeout_secs: u64,
    #[serde(default = "default_attach_settle")]
    pub attach_settle_secs: u64,
}

fn default_min_parallel() -> usize {
    3
}

fn default_max_parallel() -> usize {
    10
}

fn default_tab_open_delay_ms() -> u64 {
    1000
}

fn default_page_load_delay() -> u64 {
    3
}

fn default_step_delay_ms() -> u64 {
    500
}

fn default_send_retries() -> u32 {
    5
}

fn default_send_retry_delay_ms() -> u64 {
    1500
}

fn default_input_ready_timeout() -> u64 {
    30
}

fn default_attach_settle() -> u64 {
    3
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            min_parallel: default_min_parallel(),
            max_parallel: default_max_parallel(),
            tab_open_delay_ms: default_tab_open_delay_ms(),
            page_load_delay_secs: default_page_load_delay(),
            configure_delay_ms: default_step_delay_ms(),
            send_delay_ms: default_step_delay_ms(),
            reopen_load_delay_secs: default_page_load_delay(),
            send_retries: default_send_retries(),
            send_retry_delay_ms: default_send_retry_delay_ms(),
            input_ready_timeout_secs: default_input_ready_timeout(),
            attach_settle_secs: default_attach_settle(),
        }
    }
}

impl SupervisorConfig {
    pub fn tab_open_delay(&self) -> Duration {
        Duration::from_millis(self.tab_open_delay_ms)
    }

    pub fn page_load_delay(&self) -> Duration {
        Duration::from_secs(self.page_load_delay_secs)
    }

    pub fn configure_delay(&self) -> Duration {
        Duration::from_millis(self.configure_delay_ms)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn reopen_load_delay(&self) -> Duration {
        Duration::from_secs(self.reopen_load_delay_secs)
    }

    pub fn send_retry_delay(&self) -> Duration {
        Duration::from_millis(self.send_retry_delay_ms)
    }

    pub fn input_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.input_ready_timeout_secs)
    }

    pub fn attach_settle(&self) -> Duration {
        Duration::from_secs(self.attach_settle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Home url overrides keyed by product name ("chatgpt", "grok").
    #[serde(default)]
    pub products: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            client: ClientConfig::default(),
            detector: DetectorConfig::default(),
            supervisor: SupervisorConfig::default(),
            products: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Home url for a product, honoring a non-empty override.
    pub fn home_url(&self, product: Product) -> String {
        match self.products.get(product.name()) {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => product.home_url().to_string(),
        }
    }
}
