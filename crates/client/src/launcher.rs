//! Start-if-not-running bootstrap for the relay process.
//!
//! The relay is an independent background process: once started it outlives
//! the invocation that launched it, and later invocations find it with a
//! plain connect-and-close liveness check.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tabrelay_core::{Config, Error, Result};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RelayLauncher {
    addr: String,
    program: PathBuf,
    args: Vec<String>,
    startup_retries: u32,
    startup_interval: Duration,
    connect_settle: Duration,
}

impl RelayLauncher {
    /// Launcher that runs `<program> relay --port <port>`, where `program` is
    /// `client.relayProgram` or the running executable.
    pub fn from_config(config: &Config) -> Result<Self> {
        let program = match &config.client.relay_program {
            Some(p) if !p.trim().is_empty() => PathBuf::from(p.trim()),
            _ => std::env::current_exe()?,
        };
        Ok(Self {
            addr: config.relay.bind_addr(),
            program,
            args: vec![
                "relay".to_string(),
                "--port".to_string(),
                config.relay.port.to_string(),
            ],
            startup_retries: config.client.startup_retries,
            startup_interval: config.client.startup_interval(),
            connect_settle: config.client.connect_settle(),
        })
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Liveness check: can a TCP connection to the relay port be opened?
    pub async fn is_running(&self) -> bool {
        matches!(
            tokio::time::timeout(LIVENESS_TIMEOUT, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }

    /// Start the relay unless it already answers. Returns whether a new
    /// process was started.
    pub async fn ensure_running(&self) -> Result<bool> {
        if self.is_running().await {
            return Ok(false);
        }

        info!(program = %self.program.display(), addr = %self.addr, "Relay not running, starting it");
        self.spawn()?;
        self.wait_ready().await?;
        tokio::time::sleep(self.connect_settle).await;
        Ok(true)
    }

    fn spawn(&self) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| {
            Error::RelayStart(format!("failed to launch {}: {}", self.program.display(), e))
        })?;
        debug!(pid = ?child.id(), "Relay process spawned");
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        for attempt in 1..=self.startup_retries {
            if self.is_running().await {
                debug!(attempt, "Relay is accepting connections");
                return Ok(());
            }
            tokio::time::sleep(self.startup_interval).await;
        }
        warn!(addr = %self.addr, retries = self.startup_retries, "Relay did not become ready");
        Err(Error::RelayStart(format!(
            "relay at {} not ready after {} attempts",
            self.addr, self.startup_retries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn launcher_for(port: u16) -> RelayLauncher {
        let mut config = Config::default();
        config.relay.port = port;
        config.client.startup_retries = 3;
        config.client.startup_interval_ms = 10;
        config.client.connect_settle_ms = 0;
        RelayLauncher::from_config(&config).unwrap()
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_liveness_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let launcher = launcher_for(port).await;

        assert!(launcher.is_running().await);
        assert!(!launcher.ensure_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_program_is_relay_start_error() {
        let port = free_port().await;
        let launcher = launcher_for(port)
            .await
            .with_program("/nonexistent/tabrelay-relay", vec![]);

        assert!(!launcher.is_running().await);
        let err = launcher.ensure_running().await.unwrap_err();
        assert!(matches!(err, Error::RelayStart(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_program_that_never_listens_gives_up() {
        let port = free_port().await;
        let launcher = launcher_for(port).await.with_program("true", vec![]);

        let err = launcher.ensure_running().await.unwrap_err();
        assert!(err.to_string().contains("not ready after 3 attempts"));
    }
}
